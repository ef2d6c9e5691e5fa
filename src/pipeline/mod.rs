//! Stage building blocks shared by the coordinator and the slices
//!
//! A stage is a pair of halves: a [`SerialProcessing`] half the coordinator runs once
//! per visit and a [`ParallelProcessing`] half every slice runs. Stages hand data to
//! each other on a [`Clipboard`] moving through a [`QueueChain`]. Stage classes are
//! looked up by name in a [`StageRegistry`].
//!
//! # Example
//! ```
//! use stage_harness::error::HarnessResult;
//! use stage_harness::pipeline::{Clipboard, ParallelProcessing, StageRegistry, StageTester};
//! use stage_harness::value::PropertySet;
//!
//! // Define a custom stage
//! struct Shout;
//!
//! impl ParallelProcessing for Shout {
//!     fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
//!         let input = clipboard.get_str("input")?.to_uppercase();
//!         clipboard.put("output", input);
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = StageRegistry::with_builtins();
//! registry.register_parallel("Shout", |_ctx| Ok(Box::new(Shout)));
//!
//! let mut clipboard = Clipboard::new();
//! clipboard.put("input", "hello");
//! let mut tester = StageTester::new(&registry, "Shout", PropertySet::new());
//! let out = tester.run_worker(clipboard, 0).unwrap();
//! assert_eq!(out.get_str("output").unwrap(), "HELLO");
//! ```

pub mod additional_data;
pub mod clipboard;
pub mod core;
pub mod queue;
pub mod registry;
pub mod report;
pub mod stages;
pub mod tester;

// Re-export main types
pub use self::core::{
    NoOpParallel, NoOpSerial, ParallelProcessing, Phase, Rank, SerialProcessing, StageContext,
    StageId, StageOutcome, StageStatus, VisitReport,
};
pub use additional_data::{create_additional_data, format_template, PartitionScheme};
pub use clipboard::Clipboard;
pub use queue::{Queue, QueueChain};
pub use registry::StageRegistry;
pub use report::{ReportLog, RunSummary, SliceSummary, StopReason};
pub use tester::StageTester;
