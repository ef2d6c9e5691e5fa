//! Multi-stage, multi-worker pipeline harness
//!
//! A [`Pipeline`] coordinator and a set of worker [`slice`]s run the same ordered
//! list of stages over and over. Every stage is split into a serial half, run once
//! by the coordinator, and a parallel half, run by every slice; the two meet at
//! barrier points so that each stage's preprocess finishes before any process
//! starts and every process finishes before the postprocess.
//!
//! Stages exchange data through [`Clipboard`]s handed from stage to stage along a
//! [`QueueChain`], are triggered by events from an [`EventBroker`], and the run is
//! stopped by a shutdown event or, in oneloop mode, after a single visit.

pub mod barrier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod logger;
pub mod pipeline;
pub mod slice;
pub mod value;

pub use config::{ExecutionMode, FailureStageConfig, HardKillAction, PipelineConfig, StageConfig};
pub use coordinator::Pipeline;
pub use error::{HarnessError, HarnessResult};
pub use events::{EventBroker, EventReceiver, InMemoryBroker, ShutdownEvent, ShutdownLevel};
pub use pipeline::{Clipboard, QueueChain, RunSummary, StageRegistry, StopReason};
pub use value::{PropertySet, Value};
