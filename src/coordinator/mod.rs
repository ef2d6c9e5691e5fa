//! The coordinator ("pipeline") and its lifecycle
//!
//! The coordinator runs the serial half of every stage, drives the slices through
//! the stage loop and owns the visit-wide error flag. Its lifecycle is a typestate
//! machine: every setup step consumes the coordinator and returns it in the next
//! state.
//!
//! # States
//!
//! - `Unconfigured` - created from a policy, registry and broker
//! - `Configured` - policy validated, shutdown topic subscribed
//! - `QueuesReady` - stage queues allocated
//! - `StagesReady` - serial halves built, stage topics subscribed
//! - `SlicesStarted` - slice threads running and synchronized
//! - `Looping` - running visits
//! - `ShuttingDown` - slices being stopped
//! - `Terminated` - run summary available
//!
//! # Example
//!
//! ```
//! use stage_harness::config::{ExecutionMode, PipelineConfig, StageConfig};
//! use stage_harness::coordinator::Pipeline;
//! use stage_harness::events::InMemoryBroker;
//! use stage_harness::pipeline::StageRegistry;
//! use std::sync::Arc;
//!
//! # fn main() -> stage_harness::error::HarnessResult<()> {
//! let config = PipelineConfig::new("demo")
//!     .with_slices(2)
//!     .with_execution_mode(ExecutionMode::OneLoop)
//!     .with_stage(StageConfig::new("noop").serial("NoOp").parallel("NoOp"));
//!
//! let pipeline = Pipeline::new(config, StageRegistry::with_builtins(), Arc::new(InMemoryBroker::default()))
//!     .with_run_id("demo-run")
//!     .configure()?
//!     .init_queues()
//!     .init_stages()?
//!     .start_slices()?
//!     .start_loop()
//!     .run()?
//!     .shutdown()?;
//!
//! assert_eq!(pipeline.summary().visits_completed, 1);
//! # Ok(())
//! # }
//! ```

pub mod shutdown;
pub mod states;
pub mod transitions;
pub(crate) mod visit;

pub use shutdown::ShutdownMonitor;
pub use states::*;

use crate::config::PipelineConfig;
use crate::error::HarnessResult;
use crate::events::EventBroker;
use crate::pipeline::{RunSummary, StageRegistry};
use std::sync::Arc;

/// Pipeline coordinator with type-safe lifecycle state
///
/// The generic parameter `S` is the current lifecycle state; only the operations
/// valid in that state can be called.
pub struct Pipeline<S> {
    run_id: String,
    config: Arc<PipelineConfig>,
    registry: Arc<StageRegistry>,
    broker: Arc<dyn EventBroker>,

    /// Current state (type parameter ensures type safety)
    pub state: S,
}

impl<S> Pipeline<S> {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn EventBroker> {
        &self.broker
    }

    /// Carry everything but the state over to the next state
    fn advance<T>(self, next: impl FnOnce(S) -> T) -> Pipeline<T> {
        Pipeline {
            run_id: self.run_id,
            config: self.config,
            registry: self.registry,
            broker: self.broker,
            state: next(self.state),
        }
    }
}

impl Pipeline<Unconfigured> {
    /// Run a policy from setup to termination
    pub fn launch(
        config: PipelineConfig,
        registry: StageRegistry,
        broker: Arc<dyn EventBroker>,
        run_id: Option<String>,
    ) -> HarnessResult<RunSummary> {
        let mut pipeline = Pipeline::new(config, registry, broker);
        if let Some(run_id) = run_id {
            pipeline = pipeline.with_run_id(run_id);
        }

        let terminated = pipeline
            .configure()?
            .init_queues()
            .init_stages()?
            .start_slices()?
            .start_loop()
            .run()?
            .shutdown()?;
        Ok(terminated.into_summary())
    }
}
