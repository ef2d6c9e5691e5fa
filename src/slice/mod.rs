//! Slices: the workers that run the parallel half of every stage
//!
//! Each slice runs on its own thread with its own queues and its own instances of
//! the parallel stage halves. It mirrors the coordinator's stage loop and meets
//! the coordinator at every barrier point, so its lifecycle is a typestate machine
//! of the same shape:
//! `Unconfigured -> LoggerReady -> Configured -> QueuesReady -> StagesReady ->
//! Looping -> Terminated`.

pub mod states;
pub mod transitions;
pub(crate) mod visit;

pub use states::*;

use crate::barrier::SliceLink;
use crate::config::PipelineConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::events::EventBroker;
use crate::pipeline::{SliceSummary, StageRegistry};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Worker with type-safe lifecycle state
pub struct Slice<S> {
    rank: usize,
    run_id: String,
    config: Arc<PipelineConfig>,
    registry: Arc<StageRegistry>,
    broker: Arc<dyn EventBroker>,
    link: SliceLink,

    /// Current state (type parameter ensures type safety)
    pub state: S,
}

impl<S> Slice<S> {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn advance<T>(self, next: impl FnOnce(S) -> T) -> Slice<T> {
        Slice {
            rank: self.rank,
            run_id: self.run_id,
            config: self.config,
            registry: self.registry,
            broker: self.broker,
            link: self.link,
            state: next(self.state),
        }
    }
}

/// Start a slice on its own thread
///
/// The thread runs the slice from setup to termination and returns its summary;
/// errors end up in the summary rather than in the join result.
pub fn spawn(
    link: SliceLink,
    run_id: String,
    config: Arc<PipelineConfig>,
    registry: Arc<StageRegistry>,
    broker: Arc<dyn EventBroker>,
) -> HarnessResult<JoinHandle<SliceSummary>> {
    let rank = link.rank();
    let slice = Slice::new(link, run_id, config, registry, broker);

    thread::Builder::new()
        .name(format!("slice-{}", rank))
        .spawn(move || run(slice))
        .map_err(|e| HarnessError::Internal(format!("Cannot spawn slice {}: {}", rank, e)))
}

fn run(slice: Slice<Unconfigured>) -> SliceSummary {
    let rank = slice.rank;
    let slice = slice.init_logger();
    let span = slice.state.span.clone();
    let _entered = span.enter();

    let looping = slice
        .configure()
        .map(Slice::init_queues)
        .and_then(Slice::init_stages)
        .and_then(Slice::start_loop);

    match looping {
        Ok(looping) => looping.run().state.summary,
        Err(e) => {
            tracing::error!("Slice {} failed during setup: {}", rank, e);
            SliceSummary {
                rank,
                visits_completed: 0,
                reports: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    }
}
