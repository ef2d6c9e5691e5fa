/// State types of the coordinator lifecycle
///
/// Each state owns exactly what the coordinator has built so far, so an operation
/// that needs, say, running slices cannot be called before they exist.
use super::shutdown::ShutdownMonitor;
use super::visit::{SerialStage, StageLoop};
use crate::barrier::CoordinatorLink;
use crate::pipeline::{QueueChain, ReportLog, RunSummary, SliceSummary, StopReason};
use std::thread::JoinHandle;

/// Created but not yet checked against its policy
#[derive(Debug, Clone, Default)]
pub struct Unconfigured;

/// Policy validated and shutdown topic subscribed
pub struct Configured {
    pub(super) shutdown: ShutdownMonitor,
}

/// Stage queues allocated
pub struct QueuesReady {
    pub(super) shutdown: ShutdownMonitor,
    pub(super) queues: QueueChain,
}

/// Serial halves constructed and stage topics subscribed
pub struct StagesReady {
    pub(super) shutdown: ShutdownMonitor,
    pub(super) queues: QueueChain,
    pub(super) stages: Vec<SerialStage>,
    pub(super) failure: Option<SerialStage>,
}

/// Slice threads running and past the startup barrier
pub struct SlicesStarted {
    pub(super) runtime: Runtime,
}

/// Running visits
pub struct Looping {
    pub(super) runtime: Runtime,
    pub(super) reports: ReportLog,
    pub(super) visits: u64,
}

/// Visit loop left; slices about to be stopped and joined
pub struct ShuttingDown {
    pub(super) runtime: Runtime,
    pub(super) reports: ReportLog,
    pub(super) visits: u64,
    pub(super) stop_reason: StopReason,
}

/// Everything joined and reported
#[derive(Debug, Clone)]
pub struct Terminated {
    pub summary: RunSummary,
}

/// What the coordinator owns while slices run
pub(crate) struct Runtime {
    pub(super) shutdown: ShutdownMonitor,
    pub(super) stage_loop: StageLoop,
    pub(super) link: CoordinatorLink,
    pub(super) slices: Vec<JoinHandle<SliceSummary>>,
}

impl Looping {
    pub fn visits_completed(&self) -> u64 {
        self.visits
    }
}

impl ShuttingDown {
    pub fn stop_reason(&self) -> &StopReason {
        &self.stop_reason
    }
}
