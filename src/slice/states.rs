/// State types of the slice lifecycle
use super::visit::{ParallelStage, StageLoop};
use crate::pipeline::{QueueChain, ReportLog, SliceSummary};
use tracing::Span;

/// Created, nothing set up
#[derive(Debug, Clone, Default)]
pub struct Unconfigured;

/// Logging context established
#[derive(Debug, Clone)]
pub struct LoggerReady {
    pub span: Span,
}

/// Policy checked for this rank
#[derive(Debug, Clone)]
pub struct Configured {
    pub span: Span,
}

/// Stage queues allocated
#[derive(Debug)]
pub struct QueuesReady {
    pub span: Span,
    pub(super) queues: QueueChain,
}

/// Parallel halves constructed and slice topics subscribed
pub struct StagesReady {
    pub span: Span,
    pub(super) queues: QueueChain,
    pub(super) stages: Vec<ParallelStage>,
    pub(super) failure: Option<ParallelStage>,
}

/// Past the startup barrier, running visits
pub struct Looping {
    pub span: Span,
    pub(super) stage_loop: StageLoop,
    pub(super) reports: ReportLog,
    pub(super) visits: u64,
}

/// Loop left; summary ready for the coordinator
#[derive(Debug, Clone)]
pub struct Terminated {
    pub summary: SliceSummary,
}
