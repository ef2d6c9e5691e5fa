use crate::error::{HarnessError, HarnessResult};
use crate::events::EventBroker;
use crate::value::PropertySet;
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::clipboard::Clipboard;

/// Serial half of a stage, run once per visit by the coordinator
///
/// Both hooks default to no-ops so a stage that only does parallel work need not
/// implement either.
///
/// # Example
/// ```
/// use stage_harness::error::{HarnessError, HarnessResult};
/// use stage_harness::pipeline::{Clipboard, SerialProcessing};
///
/// struct RequireInput;
///
/// impl SerialProcessing for RequireInput {
///     fn preprocess(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
///         if !clipboard.contains("input") {
///             return Err(HarnessError::MissingData("input".into()));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait SerialProcessing: Send {
    /// Called before the slices run the parallel half
    fn preprocess(&mut self, _clipboard: &mut Clipboard) -> HarnessResult<()> {
        Ok(())
    }

    /// Called after every slice has finished the parallel half
    fn postprocess(&mut self, _clipboard: &mut Clipboard) -> HarnessResult<()> {
        Ok(())
    }

    /// Whether this half does nothing
    fn is_noop(&self) -> bool {
        false
    }
}

/// Parallel half of a stage, run once per visit in every slice
pub trait ParallelProcessing: Send {
    fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()>;

    /// Whether this half does nothing
    fn is_noop(&self) -> bool {
        false
    }
}

/// Serial half for stages without serial work
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSerial;

impl SerialProcessing for NoOpSerial {
    fn is_noop(&self) -> bool {
        true
    }
}

/// Parallel half for stages without parallel work
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpParallel;

impl ParallelProcessing for NoOpParallel {
    fn process(&mut self, _clipboard: &mut Clipboard) -> HarnessResult<()> {
        Ok(())
    }

    fn is_noop(&self) -> bool {
        true
    }
}

/// Position of a stage in the sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    /// Not part of a stage sequence (failure stage, stage tester)
    Detached,
    /// 1-based position in the sequence
    Sequence(usize),
}

impl StageId {
    pub fn as_i64(&self) -> i64 {
        match self {
            StageId::Detached => -1,
            StageId::Sequence(id) => *id as i64,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// Execution context a stage half runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rank {
    /// The coordinator, or any use outside a slice
    Master,
    /// 0-based slice index
    Slice(usize),
}

impl Rank {
    pub fn as_i64(&self) -> i64 {
        match self {
            Rank::Master => -1,
            Rank::Slice(rank) => *rank as i64,
        }
    }

    /// Suffix used when shared entries are copied to other participants
    pub fn label(&self) -> String {
        match self {
            Rank::Master => "master".to_string(),
            Rank::Slice(rank) => rank.to_string(),
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// Everything a stage half learns about where it runs
///
/// Handed to the stage factory at construction time. The broker handle lets stages
/// publish events without reaching for a process-wide singleton.
#[derive(Clone)]
pub struct StageContext {
    pub name: String,
    pub stage_id: StageId,
    pub rank: Rank,
    pub run_id: String,
    pub universe_size: usize,
    pub event_broker_host: String,
    pub policy: PropertySet,
    pub broker: Option<Arc<dyn EventBroker>>,
}

impl StageContext {
    pub const DEFAULT_NAME: &'static str = "processing stage";
    pub const DEFAULT_RUN_ID: &'static str = "user-driven";

    /// Context of a stage used outside any pipeline
    pub fn detached(policy: PropertySet) -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            stage_id: StageId::Detached,
            rank: Rank::Master,
            run_id: Self::DEFAULT_RUN_ID.to_string(),
            universe_size: 1,
            event_broker_host: "localhost".to_string(),
            policy,
            broker: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stage_id(mut self, stage_id: StageId) -> Self {
        self.stage_id = stage_id;
        self
    }

    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_universe_size(mut self, universe_size: usize) -> Self {
        self.universe_size = universe_size;
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn EventBroker>) -> Self {
        self.event_broker_host = broker.host().to_string();
        self.broker = Some(broker);
        self
    }

    /// Publish an event through the context's broker
    pub fn publish(&self, topic: &str, payload: PropertySet) -> HarnessResult<()> {
        match &self.broker {
            Some(broker) => broker.publish(topic, payload),
            None => Err(HarnessError::Event(format!(
                "Stage '{}' has no event broker to publish '{}' on",
                self.name, topic
            ))),
        }
    }
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("name", &self.name)
            .field("stage_id", &self.stage_id)
            .field("rank", &self.rank)
            .field("run_id", &self.run_id)
            .field("universe_size", &self.universe_size)
            .field("event_broker_host", &self.event_broker_host)
            .field("policy", &self.policy)
            .field("has_broker", &self.broker.is_some())
            .finish()
    }
}

/// Run a stage hook, turning a panic into a stage error
pub(crate) fn guarded<F>(hook: F) -> HarnessResult<()>
where
    F: FnOnce() -> HarnessResult<()>,
{
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "non-string panic payload".to_string()
            };
            Err(HarnessError::StagePanicked(message))
        }
    }
}

/// Stage phase in which something happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Preprocess,
    Process,
    Postprocess,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Preprocess => "preprocess",
            Phase::Process => "process",
            Phase::Postprocess => "postprocess",
        };
        f.write_str(name)
    }
}

/// What happened to a stage during one visit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum StageStatus {
    Completed,
    /// The visit was already error-flagged; the clipboard went through unmodified
    PassedThrough,
    Failed { phase: Phase, message: String },
}

/// Result of one stage within one visit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutcome {
    pub stage_id: usize,
    pub stage_name: String,
    pub status: StageStatus,
    pub duration_ms: u64,
}

impl StageOutcome {
    /// Create a completed stage outcome
    pub fn completed(stage_id: usize, stage_name: impl Into<String>, duration: Duration) -> Self {
        Self {
            stage_id,
            stage_name: stage_name.into(),
            status: StageStatus::Completed,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create a pass-through stage outcome
    pub fn passed_through(stage_id: usize, stage_name: impl Into<String>) -> Self {
        Self {
            stage_id,
            stage_name: stage_name.into(),
            status: StageStatus::PassedThrough,
            duration_ms: 0,
        }
    }

    /// Create a failed stage outcome
    pub fn failed(
        stage_id: usize,
        stage_name: impl Into<String>,
        phase: Phase,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            stage_id,
            stage_name: stage_name.into(),
            status: StageStatus::Failed {
                phase,
                message: message.into(),
            },
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, StageStatus::Failed { .. })
    }

    pub fn is_passed_through(&self) -> bool {
        matches!(self.status, StageStatus::PassedThrough)
    }
}

/// Result of one complete visit in one execution context
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitReport {
    /// 1-based visit number
    pub visit: u64,

    /// Whether any stage failed during the visit
    pub error_flagged: bool,

    /// Outcome of each stage, in order
    pub stages: Vec<StageOutcome>,

    /// Keys of the clipboard that drained from the final queue
    pub final_keys: Vec<String>,

    pub duration_ms: u64,
}

impl VisitReport {
    /// Number of stages that ran their own code
    pub fn executed_stages(&self) -> usize {
        self.stages.iter().filter(|s| !s.is_passed_through()).count()
    }

    /// Number of stages bypassed because the visit was flagged
    pub fn passed_through_stages(&self) -> usize {
        self.stages.iter().filter(|s| s.is_passed_through()).count()
    }

    /// The stage that flagged the visit, if any
    pub fn failed_stage(&self) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.is_failed())
    }
}
