use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::{Clipboard, ParallelProcessing, SerialProcessing, StageContext};
use crate::value::PropertySet;
use std::error::Error;

pub const CLASS: &str = "FailureReport";

/// Clipboard keys describing the stage failure, set before the failure stage runs
pub mod failure_keys {
    pub const FAILED_IN_STAGE: &str = "failedInStage";
    pub const FAILED_IN_STAGE_N: &str = "failedInStageN";
    pub const FAILURE_TYPE: &str = "failureType";
    pub const FAILURE_MESSAGE: &str = "failureMessage";
    pub const FAILURE_TRACEBACK: &str = "failureTraceback";
    pub const FAILURE_REPORTED: &str = "failureReported";
}

/// Record on the clipboard which stage failed and why
pub fn record_failure(
    clipboard: &mut Clipboard,
    stage_name: &str,
    stage_id: usize,
    error: &HarnessError,
) {
    clipboard.put(failure_keys::FAILED_IN_STAGE, stage_name);
    clipboard.put(failure_keys::FAILED_IN_STAGE_N, stage_id);
    clipboard.put(failure_keys::FAILURE_TYPE, error.kind());
    clipboard.put(failure_keys::FAILURE_MESSAGE, error.to_string());
    clipboard.put(failure_keys::FAILURE_TRACEBACK, traceback(error));
}

/// Debug form of the error followed by one `caused by:` line per source
fn traceback(error: &HarnessError) -> String {
    let mut trace = format!("{:?}", error);
    let mut source = error.source();
    while let Some(cause) = source {
        trace.push_str(&format!("\ncaused by: {}", cause));
        source = cause.source();
    }
    trace
}

/// Logs the failure diagnostics and optionally publishes them
///
/// # Context Requirements
/// - Input: `failedInStage` (string)
/// - Input: `failedInStageN`, `failureType`, `failureMessage`, `failureTraceback` (optional)
///
/// # Context Outputs
/// - `failureReported` (bool)
///
/// # Policy
/// - `failureTopic` (string, optional) - topic to publish the diagnostics on
struct FailureReporter {
    ctx: StageContext,
    topic: Option<String>,
}

impl FailureReporter {
    fn from_context(ctx: &StageContext) -> Self {
        Self {
            ctx: ctx.clone(),
            topic: ctx.policy.get_str("failureTopic").map(str::to_string),
        }
    }

    fn report(&self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        if clipboard.contains(failure_keys::FAILURE_REPORTED) {
            return Ok(());
        }

        let stage = clipboard
            .get_str(failure_keys::FAILED_IN_STAGE)
            .map_err(|_| {
                HarnessError::MissingData(format!(
                    "Expected data not found on clipboard: {}",
                    failure_keys::FAILED_IN_STAGE
                ))
            })?
            .to_string();

        let mut diagnostics = PropertySet::new()
            .with(failure_keys::FAILED_IN_STAGE, stage.as_str())
            .with("runId", self.ctx.run_id.as_str())
            .with("rank", self.ctx.rank.as_i64());
        for key in [
            failure_keys::FAILED_IN_STAGE_N,
            failure_keys::FAILURE_TYPE,
            failure_keys::FAILURE_MESSAGE,
            failure_keys::FAILURE_TRACEBACK,
        ] {
            if let Some(value) = clipboard.get(key) {
                diagnostics.set(key, value.clone());
            }
        }

        tracing::error!(
            "Stage '{}' failed (run: {}, rank: {}): {}",
            stage,
            self.ctx.run_id,
            self.ctx.rank,
            diagnostics
        );

        if let Some(topic) = &self.topic {
            self.ctx.publish(topic, diagnostics)?;
        }

        clipboard.put(failure_keys::FAILURE_REPORTED, true);
        Ok(())
    }
}

/// Serial half of the failure report stage
pub struct FailureReportSerial {
    reporter: FailureReporter,
}

impl FailureReportSerial {
    pub fn from_context(ctx: &StageContext) -> Self {
        Self {
            reporter: FailureReporter::from_context(ctx),
        }
    }
}

impl SerialProcessing for FailureReportSerial {
    fn preprocess(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        self.reporter.report(clipboard)
    }

    fn postprocess(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        self.reporter.report(clipboard)
    }
}

/// Parallel half of the failure report stage
pub struct FailureReportParallel {
    reporter: FailureReporter,
}

impl FailureReportParallel {
    pub fn from_context(ctx: &StageContext) -> Self {
        Self {
            reporter: FailureReporter::from_context(ctx),
        }
    }
}

impl ParallelProcessing for FailureReportParallel {
    fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        self.reporter.report(clipboard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBroker, InMemoryBroker};
    use std::sync::Arc;

    fn failed_clipboard() -> Clipboard {
        let mut clipboard = Clipboard::new();
        record_failure(
            &mut clipboard,
            "area",
            2,
            &HarnessError::MissingData("Missing width on clipboard".into()),
        );
        clipboard
    }

    #[test]
    fn test_record_failure_keys() {
        let clipboard = failed_clipboard();
        assert_eq!(clipboard.get_str(failure_keys::FAILED_IN_STAGE).unwrap(), "area");
        assert_eq!(clipboard.get_i64(failure_keys::FAILED_IN_STAGE_N).unwrap(), 2);
        assert_eq!(clipboard.get_str(failure_keys::FAILURE_TYPE).unwrap(), "MissingData");
        assert!(clipboard
            .get_str(failure_keys::FAILURE_MESSAGE)
            .unwrap()
            .contains("Missing width"));
        assert!(clipboard
            .get_str(failure_keys::FAILURE_TRACEBACK)
            .unwrap()
            .starts_with("MissingData("));
    }

    #[test]
    fn test_traceback_follows_sources() {
        let error = HarnessError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "policy.json is gone",
        ));
        let mut clipboard = Clipboard::new();
        record_failure(&mut clipboard, "load", 1, &error);

        let trace = clipboard.get_str(failure_keys::FAILURE_TRACEBACK).unwrap();
        assert!(trace.starts_with("Io("));
        assert!(trace.ends_with("caused by: policy.json is gone"));
    }

    #[test]
    fn test_report_marks_clipboard() {
        let ctx = StageContext::detached(PropertySet::new());
        let mut stage = FailureReportParallel::from_context(&ctx);
        let mut clipboard = failed_clipboard();

        stage.process(&mut clipboard).unwrap();
        assert!(clipboard.get_bool(failure_keys::FAILURE_REPORTED).unwrap());
    }

    #[test]
    fn test_report_requires_diagnostics() {
        let ctx = StageContext::detached(PropertySet::new());
        let mut stage = FailureReportSerial::from_context(&ctx);

        let result = stage.preprocess(&mut Clipboard::new());
        assert!(matches!(result, Err(HarnessError::MissingData(_))));
    }

    #[test]
    fn test_report_publishes_once() {
        let broker = Arc::new(InMemoryBroker::default());
        let receiver = broker.subscribe("failures").unwrap();
        let ctx = StageContext::detached(PropertySet::new().with("failureTopic", "failures"))
            .with_broker(broker.clone())
            .with_run_id("run-3");
        let mut stage = FailureReportSerial::from_context(&ctx);
        let mut clipboard = failed_clipboard();

        stage.preprocess(&mut clipboard).unwrap();
        stage.postprocess(&mut clipboard).unwrap();

        let event = receiver.try_receive().unwrap().unwrap();
        assert_eq!(event.get_str("failedInStage"), Some("area"));
        assert_eq!(event.get_str("runId"), Some("run-3"));
        assert!(event.get_str("failureTraceback").is_some());
        assert!(receiver.try_receive().unwrap().is_none());
    }
}
