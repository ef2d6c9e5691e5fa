//! Stages shipped with the harness
//!
//! Each stage reads its settings from the policy blob in its [`StageContext`] and
//! registers under a class name usable in a pipeline policy.

pub mod area;
pub mod event;
pub mod failure;
pub mod symlink;

pub use area::{AreaParallel, AreaSerial};
pub use event::{EventParallel, EventSerial};
pub use failure::{FailureReportParallel, FailureReportSerial};
pub use symlink::{SymLinkParallel, SymLinkSerial};

use super::core::StageContext;
use super::registry::StageRegistry;
use crate::error::{HarnessError, HarnessResult};
use crate::value::PropertySet;

/// Phase in which an I/O style stage acts
///
/// The harness itself never reads this; it is a convention shared by the stages
/// below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Preprocess,
    Process,
    Postprocess,
}

impl RunMode {
    /// Read `RunMode` (or `runMode`, or `parameters.runMode`) from a policy
    pub fn from_policy(policy: &PropertySet, default: RunMode) -> HarnessResult<RunMode> {
        let mode = ["RunMode", "runMode", "parameters.runMode"]
            .iter()
            .find_map(|key| policy.get_str(key));

        match mode {
            None => Ok(default),
            Some(mode) => match mode.to_ascii_lowercase().as_str() {
                "preprocess" => Ok(RunMode::Preprocess),
                "process" => Ok(RunMode::Process),
                "postprocess" => Ok(RunMode::Postprocess),
                other => Err(HarnessError::Configuration(format!(
                    "Unknown RunMode '{}'",
                    other
                ))),
            },
        }
    }
}

/// Register every built-in stage class
pub fn register_builtins(registry: &mut StageRegistry) {
    registry.register_serial(area::CLASS, |_| Ok(Box::new(AreaSerial)));
    registry.register_parallel(area::CLASS, |ctx: &StageContext| {
        Ok(Box::new(AreaParallel::from_context(ctx)))
    });

    registry.register_serial(event::CLASS, |ctx: &StageContext| {
        Ok(Box::new(EventSerial::from_context(ctx)?))
    });
    registry.register_parallel(event::CLASS, |ctx: &StageContext| {
        Ok(Box::new(EventParallel::from_context(ctx)?))
    });

    registry.register_serial(symlink::CLASS, |ctx: &StageContext| {
        Ok(Box::new(SymLinkSerial::from_context(ctx)?))
    });
    registry.register_parallel(symlink::CLASS, |ctx: &StageContext| {
        Ok(Box::new(SymLinkParallel::from_context(ctx)?))
    });

    registry.register_serial(failure::CLASS, |ctx: &StageContext| {
        Ok(Box::new(FailureReportSerial::from_context(ctx)))
    });
    registry.register_parallel(failure::CLASS, |ctx: &StageContext| {
        Ok(Box::new(FailureReportParallel::from_context(ctx)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_default() {
        let mode = RunMode::from_policy(&PropertySet::new(), RunMode::Process).unwrap();
        assert_eq!(mode, RunMode::Process);
    }

    #[test]
    fn test_run_mode_spellings() {
        let policy = PropertySet::new().with("RunMode", "postprocess");
        assert_eq!(
            RunMode::from_policy(&policy, RunMode::Preprocess).unwrap(),
            RunMode::Postprocess
        );

        let policy = PropertySet::new().with("parameters", PropertySet::new().with("runMode", "Process"));
        assert_eq!(
            RunMode::from_policy(&policy, RunMode::Preprocess).unwrap(),
            RunMode::Process
        );
    }

    #[test]
    fn test_run_mode_unknown() {
        let policy = PropertySet::new().with("RunMode", "sometimes");
        assert!(RunMode::from_policy(&policy, RunMode::Process).is_err());
    }
}
