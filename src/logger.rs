use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Harness verbosity names, from quietest to noisiest
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Silent,
    Quiet,
    #[default]
    Info,
    Verb1,
    Debug,
    Verb2,
    Verb3,
    Trace,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Silent => "silent",
            Verbosity::Quiet => "quiet",
            Verbosity::Info => "info",
            Verbosity::Verb1 => "verb1",
            Verbosity::Debug => "debug",
            Verbosity::Verb2 => "verb2",
            Verbosity::Verb3 => "verb3",
            Verbosity::Trace => "trace",
        }
    }

    /// The `tracing` level this verbosity lets through
    pub fn level_filter(&self) -> LevelFilter {
        match self {
            Verbosity::Silent => LevelFilter::OFF,
            Verbosity::Quiet => LevelFilter::WARN,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Verb1 | Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Verb2 | Verbosity::Verb3 | Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}

impl FromStr for Verbosity {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Ok(Verbosity::Silent),
            "quiet" => Ok(Verbosity::Quiet),
            "info" => Ok(Verbosity::Info),
            "verb1" => Ok(Verbosity::Verb1),
            "debug" => Ok(Verbosity::Debug),
            "verb2" => Ok(Verbosity::Verb2),
            "verb3" => Ok(Verbosity::Verb3),
            "trace" => Ok(Verbosity::Trace),
            other => Err(HarnessError::Configuration(format!(
                "Unknown verbosity '{}' (expected silent, quiet, info, verb1, debug, verb2, verb3 or trace)",
                other
            ))),
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default filter directive for a verbosity
pub fn filter_directive(verbosity: Verbosity) -> String {
    let level = verbosity.level_filter().to_string().to_ascii_lowercase();
    format!("stage_harness={}", level)
}

/// Install the stderr subscriber for the process
///
/// `RUST_LOG` overrides the verbosity when set. Fails if a global subscriber is
/// already installed.
pub fn init(verbosity: Verbosity) -> HarnessResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| HarnessError::Internal(format!("Cannot install logger: {}", e)))
}
