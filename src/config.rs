//! Pipeline policy
//!
//! A run is described by a JSON policy document. The harness only reads it; the
//! contents of each stage's own policy blob are left to the stage.

use crate::error::{HarnessError, HarnessResult};
use crate::events::event_names;
use crate::value::PropertySet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Whether the coordinator runs one visit or keeps looping until shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExecutionMode {
    OneLoop,
    #[default]
    Continuous,
}

impl From<String> for ExecutionMode {
    fn from(mode: String) -> Self {
        // Anything but "oneloop" loops until a shutdown event arrives
        if mode == "oneloop" {
            ExecutionMode::OneLoop
        } else {
            ExecutionMode::Continuous
        }
    }
}

impl From<ExecutionMode> for String {
    fn from(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::OneLoop => "oneloop".to_string(),
            ExecutionMode::Continuous => "continuous".to_string(),
        }
    }
}

/// What a level 1 shutdown does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardKillAction {
    /// Exit the process
    #[default]
    Exit,
    /// Abandon the run at the next check point and return to the caller
    Abandon,
}

/// One entry of the stage sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub serial_class: Option<String>,
    #[serde(default)]
    pub parallel_class: Option<String>,
    #[serde(default)]
    pub stage_policy: PropertySet,
    #[serde(default)]
    pub event_topic: Option<String>,
    #[serde(default)]
    pub share_data: bool,
}

impl StageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serial_class: None,
            parallel_class: None,
            stage_policy: PropertySet::new(),
            event_topic: None,
            share_data: false,
        }
    }

    pub fn serial(mut self, class: impl Into<String>) -> Self {
        self.serial_class = Some(class.into());
        self
    }

    pub fn parallel(mut self, class: impl Into<String>) -> Self {
        self.parallel_class = Some(class.into());
        self
    }

    pub fn policy(mut self, policy: PropertySet) -> Self {
        self.stage_policy = policy;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.event_topic = Some(topic.into());
        self
    }

    pub fn share_data(mut self, share: bool) -> Self {
        self.share_data = share;
        self
    }

    /// The event topic that triggers this stage, if any
    pub fn event_topic(&self) -> Option<&str> {
        match self.event_topic.as_deref() {
            None => None,
            Some(t) if t == event_names::NO_TOPIC => None,
            Some(t) => Some(t),
        }
    }
}

/// The optional stage run when a stage fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureStageConfig {
    pub name: String,
    #[serde(default)]
    pub serial_class: Option<String>,
    #[serde(default)]
    pub parallel_class: Option<String>,
    #[serde(default)]
    pub stage_policy: PropertySet,
}

/// Complete pipeline policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub n_slices: usize,
    #[serde(default = "default_broker_host")]
    pub event_broker_host: String,
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    #[serde(default = "default_shutdown_topic")]
    pub shutdown_topic: String,
    #[serde(default)]
    pub exit_topic: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub share_data_on: bool,
    #[serde(default)]
    pub barrier_timeout_ms: Option<u64>,
    #[serde(default = "default_shutdown_poll_ms")]
    pub shutdown_poll_ms: u64,
    #[serde(default = "default_report_history")]
    pub report_history: usize,
    #[serde(default)]
    pub hard_kill: HardKillAction,
    #[serde(default)]
    pub app_stages: Vec<StageConfig>,
    #[serde(default)]
    pub failure_stage: Option<FailureStageConfig>,
}

fn default_name() -> String {
    "pipeline".to_string()
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_event_timeout_ms() -> u64 {
    10_000_000
}

fn default_shutdown_topic() -> String {
    event_names::DEFAULT_SHUTDOWN_TOPIC.to_string()
}

fn default_shutdown_poll_ms() -> u64 {
    100
}

fn default_report_history() -> usize {
    32
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(default_name())
    }
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            n_slices: 0,
            event_broker_host: default_broker_host(),
            event_timeout_ms: default_event_timeout_ms(),
            shutdown_topic: default_shutdown_topic(),
            exit_topic: None,
            execution_mode: ExecutionMode::Continuous,
            share_data_on: false,
            barrier_timeout_ms: None,
            shutdown_poll_ms: default_shutdown_poll_ms(),
            report_history: default_report_history(),
            hard_kill: HardKillAction::Exit,
            app_stages: Vec::new(),
            failure_stage: None,
        }
    }

    /// Parse and validate a JSON policy
    pub fn from_json_str(json: &str) -> HarnessResult<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON policy file
    pub fn from_file(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Configuration(format!("Cannot read policy {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::Configuration(
                "Pipeline name must not be empty".to_string(),
            ));
        }
        if self.shutdown_topic.trim().is_empty() {
            return Err(HarnessError::Configuration(
                "Shutdown topic must not be empty".to_string(),
            ));
        }
        if self.report_history == 0 {
            return Err(HarnessError::Configuration(
                "reportHistory must be at least 1".to_string(),
            ));
        }
        let mut topics = HashSet::new();
        for (index, stage) in self.app_stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(HarnessError::Configuration(format!(
                    "Stage {} has an empty name",
                    index + 1
                )));
            }
            if let Some(topic) = &stage.event_topic {
                if topic.trim().is_empty() {
                    return Err(HarnessError::Configuration(format!(
                        "Stage '{}' has a blank event topic",
                        stage.name
                    )));
                }
            }
            if let Some(topic) = stage.event_topic() {
                if topic == self.shutdown_topic || !topics.insert(topic) {
                    return Err(HarnessError::Configuration(format!(
                        "Event topic '{}' of stage '{}' is already in use",
                        topic, stage.name
                    )));
                }
            }
        }
        if let Some(failure) = &self.failure_stage {
            if failure.name.trim().is_empty() {
                return Err(HarnessError::Configuration(
                    "Failure stage has an empty name".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn with_slices(mut self, n_slices: usize) -> Self {
        self.n_slices = n_slices;
        self
    }

    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.app_stages.push(stage);
        self
    }

    pub fn with_failure_stage(mut self, failure: FailureStageConfig) -> Self {
        self.failure_stage = Some(failure);
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Number of execution contexts: the coordinator plus every slice
    pub fn universe_size(&self) -> usize {
        self.n_slices + 1
    }

    pub fn stage_count(&self) -> usize {
        self.app_stages.len()
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms)
    }

    pub fn barrier_timeout(&self) -> Option<Duration> {
        self.barrier_timeout_ms.map(Duration::from_millis)
    }

    /// Whether stage `stage_id` (1-based) runs the data-sharing round
    pub fn shares_data(&self, stage_id: usize) -> bool {
        self.share_data_on
            && self
                .app_stages
                .get(stage_id.wrapping_sub(1))
                .map(|s| s.share_data)
                .unwrap_or(false)
    }
}
