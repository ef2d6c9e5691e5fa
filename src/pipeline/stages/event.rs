use super::RunMode;
use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::{Clipboard, ParallelProcessing, SerialProcessing, StageContext};
use crate::value::{PropertySet, Value};

pub const CLASS: &str = "Event";

/// Publishes clipboard entries as events
///
/// # Policy
/// - `keysToPublish` (list of strings) - `topic=clipboardKey`, or `key` to publish
///   `key` on a topic of the same name
/// - `RunMode` - `preprocess` (default), `process` or `postprocess`
///
/// A property-set value is published as is; any other value is wrapped into a set
/// under its clipboard key.
struct EventPublisher {
    ctx: StageContext,
    mode: RunMode,
    keys: Vec<(String, String)>,
}

impl EventPublisher {
    fn from_context(ctx: &StageContext) -> HarnessResult<Self> {
        let mode = RunMode::from_policy(&ctx.policy, RunMode::Preprocess)?;
        let entries = ctx.policy.get_strings("keysToPublish");

        if !ctx.policy.contains("keysToPublish") {
            tracing::warn!("Did not find keysToPublish in policy of stage '{}'", ctx.name);
        } else if entries.is_empty() {
            tracing::warn!("Empty keysToPublish in policy of stage '{}'", ctx.name);
        }

        let keys = entries
            .into_iter()
            .map(|entry| match entry.split_once('=') {
                Some((topic, key)) if !topic.is_empty() => (topic.to_string(), key.to_string()),
                _ => (entry.clone(), entry.clone()),
            })
            .collect();

        Ok(Self {
            ctx: ctx.clone(),
            mode,
            keys,
        })
    }

    fn publish_all(&self, clipboard: &Clipboard) -> HarnessResult<()> {
        for (topic, key) in &self.keys {
            let value = clipboard.get(key).ok_or_else(|| {
                HarnessError::MissingData(format!("No '{}' on clipboard to publish", key))
            })?;
            let payload = match value {
                Value::Set(set) => set.clone(),
                other => PropertySet::new().with(key.as_str(), other.clone()),
            };

            self.ctx.publish(topic, payload)?;
            tracing::debug!(
                "Stage '{}' published '{}' on topic '{}' (run: {})",
                self.ctx.name,
                key,
                topic,
                self.ctx.run_id
            );
        }
        Ok(())
    }
}

/// Serial half: publishes in preprocess or postprocess
pub struct EventSerial {
    publisher: EventPublisher,
}

impl EventSerial {
    pub fn from_context(ctx: &StageContext) -> HarnessResult<Self> {
        Ok(Self {
            publisher: EventPublisher::from_context(ctx)?,
        })
    }
}

impl SerialProcessing for EventSerial {
    fn preprocess(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        if self.publisher.mode == RunMode::Preprocess {
            self.publisher.publish_all(clipboard)?;
        }
        Ok(())
    }

    fn postprocess(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        if self.publisher.mode == RunMode::Postprocess {
            self.publisher.publish_all(clipboard)?;
        }
        Ok(())
    }
}

/// Parallel half: publishes from every slice in process mode
pub struct EventParallel {
    publisher: EventPublisher,
}

impl EventParallel {
    pub fn from_context(ctx: &StageContext) -> HarnessResult<Self> {
        Ok(Self {
            publisher: EventPublisher::from_context(ctx)?,
        })
    }
}

impl ParallelProcessing for EventParallel {
    fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        if self.publisher.mode == RunMode::Process {
            self.publisher.publish_all(clipboard)?;
        }
        Ok(())
    }
}
