//! Execution-context data for I/O style stages
//!
//! Stages that read or write storage need to know which run and which slice they are
//! in so they can parameterize paths. `create_additional_data` assembles that context
//! from the stage context, the stage policy and selected clipboard entries.

use super::clipboard::Clipboard;
use super::core::StageContext;
use crate::error::{HarnessError, HarnessResult};
use crate::value::{PropertySet, Value};

pub const RUN_ID: &str = "runId";
pub const SLICE_ID: &str = "sliceId";
pub const UNIVERSE_SIZE: &str = "universeSize";

/// Policy keys listing clipboard entries to copy, in lookup order
const ADDITIONAL_DATA_KEYS: [&str; 2] = ["additionalData", "parameters.additionalData"];

/// How the per-slice partition id is derived from the rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionScheme {
    pub key: String,
    pub offset: i64,
    pub width: usize,
}

impl Default for PartitionScheme {
    fn default() -> Self {
        Self {
            key: "ccdId".to_string(),
            offset: 1,
            width: 2,
        }
    }
}

impl PartitionScheme {
    /// Read `partitionKey`, `partitionOffset` and `partitionWidth` from a policy
    pub fn from_policy(policy: &PropertySet) -> Self {
        let defaults = Self::default();
        Self {
            key: policy
                .get_str("partitionKey")
                .map(str::to_string)
                .unwrap_or(defaults.key),
            offset: policy.get_i64("partitionOffset").unwrap_or(defaults.offset),
            width: policy
                .get_i64("partitionWidth")
                .and_then(|w| usize::try_from(w).ok())
                .unwrap_or(defaults.width),
        }
    }

    /// Zero-padded partition id for a rank, e.g. rank 0 gives "01"
    pub fn partition_id(&self, rank: i64) -> String {
        format!("{:0width$}", rank + self.offset, width = self.width)
    }
}

/// Build the read-only context property set for a stage invocation
///
/// Each `additionalData` policy entry has the form `rename=clipKey` or
/// `rename=clipKey.propKey` (a bare `clipKey` keeps its own name). A listed entry
/// missing from the clipboard is a `MissingData` error.
pub fn create_additional_data(
    ctx: &StageContext,
    policy: &PropertySet,
    clipboard: &Clipboard,
) -> HarnessResult<PropertySet> {
    let mut data = PropertySet::new();

    let entries = ADDITIONAL_DATA_KEYS
        .iter()
        .map(|key| policy.get_strings(key))
        .find(|entries| !entries.is_empty())
        .unwrap_or_default();

    for entry in entries {
        let (rename, source) = match entry.split_once('=') {
            Some((rename, source)) => (rename.trim(), source.trim()),
            None => (entry.trim(), entry.trim()),
        };
        let value = lookup(clipboard, source)?;
        data.set(rename, value);
    }

    let scheme = PartitionScheme::from_policy(policy);
    data.set(RUN_ID, ctx.run_id.as_str());
    data.set(SLICE_ID, ctx.rank.as_i64());
    data.set(UNIVERSE_SIZE, ctx.universe_size);
    data.set(scheme.key.as_str(), scheme.partition_id(ctx.rank.as_i64()));

    Ok(data)
}

fn lookup(clipboard: &Clipboard, source: &str) -> HarnessResult<Value> {
    let missing = || HarnessError::MissingData(format!("Expected data not found on clipboard: {}", source));

    if let Some(value) = clipboard.get(source) {
        return Ok(value.clone());
    }
    let (clip_key, prop_key) = source.split_once('.').ok_or_else(missing)?;
    clipboard
        .get(clip_key)
        .and_then(Value::as_set)
        .and_then(|set| set.get_path(prop_key))
        .cloned()
        .ok_or_else(missing)
}

/// Substitute `%(key)` placeholders in a path template
pub fn format_template(template: &str, data: &PropertySet) -> HarnessResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find(')').ok_or_else(|| {
            HarnessError::Configuration(format!("Unterminated placeholder in '{}'", template))
        })?;
        let key = &after[..end];
        let value = data.get_path(key).ok_or_else(|| {
            HarnessError::MissingData(format!("No value for '{}' in template '{}'", key, template))
        })?;
        out.push_str(&value.to_string());
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}
