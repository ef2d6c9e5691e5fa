use crate::error::{HarnessError, HarnessResult};
use crate::value::{PropertySet, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    value: Value,
    shared: bool,
}

/// Unit of work carried between stages during a visit
///
/// A clipboard maps string keys to values. Each key is also tagged as shareable or
/// not; only shareable entries take part in the pipeline's data-sharing round.
///
/// # Example
/// ```
/// use stage_harness::pipeline::Clipboard;
///
/// let mut clipboard = Clipboard::new();
/// clipboard.put("width", 3.0);
/// clipboard.put_shared("rank", 0, true);
///
/// assert_eq!(clipboard.get_f64("width").unwrap(), 3.0);
/// assert_eq!(clipboard.shared_keys(), vec!["rank".to_string()]);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clipboard {
    entries: HashMap<String, Entry>,
}

impl Clipboard {
    /// Create an empty clipboard
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a non-shareable value
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.put_shared(key, value, false);
    }

    /// Insert or overwrite a value with an explicit shareable flag
    pub fn put_shared(&mut self, key: impl Into<String>, value: impl Into<Value>, shared: bool) {
        self.entries.insert(
            key.into(),
            Entry {
                value: value.into(),
                shared,
            },
        );
    }

    /// Get a value, `None` when absent
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Get a value or fall back to `default`
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).cloned().unwrap_or(default)
    }

    /// Get a value or fail with `NotFound`
    pub fn get_item(&self, key: &str) -> HarnessResult<&Value> {
        self.get(key)
            .ok_or_else(|| HarnessError::NotFound(format!("clipboard key '{}'", key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Snapshot of all keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of the keys marked shareable, sorted
    pub fn shared_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.shared)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn is_shared(&self, key: &str) -> bool {
        self.entries.get(key).map(|e| e.shared).unwrap_or(false)
    }

    /// Change the shareable flag of an existing key
    pub fn set_shared(&mut self, key: &str, shared: bool) -> HarnessResult<()> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.shared = shared;
                Ok(())
            }
            None => Err(HarnessError::NotFound(format!("clipboard key '{}'", key))),
        }
    }

    /// Shareable entries as `(key, value)` pairs
    pub fn shared_entries(&self) -> Vec<(String, Value)> {
        self.shared_keys()
            .into_iter()
            .filter_map(|k| self.get(&k).cloned().map(|v| (k, v)))
            .collect()
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every held value
    pub fn close(&mut self) {
        self.entries.clear();
    }

    /// Get a string value
    pub fn get_str(&self, key: &str) -> HarnessResult<&str> {
        let value = self.get_item(key)?;
        value.as_str().ok_or_else(|| HarnessError::TypeMismatch {
            key: key.to_string(),
            expected: "string",
        })
    }

    /// Get a numeric value; integers widen to floats
    pub fn get_f64(&self, key: &str) -> HarnessResult<f64> {
        let value = self.get_item(key)?;
        value.as_f64().ok_or_else(|| HarnessError::TypeMismatch {
            key: key.to_string(),
            expected: "number",
        })
    }

    /// Get an integer value
    pub fn get_i64(&self, key: &str) -> HarnessResult<i64> {
        let value = self.get_item(key)?;
        value.as_i64().ok_or_else(|| HarnessError::TypeMismatch {
            key: key.to_string(),
            expected: "integer",
        })
    }

    /// Get a boolean value
    pub fn get_bool(&self, key: &str) -> HarnessResult<bool> {
        let value = self.get_item(key)?;
        value.as_bool().ok_or_else(|| HarnessError::TypeMismatch {
            key: key.to_string(),
            expected: "boolean",
        })
    }

    /// Get a property set value (event payloads land here)
    pub fn get_set(&self, key: &str) -> HarnessResult<&PropertySet> {
        let value = self.get_item(key)?;
        value.as_set().ok_or_else(|| HarnessError::TypeMismatch {
            key: key.to_string(),
            expected: "property set",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clipboard_creation() {
        let clipboard = Clipboard::new();
        assert!(clipboard.is_empty());
        assert!(clipboard.keys().is_empty());
    }

    #[test]
    fn test_put_overwrites_latest_value() {
        let mut clipboard = Clipboard::new();
        clipboard.put("key", 1);
        clipboard.put("key", 2);
        clipboard.put("other", "x");
        clipboard.put("key", 3);

        assert_eq!(clipboard.get("key"), Some(&Value::Int(3)));
        assert_eq!(clipboard.len(), 2);
    }

    #[test]
    fn test_put_resets_shared_flag() {
        let mut clipboard = Clipboard::new();
        clipboard.put_shared("key", 1, true);
        assert!(clipboard.is_shared("key"));

        clipboard.put("key", 2);
        assert!(!clipboard.is_shared("key"));
    }

    #[test]
    fn test_get_absent_returns_default() {
        let clipboard = Clipboard::new();
        assert!(clipboard.get("missing").is_none());
        assert_eq!(clipboard.get_or("missing", Value::Int(7)), Value::Int(7));
    }

    #[test]
    fn test_get_item_absent_is_not_found() {
        let clipboard = Clipboard::new();
        let result = clipboard.get_item("missing");
        assert!(matches!(result, Err(HarnessError::NotFound(_))));
    }

    #[test]
    fn test_shared_keys_subset() {
        let mut clipboard = Clipboard::new();
        clipboard.put("a", 1);
        clipboard.put_shared("b", 2, true);
        clipboard.put_shared("c", 3, true);

        assert_eq!(clipboard.keys(), vec!["a", "b", "c"]);
        assert_eq!(clipboard.shared_keys(), vec!["b", "c"]);
        assert_eq!(clipboard.shared_entries().len(), 2);
    }

    #[test]
    fn test_set_shared_existing_and_missing() {
        let mut clipboard = Clipboard::new();
        clipboard.put("a", 1);

        clipboard.set_shared("a", true).unwrap();
        assert_eq!(clipboard.shared_keys(), vec!["a"]);

        assert!(clipboard.set_shared("missing", true).is_err());
    }

    #[test]
    fn test_typed_accessors() {
        let mut clipboard = Clipboard::new();
        clipboard.put("width", 3.0);
        clipboard.put("count", 4);
        clipboard.put("name", "visit");
        clipboard.put("done", true);

        assert_eq!(clipboard.get_f64("width").unwrap(), 3.0);
        assert_eq!(clipboard.get_f64("count").unwrap(), 4.0);
        assert_eq!(clipboard.get_i64("count").unwrap(), 4);
        assert_eq!(clipboard.get_str("name").unwrap(), "visit");
        assert!(clipboard.get_bool("done").unwrap());
    }

    #[test]
    fn test_wrong_type() {
        let mut clipboard = Clipboard::new();
        clipboard.put("name", "visit");

        let result = clipboard.get_bool("name");
        assert!(matches!(result, Err(HarnessError::TypeMismatch { .. })));
    }

    #[test]
    fn test_close_releases_entries() {
        let mut clipboard = Clipboard::new();
        clipboard.put("a", 1);
        clipboard.put_shared("b", 2, true);

        clipboard.close();

        assert!(clipboard.is_empty());
        assert!(clipboard.shared_keys().is_empty());
    }

    #[test]
    fn test_remove() {
        let mut clipboard = Clipboard::new();
        clipboard.put("a", 1);
        assert_eq!(clipboard.remove("a"), Some(Value::Int(1)));
        assert!(!clipboard.contains("a"));
    }
}
