//! Shared run state: a thread-safe key/value map plus an append-only log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;

/// Shared state of a run, threaded along the traversal.
///
/// `Context` is cheap to construct but its [`Clone`] impl is a **deep** copy:
/// every value and every log entry is duplicated into fresh storage, so a
/// cloned context (as handed to a parallel branch) shares nothing with its
/// parent. Use [`Context::snapshot`] when a shallow read of current values is
/// enough — it avoids cloning the log.
pub struct Context {
    values: Arc<DashMap<String, Value>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            values: Arc::new(DashMap::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Builds a context pre-populated with `values` (used at INITIALIZE when
    /// mirroring graph attributes, and on checkpoint resume).
    pub fn from_map(values: HashMap<String, Value>) -> Self {
        let map = DashMap::new();
        for (k, v) in values {
            map.insert(k, v);
        }
        Self {
            values: Arc::new(map),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.clone())
    }

    /// Stringifies the value at `key`, or `default` when absent. A string
    /// value is returned bare (no surrounding quotes); any other JSON value
    /// is rendered via its `Display`/`to_string` form.
    pub fn get_as_string_with_default(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => default.to_string(),
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Appends one line to the ordered log.
    pub fn append_log(&self, line: impl Into<String>) {
        self.log.lock().expect("context log mutex poisoned").push(line.into());
    }

    /// Shallow copy of current key/value state as a plain map.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Copy of the ordered log.
    pub fn logs(&self) -> Vec<String> {
        self.log.lock().expect("context log mutex poisoned").clone()
    }

    /// Writes every key in `updates` unconditionally, overwriting existing values.
    pub fn apply_updates(&self, updates: HashMap<String, Value>) {
        for (k, v) in updates {
            self.values.insert(k, v);
        }
    }

    /// Replaces the entire value map, e.g. when a fidelity transform produces
    /// a reduced map that must become the context's new state.
    pub fn replace_values(&self, values: HashMap<String, Value>) {
        self.values.clear();
        for (k, v) in values {
            self.values.insert(k, v);
        }
    }

    /// Replaces the entire log, e.g. when compact mode keeps only the most
    /// recent K entries.
    pub fn replace_logs(&self, lines: Vec<String>) {
        *self.log.lock().expect("context log mutex poisoned") = lines;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Context {
    /// Deep copy: the returned context shares no storage with `self`.
    fn clone(&self) -> Self {
        let cloned = Self::from_map(self.snapshot());
        cloned.replace_logs(self.logs());
        cloned
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("keys", &self.values.len())
            .field("log_len", &self.log.lock().map(|l| l.len()).unwrap_or(0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: apply_updates writes every provided key unconditionally.
    #[test]
    fn apply_updates_overwrites_existing_keys() {
        let ctx = Context::new();
        ctx.set("a", "1");
        let mut updates = HashMap::new();
        updates.insert("a".to_string(), Value::String("2".into()));
        updates.insert("b".to_string(), Value::String("3".into()));
        ctx.apply_updates(updates);
        assert_eq!(ctx.get("a"), Some(Value::String("2".into())));
        assert_eq!(ctx.get("b"), Some(Value::String("3".into())));
    }

    /// **Scenario**: clone is deep — mutating the clone never affects the original.
    #[test]
    fn clone_is_independent_of_original() {
        let ctx = Context::new();
        ctx.set("shared_key", "A");
        ctx.append_log("first");

        let branch = ctx.clone();
        branch.set("shared_key", "B");
        branch.append_log("second");

        assert_eq!(ctx.get("shared_key"), Some(Value::String("A".into())));
        assert_eq!(branch.get("shared_key"), Some(Value::String("B".into())));
        assert_eq!(ctx.logs(), vec!["first".to_string()]);
        assert_eq!(branch.logs(), vec!["first".to_string(), "second".to_string()]);
    }

    /// **Scenario**: get_as_string_with_default stringifies non-string values and falls
    /// back when the key is absent.
    #[test]
    fn get_as_string_with_default_behavior() {
        let ctx = Context::new();
        assert_eq!(ctx.get_as_string_with_default("missing", "fallback"), "fallback");
        ctx.set("count", serde_json::json!(5));
        assert_eq!(ctx.get_as_string_with_default("count", "fallback"), "5");
        ctx.set("name", "direct");
        assert_eq!(ctx.get_as_string_with_default("name", "fallback"), "direct");
    }

    /// **Scenario**: snapshot reflects current state but is independent of later sets.
    #[test]
    fn snapshot_is_a_point_in_time_copy() {
        let ctx = Context::new();
        ctx.set("k", "v1");
        let snap = ctx.snapshot();
        ctx.set("k", "v2");
        assert_eq!(snap.get("k"), Some(&Value::String("v1".into())));
        assert_eq!(ctx.get("k"), Some(Value::String("v2".into())));
    }
}
