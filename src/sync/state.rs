//! Bookmark state shared by all sync workers
//!
//! Holds the Singer state document: `{"bookmarks": {<table>: {"modified_since": <ts>}}}`.
//! Bookmarks only move forward. Every advance emits a STATE message and, when an
//! output path is set, rewrites that file atomically.

use crate::config::parse_timestamp;
use crate::error::{Result, TapError};
use crate::singer::MessageWriter;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

const BOOKMARKS: &str = "bookmarks";
const MODIFIED_SINCE: &str = "modified_since";

/// Format a bookmark timestamp the way it is persisted.
pub fn format_bookmark(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Read a state file. A missing path means empty state.
pub fn load_state(path: Option<&Path>) -> Result<Value> {
    let Some(path) = path else {
        return Ok(json!({}));
    };
    let raw = fs::read_to_string(path).map_err(|e| {
        TapError::Config(format!("Unable to read state {}: {}", path.display(), e))
    })?;
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    let value: Value = serde_json::from_str(&raw)?;
    if !value.is_object() {
        return Err(TapError::Config("State must be a JSON object".to_string()));
    }
    Ok(value)
}

pub struct StateStore {
    state: Mutex<Value>,
    writer: Arc<MessageWriter>,
    output: Option<PathBuf>,
}

impl StateStore {
    pub fn new(initial: Value, writer: Arc<MessageWriter>) -> Self {
        Self {
            state: Mutex::new(normalize(initial)),
            writer,
            output: None,
        }
    }

    /// Also persist every change to `path`.
    pub fn with_output(mut self, path: PathBuf) -> Self {
        self.output = Some(path);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Value>> {
        self.state
            .lock()
            .map_err(|_| TapError::Task("state lock poisoned".to_string()))
    }

    pub fn snapshot(&self) -> Result<Value> {
        Ok(self.lock()?.clone())
    }

    /// Current bookmark for `table`, if one was recorded.
    pub fn bookmark(&self, table: &str) -> Result<Option<DateTime<Utc>>> {
        let state = self.lock()?;
        match state[BOOKMARKS][table][MODIFIED_SINCE].as_str() {
            Some(raw) => match parse_timestamp(raw) {
                Ok(ts) => Ok(Some(ts)),
                Err(_) => {
                    warn!("Ignoring unreadable bookmark '{}' for table '{}'", raw, table);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Move the bookmark for `table` forward to `ts`. Older values are ignored.
    ///
    /// Returns whether the bookmark changed.
    pub fn advance(&self, table: &str, ts: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock()?;
        let current = state[BOOKMARKS][table][MODIFIED_SINCE]
            .as_str()
            .and_then(|raw| parse_timestamp(raw).ok());
        if current.is_some_and(|current| current >= ts) {
            return Ok(false);
        }

        let bookmarks = object_entry(&mut *state, BOOKMARKS);
        let table_state = object_entry(bookmarks, table);
        if let Value::Object(map) = table_state {
            map.insert(MODIFIED_SINCE.to_string(), json!(format_bookmark(ts)));
        }
        debug!("Bookmark for '{}' advanced to {}", table, ts);

        // emit while holding the lock so STATE messages leave in order
        self.writer.write_state(&state)?;
        if let Some(path) = &self.output {
            save_atomic(path, &state)?;
        }
        Ok(true)
    }

    /// Emit the current state as a STATE message.
    pub fn emit(&self) -> Result<()> {
        let state = self.lock()?;
        self.writer.write_state(&state)
    }
}

/// Accept the bare `{<table>: {...}}` layout as well as the Singer one.
fn normalize(state: Value) -> Value {
    match state {
        Value::Object(map) if map.contains_key(BOOKMARKS) => Value::Object(map),
        Value::Object(map)
            if !map.is_empty() && map.values().all(|v| v.get(MODIFIED_SINCE).is_some()) =>
        {
            let mut wrapped = Map::new();
            wrapped.insert(BOOKMARKS.to_string(), Value::Object(map));
            Value::Object(wrapped)
        }
        Value::Object(map) => Value::Object(map),
        _ => json!({}),
    }
}

fn object_entry<'a>(value: &'a mut Value, key: &str) -> &'a mut Value {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    let entry = &mut value[key];
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    entry
}

fn save_atomic(path: &Path, state: &Value) -> Result<()> {
    let temp_file = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_file)?;
        serde_json::to_writer_pretty(&mut file, state)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&temp_file, path)?;
    Ok(())
}
