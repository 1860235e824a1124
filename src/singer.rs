//! Singer message output.
//!
//! One JSON object per line on the writer (stdout in production). Records
//! from concurrently syncing files interleave at line granularity.

use crate::error::{Result, TapError};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
enum Message<'a> {
    Schema {
        stream: &'a str,
        schema: &'a Value,
        key_properties: &'a [String],
    },
    Record {
        stream: &'a str,
        record: &'a Value,
        time_extracted: String,
    },
    State {
        value: &'a Value,
    },
}

pub struct MessageWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl MessageWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Writer into a shared in-memory buffer.
    pub fn in_memory() -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        (Self::new(Box::new(captured.clone())), captured)
    }

    fn emit(&self, message: &Message<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut out = self
            .out
            .lock()
            .map_err(|_| TapError::Task("message writer lock poisoned".to_string()))?;
        out.write_all(&line)?;
        out.flush()?;
        Ok(())
    }

    pub fn write_schema(&self, stream: &str, schema: &Value, key_properties: &[String]) -> Result<()> {
        self.emit(&Message::Schema {
            stream,
            schema,
            key_properties,
        })
    }

    pub fn write_record(&self, stream: &str, record: &Value) -> Result<()> {
        self.emit(&Message::Record {
            stream,
            record,
            time_extracted: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        })
    }

    pub fn write_state(&self, state: &Value) -> Result<()> {
        self.emit(&Message::State { value: state })
    }
}

/// Shared byte buffer that a `MessageWriter` can write into.
#[derive(Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    /// Every message written so far, parsed.
    pub fn messages(&self) -> Vec<Value> {
        let bytes = match self.0.lock() {
            Ok(bytes) => bytes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn messages_of_type(&self, kind: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["type"] == kind)
            .collect()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "buffer lock poisoned"))?;
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
