//! Bounded plaintext capture for sampling.

use super::{ChunkSink, Flow};
use crate::error::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes a stream to a file, optionally stopping after `max_records` lines.
///
/// Without a cap every chunk is written verbatim. With a cap, output ends at
/// the newline that completes line `max_records`, the file is closed and the
/// producer is told to stop.
pub struct Capturer {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    max_records: Option<usize>,
    lines: usize,
}

impl Capturer {
    pub fn create(path: impl Into<PathBuf>, max_records: Option<usize>) -> Result<Self> {
        let path = path.into();
        let out = BufWriter::new(File::create(&path)?);
        Ok(Self {
            path,
            out: Some(out),
            max_records,
            lines: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete lines written so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn is_finished(&self) -> bool {
        self.out.is_none()
    }
}

impl ChunkSink for Capturer {
    fn on_chunk(&mut self, chunk: &[u8]) -> Result<Flow> {
        let Some(out) = self.out.as_mut() else {
            return Ok(Flow::Stop);
        };

        let Some(max) = self.max_records else {
            out.write_all(chunk)?;
            self.lines += chunk.iter().filter(|b| **b == b'\n').count();
            return Ok(Flow::Continue);
        };

        let remaining = max.saturating_sub(self.lines);
        if remaining == 0 {
            self.finish()?;
            return Ok(Flow::Stop);
        }

        let cut = chunk
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .map(|(idx, _)| idx)
            .nth(remaining - 1);

        match cut {
            Some(idx) => {
                out.write_all(&chunk[..=idx])?;
                self.lines = max;
                self.finish()?;
                Ok(Flow::Stop)
            }
            None => {
                out.write_all(chunk)?;
                self.lines += chunk.iter().filter(|b| **b == b'\n').count();
                Ok(Flow::Continue)
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        Ok(())
    }
}
