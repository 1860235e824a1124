//! Bookmark watermark for files of one table completing out of order.

use super::state::StateStore;
use crate::error::{Result, TapError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Tracks which file timestamps are still in flight.
///
/// The watermark is the newest completed timestamp with no pending or failed
/// file at or below it. Files are later selected with a strict `>` against
/// the bookmark, so this never skips a file that has not been synced.
#[derive(Debug, Default, Clone)]
pub struct BookmarkTracker {
    pending: BTreeMap<DateTime<Utc>, usize>,
    completed: BTreeSet<DateTime<Utc>>,
    failed: BTreeSet<DateTime<Utc>>,
    watermark: Option<DateTime<Utc>>,
}

impl BookmarkTracker {
    pub fn new<I>(timestamps: I) -> Self
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        let mut tracker = Self::default();
        for ts in timestamps {
            *tracker.pending.entry(ts).or_insert(0) += 1;
        }
        tracker
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    fn settle(&mut self, ts: DateTime<Utc>) {
        if let Some(count) = self.pending.get_mut(&ts) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(&ts);
            }
        }
    }

    /// Mark one file at `ts` done. Returns the new watermark if it moved.
    pub fn complete(&mut self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.settle(ts);
        self.completed.insert(ts);

        let bound = match (self.pending.keys().next(), self.failed.iter().next()) {
            (Some(p), Some(f)) => Some(*p.min(f)),
            (Some(p), None) => Some(*p),
            (None, Some(f)) => Some(*f),
            (None, None) => None,
        };
        let candidate = match bound {
            Some(bound) => self.completed.range(..bound).next_back().copied(),
            None => self.completed.iter().next_back().copied(),
        }?;

        if self.watermark.map_or(true, |w| candidate > w) {
            self.watermark = Some(candidate);
            Some(candidate)
        } else {
            None
        }
    }

    /// Mark one file at `ts` failed. Nothing at or after `ts` can be bookmarked.
    pub fn fail(&mut self, ts: DateTime<Utc>) {
        self.settle(ts);
        self.failed.insert(ts);
    }
}

/// A table's tracker bound to the shared state store.
///
/// Workers report here as they finish; the lock serializes bookmark writes.
pub struct TableBookmarks {
    table: String,
    tracker: Mutex<BookmarkTracker>,
    state: Arc<StateStore>,
}

impl TableBookmarks {
    pub fn new<I>(table: &str, timestamps: I, state: Arc<StateStore>) -> Self
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        Self {
            table: table.to_string(),
            tracker: Mutex::new(BookmarkTracker::new(timestamps)),
            state,
        }
    }

    pub fn complete(&self, ts: DateTime<Utc>) -> Result<()> {
        let mut tracker = self
            .tracker
            .lock()
            .map_err(|_| TapError::Task("bookmark lock poisoned".to_string()))?;
        if let Some(watermark) = tracker.complete(ts) {
            if self.state.advance(&self.table, watermark)? {
                info!("Bookmark for \"{}\" is now {}", self.table, watermark);
            }
        }
        Ok(())
    }

    pub fn fail(&self, ts: DateTime<Utc>) {
        let mut tracker = match self.tracker.lock() {
            Ok(tracker) => tracker,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracker.fail(ts);
    }
}
