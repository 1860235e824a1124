//! File format readers.
//!
//! The sync engine never looks inside a file. It hands a `FileHandle` to the
//! reader registered for the table's file type, which builds catalog streams
//! from a sample or emits records for a full file.

use crate::catalog::CatalogStream;
use crate::config::{FileType, TableSpec};
use crate::error::{Result, TapError};
use crate::fetch::FileHandle;
use crate::singer::MessageWriter;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

pub mod compression;
pub mod delimited;

pub use delimited::DelimitedReader;

/// Everything a reader needs to emit the records of one file.
pub struct SyncRequest<'a> {
    pub handle: &'a FileHandle,
    pub spec: &'a TableSpec,
    /// Catalog streams fed from this file
    pub streams: &'a [CatalogStream],
    /// Bookmark the file was selected against
    pub modified_since: DateTime<Utc>,
    pub writer: &'a MessageWriter,
}

pub trait FormatReader: Send + Sync {
    /// Build catalog streams from a sample of a file.
    fn build_streams(
        &self,
        handle: &FileHandle,
        spec: &TableSpec,
        sample_size: usize,
    ) -> Result<Vec<CatalogStream>>;

    /// Emit RECORD messages for every row of a file. Returns the row count.
    fn sync_records(&self, request: &SyncRequest<'_>) -> Result<u64>;
}

/// Readers by file type.
#[derive(Clone, Default)]
pub struct ReaderRegistry {
    readers: HashMap<FileType, Arc<dyn FormatReader>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in delimited reader for csv and text.
    pub fn with_defaults() -> Self {
        let delimited: Arc<dyn FormatReader> = Arc::new(DelimitedReader);
        let mut registry = Self::new();
        registry.register(FileType::Csv, Arc::clone(&delimited));
        registry.register(FileType::Text, delimited);
        registry
    }

    pub fn register(&mut self, file_type: FileType, reader: Arc<dyn FormatReader>) {
        self.readers.insert(file_type, reader);
    }

    pub fn get(&self, file_type: FileType) -> Result<Arc<dyn FormatReader>> {
        self.readers
            .get(&file_type)
            .cloned()
            .ok_or_else(|| TapError::UnsupportedFileType(file_type.to_string()))
    }
}
