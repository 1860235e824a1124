//! Resolve a table's search prefix and pattern into the files to process.

use crate::config::TableSpec;
use crate::error::{Result, TapError};
use crate::transport::{list_files, RemoteFileDescriptor, RemoteFs};
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{info, warn};

/// What to look for under one prefix.
#[derive(Debug, Clone)]
pub struct FileQuery<'a> {
    pub prefix: &'a str,
    pub pattern: &'a str,
    /// Keep only files modified strictly after this instant
    pub modified_since: Option<DateTime<Utc>>,
    pub recursive: bool,
}

impl<'a> FileQuery<'a> {
    pub fn for_table(spec: &'a TableSpec) -> Self {
        Self {
            prefix: &spec.search_prefix,
            pattern: &spec.search_pattern,
            modified_since: None,
            recursive: false,
        }
    }

    pub fn modified_since(mut self, since: DateTime<Utc>) -> Self {
        self.modified_since = Some(since);
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    fn matcher(&self) -> Result<Regex> {
        Ok(Regex::new(&format!("(?:{})$", self.pattern))?)
    }
}

/// Outcome of a resolution; callers decide which outcomes are errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Files matched the pattern. May be empty when all of them predate the bookmark.
    Matched(Vec<RemoteFileDescriptor>),
    /// Nothing under the prefix matched the pattern.
    NoMatchingFiles,
    /// Only zero-byte files matched the pattern.
    AllEmpty(Vec<String>),
}

impl Resolution {
    /// Files for an interactive caller: both non-match outcomes are errors.
    pub fn require_files(self, query: &FileQuery<'_>) -> Result<Vec<RemoteFileDescriptor>> {
        match self {
            Resolution::Matched(files) => Ok(files),
            Resolution::NoMatchingFiles => Err(TapError::NoMatchingFiles {
                prefix: query.prefix.to_string(),
                pattern: query.pattern.to_string(),
            }),
            Resolution::AllEmpty(paths) => Err(TapError::EmptyFile {
                prefix: query.prefix.to_string(),
                pattern: query.pattern.to_string(),
                paths,
            }),
        }
    }

    /// Files for an incremental sync: no matches just means nothing to do.
    pub fn into_sync_files(self, query: &FileQuery<'_>) -> Result<Vec<RemoteFileDescriptor>> {
        match self {
            Resolution::NoMatchingFiles => Ok(Vec::new()),
            other => other.require_files(query),
        }
    }
}

/// List, match and filter files for `query`.
pub fn resolve(fs: &mut dyn RemoteFs, query: &FileQuery<'_>) -> Result<Resolution> {
    let matcher = query.matcher()?;
    let listing = list_files(fs, query.prefix, query.recursive)?;

    if listing.files.is_empty() {
        warn!(
            "Found no files on specified SFTP server at \"{}\"",
            query.prefix
        );
    } else {
        info!("Found {} files in \"{}\"", listing.files.len(), query.prefix);
    }

    info!("Searching for files matching pattern: {}", query.pattern);
    let matched: Vec<RemoteFileDescriptor> = listing
        .files
        .into_iter()
        .filter(|f| matcher.is_match(&f.filepath))
        .collect();

    if matched.is_empty() {
        let empty: Vec<String> = listing
            .empty
            .into_iter()
            .filter(|path| matcher.is_match(path))
            .collect();
        if !empty.is_empty() {
            warn!(
                "All {} files matching \"{}\" in \"{}\" are empty",
                empty.len(),
                query.pattern,
                query.prefix
            );
            return Ok(Resolution::AllEmpty(empty));
        }
        warn!(
            "Found no files on specified SFTP server at \"{}\" matching \"{}\"",
            query.prefix, query.pattern
        );
        return Ok(Resolution::NoMatchingFiles);
    }

    info!(
        "Found {} files in \"{}\" matching \"{}\"",
        matched.len(),
        query.prefix,
        query.pattern
    );
    for f in &matched {
        info!("Found file: {}", f.filepath);
    }

    let files = match query.modified_since {
        Some(since) => matched
            .into_iter()
            .filter(|f| f.last_modified > since)
            .collect(),
        None => matched,
    };
    Ok(Resolution::Matched(files))
}

/// Per-file size ceiling, checked before any transfer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimit {
    pub limit_kb: u64,
}

impl SizeLimit {
    pub fn new(limit_kb: u64) -> Self {
        Self { limit_kb }
    }

    pub fn check(&self, files: &[RemoteFileDescriptor]) -> Result<()> {
        match files
            .iter()
            .find(|f| f.file_size as f64 / 1024.0 > self.limit_kb as f64)
        {
            Some(f) => Err(TapError::MaxFileSizeExceeded {
                path: f.filepath.clone(),
                size: f.file_size,
                limit_kb: self.limit_kb,
            }),
            None => Ok(()),
        }
    }
}
