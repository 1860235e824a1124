//! Remote file access.
//!
//! A `Connector` hands out one `RemoteFs` per logical operation; connections are
//! never shared between concurrently syncing files. `list_files` walks a prefix
//! and produces the `RemoteFileDescriptor`s the rest of the tap works with.

use crate::error::{Result, TapError};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

pub mod local;
pub mod retry;
#[cfg(feature = "ssh")]
pub mod sftp;

pub use local::LocalConnector;
#[cfg(feature = "ssh")]
pub use sftp::{ConnectionSettings, SftpConnector};

/// Read window used for remote transfers (256KB)
pub const TRANSFER_BUFFER_SIZE: usize = 256 * 1024;

/// A file found on the remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileDescriptor {
    /// Full remote path, '/' separated
    pub filepath: String,
    pub last_modified: DateTime<Utc>,
    /// Size in bytes
    pub file_size: u64,
}

impl RemoteFileDescriptor {
    pub fn file_name(&self) -> &str {
        self.filepath
            .rsplit('/')
            .next()
            .unwrap_or(self.filepath.as_str())
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// Missing when the server does not report modification times
    pub mtime: Option<DateTime<Utc>>,
}

/// A session on the remote server.
pub trait RemoteFs: Send {
    /// List the immediate children of `dir`.
    ///
    /// Fails with `DirectoryNotFound` when `dir` does not exist.
    fn read_dir(&mut self, dir: &str) -> Result<Vec<RemoteEntry>>;

    /// Open a streaming read handle on a remote file.
    fn open(&mut self, path: &str) -> Result<Box<dyn Read + Send>>;

    fn remove(&mut self, path: &str) -> Result<()>;

    /// Release the session. Any later call fails with `ConnectionClosed`.
    fn close(&mut self) -> Result<()>;
}

/// Creates fresh, independent sessions.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn RemoteFs>>;
}

/// Owns a session for the duration of one operation and closes it on every exit path.
pub struct ConnectionGuard {
    fs: Option<Box<dyn RemoteFs>>,
}

impl ConnectionGuard {
    pub fn acquire(connector: &dyn Connector) -> Result<Self> {
        Ok(Self {
            fs: Some(connector.connect()?),
        })
    }

    pub fn fs(&mut self) -> Result<&mut dyn RemoteFs> {
        match self.fs.as_mut() {
            Some(fs) => Ok(fs.as_mut()),
            None => Err(TapError::ConnectionClosed),
        }
    }

    pub fn close(mut self) -> Result<()> {
        match self.fs.take() {
            Some(mut fs) => fs.close(),
            None => Ok(()),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(mut fs) = self.fs.take() {
            if let Err(e) = fs.close() {
                warn!("Failed to close connection: {}", e);
            }
        }
    }
}

/// Result of walking a prefix: non-empty files plus the zero-byte files skipped.
#[derive(Debug, Default, Clone)]
pub struct Listing {
    pub files: Vec<RemoteFileDescriptor>,
    pub empty: Vec<String>,
}

fn join_remote(prefix: &str, name: &str) -> String {
    if prefix.ends_with('/') {
        format!("{}{}", prefix, name)
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// List files under `prefix`, descending into subdirectories when `recursive`.
pub fn list_files(fs: &mut dyn RemoteFs, prefix: &str, recursive: bool) -> Result<Listing> {
    let prefix = match prefix.trim_end_matches('/') {
        "" if prefix.starts_with('/') => "/",
        "" => ".",
        trimmed => trimmed,
    };
    let mut listing = Listing::default();
    collect_files(fs, prefix, recursive, &mut listing)?;
    Ok(listing)
}

fn collect_files(
    fs: &mut dyn RemoteFs,
    dir: &str,
    recursive: bool,
    listing: &mut Listing,
) -> Result<()> {
    for entry in fs.read_dir(dir)? {
        let path = join_remote(dir, &entry.name);
        if entry.is_dir {
            if recursive {
                collect_files(fs, &path, recursive, listing)?;
            }
            continue;
        }
        if entry.size == 0 {
            listing.empty.push(path);
            continue;
        }

        let last_modified = match entry.mtime {
            Some(mtime) => mtime,
            None => {
                warn!(
                    "Cannot read m_time for file {}, defaulting to current time",
                    path
                );
                Utc::now()
            }
        };
        listing.files.push(RemoteFileDescriptor {
            filepath: path,
            last_modified,
            file_size: entry.size,
        });
    }
    Ok(())
}

/// Copy a remote file to `dest` through a large read window. Returns bytes copied.
pub fn download(fs: &mut dyn RemoteFs, path: &str, dest: &Path) -> Result<u64> {
    let reader = fs.open(path)?;
    let mut reader = BufReader::with_capacity(TRANSFER_BUFFER_SIZE, reader);
    let mut out = File::create(dest)?;
    let copied = io::copy(&mut reader, &mut out).map_err(|e| TapError::Remote {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    info!("Downloaded {} ({} bytes)", path, copied);
    Ok(copied)
}
