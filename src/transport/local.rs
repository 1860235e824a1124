//! Filesystem-backed remote, for tests and local runs.
//!
//! Remote paths are resolved under `root`: `/export/a.csv` maps to
//! `<root>/export/a.csv`. Counters record how many sessions were opened and how
//! many files were read, so callers can assert on transfer behavior.

use super::{Connector, RemoteEntry, RemoteFs};
use crate::error::{Result, TapError};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicUsize,
    opened: AtomicUsize,
    removed: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
    counters: Arc<Counters>,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Sessions handed out so far
    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    /// Files opened for reading so far
    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.counters.removed.load(Ordering::SeqCst)
    }
}

impl Connector for LocalConnector {
    fn connect(&self) -> Result<Box<dyn RemoteFs>> {
        self.counters.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalConnection {
            root: self.root.clone(),
            counters: Arc::clone(&self.counters),
            closed: false,
        }))
    }
}

struct LocalConnection {
    root: PathBuf,
    counters: Arc<Counters>,
    closed: bool,
}

impl LocalConnection {
    /// Map a remote path under the root, refusing anything that climbs out of it.
    fn resolve(&self, remote: &str) -> Result<PathBuf> {
        if self.closed {
            return Err(TapError::ConnectionClosed);
        }
        let mut full = self.root.clone();
        for component in Path::new(remote).components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(TapError::Remote {
                        path: remote.to_string(),
                        message: "path escapes root".to_string(),
                    })
                }
            }
        }
        Ok(full)
    }

    fn io_error(path: &str, e: io::Error) -> TapError {
        TapError::Remote {
            path: path.to_string(),
            message: e.to_string(),
        }
    }
}

impl RemoteFs for LocalConnection {
    fn read_dir(&mut self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let full = self.resolve(dir)?;
        let entries = match fs::read_dir(&full) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TapError::DirectoryNotFound(dir.to_string()))
            }
            Err(e) => return Err(Self::io_error(dir, e)),
        };

        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_error(dir, e))?;
            let meta = entry.metadata().map_err(|e| Self::io_error(dir, e))?;
            result.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len(),
                mtime: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    fn open(&mut self, path: &str) -> Result<Box<dyn Read + Send>> {
        let full = self.resolve(path)?;
        let file = File::open(&full).map_err(|e| Self::io_error(path, e))?;
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(file))
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        fs::remove_file(&full).map_err(|e| Self::io_error(path, e))?;
        self.counters.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(TapError::ConnectionClosed);
        }
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::list_files;

    #[test]
    fn test_local_listing_and_counters() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("export/sub")).unwrap();
        fs::write(temp.path().join("export/a.csv"), "id\n1\n").unwrap();
        fs::write(temp.path().join("export/sub/b.csv"), "id\n2\n").unwrap();

        let connector = LocalConnector::new(temp.path());
        let mut conn = connector.connect().unwrap();
        let listing = list_files(conn.as_mut(), "/export", true).unwrap();
        assert_eq!(listing.files.len(), 2);
        assert_eq!(listing.files[1].filepath, "/export/sub/b.csv");

        let mut content = String::new();
        conn.open("/export/a.csv")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "id\n1\n");
        assert_eq!(connector.connections(), 1);
        assert_eq!(connector.opened(), 1);
    }

    #[test]
    fn test_local_rejects_traversal_and_closed_use() {
        let temp = tempfile::tempdir().unwrap();
        let connector = LocalConnector::new(temp.path());
        let mut conn = connector.connect().unwrap();
        assert!(conn.open("/../etc/passwd").is_err());

        conn.close().unwrap();
        assert!(matches!(conn.read_dir("/"), Err(TapError::ConnectionClosed)));
        assert!(matches!(conn.close(), Err(TapError::ConnectionClosed)));
    }

    #[test]
    fn test_local_missing_directory() {
        let temp = tempfile::tempdir().unwrap();
        let mut conn = LocalConnector::new(temp.path()).connect().unwrap();
        assert!(matches!(
            conn.read_dir("/nope"),
            Err(TapError::DirectoryNotFound(_))
        ));
    }
}
