//! Singer tap that discovers and incrementally syncs files from SFTP servers.
//!
//! Files are listed under configured prefixes, optionally decrypted with
//! `gpg`, sampled to infer schemas, and synced by a bounded pool of workers
//! that advance per-table bookmarks as files complete.

pub mod catalog;
pub mod config;
pub mod decrypt;
pub mod discover;
pub mod error;
pub mod fetch;
pub mod format;
pub mod resolver;
pub mod secrets;
pub mod singer;
pub mod sync;
pub mod transport;

pub use error::{Result, TapError};
