//! Error types for tap-sftp.
//!
//! Connection, catalog, size-limit and decryption failures each get their own
//! variant so callers can branch on them instead of matching message text.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TapError {
    /// The server rejected our credentials after all retries.
    #[error("Authentication failed for {username}@{host}: {message}")]
    Authentication {
        host: String,
        username: String,
        message: String,
    },

    /// Host unreachable, connection reset, or protocol failure after all retries.
    #[error("Unable to connect to SFTP server {host}:{port}: {message}")]
    Server {
        host: String,
        port: u16,
        message: String,
    },

    #[error("Directory '{0}' does not exist")]
    DirectoryNotFound(String),

    #[error("Found no files on specified SFTP server at \"{prefix}\" matching \"{pattern}\"")]
    NoMatchingFiles { prefix: String, pattern: String },

    #[error("All files at \"{prefix}\" matching \"{pattern}\" are empty: {}", .paths.join(", "))]
    EmptyFile {
        prefix: String,
        pattern: String,
        paths: Vec<String>,
    },

    #[error(
        "File size limit exceeded the current limit of {} GB: {path} is {size} bytes",
        format_gb(.limit_kb)
    )]
    MaxFileSizeExceeded {
        path: String,
        size: u64,
        limit_kb: u64,
    },

    #[error("No streams found")]
    NoStreams,

    /// The decryption key could not be imported, or no matching secret key exists.
    #[error("Invalid decryption key: {0}")]
    InvalidKey(String),

    #[error("Decryption of file failed: {path}: {message}")]
    DecryptionFailed { path: String, message: String },

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Secret retrieval failed for '{name}': {message}")]
    Secret { name: String, message: String },

    /// A remote file operation failed after the session was established.
    #[error("Remote operation on '{path}' failed: {message}")]
    Remote { path: String, message: String },

    #[error("Connection already closed")]
    ConnectionClosed,

    #[error("Background task failed: {0}")]
    Task(String),

    /// One or more files of a table failed; `first` is the earliest failure observed.
    #[error("{failed} of {total} files failed for table '{table}': {first}")]
    TableSyncFailed {
        table: String,
        failed: usize,
        total: usize,
        first: Box<TapError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl TapError {
    /// Stable identifier written to the structured error artifact.
    pub fn code(&self) -> &'static str {
        match self {
            TapError::Authentication { .. } => "tap_sftp.authentication_error",
            TapError::Server { .. } => "tap_sftp.server_error",
            TapError::DirectoryNotFound(_) => "tap_sftp.directory_not_found_error",
            TapError::NoMatchingFiles { .. } => "tap_sftp.no_matching_files_error",
            TapError::EmptyFile { .. } => "tap_sftp.empty_file_error",
            TapError::MaxFileSizeExceeded { .. } => "tap_sftp.max_filesize_error",
            TapError::NoStreams => "tap_sftp.no_streams_error",
            TapError::InvalidKey(_) => "tap_sftp.invalid_key_error",
            TapError::DecryptionFailed { .. } => "tap_sftp.decryption_failed_error",
            TapError::UnsupportedFileType(_) => "tap_sftp.unsupported_file_type_error",
            TapError::Config(_) | TapError::Pattern(_) => "tap_sftp.configuration_error",
            TapError::Secret { .. } => "tap_sftp.secret_error",
            TapError::TableSyncFailed { first, .. } => first.code(),
            TapError::Remote { .. }
            | TapError::ConnectionClosed
            | TapError::Task(_)
            | TapError::Io(_)
            | TapError::Json(_)
            | TapError::Csv(_)
            | TapError::Zip(_) => "tap_sftp.error",
        }
    }

    /// Short variant name, used as `exception_type` in the error artifact.
    pub fn kind(&self) -> &'static str {
        match self {
            TapError::Authentication { .. } => "AuthenticationError",
            TapError::Server { .. } => "ServerError",
            TapError::DirectoryNotFound(_) => "DirectoryNotFoundError",
            TapError::NoMatchingFiles { .. } => "NoMatchingFilesError",
            TapError::EmptyFile { .. } => "EmptyFileError",
            TapError::MaxFileSizeExceeded { .. } => "MaxFileSizeExceededError",
            TapError::NoStreams => "NoStreamsError",
            TapError::InvalidKey(_) => "InvalidKeyError",
            TapError::DecryptionFailed { .. } => "DecryptionFailedError",
            TapError::UnsupportedFileType(_) => "UnsupportedFileTypeError",
            TapError::Config(_) | TapError::Pattern(_) => "ConfigurationError",
            TapError::Secret { .. } => "SecretError",
            TapError::TableSyncFailed { first, .. } => first.kind(),
            TapError::Remote { .. } => "RemoteError",
            TapError::ConnectionClosed => "ConnectionClosedError",
            TapError::Task(_) => "TaskError",
            TapError::Io(_) => "IoError",
            TapError::Json(_) => "JsonError",
            TapError::Csv(_) => "CsvError",
            TapError::Zip(_) => "ZipError",
        }
    }
}

fn format_gb(kb: &u64) -> String {
    format!("{:.2}", *kb as f64 / 1024.0 / 1024.0)
}

pub type Result<T> = std::result::Result<T, TapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_file_size_message_cites_limit() {
        let err = TapError::MaxFileSizeExceeded {
            path: "/export/big.csv".to_string(),
            size: 42,
            limit_kb: 5 * 1024 * 1024,
        };
        assert_eq!(
            err.to_string(),
            "File size limit exceeded the current limit of 5.00 GB: /export/big.csv is 42 bytes"
        );
        assert_eq!(err.code(), "tap_sftp.max_filesize_error");
    }

    #[test]
    fn test_table_failure_reports_first_error_code() {
        let err = TapError::TableSyncFailed {
            table: "orders".to_string(),
            failed: 1,
            total: 3,
            first: Box::new(TapError::InvalidKey("no secret key".to_string())),
        };
        assert_eq!(err.code(), "tap_sftp.invalid_key_error");
        assert_eq!(err.kind(), "InvalidKeyError");
    }
}
