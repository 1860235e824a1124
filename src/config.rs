//! Tap configuration.
//!
//! The JSON config is checked for required keys first, so a user sees every
//! missing key at once, then deserialized into typed structs and validated.

use crate::error::{Result, TapError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const REQUIRED_CONFIG_KEYS: &[&str] = &["username", "port", "host", "tables", "start_date"];
pub const REQUIRED_TABLE_SPEC_KEYS: &[&str] = &["file_type", "search_prefix", "search_pattern"];
pub const REQUIRED_DECRYPT_CONFIG_KEYS: &[&str] = &["key_name"];

/// Per-file size ceiling in KB for plain files (30 GB).
pub const MAX_FILE_SIZE_KB: u64 = 30 * 1024 * 1024;

/// Per-file size ceiling in KB when decryption is configured (5 GB).
pub const MAX_DECRYPTED_FILE_SIZE_KB: u64 = 5 * 1024 * 1024;

/// Lines captured from a file to build its schema.
pub const SAMPLE_SIZE: usize = 1000;

pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONNECT_RETRIES: u32 = 10;

pub const ERROR_START_MARKER: &str = "[tap_error_start]";
pub const ERROR_END_MARKER: &str = "[tap_error_end]";

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

/// Parse a timestamp as written in configs and state files.
///
/// Accepts RFC 3339, a naive date-time, or a bare date. Naive values are UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(ts.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(ts) = date.and_hms_opt(0, 0, 0) {
            return Ok(ts.and_utc());
        }
    }
    Err(TapError::Config(format!("Invalid timestamp '{}'", value)))
}

fn de_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn de_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{}'", text))),
    }
}

fn default_true() -> bool {
    true
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_sample_size() -> usize {
    SAMPLE_SIZE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_connect_retries() -> u32 {
    DEFAULT_CONNECT_RETRIES
}

fn default_error_start_marker() -> String {
    ERROR_START_MARKER.to_string()
}

fn default_error_end_marker() -> String {
    ERROR_END_MARKER.to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_quotechar() -> String {
    "\"".to_string()
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

/// Top-level tap configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TapConfig {
    pub host: String,
    #[serde(deserialize_with = "de_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
    #[serde(deserialize_with = "de_timestamp")]
    pub start_date: DateTime<Utc>,
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub decryption_configs: Option<DecryptionConfig>,

    /// Descend into subdirectories of each search prefix during sync
    #[serde(default = "default_true")]
    pub search_subdirectories: bool,
    /// Per-file size ceiling in KB
    #[serde(default)]
    pub max_file_size: Option<u64>,
    /// Remove each remote file once its records are synced
    #[serde(default)]
    pub delete_after_sync: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Session timeout applied to every blocking SSH/SFTP call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Column type overrides keyed by stream name
    #[serde(default)]
    pub columns_to_update: HashMap<String, Vec<ColumnUpdate>>,

    #[serde(default)]
    pub error_file_path: Option<PathBuf>,
    #[serde(default = "default_error_start_marker")]
    pub error_start_marker: String,
    #[serde(default = "default_error_end_marker")]
    pub error_end_marker: String,
}

/// One logical dataset: where its files live and how to parse them.
#[derive(Debug, Clone, Deserialize)]
pub struct TableSpec {
    #[serde(default)]
    pub table_name: Option<String>,
    pub search_prefix: String,
    pub search_pattern: String,
    pub file_type: FileType,
    #[serde(default)]
    pub key_properties: Vec<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_quotechar")]
    pub quotechar: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Rows to skip before the header row
    #[serde(default)]
    pub skip_header_row: usize,
    /// Rows to drop from the end of the file
    #[serde(default)]
    pub skip_footer_row: usize,
    #[serde(default = "default_true")]
    pub has_header: bool,
    #[serde(default)]
    pub worksheets: Vec<String>,
    /// Column layout for fixed-width files
    #[serde(default)]
    pub column_specs: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Csv,
    Text,
    Excel,
    Fwf,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Csv => "csv",
            FileType::Text => "text",
            FileType::Excel => "excel",
            FileType::Fwf => "fwf",
        }
    }

    /// File types that need an explicit `table_name`.
    pub fn requires_table_name(&self) -> bool {
        matches!(self, FileType::Csv | FileType::Text | FileType::Fwf)
    }

    /// Line-oriented types can be sampled from a prefix of the file.
    pub fn supports_partial_sample(&self) -> bool {
        matches!(self, FileType::Csv | FileType::Text)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TableSpec {
    /// Name used for bookmarks and stats. Falls back to the search pattern
    /// for workbook tables, which may omit `table_name`.
    pub fn name(&self) -> &str {
        self.table_name.as_deref().unwrap_or(&self.search_pattern)
    }

    /// Search pattern anchored at the end of the path.
    pub fn file_matcher(&self) -> Result<Regex> {
        Ok(Regex::new(&format!("(?:{})$", self.search_pattern))?)
    }

    /// Matcher for a stream group key (a full remote path) against `prefix/pattern`.
    pub fn source_matcher(&self) -> Result<Regex> {
        let prefix = self.search_prefix.trim_end_matches('/');
        Ok(Regex::new(&format!(
            "{}/(?:.*/)?(?:{})$",
            regex::escape(prefix),
            self.search_pattern
        ))?)
    }

    pub fn delimiter_byte(&self) -> Result<u8> {
        single_byte("delimiter", &self.delimiter)
    }

    pub fn quote_byte(&self) -> Result<u8> {
        single_byte("quotechar", &self.quotechar)
    }
}

fn single_byte(field: &str, value: &str) -> Result<u8> {
    match value.as_bytes() {
        [byte] => Ok(*byte),
        _ => Err(TapError::Config(format!(
            "{} must be a single ASCII character, got '{}'",
            field, value
        ))),
    }
}

/// Where the decryption key material is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStorageType {
    /// Parameter store value holding the armored key
    AwsSsm,
    /// JSON secret with `privateKeyEncoded` and `passphrase`
    AwsSecretsManager,
}

impl FromStr for KeyStorageType {
    type Err = TapError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AWS_SSM" => Ok(KeyStorageType::AwsSsm),
            "AWS_Secrets_Manager" => Ok(KeyStorageType::AwsSecretsManager),
            other => Err(TapError::Config(format!(
                "Storage type \"{}\" not supported",
                other
            ))),
        }
    }
}

impl fmt::Display for KeyStorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStorageType::AwsSsm => f.write_str("AWS_SSM"),
            KeyStorageType::AwsSecretsManager => f.write_str("AWS_Secrets_Manager"),
        }
    }
}

fn default_key_storage_type() -> String {
    "AWS_Secrets_Manager".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecryptionConfig {
    pub key_name: String,
    #[serde(default = "default_key_storage_type")]
    pub key_storage_type: String,
    /// Keyring directory; created if missing
    #[serde(default)]
    pub gnupghome: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Stream ciphertext into the decryption engine instead of downloading it first
    #[serde(default = "default_true")]
    pub decrypt_remote: bool,
}

impl DecryptionConfig {
    pub fn storage_type(&self) -> Result<KeyStorageType> {
        self.key_storage_type.parse()
    }

    pub fn gnupghome(&self) -> PathBuf {
        match &self.gnupghome {
            Some(home) => expand_tilde(home),
            None => std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("gnupg"),
        }
    }
}

/// A schema override for one column of one stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnUpdate {
    pub column: String,
    pub column_update_type: String,
    #[serde(rename = "type")]
    pub from_type: String,
    pub target_type: String,
}

impl TapConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TapError::Config(format!("Unable to read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        check_required_keys(&value)?;
        let config: TapConfig = serde_json::from_value(value)
            .map_err(|e| TapError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for table in &self.tables {
            if table.file_type.requires_table_name() && table.table_name.is_none() {
                return Err(TapError::Config(format!(
                    "Table with search_pattern \"{}\" is missing required key: table_name",
                    table.search_pattern
                )));
            }
            table
                .file_matcher()
                .map_err(|e| TapError::Config(format!("Invalid search_pattern: {}", e)))?;
            table.delimiter_byte()?;
            table.quote_byte()?;
            if table.file_type == FileType::Fwf
                && table.column_specs.as_ref().map_or(true, |specs| specs.is_empty())
            {
                return Err(TapError::Config(format!(
                    "Fixed-width table '{}' is missing column_specs",
                    table.name()
                )));
            }
        }
        if let Some(decrypt) = &self.decryption_configs {
            decrypt.storage_type()?;
        }
        if self.max_workers == 0 {
            return Err(TapError::Config("max_workers must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Per-file size ceiling in KB, honoring the smaller default for decrypted flows.
    pub fn max_file_size_kb(&self) -> u64 {
        self.max_file_size.unwrap_or(if self.decryption_configs.is_some() {
            MAX_DECRYPTED_FILE_SIZE_KB
        } else {
            MAX_FILE_SIZE_KB
        })
    }

    pub fn private_key_path(&self) -> Option<PathBuf> {
        self.private_key_file
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| expand_tilde(p))
    }
}

fn missing_keys(value: &serde_json::Value, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|key| value.get(**key).map_or(true, |v| v.is_null()))
        .map(|key| key.to_string())
        .collect()
}

fn check_required_keys(value: &serde_json::Value) -> Result<()> {
    if !value.is_object() {
        return Err(TapError::Config("Config must be a JSON object".to_string()));
    }

    let missing = missing_keys(value, REQUIRED_CONFIG_KEYS);
    if !missing.is_empty() {
        return Err(TapError::Config(format!(
            "Config is missing required keys: {:?}",
            missing
        )));
    }

    let tables = value["tables"]
        .as_array()
        .ok_or_else(|| TapError::Config("tables must be a list".to_string()))?;
    for (idx, table) in tables.iter().enumerate() {
        let missing = missing_keys(table, REQUIRED_TABLE_SPEC_KEYS);
        if !missing.is_empty() {
            return Err(TapError::Config(format!(
                "Table {} is missing required keys: {:?}",
                idx, missing
            )));
        }
    }

    if let Some(decrypt) = value.get("decryption_configs").filter(|v| !v.is_null()) {
        let missing = missing_keys(decrypt, REQUIRED_DECRYPT_CONFIG_KEYS);
        if !missing.is_empty() {
            return Err(TapError::Config(format!(
                "decryption_configs is missing required keys: {:?}",
                missing
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_config() -> serde_json::Value {
        json!({
            "host": "sftp.example.com",
            "port": 22,
            "username": "tap",
            "start_date": "2023-01-01",
            "tables": [{
                "table_name": "orders",
                "file_type": "csv",
                "search_prefix": "/export",
                "search_pattern": "orders.*\\.csv"
            }]
        })
    }

    #[test]
    fn test_defaults_applied() {
        let config = TapConfig::from_value(base_config()).unwrap();
        assert_eq!(config.port, 22);
        assert!(config.search_subdirectories);
        assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(config.max_file_size_kb(), MAX_FILE_SIZE_KB);
        assert_eq!(config.tables[0].delimiter_byte().unwrap(), b',');
        assert!(config.tables[0].has_header);
        assert_eq!(
            config.start_date,
            parse_timestamp("2023-01-01T00:00:00Z").unwrap()
        );
    }

    #[test]
    fn test_missing_keys_reported_together() {
        let mut value = base_config();
        let obj = value.as_object_mut().unwrap();
        obj.remove("host");
        obj.remove("start_date");

        let err = TapConfig::from_value(value).unwrap_err().to_string();
        assert!(err.contains("host"), "{}", err);
        assert!(err.contains("start_date"), "{}", err);
    }

    #[test]
    fn test_csv_table_requires_table_name() {
        let mut value = base_config();
        value["tables"][0].as_object_mut().unwrap().remove("table_name");
        let err = TapConfig::from_value(value).unwrap_err();
        assert!(matches!(err, TapError::Config(_)));
    }

    #[test]
    fn test_excel_table_name_optional() {
        let mut value = base_config();
        value["tables"][0] = json!({
            "file_type": "excel",
            "search_prefix": "/export",
            "search_pattern": "book\\.xlsx"
        });
        let config = TapConfig::from_value(value).unwrap();
        assert_eq!(config.tables[0].name(), "book\\.xlsx");
    }

    #[test]
    fn test_fwf_requires_column_specs() {
        let mut value = base_config();
        value["tables"][0]["file_type"] = json!("fwf");
        assert!(TapConfig::from_value(value).is_err());
    }

    #[test]
    fn test_port_as_string() {
        let mut value = base_config();
        value["port"] = json!("2222");
        assert_eq!(TapConfig::from_value(value).unwrap().port, 2222);
    }

    #[test]
    fn test_decryption_requires_key_name() {
        let mut value = base_config();
        value["decryption_configs"] = json!({"passphrase": "x"});
        let err = TapConfig::from_value(value).unwrap_err().to_string();
        assert!(err.contains("key_name"), "{}", err);
    }

    #[test]
    fn test_unsupported_storage_type() {
        let mut value = base_config();
        value["decryption_configs"] = json!({"key_name": "k", "key_storage_type": "Vault"});
        let err = TapConfig::from_value(value).unwrap_err().to_string();
        assert!(err.contains("Storage type \"Vault\" not supported"), "{}", err);
    }

    #[test]
    fn test_decryption_lowers_default_ceiling() {
        let mut value = base_config();
        value["decryption_configs"] = json!({"key_name": "k"});
        let config = TapConfig::from_value(value).unwrap();
        assert_eq!(config.max_file_size_kb(), MAX_DECRYPTED_FILE_SIZE_KB);
        assert!(config.decryption_configs.unwrap().decrypt_remote);
    }

    #[test]
    fn test_multichar_delimiter_rejected() {
        let mut value = base_config();
        value["tables"][0]["delimiter"] = json!("||");
        assert!(TapConfig::from_value(value).is_err());
    }

    #[test]
    fn test_file_matcher_is_suffix_anchored() {
        let mut spec = TapConfig::from_value(base_config()).unwrap().tables[0].clone();
        spec.search_pattern = "test2(.*)".to_string();
        let matcher = spec.file_matcher().unwrap();
        assert!(matcher.is_match("/export/test2.csv"));
        assert!(matcher.is_match("/export/test2_10.csv"));

        spec.search_pattern = "test2\\.csv".to_string();
        let matcher = spec.file_matcher().unwrap();
        assert!(matcher.is_match("/export/test2.csv"));
        assert!(!matcher.is_match("/export/test2.csv.bak"));
    }

    #[test]
    fn test_source_matcher() {
        let spec = TapConfig::from_value(base_config()).unwrap().tables[0].clone();
        let matcher = spec.source_matcher().unwrap();
        assert!(matcher.is_match("/export/orders_2024.csv"));
        assert!(matcher.is_match("/export/2024/orders_jan.csv"));
        assert!(!matcher.is_match("/import/orders_2024.csv"));
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let expected = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(parse_timestamp("2024-01-01").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-01 00:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-01T02:00:00+02:00").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(
            expand_tilde(Path::new("/etc/key")),
            PathBuf::from("/etc/key")
        );
    }
}
