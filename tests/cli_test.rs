//! Integration tests for the tap-sftp binary's failure reporting

use anyhow::Result;
use serde_json::{json, Value};
use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn tap_bin() -> String {
    env!("CARGO_BIN_EXE_tap-sftp").to_string()
}

fn base_config() -> Value {
    json!({
        "host": "localhost",
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
fn test_sync_without_catalog_writes_error_file() -> Result<()> {
    let dir = TempDir::new()?;
    let error_file = dir.path().join("error.json");
    let mut config = base_config();
    config["error_file_path"] = json!(error_file);
    let config_path = dir.path().join("config.json");
    fs::write(&config_path, serde_json::to_vec(&config)?)?;

    let output = Command::new(tap_bin())
        .arg("--config")
        .arg(&config_path)
        .env("RUST_LOG", "tap_sftp=info")
        .output()?;

    assert!(!output.status.success());
    assert!(output.stdout.is_empty(), "stdout is reserved for messages");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("[tap_error_start]"), "{}", stderr);
    assert!(stderr.contains("[tap_error_end]"), "{}", stderr);

    let artifact: Value = serde_json::from_slice(&fs::read(&error_file)?)?;
    assert_eq!(artifact["code"], "tap_sftp.configuration_error");
    assert_eq!(artifact["exception_type"], "ConfigurationError");
    assert!(artifact["exception_message"]
        .as_str()
        .unwrap()
        .contains("catalog"));
    Ok(())
}

#[test]
fn test_custom_error_markers() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = base_config();
    config["error_start_marker"] = json!("<<ERR");
    config["error_end_marker"] = json!("ERR>>");
    let config_path = dir.path().join("config.json");
    fs::write(&config_path, serde_json::to_vec(&config)?)?;

    let output = Command::new(tap_bin())
        .arg("--config")
        .arg(&config_path)
        .env("RUST_LOG", "tap_sftp=info")
        .output()?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("<<ERR"), "{}", stderr);
    assert!(stderr.contains("ERR>>"), "{}", stderr);
    Ok(())
}

#[test]
fn test_missing_config_keys_fail() -> Result<()> {
    let dir = TempDir::new()?;
    let config_path = dir.path().join("config.json");
    fs::write(&config_path, r#"{"port": 22, "tables": []}"#)?;

    let output = Command::new(tap_bin())
        .arg("--config")
        .arg(&config_path)
        .arg("--discover")
        .env("RUST_LOG", "tap_sftp=info")
        .output()?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ConfigurationError"), "{}", stderr);
    assert!(stderr.contains("username"), "{}", stderr);
    assert!(stderr.contains("start_date"), "{}", stderr);
    Ok(())
}
