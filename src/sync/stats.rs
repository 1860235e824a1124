//! Per-run extraction statistics.

use crate::config::TableSpec;
use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, ContentArrangement, Table};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStats {
    pub path: String,
    pub row_count: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub search_prefix: String,
    pub search_pattern: String,
    pub files: Vec<FileStats>,
}

impl TableStats {
    pub fn total_rows(&self) -> u64 {
        self.files.iter().map(|f| f.row_count).sum()
    }
}

/// Append-only registry written by concurrent workers.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    tables: Mutex<BTreeMap<String, TableStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, spec: &TableSpec, path: &str, last_modified: DateTime<Utc>, row_count: u64) {
        let mut tables = match self.tables.lock() {
            Ok(tables) => tables,
            Err(poisoned) => poisoned.into_inner(),
        };
        let table = tables
            .entry(spec.name().to_string())
            .or_insert_with(|| TableStats {
                search_prefix: spec.search_prefix.clone(),
                search_pattern: spec.search_pattern.clone(),
                files: Vec::new(),
            });
        table.files.push(FileStats {
            path: path.to_string(),
            row_count,
            last_modified,
        });
    }

    pub fn snapshot(&self) -> BTreeMap<String, TableStats> {
        match self.tables.lock() {
            Ok(tables) => tables.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Render the end-of-run summary table.
    pub fn render(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Disabled)
            .set_header(
                [
                    "table_name",
                    "search prefix",
                    "search pattern",
                    "file path",
                    "row count",
                    "last_modified",
                ]
                .into_iter()
                .map(Cell::new),
            );

        for (name, stats) in self.snapshot() {
            for file in &stats.files {
                table.add_row(vec![
                    Cell::new(&name),
                    Cell::new(&stats.search_prefix),
                    Cell::new(&stats.search_pattern),
                    Cell::new(&file.path),
                    Cell::new(file.row_count),
                    Cell::new(file.last_modified.to_rfc3339()),
                ]);
            }
        }
        format!("Extraction Summary\n{}", table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TapConfig;
    use serde_json::json;

    #[test]
    fn test_record_and_render() {
        let config = TapConfig::from_value(json!({
            "host": "h", "port": 22, "username": "u", "start_date": "2023-01-01",
            "tables": [{
                "table_name": "orders",
                "file_type": "csv",
                "search_prefix": "/export",
                "search_pattern": "orders.*\\.csv"
            }]
        }))
        .unwrap();
        let registry = StatsRegistry::new();
        let now = Utc::now();
        registry.record(&config.tables[0], "/export/orders_1.csv", now, 10);
        registry.record(&config.tables[0], "/export/orders_2.csv", now, 5);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot["orders"].files.len(), 2);
        assert_eq!(snapshot["orders"].total_rows(), 15);

        let rendered = registry.render();
        assert!(rendered.starts_with("Extraction Summary"));
        assert!(rendered.contains("/export/orders_2.csv"));
    }
}
