//! Singer catalog model.
//!
//! Streams carry their configuration in breadcrumb metadata. The root
//! breadcrumb (`[]`) holds `selected`, `table-key-properties` and
//! `file_source`, the remote file a stream was discovered from.

use crate::config::ColumnUpdate;
use crate::error::{Result, TapError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogStream>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogStream {
    pub tap_stream_id: String,
    pub stream: String,
    pub schema: Value,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_properties: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub breadcrumb: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// Selected streams that share one file source.
#[derive(Debug, Clone)]
pub struct StreamGroup {
    pub file_source: String,
    pub streams: Vec<CatalogStream>,
}

impl Catalog {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TapError::Config(format!("Unable to read catalog {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Group selected streams by file source, in catalog order.
    ///
    /// Streams without a `file_source` form a group keyed by their stream id.
    pub fn selected_groups(&self) -> Vec<StreamGroup> {
        let mut groups: Vec<StreamGroup> = Vec::new();
        for stream in &self.streams {
            if !stream.is_selected() {
                info!("{}: Skipping - not selected", stream.tap_stream_id);
                continue;
            }
            let key = stream
                .file_source()
                .unwrap_or(&stream.tap_stream_id)
                .to_string();
            match groups.iter_mut().find(|g| g.file_source == key) {
                Some(group) => group.streams.push(stream.clone()),
                None => groups.push(StreamGroup {
                    file_source: key,
                    streams: vec![stream.clone()],
                }),
            }
        }
        groups
    }

    /// Apply configured column type overrides to every stream schema.
    pub fn apply_column_updates(&mut self, updates: &HashMap<String, Vec<ColumnUpdate>>) {
        for stream in &mut self.streams {
            if let Some(columns) = updates.get(&stream.tap_stream_id) {
                for update in columns {
                    stream.apply_column_update(update);
                }
            }
        }
    }
}

impl CatalogStream {
    /// A freshly discovered, unselected stream.
    pub fn new(
        name: &str,
        schema: Value,
        key_properties: Vec<String>,
        file_source: &str,
    ) -> Self {
        let mut metadata = vec![MetadataEntry {
            breadcrumb: Vec::new(),
            metadata: json!({
                "table-key-properties": key_properties,
                "file_source": file_source,
                "selected": false,
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        }];
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for column in properties.keys() {
                let inclusion = if key_properties.contains(column) {
                    "automatic"
                } else {
                    "available"
                };
                let mut entry = Map::new();
                entry.insert("inclusion".to_string(), json!(inclusion));
                metadata.push(MetadataEntry {
                    breadcrumb: vec!["properties".to_string(), column.clone()],
                    metadata: entry,
                });
            }
        }
        Self {
            tap_stream_id: name.to_string(),
            stream: name.to_string(),
            schema,
            metadata,
            key_properties,
        }
    }

    fn root(&self) -> Option<&Map<String, Value>> {
        self.metadata
            .iter()
            .find(|m| m.breadcrumb.is_empty())
            .map(|m| &m.metadata)
    }

    fn root_mut(&mut self) -> &mut Map<String, Value> {
        let idx = match self.metadata.iter().position(|m| m.breadcrumb.is_empty()) {
            Some(idx) => idx,
            None => {
                self.metadata.push(MetadataEntry {
                    breadcrumb: Vec::new(),
                    metadata: Map::new(),
                });
                self.metadata.len() - 1
            }
        };
        &mut self.metadata[idx].metadata
    }

    pub fn is_selected(&self) -> bool {
        self.root()
            .and_then(|m| m.get("selected"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_selected(&mut self, selected: bool) {
        self.root_mut().insert("selected".to_string(), json!(selected));
    }

    pub fn file_source(&self) -> Option<&str> {
        self.root()
            .and_then(|m| m.get("file_source"))
            .and_then(Value::as_str)
    }

    pub fn key_properties(&self) -> Vec<String> {
        match self
            .root()
            .and_then(|m| m.get("table-key-properties"))
            .and_then(Value::as_array)
        {
            Some(keys) => keys
                .iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect(),
            None => self.key_properties.clone(),
        }
    }

    /// Widen an integer column to nullable string when a number-to-string
    /// modify update is configured for it, so leading zeros survive.
    pub fn apply_column_update(&mut self, update: &ColumnUpdate) {
        if update.column_update_type != "modify"
            || update.from_type != "number"
            || update.target_type != "string"
        {
            return;
        }
        let Some(column) = self
            .schema
            .get_mut("properties")
            .and_then(|p| p.get_mut(&update.column))
        else {
            return;
        };

        let types: Vec<String> = match column.get("type") {
            Some(Value::String(t)) => vec![t.clone()],
            Some(Value::Array(ts)) => ts
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect(),
            _ => return,
        };
        match types.iter().position(|t| t == "integer") {
            Some(idx) if idx <= 1 => {}
            _ => return,
        }
        if !matches!(types.first().map(String::as_str), Some("null" | "integer")) {
            return;
        }

        column["type"] = json!(["null", update.target_type]);
        info!(
            "{}: column '{}' widened from {:?} to [\"null\", \"{}\"]",
            self.tap_stream_id, update.column, types, update.target_type
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(name: &str, source: &str, selected: bool) -> CatalogStream {
        let mut s = CatalogStream::new(
            name,
            json!({"type": "object", "properties": {"id": {"type": ["null", "integer"]}}}),
            vec!["id".to_string()],
            source,
        );
        s.set_selected(selected);
        s
    }

    fn update(column: &str, from: &str, to: &str) -> ColumnUpdate {
        ColumnUpdate {
            column: column.to_string(),
            column_update_type: "modify".to_string(),
            from_type: from.to_string(),
            target_type: to.to_string(),
        }
    }

    #[test]
    fn test_groups_selected_by_source() {
        let catalog = Catalog {
            streams: vec![
                stream("sheet1", "/export/book.xlsx", true),
                stream("skipped", "/export/other.csv", false),
                stream("sheet2", "/export/book.xlsx", true),
                stream("orders", "/export/orders.csv", true),
            ],
        };
        let groups = catalog.selected_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].file_source, "/export/book.xlsx");
        assert_eq!(groups[0].streams.len(), 2);
        assert_eq!(groups[1].streams[0].tap_stream_id, "orders");
    }

    #[test]
    fn test_metadata_roundtrip() {
        let s = stream("orders", "/export/orders.csv", true);
        let value = serde_json::to_value(&s).unwrap();
        let back: CatalogStream = serde_json::from_value(value).unwrap();
        assert!(back.is_selected());
        assert_eq!(back.file_source(), Some("/export/orders.csv"));
        assert_eq!(back.key_properties(), vec!["id".to_string()]);
    }

    #[test]
    fn test_column_update_widens_integer() {
        let mut s = stream("orders", "/export/orders.csv", true);
        s.apply_column_update(&update("id", "number", "string"));
        assert_eq!(s.schema["properties"]["id"]["type"], json!(["null", "string"]));
    }

    #[test]
    fn test_column_update_ignores_other_changes() {
        let mut s = stream("orders", "/export/orders.csv", true);
        s.apply_column_update(&update("id", "string", "number"));
        s.apply_column_update(&update("missing", "number", "string"));
        assert_eq!(s.schema["properties"]["id"]["type"], json!(["null", "integer"]));

        s.schema["properties"]["id"]["type"] = json!(["string", "integer"]);
        s.apply_column_update(&update("id", "number", "string"));
        assert_eq!(s.schema["properties"]["id"]["type"], json!(["string", "integer"]));
    }
}
