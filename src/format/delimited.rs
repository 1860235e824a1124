//! Built-in reader for delimited text (csv and text tables).

use super::{compression, FormatReader, SyncRequest};
use crate::catalog::CatalogStream;
use crate::config::TableSpec;
use crate::decrypt::Flow;
use crate::error::{Result, TapError};
use crate::fetch::FileHandle;
use csv::ReaderBuilder;
use serde_json::{json, Map, Number, Value};
use std::collections::VecDeque;
use std::io::Read;
use tracing::{debug, info};

/// Surplus fields beyond the header land in this column.
pub const SDC_EXTRA_COLUMN: &str = "_sdc_extra";

const PROGRESS_INTERVAL: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Latin1,
}

impl Encoding {
    fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" | "utf-8-sig" => Ok(Encoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Ok(Encoding::Latin1),
            other => Err(TapError::Config(format!("Unsupported encoding '{}'", other))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|b| *b as char).collect(),
        }
    }
}

/// Walk the rows of a delimited file, applying header and footer handling.
///
/// Every member of an archive is read as its own table. Returns the first
/// non-empty header, which is generated (`col_1`, `col_2`, ...) when the file
/// has none.
fn scan<F>(handle: &FileHandle, spec: &TableSpec, mut on_row: F) -> Result<Vec<String>>
where
    F: FnMut(&[String], Vec<String>) -> Result<Flow>,
{
    let encoding = Encoding::parse(&spec.encoding)?;
    let mut first_header: Vec<String> = Vec::new();
    compression::for_each_member(handle.path(), handle.file_name(), |member, source| {
        let (header, flow) = scan_member(source, spec, encoding, &mut on_row)?;
        debug!("Read {} columns from {}", header.len(), member);
        if first_header.is_empty() {
            first_header = header;
        }
        Ok(flow)
    })?;
    Ok(first_header)
}

fn scan_member<F>(
    source: &mut dyn Read,
    spec: &TableSpec,
    encoding: Encoding,
    on_row: &mut F,
) -> Result<(Vec<String>, Flow)>
where
    F: FnMut(&[String], Vec<String>) -> Result<Flow>,
{
    let mut reader = ReaderBuilder::new()
        .delimiter(spec.delimiter_byte()?)
        .quote(spec.quote_byte()?)
        .has_headers(false)
        .flexible(true)
        .from_reader(source);

    let mut header: Option<Vec<String>> = None;
    let mut held: VecDeque<Vec<String>> = VecDeque::with_capacity(spec.skip_footer_row + 1);

    for (idx, record) in reader.byte_records().enumerate() {
        let record = record?;
        if idx < spec.skip_header_row {
            continue;
        }
        let mut fields: Vec<String> = record.iter().map(|f| encoding.decode(f)).collect();
        if idx == 0 {
            if let Some(first) = fields.first_mut() {
                if let Some(stripped) = first.strip_prefix('\u{feff}') {
                    *first = stripped.to_string();
                }
            }
        }

        if header.is_none() {
            if spec.has_header {
                header = Some(fields.iter().map(|f| f.trim().to_string()).collect());
                continue;
            }
            header = Some((1..=fields.len()).map(|i| format!("col_{}", i)).collect());
        }
        let Some(columns) = header.as_deref() else {
            continue;
        };

        held.push_back(fields);
        if held.len() > spec.skip_footer_row {
            if let Some(row) = held.pop_front() {
                if on_row(columns, row)? == Flow::Stop {
                    return Ok((header.unwrap_or_default(), Flow::Stop));
                }
            }
        }
    }

    Ok((header.unwrap_or_default(), Flow::Continue))
}

fn check_key_properties(header: &[String], spec: &TableSpec) -> Result<()> {
    let missing: Vec<&str> = spec
        .key_properties
        .iter()
        .filter(|k| !header.contains(k))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TapError::Config(format!(
            "CSV file missing required headers: {:?}",
            missing
        )))
    }
}

/// Narrowest JSON type that fits every observed value of a column.
#[derive(Debug, Clone, Copy, Default)]
struct TypeTracker {
    seen: bool,
    integer: bool,
    number: bool,
}

impl TypeTracker {
    fn observe(&mut self, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        if !self.seen {
            self.seen = true;
            self.integer = true;
            self.number = true;
        }
        self.integer &= value.parse::<i64>().is_ok();
        self.number &= value.parse::<f64>().map_or(false, |v| v.is_finite());
    }

    fn json_type(&self) -> &'static str {
        if !self.seen {
            "string"
        } else if self.integer {
            "integer"
        } else if self.number {
            "number"
        } else {
            "string"
        }
    }
}

fn column_types(schema: &Value, column: &str) -> Vec<String> {
    match schema.get("properties").and_then(|p| p.get(column)).and_then(|c| c.get("type")) {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect(),
        _ => vec!["string".to_string()],
    }
}

/// Convert a raw field to the first declared type it parses as.
fn convert(raw: String, types: &[String]) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() && types.iter().any(|t| t == "null") {
        return Value::Null;
    }
    for t in types {
        match t.as_str() {
            "integer" => {
                if let Ok(v) = trimmed.parse::<i64>() {
                    return json!(v);
                }
            }
            "number" => {
                if let Some(v) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
                    return Value::Number(v);
                }
            }
            "boolean" => match trimmed.to_ascii_lowercase().as_str() {
                "true" => return Value::Bool(true),
                "false" => return Value::Bool(false),
                _ => {}
            },
            "string" => return Value::String(raw),
            _ => {}
        }
    }
    Value::String(raw)
}

pub struct DelimitedReader;

impl FormatReader for DelimitedReader {
    fn build_streams(
        &self,
        handle: &FileHandle,
        spec: &TableSpec,
        sample_size: usize,
    ) -> Result<Vec<CatalogStream>> {
        let mut trackers: Vec<TypeTracker> = Vec::new();
        let mut rows = 0usize;
        let header = scan(handle, spec, |columns, row| {
            if trackers.len() < columns.len() {
                trackers.resize(columns.len(), TypeTracker::default());
            }
            for (tracker, value) in trackers.iter_mut().zip(&row) {
                tracker.observe(value);
            }
            rows += 1;
            Ok(if rows >= sample_size {
                Flow::Stop
            } else {
                Flow::Continue
            })
        })?;

        if header.is_empty() {
            return Ok(Vec::new());
        }
        check_key_properties(&header, spec)?;

        let mut properties = Map::new();
        for (idx, column) in header.iter().enumerate() {
            let json_type = trackers.get(idx).copied().unwrap_or_default().json_type();
            properties.insert(column.clone(), json!({"type": ["null", json_type]}));
        }
        properties.insert(
            SDC_EXTRA_COLUMN.to_string(),
            json!({"type": ["null", "array"], "items": {"type": "string"}}),
        );

        info!(
            "Inferred schema for \"{}\" from {} sampled rows of {}",
            spec.name(),
            rows,
            handle.descriptor().filepath
        );
        Ok(vec![CatalogStream::new(
            spec.name(),
            json!({"type": "object", "properties": properties}),
            spec.key_properties.clone(),
            &handle.descriptor().filepath,
        )])
    }

    fn sync_records(&self, request: &SyncRequest<'_>) -> Result<u64> {
        let mut synced = 0u64;
        let mut types: Option<Vec<Vec<Vec<String>>>> = None;
        info!("Synced Record Count: 0");

        let header = scan(request.handle, request.spec, |columns, mut row| {
            if types.is_none() {
                check_key_properties(columns, request.spec)?;
            }
            let types = types.get_or_insert_with(|| {
                request
                    .streams
                    .iter()
                    .map(|s| columns.iter().map(|c| column_types(&s.schema, c)).collect())
                    .collect()
            });

            let extra: Vec<String> = if row.len() > columns.len() {
                row.split_off(columns.len())
            } else {
                Vec::new()
            };

            for (stream, stream_types) in request.streams.iter().zip(types.iter()) {
                let mut record = Map::new();
                for (idx, column) in columns.iter().enumerate() {
                    let value = match row.get(idx) {
                        Some(raw) => convert(raw.clone(), &stream_types[idx]),
                        None => Value::Null,
                    };
                    record.insert(column.clone(), value);
                }
                if !extra.is_empty() {
                    record.insert(SDC_EXTRA_COLUMN.to_string(), json!(extra));
                }
                request
                    .writer
                    .write_record(&stream.tap_stream_id, &Value::Object(record))?;
            }

            synced += 1;
            if synced % PROGRESS_INTERVAL == 0 {
                info!("Synced Record Count: {}", synced);
            }
            Ok(Flow::Continue)
        })?;

        if types.is_none() && !header.is_empty() {
            check_key_properties(&header, request.spec)?;
        }
        info!("Sync Complete - Records Synced: {}", synced);
        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TapConfig;
    use crate::singer::MessageWriter;
    use crate::transport::RemoteFileDescriptor;
    use chrono::Utc;

    fn spec(overrides: Value) -> TableSpec {
        let mut table = json!({
            "table_name": "orders",
            "file_type": "csv",
            "search_prefix": "/export",
            "search_pattern": "orders.*\\.csv",
        });
        if let (Some(table), Some(overrides)) = (table.as_object_mut(), overrides.as_object()) {
            for (k, v) in overrides {
                table.insert(k.clone(), v.clone());
            }
        }
        let config = json!({
            "host": "h", "port": 22, "username": "u", "start_date": "2023-01-01",
            "tables": [table],
        });
        TapConfig::from_value(config).unwrap().tables.remove(0)
    }

    fn handle(name: &str, content: &[u8]) -> FileHandle {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(name), content).unwrap();
        FileHandle::from_parts(
            dir,
            name.to_string(),
            RemoteFileDescriptor {
                filepath: format!("/export/{}", name),
                last_modified: Utc::now(),
                file_size: content.len() as u64,
            },
        )
    }

    fn sync(spec: &TableSpec, handle: &FileHandle) -> (u64, Vec<Value>) {
        let stream = DelimitedReader
            .build_streams(handle, spec, 1000)
            .unwrap()
            .remove(0);
        let (writer, captured) = MessageWriter::in_memory();
        let count = DelimitedReader
            .sync_records(&SyncRequest {
                handle,
                spec,
                streams: &[stream],
                modified_since: Utc::now(),
                writer: &writer,
            })
            .unwrap();
        let records = captured
            .messages_of_type("RECORD")
            .into_iter()
            .map(|m| m["record"].clone())
            .collect();
        (count, records)
    }

    #[test]
    fn test_infers_types_and_file_source() {
        let spec = spec(json!({"key_properties": ["id"]}));
        let handle = handle("orders.csv", "\u{feff}id,amount,code\n1,2.5,007\n2,3,x1\n".as_bytes());
        let streams = DelimitedReader.build_streams(&handle, &spec, 1000).unwrap();
        assert_eq!(streams.len(), 1);
        let schema = &streams[0].schema["properties"];
        assert_eq!(schema["id"]["type"], json!(["null", "integer"]));
        assert_eq!(schema["amount"]["type"], json!(["null", "number"]));
        assert_eq!(schema["code"]["type"], json!(["null", "string"]));
        assert_eq!(streams[0].file_source(), Some("/export/orders.csv"));
        assert_eq!(streams[0].key_properties(), vec!["id".to_string()]);
    }

    #[test]
    fn test_sync_records_with_extra_fields() {
        let spec = spec(json!({}));
        let handle = handle("orders.csv", b"id,name\n1,a\n2,b,surplus\n3,\n");
        let (count, records) = sync(&spec, &handle);
        assert_eq!(count, 3);
        assert_eq!(records[0], json!({"id": 1, "name": "a"}));
        assert_eq!(records[1]["_sdc_extra"], json!(["surplus"]));
        assert_eq!(records[2]["name"], Value::Null);
    }

    #[test]
    fn test_skip_rows_and_generated_header() {
        let spec = spec(json!({
            "delimiter": "|",
            "has_header": false,
            "skip_header_row": 1,
            "skip_footer_row": 1,
        }));
        let handle = handle("orders.csv", b"REPORT v1\n1|a\n2|b\nTRAILER 2\n");
        let (count, records) = sync(&spec, &handle);
        assert_eq!(count, 2);
        assert_eq!(records[0], json!({"col_1": 1, "col_2": "a"}));
        assert_eq!(records[1]["col_1"], 2);
    }

    #[test]
    fn test_latin1_decoding() {
        let spec = spec(json!({"encoding": "latin-1"}));
        let handle = handle("orders.csv", b"id,city\n1,M\xfcnchen\n");
        let (_, records) = sync(&spec, &handle);
        assert_eq!(records[0]["city"], "München");
    }

    #[test]
    fn test_missing_key_properties() {
        let spec = spec(json!({"key_properties": ["order_id"]}));
        let handle = handle("orders.csv", b"id,name\n1,a\n");
        let err = DelimitedReader.build_streams(&handle, &spec, 10).unwrap_err();
        assert!(err.to_string().contains("order_id"), "{}", err);
    }

    #[test]
    fn test_gzip_file() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"id\n1\n2\n").unwrap();
        let spec = spec(json!({}));
        let handle = handle("orders.csv.gz", &encoder.finish().unwrap());
        let (count, _) = sync(&spec, &handle);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_zip_archive_reads_every_member() {
        use std::io::{Cursor, Write};
        use zip::write::SimpleFileOptions;
        use zip::ZipWriter;

        let mut archive = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut archive));
            let options = SimpleFileOptions::default();
            zip.start_file("orders-1.csv", options).unwrap();
            zip.write_all(b"id,name\n1,a\n2,b\n").unwrap();
            zip.start_file("__MACOSX/._orders-1.csv", options).unwrap();
            zip.write_all(b"\x00\x05\x16\x07resource fork").unwrap();
            zip.start_file("orders-2.csv", options).unwrap();
            zip.write_all(b"id,name\n3,c\n").unwrap();
            zip.finish().unwrap();
        }
        let spec = spec(json!({"key_properties": ["id"]}));
        let handle = handle("orders.zip", &archive);
        let (count, records) = sync(&spec, &handle);
        assert_eq!(count, 3);
        let ids: Vec<&Value> = records.iter().map(|r| &r["id"]).collect();
        assert_eq!(ids, vec![&json!(1), &json!(2), &json!(3)]);
    }

    #[test]
    fn test_tarball_is_unsupported() {
        let spec = spec(json!({}));
        let handle = handle("orders.tar.gz", b"not read");
        let err = DelimitedReader.build_streams(&handle, &spec, 10).unwrap_err();
        assert!(matches!(err, TapError::UnsupportedFileType(_)), "{}", err);
    }
}
