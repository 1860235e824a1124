//! Catalog discovery.
//!
//! Each table's files are listed non-recursively and sampled newest first.
//! Line-oriented types are sampled through the bounded capture path; other
//! types need the whole file.

use crate::catalog::{Catalog, CatalogStream};
use crate::config::{TableSpec, TapConfig};
use crate::decrypt::DecryptionContext;
use crate::error::{Result, TapError};
use crate::fetch::{fetch_file, fetch_sample};
use crate::format::ReaderRegistry;
use crate::resolver::{resolve, FileQuery, SizeLimit};
use crate::transport::{ConnectionGuard, Connector, RemoteFs};
use tracing::{debug, info};

/// Build the catalog for every configured table.
///
/// Streams sharing a stream id keep the one sampled from the newest file.
pub fn discover(
    config: &TapConfig,
    connector: &dyn Connector,
    readers: &ReaderRegistry,
    decryption: Option<&DecryptionContext>,
) -> Result<Catalog> {
    let mut guard = ConnectionGuard::acquire(connector)?;
    let mut catalog = Catalog::default();

    for spec in &config.tables {
        info!(
            "Sampling records to determine table JSON schema \"{}\".",
            spec.name()
        );
        let streams = discover_table(guard.fs()?, config, spec, readers, decryption)?;
        for stream in streams {
            if catalog
                .streams
                .iter()
                .any(|s| s.tap_stream_id == stream.tap_stream_id)
            {
                debug!(
                    "Keeping newer schema for stream \"{}\"",
                    stream.tap_stream_id
                );
                continue;
            }
            catalog.streams.push(stream);
        }
    }
    guard.close()?;

    if catalog.streams.is_empty() {
        return Err(TapError::NoStreams);
    }
    catalog.apply_column_updates(&config.columns_to_update);
    Ok(catalog)
}

fn discover_table(
    fs: &mut dyn RemoteFs,
    config: &TapConfig,
    spec: &TableSpec,
    readers: &ReaderRegistry,
    decryption: Option<&DecryptionContext>,
) -> Result<Vec<CatalogStream>> {
    let reader = readers.get(spec.file_type)?;
    let query = FileQuery::for_table(spec).recursive(false);
    let mut files = resolve(fs, &query)?.require_files(&query)?;
    SizeLimit::new(config.max_file_size_kb()).check(&files)?;

    files.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

    let mut streams = Vec::new();
    for file in &files {
        let handle = if spec.file_type.supports_partial_sample() {
            fetch_sample(fs, file, decryption, config.sample_size)?
        } else {
            fetch_file(fs, file, decryption)?
        };
        streams.extend(reader.build_streams(&handle, spec, config.sample_size)?);
    }
    Ok(streams)
}
