//! Compressed containers around delimited files.
//!
//! A plain file is one member. `.gz` files are one gunzipped member. `.zip`
//! archives yield every file member except macOS resource forks.

use crate::decrypt::Flow;
use crate::error::{Result, TapError};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;
use zip::ZipArchive;

/// Suffixes the tap cannot read: tarballs and encrypted archives.
const UNSUPPORTED_SUFFIXES: &[&str] = &[".tar.gz", ".zip.gpg", ".zip.pgp"];

const MACOS_METADATA_PREFIX: &str = "__MACOSX";

/// Reject file names whose container cannot be opened.
///
/// Checked on the remote name, so nothing is transferred for such files.
pub fn check_supported(file_name: &str) -> Result<()> {
    let lower = file_name.to_ascii_lowercase();
    if UNSUPPORTED_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
        return Err(TapError::UnsupportedFileType(format!(
            "{} (tar archives and encrypted zip archives are not supported)",
            file_name
        )));
    }
    Ok(())
}

pub fn is_zip(file_name: &str) -> bool {
    file_name.to_ascii_lowercase().ends_with(".zip")
}

fn is_gzip(file_name: &str) -> bool {
    file_name.to_ascii_lowercase().ends_with(".gz")
}

/// Feed each member of the local file at `path` to `on_member`.
///
/// `file_name` decides the container. Iteration ends early when
/// `on_member` returns `Flow::Stop`.
pub fn for_each_member<F>(path: &Path, file_name: &str, mut on_member: F) -> Result<()>
where
    F: FnMut(&str, &mut dyn Read) -> Result<Flow>,
{
    check_supported(file_name)?;
    let file = File::open(path)?;

    if is_zip(file_name) {
        let mut archive = ZipArchive::new(file)?;
        for i in 0..archive.len() {
            let mut member = archive.by_index(i)?;
            let name = member.name().to_string();
            if member.is_dir() || name.starts_with(MACOS_METADATA_PREFIX) {
                debug!("Skipping archive entry {} in {}", name, file_name);
                continue;
            }
            let mut source = BufReader::new(&mut member);
            if on_member(&name, &mut source)? == Flow::Stop {
                break;
            }
        }
        return Ok(());
    }

    let file = BufReader::new(file);
    if is_gzip(file_name) {
        let mut source = GzDecoder::new(file);
        on_member(file_name, &mut source)?;
    } else {
        let mut source = file;
        on_member(file_name, &mut source)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    fn members(path: &Path, file_name: &str) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for_each_member(path, file_name, |name, source| {
            let mut content = String::new();
            source.read_to_string(&mut content)?;
            out.push((name.to_string(), content));
            Ok(Flow::Continue)
        })?;
        Ok(out)
    }

    #[test]
    fn test_rejects_tarballs_and_encrypted_zips() {
        for name in ["dump.tar.gz", "orders.csv.zip.gpg", "ORDERS.ZIP.PGP"] {
            let err = check_supported(name).unwrap_err();
            assert!(matches!(err, TapError::UnsupportedFileType(_)), "{}", name);
        }
        for name in ["orders.csv", "orders.csv.gz", "orders.zip", "orders.csv.pgp"] {
            assert!(check_supported(name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_zip_yields_members_except_macos_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("orders.zip");
        write_zip(
            &path,
            &[
                ("a.csv", b"id\n1\n"),
                ("__MACOSX/", b""),
                ("__MACOSX/._a.csv", b"junk"),
                ("nested/", b""),
                ("nested/b.csv", b"id\n2\n"),
            ],
        );

        let found = members(&path, "orders.zip").unwrap();
        assert_eq!(
            found,
            vec![
                ("a.csv".to_string(), "id\n1\n".to_string()),
                ("nested/b.csv".to_string(), "id\n2\n".to_string()),
            ]
        );
    }

    #[test]
    fn test_stop_ends_iteration() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("orders.zip");
        write_zip(&path, &[("a.csv", b"1\n"), ("b.csv", b"2\n")]);

        let mut seen = Vec::new();
        for_each_member(&path, "orders.zip", |name, _| {
            seen.push(name.to_string());
            Ok(Flow::Stop)
        })
        .unwrap();
        assert_eq!(seen, vec!["a.csv"]);
    }

    #[test]
    fn test_plain_file_is_single_member() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("orders.csv");
        std::fs::write(&path, "id\n1\n").unwrap();

        let found = members(&path, "orders.csv").unwrap();
        assert_eq!(found, vec![("orders.csv".to_string(), "id\n1\n".to_string())]);
    }

    #[test]
    fn test_rejected_name_fails_before_open() {
        let temp = tempfile::tempdir().unwrap();
        let err = members(&temp.path().join("missing.tar.gz"), "missing.tar.gz").unwrap_err();
        assert!(matches!(err, TapError::UnsupportedFileType(_)));
    }
}
