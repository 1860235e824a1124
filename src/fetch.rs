//! Turn a remote file into a local, readable plaintext handle.

use crate::decrypt::{decrypted_name, inner_extension, Capturer, ChunkSink, DecryptionContext, Flow};
use crate::error::{Result, TapError};
use crate::format::compression;
use crate::transport::{download, RemoteFileDescriptor, RemoteFs, TRANSFER_BUFFER_SIZE};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// A local plaintext copy of a remote file. The copy is removed on drop.
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    file_name: String,
    descriptor: RemoteFileDescriptor,
    _dir: TempDir,
}

impl FileHandle {
    /// Wrap a file already placed in `dir` as `file_name`.
    pub fn from_parts(dir: TempDir, file_name: String, descriptor: RemoteFileDescriptor) -> Self {
        Self {
            path: dir.path().join(&file_name),
            file_name,
            descriptor,
            _dir: dir,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the plaintext content, without any encryption extension.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn descriptor(&self) -> &RemoteFileDescriptor {
        &self.descriptor
    }

    /// Lowercased extension of the content, e.g. `csv` for `orders.csv.pgp`.
    pub fn extension(&self) -> Option<String> {
        inner_extension(&self.file_name)
    }

    pub fn open(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }
}

/// Fetch a whole file, decrypting it when a context is given.
pub fn fetch_file(
    fs: &mut dyn RemoteFs,
    descriptor: &RemoteFileDescriptor,
    decryption: Option<&DecryptionContext>,
) -> Result<FileHandle> {
    compression::check_supported(descriptor.file_name())?;
    let dir = tempfile::tempdir()?;
    let remote_path = descriptor.filepath.as_str();
    let remote_name = descriptor.file_name();

    let (path, file_name) = match decryption {
        None => {
            let local = dir.path().join(remote_name);
            download(fs, remote_path, &local)?;
            (local, remote_name.to_string())
        }
        Some(ctx) => {
            info!("Decrypting file: {}", remote_path);
            let plain_name = decrypted_name(remote_name).to_string();
            let plain = dir.path().join(&plain_name);
            if ctx.decrypt_remote {
                let reader = fs.open(remote_path)?;
                let mut capturer = Capturer::create(&plain, None)?;
                ctx.keyring
                    .decrypt_stream(remote_path, reader, &mut capturer)?;
            } else {
                let cipher_dir = dir.path().join("cipher");
                fs::create_dir(&cipher_dir)?;
                let cipher = cipher_dir.join(remote_name);
                download(fs, remote_path, &cipher)?;
                ctx.keyring.decrypt_file(&cipher, &plain)?;
                fs::remove_file(&cipher)?;
            }
            if !plain.is_file() {
                return Err(TapError::DecryptionFailed {
                    path: remote_path.to_string(),
                    message: "no plaintext was produced".to_string(),
                });
            }
            (plain, plain_name)
        }
    };

    Ok(FileHandle {
        path,
        file_name,
        descriptor: descriptor.clone(),
        _dir: dir,
    })
}

/// Fetch at most `max_records` lines from the start of a file.
///
/// Only as much of the remote file is read as the sample needs. Encrypted
/// files are decrypted as they stream; gzip files are decompressed and the
/// sample is named without `.gz`. Zip archives need random access, so they
/// are fetched whole.
pub fn fetch_sample(
    fs: &mut dyn RemoteFs,
    descriptor: &RemoteFileDescriptor,
    decryption: Option<&DecryptionContext>,
    max_records: usize,
) -> Result<FileHandle> {
    compression::check_supported(descriptor.file_name())?;
    if decryption.is_none() && compression::is_zip(descriptor.file_name()) {
        return fetch_file(fs, descriptor, None);
    }
    let dir = tempfile::tempdir()?;
    let remote_path = descriptor.filepath.as_str();
    let reader = fs.open(remote_path)?;

    let file_name = match decryption {
        Some(ctx) => {
            let plain_name = decrypted_name(descriptor.file_name()).to_string();
            let mut capturer = Capturer::create(dir.path().join(&plain_name), Some(max_records))?;
            let outcome = ctx
                .keyring
                .decrypt_stream(remote_path, reader, &mut capturer)?;
            info!(
                "Sampled {} lines from {} (stopped early: {})",
                capturer.lines(),
                remote_path,
                outcome.stopped_early
            );
            plain_name
        }
        None => {
            let reader = BufReader::with_capacity(TRANSFER_BUFFER_SIZE, reader);
            let (sample_name, mut source): (&str, Box<dyn Read>) =
                match descriptor.file_name().strip_suffix(".gz") {
                    Some(stem) if !stem.is_empty() => (stem, Box::new(GzDecoder::new(reader))),
                    _ => (descriptor.file_name(), Box::new(reader)),
                };
            let mut capturer = Capturer::create(dir.path().join(sample_name), Some(max_records))?;
            pump(&mut source, &mut capturer).map_err(|e| TapError::Remote {
                path: remote_path.to_string(),
                message: e.to_string(),
            })?;
            info!("Sampled {} lines from {}", capturer.lines(), remote_path);
            sample_name.to_string()
        }
    };

    Ok(FileHandle {
        path: dir.path().join(&file_name),
        file_name,
        descriptor: descriptor.clone(),
        _dir: dir,
    })
}

/// Copy `source` into `sink` until it is exhausted or the sink stops.
fn pump(source: &mut dyn Read, sink: &mut dyn ChunkSink) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if sink.on_chunk(&buf[..n])? == Flow::Stop {
            break;
        }
    }
    sink.finish()
}
