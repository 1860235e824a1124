//! OpenPGP decryption through the `gpg` binary.
//!
//! Every invocation runs against an isolated `--homedir` and reports through
//! `--status-fd`, so failures are classified from status keywords rather than
//! from localized human-readable messages.

use super::{ChunkSink, Flow};
use crate::error::{Result, TapError};
use crate::transport::TRANSFER_BUFFER_SIZE;
use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const STATUS_PREFIX: &str = "[GNUPG:] ";
const PLAINTEXT_CHUNK: usize = 64 * 1024;

/// Keywords gpg reported on its status channel.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GpgStatus {
    pub import_ok: bool,
    pub import_problem: bool,
    pub no_seckey: bool,
    pub bad_passphrase: bool,
    pub decryption_failed: bool,
    pub decryption_okay: bool,
    /// Human-readable lines, kept for error messages
    pub messages: Vec<String>,
}

impl GpgStatus {
    pub fn parse(output: &str) -> Self {
        let mut status = GpgStatus::default();
        for line in output.lines() {
            let Some(rest) = line.strip_prefix(STATUS_PREFIX) else {
                if !line.trim().is_empty() {
                    status.messages.push(line.trim().to_string());
                }
                continue;
            };
            match rest.split_whitespace().next().unwrap_or("") {
                "IMPORT_OK" => status.import_ok = true,
                "IMPORT_PROBLEM" => status.import_problem = true,
                "NO_SECKEY" => status.no_seckey = true,
                "BAD_PASSPHRASE" => status.bad_passphrase = true,
                "DECRYPTION_FAILED" => status.decryption_failed = true,
                "DECRYPTION_OKAY" => status.decryption_okay = true,
                _ => {}
            }
        }
        status
    }

    fn summary(&self) -> String {
        if self.messages.is_empty() {
            "no diagnostic output".to_string()
        } else {
            self.messages.join("; ")
        }
    }

    /// Map a finished decryption to an error, if it failed.
    fn check_decryption(&self, path: &str, exit_ok: bool) -> Result<()> {
        if self.no_seckey && !self.decryption_okay {
            return Err(TapError::InvalidKey(format!(
                "no secret key available to decrypt {}",
                path
            )));
        }
        if self.decryption_failed || self.bad_passphrase || !exit_ok {
            return Err(TapError::DecryptionFailed {
                path: path.to_string(),
                message: format!(
                    "There was an error while decrypting file. Please verify decryption settings are correct. ({})",
                    self.summary()
                ),
            });
        }
        Ok(())
    }
}

/// How a streaming decryption ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Plaintext bytes handed to the sink
    pub plaintext_bytes: u64,
    /// The sink asked to stop before the ciphertext was exhausted
    pub stopped_early: bool,
}

/// A keyring directory holding the imported decryption key.
#[derive(Debug)]
pub struct GpgKeyring {
    home: PathBuf,
    program: PathBuf,
    passphrase_file: Option<NamedTempFile>,
}

impl GpgKeyring {
    /// Create `home` if needed and import `key` into it.
    pub fn prepare(home: &Path, key: &[u8], passphrase: Option<String>) -> Result<Self> {
        Self::prepare_with(PathBuf::from("gpg"), home, key, passphrase)
    }

    pub fn prepare_with(
        program: PathBuf,
        home: &Path,
        key: &[u8],
        passphrase: Option<String>,
    ) -> Result<Self> {
        if !home.exists() {
            info!(
                "GPG home folder does not exist. Creating home folder at \"{}\"",
                home.display()
            );
            fs::create_dir_all(home).map_err(|e| {
                TapError::InvalidKey(format!(
                    "Unable to create GNU home directory at \"{}\": {}",
                    home.display(),
                    e
                ))
            })?;
        }
        restrict_permissions(home);

        let passphrase_file = match passphrase {
            Some(passphrase) => {
                let mut file = NamedTempFile::new()?;
                file.write_all(passphrase.as_bytes())?;
                file.flush()?;
                Some(file)
            }
            None => None,
        };

        let keyring = Self {
            home: home.to_path_buf(),
            program,
            passphrase_file,
        };
        keyring.import(key)?;
        Ok(keyring)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--homedir").arg(&self.home);
        cmd.args(["--batch", "--yes", "--no-tty", "--status-fd", "2"]);
        cmd
    }

    fn decrypt_command(&self) -> Command {
        let mut cmd = self.command();
        cmd.arg("--always-trust");
        if let Some(file) = &self.passphrase_file {
            cmd.args(["--pinentry-mode", "loopback", "--passphrase-file"]);
            cmd.arg(file.path());
        }
        cmd
    }

    fn import(&self, key: &[u8]) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("--import");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            TapError::InvalidKey(format!("Failed to spawn {}: {}", self.program.display(), e))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(key)?;
        }
        let output = child.wait_with_output()?;
        let status = GpgStatus::parse(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() || !status.import_ok || status.import_problem {
            return Err(TapError::InvalidKey(format!(
                "Unable to import decryption key. Please verify the provided key is correct. ({})",
                status.summary()
            )));
        }
        debug!("Imported decryption key into {}", self.home.display());
        Ok(())
    }

    /// Decrypt `src` into `dest`, both local files.
    pub fn decrypt_file(&self, src: &Path, dest: &Path) -> Result<()> {
        let label = src.display().to_string();
        let mut cmd = self.decrypt_command();
        cmd.arg("--output").arg(dest).arg("--decrypt").arg(src);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().map_err(|e| TapError::DecryptionFailed {
            path: label.clone(),
            message: format!("Failed to spawn {}: {}", self.program.display(), e),
        })?;
        let status = GpgStatus::parse(&String::from_utf8_lossy(&output.stderr));
        status.check_decryption(&label, output.status.success())?;
        info!("Decrypted {} to {}", label, dest.display());
        Ok(())
    }

    /// Pipe ciphertext from `src` through gpg into `sink`.
    ///
    /// When the sink returns `Flow::Stop` the gpg process is killed and the
    /// rest of `src` is left unread.
    pub fn decrypt_stream<R>(
        &self,
        label: &str,
        src: R,
        sink: &mut dyn ChunkSink,
    ) -> Result<StreamOutcome>
    where
        R: Read + Send,
    {
        let mut cmd = self.decrypt_command();
        cmd.arg("--decrypt");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let spawn_error = |message: String| TapError::DecryptionFailed {
            path: label.to_string(),
            message,
        };
        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(format!("Failed to spawn {}: {}", self.program.display(), e)))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) = (stdin, stdout, stderr) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error("Failed to open gpg pipes".to_string()));
        };

        std::thread::scope(|scope| -> Result<StreamOutcome> {
            let feeder = scope.spawn(move || -> io::Result<u64> {
                let mut src = BufReader::with_capacity(TRANSFER_BUFFER_SIZE, src);
                let copied = io::copy(&mut src, &mut stdin)?;
                // closing stdin tells gpg the ciphertext is complete
                drop(stdin);
                Ok(copied)
            });
            let collector = scope.spawn(move || -> io::Result<String> {
                let mut text = String::new();
                stderr.read_to_string(&mut text)?;
                Ok(text)
            });

            let mut buf = vec![0u8; PLAINTEXT_CHUNK];
            let mut plaintext_bytes = 0u64;
            let mut stopped_early = false;
            let pumped: Result<()> = loop {
                let n = match stdout.read(&mut buf) {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break Err(e.into()),
                };
                plaintext_bytes += n as u64;
                match sink.on_chunk(&buf[..n]) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => {
                        stopped_early = true;
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                }
            };

            if stopped_early || pumped.is_err() {
                debug!("Stopping decryption of {} early", label);
                let _ = child.kill();
            }
            drop(stdout);
            let exit = child.wait();
            let fed = feeder
                .join()
                .map_err(|_| TapError::Task("ciphertext feeder panicked".to_string()))?;
            let diagnostics = collector
                .join()
                .map_err(|_| TapError::Task("gpg stderr reader panicked".to_string()))?
                .unwrap_or_default();

            pumped?;
            sink.finish()?;
            if stopped_early {
                return Ok(StreamOutcome {
                    plaintext_bytes,
                    stopped_early,
                });
            }

            let exit = exit?;
            let status = GpgStatus::parse(&diagnostics);
            status.check_decryption(label, exit.success())?;
            match fed {
                Ok(copied) => debug!("Fed {} bytes of ciphertext for {}", copied, label),
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    warn!("gpg closed its input early while decrypting {}", label)
                }
                Err(e) => {
                    return Err(TapError::Remote {
                        path: label.to_string(),
                        message: e.to_string(),
                    })
                }
            }
            Ok(StreamOutcome {
                plaintext_bytes,
                stopped_early,
            })
        })
    }
}

#[cfg(unix)]
fn restrict_permissions(home: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(home, fs::Permissions::from_mode(0o700)) {
        warn!("Unable to restrict permissions on {}: {}", home.display(), e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_home: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_import_ok() {
        let status = GpgStatus::parse(
            "gpg: key 0123456789ABCDEF: secret key imported\n\
             [GNUPG:] IMPORT_OK 17 0123456789ABCDEF0123456789ABCDEF01234567\n\
             [GNUPG:] IMPORT_RES 1 0 1 0 0 0 0 0 0 1 1 0 0 0 0\n",
        );
        assert!(status.import_ok);
        assert!(!status.import_problem);
        assert_eq!(status.messages.len(), 1);
    }

    #[test]
    fn test_no_seckey_is_invalid_key() {
        let status = GpgStatus::parse(
            "[GNUPG:] ENC_TO 0123456789ABCDEF 1 0\n\
             [GNUPG:] NO_SECKEY 0123456789ABCDEF\n\
             [GNUPG:] BEGIN_DECRYPTION\n\
             [GNUPG:] DECRYPTION_FAILED\n\
             gpg: decryption failed: No secret key\n",
        );
        assert!(matches!(
            status.check_decryption("/export/a.csv.pgp", false),
            Err(TapError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_bad_passphrase_is_decryption_failure() {
        let status = GpgStatus::parse(
            "[GNUPG:] NEED_PASSPHRASE 0123 0123 1 0\n\
             [GNUPG:] BAD_PASSPHRASE 0123456789ABCDEF\n",
        );
        assert!(matches!(
            status.check_decryption("/export/a.csv.pgp", false),
            Err(TapError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn test_one_of_several_recipients_missing_is_fine() {
        // NO_SECKEY for one recipient, but another key decrypted it
        let status = GpgStatus::parse(
            "[GNUPG:] NO_SECKEY AAAAAAAAAAAAAAAA\n\
             [GNUPG:] DECRYPTION_OKAY\n\
             [GNUPG:] END_DECRYPTION\n",
        );
        assert!(status.check_decryption("/export/a.csv.pgp", true).is_ok());
    }

    #[test]
    fn test_nonzero_exit_without_keywords_fails() {
        let status = GpgStatus::parse("gpg: no valid OpenPGP data found.\n");
        let err = status.check_decryption("x", false).unwrap_err();
        assert!(err.to_string().contains("no valid OpenPGP data"), "{}", err);
    }

    #[test]
    fn test_missing_program_is_invalid_key() {
        let temp = tempfile::tempdir().unwrap();
        let err = GpgKeyring::prepare_with(
            PathBuf::from("/nonexistent/gpg"),
            &temp.path().join("home"),
            b"key",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TapError::InvalidKey(_)));
        assert!(temp.path().join("home").is_dir());
    }
}
