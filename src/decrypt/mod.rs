//! Decryption pipeline.
//!
//! Ciphertext is either downloaded and decrypted file-to-file, or streamed from
//! the remote handle straight into the decryption engine. In the streaming case
//! the plaintext goes to a `ChunkSink`, which can ask the engine to stop early.

use crate::config::DecryptionConfig;
use crate::error::Result;
use crate::secrets::KeyMaterial;
use tracing::info;

pub mod capture;
pub mod gpg;

pub use capture::Capturer;
pub use gpg::{GpgKeyring, StreamOutcome};

/// Outer extensions that mark a file as encrypted.
pub const ENCRYPTED_EXTENSIONS: &[&str] = &["pgp", "gpg", "asc"];

/// Whether the engine should keep producing plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receives plaintext as the engine produces it.
pub trait ChunkSink {
    /// Consume one chunk. Returning `Flow::Stop` aborts decryption.
    fn on_chunk(&mut self, chunk: &[u8]) -> Result<Flow>;

    /// Called once the engine is done, whether it ran to the end or stopped.
    fn finish(&mut self) -> Result<()>;
}

/// File name with a trailing encryption extension removed.
///
/// `orders.csv.pgp` becomes `orders.csv`; names without one come back unchanged.
pub fn decrypted_name(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && ENCRYPTED_EXTENSIONS
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(ext)) =>
        {
            stem
        }
        _ => file_name,
    }
}

/// Extension of the content inside a possibly encrypted file, lowercased.
pub fn inner_extension(file_name: &str) -> Option<String> {
    decrypted_name(file_name)
        .rsplit_once('.')
        .filter(|(stem, _)| !stem.is_empty())
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

/// Run-scoped decryption state: the prepared keyring and the fetch mode.
///
/// Built once before any file is synced and shared read-only by every worker.
#[derive(Debug)]
pub struct DecryptionContext {
    pub keyring: GpgKeyring,
    pub decrypt_remote: bool,
}

impl DecryptionContext {
    pub fn prepare(config: &DecryptionConfig, material: KeyMaterial) -> Result<Self> {
        let home = config.gnupghome();
        info!("Preparing decryption keyring at \"{}\"", home.display());
        let passphrase = material.passphrase.or_else(|| config.passphrase.clone());
        let keyring = GpgKeyring::prepare(&home, &material.key, passphrase)?;
        Ok(Self {
            keyring,
            decrypt_remote: config.decrypt_remote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypted_name() {
        assert_eq!(decrypted_name("orders.csv.pgp"), "orders.csv");
        assert_eq!(decrypted_name("orders.csv.GPG"), "orders.csv");
        assert_eq!(decrypted_name("orders.csv"), "orders.csv");
        assert_eq!(decrypted_name(".pgp"), ".pgp");
    }

    #[test]
    fn test_inner_extension() {
        assert_eq!(inner_extension("orders.CSV.pgp").as_deref(), Some("csv"));
        assert_eq!(inner_extension("book.xlsx").as_deref(), Some("xlsx"));
        assert_eq!(inner_extension("data.txt.gz.asc").as_deref(), Some("gz"));
        assert_eq!(inner_extension("README"), None);
        assert_eq!(inner_extension("plain.pgp"), None);
    }
}
