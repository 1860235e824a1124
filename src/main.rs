//! tap-sftp
//!
//! Usage:
//!     tap-sftp --config config.json --discover > catalog.json
//!     tap-sftp --config config.json --catalog catalog.json --state state.json

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tap_sftp::catalog::Catalog;
use tap_sftp::config::TapConfig;
use tap_sftp::decrypt::DecryptionContext;
use tap_sftp::discover::discover;
use tap_sftp::format::ReaderRegistry;
use tap_sftp::secrets::{resolve_key_material, AwsCliSecretStore};
use tap_sftp::singer::MessageWriter;
use tap_sftp::sync::{load_state, StateStore, SyncCoordinator};
use tap_sftp::transport::Connector;
use tap_sftp::TapError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tap-sftp", version, about = "Singer tap for files on SFTP servers")]
struct Args {
    /// Tap configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Print the discovered catalog to stdout
    #[arg(short, long)]
    discover: bool,

    /// Catalog selecting the streams to sync
    #[arg(long, conflicts_with = "properties")]
    catalog: Option<PathBuf>,

    /// Legacy name for --catalog
    #[arg(short, long)]
    properties: Option<PathBuf>,

    /// State from the previous run
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// Also write every state change to this file
    #[arg(long)]
    state_output: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tap_sftp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = match TapConfig::from_path(&args.config) {
        Ok(config) => config,
        Err(e) => {
            let err = anyhow::Error::new(e);
            report_error(None, &err);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(args, config.clone()).await {
        report_error(Some(&config), &err);
        std::process::exit(1);
    }
}

async fn run(args: Args, config: TapConfig) -> Result<()> {
    let connector = connector(&config)?;
    let decryption = prepare_decryption(&config)?;
    let readers = ReaderRegistry::with_defaults();

    if args.discover {
        info!("Starting discover");
        let catalog = {
            let config = config.clone();
            let readers = readers.clone();
            let connector = Arc::clone(&connector);
            let decryption = decryption.clone();
            tokio::task::spawn_blocking(move || {
                discover(&config, connector.as_ref(), &readers, decryption.as_deref())
            })
            .await
            .context("discovery task panicked")??
        };
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        serde_json::to_writer_pretty(&mut out, &catalog)?;
        writeln!(out)?;
        info!("Finished discover");
        return Ok(());
    }

    let Some(catalog_path) = args.catalog.or(args.properties) else {
        anyhow::bail!(TapError::Config(
            "A catalog is required to sync; pass --catalog or run with --discover".to_string()
        ));
    };
    let mut catalog = Catalog::from_path(&catalog_path)
        .with_context(|| format!("Failed to load catalog {}", catalog_path.display()))?;
    catalog.apply_column_updates(&config.columns_to_update);

    let writer = Arc::new(MessageWriter::stdout());
    let initial = load_state(args.state.as_deref())?;
    let mut state = StateStore::new(initial, Arc::clone(&writer));
    if let Some(path) = args.state_output {
        state = state.with_output(path);
    }

    let coordinator = SyncCoordinator::new(config, connector, writer, Arc::new(state))
        .with_readers(readers)
        .with_decryption(decryption);
    let records = coordinator.sync(&catalog).await?;
    info!("Synced {} records", records);
    Ok(())
}

#[cfg(feature = "ssh")]
fn connector(config: &TapConfig) -> Result<Arc<dyn Connector>> {
    use tap_sftp::transport::{ConnectionSettings, SftpConnector};
    Ok(Arc::new(SftpConnector::new(ConnectionSettings::from_config(
        config,
    ))))
}

#[cfg(not(feature = "ssh"))]
fn connector(_config: &TapConfig) -> Result<Arc<dyn Connector>> {
    anyhow::bail!(TapError::Config(
        "tap-sftp was built without the ssh feature".to_string()
    ))
}

/// Fetch key material once and import it into the keyring.
fn prepare_decryption(config: &TapConfig) -> Result<Option<Arc<DecryptionContext>>> {
    let Some(decrypt) = &config.decryption_configs else {
        return Ok(None);
    };
    let storage = decrypt.storage_type()?;
    let store = AwsCliSecretStore::new(storage);
    let material = resolve_key_material(storage, &store, &decrypt.key_name)?;
    let context = DecryptionContext::prepare(decrypt, material)?;
    Ok(Some(Arc::new(context)))
}

/// Log the failure between the configured markers and write the error artifact.
fn report_error(config: Option<&TapConfig>, err: &anyhow::Error) {
    let (kind, code) = match err.downcast_ref::<TapError>() {
        Some(tap) => (tap.kind(), tap.code()),
        None => ("Error", "tap_sftp.error"),
    };
    let artifact = json!({
        "exception_type": kind,
        "exception_message": format!("{:#}", err),
        "code": code,
    });

    let (start, end) = match config {
        Some(config) => (
            config.error_start_marker.as_str(),
            config.error_end_marker.as_str(),
        ),
        None => (
            tap_sftp::config::ERROR_START_MARKER,
            tap_sftp::config::ERROR_END_MARKER,
        ),
    };
    error!("{}{}{}", start, artifact, end);

    if let Some(path) = config.and_then(|c| c.error_file_path.as_ref()) {
        let written = serde_json::to_vec_pretty(&artifact)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| std::fs::write(path, bytes).map_err(anyhow::Error::from));
        if let Err(e) = written {
            error!("Failed to write error file {}: {}", path.display(), e);
        }
    }
}
