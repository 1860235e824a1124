//! SFTP sessions over libssh2.
//!
//! Connections are lazy: the TCP socket and SSH handshake happen on the first
//! remote operation, under the retry envelope from `retry`.

use super::retry::{connect_with_retry, AttemptError, RetryPolicy};
use super::{Connector, RemoteEntry, RemoteFs};
use crate::config::TapConfig;
use crate::error::{Result, TapError};
use chrono::{DateTime, Utc};
use ssh2::{ErrorCode, Session, Sftp};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

// libssh2 session error codes
const LIBSSH2_ERROR_BANNER_RECV: i32 = -2;
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

/// Upper bound on a single TCP connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// SFTP status codes
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_NO_SUCH_PATH: i32 = 10;

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_file: Option<PathBuf>,
    /// Applied to every blocking libssh2 call; the TCP connect is capped lower
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ConnectionSettings {
    pub fn from_config(config: &TapConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            private_key_file: config.private_key_path(),
            timeout: Duration::from_secs(config.timeout_secs),
            retry: RetryPolicy::default().with_reject_retries(config.connect_retries),
        }
    }
}

/// Hands out a fresh `SftpConnection` per operation.
pub struct SftpConnector {
    settings: ConnectionSettings,
}

impl SftpConnector {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }
}

impl Connector for SftpConnector {
    fn connect(&self) -> Result<Box<dyn RemoteFs>> {
        Ok(Box::new(SftpConnection::new(self.settings.clone())))
    }
}

struct Established {
    session: Session,
    sftp: Sftp,
}

enum State {
    Idle,
    Open(Established),
    Closed,
}

pub struct SftpConnection {
    settings: ConnectionSettings,
    state: State,
}

impl SftpConnection {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            state: State::Idle,
        }
    }

    fn sftp(&mut self) -> Result<&Sftp> {
        if matches!(self.state, State::Idle) {
            let established = self.establish()?;
            self.state = State::Open(established);
        }
        match &self.state {
            State::Open(established) => Ok(&established.sftp),
            _ => Err(TapError::ConnectionClosed),
        }
    }

    fn establish(&self) -> Result<Established> {
        connect_with_retry(&self.settings.retry, || self.attempt())
            .map_err(|e| connection_error(&self.settings, e))
    }

    fn attempt(&self) -> std::result::Result<Established, AttemptError> {
        let settings = &self.settings;
        info!("Creating new connection to SFTP...");

        let tcp = open_socket(
            &settings.host,
            settings.port,
            settings.timeout.min(CONNECT_TIMEOUT),
        )?;
        let mut session = Session::new().map_err(classify)?;
        session.set_tcp_stream(tcp);
        session.set_compress(true);
        session.set_timeout(settings.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(classify)?;

        match &settings.private_key_file {
            Some(key) => session
                .userauth_pubkey_file(&settings.username, None, key, None)
                .map_err(classify)?,
            None => session
                .userauth_password(
                    &settings.username,
                    settings.password.as_deref().unwrap_or(""),
                )
                .map_err(classify)?,
        }
        if !session.authenticated() {
            return Err(AttemptError::Rejected {
                auth: true,
                message: "server did not accept credentials".to_string(),
            });
        }

        let sftp = session.sftp().map_err(classify)?;
        info!("Connection successful");
        Ok(Established { session, sftp })
    }

    fn remote_error(path: &str, e: ssh2::Error) -> TapError {
        TapError::Remote {
            path: path.to_string(),
            message: e.to_string(),
        }
    }
}

/// Surface an exhausted retry envelope as the tap error for the host.
fn connection_error(settings: &ConnectionSettings, e: AttemptError) -> TapError {
    match e {
        AttemptError::Rejected {
            auth: true,
            message,
        } => TapError::Authentication {
            host: settings.host.clone(),
            username: settings.username.clone(),
            message,
        },
        other => TapError::Server {
            host: settings.host.clone(),
            port: settings.port,
            message: other.message().to_string(),
        },
    }
}

/// Resolve and connect. Failures count as disconnects since no server has answered.
fn open_socket(
    host: &str,
    port: u16,
    timeout: Duration,
) -> std::result::Result<TcpStream, AttemptError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| AttemptError::Disconnected(format!("cannot resolve {}: {}", host, e)))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(AttemptError::Disconnected(match last_err {
        Some(e) => format!("cannot connect to {}:{}: {}", host, port, e),
        None => format!("no addresses for {}", host),
    }))
}

/// Sort a libssh2 failure into "connection dropped" versus "server said no".
fn classify(e: ssh2::Error) -> AttemptError {
    match e.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_DISCONNECT
            | LIBSSH2_ERROR_SOCKET_RECV
            | LIBSSH2_ERROR_SOCKET_SEND
            | LIBSSH2_ERROR_BANNER_RECV,
        ) => AttemptError::Disconnected(e.message().to_string()),
        ErrorCode::Session(
            LIBSSH2_ERROR_AUTHENTICATION_FAILED | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED,
        ) => AttemptError::Rejected {
            auth: true,
            message: e.message().to_string(),
        },
        _ => AttemptError::Rejected {
            auth: false,
            message: e.message().to_string(),
        },
    }
}

fn is_not_found(e: &ssh2::Error) -> bool {
    matches!(
        e.code(),
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE | LIBSSH2_FX_NO_SUCH_PATH)
    )
}

impl RemoteFs for SftpConnection {
    fn read_dir(&mut self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let sftp = self.sftp()?;
        let entries = sftp.readdir(Path::new(dir)).map_err(|e| {
            if is_not_found(&e) {
                TapError::DirectoryNotFound(dir.to_string())
            } else {
                Self::remote_error(dir, e)
            }
        })?;

        Ok(entries
            .into_iter()
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteEntry {
                    name,
                    is_dir: stat.is_dir(),
                    size: stat.size.unwrap_or(0),
                    mtime: stat
                        .mtime
                        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0)),
                })
            })
            .collect())
    }

    fn open(&mut self, path: &str) -> Result<Box<dyn Read + Send>> {
        let sftp = self.sftp()?;
        let file = sftp
            .open(Path::new(path))
            .map_err(|e| Self::remote_error(path, e))?;
        debug!("Opened remote file {}", path);
        Ok(Box::new(file))
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        let sftp = self.sftp()?;
        sftp.unlink(Path::new(path))
            .map_err(|e| Self::remote_error(path, e))
    }

    fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(Established { session, sftp }) => {
                drop(sftp);
                session
                    .disconnect(None, "closing", None)
                    .map_err(|e| TapError::Remote {
                        path: self.settings.host.clone(),
                        message: e.to_string(),
                    })
            }
            State::Idle => Ok(()),
            State::Closed => Err(TapError::ConnectionClosed),
        }
    }
}
