//! Retry envelope for establishing SSH sessions.
//!
//! Two nested loops. The inner loop retries rejected handshakes (auth or
//! protocol failure) a fixed number of times with linear backoff. The outer
//! loop retries the whole thing with exponential backoff when the socket
//! cannot be opened or is dropped mid-handshake.

use backon::{BlockingRetryable, ExponentialBuilder};
use std::time::Duration;
use tracing::{info, warn};

/// Why a single handshake attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Socket unreachable, or EOF or reset while the handshake was in flight
    Disconnected(String),
    /// Server answered but refused us
    Rejected { auth: bool, message: String },
}

impl AttemptError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, AttemptError::Disconnected(_))
    }

    pub fn message(&self) -> &str {
        match self {
            AttemptError::Disconnected(message) => message,
            AttemptError::Rejected { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after a dropped connection (total tries is one more)
    pub disconnect_retries: usize,
    pub disconnect_min_delay: Duration,
    pub disconnect_max_delay: Duration,
    /// Retries after a rejected handshake
    pub reject_retries: u32,
    /// Wait before retry `i` is `reject_step * i`
    pub reject_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 2 + 4 + 8 + 16 + 32 seconds: about a minute across 6 tries
        Self {
            disconnect_retries: 5,
            disconnect_min_delay: Duration::from_secs(2),
            disconnect_max_delay: Duration::from_secs(32),
            reject_retries: 10,
            reject_step: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_reject_retries(mut self, retries: u32) -> Self {
        self.reject_retries = retries;
        self
    }
}

/// Run `attempt` under the retry envelope, returning the last error once exhausted.
pub fn connect_with_retry<T, F>(policy: &RetryPolicy, mut attempt: F) -> Result<T, AttemptError>
where
    F: FnMut() -> Result<T, AttemptError>,
{
    let mut handshake = || {
        let mut i = 0u32;
        loop {
            match attempt() {
                Ok(session) => return Ok(session),
                Err(AttemptError::Rejected { message, .. }) if i < policy.reject_retries => {
                    i += 1;
                    info!("Connection failed ({}), retrying...", message);
                    std::thread::sleep(policy.reject_step * i);
                }
                Err(e) => return Err(e),
            }
        }
    };

    let backoff = ExponentialBuilder::default()
        .with_min_delay(policy.disconnect_min_delay)
        .with_max_delay(policy.disconnect_max_delay)
        .with_factor(2.0)
        .with_max_times(policy.disconnect_retries);

    handshake
        .retry(backoff)
        .sleep(std::thread::sleep)
        .when(|e: &AttemptError| e.is_disconnect())
        .notify(|e: &AttemptError, wait: Duration| {
            warn!(
                "SSH connection closed unexpectedly ({}). Waiting {:?} and retrying...",
                e.message(),
                wait
            );
        })
        .call()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            disconnect_retries: 5,
            disconnect_min_delay: Duration::ZERO,
            disconnect_max_delay: Duration::ZERO,
            reject_retries: 3,
            reject_step: Duration::ZERO,
        }
    }

    #[test]
    fn test_succeeds_first_try() {
        let mut calls = 0;
        let result = connect_with_retry(&fast_policy(), || {
            calls += 1;
            Ok::<_, AttemptError>("session")
        });
        assert_eq!(result, Ok("session"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_disconnects_bounded_to_six_tries() {
        let mut calls = 0;
        let result: Result<(), _> = connect_with_retry(&fast_policy(), || {
            calls += 1;
            Err(AttemptError::Disconnected("EOF".to_string()))
        });
        assert!(matches!(result, Err(AttemptError::Disconnected(_))));
        assert_eq!(calls, 6);
    }

    #[test]
    fn test_rejections_retry_linearly_then_surface() {
        let mut calls = 0;
        let result: Result<(), _> = connect_with_retry(&fast_policy(), || {
            calls += 1;
            Err(AttemptError::Rejected {
                auth: true,
                message: "bad password".to_string(),
            })
        });
        assert_eq!(
            result,
            Err(AttemptError::Rejected {
                auth: true,
                message: "bad password".to_string()
            })
        );
        // initial try + 3 retries, and rejections never trigger the outer loop
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_recovers_after_transient_disconnect() {
        let mut calls = 0;
        let result = connect_with_retry(&fast_policy(), || {
            calls += 1;
            if calls < 3 {
                Err(AttemptError::Disconnected("reset".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }
}
