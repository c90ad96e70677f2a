//! Failure classification for the watch loop's retry policy.

use std::error::Error as StdError;
use std::io::ErrorKind;

use crate::error::WatchError;

/// How the watch loop should treat a failed external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connectivity dropped. Wait out the cooldown before re-initializing.
    Transient,
    /// Anything else, assumed session related. Re-initialize immediately.
    Other,
}

/// Decides which retry policy applies to a failure.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &WatchError) -> FailureKind;
}

/// Default classifier: connect, timeout and connection-reset failures are
/// transient, everything else is not.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkClassifier;

impl ErrorClassifier for NetworkClassifier {
    fn classify(&self, error: &WatchError) -> FailureKind {
        let transient = match error {
            WatchError::Http(e) => e.is_connect() || e.is_timeout() || chain_has_reset(e),
            WatchError::Io(e) => is_reset_kind(e.kind()) || mentions_hangup(&e.to_string()),
            WatchError::InvalidResponse(_) | WatchError::Session(_) => false,
        };
        if transient {
            FailureKind::Transient
        } else {
            FailureKind::Other
        }
    }
}

fn is_reset_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
    )
}

fn mentions_hangup(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("socket hang up")
        || lower.contains("connection reset")
        || lower.contains("econnreset")
}

/// Walk the source chain looking for a reset connection.
fn chain_has_reset(error: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        let io_reset = err
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| is_reset_kind(io.kind()));
        if io_reset || mentions_hangup(&err.to_string()) {
            return true;
        }
        current = err.source();
    }
    false
}
