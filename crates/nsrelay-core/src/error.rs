//! Error types for proxy setup and relay flows.
//!
//! Setup errors ([`ProxyError`]) abort the whole invocation. Relay errors
//! ([`RelayError`]) belong to exactly one flow and are only ever logged.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while setting up a proxy instance.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The address specification does not follow `proto:address[:ports]`.
    #[error("invalid address spec {spec:?}: {reason}")]
    InvalidAddressSpec {
        /// The offending specification text.
        spec: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Listen and connect specs cannot be paired.
    #[error("invalid listen/connect mapping: {0}")]
    InvalidMapping(String),

    /// Binding a listen address kept failing.
    #[error("failed to listen on {addr} after {attempts} attempts ({backoff:?} apart): {source}")]
    ListenFailed {
        /// Address we tried to bind.
        addr: String,
        /// Number of attempts made.
        attempts: u32,
        /// Pause between attempts.
        backoff: Duration,
        /// Error of the last attempt.
        #[source]
        source: std::io::Error,
    },

    /// A listener descriptor could not be moved across the handoff channel.
    #[error("listener handoff failed at descriptor {index}: {reason}")]
    HandoffFailed {
        /// Position of the descriptor in the listen address list.
        index: usize,
        /// What went wrong.
        reason: String,
    },

    /// The listen-side subprocess did not exit successfully.
    #[error("listen-side setup process failed: {0}")]
    ChildSetupFailed(String),

    /// Joining a namespace of the target process failed.
    #[error("failed to attach to {kind} namespace of pid {pid}: {source}")]
    NamespaceAttach {
        /// Target process id.
        pid: i32,
        /// Namespace kind (`user`, `net`, `mnt`).
        kind: &'static str,
        /// Underlying OS error.
        #[source]
        source: nix::Error,
    },

    /// Detaching the daemon failed.
    #[error("daemonization failed: {0}")]
    Daemonize(String),

    /// The caller lacks the privilege to cross namespaces.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The readiness multiplexer could not be created or driven.
    #[error("multiplexer error: {0}")]
    Multiplexer(#[source] nix::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub(crate) fn invalid_spec(spec: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddressSpec {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn handoff(index: usize, reason: impl ToString) -> Self {
        Self::HandoffFailed {
            index,
            reason: reason.to_string(),
        }
    }
}

/// Result type for proxy setup operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors confined to a single relay flow.
#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O failure on one side of the flow.
    #[error("flow I/O error: {0}")]
    Flow(#[from] std::io::Error),

    /// The destination did not take the whole message with its descriptors.
    #[error(
        "ancillary transfer mismatch: read {read_bytes} bytes/{read_fds} descriptors, \
         wrote {written_bytes} bytes/{written_fds} descriptors"
    )]
    AncillaryTransferMismatch {
        read_bytes: usize,
        written_bytes: usize,
        read_fds: usize,
        written_fds: usize,
    },

    /// A message carried more descriptors than the relay is configured to pass.
    #[error("message carries {count} descriptors, limit is {limit}")]
    DescriptorLimit { count: usize, limit: usize },

    /// The kernel truncated the control data of a received message.
    #[error("control data truncated; descriptors were lost in transit")]
    ControlTruncated,
}

impl From<nix::Error> for RelayError {
    fn from(errno: nix::Error) -> Self {
        Self::Flow(errno.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_spec_mentions_input() {
        let err = ProxyError::invalid_spec("sctp:1.2.3.4:80", "unknown protocol");
        let text = err.to_string();
        assert!(text.contains("sctp:1.2.3.4:80"));
        assert!(text.contains("unknown protocol"));
    }

    #[test]
    fn test_listen_failed_reports_attempts() {
        let err = ProxyError::ListenFailed {
            addr: "0.0.0.0:80".to_string(),
            attempts: 10,
            backoff: Duration::from_millis(500),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        let text = err.to_string();
        assert!(text.contains("0.0.0.0:80"));
        assert!(text.contains("10 attempts"));
    }

    #[test]
    fn test_handoff_failed_reports_index() {
        let err = ProxyError::handoff(3, "peer closed");
        assert!(err.to_string().contains("descriptor 3"));
    }

    #[test]
    fn test_ancillary_mismatch_message() {
        let err = RelayError::AncillaryTransferMismatch {
            read_bytes: 10,
            written_bytes: 4,
            read_fds: 1,
            written_fds: 1,
        };
        assert!(err.to_string().contains("read 10 bytes"));
    }

    #[test]
    fn test_errno_converts_to_flow_error() {
        let err: RelayError = nix::Error::ECONNRESET.into();
        assert!(matches!(err, RelayError::Flow(_)));
    }
}
