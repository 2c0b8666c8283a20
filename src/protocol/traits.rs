//! Core protocol client trait and types.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

/// One reply row: attribute name to value, as the router reports it.
pub type Row = BTreeMap<String, String>;

/// Errors returned by protocol clients.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation did not finish within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// TLS setup or handshake failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// The router rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The command failed on the router (`!trap`, REST 400/404).
    #[error("command failed: {message}")]
    Trap {
        category: Option<u32>,
        message: String,
    },

    /// The router closed the session (`!fatal`).
    #[error("fatal: {0}")]
    Fatal(String),

    /// The byte stream or response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// REST transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// `run_command` was called without an open connection.
    #[error("not connected")]
    NotConnected,
}

impl ProtocolError {
    /// Errors after which the connection is unusable and must be re-established.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Timeout(_)
                | Self::Tls(_)
                | Self::Fatal(_)
                | Self::Decode(_)
                | Self::Http(_)
                | Self::NotConnected
        )
    }
}

/// A connection to one router.
///
/// Implementations keep the connection open between calls. A transport
/// failure closes it; the caller reconnects on its next cycle.
#[async_trait::async_trait]
pub trait RouterClient: Send {
    /// Open and authenticate the connection.
    async fn connect(&mut self) -> Result<(), ProtocolError>;

    /// Close the connection. Safe to call when already closed.
    async fn disconnect(&mut self);

    /// Run a command such as `/interface/print` and collect its reply rows.
    async fn run_command(
        &mut self,
        path: &str,
        params: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Vec<Row>, ProtocolError>;

    /// Whether this client speaks the REST variant.
    fn supports_rest(&self) -> bool;

    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(ProtocolError::Timeout(Duration::from_secs(1)).is_transport());
        assert!(ProtocolError::Fatal("session terminated".into()).is_transport());
        assert!(ProtocolError::NotConnected.is_transport());
        assert!(
            !ProtocolError::Trap {
                category: None,
                message: "no such command".into()
            }
            .is_transport()
        );
        assert!(!ProtocolError::Auth("invalid user name or password".into()).is_transport());
    }
}
