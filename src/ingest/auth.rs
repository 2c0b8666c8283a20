//! HMAC-SHA256 request signing for collector calls.
//!
//! `signature = hex(HMAC-SHA256(secret, "{collector_id}:{timestamp}"))`.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::ingest::Envelope;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// A secret is configured but the request carries no signature.
    #[error("missing signature")]
    MissingSignature,

    /// The signature does not match.
    #[error("invalid signature")]
    InvalidSignature,
}

/// Sign `"{collector_id}:{timestamp}"`, hex-encoded.
pub fn sign(secret: &str, collector_id: &str, timestamp: &str) -> Result<String, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidSignature)?;
    mac.update(collector_id.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a hex signature in constant time.
pub fn verify(
    secret: &str,
    collector_id: &str,
    timestamp: &str,
    signature: &str,
) -> Result<(), AuthError> {
    if signature.is_empty() {
        return Err(AuthError::MissingSignature);
    }
    let expected = sign(secret, collector_id, timestamp)?;
    if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::InvalidSignature)
    }
}

/// Server-side request authentication.
///
/// Without a secret every request is admitted (development mode), and each
/// admission is logged at warn level.
#[derive(Clone, Default)]
pub struct Authenticator {
    secret: Option<Arc<str>>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("secret_configured", &self.secret.is_some())
            .finish()
    }
}

impl Authenticator {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()).map(Arc::from),
        }
    }

    pub fn is_enforcing(&self) -> bool {
        self.secret.is_some()
    }

    pub fn check(&self, envelope: &Envelope) -> Result<(), AuthError> {
        let Some(secret) = &self.secret else {
            tracing::warn!(
                collector_id = %envelope.collector_id,
                "No collector secret configured, accepting unauthenticated request"
            );
            return Ok(());
        };
        verify(
            secret,
            &envelope.collector_id,
            &envelope.timestamp,
            &envelope.signature,
        )
    }
}
