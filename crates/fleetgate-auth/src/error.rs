//! Error types for access validation.

use thiserror::Error;

use fleetgate_state::Role;

/// The only error callers see. Carries no detail about which check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("access denied")]
pub struct AccessError;

/// Why a stored key was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key expired at {expiration}")]
    Expired { expiration: u64 },

    #[error("private key material stored as public key")]
    PrivateKey,

    #[error("key is not valid base64")]
    Encoding,

    #[error("expected a 32 byte ed25519 key, got {0} bytes")]
    Length(usize),

    #[error("malformed ed25519 key")]
    Malformed,
}

/// Internal reason for a denial, logged at debug level only.
#[derive(Debug, Error)]
pub enum ValidationFailure {
    #[error("signature is not valid base64")]
    SignatureEncoding,

    #[error("signature has the wrong length")]
    SignatureLength,

    #[error("public key not found")]
    UnknownKey,

    #[error("invalid public key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("signature does not match key id")]
    BadSignature,

    #[error("role {role} is below reader")]
    InsufficientRole { role: Role },

    #[error("lookup failed: {0}")]
    Lookup(String),
}

impl From<ValidationFailure> for AccessError {
    fn from(_: ValidationFailure) -> Self {
        AccessError
    }
}
