//! Error types shared across the Keyseat crate.
//!
//! Denial reasons (unknown key, revoked, cap reached, ...) are NOT errors: they
//! are ordinary outcomes modelled by [`crate::authority::DenialReason`]. This
//! module only covers faults in the machinery around them.

use thiserror::Error;

/// Faults raised by configuration, record stores and the server plumbing.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The license record store failed to answer.
    #[error("record store error: {0}")]
    StoreError(String),

    /// The license record store did not answer within the configured bound.
    #[error("record store timed out after {0} ms")]
    StoreTimeout(u64),

    /// A stored record violates its own invariants (e.g. a zero entitlement).
    #[error("invalid license record: {0}")]
    InvalidRecord(String),

    /// Any other server-side failure.
    #[error("server error: {0}")]
    ServerError(String),
}

/// Convenience alias used throughout the crate.
pub type LicenseResult<T> = Result<T, LicenseError>;
