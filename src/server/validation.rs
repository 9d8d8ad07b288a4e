//! Request validation utilities for the Keyseat API.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::session::{SESSION_ID_LEN, SESSION_ID_PREFIX};

/// Longest license key accepted on the wire.
pub const MAX_LICENSE_KEY_LEN: usize = 128;

/// Longest installation fingerprint accepted on the wire.
pub const MAX_FINGERPRINT_LEN: usize = 128;

/// Validation error type.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

fn license_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("license key regex is valid"))
}

fn fingerprint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:-]+$").expect("fingerprint regex is valid"))
}

fn session_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!("^{SESSION_ID_PREFIX}[0-9a-f]+$")).expect("session id regex is valid")
    })
}

/// Validate that a string is not empty or whitespace only.
///
/// # Example
/// ```
/// use keyseat::server::validation::validate_not_empty;
///
/// assert!(validate_not_empty("hello", "name").is_ok());
/// assert!(validate_not_empty("   ", "name").is_err());
/// ```
pub fn validate_not_empty(value: &str, field_name: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        Err(ValidationError {
            field: field_name.to_string(),
            message: "cannot be empty".to_string(),
        })
    } else {
        Ok(())
    }
}

/// Validate a license key as presented by a client.
///
/// Keys are opaque, so only the shape is checked: 1 to 128 characters from
/// `[A-Za-z0-9_-]`.
///
/// # Example
/// ```
/// use keyseat::server::validation::validate_license_key;
///
/// assert!(validate_license_key("LIC-ABCD-EFGH", "license_key").is_ok());
/// assert!(validate_license_key("has space", "license_key").is_err());
/// ```
pub fn validate_license_key(value: &str, field_name: &str) -> ValidationResult<()> {
    validate_not_empty(value, field_name)?;

    if value.len() > MAX_LICENSE_KEY_LEN {
        return Err(ValidationError {
            field: field_name.to_string(),
            message: format!("must be at most {MAX_LICENSE_KEY_LEN} characters"),
        });
    }

    if license_key_regex().is_match(value) {
        Ok(())
    } else {
        Err(ValidationError {
            field: field_name.to_string(),
            message: "may only contain letters, digits, '-' and '_'".to_string(),
        })
    }
}

/// Validate an installation fingerprint (machine hash, hostname and so on).
///
/// # Example
/// ```
/// use keyseat::server::validation::validate_fingerprint;
///
/// assert!(validate_fingerprint("a1b2:c3d4", "fingerprint").is_ok());
/// assert!(validate_fingerprint("two words", "fingerprint").is_err());
/// ```
pub fn validate_fingerprint(value: &str, field_name: &str) -> ValidationResult<()> {
    validate_not_empty(value, field_name)?;

    if value.len() > MAX_FINGERPRINT_LEN {
        return Err(ValidationError {
            field: field_name.to_string(),
            message: format!("must be at most {MAX_FINGERPRINT_LEN} characters"),
        });
    }

    if fingerprint_regex().is_match(value) {
        Ok(())
    } else {
        Err(ValidationError {
            field: field_name.to_string(),
            message: "may only contain letters, digits, '-', '_', '.' and ':'".to_string(),
        })
    }
}

/// Validate a session token as issued by the registry.
///
/// # Example
/// ```
/// use keyseat::server::validation::validate_session_id;
/// use keyseat::session::generate_session_id;
///
/// assert!(validate_session_id(&generate_session_id(), "session_id").is_ok());
/// assert!(validate_session_id("ks_123", "session_id").is_err());
/// ```
pub fn validate_session_id(value: &str, field_name: &str) -> ValidationResult<()> {
    if value.len() == SESSION_ID_LEN && session_id_regex().is_match(value) {
        Ok(())
    } else {
        Err(ValidationError {
            field: field_name.to_string(),
            message: format!(
                "invalid session id format (expected: {SESSION_ID_PREFIX} followed by 64 hex characters)"
            ),
        })
    }
}
