//! Expired session sweep.
//!
//! Reclaims sessions whose client stopped sending keep-alives (crashed,
//! disconnected, or simply never called end) so their slots become available
//! again.

use chrono::Utc;
use tracing::debug;

use crate::authority::LicenseAuthority;

/// Expire every session past its timeout.
///
/// Returns the number of sessions that were reaped.
pub fn run_session_sweep(authority: &LicenseAuthority) -> usize {
    let now = Utc::now();
    debug!("Sweeping expired sessions at {}", now);
    authority.sweep_expired(now)
}
