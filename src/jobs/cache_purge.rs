//! License record cache purge.

use tracing::debug;

use crate::authority::LicenseAuthority;

/// Drop cached license records older than the cache TTL.
///
/// Stale entries are never served, but without this job keys that are no
/// longer presented would stay in memory forever.
pub fn run_cache_purge(authority: &LicenseAuthority) -> usize {
    let purged = authority.purge_cache();
    debug!("Purged {} stale license cache entries", purged);
    purged
}
