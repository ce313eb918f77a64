//! Key Pool: API credential rotation under a sliding-window rate limit.
//!
//! Credentials are loaded once at startup from a `.env`-style file and held
//! in load order. Selection is round-robin with skip: the credential under
//! the rotation cursor is used until it hits the rate limit, and every
//! reported usage advances the cursor so load spreads evenly.
//!
//! The pool is an explicitly constructed object. Share it between
//! orchestrators through [`SharedKeyPool`].

pub mod errors;
pub mod loader;
pub mod pool;

use std::sync::{Arc, Mutex};

// Re-exports for convenience
pub use errors::KeyPoolError;
pub use loader::{find_env_file, load_env_file, CREDENTIAL_PREFIX};
pub use pool::{Credential, KeyPool, RateLimit, UsageSelector, UsageStatistics};

/// Lock-guarded pool handle. Cursor advancement and timestamp appends happen
/// under the lock, so concurrent orchestrators see a consistent rotation.
pub type SharedKeyPool = Arc<Mutex<KeyPool>>;

/// Wrap a pool for sharing.
pub fn shared(pool: KeyPool) -> SharedKeyPool {
    Arc::new(Mutex::new(pool))
}
