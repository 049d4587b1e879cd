//! Leased distributed locks over a shared key-value store.
//!
//! One lease key per job; the value is `<node id>:<nonce>` so release and
//! extend can be owner-checked without a read round trip. The store is the
//! source of truth; the per-node nonce table is advisory.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;
pub mod mock;
pub mod redis;

pub use self::memory::{MemoryLeaseBackend, MemoryLeaseStore};
pub use self::mock::MockLeaseStore;
pub use self::redis::RedisLeaseStore;

/// Atomic lease operations against a shared store. Implementations must be
/// safe for concurrent use across job controllers.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Attempt to acquire the lease for `job` with the given TTL.
    /// Returns false when another holder exists.
    async fn acquire(&self, job: &str, ttl: Duration) -> Result<bool>;

    /// Release the lease for `job` if this node still owns it. A lease that
    /// has already expired and been reissued elsewhere is left untouched;
    /// that case is success, not an error.
    async fn release(&self, job: &str) -> Result<()>;

    /// Refresh the TTL of an existing lease. Returns false when the lease
    /// is no longer owned by this node.
    async fn extend(&self, job: &str, ttl: Duration) -> Result<bool>;

    /// Release any resources held by the store client.
    async fn close(&self) -> Result<()>;
}
