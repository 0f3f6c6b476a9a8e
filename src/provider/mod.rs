//! CDN provider adapter contract.
//!
//! Every backend implements exactly two purge operations. Adapters never let
//! network or auth errors escape the boundary: failures are caught, logged
//! with the attempted item set, and reported as `false`.

pub mod http;

pub use http::HttpPurgeProvider;

use async_trait::async_trait;

use crate::domain::PurgeItem;

/// Uniform invalidation contract implemented once per CDN backend.
#[async_trait]
pub trait CdnProvider: Send + Sync {
    /// Purge the given items. Returns whether the provider accepted the
    /// request; an empty item set is the caller's concern, not the
    /// adapter's.
    async fn invalidate(&self, items: &[PurgeItem]) -> bool;

    /// Purge the entire cache.
    async fn invalidate_all(&self) -> bool;

    /// True for providers where any deep purge request is internally treated
    /// as "purge everything". Reconciliation then clears the whole tag store
    /// regardless of which tags were dispatched.
    fn purges_entire_cache(&self) -> bool {
        false
    }
}
