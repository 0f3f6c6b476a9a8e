//! Durable tag/URL association store.
//!
//! The store is the single point of cross-cycle coordination. Every mutating
//! operation is expressed as a set-based update so that concurrent
//! invalidation cycles converge instead of racing destructively; at worst a
//! tag is purged twice, which is harmless.

mod memory;
mod postgres;

pub use memory::MemoryTagStore;
pub use postgres::PostgresTagStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{PurgeItem, TagRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store integrity error: {message}")]
    Integrity { message: String },
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

/// Persistence contract consumed by the registry and the coordinator.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Persist one cache-store event: upsert the URL row keyed by the hash of
    /// the full URL (`hits` starts at 1 and is bumped once per call), then
    /// upsert one association row per model kind. Idempotent at the row
    /// level: repeating identical arguments leaves exactly one association
    /// row per (model, tag, url).
    async fn store_cache_tags(
        &self,
        models: &[String],
        tag: &str,
        url: &str,
    ) -> Result<(), StoreError>;

    /// All association rows whose `model` column equals the given model tag.
    /// An empty result is a valid outcome, not an error.
    async fn tags_for_model(&self, model_tag: &str) -> Result<Vec<TagRecord>, StoreError>;

    /// Deduplicated (tag, url) pairs for the named tags, joined through the
    /// tag -> URL relation.
    async fn purge_items_for_tags(&self, tags: &[String]) -> Result<Vec<PurgeItem>, StoreError>;

    async fn count_obsolete(&self) -> Result<u64, StoreError>;

    /// Distinct tag values currently marked obsolete.
    async fn obsolete_tags(&self) -> Result<Vec<String>, StoreError>;

    /// Mark the named tags as awaiting a batched purge.
    async fn mark_obsolete(&self, tags: &[String]) -> Result<u64, StoreError>;

    /// Reconcile after a successful tag-scoped purge: clear `obsolete` on the
    /// named tags and stamp `was_purged_at` on every URL reachable through
    /// them.
    async fn mark_tags_purged(&self, tags: &[String]) -> Result<(), StoreError>;

    /// Reconcile after a successful full purge: delete every association row
    /// and stamp `was_purged_at` on every URL.
    async fn purge_everything(&self) -> Result<(), StoreError>;
}
