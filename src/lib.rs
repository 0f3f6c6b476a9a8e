//! tagpurge
//!
//! Tracks which cached URLs depend on which content tags, and coordinates
//! invalidation of a CDN when the content behind those tags changes.
//!
//! The crate is organized around four pieces:
//!
//! - **[`TagRegistry`]**: per-request collection of tags observed while a
//!   response is produced, with per-cycle dedup of repeated models.
//! - **[`TagStore`]**: durable tag/URL association store. A Postgres
//!   implementation ([`store::PostgresTagStore`]) and an in-memory one
//!   ([`store::MemoryTagStore`]) are provided.
//! - **[`CdnProvider`]**: the two-operation purge contract each CDN backend
//!   implements. A generic HTTP adapter ships in [`provider::http`].
//! - **[`InvalidationCoordinator`]**: decides between immediate, batched and
//!   full-cache invalidation, drives the full-purge retry loop, and
//!   reconciles store state after successful purges.
//!
//! ## Configuration
//!
//! Behavior is controlled via `tagpurge.toml` (and `TAGPURGE__*` environment
//! variables):
//!
//! ```toml
//! enabled = true
//! environment = "production"
//!
//! [invalidation]
//! mode = "batch"
//! max_batch_tags = 2500
//! site_roots = ["/", "/index.html"]
//!
//! [tags]
//! format = "app-%environment%-%sha1%"
//! excluded = ["telescope*"]
//! ```

pub mod config;
pub mod coordinator;
pub mod domain;
pub mod jobs;
mod lock;
pub mod provider;
pub mod registry;
pub mod store;
pub mod telemetry;

pub use config::{InvalidationMode, Settings};
pub use coordinator::{FullPurge, InvalidationCoordinator};
pub use domain::{CacheTagSource, PurgeItem, TagRecord, UrlRecord};
pub use jobs::{InvalidationCommand, InvalidationQueue, InvalidationWorkerContext};
pub use provider::CdnProvider;
pub use registry::TagRegistry;
pub use store::{StoreError, TagStore};
