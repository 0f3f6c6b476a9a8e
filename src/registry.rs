//! Per-request tag registry.
//!
//! One registry instance lives for exactly one request/response cycle. It
//! collects the tags of every model touched while the response is produced,
//! deduplicating both repeated tag values and repeated model instances, and
//! derives the response-level cache tag at commit time.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Settings;
use crate::domain::{CacheTagSource, content_hash};
use crate::jobs::{InvalidationCommand, InvalidationQueue};

const ENVIRONMENT_PLACEHOLDER: &str = "%environment%";
const HASH_PLACEHOLDERS: [&str; 2] = ["%sha1%", "%hash%"];

/// Collects cache tags for the current response cycle.
///
/// Not shared across requests; the processed-model cache is discarded with
/// the registry at end of cycle.
pub struct TagRegistry {
    settings: Arc<Settings>,
    queue: Arc<dyn InvalidationQueue>,
    tags: Vec<String>,
    /// `"{kind}-{id}"` keys of models already evaluated this cycle.
    processed: HashSet<String>,
}

impl TagRegistry {
    pub fn new(settings: Arc<Settings>, queue: Arc<dyn InvalidationQueue>) -> Self {
        Self {
            settings,
            queue,
            tags: Vec::new(),
            processed: HashSet::new(),
        }
    }

    /// Record the model's cache tag, once per model instance per cycle.
    ///
    /// Models without a durable identity are skipped and re-evaluated on
    /// later calls, since their identity may still be assigned before the
    /// cycle ends. Models without a tag contribute nothing.
    pub fn add_tag(&mut self, model: &dyn CacheTagSource) {
        if !self.settings.enabled {
            return;
        }

        let Some(id) = model.identity() else {
            return;
        };

        let key = format!("{}-{}", model.storage_kind(), id);
        if self.processed.contains(&key) {
            return;
        }
        self.processed.insert(key);

        let Some(tag) = model.cache_tag().filter(|tag| !tag.is_empty()) else {
            return;
        };

        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    /// The collected tags, minus exclusions, in insertion order.
    pub fn tags(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|tag| !self.settings.tag_is_excluded(tag))
            .cloned()
            .collect()
    }

    /// Derive the response-level cache tag from the collected set.
    ///
    /// When the response is cachable, the (tags, derived tag, request URL)
    /// triple is handed to the queue for asynchronous persistence; that side
    /// effect is fire and forget and never fails the caller.
    pub async fn tags_hash(&self, response_is_cachable: bool, request_url: &str) -> String {
        let models = self.tags();
        let digest = content_hash(&models.join(", "));

        let mut tag = self
            .settings
            .tags
            .format
            .replace(ENVIRONMENT_PLACEHOLDER, &self.settings.environment);
        for placeholder in HASH_PLACEHOLDERS {
            tag = tag.replace(placeholder, &digest);
        }

        if response_is_cachable && self.settings.enabled {
            let command = InvalidationCommand::StoreTags {
                models,
                tag: tag.clone(),
                url: request_url.to_string(),
            };
            if let Err(err) = self.queue.enqueue(command).await {
                warn!(error = %err, url = request_url, "failed to enqueue tag persistence");
            } else {
                debug!(url = request_url, "queued tag persistence");
            }
        }

        tag
    }
}
