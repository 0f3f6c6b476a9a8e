//! In-memory store for tests and embedded use.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::{PurgeItem, TagRecord, UrlRecord, truncate_url, url_hash};
use crate::lock::mutex_lock;

use super::{StoreError, TagStore};

const SOURCE: &str = "store::memory";

#[derive(Default)]
struct MemoryState {
    urls: Vec<UrlRecord>,
    tags: Vec<TagRecord>,
}

/// [`TagStore`] implementation backed by process memory.
///
/// Mirrors the Postgres implementation's semantics row for row; used by the
/// test suite and by embedders that do not need durability.
#[derive(Default)]
pub struct MemoryTagStore {
    state: Mutex<MemoryState>,
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all URL rows, for inspection in tests.
    pub fn urls(&self) -> Vec<UrlRecord> {
        mutex_lock(&self.state, SOURCE, "urls").urls.clone()
    }

    /// Snapshot of all association rows, for inspection in tests.
    pub fn tags(&self) -> Vec<TagRecord> {
        mutex_lock(&self.state, SOURCE, "tags").tags.clone()
    }
}

#[async_trait]
impl TagStore for MemoryTagStore {
    async fn store_cache_tags(
        &self,
        models: &[String],
        tag: &str,
        url: &str,
    ) -> Result<(), StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "store_cache_tags");
        let hash = url_hash(url);

        let url_id = match state.urls.iter().position(|row| row.url_hash == hash) {
            Some(index) => {
                let row = &mut state.urls[index];
                row.hits += 1;
                row.id
            }
            None => {
                let id = Uuid::new_v4();
                state.urls.push(UrlRecord {
                    id,
                    url: truncate_url(url),
                    url_hash: hash,
                    hits: 1,
                    was_purged_at: None,
                });
                id
            }
        };

        for model in models {
            let exists = state
                .tags
                .iter()
                .any(|row| row.model == *model && row.tag == tag && row.url_id == url_id);
            if !exists {
                state.tags.push(TagRecord {
                    id: Uuid::new_v4(),
                    model: model.clone(),
                    tag: tag.to_string(),
                    url_id,
                    obsolete: false,
                });
            }
        }

        Ok(())
    }

    async fn tags_for_model(&self, model_tag: &str) -> Result<Vec<TagRecord>, StoreError> {
        let state = mutex_lock(&self.state, SOURCE, "tags_for_model");
        Ok(state
            .tags
            .iter()
            .filter(|row| row.model == model_tag)
            .cloned()
            .collect())
    }

    async fn purge_items_for_tags(&self, tags: &[String]) -> Result<Vec<PurgeItem>, StoreError> {
        let state = mutex_lock(&self.state, SOURCE, "purge_items_for_tags");
        let wanted: HashSet<&str> = tags.iter().map(String::as_str).collect();

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for row in state.tags.iter().filter(|row| wanted.contains(row.tag.as_str())) {
            let Some(url) = state.urls.iter().find(|u| u.id == row.url_id) else {
                continue;
            };
            let item = PurgeItem::new(row.tag.clone(), url.url.clone());
            if seen.insert(item.clone()) {
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn count_obsolete(&self) -> Result<u64, StoreError> {
        let state = mutex_lock(&self.state, SOURCE, "count_obsolete");
        Ok(state.tags.iter().filter(|row| row.obsolete).count() as u64)
    }

    async fn obsolete_tags(&self) -> Result<Vec<String>, StoreError> {
        let state = mutex_lock(&self.state, SOURCE, "obsolete_tags");
        let mut seen = HashSet::new();
        let mut tags = Vec::new();
        for row in state.tags.iter().filter(|row| row.obsolete) {
            if seen.insert(row.tag.as_str()) {
                tags.push(row.tag.clone());
            }
        }
        Ok(tags)
    }

    async fn mark_obsolete(&self, tags: &[String]) -> Result<u64, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "mark_obsolete");
        let wanted: HashSet<&str> = tags.iter().map(String::as_str).collect();

        let mut updated = 0;
        for row in state
            .tags
            .iter_mut()
            .filter(|row| wanted.contains(row.tag.as_str()))
        {
            if !row.obsolete {
                row.obsolete = true;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn mark_tags_purged(&self, tags: &[String]) -> Result<(), StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "mark_tags_purged");
        let wanted: HashSet<&str> = tags.iter().map(String::as_str).collect();
        let now = OffsetDateTime::now_utc();

        let mut url_ids = HashSet::new();
        for row in state.tags.iter_mut() {
            if wanted.contains(row.tag.as_str()) {
                row.obsolete = false;
                url_ids.insert(row.url_id);
            }
        }
        for url in state.urls.iter_mut() {
            if url_ids.contains(&url.id) {
                url.was_purged_at = Some(now);
            }
        }
        Ok(())
    }

    async fn purge_everything(&self) -> Result<(), StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "purge_everything");
        let now = OffsetDateTime::now_utc();
        state.tags.clear();
        for url in state.urls.iter_mut() {
            url.was_purged_at = Some(now);
        }
        Ok(())
    }
}
