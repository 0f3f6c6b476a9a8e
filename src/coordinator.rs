//! Invalidation coordinator.
//!
//! The central engine: decides between immediate, batched and full-cache
//! invalidation, drives the full-purge retry loop, and reconciles store
//! state after a provider call succeeds.
//!
//! Provider failures never propagate as errors; the obsolete/purge-timestamp
//! state in the store stays an accurate reflection of what still needs
//! purging, so a later flush retries the work. Only store failures are hard
//! errors, since they mean no progress can be made at all.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use crate::config::{InvalidationMode, Settings};
use crate::domain::{CacheTagSource, PurgeItem};
use crate::provider::CdnProvider;
use crate::store::{StoreError, TagStore};
use crate::telemetry::{
    METRIC_DISPATCH_TOTAL, METRIC_FULL_PURGE_TOTAL, METRIC_OBSOLETE_BACKLOG,
    METRIC_PROVIDER_FAILURE_TOTAL,
};

/// Total attempts for a full-cache purge.
pub const FULL_PURGE_ATTEMPTS: u32 = 3;
/// Fixed delay between full-purge attempts.
pub const FULL_PURGE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Outcome of a full-cache purge cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullPurge {
    /// The provider accepted the purge and the store was reconciled.
    Purged,
    /// Every attempt failed; the store was left untouched.
    Exhausted,
}

pub struct InvalidationCoordinator {
    settings: Arc<Settings>,
    store: Arc<dyn TagStore>,
    provider: Arc<dyn CdnProvider>,
}

impl InvalidationCoordinator {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn TagStore>,
        provider: Arc<dyn CdnProvider>,
    ) -> Self {
        Self {
            settings,
            store,
            provider,
        }
    }

    /// Targeted invalidation for one model: always immediate, regardless of
    /// the configured mode.
    pub async fn invalidate_model(&self, model: &dyn CacheTagSource) -> Result<(), StoreError> {
        if !self.settings.enabled {
            return Ok(());
        }

        match model.cache_tag() {
            Some(tag) if !tag.is_empty() => self.invalidate_model_tag(&tag).await,
            _ => Ok(()),
        }
    }

    /// Targeted invalidation by a model's extracted tag.
    pub async fn invalidate_model_tag(&self, model_tag: &str) -> Result<(), StoreError> {
        if !self.settings.enabled {
            return Ok(());
        }

        let rows = self.store.tags_for_model(model_tag).await?;
        if rows.is_empty() {
            debug!(model_tag, "no associations for model, nothing to invalidate");
            return Ok(());
        }

        let mut tags: Vec<String> = Vec::new();
        for row in &rows {
            if !tags.contains(&row.tag) {
                tags.push(row.tag.clone());
            }
        }

        debug!(
            model_tag,
            found = rows.len(),
            distinct = tags.len(),
            "invalidating associations for model"
        );

        self.dispatch(&tags).await
    }

    /// Explicit tag invalidation. An empty set delegates to the obsolete-tag
    /// flush; in `batch` mode the named tags only accumulate for the next
    /// flush.
    pub async fn invalidate_tags(&self, tags: &[String]) -> Result<(), StoreError> {
        if !self.settings.enabled {
            return Ok(());
        }

        if tags.is_empty() {
            return self.flush_obsolete().await;
        }

        if self.settings.invalidation.mode == InvalidationMode::Batch {
            let marked = self.store.mark_obsolete(tags).await?;
            debug!(requested = tags.len(), marked, "tags marked for batched purge");
            return Ok(());
        }

        self.dispatch(tags).await
    }

    /// Flush the obsolete-tag backlog, escalating to a full purge when it
    /// exceeds the configured batch maximum.
    pub async fn flush_obsolete(&self) -> Result<(), StoreError> {
        if !self.settings.enabled {
            return Ok(());
        }

        let backlog = self.store.count_obsolete().await?;
        gauge!(METRIC_OBSOLETE_BACKLOG).set(backlog as f64);

        if backlog == 0 {
            debug!("no obsolete tags to flush");
            return Ok(());
        }

        if backlog as usize > self.settings.invalidation.max_batch_tags {
            info!(
                backlog,
                max_batch_tags = self.settings.invalidation.max_batch_tags,
                "obsolete backlog exceeds batch maximum, escalating to full purge"
            );
            return self.purge_site_roots().await;
        }

        let tags = self.store.obsolete_tags().await?;
        self.dispatch(&tags).await
    }

    /// Full-cache purge with a bounded retry loop: up to
    /// [`FULL_PURGE_ATTEMPTS`] attempts, suspending
    /// [`FULL_PURGE_RETRY_DELAY`] between attempts, stopping at the first
    /// success. The store is only touched after the loop concludes, and only
    /// on the success path.
    pub async fn invalidate_all(&self) -> Result<FullPurge, StoreError> {
        if !self.settings.enabled {
            return Ok(FullPurge::Purged);
        }

        let mut success = false;
        for attempt in 1..=FULL_PURGE_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(FULL_PURGE_RETRY_DELAY).await;
            }

            if self.provider.invalidate_all().await {
                success = true;
                break;
            }

            counter!(METRIC_PROVIDER_FAILURE_TOTAL).increment(1);
            warn!(attempt, "full purge attempt failed");
        }

        if !success {
            error!(
                attempts = FULL_PURGE_ATTEMPTS,
                "full purge exhausted all attempts, store left unchanged"
            );
            return Ok(FullPurge::Exhausted);
        }

        counter!(METRIC_FULL_PURGE_TOTAL).increment(1);
        self.store.purge_everything().await?;
        info!("full purge succeeded, tag store truncated");
        Ok(FullPurge::Purged)
    }

    /// Dispatch the named tags to the provider and reconcile on success.
    async fn dispatch(&self, tags: &[String]) -> Result<(), StoreError> {
        if tags.is_empty() {
            return Ok(());
        }

        let items = self.store.purge_items_for_tags(tags).await?;
        if items.is_empty() {
            debug!(tags = ?tags, "no cached URLs behind tags, nothing to purge");
            return Ok(());
        }

        counter!(METRIC_DISPATCH_TOTAL).increment(1);
        if !self.provider.invalidate(&items).await {
            counter!(METRIC_PROVIDER_FAILURE_TOTAL).increment(1);
            warn!(
                item_count = items.len(),
                "provider rejected purge, tags stay pending"
            );
            return Ok(());
        }

        if self.provider.purges_entire_cache() {
            self.store.purge_everything().await
        } else {
            self.store.mark_tags_purged(tags).await
        }
    }

    /// Full-purge fallback through the configured site roots; providers
    /// without a roots configuration fall back to the retrying
    /// [`invalidate_all`](Self::invalidate_all).
    async fn purge_site_roots(&self) -> Result<(), StoreError> {
        let roots = &self.settings.invalidation.site_roots;
        if roots.is_empty() {
            return self.invalidate_all().await.map(|_| ());
        }

        let items: Vec<PurgeItem> = roots
            .iter()
            .map(|root| PurgeItem::new(root.clone(), root.clone()))
            .collect();

        counter!(METRIC_FULL_PURGE_TOTAL).increment(1);
        if !self.provider.invalidate(&items).await {
            counter!(METRIC_PROVIDER_FAILURE_TOTAL).increment(1);
            warn!("site-root purge rejected, obsolete backlog retained");
            return Ok(());
        }

        self.store.purge_everything().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::MemoryTagStore;

    #[derive(Default)]
    struct ScriptedProvider {
        /// Scripted results for `invalidate`; defaults to success when empty.
        results: Mutex<VecDeque<bool>>,
        /// Scripted results for `invalidate_all`; defaults to success.
        all_results: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<Vec<PurgeItem>>>,
        all_calls: AtomicUsize,
        full_purge_provider: bool,
    }

    impl ScriptedProvider {
        fn failing_all(failures: usize, then: bool) -> Self {
            let mut script = VecDeque::new();
            for _ in 0..failures {
                script.push_back(false);
            }
            script.push_back(then);
            Self {
                all_results: Mutex::new(script),
                ..Self::default()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn last_call(&self) -> Vec<PurgeItem> {
            self.calls.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl CdnProvider for ScriptedProvider {
        async fn invalidate(&self, items: &[PurgeItem]) -> bool {
            self.calls.lock().unwrap().push(items.to_vec());
            self.results.lock().unwrap().pop_front().unwrap_or(true)
        }

        async fn invalidate_all(&self) -> bool {
            self.all_calls.fetch_add(1, Ordering::SeqCst);
            self.all_results.lock().unwrap().pop_front().unwrap_or(true)
        }

        fn purges_entire_cache(&self) -> bool {
            self.full_purge_provider
        }
    }

    fn coordinator(
        settings: Settings,
        provider: ScriptedProvider,
    ) -> (InvalidationCoordinator, Arc<MemoryTagStore>, Arc<ScriptedProvider>) {
        let store = Arc::new(MemoryTagStore::new());
        let provider = Arc::new(provider);
        let coordinator = InvalidationCoordinator::new(
            Arc::new(settings),
            store.clone(),
            provider.clone(),
        );
        (coordinator, store, provider)
    }

    async fn seed(store: &MemoryTagStore, model: &str, tag: &str, url: &str) {
        store
            .store_cache_tags(&[model.to_string()], tag, url)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn targeted_invalidation_with_no_matches_is_a_no_op() {
        let (coordinator, store, provider) =
            coordinator(Settings::default(), ScriptedProvider::default());
        seed(&store, "post-1", "resp-a", "/a").await;

        coordinator.invalidate_model_tag("page-9").await.unwrap();

        assert_eq!(provider.call_count(), 0);
        assert!(store.urls()[0].was_purged_at.is_none());
    }

    #[tokio::test]
    async fn targeted_invalidation_dispatches_and_reconciles() {
        let (coordinator, store, provider) =
            coordinator(Settings::default(), ScriptedProvider::default());
        seed(&store, "post-1", "resp-a", "/a").await;
        seed(&store, "post-1", "resp-b", "/b").await;
        seed(&store, "page-2", "resp-c", "/c").await;

        coordinator.invalidate_model_tag("post-1").await.unwrap();

        assert_eq!(provider.call_count(), 1);
        let mut purged: Vec<String> =
            provider.last_call().into_iter().map(|i| i.url).collect();
        purged.sort();
        assert_eq!(purged, vec!["/a".to_string(), "/b".to_string()]);

        let urls = store.urls();
        assert!(urls.iter().find(|u| u.url == "/a").unwrap().was_purged_at.is_some());
        assert!(urls.iter().find(|u| u.url == "/c").unwrap().was_purged_at.is_none());
    }

    #[tokio::test]
    async fn immediate_mode_dispatches_named_tags_now() {
        let (coordinator, store, provider) =
            coordinator(Settings::default(), ScriptedProvider::default());
        seed(&store, "post-1", "resp-a", "/a").await;

        coordinator
            .invalidate_tags(&["resp-a".to_string()])
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 1);
        assert!(store.urls()[0].was_purged_at.is_some());
    }

    #[tokio::test]
    async fn batch_mode_accumulates_instead_of_dispatching() {
        let mut settings = Settings::default();
        settings.invalidation.mode = InvalidationMode::Batch;
        let (coordinator, store, provider) = coordinator(settings, ScriptedProvider::default());
        seed(&store, "post-1", "resp-a", "/a").await;

        coordinator
            .invalidate_tags(&["resp-a".to_string()])
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 0);
        assert_eq!(store.count_obsolete().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_tag_set_flushes_the_backlog() {
        let (coordinator, store, provider) =
            coordinator(Settings::default(), ScriptedProvider::default());
        seed(&store, "post-1", "resp-a", "/a").await;
        store.mark_obsolete(&["resp-a".to_string()]).await.unwrap();

        coordinator.invalidate_tags(&[]).await.unwrap();

        assert_eq!(provider.call_count(), 1);
        assert_eq!(store.count_obsolete().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flush_below_threshold_dispatches_the_obsolete_set() {
        let mut settings = Settings::default();
        settings.invalidation.max_batch_tags = 5;
        let (coordinator, store, provider) = coordinator(settings, ScriptedProvider::default());
        for n in 0..3 {
            seed(&store, &format!("post-{n}"), &format!("resp-{n}"), &format!("/{n}")).await;
        }
        store
            .mark_obsolete(&["resp-0".to_string(), "resp-1".to_string()])
            .await
            .unwrap();

        coordinator.flush_obsolete().await.unwrap();

        assert_eq!(provider.call_count(), 1);
        assert_eq!(provider.last_call().len(), 2);
        assert_eq!(store.count_obsolete().await.unwrap(), 0);
        // resp-2 was never obsolete and keeps its rows.
        assert_eq!(store.tags().len(), 3);
    }

    #[tokio::test]
    async fn flush_above_threshold_escalates_to_full_purge() {
        let mut settings = Settings::default();
        settings.invalidation.max_batch_tags = 5;
        settings.invalidation.site_roots = vec!["/".to_string(), "/index.html".to_string()];
        let (coordinator, store, provider) = coordinator(settings, ScriptedProvider::default());

        let tags: Vec<String> = (0..6).map(|n| format!("resp-{n}")).collect();
        for tag in &tags {
            seed(&store, "post-1", tag, &format!("/{tag}")).await;
        }
        store.mark_obsolete(&tags).await.unwrap();

        coordinator.flush_obsolete().await.unwrap();

        // One site-roots call, not a 6-item batch call.
        assert_eq!(provider.call_count(), 1);
        let call = provider.last_call();
        assert_eq!(
            call,
            vec![PurgeItem::new("/", "/"), PurgeItem::new("/index.html", "/index.html")]
        );
        assert!(store.tags().is_empty());
        assert!(store.urls().iter().all(|u| u.was_purged_at.is_some()));
    }

    #[tokio::test]
    async fn escalation_without_site_roots_falls_back_to_invalidate_all() {
        let mut settings = Settings::default();
        settings.invalidation.max_batch_tags = 1;
        settings.invalidation.site_roots = Vec::new();
        let (coordinator, store, provider) = coordinator(settings, ScriptedProvider::default());

        let tags: Vec<String> = (0..2).map(|n| format!("resp-{n}")).collect();
        for tag in &tags {
            seed(&store, "post-1", tag, &format!("/{tag}")).await;
        }
        store.mark_obsolete(&tags).await.unwrap();

        coordinator.flush_obsolete().await.unwrap();

        assert_eq!(provider.all_calls.load(Ordering::SeqCst), 1);
        assert!(store.tags().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_purge_retries_with_fixed_delay_until_success() {
        let (coordinator, store, provider) =
            coordinator(Settings::default(), ScriptedProvider::failing_all(2, true));
        seed(&store, "post-1", "resp-a", "/a").await;

        let started = tokio::time::Instant::now();
        let outcome = coordinator.invalidate_all().await.unwrap();

        assert_eq!(outcome, FullPurge::Purged);
        assert_eq!(provider.all_calls.load(Ordering::SeqCst), 3);
        // Two intervening waits of the fixed delay.
        assert_eq!(started.elapsed(), FULL_PURGE_RETRY_DELAY * 2);
        assert!(store.tags().is_empty());
        assert!(store.urls()[0].was_purged_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn full_purge_exhaustion_leaves_the_store_unchanged() {
        let (coordinator, store, provider) =
            coordinator(Settings::default(), ScriptedProvider::failing_all(3, false));
        seed(&store, "post-1", "resp-a", "/a").await;
        store.mark_obsolete(&["resp-a".to_string()]).await.unwrap();

        let outcome = coordinator.invalidate_all().await.unwrap();

        assert_eq!(outcome, FullPurge::Exhausted);
        assert_eq!(provider.all_calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.tags().len(), 1);
        assert_eq!(store.count_obsolete().await.unwrap(), 1);
        assert!(store.urls()[0].was_purged_at.is_none());
    }

    #[tokio::test]
    async fn full_invalidation_flag_clears_everything_on_scoped_dispatch() {
        let provider = ScriptedProvider {
            full_purge_provider: true,
            ..ScriptedProvider::default()
        };
        let (coordinator, store, _provider) = coordinator(Settings::default(), provider);
        seed(&store, "post-1", "resp-a", "/a").await;
        seed(&store, "page-2", "resp-b", "/b").await;

        coordinator
            .invalidate_tags(&["resp-a".to_string()])
            .await
            .unwrap();

        assert!(store.tags().is_empty());
        assert!(store.urls().iter().all(|u| u.was_purged_at.is_some()));
    }

    #[tokio::test]
    async fn rejected_dispatch_keeps_tags_pending() {
        let provider = ScriptedProvider {
            results: Mutex::new(VecDeque::from([false])),
            ..ScriptedProvider::default()
        };
        let mut settings = Settings::default();
        settings.invalidation.mode = InvalidationMode::Batch;
        let (coordinator, store, provider) = coordinator(settings, provider);
        seed(&store, "post-1", "resp-a", "/a").await;
        store.mark_obsolete(&["resp-a".to_string()]).await.unwrap();

        coordinator.flush_obsolete().await.unwrap();

        assert_eq!(provider.call_count(), 1);
        assert_eq!(store.count_obsolete().await.unwrap(), 1);
        assert!(store.urls()[0].was_purged_at.is_none());
    }

    #[tokio::test]
    async fn disabled_gate_generates_no_traffic() {
        let settings = Settings {
            enabled: false,
            ..Settings::default()
        };
        let (coordinator, store, provider) = coordinator(settings, ScriptedProvider::default());
        seed(&store, "post-1", "resp-a", "/a").await;

        coordinator
            .invalidate_tags(&["resp-a".to_string()])
            .await
            .unwrap();
        coordinator.invalidate_model_tag("post-1").await.unwrap();
        coordinator.flush_obsolete().await.unwrap();
        coordinator.invalidate_all().await.unwrap();

        assert_eq!(provider.call_count(), 0);
        assert_eq!(provider.all_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.tags().len(), 1);
    }
}
