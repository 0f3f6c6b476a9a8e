//! Generic HTTP purge adapter.
//!
//! POSTs a deduplicated object list to a configured endpoint. Depending on
//! configuration the objects are the tag strings themselves (tag-aware CDNs)
//! or URL paths extracted from the stored URLs. Provider-specific signing
//! protocols are out of scope; an optional bearer token covers the common
//! case.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error};
use url::Url;

use crate::config::{InvalidateBy, ProviderSettings};
use crate::domain::PurgeItem;

use super::CdnProvider;

#[derive(Debug, Serialize)]
struct PurgeRequest<'a> {
    objects: &'a [String],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    everything: bool,
}

pub struct HttpPurgeProvider {
    settings: ProviderSettings,
    client: reqwest::Client,
}

impl HttpPurgeProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { settings, client }
    }

    /// Map an item to the identifier the endpoint expects, deduplicated by
    /// the caller.
    fn object_for(&self, item: &PurgeItem) -> String {
        match self.settings.invalidate_by {
            InvalidateBy::Tags => item.tag.clone(),
            InvalidateBy::Paths => invalidation_path(&item.url),
        }
    }

    async fn post_purge(&self, objects: &[String], everything: bool) -> bool {
        let request = self
            .client
            .post(&self.settings.endpoint)
            .json(&PurgeRequest {
                objects,
                everything,
            });

        let request = match &self.settings.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(
                    object_count = objects.len(),
                    everything, "purge request accepted"
                );
                true
            }
            Ok(response) => {
                error!(
                    status = %response.status(),
                    objects = ?objects,
                    "purge request rejected"
                );
                false
            }
            Err(err) => {
                error!(error = %err, objects = ?objects, "purge request failed");
                false
            }
        }
    }
}

/// Path component of a stored URL, `/` when the URL does not parse.
fn invalidation_path(url: &str) -> String {
    if url.starts_with('/') {
        return url.to_string();
    }
    Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| "/".to_string())
}

#[async_trait]
impl CdnProvider for HttpPurgeProvider {
    async fn invalidate(&self, items: &[PurgeItem]) -> bool {
        let mut seen = HashSet::new();
        let objects: Vec<String> = items
            .iter()
            .map(|item| self.object_for(item))
            .filter(|object| seen.insert(object.clone()))
            .collect();

        self.post_purge(&objects, false).await
    }

    async fn invalidate_all(&self) -> bool {
        self.post_purge(&[], true).await
    }

    fn purges_entire_cache(&self) -> bool {
        self.settings.purges_entire_cache
    }
}
