//! Domain records and the tag-extraction capability.

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

/// Stored URLs are bounded to fit the storage column.
pub const MAX_URL_LEN: usize = 255;

/// A domain object that can contribute a cache tag.
///
/// Objects that do not produce a tag return `None` from [`cache_tag`]; a
/// failing extractor should swallow its own error and return `None` as well,
/// since extraction failures never propagate to the response path.
///
/// [`cache_tag`]: CacheTagSource::cache_tag
pub trait CacheTagSource {
    /// Storage kind of the object (table name or similar).
    fn storage_kind(&self) -> &str;

    /// Durable identifier, present once the object is persisted.
    fn identity(&self) -> Option<String>;

    /// The cache tag for this object, if any.
    fn cache_tag(&self) -> Option<String> {
        None
    }
}

/// One (model, tag, url) association row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub id: Uuid,
    /// The producing entity's own tag (the `model` column).
    pub model: String,
    /// The derived response-level tag this association belongs to.
    pub tag: String,
    pub url_id: Uuid,
    pub obsolete: bool,
}

/// One cached-resource row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRecord {
    pub id: Uuid,
    pub url: String,
    pub url_hash: String,
    pub hits: i64,
    pub was_purged_at: Option<OffsetDateTime>,
}

/// One item handed to a provider adapter: the tag plus the cached URL it
/// belongs to, so the adapter can map it to either identifier space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PurgeItem {
    pub tag: String,
    pub url: String,
}

impl PurgeItem {
    pub fn new(tag: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            url: url.into(),
        }
    }
}

/// Hex digest used for URL lookup keys and the joined-tag content hash.
pub fn content_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable lookup key for a full URL, so collisions never occur on the
/// truncated string.
pub fn url_hash(url: &str) -> String {
    content_hash(url)
}

/// Bound a URL to [`MAX_URL_LEN`] characters without splitting a char.
pub fn truncate_url(url: &str) -> String {
    if url.chars().count() <= MAX_URL_LEN {
        return url.to_string();
    }
    url.chars().take(MAX_URL_LEN).collect()
}
