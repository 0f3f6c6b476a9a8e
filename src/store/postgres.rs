//! Postgres-backed store implementation.

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::{PurgeItem, TagRecord, truncate_url, url_hash};

use super::{StoreError, TagStore};

#[derive(sqlx::FromRow)]
struct TagRow {
    id: Uuid,
    model: String,
    tag: String,
    url_id: Uuid,
    obsolete: bool,
}

impl From<TagRow> for TagRecord {
    fn from(row: TagRow) -> Self {
        Self {
            id: row.id,
            model: row.model,
            tag: row.tag,
            url_id: row.url_id,
            obsolete: row.obsolete,
        }
    }
}

/// [`TagStore`] implementation on top of the `cdn_cache_tags` and
/// `cdn_cache_urls` tables (see `migrations/`).
#[derive(Clone)]
pub struct PostgresTagStore {
    pool: PgPool,
}

impl PostgresTagStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(StoreError::backend)
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(StoreError::backend)
    }
}

#[async_trait]
impl TagStore for PostgresTagStore {
    async fn store_cache_tags(
        &self,
        models: &[String],
        tag: &str,
        url: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;
        let now = OffsetDateTime::now_utc();

        let url_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO cdn_cache_urls (id, url, url_hash, hits, created_at, updated_at)
            VALUES ($1, $2, $3, 1, $4, $4)
            ON CONFLICT (url_hash) DO UPDATE
                SET hits = cdn_cache_urls.hits + 1,
                    updated_at = $4
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(truncate_url(url))
        .bind(url_hash(url))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        for model in models {
            sqlx::query(
                r#"
                INSERT INTO cdn_cache_tags (id, model, tag, url_id, obsolete, created_at, updated_at)
                VALUES ($1, $2, $3, $4, FALSE, $5, $5)
                ON CONFLICT (model, tag, url_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(model)
            .bind(tag)
            .bind(url_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        }

        tx.commit().await.map_err(StoreError::backend)
    }

    async fn tags_for_model(&self, model_tag: &str) -> Result<Vec<TagRecord>, StoreError> {
        let rows: Vec<TagRow> = sqlx::query_as(
            r#"
            SELECT id, model, tag, url_id, obsolete
            FROM cdn_cache_tags
            WHERE model = $1
            ORDER BY created_at
            "#,
        )
        .bind(model_tag)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(rows.into_iter().map(TagRecord::from).collect())
    }

    async fn purge_items_for_tags(&self, tags: &[String]) -> Result<Vec<PurgeItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT t.tag, u.url
            FROM cdn_cache_tags t
            INNER JOIN cdn_cache_urls u ON u.id = t.url_id
            WHERE t.tag = ANY($1)
            "#,
        )
        .bind(tags)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(rows
            .into_iter()
            .map(|row| PurgeItem::new(row.get::<String, _>("tag"), row.get::<String, _>("url")))
            .collect())
    }

    async fn count_obsolete(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cdn_cache_tags WHERE obsolete = TRUE")
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::backend)?;

        u64::try_from(count).map_err(|_| StoreError::integrity("negative obsolete count"))
    }

    async fn obsolete_tags(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar("SELECT DISTINCT tag FROM cdn_cache_tags WHERE obsolete = TRUE")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)
    }

    async fn mark_obsolete(&self, tags: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cdn_cache_tags
            SET obsolete = TRUE, updated_at = now()
            WHERE tag = ANY($1) AND obsolete = FALSE
            "#,
        )
        .bind(tags)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(result.rows_affected())
    }

    async fn mark_tags_purged(&self, tags: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        sqlx::query(
            r#"
            UPDATE cdn_cache_tags
            SET obsolete = FALSE, updated_at = now()
            WHERE tag = ANY($1)
            "#,
        )
        .bind(tags)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        sqlx::query(
            r#"
            UPDATE cdn_cache_urls
            SET was_purged_at = now(), updated_at = now()
            WHERE id IN (
                SELECT url_id FROM cdn_cache_tags WHERE tag = ANY($1)
            )
            "#,
        )
        .bind(tags)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        tx.commit().await.map_err(StoreError::backend)
    }

    async fn purge_everything(&self) -> Result<(), StoreError> {
        // One transaction: a connectivity drop mid-way must not leave the
        // store half-reconciled.
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        sqlx::query("TRUNCATE cdn_cache_tags")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;

        sqlx::query("UPDATE cdn_cache_urls SET was_purged_at = now(), updated_at = now()")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;

        tx.commit().await.map_err(StoreError::backend)
    }
}
