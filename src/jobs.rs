//! Background dispatch boundary.
//!
//! The registry and embedding applications publish fire-and-forget commands
//! to an [`InvalidationQueue`]; workers consume them and re-enter the
//! coordinator's entry points. Queue execution semantics (retry,
//! concurrency) belong to the job infrastructure, not to this crate.

use std::sync::Arc;

use apalis::layers::WorkerBuilderExt;
use apalis::prelude::{Data, Error as ApalisError, Monitor, WorkerBuilder, WorkerFactoryFn};
use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::coordinator::InvalidationCoordinator;
use crate::store::TagStore;

/// Namespace for durable invalidation jobs.
pub const JOB_NAMESPACE: &str = "tagpurge::invalidation";

const JOB_MAX_ATTEMPTS: i32 = 5;
const JOB_PRIORITY: i32 = 0;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("queue is closed")]
    Closed,
}

impl QueueError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// The two job shapes consumed by this crate, plus tag persistence from the
/// response path. Each command simply re-enters the corresponding store or
/// coordinator entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InvalidationCommand {
    /// Persist a response's tag set against its URL.
    StoreTags {
        models: Vec<String>,
        tag: String,
        url: String,
    },
    /// Invalidate by tag list; an empty list flushes the obsolete backlog.
    InvalidateTags {
        #[serde(default)]
        tags: Vec<String>,
    },
    /// Targeted invalidation by a model's extracted tag.
    InvalidateModel { model_tag: String },
}

/// Fire-and-forget command sink.
#[async_trait]
pub trait InvalidationQueue: Send + Sync {
    async fn enqueue(&self, command: InvalidationCommand) -> Result<(), QueueError>;
}

/// In-process queue over an unbounded channel, for embedded deployments and
/// tests.
pub struct ChannelQueue {
    sender: UnboundedSender<InvalidationCommand>,
}

impl ChannelQueue {
    pub fn pair() -> (Self, UnboundedReceiver<InvalidationCommand>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl InvalidationQueue for ChannelQueue {
    async fn enqueue(&self, command: InvalidationCommand) -> Result<(), QueueError> {
        self.sender.send(command).map_err(|_| QueueError::Closed)
    }
}

/// Durable queue backed by the apalis Postgres job tables.
pub struct PostgresQueue {
    pool: PgPool,
}

impl PostgresQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvalidationQueue for PostgresQueue {
    async fn enqueue(&self, command: InvalidationCommand) -> Result<(), QueueError> {
        let payload = serde_json::to_value(&command).map_err(QueueError::backend)?;

        let job_id: String = sqlx::query_scalar(
            r#"
            SELECT (apalis.push_job($1, $2::json, $3, $4, $5, $6)).id
            "#,
        )
        .bind(JOB_NAMESPACE)
        .bind(payload)
        .bind("Pending")
        .bind(OffsetDateTime::now_utc())
        .bind(JOB_MAX_ATTEMPTS)
        .bind(JOB_PRIORITY)
        .fetch_one(&self.pool)
        .await
        .map_err(QueueError::backend)?;

        debug!(job_id = %job_id, "queued invalidation command");
        Ok(())
    }
}

/// Shared context passed to job workers.
#[derive(Clone)]
pub struct InvalidationWorkerContext {
    pub coordinator: Arc<InvalidationCoordinator>,
    pub store: Arc<dyn TagStore>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convert any error into an [`ApalisError::Failed`].
fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}

/// Execute one queued command by re-entering the coordinator.
pub async fn process_invalidation_command(
    command: InvalidationCommand,
    context: Data<InvalidationWorkerContext>,
) -> Result<(), ApalisError> {
    let ctx = &*context;
    handle_command(command, ctx).await
}

async fn handle_command(
    command: InvalidationCommand,
    ctx: &InvalidationWorkerContext,
) -> Result<(), ApalisError> {
    match command {
        InvalidationCommand::StoreTags { models, tag, url } => ctx
            .store
            .store_cache_tags(&models, &tag, &url)
            .await
            .map_err(job_failed),
        InvalidationCommand::InvalidateTags { tags } => ctx
            .coordinator
            .invalidate_tags(&tags)
            .await
            .map_err(job_failed),
        InvalidationCommand::InvalidateModel { model_tag } => ctx
            .coordinator
            .invalidate_model_tag(&model_tag)
            .await
            .map_err(job_failed),
    }
}

/// Spawn the durable worker for queued invalidation commands.
pub fn spawn_invalidation_worker(
    pool: PgPool,
    context: InvalidationWorkerContext,
    concurrency: usize,
) -> JoinHandle<()> {
    let storage =
        PostgresStorage::new_with_config(pool, ApalisSqlConfig::new(JOB_NAMESPACE));

    let worker = WorkerBuilder::new("tagpurge-invalidation-worker")
        .concurrency(concurrency)
        .data(context)
        .backend(storage)
        .build_fn(process_invalidation_command);

    let monitor = Monitor::new().register(worker);

    tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "invalidation worker monitor stopped");
        }
    })
}

/// Drain an in-process queue until its senders are dropped. Failed commands
/// are logged and skipped; the channel has no redelivery.
pub async fn run_channel_worker(
    mut receiver: UnboundedReceiver<InvalidationCommand>,
    context: InvalidationWorkerContext,
) {
    while let Some(command) = receiver.recv().await {
        if let Err(err) = handle_command(command, &context).await {
            error!(error = %err, "invalidation command failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::domain::PurgeItem;
    use crate::provider::CdnProvider;
    use crate::store::MemoryTagStore;

    struct AcceptingProvider;

    #[async_trait]
    impl CdnProvider for AcceptingProvider {
        async fn invalidate(&self, _items: &[PurgeItem]) -> bool {
            true
        }

        async fn invalidate_all(&self) -> bool {
            true
        }
    }

    fn context() -> (InvalidationWorkerContext, Arc<MemoryTagStore>) {
        let store = Arc::new(MemoryTagStore::new());
        let coordinator = Arc::new(InvalidationCoordinator::new(
            Arc::new(Settings::default()),
            store.clone(),
            Arc::new(AcceptingProvider),
        ));
        (
            InvalidationWorkerContext {
                coordinator,
                store: store.clone(),
            },
            store,
        )
    }

    #[tokio::test]
    async fn channel_queue_delivers_commands() {
        let (queue, mut receiver) = ChannelQueue::pair();

        queue
            .enqueue(InvalidationCommand::InvalidateModel {
                model_tag: "post-1".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(
            receiver.try_recv().unwrap(),
            InvalidationCommand::InvalidateModel { model_tag } if model_tag == "post-1"
        ));
    }

    #[tokio::test]
    async fn enqueue_fails_once_the_receiver_is_gone() {
        let (queue, receiver) = ChannelQueue::pair();
        drop(receiver);

        let result = queue
            .enqueue(InvalidationCommand::InvalidateTags { tags: Vec::new() })
            .await;

        assert!(matches!(result, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn store_tags_command_persists_associations() {
        let (ctx, store) = context();

        handle_command(
            InvalidationCommand::StoreTags {
                models: vec!["post-1".to_string()],
                tag: "resp-a".to_string(),
                url: "/a".to_string(),
            },
            &ctx,
        )
        .await
        .unwrap();

        assert_eq!(store.tags().len(), 1);
        assert_eq!(store.urls().len(), 1);
    }

    #[tokio::test]
    async fn invalidate_commands_re_enter_the_coordinator() {
        let (ctx, store) = context();
        store
            .store_cache_tags(&["post-1".to_string()], "resp-a", "/a")
            .await
            .unwrap();

        handle_command(
            InvalidationCommand::InvalidateModel {
                model_tag: "post-1".to_string(),
            },
            &ctx,
        )
        .await
        .unwrap();

        assert!(store.urls()[0].was_purged_at.is_some());
    }

    #[test]
    fn commands_round_trip_through_json() {
        let command = InvalidationCommand::InvalidateTags {
            tags: vec!["resp-a".to_string()],
        };
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains("invalidate_tags"));

        // Jobs queued without a tag list flush the backlog.
        let flush: InvalidationCommand =
            serde_json::from_str(r#"{"op":"invalidate_tags"}"#).unwrap();
        assert!(matches!(
            flush,
            InvalidationCommand::InvalidateTags { tags } if tags.is_empty()
        ));
    }
}
