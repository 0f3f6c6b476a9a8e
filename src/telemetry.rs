//! Tracing and metric installation.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

pub(crate) const METRIC_DISPATCH_TOTAL: &str = "tagpurge_dispatch_total";
pub(crate) const METRIC_PROVIDER_FAILURE_TOTAL: &str = "tagpurge_provider_failure_total";
pub(crate) const METRIC_FULL_PURGE_TOTAL: &str = "tagpurge_full_purge_total";
pub(crate) const METRIC_OBSOLETE_BACKLOG: &str = "tagpurge_obsolete_backlog";

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Install a global tracing subscriber using the provided logging settings.
///
/// Embedding applications that install their own subscriber can skip this
/// and call [`describe_metrics`] alone.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_DISPATCH_TOTAL,
            Unit::Count,
            "Total number of tag-scoped purge dispatches to the CDN provider."
        );
        describe_counter!(
            METRIC_PROVIDER_FAILURE_TOTAL,
            Unit::Count,
            "Total number of provider purge calls reported as failed."
        );
        describe_counter!(
            METRIC_FULL_PURGE_TOTAL,
            Unit::Count,
            "Total number of full-cache purges dispatched."
        );
        describe_gauge!(
            METRIC_OBSOLETE_BACKLOG,
            Unit::Count,
            "Obsolete tag rows observed at the start of the latest flush."
        );
    });
}
