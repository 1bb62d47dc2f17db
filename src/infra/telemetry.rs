use std::{io, sync::Once};

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global subscriber. Logs go to stderr; `RUST_LOG` refines the
/// configured level.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("subscriber already installed: {err}")))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "texshot_render_total",
            Unit::Count,
            "Total number of admitted renders, labelled by outcome."
        );
        describe_counter!(
            "texshot_render_rejected_busy_total",
            Unit::Count,
            "Total number of render requests rejected because every slot was taken."
        );
        describe_gauge!(
            "texshot_render_in_flight",
            Unit::Count,
            "Current number of held render slots."
        );
        describe_histogram!(
            "texshot_render_duration_ms",
            Unit::Milliseconds,
            "End-to-end pipeline latency in milliseconds, workspace cleanup included."
        );
        describe_histogram!(
            "texshot_stage_duration_ms",
            Unit::Milliseconds,
            "Latency of a single external tool invocation, labelled by stage."
        );
    });
}
