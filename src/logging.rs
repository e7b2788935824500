//! Tracing subscriber setup shared by both binaries.
//!
//! Output always goes to stderr: the runner's stdout carries the RPC channel.

use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

use crate::error::{Error, Result};

pub fn env_filter() -> EnvFilter {
    // RUST_LOG controls the level; default to info.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

fn log_layer<S>(structured: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if structured {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        );
    }

    Box::new(
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr),
    )
}

/// Installs the global subscriber. Fails if one is already set.
pub fn setup_tracing(structured: bool) -> Result<()> {
    let layer = log_layer(structured).with_filter(env_filter());
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}
