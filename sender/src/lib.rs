// SPDX-License-Identifier: MPL-2.0

use anyhow::{Context, Error};
use tracing_subscriber::prelude::*;

pub mod app;
pub mod pipeline;
pub mod signaller;

/// Tracing setup shared by the two sender binaries.
pub fn initialize_logging(envvar_name: &str) -> Result<(), Error> {
    tracing_log::LogTracer::init().context("Setting logger")?;
    let env_filter = tracing_subscriber::EnvFilter::try_from_env(envvar_name)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_target(true)
        .with_span_events(
            tracing_subscriber::fmt::format::FmtSpan::NEW
                | tracing_subscriber::fmt::format::FmtSpan::CLOSE,
        );
    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).context("Setting tracing subscriber")?;

    Ok(())
}
