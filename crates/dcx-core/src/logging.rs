//! Logging and observability
//!
//! This module provides structured logging, tracing, and observability utilities.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging system. Safe to call more than once (e.g. from both a binary's
/// `main` and its test harness); the second call is a no-op.
pub fn init() -> anyhow::Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_line_number(true)
        .with_file(true);

    // Captures a SpanTrace on error-context creation so `DcxError`'s source chain can be
    // reported with the span stack that produced it, not just the message.
    let error_layer = tracing_error::ErrorLayer::default();

    tracing_subscriber::registry()
        .with(filter)
        .with(error_layer)
        .with(fmt_layer)
        .init();

    tracing::info!("Logging initialized");
    Ok(())
}
