//! Global tracing subscriber for binaries and demos.
//!
//! Library code only emits events; nothing in the layers installs a
//! subscriber. Filtering follows `RUST_LOG`, defaulting to `info`.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Install the fmt subscriber. Fails on a second call.
pub fn init_tracing() -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| InitError::Subscriber(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}
