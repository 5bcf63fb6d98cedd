//! stderr logging with a level the exchange can raise at runtime.

use mediation_core::{ConsentOverrides, SignalHandler};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Filter used when RUST_LOG is unset.
pub const DEFAULT_FILTER: &str = "info";

pub struct LogControl {
    filter: reload::Handle<EnvFilter, Registry>,
    base: String,
}

/// Install the global subscriber. RUST_LOG wins over `verbose`.
pub fn init(verbose: bool) -> anyhow::Result<LogControl> {
    let base = std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| if verbose { "debug" } else { DEFAULT_FILTER }.to_string());
    let (filter, handle) = reload::Layer::new(EnvFilter::try_new(&base)?);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()?;
    Ok(LogControl {
        filter: handle,
        base,
    })
}

impl LogControl {
    /// Switch to `debug`, or back to the startup filter.
    pub fn set_debug(&self, enabled: bool) -> anyhow::Result<()> {
        let directive = if enabled { "debug" } else { self.base.as_str() };
        let next = EnvFilter::try_new(directive)?;
        self.filter.modify(|f| *f = next)?;
        Ok(())
    }
}

impl SignalHandler for LogControl {
    fn on_consent_overrides(&self, overrides: &ConsentOverrides) {
        if overrides.any() {
            info!(?overrides, "exchange requested consent changes");
        }
    }

    fn on_debug_logging(&self, enabled: bool) {
        if let Err(e) = self.set_debug(enabled) {
            warn!(error = %e, "could not change log level");
        }
    }
}
