// mediation-cli: run one ad waterfall against a live exchange and print what it hands out.

mod config;
mod http;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use mediation_core::{
    AdCandidate, AdUnitContext, ErrorReason, MediationError, WaterfallListener,
    WaterfallOrchestrator,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

/// Time left for after-load pings to go out before the runtime stops.
const TRACKING_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "mediation-cli", version)]
#[command(about = "Run one ad waterfall and print each candidate", long_about = None)]
struct Args {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ad unit id, overrides the config
    #[arg(long)]
    ad_unit: Option<String>,

    /// Ad format (banner, interstitial, rewarded, native)
    #[arg(long)]
    format: Option<String>,

    /// Reject every candidate to see the whole waterfall
    #[arg(long)]
    walk: bool,

    #[arg(short, long)]
    verbose: bool,
}

enum Outcome {
    Candidate(AdCandidate),
    Error(MediationError),
}

struct ChannelListener(mpsc::UnboundedSender<Outcome>);

impl WaterfallListener for ChannelListener {
    fn on_candidate(&self, candidate: AdCandidate) {
        let _ = self.0.send(Outcome::Candidate(candidate));
    }

    fn on_error(&self, error: MediationError) {
        let _ = self.0.send(Outcome::Error(error));
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log = Arc::new(logging::init(args.verbose)?);

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(id) = args.ad_unit {
        cfg.ad_unit = Some(id);
    }
    if let Some(f) = args.format {
        cfg.format = f;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, args.walk, log))
}

async fn run(cfg: config::Config, walk: bool, log: Arc<logging::LogControl>) -> anyhow::Result<()> {
    let ad_unit = cfg
        .ad_unit
        .clone()
        .context("no ad unit: pass --ad-unit or set MEDIATION_AD_UNIT")?;
    let ctx = AdUnitContext::new(ad_unit.as_str(), cfg.ad_format()?);
    let url = cfg.ad_request_url(&ad_unit)?;
    let transport = Arc::new(http::ReqwestTransport::new(
        cfg.mediation().request_timeout,
        &cfg.user_agent,
    )?);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = WaterfallOrchestrator::builder(ctx, url, transport, Arc::new(ChannelListener(tx)))
        .signal_handler(log)
        .config(cfg.mediation())
        .build()?;

    info!(%ad_unit, format = %cfg.format, walk, "starting waterfall");
    orchestrator.next(None);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut delivered = 0usize;
    let result = loop {
        let outcome = tokio::select! {
            o = rx.recv() => o,
            r = &mut shutdown => {
                r?;
                info!("interrupted");
                break Ok(());
            }
        };
        let Some(outcome) = outcome else {
            break Ok(());
        };
        match outcome {
            Outcome::Candidate(candidate) => {
                delivered += 1;
                println!("{}", serde_json::to_string(&candidate)?);
                if walk {
                    orchestrator.next(Some(ErrorReason::AdapterNotFound));
                } else {
                    orchestrator.creative_download_success();
                    break Ok(());
                }
            }
            Outcome::Error(error) => {
                let refresh_ms = error.refresh_hint().map(|d| d.as_millis() as u64);
                println!(
                    "{}",
                    json!({ "error": error.reason(), "message": error.to_string(), "refresh_ms": refresh_ms })
                );
                if delivered == 0 {
                    break Err(anyhow!("no candidate for {}: {}", ad_unit, error));
                }
                info!(delivered, reason = %error.reason(), "waterfall finished");
                break Ok(());
            }
        }
    };

    tokio::time::sleep(TRACKING_GRACE).await;
    orchestrator.shutdown();
    result
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn args(v: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("mediation-cli").chain(v.iter().copied()))
    }

    #[test]
    fn flags_parse() {
        let a = args(&["--ad-unit", "abc", "--format", "native", "--walk", "--config", "/tmp/m.toml"]).unwrap();
        assert_eq!(a.ad_unit.as_deref(), Some("abc"));
        assert_eq!(a.format.as_deref(), Some("native"));
        assert!(a.walk);
        assert!(!a.verbose);
        assert_eq!(a.config, Some(PathBuf::from("/tmp/m.toml")));
        assert!(args(&["-v"]).unwrap().verbose);
    }

    #[test]
    fn version_short_circuits() {
        let err = args(&["--version"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
    }

    #[test]
    fn bad_flags_rejected() {
        assert!(args(&["--ad-unit"]).is_err());
        assert_eq!(args(&["--frobnicate"]).unwrap_err().kind(), ErrorKind::UnknownArgument);
    }

    #[test]
    fn args_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
