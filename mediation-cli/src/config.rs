//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use mediation_core::{AdFormat, MediationConfig};
use serde::Deserialize;

/// CLI configuration. File: ~/.config/mediation/config.toml or /etc/mediation/config.toml.
/// Env overrides: MEDIATION_SERVER_URL, MEDIATION_AD_UNIT, MEDIATION_FORMAT, MEDIATION_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Exchange ad request endpoint; the ad unit goes in the `id` query parameter.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub ad_unit: Option<String>,
    /// banner, interstitial, rewarded or native (default banner).
    #[serde(default = "default_format")]
    pub format: String,
    /// Per-request timeout in milliseconds (default 10000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Refresh hint when the server sends none, in seconds (default 30).
    #[serde(default = "default_refresh_secs")]
    pub default_refresh_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_server_url() -> String {
    "https://ads.example.com/m/ad".to_string()
}
fn default_format() -> String {
    "banner".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_refresh_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    concat!("mediation-cli/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            ad_unit: None,
            format: default_format(),
            timeout_ms: default_timeout_ms(),
            default_refresh_secs: default_refresh_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    pub fn ad_format(&self) -> anyhow::Result<AdFormat> {
        self.format.parse().context("config `format`")
    }

    pub fn mediation(&self) -> MediationConfig {
        MediationConfig {
            request_timeout: Duration::from_millis(self.timeout_ms),
            default_refresh: Duration::from_secs(self.default_refresh_secs),
        }
    }

    /// First ad request URL for `ad_unit`.
    pub fn ad_request_url(&self, ad_unit: &str) -> anyhow::Result<String> {
        let url = reqwest::Url::parse_with_params(&self.server_url, &[("id", ad_unit)])
            .with_context(|| format!("invalid server_url {:?}", self.server_url))?;
        Ok(url.into())
    }
}

/// Load config: default, then the explicit file or the first file found, then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("MEDIATION_SERVER_URL") {
        c.server_url = s;
    }
    if let Some(s) = var("MEDIATION_AD_UNIT") {
        c.ad_unit = Some(s);
    }
    if let Some(s) = var("MEDIATION_FORMAT") {
        c.format = s;
    }
    if let Some(s) = var("MEDIATION_TIMEOUT_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.timeout_ms = ms;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/mediation/config.toml"));
    }
    out.push(PathBuf::from("/etc/mediation/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match read_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(error = %format!("{:#}", e), "ignoring config file"),
            }
            break;
        }
    }
    None
}
