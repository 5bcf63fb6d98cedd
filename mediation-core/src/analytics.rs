//! Load analytics: before-load / after-load tracking pings for one delivered candidate.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::candidate::AdCandidate;
use crate::clock::Clock;
use crate::error::ErrorReason;
use crate::transport::{Transport, TransportRequest};

pub const LOAD_DURATION_MS_MACRO: &str = "%%LOAD_DURATION_MS%%";
pub const LOAD_RESULT_MACRO: &str = "%%LOAD_RESULT%%";

/// Outcome token substituted into after-load URLs. All tokens are URL-safe as written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    AdLoaded,
    MissingAdapter,
    Timeout,
    InvalidData,
}

impl LoadResult {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadResult::AdLoaded => "ad_loaded",
            LoadResult::MissingAdapter => "missing_adapter",
            LoadResult::Timeout => "timeout",
            LoadResult::InvalidData => "invalid_data",
        }
    }

    /// None means the creative loaded.
    pub fn from_error(error: Option<ErrorReason>) -> Self {
        match error {
            None => LoadResult::AdLoaded,
            Some(ErrorReason::AdapterNotFound) => LoadResult::MissingAdapter,
            Some(ErrorReason::NetworkTimeout) => LoadResult::Timeout,
            Some(_) => LoadResult::InvalidData,
        }
    }
}

/// Fire-and-forget HTTP hit.
pub trait TrackingFirer: Send + Sync {
    fn fire(&self, url: &str);
}

/// Fires tracking GETs through a `Transport` on a tokio runtime. Responses are discarded.
pub struct TransportFirer {
    transport: Arc<dyn Transport>,
    runtime: Handle,
    cancel: CancellationToken,
}

impl TransportFirer {
    pub fn new(transport: Arc<dyn Transport>, runtime: Handle, cancel: CancellationToken) -> Self {
        Self {
            transport,
            runtime,
            cancel,
        }
    }
}

impl TrackingFirer for TransportFirer {
    fn fire(&self, url: &str) {
        let transport = self.transport.clone();
        let cancel = self.cancel.clone();
        let request = TransportRequest::tracking(url);
        self.runtime.spawn(async move {
            let url = request.url.clone();
            match transport.submit(request, cancel).await {
                Ok(resp) if resp.is_success() => debug!(%url, "tracking request sent"),
                Ok(resp) => debug!(%url, status = resp.status, "tracking request rejected"),
                Err(e) => debug!(%url, error = %e, "tracking request failed"),
            }
        });
    }
}

/// Per-candidate reporter. Created when a candidate is delivered.
pub struct AnalyticsReporter {
    before_load_urls: Vec<String>,
    after_load_urls: Vec<String>,
    after_load_success_urls: Vec<String>,
    after_load_fail_urls: Vec<String>,
    firer: Arc<dyn TrackingFirer>,
    clock: Arc<dyn Clock>,
    before_load_at: Option<u64>,
}

impl AnalyticsReporter {
    pub fn new(candidate: &AdCandidate, firer: Arc<dyn TrackingFirer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            before_load_urls: candidate.before_load_urls.clone(),
            after_load_urls: candidate.after_load_urls.clone(),
            after_load_success_urls: candidate.after_load_success_urls.clone(),
            after_load_fail_urls: candidate.after_load_fail_urls.clone(),
            firer,
            clock,
            before_load_at: None,
        }
    }

    /// Start the load timer and fire before-load URLs.
    pub fn report_before_load(&mut self) {
        self.before_load_at = Some(self.clock.now_millis());
        for url in &self.before_load_urls {
            self.firer.fire(url);
        }
    }

    pub fn report_after_load(&self, error: Option<ErrorReason>) {
        self.fire_after(&self.after_load_urls, LoadResult::from_error(error));
    }

    pub fn report_after_load_success(&self) {
        self.fire_after(&self.after_load_success_urls, LoadResult::AdLoaded);
    }

    pub fn report_after_load_fail(&self, error: ErrorReason) {
        self.fire_after(&self.after_load_fail_urls, LoadResult::from_error(Some(error)));
    }

    pub fn has_started(&self) -> bool {
        self.before_load_at.is_some()
    }

    fn fire_after(&self, urls: &[String], result: LoadResult) {
        for url in self.expand(urls, result) {
            self.firer.fire(&url);
        }
    }

    /// After-load URLs with both macros filled in. Empty if before-load never ran.
    fn expand(&self, urls: &[String], result: LoadResult) -> Vec<String> {
        let Some(started) = self.before_load_at else {
            if !urls.is_empty() {
                warn!("after-load reported before before-load; skipping");
            }
            return Vec::new();
        };
        let elapsed = self.clock.now_millis().saturating_sub(started).to_string();
        urls.iter()
            .map(|u| {
                u.replace(LOAD_DURATION_MS_MACRO, &elapsed)
                    .replace(LOAD_RESULT_MACRO, result.as_str())
            })
            .collect()
    }
}
