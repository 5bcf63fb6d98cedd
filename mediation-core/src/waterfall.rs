//! Waterfall orchestration: fetch a batch, hand candidates out one per `next()`, follow the
//! continuation URL when the batch runs dry.
//!
//! ```text
//! Idle --next()--> Fetching --ok--> Delivering --next()--> (Delivering | Fetching | Exhausted)
//!                     |
//!                     +--err--> Failed
//! ```
//!
//! Every outcome reaches the `WaterfallListener` from a spawned task, never from inside `next()`.
//! One fetch at most is in flight per orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::{AnalyticsReporter, TrackingFirer, TransportFirer};
use crate::candidate::{AdCandidate, AdUnitContext, WaterfallBatch};
use crate::clock::{Clock, SystemClock};
use crate::config::MediationConfig;
use crate::error::{ErrorReason, MediationError};
use crate::rate_limit::RateLimiter;
use crate::response::{ConsentOverrides, ResponseParser, ResponseSignals};
use crate::transport::{Transport, TransportError, TransportRequest};

/// Receives exactly one outcome per `next()` call that produces one.
pub trait WaterfallListener: Send + Sync {
    fn on_candidate(&self, candidate: AdCandidate);
    fn on_error(&self, error: MediationError);
}

/// Host hooks for the non-candidate parts of a response. All optional.
pub trait SignalHandler: Send + Sync {
    fn on_consent_overrides(&self, _overrides: &ConsentOverrides) {}
    fn on_debug_logging(&self, _enabled: bool) {}
    fn on_creative_experience_settings(&self, _settings: &Value) {}
}

struct IgnoreSignals;

impl SignalHandler for IgnoreSignals {}

/// Handle to the most recent exchange request.
#[derive(Debug, Clone)]
pub struct PendingFetch {
    inner: Arc<FetchInner>,
}

#[derive(Debug)]
struct FetchInner {
    id: Uuid,
    url: String,
    cancel: CancellationToken,
    finished: AtomicBool,
}

impl PendingFetch {
    fn new(url: String, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FetchInner {
                id: Uuid::new_v4(),
                url,
                cancel,
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Abandon this request. Its result is discarded and the next `next()` may fetch again.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    fn token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn same(&self, other: &PendingFetch) -> bool {
        self.inner.id == other.inner.id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no tokio runtime: pass one with `runtime()` or build inside a runtime")]
    NoRuntime,
}

enum Delivery {
    Candidate(AdCandidate),
    Error(MediationError),
}

struct State {
    current_url: String,
    batch: Option<WaterfallBatch>,
    /// Index of the next undelivered candidate in `batch`.
    cursor: usize,
    running: bool,
    /// Set once; the instance is done after this.
    failed: Option<MediationError>,
    content_downloaded: bool,
    last_fetch: Option<PendingFetch>,
    last_reporter: Option<AnalyticsReporter>,
}

impl State {
    fn remaining(&self) -> usize {
        self.batch
            .as_ref()
            .map(|b| b.len().saturating_sub(self.cursor))
            .unwrap_or(0)
    }
}

struct Shared {
    ad_unit: AdUnitContext,
    transport: Arc<dyn Transport>,
    rate_limiter: Arc<RateLimiter>,
    listener: Arc<dyn WaterfallListener>,
    signals: Arc<dyn SignalHandler>,
    firer: Arc<dyn TrackingFirer>,
    clock: Arc<dyn Clock>,
    parser: ResponseParser,
    config: MediationConfig,
    runtime: Handle,
    shutdown: CancellationToken,
    state: Mutex<State>,
}

pub struct OrchestratorBuilder {
    ad_unit: AdUnitContext,
    initial_url: String,
    transport: Arc<dyn Transport>,
    listener: Arc<dyn WaterfallListener>,
    rate_limiter: Option<Arc<RateLimiter>>,
    signals: Option<Arc<dyn SignalHandler>>,
    firer: Option<Arc<dyn TrackingFirer>>,
    clock: Option<Arc<dyn Clock>>,
    config: MediationConfig,
    runtime: Option<Handle>,
}

impl OrchestratorBuilder {
    /// Process-wide limiter to consult and update. Defaults to a private one.
    pub fn rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn signal_handler(mut self, handler: Arc<dyn SignalHandler>) -> Self {
        self.signals = Some(handler);
        self
    }

    /// Where analytics pings go. Defaults to GETs through the transport.
    pub fn tracking(mut self, firer: Arc<dyn TrackingFirer>) -> Self {
        self.firer = Some(firer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: MediationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<WaterfallOrchestrator, BuildError> {
        let runtime = match self.runtime {
            Some(h) => h,
            None => Handle::try_current().map_err(|_| BuildError::NoRuntime)?,
        };
        let shutdown = CancellationToken::new();
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let firer = self.firer.unwrap_or_else(|| {
            Arc::new(TransportFirer::new(
                self.transport.clone(),
                runtime.clone(),
                shutdown.child_token(),
            ))
        });
        let shared = Shared {
            parser: ResponseParser::with_default_refresh(self.config.default_refresh),
            ad_unit: self.ad_unit,
            transport: self.transport,
            rate_limiter: self
                .rate_limiter
                .unwrap_or_else(|| Arc::new(RateLimiter::with_clock(clock.clone()))),
            listener: self.listener,
            signals: self.signals.unwrap_or_else(|| Arc::new(IgnoreSignals)),
            firer,
            clock,
            config: self.config,
            runtime,
            shutdown,
            state: Mutex::new(State {
                current_url: self.initial_url,
                batch: None,
                cursor: 0,
                running: false,
                failed: None,
                content_downloaded: false,
                last_fetch: None,
                last_reporter: None,
            }),
        };
        Ok(WaterfallOrchestrator {
            shared: Arc::new(shared),
        })
    }
}

/// One waterfall for one ad unit. Replace the instance to start over.
pub struct WaterfallOrchestrator {
    shared: Arc<Shared>,
}

impl WaterfallOrchestrator {
    pub fn builder(
        ad_unit: AdUnitContext,
        initial_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        listener: Arc<dyn WaterfallListener>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            ad_unit,
            initial_url: initial_url.into(),
            transport,
            listener,
            rate_limiter: None,
            signals: None,
            firer: None,
            clock: None,
            config: MediationConfig::default(),
            runtime: None,
        }
    }

    pub fn ad_unit(&self) -> &AdUnitContext {
        &self.shared.ad_unit
    }

    pub fn has_more(&self) -> bool {
        let state = self.shared.state.lock();
        if state.failed.is_some() || state.content_downloaded {
            return false;
        }
        match &state.batch {
            None => true,
            Some(batch) => state.cursor < batch.len() || batch.has_continuation(),
        }
    }

    /// Ask for the next candidate. `last_error` is why the previously delivered one failed to load.
    /// Returns the fetch handle the outcome belongs to, or None when the outcome is already known.
    pub fn next(&self, last_error: Option<ErrorReason>) -> Option<PendingFetch> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if state.running {
            return state.last_fetch.clone();
        }
        if let Some(err) = state.failed.clone() {
            shared.dispatch(Delivery::Error(err));
            return None;
        }

        if state.batch.is_none() {
            let ad_unit_id = shared.ad_unit.ad_unit_id.as_str();
            if let Some((retry_after, reason)) = shared.rate_limiter.active_block(ad_unit_id) {
                info!(ad_unit_id, retry_after_ms = retry_after.as_millis() as u64, "ad unit rate limited; not fetching");
                let err = MediationError::TooManyRequests {
                    reason,
                    retry_after,
                };
                state.failed = Some(err.clone());
                shared.dispatch(Delivery::Error(err));
                return None;
            }
            let url = state.current_url.clone();
            return Some(shared.start_fetch(&mut state, url));
        }

        if let Some(reason) = last_error {
            match state.last_reporter.take() {
                Some(reporter) => {
                    reporter.report_after_load(Some(reason));
                    reporter.report_after_load_fail(reason);
                }
                None => debug!(%reason, "load error reported with no delivered candidate"),
            }
        }

        if state.remaining() > 0 {
            shared.deliver_next(&mut state);
            return state.last_fetch.clone();
        }

        let continuation = state
            .batch
            .as_ref()
            .map(|b| b.continuation_url.clone())
            .unwrap_or_default();
        if !continuation.is_empty() {
            return Some(shared.start_fetch(&mut state, continuation));
        }

        debug!(ad_unit_id = %shared.ad_unit.ad_unit_id, "waterfall exhausted");
        shared.dispatch(Delivery::Error(MediationError::NoFill {
            refresh: shared.config.default_refresh,
        }));
        None
    }

    /// The caller rendered the last delivered candidate. Ends the waterfall.
    pub fn creative_download_success(&self) {
        let mut state = self.shared.state.lock();
        state.content_downloaded = true;
        match state.last_reporter.take() {
            Some(reporter) => {
                reporter.report_after_load(None);
                reporter.report_after_load_success();
            }
            None => warn!(
                ad_unit_id = %self.shared.ad_unit.ad_unit_id,
                "creative download success with no delivered candidate"
            ),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn is_failed(&self) -> bool {
        self.shared.state.lock().failed.is_some()
    }

    pub fn current_url(&self) -> String {
        self.shared.state.lock().current_url.clone()
    }

    /// Cancel the in-flight fetch and silence every pending delivery.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            debug!(ad_unit_id = %self.shared.ad_unit.ad_unit_id, "waterfall shut down");
        }
        self.shared.shutdown.cancel();
    }
}

impl Drop for WaterfallOrchestrator {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn start_fetch(self: &Arc<Self>, state: &mut State, url: String) -> PendingFetch {
        let fetch = PendingFetch::new(url.clone(), self.shutdown.child_token());
        debug!(ad_unit_id = %self.ad_unit.ad_unit_id, %url, fetch_id = %fetch.id(), "fetching waterfall");
        state.running = true;
        state.current_url = url;
        state.last_fetch = Some(fetch.clone());

        let shared = self.clone();
        let task_fetch = fetch.clone();
        self.runtime.spawn(async move {
            let outcome = shared.execute(&task_fetch).await;
            shared.complete(&task_fetch, outcome);
        });
        fetch
    }

    /// Submit, check status, parse, apply signals. None when the fetch was cancelled.
    async fn execute(&self, fetch: &PendingFetch) -> Option<Result<WaterfallBatch, MediationError>> {
        let token = fetch.token();
        let request = TransportRequest::ad_request(fetch.url());
        let submit = self.transport.submit(request, token.clone());
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            r = tokio::time::timeout(self.config.request_timeout, submit) => r,
        };
        if token.is_cancelled() {
            return None;
        }
        let response = match result {
            Err(_) => return Some(Err(TransportError::Timeout.into())),
            Ok(Err(e)) => return Some(Err(e.into())),
            Ok(Ok(r)) => r,
        };
        if !response.is_success() {
            return Some(Err(TransportError::Status(response.status).into()));
        }
        let parsed = match self.parser.parse(&response.body, &self.ad_unit) {
            Ok(p) => p,
            Err(e) => return Some(Err(e.into())),
        };
        self.apply_signals(&parsed.signals);
        Some(parsed.batch.map_err(MediationError::from))
    }

    fn complete(
        self: &Arc<Self>,
        fetch: &PendingFetch,
        outcome: Option<Result<WaterfallBatch, MediationError>>,
    ) {
        fetch.inner.finished.store(true, Ordering::SeqCst);
        if self.shutdown.is_cancelled() {
            debug!(fetch_id = %fetch.id(), "dropping response after shutdown");
            return;
        }
        let mut state = self.state.lock();
        if !state.last_fetch.as_ref().is_some_and(|f| f.same(fetch)) {
            return;
        }
        state.running = false;
        match outcome {
            None => debug!(fetch_id = %fetch.id(), "fetch cancelled"),
            Some(Ok(batch)) => self.on_fetch_success(&mut state, batch),
            Some(Err(e)) => self.on_fetch_error(&mut state, e),
        }
    }

    fn on_fetch_success(self: &Arc<Self>, state: &mut State, batch: WaterfallBatch) {
        state.batch = Some(batch);
        state.cursor = 0;
        if state.remaining() > 0 {
            self.deliver_next(state);
        } else {
            // The parser turns an empty batch into NoFill; keep the caller from waiting forever anyway.
            self.dispatch(Delivery::Error(MediationError::NoFill {
                refresh: self.config.default_refresh,
            }));
        }
    }

    fn on_fetch_error(self: &Arc<Self>, state: &mut State, error: MediationError) {
        debug!(ad_unit_id = %self.ad_unit.ad_unit_id, reason = %error.reason(), "waterfall fetch failed");
        state.failed = Some(error.clone());
        self.dispatch(Delivery::Error(error));
    }

    fn deliver_next(self: &Arc<Self>, state: &mut State) {
        let Some(candidate) = state
            .batch
            .as_ref()
            .and_then(|b| b.candidates.get(state.cursor))
            .cloned()
        else {
            return;
        };
        state.cursor += 1;
        let mut reporter =
            AnalyticsReporter::new(&candidate, self.firer.clone(), self.clock.clone());
        reporter.report_before_load();
        state.last_reporter = Some(reporter);
        debug!(
            ad_unit_id = %self.ad_unit.ad_unit_id,
            ad_type = %candidate.ad_type,
            position = state.cursor,
            "delivering candidate"
        );
        self.dispatch(Delivery::Candidate(candidate));
    }

    fn apply_signals(&self, signals: &ResponseSignals) {
        self.rate_limiter
            .apply(&self.ad_unit.ad_unit_id, &signals.rate_limit);
        self.signals.on_consent_overrides(&signals.consent);
        if let Some(enabled) = signals.debug_logging {
            self.signals.on_debug_logging(enabled);
        }
        if let Some(settings) = &signals.creative_experience_settings {
            self.signals.on_creative_experience_settings(settings);
        }
    }

    fn dispatch(&self, delivery: Delivery) {
        let listener = self.listener.clone();
        let shutdown = self.shutdown.clone();
        self.runtime.spawn(async move {
            if shutdown.is_cancelled() {
                return;
            }
            match delivery {
                Delivery::Candidate(c) => listener.on_candidate(c),
                Delivery::Error(e) => listener.on_error(e),
            }
        });
    }
}
