//! Exchange response decoding: one JSON body in, an ordered batch of candidates plus side signals out.
//!
//! Layout of a body:
//!
//! ```text
//! {
//!   "ad-responses": [ { "content": "...", "metadata": { "x-adtype": "html", ... } }, ... ],
//!   "x-next-url": "https://...",
//!   "backoff_ms": 30000, "backoff_reason": "...",
//!   "invalidate_consent": false, ..., "enable_debug_logging": false
//! }
//! ```
//!
//! Signals are read before the candidates so that a no-fill or warm-up still carries them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::candidate::{
    AdCandidate, AdFormat, AdUnitContext, Creative, RewardedInfo, WaterfallBatch, CLEAR_AD_TYPE,
    NATIVE_JSON_AD_TYPE,
};
use crate::config::DEFAULT_REFRESH;
use crate::error::ParseError;
use crate::rate_limit::RateLimitDirective;

// Top-level keys.
const AD_RESPONSES: &str = "ad-responses";
const NEXT_URL: &str = "x-next-url";
const BACKOFF_MS: &str = "backoff_ms";
const BACKOFF_REASON: &str = "backoff_reason";
const REWARDED: &str = "rewarded";
const CREATIVE_EXPERIENCE_SETTINGS: &str = "creative_experience_settings";
const INVALIDATE_CONSENT: &str = "invalidate_consent";
const FORCE_EXPLICIT_NO: &str = "force_explicit_no";
const REACQUIRE_CONSENT: &str = "reacquire_consent";
const FORCE_GDPR_APPLIES: &str = "force_gdpr_applies";
const CONSENT_CHANGE_REASON: &str = "consent_change_reason";
const ENABLE_DEBUG_LOGGING: &str = "enable_debug_logging";

// Per-entry keys.
const CONTENT: &str = "content";
const METADATA: &str = "metadata";
const AD_TYPE: &str = "x-adtype";
const FULL_AD_TYPE: &str = "x-fulladtype";
const AD_GROUP_ID: &str = "x-adgroupid";
const NETWORK_TYPE: &str = "x-networktype";
const DSP_CREATIVE_ID: &str = "x-dspcreativeid";
const CUSTOM_EVENT_NAME: &str = "x-custom-event-class-name";
const CUSTOM_EVENT_DATA: &str = "x-custom-event-class-data";
const CLICK_TRACKER: &str = "x-clickthrough";
const CLICK_TRACKERS: &str = "clicktrackers";
const IMPRESSION_TRACKER: &str = "x-imptracker";
const IMPRESSION_TRACKERS: &str = "imptrackers";
const BEFORE_LOAD_URL: &str = "x-before-load-url";
const AFTER_LOAD_URL: &str = "x-after-load-url";
const AFTER_LOAD_SUCCESS_URL: &str = "x-after-load-success-url";
const AFTER_LOAD_FAIL_URL: &str = "x-after-load-fail-url";
const WIDTH: &str = "x-width";
const HEIGHT: &str = "x-height";
const AD_TIMEOUT_MS: &str = "x-ad-timeout-ms";
const REFRESH_TIME: &str = "x-refreshtime";
const CURRENCY_NAME: &str = "x-rewarded-video-currency-name";
const CURRENCY_AMOUNT: &str = "x-rewarded-video-currency-amount";
const COMPLETION_URL: &str = "x-rewarded-video-completion-url";
const REWARDED_DURATION: &str = "x-rewarded-duration";
const REWARD_ON_CLICK: &str = "x-should-reward-on-click";
const WARMUP: &str = "x-warmup";

/// Legacy single-tracker fields sometimes carry this instead of being omitted.
const EMPTY_ARRAY_SENTINEL: &str = "[]";

/// Consent state the server wants the host to change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsentOverrides {
    pub invalidate_consent: bool,
    pub force_explicit_no: bool,
    pub reacquire_consent: bool,
    pub force_gdpr_applies: bool,
    pub change_reason: Option<String>,
}

impl ConsentOverrides {
    pub fn any(&self) -> bool {
        self.invalidate_consent
            || self.force_explicit_no
            || self.reacquire_consent
            || self.force_gdpr_applies
    }
}

/// Everything in a response that is not a candidate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseSignals {
    pub rate_limit: RateLimitDirective,
    pub consent: ConsentOverrides,
    /// None when the server did not mention it.
    pub debug_logging: Option<bool>,
    pub rewarded: bool,
    pub creative_experience_settings: Option<Value>,
}

/// A decodable response. `batch` is `Err` for no-fill and warm-up; `signals` are valid either way.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub signals: ResponseSignals,
    pub batch: Result<WaterfallBatch, ParseError>,
}

impl ParsedResponse {
    pub fn into_result(self) -> Result<(WaterfallBatch, ResponseSignals), ParseError> {
        let signals = self.signals;
        self.batch.map(|b| (b, signals))
    }
}

#[derive(Debug, Clone)]
pub struct ResponseParser {
    default_refresh: Duration,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            default_refresh: DEFAULT_REFRESH,
        }
    }

    pub fn with_default_refresh(default_refresh: Duration) -> Self {
        Self { default_refresh }
    }

    /// Decode one response body. The outer `Err` means the body was unreadable and carries no signals.
    pub fn parse(&self, body: &[u8], ctx: &AdUnitContext) -> Result<ParsedResponse, ParseError> {
        let doc: Value = serde_json::from_slice(body)
            .map_err(|e| ParseError::BadBody(format!("invalid json: {}", e)))?;
        let top = doc
            .as_object()
            .ok_or_else(|| ParseError::BadBody("top level is not an object".into()))?;
        let entries = top
            .get(AD_RESPONSES)
            .and_then(Value::as_array)
            .ok_or_else(|| ParseError::BadBody(format!("missing `{}` array", AD_RESPONSES)))?;

        let signals = extract_signals(top);
        let batch = self.parse_entries(top, entries, ctx);
        Ok(ParsedResponse { signals, batch })
    }

    fn parse_entries(
        &self,
        top: &Map<String, Value>,
        entries: &[Value],
        ctx: &AdUnitContext,
    ) -> Result<WaterfallBatch, ParseError> {
        let mut continuation_url = opt_string(top, NEXT_URL).unwrap_or_default();
        let mut candidates = Vec::with_capacity(entries.len());
        let mut last_clear: Option<AdCandidate> = None;
        let mut clear_seen = false;

        for (index, entry) in entries.iter().enumerate() {
            let (candidate, warmup) = match parse_entry(entry, ctx) {
                Ok(x) => x,
                Err(e) => {
                    warn!(ad_unit_id = %ctx.ad_unit_id, index, error = %e, "dropping waterfall entry");
                    continue;
                }
            };
            if !candidate.is_clear() {
                candidates.push(candidate);
                continue;
            }
            let refresh = candidate.refresh_time.unwrap_or(self.default_refresh);
            if warmup {
                debug!(ad_unit_id = %ctx.ad_unit_id, refresh_ms = refresh.as_millis() as u64, "ad unit warming up");
                return Err(ParseError::WarmingUp { refresh });
            }
            continuation_url.clear();
            clear_seen = true;
            last_clear = Some(candidate);
            break;
        }

        if candidates.is_empty() {
            let refresh = last_clear
                .and_then(|c| c.refresh_time)
                .unwrap_or(self.default_refresh);
            return Err(ParseError::NoFill { refresh });
        }
        debug!(
            ad_unit_id = %ctx.ad_unit_id,
            candidates = candidates.len(),
            has_next = !continuation_url.is_empty(),
            "parsed waterfall batch"
        );
        Ok(WaterfallBatch {
            candidates,
            continuation_url,
            clear_seen,
        })
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse with the default refresh hint.
pub fn parse_response(body: &[u8], ctx: &AdUnitContext) -> Result<ParsedResponse, ParseError> {
    ResponseParser::new().parse(body, ctx)
}

fn extract_signals(top: &Map<String, Value>) -> ResponseSignals {
    let duration_ms = opt_int(top, BACKOFF_MS).unwrap_or_else(|e| {
        warn!(error = %e, "ignoring malformed backoff");
        None
    });
    let flag = |key: &str| opt_bool(top, key).ok().flatten().unwrap_or(false);
    ResponseSignals {
        rate_limit: RateLimitDirective {
            duration_ms,
            reason: opt_string(top, BACKOFF_REASON),
        },
        consent: ConsentOverrides {
            invalidate_consent: flag(INVALIDATE_CONSENT),
            force_explicit_no: flag(FORCE_EXPLICIT_NO),
            reacquire_consent: flag(REACQUIRE_CONSENT),
            force_gdpr_applies: flag(FORCE_GDPR_APPLIES),
            change_reason: opt_string(top, CONSENT_CHANGE_REASON),
        },
        debug_logging: opt_bool(top, ENABLE_DEBUG_LOGGING).ok().flatten(),
        rewarded: flag(REWARDED),
        creative_experience_settings: top
            .get(CREATIVE_EXPERIENCE_SETTINGS)
            .filter(|v| v.is_object())
            .cloned(),
    }
}

/// Positive seconds as a refresh hint.
fn refresh_secs(secs: i64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs as u64))
}

/// Identity fields only; per-format fields are filled in by the caller.
fn bare_candidate(
    meta: &Map<String, Value>,
    ctx: &AdUnitContext,
    ad_type: String,
    refresh_time: Option<Duration>,
) -> AdCandidate {
    AdCandidate {
        ad_unit_id: ctx.ad_unit_id.clone(),
        format: ctx.format,
        ad_type,
        full_ad_type: opt_string(meta, FULL_AD_TYPE),
        ad_group_id: opt_string(meta, AD_GROUP_ID),
        network_type: opt_string(meta, NETWORK_TYPE),
        dsp_creative_id: opt_string(meta, DSP_CREATIVE_ID),
        custom_event_class: None,
        width: None,
        height: None,
        timeout: None,
        refresh_time,
        click_trackers: Vec::new(),
        impression_trackers: Vec::new(),
        before_load_urls: Vec::new(),
        after_load_urls: Vec::new(),
        after_load_success_urls: Vec::new(),
        after_load_fail_urls: Vec::new(),
        creative: Creative::Raw(String::new()),
        server_extras: BTreeMap::new(),
        rewarded: None,
    }
}

/// One array element. Returns the candidate and its warm-up flag (only meaningful on `clear`).
fn parse_entry(entry: &Value, ctx: &AdUnitContext) -> Result<(AdCandidate, bool), ParseError> {
    let obj = entry
        .as_object()
        .ok_or_else(|| ParseError::BadBody("entry is not an object".into()))?;
    let meta = obj
        .get(METADATA)
        .and_then(Value::as_object)
        .ok_or_else(|| ParseError::BadHeaderData(format!("missing `{}` object", METADATA)))?;
    let ad_type = opt_string(meta, AD_TYPE)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ParseError::BadHeaderData(format!("missing `{}`", AD_TYPE)))?;

    // A clear entry always stops the batch; malformed hints on it read as absent.
    if ad_type == CLEAR_AD_TYPE {
        let refresh_time = opt_int(meta, REFRESH_TIME).ok().flatten().and_then(refresh_secs);
        let warmup = opt_bool(meta, WARMUP).ok().flatten().unwrap_or(false);
        let candidate = bare_candidate(meta, ctx, ad_type, refresh_time);
        return Ok((candidate, warmup));
    }

    let content = match obj.get(CONTENT) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(ParseError::BadBody("`content` is not a string".into())),
    };
    let refresh_time = opt_int(meta, REFRESH_TIME)?.and_then(refresh_secs);
    let mut candidate = bare_candidate(meta, ctx, ad_type, refresh_time);

    candidate.custom_event_class = opt_string(meta, CUSTOM_EVENT_NAME).filter(|s| !s.is_empty());
    candidate.width = opt_dimension(meta, WIDTH)?;
    candidate.height = opt_dimension(meta, HEIGHT)?;
    candidate.timeout = opt_int(meta, AD_TIMEOUT_MS)?
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms as u64));
    candidate.click_trackers = trackers(meta, CLICK_TRACKERS, CLICK_TRACKER)?;
    candidate.impression_trackers = trackers(meta, IMPRESSION_TRACKERS, IMPRESSION_TRACKER)?;
    candidate.before_load_urls = urls(meta, BEFORE_LOAD_URL)?;
    candidate.after_load_urls = urls(meta, AFTER_LOAD_URL)?;
    candidate.after_load_success_urls = urls(meta, AFTER_LOAD_SUCCESS_URL)?;
    candidate.after_load_fail_urls = urls(meta, AFTER_LOAD_FAIL_URL)?;
    candidate.server_extras = server_extras(meta)?;
    candidate.rewarded = rewarded_info(meta, ctx.format)?;
    candidate.creative = if candidate.ad_type == NATIVE_JSON_AD_TYPE {
        let v: Value = serde_json::from_str(&content)
            .map_err(|e| ParseError::BadBody(format!("invalid native json: {}", e)))?;
        Creative::Json(v)
    } else {
        Creative::Raw(content)
    };
    Ok((candidate, false))
}

fn rewarded_info(
    meta: &Map<String, Value>,
    format: AdFormat,
) -> Result<Option<RewardedInfo>, ParseError> {
    let info = RewardedInfo {
        currency_name: opt_string(meta, CURRENCY_NAME).filter(|s| !s.is_empty()),
        currency_amount: opt_int(meta, CURRENCY_AMOUNT)?,
        completion_url: opt_string(meta, COMPLETION_URL).filter(|s| !s.is_empty()),
        duration: opt_int(meta, REWARDED_DURATION)?
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(s as u64)),
        reward_on_click: opt_bool(meta, REWARD_ON_CLICK)?.unwrap_or(false),
    };
    if info.is_empty() && format != AdFormat::Rewarded {
        return Ok(None);
    }
    Ok(Some(info))
}

/// `x-custom-event-class-data` arrives either as an object or as a JSON-encoded object string.
fn server_extras(meta: &Map<String, Value>) -> Result<BTreeMap<String, String>, ParseError> {
    let decoded;
    let obj = match meta.get(CUSTOM_EVENT_DATA) {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(BTreeMap::new()),
        Some(Value::String(s)) => {
            decoded = serde_json::from_str::<Value>(s).map_err(|e| {
                ParseError::BadHeaderData(format!("`{}`: {}", CUSTOM_EVENT_DATA, e))
            })?;
            &decoded
        }
        Some(v) => v,
    };
    let map = obj.as_object().ok_or_else(|| {
        ParseError::BadHeaderData(format!("`{}` is not an object", CUSTOM_EVENT_DATA))
    })?;
    Ok(map
        .iter()
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect())
}

/// Array field wins when non-empty; otherwise fall back to the legacy single field.
fn trackers(
    meta: &Map<String, Value>,
    array_key: &str,
    legacy_key: &str,
) -> Result<Vec<String>, ParseError> {
    let list = urls(meta, array_key)?;
    if !list.is_empty() {
        return Ok(list);
    }
    urls(meta, legacy_key)
}

/// A URL field given as one string or an array of strings.
fn urls(meta: &Map<String, Value>, key: &str) -> Result<Vec<String>, ParseError> {
    match meta.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() || s == EMPTY_ARRAY_SENTINEL {
                Ok(Vec::new())
            } else {
                Ok(vec![s.to_string()])
            }
        }
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if s.is_empty() => None,
                Value::String(s) => Some(Ok(s.clone())),
                _ => Some(Err(ParseError::BadHeaderData(format!(
                    "`{}` holds a non-string url",
                    key
                )))),
            })
            .collect(),
        Some(_) => Err(ParseError::BadHeaderData(format!(
            "`{}` is neither string nor array",
            key
        ))),
    }
}

fn opt_string(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Integer given as a JSON number or a numeric string. Empty string reads as absent.
fn opt_int(map: &Map<String, Value>, key: &str) -> Result<Option<i64>, ParseError> {
    let bad = || ParseError::BadHeaderData(format!("`{}` is not an integer", key));
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(bad),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse::<i64>().map(Some).map_err(|_| bad()),
        Some(_) => Err(bad()),
    }
}

fn opt_bool(map: &Map<String, Value>, key: &str) -> Result<Option<bool>, ParseError> {
    let bad = || ParseError::BadHeaderData(format!("`{}` is not a boolean", key));
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) => Ok(Some(n.as_i64().ok_or_else(bad)? != 0)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" => Ok(Some(true)),
            "0" | "false" => Ok(Some(false)),
            _ => Err(bad()),
        },
        Some(_) => Err(bad()),
    }
}

fn opt_dimension(map: &Map<String, Value>, key: &str) -> Result<Option<u32>, ParseError> {
    opt_int(map, key)?
        .map(|v| {
            u32::try_from(v)
                .map_err(|_| ParseError::BadHeaderData(format!("`{}` out of range", key)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> AdUnitContext {
        AdUnitContext::new("unit-1", AdFormat::Banner)
    }

    fn parse(v: Value) -> Result<ParsedResponse, ParseError> {
        parse_response(v.to_string().as_bytes(), &ctx())
    }

    fn entry(ad_type: &str) -> Value {
        json!({ "content": format!("<div>{}</div>", ad_type), "metadata": { "x-adtype": ad_type } })
    }

    #[test]
    fn candidates_in_array_order() {
        let body = json!({
            "ad-responses": [entry("html"), entry("mraid"), entry("custom")],
            "x-next-url": "https://ads.example.com/next"
        });
        let (batch, _) = parse(body).unwrap().into_result().unwrap();
        let types: Vec<&str> = batch.candidates.iter().map(|c| c.ad_type.as_str()).collect();
        assert_eq!(types, vec!["html", "mraid", "custom"]);
        assert_eq!(batch.continuation_url, "https://ads.example.com/next");
        assert!(!batch.clear_seen);
        assert_eq!(batch.candidates[0].creative, Creative::Raw("<div>html</div>".into()));
        assert_eq!(batch.candidates[0].ad_unit_id, "unit-1");
    }

    #[test]
    fn clear_only_is_no_fill_with_refresh() {
        let body = br#"{"ad-responses":[{"content":"","metadata":{"x-adtype":"clear","x-refreshtime":"15"}}],"x-next-url":""}"#;
        let parsed = parse_response(body, &ctx()).unwrap();
        assert_eq!(
            parsed.batch.unwrap_err(),
            ParseError::NoFill {
                refresh: Duration::from_millis(15000)
            }
        );
    }

    #[test]
    fn no_fill_default_refresh() {
        let parsed = parse(json!({ "ad-responses": [] })).unwrap();
        assert_eq!(
            parsed.batch.unwrap_err(),
            ParseError::NoFill {
                refresh: DEFAULT_REFRESH
            }
        );
    }

    #[test]
    fn clear_halts_and_empties_continuation() {
        let body = json!({
            "ad-responses": [
                entry("html"),
                { "content": "", "metadata": { "x-adtype": "clear" } },
                entry("mraid"),
                "garbage"
            ],
            "x-next-url": "https://ads.example.com/next"
        });
        let (batch, _) = parse(body).unwrap().into_result().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.candidates[0].ad_type, "html");
        assert!(batch.continuation_url.is_empty());
        assert!(batch.clear_seen);
    }

    #[test]
    fn warmup_clear_is_warming_up() {
        let body = json!({
            "ad-responses": [
                { "content": "", "metadata": { "x-adtype": "clear", "x-warmup": true, "x-refreshtime": 20 } }
            ],
            "x-next-url": ""
        });
        let parsed = parse(body).unwrap();
        assert_eq!(
            parsed.batch.unwrap_err(),
            ParseError::WarmingUp {
                refresh: Duration::from_secs(20)
            }
        );
    }

    #[test]
    fn warmup_wins_over_earlier_candidates() {
        let body = json!({
            "ad-responses": [
                entry("html"),
                { "metadata": { "x-adtype": "clear", "x-warmup": "1" } }
            ]
        });
        let err = parse(body).unwrap().batch.unwrap_err();
        assert!(matches!(err, ParseError::WarmingUp { .. }));
    }

    #[test]
    fn bad_entry_is_dropped() {
        let body = json!({
            "ad-responses": [
                { "content": "x" },
                { "content": "x", "metadata": { "x-adtype": "html", "x-width": "wide" } },
                { "content": "{not json", "metadata": { "x-adtype": "json" } },
                { "content": "ok", "metadata": { "x-adtype": "html", "clicktrackers": [1] } },
                entry("mraid")
            ]
        });
        let (batch, _) = parse(body).unwrap().into_result().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.candidates[0].ad_type, "mraid");
    }

    #[test]
    fn all_entries_bad_is_no_fill() {
        let body = json!({ "ad-responses": [ { "content": "x" }, 7 ] });
        let err = parse(body).unwrap().batch.unwrap_err();
        assert!(matches!(err, ParseError::NoFill { .. }));
    }

    #[test]
    fn unreadable_body_is_bad_body() {
        assert!(matches!(
            parse_response(b"<html>", &ctx()),
            Err(ParseError::BadBody(_))
        ));
        assert!(matches!(
            parse(json!([1, 2])),
            Err(ParseError::BadBody(_))
        ));
        assert!(matches!(
            parse(json!({ "x-next-url": "" })),
            Err(ParseError::BadBody(_))
        ));
    }

    #[test]
    fn tracker_array_wins_over_legacy() {
        let body = json!({
            "ad-responses": [{
                "content": "",
                "metadata": {
                    "x-adtype": "html",
                    "clicktrackers": ["a", "b"],
                    "x-clickthrough": "c",
                    "imptrackers": [],
                    "x-imptracker": "imp"
                }
            }]
        });
        let (batch, _) = parse(body).unwrap().into_result().unwrap();
        assert_eq!(batch.candidates[0].click_trackers, vec!["a", "b"]);
        assert_eq!(batch.candidates[0].impression_trackers, vec!["imp"]);
    }

    #[test]
    fn legacy_sentinel_is_ignored() {
        let body = json!({
            "ad-responses": [{
                "metadata": { "x-adtype": "html", "x-clickthrough": "[]", "x-imptracker": "" }
            }]
        });
        let (batch, _) = parse(body).unwrap().into_result().unwrap();
        assert!(batch.candidates[0].click_trackers.is_empty());
        assert!(batch.candidates[0].impression_trackers.is_empty());
    }

    #[test]
    fn metadata_fields_decoded() {
        let body = json!({
            "ad-responses": [{
                "content": "<html/>",
                "metadata": {
                    "x-adtype": "html",
                    "x-fulladtype": "mraid_v2",
                    "x-adgroupid": "ag-1",
                    "x-networktype": "mopub",
                    "x-dspcreativeid": "dsp-9",
                    "x-custom-event-class-name": "com.example.HtmlBanner",
                    "x-custom-event-class-data": "{\"key\":\"value\",\"n\":3}",
                    "x-width": "320",
                    "x-height": 50,
                    "x-ad-timeout-ms": "5000",
                    "x-refreshtime": "60",
                    "x-before-load-url": "https://t.example.com/before",
                    "x-after-load-url": ["https://t.example.com/after?d=%%LOAD_DURATION_MS%%"],
                    "x-after-load-success-url": "https://t.example.com/ok",
                    "x-after-load-fail-url": ["https://t.example.com/fail"]
                }
            }]
        });
        let (batch, _) = parse(body).unwrap().into_result().unwrap();
        let c = &batch.candidates[0];
        assert_eq!(c.full_ad_type.as_deref(), Some("mraid_v2"));
        assert_eq!(c.ad_group_id.as_deref(), Some("ag-1"));
        assert_eq!(c.network_type.as_deref(), Some("mopub"));
        assert_eq!(c.dsp_creative_id.as_deref(), Some("dsp-9"));
        assert_eq!(c.custom_event_class.as_deref(), Some("com.example.HtmlBanner"));
        assert_eq!(c.server_extras.get("key").map(String::as_str), Some("value"));
        assert_eq!(c.server_extras.get("n").map(String::as_str), Some("3"));
        assert_eq!((c.width, c.height), (Some(320), Some(50)));
        assert_eq!(c.timeout, Some(Duration::from_millis(5000)));
        assert_eq!(c.refresh_time, Some(Duration::from_millis(60_000)));
        assert_eq!(c.before_load_urls, vec!["https://t.example.com/before"]);
        assert_eq!(c.after_load_urls.len(), 1);
        assert_eq!(c.after_load_success_urls, vec!["https://t.example.com/ok"]);
        assert_eq!(c.after_load_fail_urls, vec!["https://t.example.com/fail"]);
        assert!(c.rewarded.is_none());
    }

    #[test]
    fn native_json_creative() {
        let body = json!({
            "ad-responses": [{
                "content": "{\"title\":\"Hello\",\"imptracker\":[]}",
                "metadata": { "x-adtype": "json" }
            }]
        });
        let native = AdUnitContext::new("unit-n", AdFormat::Native);
        let parsed = parse_response(body.to_string().as_bytes(), &native).unwrap();
        let (batch, _) = parsed.into_result().unwrap();
        match &batch.candidates[0].creative {
            Creative::Json(v) => assert_eq!(v["title"], "Hello"),
            other => panic!("expected json creative, got {:?}", other),
        }
    }

    #[test]
    fn rewarded_fields() {
        let body = json!({
            "rewarded": true,
            "ad-responses": [{
                "content": "",
                "metadata": {
                    "x-adtype": "custom",
                    "x-rewarded-video-currency-name": "coins",
                    "x-rewarded-video-currency-amount": "10",
                    "x-rewarded-video-completion-url": "https://r.example.com/done",
                    "x-rewarded-duration": "30",
                    "x-should-reward-on-click": "1"
                }
            }]
        });
        let rewarded = AdUnitContext::new("unit-r", AdFormat::Rewarded);
        let parsed = parse_response(body.to_string().as_bytes(), &rewarded).unwrap();
        let (batch, signals) = parsed.into_result().unwrap();
        assert!(signals.rewarded);
        let info = batch.candidates[0].rewarded.clone().unwrap();
        assert_eq!(info.currency_name.as_deref(), Some("coins"));
        assert_eq!(info.currency_amount, Some(10));
        assert_eq!(info.completion_url.as_deref(), Some("https://r.example.com/done"));
        assert_eq!(info.duration, Some(Duration::from_secs(30)));
        assert!(info.reward_on_click);
    }

    #[test]
    fn signals_survive_no_fill() {
        let body = json!({
            "ad-responses": [],
            "backoff_ms": "30000",
            "backoff_reason": "too many requests",
            "invalidate_consent": "1",
            "force_gdpr_applies": true,
            "consent_change_reason": "policy",
            "enable_debug_logging": true,
            "creative_experience_settings": { "max_ad_experience_time": 30 }
        });
        let parsed = parse(body).unwrap();
        assert!(matches!(parsed.batch, Err(ParseError::NoFill { .. })));
        let s = parsed.signals;
        assert_eq!(s.rate_limit.duration_ms, Some(30000));
        assert_eq!(s.rate_limit.reason.as_deref(), Some("too many requests"));
        assert!(s.consent.invalidate_consent);
        assert!(s.consent.force_gdpr_applies);
        assert!(!s.consent.force_explicit_no);
        assert_eq!(s.consent.change_reason.as_deref(), Some("policy"));
        assert_eq!(s.debug_logging, Some(true));
        assert!(s.creative_experience_settings.is_some());
    }

    #[test]
    fn absent_signals_default() {
        let parsed = parse(json!({ "ad-responses": [entry("html")] })).unwrap();
        let s = parsed.signals;
        assert_eq!(s.rate_limit, RateLimitDirective::default());
        assert!(!s.consent.any());
        assert_eq!(s.debug_logging, None);
        assert!(!s.rewarded);
    }

    #[test]
    fn malformed_clear_still_halts_batch() {
        let body = json!({
            "ad-responses": [
                entry("html"),
                { "metadata": { "x-adtype": "clear", "x-refreshtime": "soon" } },
                entry("mraid")
            ],
            "x-next-url": "https://ads.example.com/next"
        });
        let (batch, _) = parse(body).unwrap().into_result().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.candidates[0].ad_type, "html");
        assert!(batch.continuation_url.is_empty());
        assert!(batch.clear_seen);
    }

    #[test]
    fn malformed_clear_alone_is_no_fill_with_default_refresh() {
        let body = json!({
            "ad-responses": [
                { "content": 7, "metadata": { "x-adtype": "clear", "x-refreshtime": [1] } },
                entry("html")
            ]
        });
        assert_eq!(
            parse(body).unwrap().batch.unwrap_err(),
            ParseError::NoFill {
                refresh: DEFAULT_REFRESH
            }
        );
    }

    #[test]
    fn warmup_clear_with_bad_refresh_is_warming_up() {
        let body = json!({
            "ad-responses": [{ "metadata": { "x-adtype": "clear", "x-warmup": true, "x-refreshtime": "abc" } }]
        });
        assert_eq!(
            parse(body).unwrap().batch.unwrap_err(),
            ParseError::WarmingUp {
                refresh: DEFAULT_REFRESH
            }
        );
    }
}
