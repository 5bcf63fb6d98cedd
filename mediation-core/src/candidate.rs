//! Waterfall data model: ad formats, candidates, batches.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Ad type tag reserved for "stop here": ends a batch and clears the continuation URL.
pub const CLEAR_AD_TYPE: &str = "clear";

/// Ad type whose content is a JSON document rather than markup.
pub const NATIVE_JSON_AD_TYPE: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdFormat {
    Banner,
    Interstitial,
    Rewarded,
    Native,
}

impl AdFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            AdFormat::Banner => "banner",
            AdFormat::Interstitial => "interstitial",
            AdFormat::Rewarded => "rewarded",
            AdFormat::Native => "native",
        }
    }
}

impl fmt::Display for AdFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown ad format: {0}")]
pub struct UnknownAdFormat(pub String);

impl FromStr for AdFormat {
    type Err = UnknownAdFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "banner" => Ok(AdFormat::Banner),
            "interstitial" => Ok(AdFormat::Interstitial),
            "rewarded" | "rewarded_video" => Ok(AdFormat::Rewarded),
            "native" => Ok(AdFormat::Native),
            _ => Err(UnknownAdFormat(s.to_string())),
        }
    }
}

/// The ad unit a waterfall is fetched for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdUnitContext {
    pub ad_unit_id: String,
    pub format: AdFormat,
}

impl AdUnitContext {
    pub fn new(ad_unit_id: impl Into<String>, format: AdFormat) -> Self {
        Self {
            ad_unit_id: ad_unit_id.into(),
            format,
        }
    }
}

/// Creative payload as it came off the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum Creative {
    Raw(String),
    Json(serde_json::Value),
}

impl Creative {
    pub fn is_empty(&self) -> bool {
        match self {
            Creative::Raw(s) => s.is_empty(),
            Creative::Json(v) => v.is_null(),
        }
    }
}

/// Reward terms attached to a rewarded candidate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RewardedInfo {
    pub currency_name: Option<String>,
    pub currency_amount: Option<i64>,
    pub completion_url: Option<String>,
    #[serde(with = "opt_millis")]
    pub duration: Option<Duration>,
    pub reward_on_click: bool,
}

impl RewardedInfo {
    pub fn is_empty(&self) -> bool {
        *self == RewardedInfo::default()
    }
}

/// One fill option. Built once by the response parser and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdCandidate {
    pub ad_unit_id: String,
    pub format: AdFormat,
    pub ad_type: String,
    pub full_ad_type: Option<String>,
    pub ad_group_id: Option<String>,
    pub network_type: Option<String>,
    pub dsp_creative_id: Option<String>,
    pub custom_event_class: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(with = "opt_millis")]
    pub timeout: Option<Duration>,
    #[serde(with = "opt_millis")]
    pub refresh_time: Option<Duration>,
    pub click_trackers: Vec<String>,
    pub impression_trackers: Vec<String>,
    pub before_load_urls: Vec<String>,
    pub after_load_urls: Vec<String>,
    pub after_load_success_urls: Vec<String>,
    pub after_load_fail_urls: Vec<String>,
    pub creative: Creative,
    pub server_extras: BTreeMap<String, String>,
    pub rewarded: Option<RewardedInfo>,
}

impl AdCandidate {
    pub fn is_clear(&self) -> bool {
        self.ad_type == CLEAR_AD_TYPE
    }
}

/// Decoded result of one exchange round trip.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WaterfallBatch {
    pub candidates: Vec<AdCandidate>,
    /// Where to fetch the next segment; empty when the waterfall ends here.
    pub continuation_url: String,
    /// A `clear` entry cut the batch short.
    pub clear_seen: bool,
}

impl WaterfallBatch {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn has_continuation(&self) -> bool {
        !self.continuation_url.is_empty()
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms: Option<u64> = Deserialize::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}
