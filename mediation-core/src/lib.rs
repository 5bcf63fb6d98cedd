//! Ad waterfall mediation engine.
//! Host supplies the HTTP transport; the engine fetches, parses and hands out candidates in order.

pub mod analytics;
pub mod candidate;
pub mod clock;
pub mod config;
pub mod error;
pub mod ffi;
pub mod rate_limit;
pub mod response;
pub mod transport;
pub mod waterfall;

pub use analytics::{AnalyticsReporter, LoadResult, TrackingFirer, TransportFirer};
pub use candidate::{AdCandidate, AdFormat, AdUnitContext, Creative, RewardedInfo, WaterfallBatch};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MediationConfig;
pub use error::{ErrorReason, MediationError, ParseError};
pub use rate_limit::{RateLimitDirective, RateLimitRecord, RateLimiter};
pub use response::{parse_response, ConsentOverrides, ParsedResponse, ResponseParser, ResponseSignals};
pub use transport::{Method, Transport, TransportError, TransportRequest, TransportResponse};
pub use waterfall::{
    BuildError, OrchestratorBuilder, PendingFetch, SignalHandler, WaterfallListener,
    WaterfallOrchestrator,
};
