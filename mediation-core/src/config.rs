//! Engine tunables.

use std::time::Duration;

/// Refresh hint used when the server gives none with a no-fill.
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(30);

/// Time allowed for one exchange round trip before it counts as a timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MediationConfig {
    pub request_timeout: Duration,
    pub default_refresh: Duration,
}

impl Default for MediationConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            default_refresh: DEFAULT_REFRESH,
        }
    }
}
