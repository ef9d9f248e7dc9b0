use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Queue priority; higher dispatches earlier. 1 is the default submission
/// priority, 1000 is reserved for internal ban-verification probes.
pub type Priority = i32;

pub(crate) const BAN_CHECK_PRIORITY: Priority = 1000;

/// Per-client (and per-request, via `send_with_options`) configuration.
///
/// Every enqueue takes the options by value: mid-flight mutation by the
/// caller never perturbs an in-flight request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub simulate_browser_requests: bool,
    pub randomize_user_agent: bool,
    pub maintain_cookie_jar: bool,
    pub default_headers: BTreeMap<String, String>,
    pub exclude_cookies: Vec<String>,
    pub request_priority: Priority,

    pub connection: ConnectionOptions,
    pub cache_busting: CacheBustingOptions,
    pub redirection: RedirectionOptions,
    pub performance: PerformanceOptions,
    pub error_handling: ErrorHandlingOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            simulate_browser_requests: true,
            randomize_user_agent: false,
            maintain_cookie_jar: true,
            default_headers: BTreeMap::new(),
            exclude_cookies: Vec::new(),
            request_priority: 1,
            connection: ConnectionOptions::default(),
            cache_busting: CacheBustingOptions::default(),
            redirection: RedirectionOptions::default(),
            performance: PerformanceOptions::default(),
            error_handling: ErrorHandlingOptions::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub proxy_url: Option<String>,
    pub force_http1: bool,
    pub force_http2: bool,
    pub disable_keep_alives: bool,
    pub enable_ip_rotate: bool,
    pub sni: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectionOptions {
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub prevent_cross_site_redirects: bool,
    pub prevent_cross_origin_redirects: bool,
    #[serde(skip)]
    pub(crate) current_depth: u32,
}

impl Default for RedirectionOptions {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            max_redirects: 10,
            prevent_cross_site_redirects: true,
            prevent_cross_origin_redirects: false,
            current_depth: 0,
        }
    }
}

/// Inter-request delay bounds, in seconds.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: f64,
    pub max: f64,
}

impl DelayRange {
    pub(crate) fn as_millis(self) -> (u64, u64) {
        let min = (self.min.max(0.0) * 1000.0) as u64;
        let max = (self.max.max(0.0) * 1000.0) as u64;
        (min, max.max(min))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceOptions {
    /// Transport-level deadline, in seconds.
    pub timeout: u64,
    pub requests_per_second: u32,
    pub delay: DelayRange,
    pub auto_rate_throttle: bool,
    pub replay_rate_limited: bool,
}

impl Default for PerformanceOptions {
    fn default() -> Self {
        Self {
            timeout: 10,
            requests_per_second: 10,
            delay: DelayRange { min: 0.0, max: 0.1 },
            auto_rate_throttle: true,
            replay_rate_limited: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlingOptions {
    pub consecutive_threshold: u32,
    pub percentage_threshold: u32,
    pub verify_ip_ban_if_exceeded: bool,
    pub ip_rotate_if_exceeded: bool,
    pub report_errors_if_exceeded: bool,
    pub retry_transport_failures: bool,
    /// Status codes treated as expected, non-fatal outcomes. With
    /// `reverse_error_code_handling` the meaning inverts: only listed codes
    /// count as errors.
    pub handle_error_codes: Vec<u16>,
    pub reverse_error_code_handling: bool,
}

impl Default for ErrorHandlingOptions {
    fn default() -> Self {
        Self {
            consecutive_threshold: 0,
            percentage_threshold: 90,
            verify_ip_ban_if_exceeded: true,
            ip_rotate_if_exceeded: false,
            report_errors_if_exceeded: true,
            retry_transport_failures: false,
            handle_error_codes: vec![
                401, 402, 404, 405, 406, 407, 410, 411, 412, 413, 414, 415, 416, 417, 426, 431,
                500, 501,
            ],
            reverse_error_code_handling: false,
        }
    }
}

impl ErrorHandlingOptions {
    /// Whether a status code should be counted as an error.
    pub fn matches(&self, status_code: u16) -> bool {
        if self.handle_error_codes.contains(&status_code) {
            self.reverse_error_code_handling
        } else {
            !self.reverse_error_code_handling
        }
    }
}

/// Cache-busting vectors. `apply` picks the first enabled vector in
/// precedence order; `clear` removes every mutation the active vectors
/// could have added. Behaviour lives in [`crate::http::cache_busting`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheBustingOptions {
    pub query: bool,
    pub hostname: bool,
    pub port: bool,
    pub origin: bool,
    pub accept: bool,
    pub cookie: bool,
    pub accept_encoding: bool,
    pub accept_language: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_cache_buster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie_param: Option<String>,
}

impl CacheBustingOptions {
    /// Query-parameter busting only; safe against most origin servers.
    pub fn safe() -> Self {
        Self {
            query: true,
            ..Self::default()
        }
    }

    /// Every header vector plus the query parameter.
    pub fn aggressive() -> Self {
        Self {
            query: true,
            cookie: true,
            accept: true,
            accept_encoding: true,
            accept_language: true,
            ..Self::default()
        }
    }
}
