//! `reconx` is a priority-scheduled, rate-governed HTTP dispatch engine for
//! reconnaissance and security-testing workloads.
//!
//! Submissions are queued by priority, drained by an elastic worker pool
//! that converges on a requests-per-second target, and post-processed by a
//! per-message state machine: body decoding, cookie harvesting,
//! engine-driven redirect following, 429 replay, error accounting and
//! IP-ban verification. Every submission returns a handle; the caller
//! pattern is submit → await → read.
//!
//! # Quick Start
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use reconx::{Client, ClientOptions, PreparedRequest};
//!
//! let mut options = ClientOptions::default();
//! options.performance.requests_per_second = 25;
//! options.error_handling.consecutive_threshold = 100;
//!
//! let client = Client::new(options)?;
//!
//! let request = PreparedRequest::get("https://target.example/login")?
//!     .header("accept-encoding", "gzip")?;
//! let handle = client.send(request).await;
//!
//! let message = handle.await_resolution().await;
//! if let Some(response) = message.response() {
//!     println!("{} ({} bytes)", response.status, response.body.len());
//! }
//!
//! client.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Recommended Defaults
//!
//! - Leave `AutoRateThrottle` and `ReplayRateLimitted` on for unattended
//!   scans; the engine backs off on 429-dense windows by itself.
//! - Set `consecutive_threshold` when probing a single host so a ban is
//!   caught early instead of burning the whole wordlist.
//! - Raw requests (`send_raw`) bypass every header transform: what you
//!   write is what goes on the wire.

mod client;
mod cookies;
mod core;
mod error;
mod http;
mod message;
mod options;
mod transport;
mod util;

pub use crate::client::{Client, ClientBuilder};
pub use crate::cookies::CookieJar;
pub use crate::core::log::MessageLog;
pub use crate::core::rate::RateGovernor;
pub use crate::error::{Error, TransportError};
pub use crate::http::gateway::{GatewayProvider, NoGatewayProvider, ProvisionedGateway};
pub use crate::http::location::to_absolute;
pub use crate::http::origin::{is_cross_origin, is_cross_site};
pub use crate::message::{
    Message, MessageHandle, MessageState, PreparedRequest, RecordedResponse,
};
pub use crate::options::{
    CacheBustingOptions, ClientOptions, ConnectionOptions, DelayRange, ErrorHandlingOptions,
    PerformanceOptions, Priority, RedirectionOptions,
};
pub use crate::transport::{HyperTransport, RawTransport, Transport, TransportReply};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Client, ClientBuilder, ClientOptions, Error, MessageHandle, PreparedRequest,
        RecordedResponse, Result, TransportError,
    };
}
