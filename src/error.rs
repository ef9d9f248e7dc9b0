use http::Method;
use thiserror::Error;

/// Outcome classification for a failed dispatch, recorded on the message.
///
/// `NoError` is the resting state of every record; the remaining variants
/// are assigned by [`classify_failure`] when the transport reports an error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum TransportError {
    #[default]
    NoError,
    Timeout,
    ConnectionReset,
    TlsFailure,
    DnsError,
    UnsupportedScheme,
    Unknown,
}

impl TransportError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoError => "NoError",
            Self::Timeout => "Timeout",
            Self::ConnectionReset => "ConnectionReset",
            Self::TlsFailure => "TlsFailure",
            Self::DnsError => "DnsError",
            Self::UnsupportedScheme => "UnsupportedScheme",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request url: {url}")]
    InvalidUrl { url: String },
    #[error("invalid header name: {name}")]
    InvalidHeaderName { name: String },
    #[error("invalid header value for {name}")]
    InvalidHeaderValue { name: String },
    #[error("http transport error for {method} {url}: {message}")]
    Transport {
        method: Method,
        url: String,
        message: String,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {url}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        url: String,
    },
    #[error("request cancelled")]
    Cancelled,
    #[error("raw request failure for {url}: {message}")]
    RawTransport { url: String, message: String },
    #[error("failed to decode response content-encoding {encoding} for {url}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        url: String,
        message: String,
    },
    #[error("egress gateway provisioning failed for {base_url}: {message}")]
    Gateway { base_url: String, message: String },
    #[error("tls configuration failure: {message}")]
    TlsConfig { message: String },
    #[error("client is closed")]
    Closed,
}

/// Connection-reset markers carried over verbatim; matching on them is part
/// of the classifier's contract so behaviour is portable across transports.
const CONNECTION_RESET_MARKERS: &[&str] = &[
    "connection reset",
    "An existing connection was forcibly closed",
    "client connection force closed via ClientConn.Close",
    "server sent GOAWAY and closed the connection",
];

const DNS_MARKERS: &[&str] = &[
    "dns error",
    "dns lookup failed",
    "failed to lookup address",
    "name or service not known",
    "no such host",
    "temporary failure in name resolution",
];

const TLS_MARKERS: &[&str] = &[
    "tls handshake",
    "certificate verify",
    "invalid certificate",
    "invalid peer certificate",
    "handshake failure",
    "received fatal alert",
];

fn contains_marker(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| {
        if marker.chars().any(char::is_uppercase) {
            text.contains(marker)
        } else {
            text.to_ascii_lowercase().contains(marker)
        }
    })
}

/// Maps a dispatch failure onto the transport-error taxonomy.
///
/// Cancellation is not classified here; the processor drops cancelled
/// dispatches without accounting them.
pub(crate) fn classify_failure(error: &Error) -> TransportError {
    let text = match error {
        Error::Timeout { .. } => return TransportError::Timeout,
        Error::Cancelled => return TransportError::NoError,
        Error::Transport { message, .. } => message.as_str(),
        Error::RawTransport { message, .. } => message.as_str(),
        _ => return TransportError::Unknown,
    };

    if contains_marker(text, &["timed out", "deadline has elapsed"]) {
        TransportError::Timeout
    } else if contains_marker(text, CONNECTION_RESET_MARKERS) {
        TransportError::ConnectionReset
    } else if text.to_ascii_lowercase().contains("unsupported protocol scheme")
        || text.to_ascii_lowercase().contains("invalid scheme")
    {
        TransportError::UnsupportedScheme
    } else if contains_marker(text, DNS_MARKERS) {
        TransportError::DnsError
    } else if contains_marker(text, TLS_MARKERS) {
        TransportError::TlsFailure
    } else {
        TransportError::Unknown
    }
}

/// Flattens an error and its source chain into one searchable string.
pub(crate) fn error_chain_text(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
