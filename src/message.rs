use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::sync::watch;
use url::Url;

use crate::error::{Error, TransportError};
use crate::http::cache_busting::DEFAULT_CACHE_BUSTER_PARAM;
use crate::http::location::to_absolute;
use crate::util::lock_unpoisoned;

/// A request as the engine dispatches it: method, absolute URL, headers and
/// a replayable body. Cloning is cheap enough that redirect and replay
/// follow-ups simply copy the record.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub version: Version,
}

impl PreparedRequest {
    pub fn new(method: Method, url: &str) -> crate::Result<Self> {
        let url = Url::parse(url).map_err(|_| Error::InvalidUrl {
            url: url.to_owned(),
        })?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            version: Version::HTTP_11,
        })
    }

    pub fn get(url: &str) -> crate::Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str, body: impl Into<Bytes>) -> crate::Result<Self> {
        let mut request = Self::new(Method::POST, url)?;
        request.body = body.into();
        Ok(request)
    }

    pub fn header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        let name = name
            .parse::<HeaderName>()
            .map_err(|_| Error::InvalidHeaderName {
                name: name.to_owned(),
            })?;
        let value = HeaderValue::from_str(value).map_err(|_| Error::InvalidHeaderValue {
            name: name.as_str().to_owned(),
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub(crate) fn set_header_if_absent(&mut self, name: HeaderName, value: HeaderValue) {
        if !self.headers.contains_key(&name) {
            self.headers.insert(name, value);
        }
    }

    /// True when the request already carries the named cookie.
    pub(crate) fn contains_cookie(&self, cookie_name: &str) -> bool {
        self.headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.split_once('='))
            .any(|(name, _)| name.trim() == cookie_name)
    }

    /// Appends a cookie pair to the request's `Cookie` header.
    pub(crate) fn add_cookie(&mut self, name: &str, value: &str) {
        let pair = format!("{name}={value}");
        let merged = match self.headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}; {pair}"),
            _ => pair,
        };
        if let Ok(value) = HeaderValue::from_str(&merged) {
            self.headers.insert(COOKIE, value);
        }
    }
}

impl TryFrom<http::Request<Bytes>> for PreparedRequest {
    type Error = Error;

    fn try_from(request: http::Request<Bytes>) -> Result<Self, Self::Error> {
        let (parts, body) = request.into_parts();
        let url = Url::parse(&parts.uri.to_string()).map_err(|_| Error::InvalidUrl {
            url: parts.uri.to_string(),
        })?;
        Ok(Self {
            method: parts.method,
            url,
            headers: parts.headers,
            body,
            version: parts.version,
        })
    }
}

/// A fully buffered response with the body already decoded.
#[derive(Clone, Debug)]
pub struct RecordedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub version: Version,
}

impl RecordedResponse {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Name/value pairs from every `Set-Cookie` header, attributes dropped.
    pub(crate) fn set_cookie_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .filter_map(|pair| pair.split_once('='))
            .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
            .collect()
    }
}

/// Mutable view of one request/response exchange. Owned by the processor on
/// the worker that dequeued it until the resolution signal fires.
#[derive(Clone, Debug)]
pub struct MessageState {
    pub request: PreparedRequest,
    pub response: Option<RecordedResponse>,
    pub transport_error: TransportError,
    pub duration: Option<Duration>,
    pub prev: Option<Arc<Message>>,
    pub cross_origin_redirect: bool,
    pub cross_site_redirect: bool,
    pub max_redirects_exceeded: bool,
    pub rate_limited: bool,
}

impl MessageState {
    fn new(request: PreparedRequest) -> Self {
        Self {
            request,
            response: None,
            transport_error: TransportError::NoError,
            duration: None,
            prev: None,
            cross_origin_redirect: false,
            cross_site_redirect: false,
            max_redirects_exceeded: false,
            rate_limited: false,
        }
    }
}

/// One logical request/response exchange (a duplex record): the prepared
/// request, the response once resolved, the transport-error kind, the
/// redirect back-link and a single-shot resolution signal.
#[derive(Debug)]
pub struct Message {
    state: Mutex<MessageState>,
    resolved: AtomicBool,
    resolution: watch::Sender<bool>,
}

impl Message {
    pub(crate) fn new(request: PreparedRequest) -> Arc<Self> {
        let (resolution, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(MessageState::new(request)),
            resolved: AtomicBool::new(false),
            resolution,
        })
    }

    /// Builds an already-resolved record; used to preserve a hop's
    /// pre-follow state when grafting a redirect chain.
    pub(crate) fn resolved_from_state(state: MessageState) -> Arc<Self> {
        let (resolution, _) = watch::channel(true);
        Arc::new(Self {
            state: Mutex::new(state),
            resolved: AtomicBool::new(true),
            resolution,
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.resolution.subscribe()
    }

    /// Fires the resolution signal. Idempotent; only the first call wakes
    /// awaiting callers, so exactly one resolution is observable.
    pub(crate) fn resolve(&self) {
        if !self.resolved.swap(true, Ordering::SeqCst) {
            let _ = self.resolution.send(true);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MessageState {
        lock_unpoisoned(&self.state).clone()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut MessageState) -> R) -> R {
        f(&mut lock_unpoisoned(&self.state))
    }

    /// Replaces the record's state wholesale (redirect graft, replay).
    pub(crate) fn overwrite_state(&self, state: MessageState) {
        *lock_unpoisoned(&self.state) = state;
    }

    pub(crate) fn set_prev(&self, prev: Arc<Message>) {
        lock_unpoisoned(&self.state).prev = Some(prev);
    }

    pub fn request(&self) -> PreparedRequest {
        lock_unpoisoned(&self.state).request.clone()
    }

    pub fn response(&self) -> Option<RecordedResponse> {
        lock_unpoisoned(&self.state).response.clone()
    }

    pub fn status(&self) -> Option<StatusCode> {
        lock_unpoisoned(&self.state)
            .response
            .as_ref()
            .map(|response| response.status)
    }

    pub fn transport_error(&self) -> TransportError {
        lock_unpoisoned(&self.state).transport_error
    }

    pub fn duration(&self) -> Option<Duration> {
        lock_unpoisoned(&self.state).duration
    }

    pub fn prev(&self) -> Option<Arc<Message>> {
        lock_unpoisoned(&self.state).prev.clone()
    }

    pub fn cross_origin_redirect(&self) -> bool {
        lock_unpoisoned(&self.state).cross_origin_redirect
    }

    pub fn cross_site_redirect(&self) -> bool {
        lock_unpoisoned(&self.state).cross_site_redirect
    }

    pub fn max_redirects_exceeded(&self) -> bool {
        lock_unpoisoned(&self.state).max_redirects_exceeded
    }

    pub fn rate_limited(&self) -> bool {
        lock_unpoisoned(&self.state).rate_limited
    }

    /// Number of hops behind this record.
    pub fn redirect_depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.prev();
        while let Some(hop) = cursor {
            depth += 1;
            cursor = hop.prev();
        }
        depth
    }

    /// True when the response's `Location` resolves back to the request URL
    /// (with or without the default cache-buster query parameter).
    pub fn is_redirect_loop(&self) -> bool {
        let state = self.snapshot();
        let Some(response) = &state.response else {
            return false;
        };
        let Some(location) = response
            .headers
            .get(http::header::LOCATION)
            .and_then(|value| value.to_str().ok())
        else {
            return false;
        };

        let with_buster = state.request.url.to_string();
        let mut stripped = state.request.url.clone();
        let remaining: Vec<(String, String)> = stripped
            .query_pairs()
            .filter(|(name, _)| name != DEFAULT_CACHE_BUSTER_PARAM)
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        if remaining.is_empty() {
            stripped.set_query(None);
        } else {
            stripped
                .query_pairs_mut()
                .clear()
                .extend_pairs(remaining.iter().map(|(n, v)| (n.as_str(), v.as_str())));
        }
        let without_buster = stripped.to_string();

        let target = to_absolute(&without_buster, location);
        target == without_buster || target == with_buster
    }
}

/// Caller-side view of a submitted message: submit, await, read.
#[derive(Clone, Debug)]
pub struct MessageHandle {
    message: Arc<Message>,
    receiver: watch::Receiver<bool>,
}

impl MessageHandle {
    pub(crate) fn new(message: Arc<Message>) -> Self {
        let receiver = message.subscribe();
        Self { message, receiver }
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// Suspends until the record's resolution signal fires. Every read of
    /// the returned record is safe without further synchronization.
    pub async fn await_resolution(&self) -> Arc<Message> {
        let mut receiver = self.receiver.clone();
        let _ = receiver.wait_for(|resolved| *resolved).await;
        Arc::clone(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::{Message, MessageHandle, PreparedRequest};
    use crate::error::TransportError;

    fn request(url: &str) -> PreparedRequest {
        PreparedRequest::get(url).expect("parse request url")
    }

    #[test]
    fn resolution_fires_exactly_once() {
        let message = Message::new(request("http://example.com/"));
        let mut receiver = message.subscribe();
        assert!(!message.is_resolved());

        message.resolve();
        message.resolve();

        assert!(message.is_resolved());
        assert!(*receiver.borrow_and_update());
    }

    #[tokio::test]
    async fn handle_awaits_resolution_after_the_fact() {
        let message = Message::new(request("http://example.com/"));
        let handle = MessageHandle::new(std::sync::Arc::clone(&message));
        message.resolve();

        let resolved = handle.await_resolution().await;
        assert!(resolved.is_resolved());
        assert_eq!(resolved.transport_error(), TransportError::NoError);
    }

    #[test]
    fn redirect_depth_walks_prev_chain() {
        let first = Message::new(request("http://example.com/a"));
        let second = Message::new(request("http://example.com/b"));
        let third = Message::new(request("http://example.com/c"));

        second.set_prev(first);
        third.set_prev(second);

        assert_eq!(third.redirect_depth(), 2);
    }

    #[test]
    fn cookie_helpers_parse_and_append() {
        let mut req = request("http://example.com/");
        assert!(!req.contains_cookie("session"));

        req.add_cookie("session", "abc");
        req.add_cookie("theme", "dark");

        assert!(req.contains_cookie("session"));
        assert!(req.contains_cookie("theme"));
        let header = req
            .headers
            .get(http::header::COOKIE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert_eq!(header, "session=abc; theme=dark");
    }
}
