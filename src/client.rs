use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use http::Version;
use http::header::{CONNECTION, HeaderName, HeaderValue, TRANSFER_ENCODING, UPGRADE, USER_AGENT};
use tokio_util::sync::CancellationToken;
use tracing::error;
use url::Url;

use crate::cookies::CookieJar;
use crate::core::accountant::ErrorAccountant;
use crate::core::log::MessageLog;
use crate::core::pool::{WorkerPool, spawn_supervisor};
use crate::core::queue::{DEFAULT_QUEUE_CAPACITY, PendingItem, PriorityQueueSet};
use crate::core::rate::RateGovernor;
use crate::error::TransportError;
use crate::http::gateway::{GatewayProvider, NoGatewayProvider, ProvisionedGateway, base_url_of};
use crate::http::simulate::{random_user_agent, simulate_browser_request};
use crate::message::{Message, MessageHandle, PreparedRequest};
use crate::options::ClientOptions;
use crate::transport::{HyperTransport, RawTransport, Transport};
use crate::util::lock_unpoisoned;

/// Builds a [`Client`] with non-default wiring: an external cancellation
/// token, a different queue capacity, a scripted transport or a real
/// egress-gateway provider.
pub struct ClientBuilder {
    options: ClientOptions,
    cancel: Option<CancellationToken>,
    queue_capacity: usize,
    transport: Option<Arc<dyn Transport>>,
    gateway_provider: Arc<dyn GatewayProvider>,
    exit_process_on_abort: bool,
}

impl ClientBuilder {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            cancel: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            transport: None,
            gateway_provider: Arc::new(NoGatewayProvider),
            exit_process_on_abort: true,
        }
    }

    /// Ties the engine's lifetime to an external token; cancelling it
    /// drains the queues and resolves every pending message.
    pub fn cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Replaces the wire transport. SNI one-shot construction is skipped
    /// when an override is installed.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn gateway_provider(mut self, provider: Arc<dyn GatewayProvider>) -> Self {
        self.gateway_provider = provider;
        self
    }

    /// A threshold abort normally logs fatally and exits the process.
    /// Disabling this turns the abort into an engine cancellation instead,
    /// which embedding applications (and tests) can observe.
    pub fn terminate_process_on_abort(mut self, terminate: bool) -> Self {
        self.exit_process_on_abort = terminate;
        self
    }

    /// Constructs the engine and starts the supervisor. Must be called
    /// within a tokio runtime.
    pub fn build(self) -> crate::Result<Client> {
        let transport_overridden = self.transport.is_some();
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::from_options(&self.options)?),
        };

        let core = Arc::new(ClientCore {
            cancel: self.cancel.unwrap_or_default(),
            queues: PriorityQueueSet::new(self.queue_capacity),
            pool: WorkerPool::new(self.options.performance.delay),
            rate: RateGovernor::new(self.options.performance.requests_per_second),
            message_log: MessageLog::new(),
            cookie_jar: CookieJar::new(),
            accountant: ErrorAccountant::new(),
            raw_transport: RawTransport::new()?,
            transport,
            transport_overridden,
            gateway_provider: self.gateway_provider,
            gateways: Mutex::new(BTreeMap::new()),
            exit_process_on_abort: self.exit_process_on_abort,
            options: self.options,
        });
        spawn_supervisor(Arc::clone(&core));

        Ok(Client { core })
    }
}

/// The public dispatch engine: accepts prepared requests, schedules them
/// under the rate target and returns a handle per submission. Cloning is
/// cheap; clones share the same engine.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Engine with default wiring; `options` seed the rate target, worker
    /// delay and the per-request defaults.
    pub fn new(options: ClientOptions) -> crate::Result<Self> {
        ClientBuilder::new(options).build()
    }

    pub fn builder(options: ClientOptions) -> ClientBuilder {
        ClientBuilder::new(options)
    }

    /// Submits a request under the client's default options.
    pub async fn send(&self, request: PreparedRequest) -> MessageHandle {
        self.send_with_options(request, self.core.options.clone())
            .await
    }

    /// Submits a request under a caller-supplied options snapshot.
    pub async fn send_with_options(
        &self,
        request: PreparedRequest,
        options: ClientOptions,
    ) -> MessageHandle {
        self.core.submit(request, options, None, None).await
    }

    /// Submits raw request bytes to be written verbatim against `base_url`.
    pub async fn send_raw(&self, raw: &str, base_url: &str) -> crate::Result<MessageHandle> {
        self.send_raw_with_options(raw, base_url, self.core.options.clone())
            .await
    }

    pub async fn send_raw_with_options(
        &self,
        raw: &str,
        base_url: &str,
        options: ClientOptions,
    ) -> crate::Result<MessageHandle> {
        let request = PreparedRequest::get(base_url)?;
        Ok(self
            .core
            .submit(request, options, Some(raw.to_owned()), None)
            .await)
    }

    /// Cancels the engine: releases provisioned gateways, closes the
    /// queues and resolves every pending message with no response.
    pub fn close(&self) {
        let gateways: Vec<ProvisionedGateway> = {
            let mut map = lock_unpoisoned(&self.core.gateways);
            std::mem::take(&mut *map).into_values().collect()
        };
        for gateway in &gateways {
            self.core.gateway_provider.release(gateway);
        }

        self.core.cancel.cancel();
        for item in self.core.queues.close_and_drain() {
            item.message.resolve();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.cancel.is_cancelled()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.core.options
    }

    /// Defensive copy of the cookie jar.
    pub fn cookie_jar(&self) -> BTreeMap<String, String> {
        self.core.cookie_jar.all()
    }

    pub fn add_cookie(&self, name: &str, value: &str) {
        self.core.cookie_jar.insert(name, value);
    }

    pub fn message_log(&self) -> MessageLog {
        self.core.message_log.clone()
    }

    pub fn rate_governor(&self) -> &RateGovernor {
        &self.core.rate
    }

    pub fn set_requests_per_second(&self, rate: u32) {
        self.core.rate.change_rate(rate);
    }

    pub fn active_worker_count(&self) -> usize {
        self.core.pool.active_workers()
    }

    pub fn locked_worker_count(&self) -> usize {
        self.core.pool.locked_workers()
    }

    /// Human-readable accounting of everything that went wrong so far.
    pub fn error_summary(&self) -> String {
        self.core.error_summary()
    }
}

/// Shared engine state behind the facade. The processor re-enters
/// [`ClientCore::submit`] for redirects, replays, transport retries and
/// ban probes.
pub(crate) struct ClientCore {
    pub(crate) options: ClientOptions,
    pub(crate) cancel: CancellationToken,
    pub(crate) queues: PriorityQueueSet,
    pub(crate) pool: WorkerPool,
    pub(crate) rate: RateGovernor,
    pub(crate) message_log: MessageLog,
    pub(crate) cookie_jar: CookieJar,
    pub(crate) accountant: ErrorAccountant,
    pub(crate) transport: Arc<dyn Transport>,
    transport_overridden: bool,
    pub(crate) raw_transport: RawTransport,
    gateway_provider: Arc<dyn GatewayProvider>,
    gateways: Mutex<BTreeMap<String, ProvisionedGateway>>,
    exit_process_on_abort: bool,
}

impl ClientCore {
    /// Facade pipeline: pre-flight transforms, then enqueue under the
    /// snapshot's priority. Raw submissions skip the header pipeline; the
    /// bytes are the request.
    pub(crate) async fn submit(
        &self,
        request: PreparedRequest,
        options: ClientOptions,
        raw: Option<String>,
        prev: Option<Arc<Message>>,
    ) -> MessageHandle {
        let mut request = request;
        if raw.is_none() {
            self.prepare_request(&mut request, &options);
        }

        let message = Message::new(request);
        if let Some(prev) = prev {
            message.set_prev(prev);
        }
        let handle = MessageHandle::new(Arc::clone(&message));

        if self.cancel.is_cancelled() {
            message.resolve();
            return handle;
        }

        let item = PendingItem {
            raw,
            message: Arc::clone(&message),
            options: options.clone(),
        };
        if self.queues.enqueue(options.request_priority, item).await.is_err() {
            message.resolve();
        }
        handle
    }

    fn prepare_request(&self, request: &mut PreparedRequest, options: &ClientOptions) {
        self.rewrite_via_gateway(request);

        if options.simulate_browser_requests {
            simulate_browser_request(request);
        }

        if options.randomize_user_agent {
            request
                .headers
                .insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
        }

        for (name, value) in &options.default_headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                request.headers.insert(name, value);
            }
        }

        collapse_multi_valued_headers(request);

        if request.version == Version::HTTP_2 {
            request.headers.remove(CONNECTION);
            request.headers.remove(UPGRADE);
            request.headers.remove(TRANSFER_ENCODING);
        }

        for (name, value) in self.cookie_jar.all() {
            if options.exclude_cookies.contains(&name) || request.contains_cookie(&name) {
                continue;
            }
            request.add_cookie(&name, &value);
        }

        options.cache_busting.apply(request);
    }

    /// Rewrites URLs under a provisioned base URL to the gateway proxy.
    fn rewrite_via_gateway(&self, request: &mut PreparedRequest) {
        let gateways = lock_unpoisoned(&self.gateways);
        if gateways.is_empty() {
            return;
        }
        let url_text = request.url.to_string();
        for (base_url, gateway) in gateways.iter() {
            if url_text.contains(base_url.as_str()) {
                let rewritten = url_text.replacen(base_url.as_str(), &gateway.proxy_url, 1);
                match Url::parse(&rewritten) {
                    Ok(url) => request.url = url,
                    Err(_) => error!(url = %url_text, "failed to rewrite url to egress gateway"),
                }
                return;
            }
        }
    }

    pub(crate) fn has_transport_override(&self) -> bool {
        self.transport_overridden
    }

    /// Provisions (once) an egress gateway for the URL's base. Returns
    /// whether rotation is in place.
    pub(crate) fn enable_ip_rotate(&self, url: &Url) -> bool {
        let base_url = base_url_of(url);
        let mut gateways = lock_unpoisoned(&self.gateways);
        if gateways.contains_key(&base_url) {
            return true;
        }
        match self.gateway_provider.provision(url) {
            Ok(gateway) => {
                gateways.insert(base_url, gateway);
                true
            }
            Err(provision_error) => {
                error!("error while creating egress gateway for ip rotation: {provision_error}");
                false
            }
        }
    }

    /// Terminal escalation: fatal log, engine shutdown and (by default)
    /// process exit.
    pub(crate) fn fatal_abort(&self, reason: &str) {
        error!("{reason}, exiting");
        self.cancel.cancel();
        for item in self.queues.close_and_drain() {
            item.message.resolve();
        }
        if self.exit_process_on_abort {
            std::process::exit(1);
        }
    }

    pub(crate) fn error_summary(&self) -> String {
        let timeouts = self
            .message_log
            .search(|entry| entry.transport_error() == TransportError::Timeout)
            .len();
        let connection_resets = self
            .message_log
            .search(|entry| entry.transport_error() == TransportError::ConnectionReset)
            .len();
        let generic = self
            .message_log
            .search(|entry| {
                matches!(
                    entry.transport_error(),
                    TransportError::Unknown
                        | TransportError::TlsFailure
                        | TransportError::DnsError
                        | TransportError::UnsupportedScheme
                )
            })
            .len();

        let error_handling = &self.options.error_handling;
        let mut grouped: BTreeMap<u16, usize> = BTreeMap::new();
        for entry in self.message_log.search(|entry| {
            entry
                .status()
                .is_some_and(|status| status.as_u16() >= 400 && error_handling.matches(status.as_u16()))
        }) {
            if let Some(status) = entry.status() {
                *grouped.entry(status.as_u16()).or_default() += 1;
            }
        }

        let (failed, successful) = self.accountant.totals();
        let mut summary = format!(
            "Timeouts: {timeouts}, ConnectionReset: {connection_resets}, GenericTransportError: {generic}\n"
        );
        for (status, count) in &grouped {
            summary.push_str(&format!("{status}: {count}, "));
        }
        summary.push_str(&format!("failed: {failed}, successful: {successful}"));
        summary
    }
}

fn collapse_multi_valued_headers(request: &mut PreparedRequest) {
    let names: Vec<HeaderName> = request.headers.keys().cloned().collect();
    for name in names {
        let mut values = request.headers.get_all(&name).iter();
        let first = values.next().cloned();
        let has_more = values.next().is_some();
        if let (Some(first), true) = (first, has_more) {
            request.headers.insert(name, first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::collapse_multi_valued_headers;
    use crate::message::PreparedRequest;

    #[test]
    fn multi_valued_headers_collapse_to_the_first_value() {
        let mut request = PreparedRequest::get("http://example.com/").unwrap();
        request.headers.append("x-forwarded-for", "1.1.1.1".parse().unwrap());
        request.headers.append("x-forwarded-for", "2.2.2.2".parse().unwrap());
        request.headers.append("accept", "text/html".parse().unwrap());

        collapse_multi_valued_headers(&mut request);

        let values: Vec<_> = request.headers.get_all("x-forwarded-for").iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "1.1.1.1");
        assert_eq!(request.headers.get("accept").unwrap(), "text/html");
    }
}
