use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use reconx::{
    Client, ClientOptions, Error, PreparedRequest, RecordedResponse, Transport, TransportReply,
};

/// One scripted exchange for a route.
#[derive(Clone)]
enum Step {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: &'static str,
    },
    Fail(&'static str),
}

impl Step {
    fn ok() -> Self {
        Step::Respond {
            status: 200,
            headers: Vec::new(),
            body: "ok",
        }
    }

    fn status(status: u16) -> Self {
        Step::Respond {
            status,
            headers: Vec::new(),
            body: "",
        }
    }

    fn redirect(location: &str) -> Self {
        Step::Respond {
            status: 302,
            headers: vec![("location", location.to_owned())],
            body: "",
        }
    }
}

#[derive(Clone, Debug)]
struct Dispatch {
    path: String,
    cookie: Option<String>,
    query: Option<String>,
}

/// In-memory transport with per-path scripts; unknown routes answer 200.
/// Dispatches are recorded in order for ordering assertions.
#[derive(Default)]
struct ScriptedTransport {
    routes: Mutex<BTreeMap<String, VecDeque<Step>>>,
    repeating: Mutex<BTreeMap<String, Step>>,
    dispatched: Mutex<Vec<Dispatch>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, path: &str, steps: Vec<Step>) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_owned(), steps.into());
    }

    fn script_repeating(&self, path: &str, step: Step) {
        self.repeating
            .lock()
            .unwrap()
            .insert(path.to_owned(), step);
    }

    fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatched.lock().unwrap().clone()
    }

    fn dispatched_paths(&self) -> Vec<String> {
        self.dispatches().into_iter().map(|d| d.path).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn dispatch(
        &self,
        request: &PreparedRequest,
        _timeout: Duration,
    ) -> reconx::Result<TransportReply> {
        let path = request.url.path().to_owned();
        self.dispatched.lock().unwrap().push(Dispatch {
            path: path.clone(),
            cookie: request
                .headers
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
            query: request.url.query().map(str::to_owned),
        });

        let step = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(&path).and_then(VecDeque::pop_front) {
                Some(step) => step,
                None => self
                    .repeating
                    .lock()
                    .unwrap()
                    .get(&path)
                    .cloned()
                    .unwrap_or_else(Step::ok),
            }
        };

        match step {
            Step::Fail(message) => Err(Error::Transport {
                method: request.method.clone(),
                url: request.url.to_string(),
                message: message.to_owned(),
            }),
            Step::Respond {
                status,
                headers,
                body,
            } => {
                let mut header_map = HeaderMap::new();
                for (name, value) in headers {
                    header_map.append(
                        name.parse::<HeaderName>().unwrap(),
                        HeaderValue::from_str(&value).unwrap(),
                    );
                }
                Ok(TransportReply {
                    response: RecordedResponse {
                        status: StatusCode::from_u16(status).unwrap(),
                        headers: header_map,
                        body: Bytes::from_static(body.as_bytes()),
                        version: Version::HTTP_11,
                    },
                    ttfb: Some(Duration::from_millis(1)),
                })
            }
        }
    }
}

fn test_options() -> ClientOptions {
    let mut options = ClientOptions::default();
    options.performance.delay = reconx::DelayRange { min: 0.0, max: 0.0 };
    options
}

fn test_client(transport: &Arc<ScriptedTransport>, options: ClientOptions) -> Client {
    let transport: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
    Client::builder(options)
        .transport(transport)
        .terminate_process_on_abort(false)
        .build()
        .expect("build client")
}

fn get(url: &str) -> PreparedRequest {
    PreparedRequest::get(url).expect("request url")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn higher_priority_dispatches_first() {
    let transport = ScriptedTransport::new();
    let mut options = test_options();
    options.performance.requests_per_second = 1;
    let client = test_client(&transport, options.clone());

    let mut low = options.clone();
    low.request_priority = 1;
    let mut high = options.clone();
    high.request_priority = 5;

    let a = client
        .send_with_options(get("http://x.test/a"), low.clone())
        .await;
    let b = client.send_with_options(get("http://x.test/b"), high).await;
    let c = client.send_with_options(get("http://x.test/c"), low).await;

    a.await_resolution().await;
    b.await_resolution().await;
    c.await_resolution().await;

    assert_eq!(transport.dispatched_paths(), ["/b", "/a", "/c"]);
    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_chain_grafts_history_onto_the_handle() {
    let transport = ScriptedTransport::new();
    transport.script("/a", vec![Step::redirect("/b")]);
    transport.script(
        "/b",
        vec![Step::Respond {
            status: 200,
            headers: Vec::new(),
            body: "terminal",
        }],
    );
    let client = test_client(&transport, test_options());

    let handle = client.send(get("http://x.test/a")).await;
    let message = handle.await_resolution().await;

    assert_eq!(message.request().url.path(), "/b");
    assert_eq!(message.status().map(|s| s.as_u16()), Some(200));
    assert_eq!(message.redirect_depth(), 1);

    let hop = message.prev().expect("first hop preserved");
    assert_eq!(hop.request().url.path(), "/a");
    assert_eq!(hop.status().map(|s| s.as_u16()), Some(302));

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_site_redirects_are_blocked_by_default() {
    let transport = ScriptedTransport::new();
    transport.script("/", vec![Step::redirect("https://b.net/")]);
    let client = test_client(&transport, test_options());

    let handle = client.send(get("https://a.com/")).await;
    let message = handle.await_resolution().await;

    assert_eq!(message.status().map(|s| s.as_u16()), Some(302));
    assert!(message.cross_site_redirect());
    assert!(message.prev().is_none(), "no follow-up hop");
    assert_eq!(transport.dispatches().len(), 1);

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn max_redirect_depth_marks_the_record() {
    let transport = ScriptedTransport::new();
    transport.script_repeating("/hop", Step::redirect("/hop"));
    let mut options = test_options();
    options.redirection.max_redirects = 2;
    let client = test_client(&transport, options);

    let handle = client.send(get("http://x.test/hop")).await;
    let message = handle.await_resolution().await;

    assert!(message.max_redirects_exceeded());
    assert_eq!(message.redirect_depth(), 2);

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limited_requests_are_replayed() {
    let transport = ScriptedTransport::new();
    transport.script(
        "/limited",
        vec![
            Step::status(429),
            Step::Respond {
                status: 200,
                headers: Vec::new(),
                body: "after replay",
            },
        ],
    );
    let client = test_client(&transport, test_options());

    let handle = client.send(get("http://x.test/limited")).await;
    let message = handle.await_resolution().await;

    assert_eq!(message.status().map(|s| s.as_u16()), Some(200));
    assert!(message.rate_limited());
    assert_eq!(transport.dispatches().len(), 2);
    // 429 density feeds the governor and steps the target down by one.
    assert!(client.rate_governor().target() < 10);

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cookies_round_trip_through_the_jar() {
    let transport = ScriptedTransport::new();
    transport.script(
        "/set",
        vec![Step::Respond {
            status: 200,
            headers: vec![("set-cookie", "session=abc123; Path=/; HttpOnly".to_owned())],
            body: "",
        }],
    );
    let client = test_client(&transport, test_options());

    client
        .send(get("http://x.test/set"))
        .await
        .await_resolution()
        .await;
    assert_eq!(client.cookie_jar().get("session").map(String::as_str), Some("abc123"));

    client
        .send(get("http://x.test/next"))
        .await
        .await_resolution()
        .await;

    let next = transport
        .dispatches()
        .into_iter()
        .find(|d| d.path == "/next")
        .expect("second dispatch");
    assert!(
        next.cookie.as_deref().unwrap_or_default().contains("session=abc123"),
        "jar cookie attached: {:?}",
        next.cookie
    );

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn excluded_cookies_are_not_attached() {
    let transport = ScriptedTransport::new();
    let mut options = test_options();
    options.exclude_cookies = vec!["session".to_owned()];
    let client = test_client(&transport, options);
    client.add_cookie("session", "abc");
    client.add_cookie("theme", "dark");

    client
        .send(get("http://x.test/page"))
        .await
        .await_resolution()
        .await;

    let dispatch = &transport.dispatches()[0];
    let cookie = dispatch.cookie.as_deref().unwrap_or_default();
    assert!(cookie.contains("theme=dark"));
    assert!(!cookie.contains("session"));

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_followups_reapply_cache_busting() {
    let transport = ScriptedTransport::new();
    transport.script("/a", vec![Step::redirect("/b")]);
    let mut options = test_options();
    options.cache_busting = reconx::CacheBustingOptions {
        query: true,
        static_cache_buster: Some("staticbuster".to_owned()),
        ..Default::default()
    };
    let client = test_client(&transport, options);

    let message = client
        .send(get("http://x.test/a"))
        .await
        .await_resolution()
        .await;
    assert_eq!(message.request().url.path(), "/b");

    for dispatch in transport.dispatches() {
        assert_eq!(
            dispatch.query.as_deref(),
            Some("cacheBuster=staticbuster"),
            "every hop carries a freshly applied buster: {dispatch:?}"
        );
    }

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refuted_ban_check_keeps_the_client_running() {
    let transport = ScriptedTransport::new();
    transport.script_repeating("/fail", Step::Fail("something exotic happened"));
    let mut options = test_options();
    options.error_handling.consecutive_threshold = 2;
    options.error_handling.percentage_threshold = 0;
    options.error_handling.verify_ip_ban_if_exceeded = true;
    options.error_handling.report_errors_if_exceeded = false;
    let client = test_client(&transport, options);

    // A successful exchange gives the ban check a differing-outcome probe.
    client
        .send(get("http://x.test/ok"))
        .await
        .await_resolution()
        .await;

    for _ in 0..3 {
        client
            .send(get("http://x.test/fail"))
            .await
            .await_resolution()
            .await;
    }

    assert!(!client.is_closed(), "refuted probe abandons the escalation");
    let ok_dispatches = transport
        .dispatched_paths()
        .iter()
        .filter(|path| path.as_str() == "/ok")
        .count();
    assert!(ok_dispatches >= 2, "the probe re-submitted the 200 exchange");

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn confirmed_ban_aborts_the_engine() {
    let transport = ScriptedTransport::new();
    transport.script_repeating("/fail", Step::Fail("something exotic happened"));
    let mut options = test_options();
    options.error_handling.consecutive_threshold = 2;
    options.error_handling.percentage_threshold = 0;
    options.error_handling.verify_ip_ban_if_exceeded = true;
    options.error_handling.report_errors_if_exceeded = false;
    let client = test_client(&transport, options);

    // Every logged outcome matches the failure, so the probe confirms.
    for _ in 0..3 {
        client
            .send(get("http://x.test/fail"))
            .await
            .await_resolution()
            .await;
    }

    assert!(client.is_closed(), "confirmed ban terminates the engine");

    // Submissions after the abort resolve immediately with no response.
    let message = client
        .send(get("http://x.test/after"))
        .await
        .await_resolution()
        .await;
    assert!(message.response().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_drains_without_losing_requests() {
    let transport = ScriptedTransport::new();
    let mut options = test_options();
    options.performance.requests_per_second = 50;
    let client = test_client(&transport, options);

    let mut handles = Vec::new();
    for i in 0..30 {
        handles.push(
            client
                .send(get(&format!("http://x.test/burst/{i}")))
                .await,
        );
    }
    for handle in &handles {
        let message = handle.await_resolution().await;
        assert!(message.response().is_some(), "no request is lost");
    }
    assert_eq!(transport.dispatches().len(), 30);

    // With the queue drained the pool falls back toward a single worker.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(client.active_worker_count() <= 2);

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_resolves_pending_submissions() {
    let transport = ScriptedTransport::new();
    let client = test_client(&transport, test_options());

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(client.send(get(&format!("http://x.test/pending/{i}"))).await);
    }
    client.close();

    for handle in handles {
        let message = handle.await_resolution().await;
        assert!(message.response().is_none());
    }
    assert!(client.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn default_options_simulate_browser_headers() {
    let transport = ScriptedTransport::new();
    let client = test_client(&transport, test_options());

    let message = client
        .send(get("http://x.test/app.js"))
        .await
        .await_resolution()
        .await;

    let request = message.request();
    assert_eq!(
        request
            .headers
            .get("sec-fetch-dest")
            .and_then(|v| v.to_str().ok()),
        Some("script")
    );

    client.close();
}
