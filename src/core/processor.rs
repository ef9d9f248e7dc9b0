use std::sync::Arc;
use std::time::Duration;

use http::header::{COOKIE, HOST};
use tracing::{debug, error, warn};
use url::Url;

use crate::client::ClientCore;
use crate::core::decode::{decode_body, update_content_length};
use crate::core::queue::PendingItem;
use crate::error::{Error, TransportError, classify_failure};
use crate::http::location::redirect_location;
use crate::http::origin::{is_cross_origin, is_cross_site};
use crate::message::{Message, MessageState, PreparedRequest};
use crate::options::{BAN_CHECK_PRIORITY, ClientOptions};
use crate::transport::{HyperTransport, Transport, TransportReply};

/// Fires the record's resolution when the processor unwinds, so exactly one
/// resolution is observable per message no matter which path (or panic)
/// exits first.
struct ResolveGuard(Arc<Message>);

impl Drop for ResolveGuard {
    fn drop(&mut self) {
        self.0.resolve();
    }
}

/// Runs one dequeued work item through the per-message state machine:
/// dispatch, decode, cookie harvest, classification, redirect/replay/retry
/// follow-ups and threshold escalation.
pub(crate) async fn process(core: &Arc<ClientCore>, item: PendingItem) {
    let _resolve = ResolveGuard(Arc::clone(&item.message));
    run(core, item).await;
}

async fn run(core: &Arc<ClientCore>, item: PendingItem) {
    let PendingItem {
        raw,
        message,
        mut options,
    } = item;

    let request = message.request();
    let timeout = Duration::from_secs(options.performance.timeout.max(1));
    // Ban probes bypass the accountant: their outcome answers a question
    // about the egress address and must not shift the counters it reads.
    let is_probe = options.request_priority == BAN_CHECK_PRIORITY;
    let outcome = dispatch(core, raw.as_deref(), &request, &options, timeout).await;

    core.message_log.append(Arc::clone(&message));

    let reply = match outcome {
        Err(Error::Cancelled) => return,
        Err(failure) => {
            let kind = classify_failure(&failure);
            debug!(url = %request.url, kind = %kind, "transport failure: {failure}");
            message.with_state(|state| state.transport_error = kind);
            if !is_probe {
                handle_classified_error(core, &message, &options, kind.as_str()).await;
            }
            if options.error_handling.retry_transport_failures && !core.cancel.is_cancelled() {
                retry_dispatch(core, &message, raw, &options).await;
            }
            return;
        }
        Ok(reply) => reply,
    };

    let mut response = reply.response;
    match decode_body(response.body.clone(), &response.headers) {
        Ok(decoded) => {
            update_content_length(&mut response.headers, decoded.len());
            response.body = decoded;
        }
        Err(decode_error) => {
            error!(
                url = %request.url,
                encoding = %decode_error.encoding,
                "error while reading response: {}",
                decode_error.message
            );
        }
    }

    let status = response.status;
    debug!(url = %request.url, status = %status, length = response.body.len(), "response");

    if options.maintain_cookie_jar {
        for (name, value) in response.set_cookie_pairs() {
            core.cookie_jar.insert(&name, &value);
        }
    }

    message.with_state(|state| {
        state.response = Some(response);
        state.duration = reply.ttfb;
    });

    if !is_probe {
        if status.as_u16() >= 400 && options.error_handling.matches(status.as_u16()) {
            handle_classified_error(core, &message, &options, &status.as_u16().to_string()).await;
        } else {
            core.accountant.record_success();
        }
    }

    if status.is_redirection() {
        handle_redirect(core, &message, &mut options).await;
        return;
    }

    if status.as_u16() == 429 || status.as_u16() == 529 {
        handle_rate_limit(core, &message, &options).await;
    }
}

/// Picks the transport for the item: raw bytes go out verbatim, an SNI
/// override gets a one-shot client, everything else shares the pooled
/// transport. Cancellation short-circuits to `Error::Cancelled`.
async fn dispatch(
    core: &Arc<ClientCore>,
    raw: Option<&str>,
    request: &PreparedRequest,
    options: &ClientOptions,
    timeout: Duration,
) -> crate::Result<TransportReply> {
    let send = async {
        if let Some(raw) = raw {
            return core
                .raw_transport
                .dispatch_raw(raw, &request.url, timeout)
                .await
                .map(|response| TransportReply {
                    response,
                    ttfb: None,
                });
        }

        let sni_override = options
            .connection
            .sni
            .as_deref()
            .is_some_and(|sni| !sni.is_empty());
        if sni_override && !core.has_transport_override() {
            let one_shot = HyperTransport::from_options(options)?;
            return one_shot.dispatch(request, timeout).await;
        }

        core.transport.dispatch(request, timeout).await
    };

    tokio::select! {
        result = send => result,
        _ = core.cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// Transport retry: the request goes back through the facade under the
/// same frozen options. A persistently dead host still terminates through
/// the error thresholds.
async fn retry_dispatch(
    core: &Arc<ClientCore>,
    message: &Arc<Message>,
    raw: Option<String>,
    options: &ClientOptions,
) {
    let handle = core
        .submit(message.request(), options.clone(), raw, None)
        .await;
    let resolved = {
        let _locked = core.pool.lock_scope();
        handle.await_resolution().await
    };
    message.overwrite_state(resolved.snapshot());
}

async fn handle_classified_error(
    core: &Arc<ClientCore>,
    message: &Arc<Message>,
    options: &ClientOptions,
    kind_label: &str,
) {
    core.accountant.record_error(kind_label);
    let Some(plan) = core.accountant.evaluate(&options.error_handling) else {
        return;
    };

    if plan.verify_ban {
        match verify_ip_ban(core, message, options).await {
            BanVerdict::Refuted => {
                warn!("no ip ban detected, continuing");
                return;
            }
            BanVerdict::AlreadyRunning => return,
            BanVerdict::Confirmed => warn!("ip ban detected"),
        }
    }

    if plan.rotate_ip && core.enable_ip_rotate(&message.request().url) {
        return;
    }

    if plan.report {
        error!("{}", core.error_summary());
    }
    core.fatal_abort(&plan.reason.to_string());
}

enum BanVerdict {
    Confirmed,
    Refuted,
    AlreadyRunning,
}

/// Re-submits a previously-different-outcome request at probe priority and
/// compares outcomes. A still-matching outcome means the recent failures
/// are not request-specific: the egress address is burned.
async fn verify_ip_ban(
    core: &Arc<ClientCore>,
    failing: &Arc<Message>,
    options: &ClientOptions,
) -> BanVerdict {
    if !core.accountant.try_begin_ban_check() {
        return BanVerdict::AlreadyRunning;
    }
    warn!("potential ip ban detected, verifying");

    let failing_state = failing.snapshot();
    let probe_source = pick_probe_source(core, &failing_state);
    let Some(probe_source) = probe_source else {
        core.accountant.finish_ban_check();
        return BanVerdict::Confirmed;
    };

    let mut probe_options = options.clone();
    probe_options.request_priority = BAN_CHECK_PRIORITY;
    probe_options.performance.replay_rate_limited = false;

    let handle = core
        .submit(probe_source.request(), probe_options, None, None)
        .await;
    let probe = {
        let _locked = core.pool.lock_scope();
        handle.await_resolution().await
    };
    core.accountant.finish_ban_check();

    if probe_outcome_matches(&probe, &failing_state) {
        BanVerdict::Confirmed
    } else {
        BanVerdict::Refuted
    }
}

/// Prefers a logged message whose outcome differs from the failing one; a
/// probe that *changes* outcome is evidence against a blanket ban. Falls
/// back to the most recent record.
fn pick_probe_source(core: &Arc<ClientCore>, failing: &MessageState) -> Option<Arc<Message>> {
    let differing = core.message_log.find(|entry| match &failing.response {
        None => entry.transport_error() != failing.transport_error,
        Some(response) => entry
            .status()
            .is_some_and(|status| status != response.status),
    });
    differing.or_else(|| core.message_log.recent(1).into_iter().next())
}

fn probe_outcome_matches(probe: &Arc<Message>, failing: &MessageState) -> bool {
    if failing.transport_error != TransportError::NoError {
        return probe.transport_error() == failing.transport_error;
    }
    match (&failing.response, probe.status()) {
        (Some(response), Some(probe_status)) => probe_status == response.status,
        // No status to compare on the probe side: assume the ban holds.
        (Some(_), None) => true,
        (None, _) => true,
    }
}

/// 3xx handling: absolutize the target, stamp the cross-origin/site flags,
/// apply policy, then follow by re-entering the facade and grafting the
/// follow-up's state onto this record. The caller ends up holding the
/// terminal hop; the full chain stays reachable through `prev`.
async fn handle_redirect(
    core: &Arc<ClientCore>,
    message: &Arc<Message>,
    options: &mut ClientOptions,
) {
    let state = message.snapshot();
    let Some(response) = state.response.clone() else {
        return;
    };

    let request_url_text = state.request.url.to_string();
    let absolute_target = redirect_location(&state.request.url, &response.headers);

    let cross_origin = is_cross_origin(&request_url_text, &absolute_target);
    let cross_site = is_cross_site(&request_url_text, &absolute_target);
    message.with_state(|current| {
        current.cross_origin_redirect = cross_origin;
        current.cross_site_redirect = cross_site;
    });

    if options.redirection.prevent_cross_origin_redirects && cross_origin {
        return;
    }
    if options.redirection.prevent_cross_site_redirects && cross_site {
        return;
    }

    options.redirection.current_depth += 1;
    if options.redirection.current_depth > options.redirection.max_redirects {
        message.with_state(|current| current.max_redirects_exceeded = true);
        return;
    }
    if !options.redirection.follow_redirects {
        return;
    }

    let Ok(target_url) = Url::parse(&absolute_target) else {
        debug!(target = %absolute_target, "redirect target did not parse, stopping");
        return;
    };

    let mut follow_request = state.request.clone();
    // Stale cookies must not override the jar re-injection on the next hop.
    follow_request.headers.remove(COOKIE);
    follow_request.headers.remove(HOST);
    options.cache_busting.clear(&mut follow_request);
    follow_request.url = target_url;

    let pre_follow = Message::resolved_from_state(message.snapshot());
    let handle = core
        .submit(follow_request, options.clone(), None, Some(pre_follow))
        .await;
    let resolved = {
        let _locked = core.pool.lock_scope();
        handle.await_resolution().await
    };
    message.overwrite_state(resolved.snapshot());
}

/// 429/529 reaction: feed the governor's throttle percentage from the
/// recent 429 density, step the target rate down one, and optionally
/// replay the request so the caller sees the post-throttle outcome.
async fn handle_rate_limit(
    core: &Arc<ClientCore>,
    message: &Arc<Message>,
    options: &ClientOptions,
) {
    if options.performance.auto_rate_throttle {
        let recent = core.message_log.recent(100);
        let limited = recent
            .iter()
            .filter(|entry| {
                entry
                    .status()
                    .is_some_and(|status| status.as_u16() == 429 || status.as_u16() == 529)
            })
            .count();
        let percentage = (limited * 100 / recent.len().max(1)).min(100) as u8;
        core.rate.set_throttle_percentage(percentage);

        let target = core.rate.target();
        if target > 1 {
            core.rate.change_rate(target - 1);
        }
    }

    if options.performance.replay_rate_limited {
        let handle = core
            .submit(message.request(), options.clone(), None, None)
            .await;
        let resolved = {
            let _locked = core.pool.lock_scope();
            handle.await_resolution().await
        };
        message.overwrite_state(resolved.snapshot());
    }

    message.with_state(|state| state.rate_limited = true);
}
