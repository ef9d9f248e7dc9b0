use http::HeaderValue;
use http::header::{ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, COOKIE, HOST, ORIGIN};
use rand::Rng;
use url::Url;

use crate::message::PreparedRequest;
use crate::options::CacheBustingOptions;
use crate::util::random_lowercase;

pub(crate) const DEFAULT_CACHE_BUSTER_PARAM: &str = "cacheBuster";
const CACHE_BUSTER_LEN: usize = 12;

impl CacheBustingOptions {
    /// Applies the first enabled vector, in precedence order: custom query
    /// param, default query param, Origin subdomain, Accept,
    /// Accept-Encoding, Accept-Language, Cookie, random port. Existing
    /// query parameters are never replaced.
    pub(crate) fn apply(&self, request: &mut PreparedRequest) {
        if let Some(param) = &self.query_param {
            append_query_param_if_absent(&mut request.url, param, &self.cache_buster());
            return;
        }

        if self.query {
            append_query_param_if_absent(
                &mut request.url,
                DEFAULT_CACHE_BUSTER_PARAM,
                &self.cache_buster(),
            );
            return;
        }

        if self.origin {
            let value = format!(
                "{}://{}.{}",
                request.url.scheme(),
                self.cache_buster(),
                request.url.host_str().unwrap_or_default()
            );
            if let Ok(value) = HeaderValue::from_str(&value) {
                request.headers.insert(ORIGIN, value);
            }
            return;
        }

        if self.accept {
            let merged = match header_str(request, "accept") {
                Some(existing) => format!("{existing}, text/{};q=0.1", self.cache_buster()),
                None => format!("*/*, text/{};q=0.1", self.cache_buster()),
            };
            insert(request, ACCEPT, &merged);
            return;
        }

        if self.accept_encoding {
            let merged = match header_str(request, "accept-encoding") {
                Some(existing) => format!("{existing}, {}", self.cache_buster()),
                None => format!("gzip, deflate, br, {}", self.cache_buster()),
            };
            insert(request, ACCEPT_ENCODING, &merged);
            return;
        }

        if self.accept_language {
            let merged = match header_str(request, "accept-language") {
                Some(existing) => format!("{existing}, {}", self.cache_buster()),
                None => format!("*, {}", self.cache_buster()),
            };
            insert(request, ACCEPT_LANGUAGE, &merged);
            return;
        }

        if self.cookie {
            let name = self
                .cookie_param
                .clone()
                .unwrap_or_else(|| self.cache_buster());
            let merged = match header_str(request, "cookie") {
                Some(existing) => format!("{existing}; {name}=1"),
                None => format!("{name}=1"),
            };
            insert(request, COOKIE, &merged);
            return;
        }

        if self.port {
            let port = random_unprivileged_port();
            let host = request.url.host_str().unwrap_or_default().to_owned();
            insert(request, HOST, &format!("{host}:{port}"));
        }
    }

    /// Removes every mutation the active vectors could have added, so a
    /// redirect follow-up re-applies them freshly.
    pub(crate) fn clear(&self, request: &mut PreparedRequest) {
        if let Some(param) = &self.query_param {
            remove_query_param(&mut request.url, param);
        }
        if self.query {
            remove_query_param(&mut request.url, DEFAULT_CACHE_BUSTER_PARAM);
        }
        if self.cookie {
            request.headers.remove(COOKIE);
        }
        if self.accept {
            request.headers.remove(ACCEPT);
        }
        if self.accept_encoding {
            request.headers.remove(ACCEPT_ENCODING);
        }
        if self.accept_language {
            request.headers.remove(ACCEPT_LANGUAGE);
        }
        if self.origin {
            request.headers.remove(ORIGIN);
        }
        if self.port {
            let host = request.url.host_str().unwrap_or_default().to_owned();
            insert(request, HOST, &host);
        }
    }

    fn cache_buster(&self) -> String {
        match &self.static_cache_buster {
            Some(value) if !value.is_empty() => value.clone(),
            _ => random_lowercase(CACHE_BUSTER_LEN),
        }
    }
}

fn header_str<'a>(request: &'a PreparedRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

fn insert(request: &mut PreparedRequest, name: http::header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        request.headers.insert(name, value);
    }
}

fn append_query_param_if_absent(url: &mut Url, name: &str, value: &str) {
    let exists = url.query_pairs().any(|(existing, _)| existing == name);
    if !exists {
        url.query_pairs_mut().append_pair(name, value);
    }
}

fn remove_query_param(url: &mut Url, name: &str) {
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(existing, _)| existing != name)
        .map(|(n, v)| (n.into_owned(), v.into_owned()))
        .collect();
    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut()
            .clear()
            .extend_pairs(remaining.iter().map(|(n, v)| (n.as_str(), v.as_str())));
    }
}

fn random_unprivileged_port() -> u16 {
    loop {
        let port = rand::rng().random_range(1..=65535u16);
        if port != 80 && port != 443 {
            return port;
        }
    }
}
