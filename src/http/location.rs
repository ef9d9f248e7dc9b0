use http::HeaderMap;
use http::header::LOCATION;
use url::Url;

/// Resolves a redirect target against the URL it was served from.
///
/// Resolution rules: an empty target means the source itself; absolute,
/// scheme-relative (`//`) and backslash-prefixed targets pass through
/// unchanged; `/`-prefixed targets join the source origin; anything else is
/// current-path relative (query stripped, `/` inserted when missing). An
/// unparsable target resolves to the empty string.
pub fn to_absolute(src: &str, target: &str) -> String {
    let Ok(src_url) = Url::parse(src) else {
        return target.to_owned();
    };

    if target.is_empty() {
        return src_url.to_string();
    }
    if target.starts_with("//") || target.starts_with('\\') {
        return target.to_owned();
    }

    match Url::parse(target) {
        Ok(_) => target.to_owned(),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            if let Some(rooted) = target.strip_prefix('/') {
                format!("{}/{rooted}", origin_of(&src_url))
            } else {
                let mut base = format!("{}{}", origin_of(&src_url), src_url.path());
                if !base.ends_with('/') {
                    base.push('/');
                }
                format!("{base}{target}")
            }
        }
        Err(_) => String::new(),
    }
}

/// `scheme://host[:port]` without the trailing slash `Url` normalization
/// would add.
pub(crate) fn origin_of(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

/// Absolute redirect target from a response's first `Location` header.
pub(crate) fn redirect_location(request_url: &Url, response_headers: &HeaderMap) -> String {
    let location = response_headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    to_absolute(request_url.as_str(), location)
}

#[cfg(test)]
mod tests {
    use super::{origin_of, to_absolute};

    #[test]
    fn empty_target_resolves_to_source() {
        assert_eq!(
            to_absolute("http://example.com/a", ""),
            "http://example.com/a"
        );
    }

    #[test]
    fn absolute_targets_pass_through() {
        assert_eq!(
            to_absolute("http://example.com/a", "https://other.net/b"),
            "https://other.net/b"
        );
    }

    #[test]
    fn scheme_relative_and_backslash_targets_pass_through() {
        assert_eq!(to_absolute("http://example.com/", "//cdn.example.com/x"), "//cdn.example.com/x");
        assert_eq!(to_absolute("http://example.com/", "\\evil"), "\\evil");
    }

    #[test]
    fn root_relative_joins_the_origin() {
        assert_eq!(
            to_absolute("http://example.com/deep/path?q=1", "/b"),
            "http://example.com/b"
        );
        assert_eq!(
            to_absolute("http://example.com:8080/a", "/b"),
            "http://example.com:8080/b"
        );
    }

    #[test]
    fn path_relative_joins_the_current_path() {
        assert_eq!(
            to_absolute("http://example.com/a", "b"),
            "http://example.com/a/b"
        );
        assert_eq!(
            to_absolute("http://example.com/a/", "b"),
            "http://example.com/a/b"
        );
        // Query string never leaks into the resolved target.
        assert_eq!(
            to_absolute("http://example.com/a?x=1", "b"),
            "http://example.com/a/b"
        );
    }

    #[test]
    fn origin_keeps_explicit_ports_only() {
        let url = url::Url::parse("https://example.com/x").unwrap();
        assert_eq!(origin_of(&url), "https://example.com");
        let url = url::Url::parse("https://example.com:8443/x").unwrap();
        assert_eq!(origin_of(&url), "https://example.com:8443");
    }
}
