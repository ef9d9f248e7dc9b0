use url::Url;

/// Two URLs are cross-origin when their scheme or authority differs. The
/// authority is compared as written: an explicit default port is a
/// different origin from no port at all.
pub fn is_cross_origin(url_a: &str, url_b: &str) -> bool {
    let (Ok(a), Ok(b)) = (Url::parse(url_a), Url::parse(url_b)) else {
        return false;
    };
    a.scheme() != b.scheme() || a.host_str() != b.host_str() || a.port() != b.port()
}

/// Two URLs are cross-site when their registrable domains (eTLD+1) differ.
pub fn is_cross_site(url_a: &str, url_b: &str) -> bool {
    let (Ok(a), Ok(b)) = (Url::parse(url_a), Url::parse(url_b)) else {
        return false;
    };
    registrable_domain(a.host_str().unwrap_or_default())
        != registrable_domain(b.host_str().unwrap_or_default())
}

fn registrable_domain(host: &str) -> String {
    psl::domain_str(host).unwrap_or(host).to_ascii_lowercase()
}
