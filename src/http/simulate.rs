use http::HeaderValue;
use http::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, HeaderName, REFERER, UPGRADE_INSECURE_REQUESTS,
    USER_AGENT,
};
use rand::Rng;

use crate::http::location::origin_of;
use crate::message::PreparedRequest;

const SEC_CH_UA: HeaderName = HeaderName::from_static("sec-ch-ua");
const SEC_CH_UA_MOBILE: HeaderName = HeaderName::from_static("sec-ch-ua-mobile");
const SEC_CH_UA_PLATFORM: HeaderName = HeaderName::from_static("sec-ch-ua-platform");
const SEC_FETCH_SITE: HeaderName = HeaderName::from_static("sec-fetch-site");
const SEC_FETCH_MODE: HeaderName = HeaderName::from_static("sec-fetch-mode");
const SEC_FETCH_USER: HeaderName = HeaderName::from_static("sec-fetch-user");
const SEC_FETCH_DEST: HeaderName = HeaderName::from_static("sec-fetch-dest");

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.5938.132 Safari/537.36";

/// `Sec-Fetch-Dest` for asset requests, keyed by URL path extension.
fn sec_fetch_dest_for(extension: &str) -> Option<&'static str> {
    let dest = match extension {
        "js" | "jsm" => "script",
        "css" => "style",
        "ico" | "svg" | "png" | "jpg" | "jpeg" | "gif" | "webp" => "image",
        "woff" | "woff2" | "otf" | "ttf" => "font",
        "mp4" | "mov" | "wmv" | "avi" | "webm" => "video",
        "mp3" => "audio",
        _ => return None,
    };
    Some(dest)
}

/// Pool of believable desktop/mobile user agents for randomization.
const USER_AGENT_POOL: &[&str] = &[
    CHROME_UA,
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.5938.132 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.5845.187 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:118.0) Gecko/20100101 Firefox/118.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:109.0) Gecko/20100101 Firefox/117.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Safari/605.1.15",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.0.0 Safari/537.36 Edg/117.0.2045.47",
    "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.5938.60 Mobile Safari/537.36",
];

pub(crate) fn random_user_agent() -> &'static str {
    let index = rand::rng().random_range(0..USER_AGENT_POOL.len());
    USER_AGENT_POOL[index]
}

/// Dresses a request up as browser traffic. Asset URLs (by extension class)
/// get subresource fetch metadata and a same-origin referer; everything
/// else looks like a top-level navigation. Headers are added only when the
/// caller has not set them already.
pub(crate) fn simulate_browser_request(request: &mut PreparedRequest) {
    let extension = request
        .url
        .path()
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    if let Some(dest) = sec_fetch_dest_for(&extension) {
        let referer = format!("{}/", origin_of(&request.url));
        set_static(request, SEC_CH_UA, "\"Chromium\";v=\"117\", \"Not;A=Brand\";v=\"8\"");
        set_static(request, SEC_CH_UA_MOBILE, "?0");
        set_static(request, USER_AGENT, CHROME_UA);
        set_static(request, SEC_CH_UA_PLATFORM, "\"Windows\"");
        set_static(request, ACCEPT, "*/*;q=0.9");
        set_static(request, SEC_FETCH_SITE, "same-origin");
        set_static(request, SEC_FETCH_MODE, "no-cors");
        set_static(request, SEC_FETCH_DEST, dest);
        if let Ok(value) = HeaderValue::from_str(&referer) {
            request.set_header_if_absent(REFERER, value);
        }
        set_static(request, ACCEPT_ENCODING, "gzip, deflate, br");
        set_static(request, ACCEPT_LANGUAGE, "en-US,en;q=0.9");
        return;
    }

    set_static(request, SEC_CH_UA, "\"Chromium\";v=\"117\", \"Not;A=Brand\";v=\"8\"");
    set_static(request, SEC_CH_UA_MOBILE, "?0");
    set_static(request, SEC_CH_UA_PLATFORM, "\"Windows\"");
    set_static(request, UPGRADE_INSECURE_REQUESTS, "1");
    set_static(request, USER_AGENT, CHROME_UA);
    set_static(request, ACCEPT, "*/*;q=0.9");
    set_static(request, SEC_FETCH_SITE, "none");
    set_static(request, SEC_FETCH_MODE, "navigate");
    set_static(request, SEC_FETCH_USER, "?1");
    set_static(request, SEC_FETCH_DEST, "document");
    set_static(request, ACCEPT_ENCODING, "gzip, deflate, br");
    set_static(request, ACCEPT_LANGUAGE, "en-US,en;q=0.9");
}

fn set_static(request: &mut PreparedRequest, name: HeaderName, value: &'static str) {
    request.set_header_if_absent(name, HeaderValue::from_static(value));
}
