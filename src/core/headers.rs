//! Header normalization at the proxy boundary.
use http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{
        CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, SERVER, TE, TRAILER,
        TRANSFER_ENCODING, UPGRADE,
    },
};

/// Binary version advertised in the server banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Headers meaningful for a single transport hop only.
pub static HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// `server` banner injected on every response.
pub fn server_banner() -> HeaderValue {
    HeaderValue::from_static(concat!("echoes/", env!("CARGO_PKG_VERSION")))
}

/// Remove hop-by-hop headers, including any header nominated by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in nominated {
        headers.remove(name);
    }

    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Normalize response headers before they are written downstream.
pub fn normalize_response_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    headers.insert(SERVER, server_banner());
}
