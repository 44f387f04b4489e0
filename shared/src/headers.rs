//! Header multimap conversion and hop-by-hop filtering
//!
//! Connection-scoped headers describe a single HTTP hop and must not be
//! replayed on the other side of the tunnel.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::protocol::{append_header, Headers};

/// Headers that only describe one hop. `content-length` is recomputed by
/// whichever HTTP stack writes the body next.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

/// Remove hop-by-hop headers, including any named by `Connection:`.
pub fn strip_hop_by_hop(headers: &mut Headers) {
    let listed: Vec<String> = headers
        .get("connection")
        .map(|v| {
            v.iter()
                .flat_map(|line| line.split(','))
                .map(|token| token.trim().to_ascii_lowercase())
                .filter(|token| !token.is_empty())
                .collect()
        })
        .unwrap_or_default();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(&name);
    }
}

/// Remove a header by name
pub fn remove(headers: &mut Headers, name: &str) {
    headers.remove(&name.to_ascii_lowercase());
}

/// Collect an `http::HeaderMap` into the wire multimap.
pub fn from_header_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        match value.to_str() {
            Ok(v) => append_header(&mut headers, name.as_str(), v.to_string()),
            Err(_) => debug!(header = %name, "skipping non-visible-ascii header value"),
        }
    }
    headers
}

/// Expand the wire multimap into an `http::HeaderMap`.
pub fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        let Ok(hn) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "skipping invalid header name");
            continue;
        };
        for value in values.iter() {
            match HeaderValue::from_str(value) {
                Ok(hv) => {
                    map.append(hn.clone(), hv);
                }
                Err(_) => debug!(header = %name, "skipping invalid header value"),
            }
        }
    }
    map
}
