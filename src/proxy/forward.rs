//! Request and response rewriting between the inbound and upstream hops.

use std::net::SocketAddr;

use http::header::{CONNECTION, HOST, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Version};

use super::ProxyTarget;
use crate::{Error, Result};

/// Headers that apply to a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Rewrite an inbound request for the upstream hop.
///
/// Returns the requested upgrade protocol, if the client asked for one.
pub fn prepare_request<B>(
    request: &mut Request<B>,
    target: &ProxyTarget,
    peer: Option<SocketAddr>,
) -> Result<Option<HeaderValue>> {
    let upgrade = upgrade_type(request.headers());

    *request.uri_mut() = target.origin_form(request.uri())?;
    *request.version_mut() = Version::HTTP_11;

    let headers = request.headers_mut();
    strip_hop_by_hop(headers);
    if let Some(protocol) = &upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, protocol.clone());
    }

    let host = HeaderValue::from_str(target.authority())
        .map_err(|e| Error::Config(format!("Invalid upstream authority: {e}")))?;
    headers.insert(HOST, host);
    append_forwarded_for(headers, peer);

    Ok(upgrade)
}

/// Rewrite an upstream response for the inbound hop.
///
/// A `101 Switching Protocols` answer to an upgrade request keeps its
/// `Connection`/`Upgrade` pair so the client can switch too.
pub fn prepare_response<B>(response: &mut Response<B>, upgrade_requested: bool) {
    let switching = upgrade_requested && response.status() == StatusCode::SWITCHING_PROTOCOLS;
    let protocol = upgrade_type(response.headers());

    let headers = response.headers_mut();
    strip_hop_by_hop(headers);
    if let (true, Some(protocol)) = (switching, protocol) {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, protocol);
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in connection_tokens(headers) {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// The `Upgrade` value when `Connection` carries the `upgrade` token.
pub fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Append the peer IP to `X-Forwarded-For`, folding earlier values into one.
pub fn append_forwarded_for(headers: &mut HeaderMap, peer: Option<SocketAddr>) {
    let Some(peer) = peer else {
        return;
    };

    let mut chain: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_owned)
        .collect();
    chain.push(peer.ip().to_string());

    if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn connection_tokens(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}
