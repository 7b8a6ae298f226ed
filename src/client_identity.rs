use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Resolves the key used to partition admission state.
///
/// Forwarding headers are only honoured when the service sits behind a
/// proxy that overwrites them; otherwise any client could pick its own key.
pub fn client_identity(trust_proxy_headers: bool, headers: &HeaderMap, addr: SocketAddr) -> String {
    if trust_proxy_headers {
        forwarded_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_hop = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_hop.is_some() {
            return first_hop;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}
