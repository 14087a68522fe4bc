use axum::http::{header, HeaderMap};

const DEFAULT_HOST: &str = "localhost";

fn normalize(host: &str) -> Option<String> {
    let host = strip_port(host.trim())?;
    if host == "0.0.0.0" {
        return Some(DEFAULT_HOST.to_string());
    }
    Some(host)
}

/// Drops a trailing `:port`, keeping bracketed IPv6 literals intact.
pub fn strip_port(authority: &str) -> Option<String> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    if authority.starts_with('[') {
        let end = authority.find(']')?;
        return Some(authority[..=end].to_string());
    }
    match authority.matches(':').count() {
        0 => Some(authority.to_string()),
        1 => authority
            .split(':')
            .next()
            .filter(|host| !host.is_empty())
            .map(str::to_string),
        // A bare IPv6 address without a port.
        _ => Some(format!("[{authority}]")),
    }
}

/// Host the upstream dev server is reached on.
///
/// An operator override wins; otherwise the first `X-Forwarded-Host` entry,
/// then `Host`, so LAN clients reach the same machine they browsed to.
pub fn resolve_upstream_host(override_host: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(host) = override_host.and_then(normalize) {
        return host;
    }
    let forwarded = headers
        .get("x-forwarded-host")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(normalize);
    if let Some(host) = forwarded {
        return host;
    }
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(normalize)
        .unwrap_or_else(|| DEFAULT_HOST.to_string())
}
