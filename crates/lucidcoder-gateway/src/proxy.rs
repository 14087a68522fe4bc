use std::error::Error as StdError;
use std::io;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use lucidcoder_registry::ProjectKey;

use crate::bridge;
use crate::resolve::Resolution;
use crate::{PreviewGateway, UpstreamTarget};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Why an upstream exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFailure {
    ConnectionRefused,
    ConnectionReset,
    Timeout,
    Other,
}

impl ProxyFailure {
    /// Failures that mean nothing is listening on the port anymore.
    pub fn is_connection_failure(self) -> bool {
        matches!(self, Self::ConnectionRefused | Self::ConnectionReset)
    }

    pub fn from_io_kind(kind: io::ErrorKind) -> Option<Self> {
        match kind {
            io::ErrorKind::ConnectionRefused => Some(Self::ConnectionRefused),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Some(Self::ConnectionReset),
            io::ErrorKind::TimedOut => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Walks an error chain looking for the underlying socket error.
    pub fn from_error_chain(err: &(dyn StdError + 'static)) -> Self {
        let mut current = Some(err);
        while let Some(err) = current {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if let Some(failure) = Self::from_io_kind(io_err.kind()) {
                    return failure;
                }
            }
            current = err.source();
        }
        Self::Other
    }

    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        match Self::from_error_chain(err) {
            Self::Other if err.is_connect() => Self::ConnectionRefused,
            failure => failure,
        }
    }
}

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name);
    }
}

/// Request headers as sent upstream. `Accept-Encoding` is dropped so HTML
/// arrives uncompressed and can be rewritten.
pub fn upstream_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    strip_hop_by_hop(&mut forwarded);
    forwarded.remove(header::HOST);
    forwarded.remove(header::ACCEPT_ENCODING);
    forwarded.remove(header::CONTENT_LENGTH);
    forwarded
}

pub fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("text/html"))
}

fn retry_page(delay_ms: u64, starting: bool) -> String {
    let message = if starting {
        "The preview is still starting."
    } else {
        "The preview server is not reachable right now."
    };
    let refresh_secs = delay_ms.div_ceil(1000).max(1);
    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="{refresh_secs}">
<title>Waiting for preview</title>
<style>body{{font-family:system-ui,sans-serif;color:#555;display:flex;align-items:center;justify-content:center;height:100vh;margin:0}}</style>
</head>
<body data-lucidcoder-retry>
<p>{message} Retrying&hellip;</p>
<script>setTimeout(function () {{ window.location.reload(); }}, {delay_ms});</script>
</body>
</html>"#
    )
}

/// The response shown when the upstream could not be reached. Iframe
/// navigations get a page that reloads itself; everything else plain text.
pub fn degraded_response(request_headers: &HeaderMap, starting: bool, retry_delay_ms: u64) -> Response {
    let status = if starting {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::BAD_GATEWAY
    };
    if accepts_html(request_headers) {
        return (
            status,
            [(header::CACHE_CONTROL, "no-store")],
            Html(retry_page(retry_delay_ms, starting)),
        )
            .into_response();
    }
    let message = if starting {
        "Preview is starting"
    } else {
        "Preview unavailable"
    };
    (status, [(header::CACHE_CONTROL, "no-store")], message).into_response()
}

pub(crate) async fn forward_http(
    gateway: &PreviewGateway,
    key: &ProjectKey,
    resolution: &Resolution,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let port = match gateway.resolve_target(key).await {
        UpstreamTarget::Port(port) => port,
        UpstreamTarget::RememberedBad(port) => {
            let starting = gateway
                .note_failure(key, Some(port), ProxyFailure::ConnectionRefused)
                .await;
            return gateway.degraded(&parts.headers, starting);
        }
        UpstreamTarget::Unknown => {
            tracing::debug!(project_id = %key, "no upstream port known for preview");
            return gateway.degraded(&parts.headers, false);
        }
    };

    let body = match axum::body::to_bytes(body, gateway.config().max_request_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(project_id = %key, error = %err, "failed to read preview request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body rejected").into_response();
        }
    };

    let url = gateway.upstream_url("http", &parts.headers, port, &resolution.forward_path);
    let mut upstream = gateway
        .client()
        .request(parts.method.clone(), url.as_str())
        .headers(upstream_request_headers(&parts.headers));
    if !body.is_empty() {
        upstream = upstream.body(body);
    }

    // Only the wait for response headers is bounded; streamed bodies may
    // stay open as long as the dev server keeps them open.
    let timeout = gateway.config().request_timeout();
    let response = match tokio::time::timeout(timeout, upstream.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            let failure = ProxyFailure::classify(&err);
            tracing::warn!(project_id = %key, port, url = %url, ?failure, error = %err, "preview upstream request failed");
            let starting = gateway.note_failure(key, Some(port), failure).await;
            return gateway.degraded(&parts.headers, starting);
        }
        Err(_) => {
            tracing::warn!(project_id = %key, port, url = %url, "preview upstream timed out");
            let starting = gateway.note_failure(key, Some(port), ProxyFailure::Timeout).await;
            return gateway.degraded(&parts.headers, starting);
        }
    };

    relay_response(gateway, key, port, &parts.headers, response).await
}

/// Statuses that never carry a body, so there is nothing to inject into.
fn is_bodiless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

async fn relay_response(
    gateway: &PreviewGateway,
    key: &ProjectKey,
    port: u16,
    request_headers: &HeaderMap,
    upstream: reqwest::Response,
) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let encoded = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| !value.eq_ignore_ascii_case("identity"));

    if !bridge::is_html(&headers) || encoded || is_bodiless(status) {
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        return response;
    }

    let timeout = gateway.config().request_timeout();
    let bytes = match tokio::time::timeout(timeout, upstream.bytes()).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            let failure = ProxyFailure::classify(&err);
            tracing::warn!(project_id = %key, port, ?failure, error = %err, "failed to read preview html");
            let starting = gateway.note_failure(key, Some(port), failure).await;
            return gateway.degraded(request_headers, starting);
        }
        Err(_) => {
            tracing::warn!(project_id = %key, port, "timed out reading preview html");
            let starting = gateway.note_failure(key, Some(port), ProxyFailure::Timeout).await;
            return gateway.degraded(request_headers, starting);
        }
    };

    bridge::strip_csp(&mut headers);
    headers.remove(header::CONTENT_LENGTH);
    let html = bridge::inject_bridge(&bytes, key.as_str());

    let mut response = Response::new(Body::from(html));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
