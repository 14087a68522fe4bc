use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use lucidcoder_registry::ProjectKey;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::proxy::ProxyFailure;
use crate::resolve::Resolution;
use crate::{PreviewGateway, UpstreamTarget};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|protocol| !protocol.is_empty())
        .map(str::to_string)
        .collect()
}

fn to_upstream(message: ws::Message) -> Message {
    match message {
        ws::Message::Text(text) => Message::Text(text.as_str().to_owned().into()),
        ws::Message::Binary(data) => Message::Binary(data),
        ws::Message::Ping(data) => Message::Ping(data),
        ws::Message::Pong(data) => Message::Pong(data),
        ws::Message::Close(frame) => Message::Close(frame.map(|frame| CloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason.as_str().to_owned().into(),
        })),
    }
}

fn to_client(message: Message) -> Option<ws::Message> {
    let message = match message {
        Message::Text(text) => ws::Message::Text(text.as_str().to_owned().into()),
        Message::Binary(data) => ws::Message::Binary(data),
        Message::Ping(data) => ws::Message::Ping(data),
        Message::Pong(data) => ws::Message::Pong(data),
        Message::Close(frame) => ws::Message::Close(frame.map(|frame| ws::CloseFrame {
            code: frame.code.into(),
            reason: frame.reason.as_str().to_owned().into(),
        })),
        Message::Frame(_) => return None,
    };
    Some(message)
}

/// Connects upstream first so a dead dev server is reported as an HTTP
/// error instead of an accepted socket that immediately drops.
pub(crate) async fn proxy_websocket(
    gateway: &PreviewGateway,
    key: &ProjectKey,
    resolution: &Resolution,
    request: Request,
) -> Response {
    let (mut parts, _body) = request.into_parts();
    let protocols = requested_protocols(&parts.headers);
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let port = match gateway.resolve_target(key).await {
        UpstreamTarget::Port(port) => port,
        UpstreamTarget::RememberedBad(port) => {
            gateway
                .note_failure(key, Some(port), ProxyFailure::ConnectionRefused)
                .await;
            return (StatusCode::BAD_GATEWAY, "Preview unavailable").into_response();
        }
        UpstreamTarget::Unknown => {
            return (StatusCode::BAD_GATEWAY, "Preview unavailable").into_response();
        }
    };

    let url = gateway.upstream_url("ws", &parts.headers, port, &resolution.forward_path);
    let mut upstream_request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(project_id = %key, url = %url, error = %err, "invalid upstream websocket url");
            return (StatusCode::BAD_GATEWAY, "Preview unavailable").into_response();
        }
    };
    if !protocols.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&protocols.join(", ")) {
            upstream_request
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }

    let (upstream, handshake) = match tokio_tungstenite::connect_async(upstream_request).await {
        Ok(pair) => pair,
        Err(err) => {
            let failure = ProxyFailure::from_error_chain(&err);
            tracing::warn!(project_id = %key, port, ?failure, error = %err, "preview websocket connect failed");
            let starting = gateway.note_failure(key, Some(port), failure).await;
            let status = if starting {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::BAD_GATEWAY
            };
            return (status, "Preview unavailable").into_response();
        }
    };

    let selected = handshake
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let upgrade = match selected {
        Some(protocol) => upgrade.protocols([protocol]),
        None => upgrade,
    };

    let project_id = key.clone();
    let failed_id = key.clone();
    upgrade
        .on_failed_upgrade(move |err| {
            tracing::warn!(project_id = %failed_id, error = %err, "client websocket upgrade failed");
        })
        .on_upgrade(move |socket| pump(socket, upstream, project_id))
}

async fn pump(client: WebSocket, upstream: UpstreamSocket, key: ProjectKey) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let closing = matches!(message, ws::Message::Close(_));
            if upstream_tx.send(to_upstream(message)).await.is_err() || closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let Some(message) = to_client(message) else {
                continue;
            };
            let closing = matches!(message, ws::Message::Close(_));
            if client_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
    tracing::debug!(project_id = %key, "preview websocket closed");
}
