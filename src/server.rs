//! HTTP front: websocket upgrades, NIP-11 documents and health checks per mount.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, Path, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::relay::{conn, info::RelayInformation, Mount, Relay};

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
    trusted_proxies: Arc<[IpAddr]>,
    shutdown: CancellationToken,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

pub fn router(relay: Arc<Relay>, trusted_proxies: &[IpAddr], shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/", get(main_mount))
        .route("/healthz", get(healthz))
        .route("/:mount", get(named_mount))
        .with_state(AppState {
            relay,
            trusted_proxies: trusted_proxies.into(),
            shutdown,
        })
}

/// Serve every mount on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    relay: Arc<Relay>,
    trusted_proxies: &[IpAddr],
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    let app = router(relay, trusted_proxies, shutdown.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// First `X-Forwarded-For` hop when the peer is a trusted proxy, else the peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr, trusted_proxies: &[IpAddr]) -> IpAddr {
    if !peer.ip().is_loopback() && !trusted_proxies.contains(&peer.ip()) {
        return peer.ip();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| peer.ip())
}

fn wants_info(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.contains("application/nostr+json"))
}

async fn main_mount(
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    entry(state, Mount::Main, ws, peer, headers)
}

async fn named_mount(
    State(state): State<AppState>,
    Path(path): Path<String>,
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    match Mount::from_path(&path) {
        Some(mount) if mount != Mount::Main => entry(state, mount, ws, peer, headers),
        _ => (StatusCode::NOT_FOUND, "no such relay").into_response(),
    }
}

fn entry(
    state: AppState,
    mount: Mount,
    ws: Option<WebSocketUpgrade>,
    peer: SocketAddr,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer, &state.trusted_proxies);
    if let Some(ws) = ws {
        if !state.relay.limits().check_connection(ip) {
            warn!(%ip, mount = %mount, "connection rate limited");
            return (StatusCode::TOO_MANY_REQUESTS, "rate-limited: too many connections").into_response();
        }
        let AppState { relay, shutdown, .. } = state;
        return ws.on_upgrade(move |socket| conn::run(socket, relay, mount, ip, shutdown));
    }
    if wants_info(&headers) {
        let relay = &state.relay;
        let doc = RelayInformation::for_mount(mount, &relay.settings(), relay.keys().public_key());
        return (
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::CONTENT_TYPE, "application/nostr+json"),
            ],
            Json(doc),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        format!("pyramid {mount} relay: connect with a nostr client at {}", mount.path()),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_header_from_trusted_proxies_only() {
        let proxy: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        let trusted = ["10.0.0.9".parse::<IpAddr>().unwrap()];
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, proxy, &trusted), proxy.ip());
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let forwarded: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(client_ip(&headers, proxy, &trusted), forwarded);

        let local: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(client_ip(&headers, local, &[]), forwarded);

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(client_ip(&headers, proxy, &trusted), proxy.ip());
    }

    #[test]
    fn spoofed_forwarded_header_is_ignored() {
        let peer: SocketAddr = "198.51.100.4:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_ip(&headers, peer, &[]), peer.ip());
        let other_proxy = ["10.0.0.9".parse::<IpAddr>().unwrap()];
        assert_eq!(client_ip(&headers, peer, &other_proxy), peer.ip());
    }

    #[test]
    fn info_requests_need_the_nostr_accept_header() {
        let mut headers = HeaderMap::new();
        assert!(!wants_info(&headers));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/nostr+json"));
        assert!(wants_info(&headers));
    }
}
