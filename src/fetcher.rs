//! Outbound event fetching from other relays.
//!
//! Each fetch opens a short-lived WebSocket (optionally through a SOCKS5
//! proxy), sends one `REQ`, collects events until `EOSE` and closes.

use std::{collections::HashSet, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{future::join_all, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::{event::Event, filter::Filter};

/// Deadline for one relay round trip.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(7);

#[async_trait]
pub trait EventFetcher: Send + Sync {
    /// Events matching `filter` from any of `relays`, deduplicated and verified.
    async fn fetch(&self, relays: &[String], filter: &Filter) -> Vec<Event>;
}

/// Fetcher speaking the relay protocol over WebSocket.
pub struct WsFetcher {
    tor_socks: Option<String>,
    timeout: Duration,
}

impl WsFetcher {
    pub fn new(tor_socks: Option<String>) -> Self {
        Self {
            tor_socks,
            timeout: FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl EventFetcher for WsFetcher {
    async fn fetch(&self, relays: &[String], filter: &Filter) -> Vec<Event> {
        let attempts = relays.iter().map(|relay| async move {
            match tokio::time::timeout(
                self.timeout,
                fetch_one(relay, self.tor_socks.as_deref(), filter),
            )
            .await
            {
                Ok(Ok(events)) => events,
                Ok(Err(e)) => {
                    debug!(%relay, "fetch failed: {e}");
                    Vec::new()
                }
                Err(_) => {
                    debug!(%relay, "fetch timed out");
                    Vec::new()
                }
            }
        });
        let mut seen = HashSet::new();
        join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .filter(|ev| filter.matches(ev) && ev.verify().is_ok())
            .filter(|ev| seen.insert(ev.id.clone()))
            .collect()
    }
}

async fn fetch_one(relay: &str, tor_socks: Option<&str>, filter: &Filter) -> Result<Vec<Event>> {
    let mut ws = connect_ws(relay, tor_socks).await?;
    let sub = "fetch";
    let req = serde_json::json!(["REQ", sub, filter]);
    ws.send(Message::Text(req.to_string())).await?;
    let mut out = Vec::new();
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(txt) => {
                let Ok(val) = serde_json::from_str::<Value>(&txt) else {
                    continue;
                };
                let Some(arr) = val.as_array() else {
                    continue;
                };
                match arr.first().and_then(|v| v.as_str()) {
                    Some("EVENT") if arr.len() >= 3 => {
                        if let Ok(ev) = serde_json::from_value::<Event>(arr[2].clone()) {
                            out.push(ev);
                        }
                    }
                    Some("EOSE") | Some("CLOSED") => break,
                    _ => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    let close = serde_json::json!(["CLOSE", sub]);
    let _ = ws.send(Message::Text(close.to_string())).await;
    let _ = ws.close(None).await;
    Ok(out)
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Fetcher answering from a fixed set of events, ignoring relay URLs.
#[derive(Default)]
pub struct MemoryFetcher {
    events: RwLock<Vec<Event>>,
}

impl MemoryFetcher {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: RwLock::new(events),
        }
    }

    pub fn push(&self, ev: Event) {
        self.events.write().push(ev);
    }
}

#[async_trait]
impl EventFetcher for MemoryFetcher {
    async fn fetch(&self, relays: &[String], filter: &Filter) -> Vec<Event> {
        if relays.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<Event> = self
            .events
            .read()
            .iter()
            .filter(|ev| filter.matches(ev))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }
}
