//! One websocket connection: frame parsing, the verb loop and the writer task.

use std::{collections::HashSet, net::IpAddr, sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{closed_frame, event_frame, Listener, Mount, Relay, BROADCAST_BUFFER, QUERY_CAP};
use crate::{
    error::Reject,
    event::{now, Event},
    filter::Filter,
};

/// Longest accepted subscription id.
pub const MAX_SUB_ID: usize = 64;
/// Filters accepted in one REQ or COUNT.
pub const MAX_FILTERS: usize = 10;
const WRITER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("could not parse message: {0}")]
    Json(String),
    #[error("message is not an array")]
    NotArray,
    #[error("missing message type")]
    NoVerb,
    #[error("invalid subscription id")]
    SubId,
    #[error("invalid event: {0}")]
    Event(String),
    #[error("invalid filter: {0}")]
    Filter(String),
    #[error("too many filters")]
    TooManyFilters,
}

/// A parsed client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req { sub: String, filters: Vec<Filter> },
    Count { sub: String, filters: Vec<Filter> },
    Close(String),
    Auth(Box<Event>),
    /// NEG-OPEN or NEG-MSG.
    Negentropy(String),
    NegClose(String),
    Unknown(String),
}

fn sub_id(v: Option<&Value>) -> Result<String, FrameError> {
    match v.and_then(Value::as_str) {
        Some(s) if !s.is_empty() && s.len() <= MAX_SUB_ID => Ok(s.to_string()),
        _ => Err(FrameError::SubId),
    }
}

fn event(v: Option<&Value>) -> Result<Box<Event>, FrameError> {
    let v = v.ok_or_else(|| FrameError::Event("missing".into()))?;
    serde_json::from_value(v.clone())
        .map(Box::new)
        .map_err(|e| FrameError::Event(e.to_string()))
}

fn filters(rest: &[Value]) -> Result<Vec<Filter>, FrameError> {
    if rest.len() > MAX_FILTERS {
        return Err(FrameError::TooManyFilters);
    }
    rest.iter()
        .map(|v| Filter::from_value(v).map_err(|e| FrameError::Filter(e.to_string())))
        .collect()
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let val: Value = serde_json::from_str(text).map_err(|e| FrameError::Json(e.to_string()))?;
        let arr = val.as_array().ok_or(FrameError::NotArray)?;
        let verb = arr.first().and_then(Value::as_str).ok_or(FrameError::NoVerb)?;
        Ok(match verb {
            "EVENT" => ClientMessage::Event(event(arr.get(1))?),
            "AUTH" => ClientMessage::Auth(event(arr.get(1))?),
            "REQ" => ClientMessage::Req {
                sub: sub_id(arr.get(1))?,
                filters: filters(arr.get(2..).unwrap_or_default())?,
            },
            "COUNT" => ClientMessage::Count {
                sub: sub_id(arr.get(1))?,
                filters: filters(arr.get(2..).unwrap_or_default())?,
            },
            "CLOSE" => ClientMessage::Close(sub_id(arr.get(1))?),
            "NEG-OPEN" | "NEG-MSG" => ClientMessage::Negentropy(sub_id(arr.get(1))?),
            "NEG-CLOSE" => ClientMessage::NegClose(sub_id(arr.get(1))?),
            other => ClientMessage::Unknown(other.to_string()),
        })
    }
}

fn notice(message: &str) -> String {
    json!(["NOTICE", message]).to_string()
}

fn ok_frame(id: &str, accepted: bool, message: &str) -> String {
    json!(["OK", id, accepted, message]).to_string()
}

/// Fresh NIP-42 challenge.
pub fn challenge() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

struct Conn {
    relay: Arc<Relay>,
    listener: Arc<Listener>,
    challenge: String,
    ip: IpAddr,
}

enum Flow {
    Continue,
    Close,
}

/// Serve a websocket until the client leaves, the relay shuts down, or the
/// connection falls too far behind.
pub async fn run(socket: WebSocket, relay: Arc<Relay>, mount: Mount, ip: IpAddr, shutdown: CancellationToken) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(BROADCAST_BUFFER);
    let cancel = shutdown.child_token();
    let listener = relay.register(mount, tx, cancel.clone());
    let id = listener.id;
    debug!(conn = id, mount = %mount, %ip, "connection opened");

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let conn = Conn {
        relay: relay.clone(),
        listener: listener.clone(),
        challenge: challenge(),
        ip,
    };
    conn.listener
        .reply(json!(["AUTH", conn.challenge]).to_string())
        .await;

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                conn.listener.reply(notice("binary frames are not supported")).await;
                continue;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(conn = id, "websocket error: {e}");
                break;
            }
        };
        match conn.handle(&text).await {
            Flow::Continue => {}
            Flow::Close => break,
        }
    }

    relay.unregister(id);
    drop(conn);
    drop(listener);
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        warn!(conn = id, "writer did not drain in time");
    }
    cancel.cancel();
    debug!(conn = id, "connection closed");
}

impl Conn {
    async fn send(&self, frame: String) {
        self.listener.reply(frame).await;
    }

    async fn handle(&self, text: &str) -> Flow {
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn = self.listener.id, "bad frame: {e}");
                self.send(notice(&e.to_string())).await;
                return Flow::Close;
            }
        };
        match msg {
            ClientMessage::Event(ev) => {
                let frame = self.publish(*ev).await;
                self.send(frame).await;
            }
            ClientMessage::Req { sub, filters } => self.req(sub, filters).await,
            ClientMessage::Count { sub, filters } => self.count(sub, filters).await,
            ClientMessage::Close(sub) => {
                self.listener.unsubscribe(&sub);
            }
            ClientMessage::Auth(ev) => {
                let frame = match self.relay.verify_auth(&ev, &self.challenge, now()) {
                    Ok(()) => {
                        self.listener.add_authed(&ev.pubkey);
                        info!(conn = self.listener.id, pubkey = %ev.pubkey, "authenticated");
                        ok_frame(&ev.id, true, "")
                    }
                    Err(reject) => ok_frame(&ev.id, false, &reject.to_string()),
                };
                self.send(frame).await;
            }
            ClientMessage::Negentropy(sub) => {
                let frame = json!(["NEG-ERR", sub, "blocked: negentropy is not supported on this relay"]);
                self.send(frame.to_string()).await;
            }
            ClientMessage::NegClose(_) => {}
            ClientMessage::Unknown(verb) => {
                self.send(notice(&format!("unknown message type: {verb}"))).await;
            }
        }
        Flow::Continue
    }

    /// Run ingest on the blocking pool: it touches the disk and takes group and membership locks.
    async fn publish(&self, ev: Event) -> String {
        let relay = Arc::clone(&self.relay);
        let mount = self.listener.mount;
        let authed = self.listener.authed();
        let id = ev.id.clone();
        match tokio::task::spawn_blocking(move || relay.ingest(mount, &authed, &ev)).await {
            Ok(Ok(message)) => ok_frame(&id, true, &message),
            Ok(Err(reject)) => ok_frame(&id, false, &reject.to_string()),
            Err(e) => {
                error!(conn = self.listener.id, %id, "ingest task failed: {e}");
                ok_frame(&id, false, &Reject::error("could not store event").to_string())
            }
        }
    }

    /// Rate limit and gate every filter; the first refusal closes the subscription.
    fn admit_filters(&self, filters: &[Filter]) -> Result<(), Reject> {
        if filters.is_empty() {
            return Err(Reject::invalid("at least one filter is required"));
        }
        let readers = self.listener.authed();
        for f in filters {
            if !self.relay.limits().check_filter(self.ip) {
                return Err(Reject::rate_limited("slow down"));
            }
            self.relay.check_filter(self.listener.mount, &readers, f)?;
        }
        Ok(())
    }

    async fn req(&self, sub: String, filters: Vec<Filter>) {
        if let Err(reject) = self.admit_filters(&filters) {
            self.listener.unsubscribe(&sub);
            self.send(closed_frame(&sub, &reject)).await;
            return;
        }
        self.listener.subscribe(&sub, filters.clone());
        let readers = self.listener.authed();
        let mut seen = HashSet::new();
        for f in &filters {
            let events: Vec<Arc<Event>> = self
                .relay
                .query(self.listener.mount, &readers, f, QUERY_CAP)
                .filter(|ev| seen.insert(ev.id.clone()))
                .collect();
            for ev in events {
                if self.listener.is_cancelled() {
                    return;
                }
                self.send(event_frame(&sub, &ev)).await;
            }
        }
        self.send(json!(["EOSE", sub]).to_string()).await;
    }

    async fn count(&self, sub: String, filters: Vec<Filter>) {
        if let Err(reject) = self.admit_filters(&filters) {
            self.send(closed_frame(&sub, &reject)).await;
            return;
        }
        let readers = self.listener.authed();
        let n: usize = filters
            .iter()
            .map(|f| self.relay.count(self.listener.mount, &readers, f))
            .sum();
        self.send(json!(["COUNT", sub, { "count": n }]).to_string()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verbs() {
        let req = ClientMessage::parse(r#"["REQ","s",{"kinds":[1]},{"limit":2}]"#).unwrap();
        let ClientMessage::Req { sub, filters } = req else {
            panic!("expected REQ");
        };
        assert_eq!(sub, "s");
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[1].limit, Some(2));

        assert_eq!(
            ClientMessage::parse(r#"["CLOSE","s"]"#).unwrap(),
            ClientMessage::Close("s".into())
        );
        assert_eq!(
            ClientMessage::parse(r#"["NEG-OPEN","n","ffff","00"]"#).unwrap(),
            ClientMessage::Negentropy("n".into())
        );
        assert_eq!(
            ClientMessage::parse(r#"["HELLO"]"#).unwrap(),
            ClientMessage::Unknown("HELLO".into())
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(ClientMessage::parse("{"), Err(FrameError::Json(_))));
        assert_eq!(ClientMessage::parse(r#"{"a":1}"#), Err(FrameError::NotArray));
        assert_eq!(ClientMessage::parse("[1]"), Err(FrameError::NoVerb));
        assert_eq!(ClientMessage::parse(r#"["REQ",""]"#), Err(FrameError::SubId));
        let long = "x".repeat(MAX_SUB_ID + 1);
        assert_eq!(
            ClientMessage::parse(&format!(r#"["CLOSE","{long}"]"#)),
            Err(FrameError::SubId)
        );
        assert!(matches!(
            ClientMessage::parse(r#"["EVENT",{"id":1}]"#),
            Err(FrameError::Event(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["REQ","s",{"kinds":"x"}]"#),
            Err(FrameError::Filter(_))
        ));
        let many = vec!["{}"; MAX_FILTERS + 1].join(",");
        assert_eq!(
            ClientMessage::parse(&format!(r#"["REQ","s",{many}]"#)),
            Err(FrameError::TooManyFilters)
        );
    }

    #[test]
    fn challenges_are_fresh() {
        let a = challenge();
        assert_eq!(a.len(), 32);
        assert_ne!(a, challenge());
    }
}
