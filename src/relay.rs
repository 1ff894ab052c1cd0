//! Room relay: the server end of the event channel.
//!
//! ## Design
//! - [`Relay`] wraps `Arc<Mutex<HashMap<room_id, RelayRoom>>>`, shared by all
//!   connections.
//! - Each room has a `tokio::sync::broadcast` channel carrying [`RelayFrame`]s.
//!   Every member subscribes and filters by the frame's [`Audience`].
//! - The relay decodes every envelope it forwards, so clients only ever see
//!   well-formed frames of known types.
//!
//! ## Routing
//! | Incoming            | Goes to                                          |
//! |---------------------|--------------------------------------------------|
//! | `ping`              | `pong` to the sender only                        |
//! | `vote:cast`         | streamers                                        |
//! | `chat:message`      | everyone, sender included, stamped by the relay  |
//! | streamer-only kinds | everyone else, only when sent by a streamer      |
//! | anything else       | everyone else                                    |
//!
//! `room:viewer_count` is relay-generated on every viewer join and leave.
//!
//! ## HTTP
//! - `GET /ws?room_id=..&role=streamer|viewer`: WebSocket upgrade
//! - `GET /rooms`: JSON list of live rooms
//! - `GET /health`: `ok`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::envelope::{now_ms, Envelope, Event, EventKind, PeerRole, ViewerCount};

/// Who a relayed frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    Others,
    /// Streamers other than the origin.
    Streamers,
}

#[derive(Debug, Clone)]
pub struct RelayFrame {
    /// Member id of the sender; 0 for relay-generated frames.
    pub origin: u64,
    pub audience: Audience,
    pub envelope: Envelope,
}

impl RelayFrame {
    pub fn is_for(&self, member_id: u64, role: PeerRole) -> bool {
        match self.audience {
            Audience::Everyone => true,
            Audience::Others => self.origin != member_id,
            Audience::Streamers => self.origin != member_id && role == PeerRole::Streamer,
        }
    }
}

pub struct RelayRoom {
    pub members: HashMap<u64, PeerRole>,
    pub created_at_ms: i64,
    tx: broadcast::Sender<RelayFrame>,
}

impl RelayRoom {
    fn count(&self, role: PeerRole) -> u32 {
        self.members.values().filter(|r| **r == role).count() as u32
    }
}

/// Summary row served by `GET /rooms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub streamers: u32,
    pub viewers: u32,
    pub created_at_ms: i64,
}

/// Kinds only a streamer may publish.
pub fn streamer_only(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::VoteTrigger
            | EventKind::VoteProgress
            | EventKind::VoteResult
            | EventKind::VoteClose
            | EventKind::VoteRejected
            | EventKind::PlotUpdate
            | EventKind::DramaStart
            | EventKind::DramaProgress
            | EventKind::DramaNewChapter
            | EventKind::DramaChapterInserted
            | EventKind::DramaEnd
    )
}

/// Shared relay state. Cloning shares the room map.
#[derive(Clone)]
pub struct Relay {
    rooms: Arc<Mutex<HashMap<String, RelayRoom>>>,
    capacity: usize,
    next_member: Arc<AtomicU64>,
}

impl Relay {
    /// `capacity` is the per-room broadcast buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            next_member: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Add a member, creating the room on first join.
    pub fn join(&self, room_id: &str, role: PeerRole) -> Option<(u64, broadcast::Receiver<RelayFrame>)> {
        let member_id = self.next_member.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.rooms.lock().ok()?;
        let room = guard.entry(room_id.to_string()).or_insert_with(|| {
            info!(room_id, "room created");
            RelayRoom {
                members: HashMap::new(),
                created_at_ms: now_ms(),
                tx: broadcast::channel(self.capacity).0,
            }
        });
        room.members.insert(member_id, role);
        Some((member_id, room.tx.subscribe()))
    }

    /// Remove a member. Empty rooms are dropped.
    pub fn leave(&self, room_id: &str, member_id: u64) -> Option<PeerRole> {
        let mut guard = self.rooms.lock().ok()?;
        let room = guard.get_mut(room_id)?;
        let role = room.members.remove(&member_id)?;
        if room.members.is_empty() {
            guard.remove(room_id);
            info!(room_id, "room closed");
        }
        Some(role)
    }

    pub fn publish(&self, room_id: &str, frame: RelayFrame) {
        if let Ok(guard) = self.rooms.lock() {
            if let Some(room) = guard.get(room_id) {
                // No receivers is fine: everyone may have left already.
                let _ = room.tx.send(frame);
            }
        }
    }

    pub fn viewer_count(&self, room_id: &str) -> u32 {
        self.rooms
            .lock()
            .ok()
            .and_then(|g| g.get(room_id).map(|r| r.count(PeerRole::Viewer)))
            .unwrap_or(0)
    }

    pub fn rooms(&self) -> Vec<RoomInfo> {
        let Ok(guard) = self.rooms.lock() else {
            return Vec::new();
        };
        let mut rooms: Vec<RoomInfo> = guard
            .iter()
            .map(|(id, room)| RoomInfo {
                room_id: id.clone(),
                streamers: room.count(PeerRole::Streamer),
                viewers: room.count(PeerRole::Viewer),
                created_at_ms: room.created_at_ms,
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    fn announce_viewer_count(&self, room_id: &str) {
        let count = self.viewer_count(room_id);
        self.publish(
            room_id,
            RelayFrame {
                origin: 0,
                audience: Audience::Everyone,
                envelope: Event::ViewerCount(ViewerCount { count }).to_envelope(),
            },
        );
    }

    /// Route one text frame from a member. Returns a reply meant only for the
    /// sender, if any.
    pub fn route(&self, room_id: &str, member_id: u64, role: PeerRole, text: &str) -> Option<Envelope> {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(room_id, member_id, error = %e, "dropping malformed frame");
                return None;
            }
        };
        let event = match Event::decode(&envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!(room_id, member_id, event = %envelope.kind, error = %e, "dropping undecodable envelope");
                return None;
            }
        };

        let kind = event.kind();
        let (audience, event) = match event {
            Event::Ping => return Some(Event::Pong.to_envelope()),
            Event::Pong | Event::ViewerCount(_) => return None,
            _ if role == PeerRole::Viewer && streamer_only(kind) => {
                warn!(room_id, member_id, event = %kind, "viewer sent a streamer-only event; dropped");
                return None;
            }
            Event::VoteCast(cast) => (Audience::Streamers, Event::VoteCast(cast)),
            Event::Chat(mut msg) => {
                msg.sender_role = role.as_str().to_string();
                msg.timestamp = now_ms();
                (Audience::Everyone, Event::Chat(msg))
            }
            other => (Audience::Others, other),
        };
        // to_envelope stamps the relay's clock.
        self.publish(room_id, RelayFrame { origin: member_id, audience, envelope: event.to_envelope() });
        None
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// HTTP / WebSocket front
// ---------------------------------------------------------------------------

/// Decode `%XX` escapes and `+` in a query value.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a query string into key/value pairs.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((url_decode(key), url_decode(val)))
        })
        .collect()
}

/// Validate `/ws` query parameters.
pub fn parse_ws_params(query: &str) -> Result<(String, PeerRole), String> {
    let params = parse_query(query);
    let room_id = params
        .get("room_id")
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .ok_or_else(|| "missing room_id".to_string())?;
    let role = params
        .get("role")
        .ok_or_else(|| "missing role".to_string())?
        .parse::<PeerRole>()?;
    Ok((room_id.to_string(), role))
}

async fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, relay: Relay) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "relay listening");
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, relay).await {
                debug!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

const HEAD_LIMIT: usize = 4096;
const HEAD_WAIT: Duration = Duration::from_secs(5);

/// Peek the request head without consuming it. A head that arrives in pieces
/// is re-peeked until the blank line shows up, the buffer fills, the peer
/// closes or [`HEAD_WAIT`] runs out.
async fn peek_head(stream: &TcpStream) -> std::io::Result<String> {
    let mut buf = vec![0u8; HEAD_LIMIT];
    let deadline = tokio::time::Instant::now() + HEAD_WAIT;
    loop {
        let n = stream.peek(&mut buf).await?;
        let complete = n == 0 || n == buf.len() || buf[..n].windows(4).any(|w| w == b"\r\n\r\n");
        if complete || tokio::time::Instant::now() >= deadline {
            return Ok(String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn handle_connection(mut stream: TcpStream, relay: Relay) -> std::io::Result<()> {
    // Peek so the WebSocket handshake can still read the full request.
    let head = peek_head(&stream).await?;
    let request_line = head.lines().next().unwrap_or("");
    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let is_upgrade = head.to_ascii_lowercase().contains("upgrade: websocket");

    match path {
        "/ws" => {
            let (room_id, role) = match parse_ws_params(query) {
                Ok(params) => params,
                Err(reason) => {
                    warn!(%reason, "rejecting websocket request");
                    return respond(&mut stream, "400 Bad Request", "text/plain", &reason).await;
                }
            };
            if !is_upgrade {
                return respond(&mut stream, "400 Bad Request", "text/plain", "expected websocket upgrade").await;
            }
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => handle_ws(ws, relay, room_id, role).await,
                Err(e) => warn!(error = %e, "websocket handshake failed"),
            }
            Ok(())
        }
        "/rooms" => {
            let body = serde_json::to_string(&relay.rooms()).unwrap_or_else(|_| "[]".to_string());
            respond(&mut stream, "200 OK", "application/json", &body).await
        }
        "/health" => respond(&mut stream, "200 OK", "text/plain", "ok").await,
        _ => respond(&mut stream, "404 Not Found", "text/plain", "not found").await,
    }
}

/// Serve one member until either side goes away.
pub async fn handle_ws(ws: WebSocketStream<TcpStream>, relay: Relay, room_id: String, role: PeerRole) {
    let Some((member_id, mut room_rx)) = relay.join(&room_id, role) else {
        warn!(room_id, "room store unavailable");
        return;
    };
    info!(room_id, member_id, %role, "member joined");
    let (mut sink, mut incoming) = ws.split();

    if role == PeerRole::Viewer {
        relay.announce_viewer_count(&room_id);
    } else {
        let count = relay.viewer_count(&room_id);
        if let Ok(text) = Event::ViewerCount(ViewerCount { count }).to_envelope().to_text() {
            let _ = sink.send(WsMessage::Text(text)).await;
        }
    }

    loop {
        tokio::select! {
            msg = incoming.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(reply) = relay.route(&room_id, member_id, role, &text) {
                        if let Ok(text) = reply.to_text() {
                            if sink.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },

            frame = room_rx.recv() => match frame {
                Ok(frame) => {
                    if !frame.is_for(member_id, role) {
                        continue;
                    }
                    if let Ok(text) = frame.envelope.to_text() {
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(room_id, member_id, missed, "member lagging; frames skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    relay.leave(&room_id, member_id);
    info!(room_id, member_id, %role, "member left");
    if role == PeerRole::Viewer {
        relay.announce_viewer_count(&room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ChatKind, ChatMessage, VoteCast};
    use rstest::rstest;

    #[rstest]
    #[case("room_id=r1&role=viewer", Ok(("r1", PeerRole::Viewer)))]
    #[case("role=streamer&room_id=a%20b", Ok(("a b", PeerRole::Streamer)))]
    #[case("role=viewer", Err("missing room_id"))]
    #[case("room_id=%20&role=viewer", Err("missing room_id"))]
    #[case("room_id=r1", Err("missing role"))]
    #[case("room_id=r1&role=admin", Err("unknown role 'admin'"))]
    fn test_parse_ws_params(#[case] query: &str, #[case] expected: Result<(&str, PeerRole), &str>) {
        let got = parse_ws_params(query);
        match expected {
            Ok((room, role)) => assert_eq!(got.unwrap(), (room.to_string(), role)),
            Err(reason) => assert_eq!(got.unwrap_err(), reason),
        }
    }

    #[test]
    fn test_url_decode_utf8_and_bad_escapes() {
        assert_eq!(url_decode("a+b%21"), "a b!");
        assert_eq!(url_decode("%E5%89%A7"), "剧");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
    }

    #[test]
    fn test_audience_filter() {
        let frame = |audience| RelayFrame { origin: 1, audience, envelope: Event::Pong.to_envelope() };
        assert!(frame(Audience::Everyone).is_for(1, PeerRole::Viewer));
        assert!(!frame(Audience::Others).is_for(1, PeerRole::Viewer));
        assert!(frame(Audience::Others).is_for(2, PeerRole::Viewer));
        assert!(!frame(Audience::Streamers).is_for(2, PeerRole::Viewer));
        assert!(frame(Audience::Streamers).is_for(2, PeerRole::Streamer));
    }

    #[test]
    fn test_join_leave_drops_empty_room() {
        let relay = Relay::new(8);
        let (a, _rx_a) = relay.join("r", PeerRole::Streamer).unwrap();
        let (b, _rx_b) = relay.join("r", PeerRole::Viewer).unwrap();
        assert_eq!(relay.viewer_count("r"), 1);
        assert_eq!(relay.rooms()[0].streamers, 1);
        relay.leave("r", b);
        relay.leave("r", a);
        assert!(relay.rooms().is_empty());
        assert_eq!(relay.leave("r", a), None);
    }

    #[tokio::test]
    async fn test_route_ping_replies_to_sender_only() {
        let relay = Relay::new(8);
        let (id, mut rx) = relay.join("r", PeerRole::Viewer).unwrap();
        let reply = relay.route("r", id, PeerRole::Viewer, &Event::Ping.to_envelope().to_text().unwrap());
        assert_eq!(reply.map(|e| e.kind), Some("pong".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_vote_cast_to_streamers() {
        let relay = Relay::new(8);
        let (viewer, mut rx) = relay.join("r", PeerRole::Viewer).unwrap();
        let cast = Event::VoteCast(VoteCast { vote_id: "v".into(), option_id: "A".into(), user_id: "u".into() });
        relay.route("r", viewer, PeerRole::Viewer, &cast.to_envelope().to_text().unwrap());
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.audience, Audience::Streamers);
        assert!(frame.is_for(99, PeerRole::Streamer));
    }

    #[tokio::test]
    async fn test_route_chat_is_stamped() {
        let relay = Relay::new(8);
        let (viewer, mut rx) = relay.join("r", PeerRole::Viewer).unwrap();
        let chat = Event::Chat(ChatMessage {
            id: "m".into(),
            kind: ChatKind::Text,
            content: "hello".into(),
            sender: "ann".into(),
            sender_role: "streamer".into(),
            timestamp: 1,
            video_url: None,
        });
        relay.route("r", viewer, PeerRole::Viewer, &chat.to_envelope().to_text().unwrap());
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.audience, Audience::Everyone);
        assert_eq!(frame.envelope.data["sender_role"], "viewer");
        assert!(frame.envelope.data["timestamp"].as_i64().unwrap() > 1);
    }

    #[tokio::test]
    async fn test_viewer_cannot_drive_the_story() {
        let relay = Relay::new(8);
        let (viewer, mut rx) = relay.join("r", PeerRole::Viewer).unwrap();
        let end = Event::DramaEnd(crate::envelope::DramaEnd { message: "bye".into() });
        relay.route("r", viewer, PeerRole::Viewer, &end.to_envelope().to_text().unwrap());
        relay.route("r", viewer, PeerRole::Viewer, "not json");
        relay.route("r", viewer, PeerRole::Viewer, r#"{"type":"mystery"}"#);
        assert!(rx.try_recv().is_err());
    }
}
