//! End-to-end: a real relay on an ephemeral port, one streamer and two
//! viewers connected with the WebSocket connector.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use common::branching_story;
use storycast::channel::WsConnector;
use storycast::relay::{self, Relay};
use storycast::session::{Step, StreamerSession, ViewerSession};
use storycast::story::InMemoryStoryProvider;
use storycast::SyncConfig;

async fn start_relay() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(relay::serve(listener, Relay::new(64)));
    addr
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn http_get(addr: std::net::SocketAddr, target: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_full_vote_through_relay() {
    let addr = start_relay().await;
    let mut cfg = SyncConfig::default();
    cfg.server.url = format!("ws://{addr}/ws");
    cfg.vote.duration_secs = 60;

    let streamer = StreamerSession::join(WsConnector, &cfg, "stage").await;
    let ann = ViewerSession::join(WsConnector, &cfg, "stage", "ann").await;
    let bob = ViewerSession::join(WsConnector, &cfg, "stage", "bob").await;
    eventually("both viewers counted", || streamer.stats().viewer_count == 2).await;
    eventually("viewers open", || ann.status().is_open() && bob.status().is_open()).await;

    let provider = InMemoryStoryProvider::new().with_story("demo", branching_story());
    streamer.load_story(&provider, "demo").await.unwrap();
    streamer.start().unwrap();
    streamer.next().unwrap();
    streamer.next().unwrap();
    let trigger = match streamer.next().unwrap() {
        Step::VoteOpened(t) => t,
        other => panic!("expected a vote, got {other:?}"),
    };

    eventually("vote reaches viewers", || {
        [&ann, &bob].iter().all(|v| v.state().vote.is_some_and(|vote| vote.vote_id == trigger.vote_id))
    })
    .await;
    let ann_state = ann.state();
    assert_eq!(ann_state.story.chapter.as_ref().map(|c| c.chapter_id), Some(1));
    assert_eq!(ann_state.story.line.as_ref().map(|l| l.node_id.as_str()), Some("1:1"));

    assert_eq!(ann.cast_vote("B"), Ok(true));
    assert_eq!(bob.cast_vote("B"), Ok(true));
    eventually("ballots tallied", || streamer.vote_progress().is_some_and(|p| p.total == 2)).await;
    eventually("progress reaches viewers", || {
        bob.state().vote.and_then(|v| v.progress).is_some_and(|p| p.total == 2)
    })
    .await;

    let result = streamer.close_vote().unwrap();
    assert_eq!(result.winner, "B");
    assert!(result.passed);

    eventually("result reaches viewers", || {
        [&ann, &bob].iter().all(|v| {
            let s = v.state();
            s.last_result.as_ref().is_some_and(|r| r.winner == "B") && s.story.inserted.len() == 1
        })
    })
    .await;
    let inserted = ann.state().story.inserted[0];
    assert_eq!((inserted.chapter_id, inserted.insert_after_id), (3, 1));

    assert!(ann.send_chat("go right!"));
    eventually("chat echoed to everyone", || {
        [&ann, &bob].iter().all(|v| v.state().chat.iter().any(|m| m.content == "go right!" && m.sender_role == "viewer"))
    })
    .await;

    bob.leave().await;
    eventually("viewer count drops", || streamer.stats().viewer_count == 1).await;
    ann.leave().await;
    streamer.leave().await;
}

#[tokio::test]
async fn test_viewer_cannot_forge_story_events() {
    let addr = start_relay().await;
    let mut cfg = SyncConfig::default();
    cfg.server.url = format!("ws://{addr}/ws");

    let streamer = StreamerSession::join(WsConnector, &cfg, "forge").await;
    let mallory = ViewerSession::join(WsConnector, &cfg, "forge", "mallory").await;
    let honest = ViewerSession::join(WsConnector, &cfg, "forge", "honest").await;
    eventually("viewers counted", || streamer.stats().viewer_count == 2).await;
    eventually("viewers open", || mallory.status().is_open() && honest.status().is_open()).await;

    let forged = storycast::envelope::Event::DramaEnd(storycast::envelope::DramaEnd { message: "fake".into() });
    assert!(mallory.client().send(&forged));
    assert!(mallory.send_chat("marker"));
    eventually("marker chat arrives", || honest.state().chat.iter().any(|m| m.content == "marker")).await;
    assert!(!honest.state().story.ended);
}

#[tokio::test]
async fn test_upgrade_request_split_across_writes() {
    let addr = start_relay().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /ws?room_id=split&role=viewer HTTP/1.1\r\nHost: localhost\r\n").await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream
        .write_all(
            b"Upgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.starts_with("HTTP/1.1 101"), "{response}");
}

#[tokio::test]
async fn test_http_endpoints() {
    let addr = start_relay().await;

    let missing_room = http_get(addr, "/ws?role=viewer").await;
    assert!(missing_room.starts_with("HTTP/1.1 400"), "{missing_room}");

    let bad_role = http_get(addr, "/ws?room_id=r&role=admin").await;
    assert!(bad_role.starts_with("HTTP/1.1 400"), "{bad_role}");

    let no_upgrade = http_get(addr, "/ws?room_id=r&role=viewer").await;
    assert!(no_upgrade.starts_with("HTTP/1.1 400"), "{no_upgrade}");

    let health = http_get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200") && health.ends_with("ok"), "{health}");

    let rooms = http_get(addr, "/rooms").await;
    assert!(rooms.starts_with("HTTP/1.1 200") && rooms.ends_with("[]"), "{rooms}");

    let unknown = http_get(addr, "/nope").await;
    assert!(unknown.starts_with("HTTP/1.1 404"), "{unknown}");
}
