//! Scripted in-memory connector shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use storycast::channel::{ChannelOptions, ChannelStatus, Connector, Endpoint, ReconnectPolicy, Transport};
use storycast::error::ConnectionError;
use storycast::story::{Background, BranchOption, Chapter, Character, Dialogue, Story, StoryMeta};
use storycast::{Envelope, Event};

/// Server side of one accepted mock connection. Dropping it closes the
/// connection from the client's point of view.
pub struct MockPeer {
    pub endpoint: Endpoint,
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl MockPeer {
    pub fn push(&self, event: &Event) {
        let text = event.to_envelope().to_text().unwrap();
        self.to_client.send(text).unwrap();
    }

    pub fn push_raw(&self, text: &str) {
        self.to_client.send(text.to_string()).unwrap();
    }

    /// Next envelope the client sent, skipping keepalive pings.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            let text = self.from_client.recv().await?;
            let envelope = Envelope::from_text(&text).unwrap();
            if envelope.kind != "ping" {
                return Some(envelope);
            }
        }
    }

    /// Skip envelopes until one of `kind` arrives.
    pub async fn expect(&mut self, kind: &str) -> Event {
        loop {
            let envelope = self.next_envelope().await.unwrap_or_else(|| panic!("closed while waiting for {kind}"));
            if envelope.kind == kind {
                return Event::decode(&envelope).unwrap();
            }
        }
    }
}

pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        self.outgoing.send(text).map_err(|_| ConnectionError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, ConnectionError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

struct Inner {
    plan: Mutex<VecDeque<bool>>,
    accept_when_unplanned: bool,
    attempts: AtomicU32,
    peers: mpsc::UnboundedSender<MockPeer>,
}

/// Accepts or refuses each connection attempt according to a plan.
#[derive(Clone)]
pub struct MockConnector {
    inner: Arc<Inner>,
}

impl MockConnector {
    /// `plan[i]` decides attempt `i`; attempts past the plan use
    /// `accept_when_unplanned`.
    pub fn scripted(plan: &[bool], accept_when_unplanned: bool) -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            plan: Mutex::new(plan.iter().copied().collect()),
            accept_when_unplanned,
            attempts: AtomicU32::new(0),
            peers: tx,
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    pub fn accepting() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        Self::scripted(&[], true)
    }

    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<MockTransport, ConnectionError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let accept = self
            .inner
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.inner.accept_when_unplanned);
        if !accept {
            return Err(ConnectionError::Connect { url: endpoint.base_url.clone(), detail: "refused".into() });
        }
        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let _ = self.inner.peers.send(MockPeer { endpoint: endpoint.clone(), to_client, from_client });
        Ok(MockTransport { incoming, outgoing })
    }
}

pub fn options(base_ms: u64, max_ms: u64, max_attempts: u32) -> ChannelOptions {
    ChannelOptions {
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            max_attempts,
        },
        heartbeat: None,
        ..ChannelOptions::default()
    }
}

pub async fn wait_until(
    status: &mut tokio::sync::watch::Receiver<ChannelStatus>,
    f: impl FnMut(&ChannelStatus) -> bool,
) -> ChannelStatus {
    *status.wait_for(f).await.unwrap()
}

pub fn chapter(id: u32, lines: &[&str]) -> Chapter {
    Chapter {
        id,
        background: Background { id: format!("bg{id}"), image: format!("bg{id}.png") },
        characters: vec![Character {
            id: "hero".into(),
            name: "Lin".into(),
            avatar: String::new(),
            dialogues: lines
                .iter()
                .enumerate()
                .map(|(i, t)| Dialogue { time: i as u64 * 10, text: t.to_string() })
                .collect(),
        }],
        branches: vec![],
    }
}

/// Chapter 1 (two lines) ends in a vote between A (one line) and B (two
/// lines); chapter 2 (one line) closes the story.
pub fn branching_story() -> Story {
    let mut first = chapter(1, &["a", "b"]);
    first.branches = vec![
        BranchOption { id: "A".into(), label: "left".into(), chapter: chapter(90, &["left"]) },
        BranchOption { id: "B".into(), label: "right".into(), chapter: chapter(91, &["right", "more"]) },
    ];
    Story { meta: StoryMeta { title: "demo".into(), ..Default::default() }, chapters: vec![first, chapter(2, &["end"])] }
}
