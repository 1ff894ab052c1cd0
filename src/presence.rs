//! # Room Presence/Stats Aggregator
//!
//! ## Responsibility
//! Folds room events and channel status into a [`RoomStats`] snapshot for the
//! UI: viewer count and its recent trend, connectivity, chat and event volume.
//!
//! ## Guarantees
//! - Bounded: the viewer-count history keeps the last [`HISTORY_CAP`] samples
//! - Cheap to share: [`PresenceTracker`] is a cloneable handle
//! - Handlers never fail; they only record

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{ChannelStatus, ConnectionState};
use crate::dispatcher::{Dispatcher, Subscription};
use crate::envelope::{now_ms, Event, EventKind, PeerRole};

/// Viewer-count samples retained for trend rendering.
pub const HISTORY_CAP: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerSample {
    pub at_ms: i64,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub viewer_count: u32,
    pub peak_viewers: u32,
    pub connected: bool,
    pub reconnecting: bool,
    pub gave_up: bool,
    pub events_seen: u64,
    pub chat_messages: u64,
    /// Chat messages sent by viewers.
    pub audience_interactions: u64,
    pub last_event_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct Inner {
    stats: RoomStats,
    history: VecDeque<ViewerSample>,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    inner: Arc<Mutex<Inner>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the events the tracker folds in.
    pub fn attach(&self, dispatcher: &Dispatcher) -> Vec<Subscription> {
        let counts = self.clone();
        let chats = self.clone();
        let all = self.clone();
        vec![
            dispatcher.on(EventKind::RoomViewerCount, move |event| {
                if let Event::ViewerCount(vc) = event {
                    counts.record_viewer_count(vc.count, now_ms());
                }
                Ok(())
            }),
            dispatcher.on(EventKind::ChatMessage, move |event| {
                let from_audience =
                    matches!(event, Event::Chat(msg) if msg.sender_role != PeerRole::Streamer.as_str());
                chats.with(|inner| {
                    inner.stats.chat_messages += 1;
                    if from_audience {
                        inner.stats.audience_interactions += 1;
                    }
                });
                Ok(())
            }),
            dispatcher.on_any(move |envelope| {
                let at = if envelope.timestamp > 0 { envelope.timestamp } else { now_ms() };
                all.with(|inner| {
                    inner.stats.events_seen += 1;
                    inner.stats.last_event_ms = Some(at);
                });
                Ok(())
            }),
        ]
    }

    /// Follow a channel status watch until the sender goes away.
    pub fn follow(&self, mut status: watch::Receiver<ChannelStatus>) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            loop {
                let current = *status.borrow_and_update();
                tracker.observe(&current);
                if status.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    pub fn observe(&self, status: &ChannelStatus) {
        self.with(|inner| {
            inner.stats.connected = status.state == ConnectionState::Open;
            inner.stats.reconnecting = status.is_reconnecting();
            inner.stats.gave_up = status.gave_up;
        });
    }

    pub fn record_viewer_count(&self, count: u32, at_ms: i64) {
        self.with(|inner| {
            inner.stats.viewer_count = count;
            inner.stats.peak_viewers = inner.stats.peak_viewers.max(count);
            if inner.history.len() == HISTORY_CAP {
                inner.history.pop_front();
            }
            inner.history.push_back(ViewerSample { at_ms, count });
        });
    }

    pub fn stats(&self) -> RoomStats {
        self.inner.lock().map(|g| g.stats.clone()).unwrap_or_default()
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<ViewerSample> {
        self.inner
            .lock()
            .map(|g| g.history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Change in viewer count across the retained history.
    pub fn trend(&self) -> i64 {
        let Ok(g) = self.inner.lock() else {
            return 0;
        };
        match (g.history.front(), g.history.back()) {
            (Some(first), Some(last)) => i64::from(last.count) - i64::from(first.count),
            _ => 0,
        }
    }

    fn with(&self, f: impl FnOnce(&mut Inner)) {
        if let Ok(mut guard) = self.inner.lock() {
            f(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ChatKind, ChatMessage, ViewerCount};

    #[test]
    fn test_history_is_bounded() {
        let t = PresenceTracker::new();
        for i in 0..(HISTORY_CAP as u32 + 10) {
            t.record_viewer_count(i, i64::from(i));
        }
        let h = t.history();
        assert_eq!(h.len(), HISTORY_CAP);
        assert_eq!(h[0].count, 10);
        assert_eq!(t.stats().peak_viewers, HISTORY_CAP as u32 + 9);
    }

    #[test]
    fn test_trend() {
        let t = PresenceTracker::new();
        assert_eq!(t.trend(), 0);
        t.record_viewer_count(5, 1);
        t.record_viewer_count(2, 2);
        assert_eq!(t.trend(), -3);
        assert_eq!(t.stats().peak_viewers, 5);
    }

    #[test]
    fn test_attach_counts_events() {
        let d = Dispatcher::new();
        let t = PresenceTracker::new();
        t.attach(&d);
        d.dispatch_event(&Event::ViewerCount(ViewerCount { count: 4 }));
        d.dispatch_event(&Event::Chat(ChatMessage {
            id: "m".into(),
            kind: ChatKind::Text,
            content: "hi".into(),
            sender: "ann".into(),
            sender_role: "viewer".into(),
            timestamp: 0,
            video_url: None,
        }));
        let s = t.stats();
        assert_eq!(s.viewer_count, 4);
        assert_eq!(s.chat_messages, 1);
        assert_eq!(s.audience_interactions, 1);
        assert_eq!(s.events_seen, 2);
        assert!(s.last_event_ms.is_some());
    }

    #[test]
    fn test_observe_status() {
        let t = PresenceTracker::new();
        t.observe(&ChannelStatus { state: ConnectionState::Open, failures: 0, gave_up: false });
        assert!(t.stats().connected);
        t.observe(&ChannelStatus { state: ConnectionState::Disconnected, failures: 5, gave_up: true });
        let s = t.stats();
        assert!(!s.connected && s.gave_up && !s.reconnecting);
    }
}
