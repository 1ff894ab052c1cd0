//! Per-room session contexts.
//!
//! A session is created when a client joins a room and torn down by
//! [`StreamerSession::leave`] / [`ViewerSession::leave`]. It owns the channel
//! client and every state machine driven by that room's events; nothing is
//! global.
//!
//! ## Streamer
//! Drives the story. `next` advances the [`NarrativeMachine`] and broadcasts
//! progress. When the story reaches a branch point the session opens a vote,
//! broadcasts `vote:trigger` and arms the deadline timer. Ballots arrive as
//! `vote:cast`; the vote closes on the deadline, on `vote:close`, on
//! [`StreamerSession::close_vote`] or on quorum, whichever comes first. The
//! close broadcasts `vote:result`, splices the winning chapter into the story
//! and broadcasts `drama:chapter_inserted`. Every `vote.interaction_threshold`
//! viewer chat messages, the next `drama:progress` carries
//! `should_trigger_vote`.
//!
//! ## Viewer
//! Mirrors the room into a [`ViewerState`] and casts ballots.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelClient, ChannelStatus, Connector, Outbox};
use crate::config::SyncConfig;
use crate::dispatcher::{HandlerResult, Subscription};
use crate::envelope::{
    now_ms, ChapterInserted, ChapterScene, ChatKind, ChatMessage, DramaEnd, DramaProgress, Event, EventKind,
    PeerRole, PlotUpdate, VoteCast, VoteClose, VoteOption, VoteProgress, VoteRejected, VoteResult, VoteTrigger,
};
use crate::error::{InvalidVoteError, LoadError, ProtocolViolation};
use crate::narrative::{Advance, NarrativeMachine, NarrativeNode, NarrativeState, VoteNeeded};
use crate::presence::{PresenceTracker, RoomStats};
use crate::story::{Chapter, StoryProvider};
use crate::vote::{CloseReason, VoteCoordinator, VoteStatus};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn scene(chapter: &Chapter) -> ChapterScene {
    ChapterScene {
        chapter_id: chapter.id,
        background: chapter.background.clone(),
        roles: chapter.characters.clone(),
    }
}

fn progress_event(node: &NarrativeNode, vote_due: bool) -> Event {
    Event::DramaProgress(Box::new(DramaProgress {
        node_id: node.id.clone(),
        chapter_id: node.chapter_id,
        dialogue_index: node.dialogue_index,
        role_index: node.role_index,
        role: Some(node.speaker.clone()),
        dialogue: Some(node.dialogue.clone()),
        background: node.background.clone(),
        is_chapter_end: node.is_chapter_end,
        is_story_end: node.is_story_end,
        should_trigger_vote: vote_due,
    }))
}

// ---------------------------------------------------------------------------
// Streamer
// ---------------------------------------------------------------------------

/// Where the winning chapter of the open vote goes.
#[derive(Debug, Clone)]
struct Anchor {
    node_id: String,
    chapter_id: u32,
    /// Set for a story branch point; its win settles that branch.
    branch: bool,
}

#[derive(Debug, Default)]
struct Stage {
    narrative: NarrativeMachine,
    votes: VoteCoordinator,
    anchor: Option<Anchor>,
    /// Branch point still waiting for its vote to open.
    pending: Option<VoteNeeded>,
    last_chapter: Option<u32>,
    /// Interaction milestones already flagged on `drama:progress`.
    interaction_milestone: u64,
    deadline: Option<JoinHandle<()>>,
}

/// What a call to [`StreamerSession::next`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Line(NarrativeNode),
    VoteOpened(VoteTrigger),
    Finished(NarrativeNode),
    Idle,
}

#[derive(Clone)]
struct StreamerCore {
    stage: Arc<Mutex<Stage>>,
    outbox: Outbox,
    presence: PresenceTracker,
    quorum_percent: u32,
    interaction_threshold: u64,
    results: Arc<watch::Sender<Option<VoteResult>>>,
}

impl StreamerCore {
    fn on_ballot(&self, cast: &VoteCast) -> HandlerResult {
        let (outcome, quorum) = {
            let mut stage = lock(&self.stage);
            let outcome = stage.votes.cast_ballot(cast);
            let audience = self.presence.stats().viewer_count;
            let quorum = outcome.is_ok() && stage.votes.quorum_reached(audience, self.quorum_percent);
            (outcome, quorum)
        };
        match outcome {
            Ok(progress) => {
                self.outbox.send(&Event::VoteProgress(progress));
            }
            Err(e) => {
                warn!(user_id = %cast.user_id, option_id = %cast.option_id, error = %e, "ballot rejected");
                self.outbox.send(&Event::VoteRejected(VoteRejected {
                    vote_id: cast.vote_id.clone(),
                    user_id: cast.user_id.clone(),
                    option_id: cast.option_id.clone(),
                    reason: e.reason_code().to_string(),
                }));
            }
        }
        if quorum {
            self.conclude(CloseReason::Quorum);
        }
        Ok(())
    }

    fn on_close(&self, close: &VoteClose) -> HandlerResult {
        self.conclude_vote(&close.vote_id, CloseReason::Explicit);
        Ok(())
    }

    /// Close whichever vote is open. Only the first caller gets a result.
    fn conclude(&self, reason: CloseReason) -> Option<VoteResult> {
        let mut stage = lock(&self.stage);
        self.settle(&mut stage, reason)
    }

    /// Close `vote_id` if it is still the open vote.
    fn conclude_vote(&self, vote_id: &str, reason: CloseReason) -> Option<VoteResult> {
        let mut stage = lock(&self.stage);
        if stage.votes.open_vote_id() != Some(vote_id) {
            debug!(vote_id, ?reason, "close for a vote that is not open");
            return None;
        }
        self.settle(&mut stage, reason)
    }

    /// Close the open vote and materialize the winner.
    fn settle(&self, stage: &mut Stage, reason: CloseReason) -> Option<VoteResult> {
        let result = stage.votes.close(reason)?;
        if let Some(timer) = stage.deadline.take() {
            if reason != CloseReason::Deadline {
                timer.abort();
            }
        }
        self.outbox.send(&Event::VoteResult(result.clone()));
        self.results.send_replace(Some(result.clone()));

        let finished = match stage.votes.finish() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "vote could not be finished");
                return Some(result);
            }
        };
        let winner = finished.option(&result.winner).and_then(|o| o.preview.clone());
        match (winner, stage.anchor.take()) {
            (Some(chapter), Some(anchor)) => {
                let inserted = if anchor.branch {
                    stage.narrative.resolve_branch(chapter, &anchor.node_id)
                } else {
                    stage.narrative.insert_chapter(chapter, &anchor.node_id)
                };
                match inserted {
                    Ok(chapter_id) => {
                        self.outbox.send(&Event::DramaChapterInserted(ChapterInserted {
                            chapter_id,
                            insert_after_id: anchor.chapter_id,
                        }));
                    }
                    Err(e) => warn!(error = %e, "winning chapter could not be inserted"),
                }
            }
            (None, Some(_)) => debug!(winner = %result.winner, "winning option carries no chapter"),
            _ => {}
        }
        Some(result)
    }

    fn open_vote(&self, stage: &mut Stage, options: Vec<VoteOption>, duration: Duration) -> Result<VoteTrigger, ProtocolViolation> {
        let session = stage.votes.trigger(options, duration)?;
        let trigger = VoteTrigger {
            vote_id: session.vote_id.clone(),
            options: session.options.clone(),
            duration: duration.as_secs(),
        };
        let deadline = session.deadline;
        self.outbox.send(&Event::VoteTrigger(trigger.clone()));

        let core = self.clone();
        let vote_id = trigger.vote_id.clone();
        stage.deadline = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            core.conclude_vote(&vote_id, CloseReason::Deadline);
        }));
        Ok(trigger)
    }
}

pub struct StreamerSession<C: Connector> {
    room_id: String,
    client: ChannelClient<C>,
    core: StreamerCore,
    vote_duration: Duration,
    subscriptions: Vec<Subscription>,
    status_task: JoinHandle<()>,
}

impl<C: Connector> StreamerSession<C> {
    /// Connect to `room_id` as the streamer and start listening for ballots.
    pub async fn join(connector: C, config: &SyncConfig, room_id: &str) -> Self {
        let mut client = ChannelClient::new(connector, config.server.url.clone(), config.channel_options());
        let presence = PresenceTracker::new();
        let core = StreamerCore {
            stage: Arc::new(Mutex::new(Stage::default())),
            outbox: client.outbox(),
            presence: presence.clone(),
            quorum_percent: config.vote.quorum_percent,
            interaction_threshold: config.vote.interaction_threshold,
            results: Arc::new(watch::channel(None).0),
        };

        let dispatcher = client.dispatcher().clone();
        let mut subscriptions = presence.attach(&dispatcher);
        let ballots = core.clone();
        subscriptions.push(dispatcher.on(EventKind::VoteCast, move |event| match event {
            Event::VoteCast(cast) => ballots.on_ballot(cast),
            _ => Ok(()),
        }));
        let closes = core.clone();
        subscriptions.push(dispatcher.on(EventKind::VoteClose, move |event| match event {
            Event::VoteClose(close) => closes.on_close(close),
            _ => Ok(()),
        }));

        let status_task = presence.follow(client.watch_status());
        client.connect(room_id, PeerRole::Streamer).await;
        info!(room_id, "streamer session started");
        Self {
            room_id: room_id.to_string(),
            client,
            core,
            vote_duration: Duration::from_secs(config.vote.duration_secs),
            subscriptions,
            status_task,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn status(&self) -> ChannelStatus {
        self.client.status()
    }

    pub fn client(&self) -> &ChannelClient<C> {
        &self.client
    }

    pub async fn load_story<P: StoryProvider>(&self, provider: &P, story_ref: &str) -> Result<(), LoadError> {
        let story = provider.load(story_ref).await?;
        let mut stage = lock(&self.core.stage);
        stage.narrative.load_story(story_ref, story)?;
        stage.last_chapter = None;
        stage.pending = None;
        Ok(())
    }

    /// Begin playback and announce the opening chapter.
    pub fn start(&self) -> Result<ChapterScene, ProtocolViolation> {
        let mut stage = lock(&self.core.stage);
        stage.narrative.start()?;
        let opening = stage
            .narrative
            .current_chapter()
            .map(scene)
            .ok_or_else(|| ProtocolViolation::InvalidState { op: "start", state: "no story".into() })?;
        stage.last_chapter = Some(opening.chapter_id);
        self.core.outbox.send(&Event::DramaStart(opening.clone()));
        Ok(opening)
    }

    pub fn next(&self) -> Result<Step, ProtocolViolation> {
        let mut stage = lock(&self.core.stage);

        if stage.narrative.state() == NarrativeState::PausedForVote {
            // A branch point whose vote could not open earlier.
            let Some(needed) = stage.pending.clone() else {
                return Err(ProtocolViolation::InvalidState { op: "next", state: "paused_for_vote".into() });
            };
            return self.open_branch_vote(&mut stage, needed);
        }

        match stage.narrative.advance()? {
            Advance::Node(node) => {
                self.announce_line(&mut stage, &node);
                Ok(Step::Line(node))
            }
            Advance::Ended(node) => {
                self.announce_line(&mut stage, &node);
                self.core.outbox.send(&Event::DramaEnd(DramaEnd { message: "The story has ended".into() }));
                Ok(Step::Finished(node))
            }
            Advance::VoteNeeded(needed) => self.open_branch_vote(&mut stage, needed),
            Advance::Ignored => Ok(Step::Idle),
        }
    }

    fn announce_line(&self, stage: &mut Stage, node: &NarrativeNode) {
        if stage.last_chapter != Some(node.chapter_id) {
            if let Some(chapter) = stage.narrative.chapter(node.chapter_id) {
                self.core.outbox.send(&Event::DramaNewChapter(scene(chapter)));
            }
            stage.last_chapter = Some(node.chapter_id);
        }
        let due = self.vote_due(stage);
        self.core.outbox.send(&progress_event(node, due));
    }

    /// True once per `interaction_threshold` audience interactions.
    fn vote_due(&self, stage: &mut Stage) -> bool {
        let threshold = self.core.interaction_threshold;
        if threshold == 0 {
            return false;
        }
        let milestone = self.core.presence.stats().audience_interactions / threshold;
        if milestone <= stage.interaction_milestone {
            return false;
        }
        stage.interaction_milestone = milestone;
        info!(interactions = milestone * threshold, "audience asks for a vote");
        true
    }

    fn open_branch_vote(&self, stage: &mut Stage, needed: VoteNeeded) -> Result<Step, ProtocolViolation> {
        match self.core.open_vote(stage, needed.options.clone(), self.vote_duration) {
            Ok(trigger) => {
                stage.anchor =
                    Some(Anchor { node_id: needed.after_node_id, chapter_id: needed.chapter_id, branch: true });
                stage.pending = None;
                Ok(Step::VoteOpened(trigger))
            }
            Err(e) => {
                stage.pending = Some(needed);
                Err(e)
            }
        }
    }

    /// Open a vote outside the story's own branch points. A winning option
    /// carrying a `preview` chapter is inserted after the current chapter, and
    /// any branch point of that chapter still gets its own vote.
    pub fn trigger_vote(&self, options: Vec<VoteOption>, duration: Duration) -> Result<VoteTrigger, ProtocolViolation> {
        let mut stage = lock(&self.core.stage);
        let anchor = stage
            .narrative
            .current_node()
            .map(|n| Anchor { node_id: n.id.clone(), chapter_id: n.chapter_id, branch: false });
        let trigger = self.core.open_vote(&mut stage, options, duration)?;
        stage.anchor = anchor;
        Ok(trigger)
    }

    /// Close the open vote now.
    pub fn close_vote(&self) -> Option<VoteResult> {
        self.core.conclude(CloseReason::Explicit)
    }

    pub fn send_chat(&self, sender: &str, content: &str) -> bool {
        self.core.outbox.send(&Event::Chat(ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            kind: ChatKind::Text,
            content: content.to_string(),
            sender: sender.to_string(),
            sender_role: PeerRole::Streamer.as_str().to_string(),
            timestamp: now_ms(),
            video_url: None,
        }))
    }

    pub fn publish_plot(&self, update: PlotUpdate) -> bool {
        self.core.outbox.send(&Event::PlotUpdate(update))
    }

    pub fn narrative_state(&self) -> NarrativeState {
        lock(&self.core.stage).narrative.state()
    }

    pub fn current_node(&self) -> Option<NarrativeNode> {
        lock(&self.core.stage).narrative.current_node().cloned()
    }

    pub fn vote_status(&self) -> Option<VoteStatus> {
        lock(&self.core.stage).votes.status()
    }

    pub fn vote_progress(&self) -> Option<VoteProgress> {
        lock(&self.core.stage).votes.progress()
    }

    pub fn stats(&self) -> RoomStats {
        self.core.presence.stats()
    }

    /// Every vote result, however the vote closed. The relay does not echo
    /// the streamer's own broadcasts back, so this is the streamer's view.
    pub fn watch_results(&self) -> watch::Receiver<Option<VoteResult>> {
        self.core.results.subscribe()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.core.presence
    }

    /// Cancel the vote timer, drop subscriptions and disconnect.
    pub async fn leave(mut self) {
        if let Some(timer) = lock(&self.core.stage).deadline.take() {
            timer.abort();
        }
        for sub in self.subscriptions.drain(..) {
            sub.unsubscribe();
        }
        self.client.disconnect().await;
        self.status_task.abort();
        info!(room_id = %self.room_id, "streamer session closed");
    }
}

impl<C: Connector> Drop for StreamerSession<C> {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.core.stage).deadline.take() {
            timer.abort();
        }
        self.status_task.abort();
    }
}

// ---------------------------------------------------------------------------
// Viewer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteView {
    pub vote_id: String,
    pub options: Vec<VoteOption>,
    pub duration: u64,
    pub progress: Option<VoteProgress>,
    pub my_choice: Option<String>,
    pub closed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoryView {
    pub chapter: Option<ChapterScene>,
    pub line: Option<DramaProgress>,
    pub inserted: Vec<ChapterInserted>,
    pub plot: Option<PlotUpdate>,
    pub ended: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerState {
    pub vote: Option<VoteView>,
    pub last_result: Option<VoteResult>,
    pub last_rejection: Option<VoteRejected>,
    pub story: StoryView,
    pub chat: VecDeque<ChatMessage>,
}

struct ViewerShared {
    user_id: String,
    chat_history: usize,
    result_linger: Duration,
    state: Mutex<ViewerState>,
}

impl ViewerShared {
    fn apply(self: &Arc<Self>, event: &Event) {
        let mut state = lock(&self.state);
        match event {
            Event::VoteTrigger(t) => {
                state.vote = Some(VoteView {
                    vote_id: t.vote_id.clone(),
                    options: t.options.clone(),
                    duration: t.duration,
                    progress: None,
                    my_choice: None,
                    closed: false,
                });
                state.last_rejection = None;
            }
            Event::VoteProgress(p) => {
                if let Some(vote) = state.vote.as_mut().filter(|v| v.vote_id == p.vote_id) {
                    vote.progress = Some(p.clone());
                }
            }
            Event::VoteResult(r) => {
                if let Some(vote) = state.vote.as_mut().filter(|v| v.vote_id == r.vote_id) {
                    vote.closed = true;
                    self.clear_vote_later(r.vote_id.clone());
                }
                state.last_result = Some(r.clone());
            }
            Event::VoteRejected(r) if r.user_id == self.user_id => {
                if r.reason != "duplicate_ballot" {
                    if let Some(vote) = state.vote.as_mut().filter(|v| v.vote_id == r.vote_id) {
                        vote.my_choice = None;
                    }
                }
                state.last_rejection = Some(r.clone());
            }
            Event::DramaStart(s) | Event::DramaNewChapter(s) => {
                state.story.chapter = Some(s.clone());
                state.story.ended = false;
            }
            Event::DramaProgress(p) => state.story.line = Some((**p).clone()),
            Event::DramaChapterInserted(c) => state.story.inserted.push(*c),
            Event::DramaEnd(_) => state.story.ended = true,
            Event::PlotUpdate(p) => state.story.plot = Some(p.clone()),
            Event::Chat(msg) => {
                if state.chat.len() == self.chat_history {
                    state.chat.pop_front();
                }
                if self.chat_history > 0 {
                    state.chat.push_back(msg.clone());
                }
            }
            _ => {}
        }
    }

    fn clear_vote_later(self: &Arc<Self>, vote_id: String) {
        let shared = Arc::clone(self);
        let linger = self.result_linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let mut state = lock(&shared.state);
            if state.vote.as_ref().is_some_and(|v| v.vote_id == vote_id) {
                state.vote = None;
            }
        });
    }
}

pub struct ViewerSession<C: Connector> {
    room_id: String,
    name: String,
    client: ChannelClient<C>,
    shared: Arc<ViewerShared>,
    presence: PresenceTracker,
    subscriptions: Vec<Subscription>,
    status_task: JoinHandle<()>,
}

impl<C: Connector> ViewerSession<C> {
    pub async fn join(connector: C, config: &SyncConfig, room_id: &str, name: &str) -> Self {
        let mut client = ChannelClient::new(connector, config.server.url.clone(), config.channel_options());
        let shared = Arc::new(ViewerShared {
            user_id: uuid::Uuid::new_v4().to_string(),
            chat_history: config.chat.history,
            result_linger: Duration::from_millis(config.vote.result_linger_ms),
            state: Mutex::new(ViewerState::default()),
        });
        let presence = PresenceTracker::new();

        let dispatcher = client.dispatcher().clone();
        let mut subscriptions = presence.attach(&dispatcher);
        for kind in [
            EventKind::VoteTrigger,
            EventKind::VoteProgress,
            EventKind::VoteResult,
            EventKind::VoteRejected,
            EventKind::DramaStart,
            EventKind::DramaNewChapter,
            EventKind::DramaProgress,
            EventKind::DramaChapterInserted,
            EventKind::DramaEnd,
            EventKind::PlotUpdate,
            EventKind::ChatMessage,
        ] {
            let shared = Arc::clone(&shared);
            subscriptions.push(dispatcher.on(kind, move |event| {
                shared.apply(event);
                Ok(())
            }));
        }

        let status_task = presence.follow(client.watch_status());
        client.connect(room_id, PeerRole::Viewer).await;
        info!(room_id, user_id = %shared.user_id, "viewer session started");
        Self {
            room_id: room_id.to_string(),
            name: name.to_string(),
            client,
            shared,
            presence,
            subscriptions,
            status_task,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn status(&self) -> ChannelStatus {
        self.client.status()
    }

    pub fn client(&self) -> &ChannelClient<C> {
        &self.client
    }

    pub fn state(&self) -> ViewerState {
        lock(&self.shared.state).clone()
    }

    pub fn stats(&self) -> RoomStats {
        self.presence.stats()
    }

    /// Vote for `option_id` in the open vote. Returns whether the ballot was
    /// queued for sending.
    pub fn cast_vote(&self, option_id: &str) -> Result<bool, InvalidVoteError> {
        let cast = {
            let mut state = lock(&self.shared.state);
            let vote = state.vote.as_mut().ok_or(InvalidVoteError::NoOpenVote)?;
            if vote.closed {
                return Err(InvalidVoteError::VoteClosed(vote.vote_id.clone()));
            }
            if !vote.options.iter().any(|o| o.id == option_id) {
                return Err(InvalidVoteError::UnknownOption(option_id.to_string()));
            }
            if vote.my_choice.is_some() {
                return Err(InvalidVoteError::DuplicateBallot(self.shared.user_id.clone()));
            }
            vote.my_choice = Some(option_id.to_string());
            VoteCast {
                vote_id: vote.vote_id.clone(),
                option_id: option_id.to_string(),
                user_id: self.shared.user_id.clone(),
            }
        };
        let queued = self.client.send(&Event::VoteCast(cast));
        if !queued {
            if let Some(vote) = lock(&self.shared.state).vote.as_mut() {
                vote.my_choice = None;
            }
        }
        Ok(queued)
    }

    pub fn send_chat(&self, content: &str) -> bool {
        self.client.send(&Event::Chat(ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            kind: ChatKind::Text,
            content: content.to_string(),
            sender: self.name.clone(),
            sender_role: PeerRole::Viewer.as_str().to_string(),
            timestamp: now_ms(),
            video_url: None,
        }))
    }

    pub async fn leave(mut self) {
        for sub in self.subscriptions.drain(..) {
            sub.unsubscribe();
        }
        self.client.disconnect().await;
        self.status_task.abort();
        info!(room_id = %self.room_id, "viewer session closed");
    }
}

impl<C: Connector> Drop for ViewerSession<C> {
    fn drop(&mut self) {
        self.status_task.abort();
    }
}
