//! # Narrative State Machine
//!
//! ## Responsibility
//! Walks a [`Story`] one dialogue line at a time. Each [`advance`] yields the
//! next [`NarrativeNode`], or asks for an audience vote when a chapter with
//! unresolved branches has finished, or ends the story.
//!
//! ```text
//! Loading -> Ready -> Playing <-> PausedForVote
//!                        |
//!                        v
//!                      Ended
//! ```
//!
//! ## Guarantees
//! - Deterministic: the same story and the same sequence of `advance` and
//!   `insert_chapter` calls always produce the same node sequence.
//! - Monotonic: the cursor only moves forward. `insert_chapter` and
//!   `resolve_branch` splice new content after an anchor but never move the
//!   cursor back.
//! - A branch point produces exactly one [`Advance::VoteNeeded`] per pause.
//! - Chapters without dialogue are skipped.
//!
//! ## NOT Responsible For
//! - Running the vote (see [`crate::vote`])
//! - Broadcasting progress (see [`crate::session`])
//!
//! [`advance`]: NarrativeMachine::advance

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, info};

use crate::envelope::VoteOption;
use crate::error::{LoadError, ProtocolViolation};
use crate::story::{Background, Chapter, Character, Dialogue, Story, StoryProvider};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NarrativeState {
    #[default]
    Loading,
    Ready,
    Playing,
    PausedForVote,
    Ended,
}

impl fmt::Display for NarrativeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NarrativeState::Loading => "loading",
            NarrativeState::Ready => "ready",
            NarrativeState::Playing => "playing",
            NarrativeState::PausedForVote => "paused_for_vote",
            NarrativeState::Ended => "ended",
        };
        write!(f, "{s}")
    }
}

/// One progression step: a single dialogue line in context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrativeNode {
    /// `"{chapter_id}:{line}"` where `line` indexes the chapter's time-ordered script.
    pub id: String,
    pub chapter_id: u32,
    pub role_index: usize,
    pub dialogue_index: usize,
    pub background: Background,
    pub speaker: Character,
    pub dialogue: Dialogue,
    pub is_chapter_end: bool,
    pub is_story_end: bool,
}

impl NarrativeNode {
    pub fn background_ref(&self) -> &str {
        &self.background.id
    }
}

/// Emitted instead of a node when the audience must pick a continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteNeeded {
    pub chapter_id: u32,
    /// Node the winning chapter is inserted after.
    pub after_node_id: String,
    pub options: Vec<VoteOption>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Node(NarrativeNode),
    VoteNeeded(VoteNeeded),
    /// The final node. No further progression is possible.
    Ended(NarrativeNode),
    /// `advance` after the story ended.
    Ignored,
}

/// Parse a node id into `(chapter_id, line)`.
fn parse_node_id(id: &str) -> Option<(u32, usize)> {
    let (chapter, line) = id.split_once(':')?;
    Some((chapter.parse().ok()?, line.parse().ok()?))
}

#[derive(Debug, Default)]
pub struct NarrativeMachine {
    state: NarrativeState,
    story: Option<Story>,
    /// Index into `story.chapters` of the chapter the cursor is in.
    chapter_pos: usize,
    /// Last emitted line of that chapter; `None` before its first line.
    line_pos: Option<usize>,
    current: Option<NarrativeNode>,
    /// Branch-point chapters whose vote has been materialized.
    resolved: HashSet<u32>,
}

impl NarrativeMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> NarrativeState {
        self.state
    }

    pub fn story(&self) -> Option<&Story> {
        self.story.as_ref()
    }

    pub fn current_node(&self) -> Option<&NarrativeNode> {
        self.current.as_ref()
    }

    pub fn current_chapter(&self) -> Option<&Chapter> {
        self.story.as_ref()?.chapters.get(self.chapter_pos)
    }

    pub fn chapter(&self, id: u32) -> Option<&Chapter> {
        self.story.as_ref()?.chapters.iter().find(|c| c.id == id)
    }

    /// Resolve `story_ref` through `provider` and load it.
    ///
    /// On failure the machine is left as it was.
    pub async fn load<P: StoryProvider>(&mut self, provider: &P, story_ref: &str) -> Result<(), LoadError> {
        let story = provider.load(story_ref).await?;
        self.load_story(story_ref, story)
    }

    /// Load an already resolved story.
    pub fn load_story(&mut self, story_ref: &str, story: Story) -> Result<(), LoadError> {
        story.validate(story_ref)?;
        info!(story_ref, title = %story.meta.title, chapters = story.chapters.len(), "story loaded");
        self.install(story);
        Ok(())
    }

    fn install(&mut self, story: Story) {
        self.chapter_pos = story.chapters.iter().position(|c| c.line_count() > 0).unwrap_or(0);
        self.line_pos = None;
        self.current = None;
        self.resolved.clear();
        self.story = Some(story);
        self.state = NarrativeState::Ready;
    }

    fn violation(&self, op: &'static str) -> ProtocolViolation {
        ProtocolViolation::InvalidState { op, state: self.state.to_string() }
    }

    /// Ready -> Playing.
    pub fn start(&mut self) -> Result<(), ProtocolViolation> {
        if self.state != NarrativeState::Ready {
            return Err(self.violation("start"));
        }
        self.state = NarrativeState::Playing;
        Ok(())
    }

    /// Move to the next dialogue line.
    pub fn advance(&mut self) -> Result<Advance, ProtocolViolation> {
        match self.state {
            NarrativeState::Ended => return Ok(Advance::Ignored),
            NarrativeState::Playing => {}
            _ => return Err(self.violation("advance")),
        }
        let Some(story) = self.story.as_ref() else {
            return Err(self.violation("advance"));
        };

        if let Some(node) = self.current.as_ref().filter(|n| n.is_chapter_end) {
            if let Some(chapter) = story.chapters.get(self.chapter_pos) {
                if chapter.is_branch_point() && !self.resolved.contains(&chapter.id) {
                    let needed = VoteNeeded {
                        chapter_id: chapter.id,
                        after_node_id: node.id.clone(),
                        options: chapter
                            .branches
                            .iter()
                            .map(|b| VoteOption {
                                id: b.id.clone(),
                                label: b.label.clone(),
                                preview: Some(b.chapter.clone()),
                            })
                            .collect(),
                    };
                    debug!(chapter_id = chapter.id, options = needed.options.len(), "pausing for vote");
                    self.state = NarrativeState::PausedForVote;
                    return Ok(Advance::VoteNeeded(needed));
                }
            }
        }

        let Some((chapter_pos, line)) = self.next_position() else {
            // Only reachable when the last node was not flagged as the story end.
            self.state = NarrativeState::Ended;
            return Ok(Advance::Ignored);
        };
        let Some(node) = self.build_node(chapter_pos, line) else {
            return Err(self.violation("advance"));
        };
        self.chapter_pos = chapter_pos;
        self.line_pos = Some(line);
        self.current = Some(node.clone());

        if node.is_story_end {
            info!(node_id = %node.id, "story ended");
            self.state = NarrativeState::Ended;
            return Ok(Advance::Ended(node));
        }
        Ok(Advance::Node(node))
    }

    fn next_position(&self) -> Option<(usize, usize)> {
        let chapters = &self.story.as_ref()?.chapters;
        let mut pos = self.chapter_pos;
        let mut line = self.line_pos.map_or(0, |l| l + 1);
        loop {
            let chapter = chapters.get(pos)?;
            if line < chapter.line_count() {
                return Some((pos, line));
            }
            pos += 1;
            line = 0;
        }
    }

    fn build_node(&self, chapter_pos: usize, line: usize) -> Option<NarrativeNode> {
        let chapters = &self.story.as_ref()?.chapters;
        let chapter = chapters.get(chapter_pos)?;
        let script = chapter.script();
        let entry = script.get(line)?;
        let is_chapter_end = line + 1 == script.len();
        let pending_vote = chapter.is_branch_point() && !self.resolved.contains(&chapter.id);
        let is_story_end = is_chapter_end
            && !pending_vote
            && chapters[chapter_pos + 1..].iter().all(|c| c.line_count() == 0);
        Some(NarrativeNode {
            id: format!("{}:{}", chapter.id, line),
            chapter_id: chapter.id,
            role_index: entry.role_index,
            dialogue_index: entry.dialogue_index,
            background: chapter.background.clone(),
            speaker: entry.character.clone(),
            dialogue: entry.dialogue.clone(),
            is_chapter_end,
            is_story_end,
        })
    }

    /// Splice `chapter` into the story directly after the chapter containing
    /// `after_node_id`. The chapter gets a fresh id (`max + 1`), which is
    /// returned.
    ///
    /// Insertion is chapter-granular: when the anchor is mid-chapter, the rest
    /// of that chapter still plays before the new one. A branch point in the
    /// anchor chapter stays pending; use [`resolve_branch`] to materialize a
    /// branch vote.
    ///
    /// [`resolve_branch`]: NarrativeMachine::resolve_branch
    pub fn insert_chapter(&mut self, chapter: Chapter, after_node_id: &str) -> Result<u32, ProtocolViolation> {
        self.splice(chapter, after_node_id).map(|(id, _)| id)
    }

    /// Insert the winning chapter of a branch vote after `after_node_id` and
    /// mark the anchor chapter's branch point as decided.
    pub fn resolve_branch(&mut self, chapter: Chapter, after_node_id: &str) -> Result<u32, ProtocolViolation> {
        let (new_id, anchor_id) = self.splice(chapter, after_node_id)?;
        self.resolved.insert(anchor_id);
        Ok(new_id)
    }

    fn splice(&mut self, mut chapter: Chapter, after_node_id: &str) -> Result<(u32, u32), ProtocolViolation> {
        if matches!(self.state, NarrativeState::Loading | NarrativeState::Ended) {
            return Err(self.violation("insert_chapter"));
        }
        let anchor = || ProtocolViolation::AnchorNotFound(after_node_id.to_string());
        let (anchor_id, line) = parse_node_id(after_node_id).ok_or_else(anchor)?;
        let Some(story) = self.story.as_mut() else {
            return Err(anchor());
        };
        let anchor_pos = story
            .chapters
            .iter()
            .position(|c| c.id == anchor_id && line < c.line_count())
            .ok_or_else(anchor)?;

        let new_id = story.chapters.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        chapter.id = new_id;
        story.chapters.insert(anchor_pos + 1, chapter);
        if anchor_pos < self.chapter_pos {
            self.chapter_pos += 1;
        }

        if self.state == NarrativeState::PausedForVote {
            self.state = NarrativeState::Playing;
        }
        // The current node may no longer be the last one.
        if let Some(current) = self.current.as_mut() {
            current.is_story_end = false;
        }
        info!(chapter_id = new_id, after = after_node_id, "chapter inserted");
        Ok((new_id, anchor_id))
    }
}
