//! Story data: chapters, characters, dialogue lines and branch points, plus
//! the providers that resolve a story reference into a [`Story`].
//!
//! The JSON shape matches the story files the drama backend serves:
//!
//! ```json
//! {
//!   "meta": { "title": "...", "version": "1", "author": "...", "description": "..." },
//!   "chapters": [
//!     { "id": 1,
//!       "background": { "id": "bg1", "image": "assets/bg1.png" },
//!       "roles": [ { "id": "hero", "name": "Lin", "avatar": "a.png",
//!                    "dialogues": [ { "time": 0, "text": "..." } ] } ],
//!       "branches": [ { "id": "A", "label": "...", "chapter": { ... } } ] }
//!   ]
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LoadError;

/// One line of dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialogue {
    /// Ordering key within the chapter (milliseconds into the chapter).
    pub time: u64,
    pub text: String,
}

/// A speaking character. Serialized as `roles` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub dialogues: Vec<Dialogue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Background {
    pub id: String,
    pub image: String,
}

/// A candidate continuation offered to the audience at a branch point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchOption {
    pub id: String,
    pub label: String,
    pub chapter: Chapter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: u32,
    pub background: Background,
    #[serde(rename = "roles", default)]
    pub characters: Vec<Character>,
    /// Non-empty when the chapter ends in an audience vote.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchOption>,
}

/// A single entry of a chapter's time-ordered script.
#[derive(Debug, Clone, Copy)]
pub struct ScriptLine<'a> {
    pub role_index: usize,
    pub dialogue_index: usize,
    pub character: &'a Character,
    pub dialogue: &'a Dialogue,
}

impl Chapter {
    /// All dialogue lines of the chapter ordered by `time`.
    ///
    /// Ties keep character order, then dialogue order.
    pub fn script(&self) -> Vec<ScriptLine<'_>> {
        let mut lines: Vec<ScriptLine<'_>> = self
            .characters
            .iter()
            .enumerate()
            .flat_map(|(role_index, character)| {
                character
                    .dialogues
                    .iter()
                    .enumerate()
                    .map(move |(dialogue_index, dialogue)| ScriptLine {
                        role_index,
                        dialogue_index,
                        character,
                        dialogue,
                    })
            })
            .collect();
        // sort_by_key is stable
        lines.sort_by_key(|line| line.dialogue.time);
        lines
    }

    pub fn line_count(&self) -> usize {
        self.characters.iter().map(|c| c.dialogues.len()).sum()
    }

    pub fn is_branch_point(&self) -> bool {
        !self.branches.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryMeta {
    pub title: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub meta: StoryMeta,
    pub chapters: Vec<Chapter>,
}

impl Story {
    /// Parse a story from JSON text.
    pub fn from_json(story_ref: &str, text: &str) -> Result<Self, LoadError> {
        serde_json::from_str(text).map_err(|e| LoadError::Parse {
            story_ref: story_ref.to_string(),
            detail: e.to_string(),
        })
    }

    /// Check that the story can be played.
    pub fn validate(&self, story_ref: &str) -> Result<(), LoadError> {
        let invalid = |detail: &str| LoadError::Invalid {
            story_ref: story_ref.to_string(),
            detail: detail.to_string(),
        };
        if self.chapters.is_empty() {
            return Err(invalid("story has no chapters"));
        }
        if self.chapters.iter().all(|c| c.line_count() == 0) {
            return Err(invalid("story has no dialogue"));
        }
        let mut seen = HashSet::new();
        for chapter in &self.chapters {
            if !seen.insert(chapter.id) {
                return Err(invalid(&format!("chapter id {} is used twice", chapter.id)));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Resolves story references into stories.
pub trait StoryProvider: Send + Sync {
    fn load(&self, story_ref: &str) -> impl Future<Output = Result<Story, LoadError>> + Send;
}

/// Serves stories from JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryStoryProvider {
    root: PathBuf,
}

impl DirectoryStoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a reference to a path under the root, refusing anything that could
    /// escape it. A reference without an extension gets `.json`.
    pub fn resolve(&self, story_ref: &str) -> Result<PathBuf, LoadError> {
        let rel = Path::new(story_ref);
        let only_normal = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if story_ref.is_empty() || !only_normal {
            return Err(LoadError::InvalidRef(story_ref.to_string()));
        }
        let path = self.root.join(rel);
        Ok(if path.extension().is_none() { path.with_extension("json") } else { path })
    }
}

impl StoryProvider for DirectoryStoryProvider {
    async fn load(&self, story_ref: &str) -> Result<Story, LoadError> {
        let path = self.resolve(story_ref)?;
        debug!(path = %path.display(), "loading story file");
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LoadError::NotFound(story_ref.to_string())
            } else {
                LoadError::Io { story_ref: story_ref.to_string(), source: e }
            }
        })?;
        Story::from_json(story_ref, &text)
    }
}

/// Stories held in memory, keyed by reference.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStoryProvider {
    stories: HashMap<String, Story>,
}

impl InMemoryStoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_story(mut self, story_ref: impl Into<String>, story: Story) -> Self {
        self.stories.insert(story_ref.into(), story);
        self
    }
}

impl StoryProvider for InMemoryStoryProvider {
    async fn load(&self, story_ref: &str) -> Result<Story, LoadError> {
        self.stories
            .get(story_ref)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(story_ref.to_string()))
    }
}

/// Fetches stories from a story service with `GET {base}/{ref}`.
#[derive(Debug, Clone)]
pub struct HttpStoryProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpStoryProvider {
    /// Build a provider with a 10 s request timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { base_url: base_url.into().trim_end_matches('/').to_string(), client }
    }

    pub fn story_url(&self, story_ref: &str) -> String {
        format!("{}/{}", self.base_url, story_ref.trim_start_matches('/'))
    }
}

impl StoryProvider for HttpStoryProvider {
    async fn load(&self, story_ref: &str) -> Result<Story, LoadError> {
        if story_ref.is_empty() || story_ref.split('/').any(|seg| seg == "..") {
            return Err(LoadError::InvalidRef(story_ref.to_string()));
        }
        let url = self.story_url(story_ref);
        let resp = self.client.get(&url).send().await.map_err(|e| LoadError::Http {
            story_ref: story_ref.to_string(),
            detail: e.to_string(),
        })?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LoadError::NotFound(story_ref.to_string()));
        }
        if !resp.status().is_success() {
            return Err(LoadError::Http {
                story_ref: story_ref.to_string(),
                detail: format!("HTTP {} from {}", resp.status().as_u16(), url),
            });
        }
        let text = resp.text().await.map_err(|e| LoadError::Http {
            story_ref: story_ref.to_string(),
            detail: e.to_string(),
        })?;
        Story::from_json(story_ref, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(time: u64, text: &str) -> Dialogue {
        Dialogue { time, text: text.to_string() }
    }

    fn chapter() -> Chapter {
        Chapter {
            id: 1,
            background: Background { id: "bg".into(), image: "bg.png".into() },
            characters: vec![
                Character {
                    id: "a".into(),
                    name: "Ann".into(),
                    avatar: String::new(),
                    dialogues: vec![line(0, "a0"), line(20, "a1")],
                },
                Character {
                    id: "b".into(),
                    name: "Bo".into(),
                    avatar: String::new(),
                    dialogues: vec![line(10, "b0"), line(20, "b1")],
                },
            ],
            branches: vec![],
        }
    }

    #[test]
    fn test_script_orders_by_time() {
        let ch = chapter();
        let texts: Vec<&str> = ch.script().iter().map(|l| l.dialogue.text.as_str()).collect();
        assert_eq!(texts, vec!["a0", "b0", "a1", "b1"]);
    }

    #[test]
    fn test_script_tie_keeps_character_order() {
        let ch = chapter();
        let script = ch.script();
        assert_eq!(script[2].role_index, 0);
        assert_eq!(script[3].role_index, 1);
        assert_eq!(script[3].dialogue_index, 1);
    }

    #[test]
    fn test_line_count() {
        assert_eq!(chapter().line_count(), 4);
    }

    #[test]
    fn test_validate_rejects_empty_story() {
        let story = Story { meta: StoryMeta::default(), chapters: vec![] };
        assert!(matches!(story.validate("s"), Err(LoadError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let story = Story { meta: StoryMeta::default(), chapters: vec![chapter(), chapter()] };
        let err = story.validate("s").unwrap_err();
        assert!(err.to_string().contains("used twice"));
    }

    #[test]
    fn test_chapter_json_uses_roles_key() {
        let json = serde_json::to_value(chapter()).unwrap();
        assert!(json.get("roles").is_some());
        assert!(json.get("branches").is_none(), "empty branches are omitted");
    }

    #[test]
    fn test_directory_resolve_rejects_traversal() {
        let provider = DirectoryStoryProvider::new("/stories");
        assert!(matches!(provider.resolve("../etc/passwd"), Err(LoadError::InvalidRef(_))));
        assert!(matches!(provider.resolve("/etc/passwd"), Err(LoadError::InvalidRef(_))));
        assert!(matches!(provider.resolve(""), Err(LoadError::InvalidRef(_))));
        assert_eq!(provider.resolve("drama/story.json").unwrap(), PathBuf::from("/stories/drama/story.json"));
        assert_eq!(provider.resolve("demo").unwrap(), PathBuf::from("/stories/demo.json"));
    }

    #[test]
    fn test_http_story_url_joins_cleanly() {
        let provider = HttpStoryProvider::new("http://localhost:8000/stories/");
        assert_eq!(provider.story_url("/a.json"), "http://localhost:8000/stories/a.json");
    }

    #[tokio::test]
    async fn test_in_memory_provider_missing_story() {
        let provider = InMemoryStoryProvider::new();
        assert!(matches!(provider.load("nope").await, Err(LoadError::NotFound(_))));
    }
}
