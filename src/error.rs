//! Error taxonomy for the synchronization layer.
//!
//! Each failure class has its own enum so callers can match on exactly the
//! failures an operation can produce. [`SyncError`] wraps all of them for code
//! that only needs to propagate.
//!
//! | Error               | Recovery                                            |
//! |---------------------|-----------------------------------------------------|
//! | `ConnectionError`   | local backoff/reconnect, surfaced as a status flag  |
//! | `DecodeError`       | frame dropped and logged                            |
//! | `InvalidVoteError`  | ballot rejected, sender notified                    |
//! | `LoadError`         | fatal to `NarrativeMachine::load`                   |
//! | `ProtocolViolation` | ignored and logged                                  |

use thiserror::Error;

/// Transport-level failure. Never fatal: the channel client turns these into
/// reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The server URL could not be built from the configured base and query.
    #[error("invalid server url '{url}': {detail}")]
    InvalidUrl { url: String, detail: String },
    /// Connecting (TCP or WebSocket handshake) failed.
    #[error("failed to connect to {url}: {detail}")]
    Connect { url: String, detail: String },
    /// A send or receive on an established transport failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
}

/// A frame that could not be turned into a typed event.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event type '{0}'")]
    UnknownType(String),
    #[error("invalid payload for '{kind}': {detail}")]
    Payload { kind: String, detail: String },
}

/// A ballot the vote coordinator refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidVoteError {
    #[error("no vote is open")]
    NoOpenVote,
    #[error("vote '{0}' is closed")]
    VoteClosed(String),
    #[error("ballot for vote '{got}' but the open vote is '{expected}'")]
    WrongVote { expected: String, got: String },
    #[error("option '{0}' is not part of this vote")]
    UnknownOption(String),
    #[error("user '{0}' has already voted")]
    DuplicateBallot(String),
    #[error("the voting deadline has passed")]
    DeadlinePassed,
}

impl InvalidVoteError {
    /// Short machine-readable reason sent in `vote:rejected` envelopes.
    pub fn reason_code(&self) -> &'static str {
        match self {
            InvalidVoteError::NoOpenVote => "no_open_vote",
            InvalidVoteError::VoteClosed(_) => "vote_closed",
            InvalidVoteError::WrongVote { .. } => "wrong_vote",
            InvalidVoteError::UnknownOption(_) => "unknown_option",
            InvalidVoteError::DuplicateBallot(_) => "duplicate_ballot",
            InvalidVoteError::DeadlinePassed => "deadline_passed",
        }
    }
}

/// A story reference that could not be resolved into a playable story.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("story '{0}' not found")]
    NotFound(String),
    #[error("story reference '{0}' is not allowed")]
    InvalidRef(String),
    #[error("failed to read story '{story_ref}': {source}")]
    Io {
        story_ref: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse story '{story_ref}': {detail}")]
    Parse { story_ref: String, detail: String },
    #[error("story service request for '{story_ref}' failed: {detail}")]
    Http { story_ref: String, detail: String },
    #[error("story '{story_ref}' is invalid: {detail}")]
    Invalid { story_ref: String, detail: String },
}

/// An operation issued in a state that does not allow it. Logged and ignored
/// by the session layer; never shown to end users.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("vote '{0}' is already in progress")]
    VoteAlreadyOpen(String),
    #[error("previous vote '{0}' has not been finished")]
    VoteNotFinished(String),
    #[error("a vote needs at least one option")]
    NoVoteOptions,
    #[error("vote option '{0}' is listed twice")]
    DuplicateOption(String),
    #[error("operation '{op}' is not valid in state {state}")]
    InvalidState { op: &'static str, state: String },
    #[error("node '{0}' is not part of the story")]
    AnchorNotFound(String),
}

/// Configuration file problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for '{field}': {detail}")]
    Invalid { field: &'static str, detail: String },
}

/// Crate-level error wrapping every failure class.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    InvalidVote(#[from] InvalidVoteError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
