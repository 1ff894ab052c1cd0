//! # Vote Coordinator
//!
//! ## Responsibility
//! Lifecycle of one audience vote per room: `Idle -> Open -> Closed -> Idle`.
//! Accepts ballots while open, recomputes the tally after each one, and
//! computes the winner when the vote closes.
//!
//! ## Guarantees
//! - At most one vote is open; `trigger` while a vote is open (or closed but
//!   not yet finished) is a [`ProtocolViolation`] and changes nothing.
//! - One ballot per user: the first ballot wins, later ones are rejected with
//!   [`InvalidVoteError::DuplicateBallot`].
//! - The tally always sums to the number of accepted ballots.
//! - `Open -> Closed` happens once. A second close (deadline racing an
//!   explicit close) returns `None` and emits nothing.
//! - Ties go to the option announced first.
//!
//! ## NOT Responsible For
//! - Arming the deadline timer (the streamer session owns it)
//! - Broadcasting anything

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::envelope::{VoteCast, VoteOption, VoteProgress, VoteResult};
use crate::error::{InvalidVoteError, ProtocolViolation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteStatus {
    Open,
    Closed,
}

/// Why a vote closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Deadline,
    Explicit,
    Quorum,
}

/// `vote_` followed by 8 lowercase hex digits.
pub fn generate_vote_id() -> String {
    let n: u32 = rand::thread_rng().gen();
    format!("vote_{n:08x}")
}

#[derive(Debug, Clone)]
pub struct VoteSession {
    pub vote_id: String,
    pub options: Vec<VoteOption>,
    pub opened_at: Instant,
    pub deadline: Instant,
    /// user id -> option id
    pub ballots: HashMap<String, String>,
    pub status: VoteStatus,
    pub result: Option<VoteResult>,
}

impl VoteSession {
    /// Per-option counts, with every announced option present.
    pub fn tally(&self) -> BTreeMap<String, u32> {
        let mut tally: BTreeMap<String, u32> = self.options.iter().map(|o| (o.id.clone(), 0)).collect();
        for option_id in self.ballots.values() {
            if let Some(count) = tally.get_mut(option_id) {
                *count += 1;
            }
        }
        tally
    }

    pub fn time_left(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn option(&self, option_id: &str) -> Option<&VoteOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    fn progress(&self, now: Instant) -> VoteProgress {
        let total = self.ballots.len() as u32;
        VoteProgress {
            vote_id: self.vote_id.clone(),
            votes: self.tally(),
            total,
            voted_count: total,
            time_left: self.time_left(now).as_secs(),
        }
    }

    fn compute_result(&self) -> VoteResult {
        let votes = self.tally();
        let total = self.ballots.len() as u32;
        // Options in announcement order; strict `>` keeps the earliest on ties.
        let mut winner: Option<(&str, u32)> = None;
        for option in &self.options {
            let count = votes.get(&option.id).copied().unwrap_or(0);
            if winner.map_or(true, |(_, best)| count > best) {
                winner = Some((option.id.as_str(), count));
            }
        }
        let (winner, winner_count) = winner.unwrap_or(("", 0));
        VoteResult {
            vote_id: self.vote_id.clone(),
            winner: winner.to_string(),
            votes,
            passed: total > 0 && winner_count * 2 > total,
        }
    }
}

#[derive(Debug, Default)]
pub struct VoteCoordinator {
    session: Option<VoteSession>,
}

impl VoteCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` while idle.
    pub fn status(&self) -> Option<VoteStatus> {
        self.session.as_ref().map(|s| s.status)
    }

    pub fn is_idle(&self) -> bool {
        self.session.is_none()
    }

    pub fn session(&self) -> Option<&VoteSession> {
        self.session.as_ref()
    }

    pub fn open_vote_id(&self) -> Option<&str> {
        self.session
            .as_ref()
            .filter(|s| s.status == VoteStatus::Open)
            .map(|s| s.vote_id.as_str())
    }

    pub fn trigger(&mut self, options: Vec<VoteOption>, duration: Duration) -> Result<&VoteSession, ProtocolViolation> {
        self.trigger_at(options, duration, Instant::now())
    }

    /// Idle -> Open.
    pub fn trigger_at(
        &mut self,
        options: Vec<VoteOption>,
        duration: Duration,
        now: Instant,
    ) -> Result<&VoteSession, ProtocolViolation> {
        if let Some(current) = &self.session {
            return Err(match current.status {
                VoteStatus::Open => ProtocolViolation::VoteAlreadyOpen(current.vote_id.clone()),
                VoteStatus::Closed => ProtocolViolation::VoteNotFinished(current.vote_id.clone()),
            });
        }
        if options.is_empty() {
            return Err(ProtocolViolation::NoVoteOptions);
        }
        for (i, option) in options.iter().enumerate() {
            if options[..i].iter().any(|o| o.id == option.id) {
                return Err(ProtocolViolation::DuplicateOption(option.id.clone()));
            }
        }

        let vote_id = generate_vote_id();
        info!(vote_id = %vote_id, options = options.len(), duration_secs = duration.as_secs(), "vote opened");
        Ok(&*self.session.insert(VoteSession {
            vote_id,
            options,
            opened_at: now,
            deadline: now + duration,
            ballots: HashMap::new(),
            status: VoteStatus::Open,
            result: None,
        }))
    }

    pub fn cast_ballot(&mut self, ballot: &VoteCast) -> Result<VoteProgress, InvalidVoteError> {
        self.cast_ballot_at(ballot, Instant::now())
    }

    /// Record a ballot and return the updated progress.
    pub fn cast_ballot_at(&mut self, ballot: &VoteCast, now: Instant) -> Result<VoteProgress, InvalidVoteError> {
        let session = self.session.as_mut().ok_or(InvalidVoteError::NoOpenVote)?;
        if session.vote_id != ballot.vote_id {
            return Err(match session.status {
                VoteStatus::Open => InvalidVoteError::WrongVote {
                    expected: session.vote_id.clone(),
                    got: ballot.vote_id.clone(),
                },
                VoteStatus::Closed => InvalidVoteError::NoOpenVote,
            });
        }
        if session.status == VoteStatus::Closed {
            return Err(InvalidVoteError::VoteClosed(session.vote_id.clone()));
        }
        if now >= session.deadline {
            return Err(InvalidVoteError::DeadlinePassed);
        }
        if session.option(&ballot.option_id).is_none() {
            return Err(InvalidVoteError::UnknownOption(ballot.option_id.clone()));
        }
        if session.ballots.contains_key(&ballot.user_id) {
            return Err(InvalidVoteError::DuplicateBallot(ballot.user_id.clone()));
        }
        session.ballots.insert(ballot.user_id.clone(), ballot.option_id.clone());
        debug!(vote_id = %session.vote_id, user_id = %ballot.user_id, option_id = %ballot.option_id, "ballot accepted");
        Ok(session.progress(now))
    }

    pub fn progress(&self) -> Option<VoteProgress> {
        self.session.as_ref().map(|s| s.progress(Instant::now()))
    }

    /// Open -> Closed. Returns the result the first time only.
    pub fn close(&mut self, reason: CloseReason) -> Option<VoteResult> {
        let session = self.session.as_mut()?;
        if session.status != VoteStatus::Open {
            debug!(vote_id = %session.vote_id, ?reason, "vote already closed");
            return None;
        }
        let result = session.compute_result();
        session.status = VoteStatus::Closed;
        session.result = Some(result.clone());
        info!(vote_id = %result.vote_id, winner = %result.winner, passed = result.passed, ?reason, "vote closed");
        Some(result)
    }

    /// Close the vote if its deadline has passed.
    pub fn close_expired(&mut self, now: Instant) -> Option<VoteResult> {
        let expired = self
            .session
            .as_ref()
            .is_some_and(|s| s.status == VoteStatus::Open && now >= s.deadline);
        if expired {
            self.close(CloseReason::Deadline)
        } else {
            None
        }
    }

    /// Whether at least `percent`% of `audience` have voted. 0 disables.
    pub fn quorum_reached(&self, audience: u32, percent: u32) -> bool {
        let Some(session) = self.session.as_ref().filter(|s| s.status == VoteStatus::Open) else {
            return false;
        };
        if percent == 0 || audience == 0 {
            return false;
        }
        (session.ballots.len() as u64) * 100 >= u64::from(audience) * u64::from(percent)
    }

    /// Closed -> Idle, once the result has been delivered. Returns the
    /// finished session.
    pub fn finish(&mut self) -> Result<VoteSession, ProtocolViolation> {
        match &self.session {
            Some(s) if s.status == VoteStatus::Closed => {}
            Some(s) => {
                return Err(ProtocolViolation::InvalidState { op: "finish", state: format!("{:?}", s.status) })
            }
            None => return Err(ProtocolViolation::InvalidState { op: "finish", state: "Idle".into() }),
        }
        self.session.take().ok_or(ProtocolViolation::InvalidState { op: "finish", state: "Idle".into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn options(ids: &[&str]) -> Vec<VoteOption> {
        ids.iter()
            .map(|id| VoteOption { id: id.to_string(), label: format!("option {id}"), preview: None })
            .collect()
    }

    fn ballot(vote_id: &str, user: &str, option: &str) -> VoteCast {
        VoteCast { vote_id: vote_id.into(), user_id: user.into(), option_id: option.into() }
    }

    fn open(c: &mut VoteCoordinator, now: Instant) -> String {
        c.trigger_at(options(&["A", "B"]), Duration::from_secs(15), now).unwrap().vote_id.clone()
    }

    #[test]
    fn test_vote_id_shape() {
        let id = generate_vote_id();
        assert!(id.starts_with("vote_"));
        assert_eq!(id.len(), 13);
    }

    #[tokio::test]
    async fn test_trigger_while_open_is_rejected() {
        let mut c = VoteCoordinator::new();
        let now = Instant::now();
        let id = open(&mut c, now);
        let err = c.trigger_at(options(&["C"]), Duration::from_secs(5), now).unwrap_err();
        assert_eq!(err, ProtocolViolation::VoteAlreadyOpen(id.clone()));
        assert_eq!(c.open_vote_id(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_trigger_rejects_bad_options() {
        let mut c = VoteCoordinator::new();
        assert_eq!(c.trigger(vec![], Duration::from_secs(5)).unwrap_err(), ProtocolViolation::NoVoteOptions);
        assert_eq!(
            c.trigger(options(&["A", "A"]), Duration::from_secs(5)).unwrap_err(),
            ProtocolViolation::DuplicateOption("A".into())
        );
        assert!(c.is_idle());
    }

    #[tokio::test]
    async fn test_scenario_a_a_b() {
        let mut c = VoteCoordinator::new();
        let now = Instant::now();
        let id = open(&mut c, now);
        c.cast_ballot_at(&ballot(&id, "u1", "A"), now).unwrap();
        c.cast_ballot_at(&ballot(&id, "u2", "A"), now).unwrap();
        let progress = c.cast_ballot_at(&ballot(&id, "u3", "B"), now).unwrap();
        assert_eq!(progress.votes, BTreeMap::from([("A".to_string(), 2), ("B".to_string(), 1)]));
        assert_eq!(progress.total, 3);
        assert_eq!(progress.time_left, 15);

        let result = c.close_expired(now + Duration::from_secs(15)).unwrap();
        assert_eq!(result.winner, "A");
        assert!(result.passed);
        assert_eq!(result.votes, progress.votes);
    }

    #[tokio::test]
    async fn test_duplicate_ballot_first_wins() {
        let mut c = VoteCoordinator::new();
        let now = Instant::now();
        let id = open(&mut c, now);
        c.cast_ballot_at(&ballot(&id, "u1", "A"), now).unwrap();
        let err = c.cast_ballot_at(&ballot(&id, "u1", "B"), now).unwrap_err();
        assert_eq!(err, InvalidVoteError::DuplicateBallot("u1".into()));
        assert_eq!(c.session().unwrap().tally()["A"], 1);
        assert_eq!(c.session().unwrap().tally()["B"], 0);
    }

    #[tokio::test]
    async fn test_ballot_validation() {
        let mut c = VoteCoordinator::new();
        let now = Instant::now();
        assert_eq!(c.cast_ballot_at(&ballot("x", "u", "A"), now).unwrap_err(), InvalidVoteError::NoOpenVote);
        let id = open(&mut c, now);
        assert!(matches!(c.cast_ballot_at(&ballot("other", "u", "A"), now), Err(InvalidVoteError::WrongVote { .. })));
        assert_eq!(
            c.cast_ballot_at(&ballot(&id, "u", "Z"), now).unwrap_err(),
            InvalidVoteError::UnknownOption("Z".into())
        );
        assert_eq!(
            c.cast_ballot_at(&ballot(&id, "u", "A"), now + Duration::from_secs(15)).unwrap_err(),
            InvalidVoteError::DeadlinePassed
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut c = VoteCoordinator::new();
        let now = Instant::now();
        let id = open(&mut c, now);
        assert!(c.close(CloseReason::Explicit).is_some());
        assert!(c.close(CloseReason::Deadline).is_none());
        assert!(c.close_expired(now + Duration::from_secs(60)).is_none());
        assert_eq!(
            c.cast_ballot_at(&ballot(&id, "late", "A"), now).unwrap_err(),
            InvalidVoteError::VoteClosed(id)
        );
    }

    #[tokio::test]
    async fn test_zero_ballots_first_option_not_passed() {
        let mut c = VoteCoordinator::new();
        open(&mut c, Instant::now());
        let result = c.close(CloseReason::Deadline).unwrap();
        assert_eq!(result.winner, "A");
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_tie_goes_to_first_option() {
        let mut c = VoteCoordinator::new();
        let now = Instant::now();
        let id = c.trigger_at(options(&["B", "A"]), Duration::from_secs(15), now).unwrap().vote_id.clone();
        c.cast_ballot_at(&ballot(&id, "u1", "A"), now).unwrap();
        c.cast_ballot_at(&ballot(&id, "u2", "B"), now).unwrap();
        let result = c.close(CloseReason::Explicit).unwrap();
        assert_eq!(result.winner, "B");
        assert!(!result.passed, "1 of 2 is not a strict majority");
    }

    #[tokio::test]
    async fn test_finish_returns_to_idle() {
        let mut c = VoteCoordinator::new();
        let now = Instant::now();
        open(&mut c, now);
        assert!(c.finish().is_err(), "cannot finish an open vote");
        c.close(CloseReason::Explicit);
        assert!(matches!(
            c.trigger_at(options(&["A"]), Duration::from_secs(1), now),
            Err(ProtocolViolation::VoteNotFinished(_))
        ));
        let finished = c.finish().unwrap();
        assert!(finished.result.is_some());
        assert!(c.is_idle());
        assert!(c.trigger_at(options(&["A"]), Duration::from_secs(1), now).is_ok());
    }

    #[tokio::test]
    async fn test_quorum() {
        let mut c = VoteCoordinator::new();
        let now = Instant::now();
        let id = open(&mut c, now);
        c.cast_ballot_at(&ballot(&id, "u1", "A"), now).unwrap();
        assert!(!c.quorum_reached(2, 80));
        c.cast_ballot_at(&ballot(&id, "u2", "B"), now).unwrap();
        assert!(c.quorum_reached(2, 80));
        assert!(!c.quorum_reached(2, 0));
    }

    proptest! {
        #[test]
        fn prop_tally_sums_to_distinct_voters(ballots in proptest::collection::vec((0u8..8, 0u8..3), 0..40)) {
            let mut c = VoteCoordinator::new();
            let now = Instant::now();
            let id = c.trigger_at(options(&["A", "B", "C"]), Duration::from_secs(15), now).unwrap().vote_id.clone();
            let mut voters = std::collections::HashSet::new();
            for (user, opt) in ballots {
                let option = ["A", "B", "C"][opt as usize];
                let accepted = c.cast_ballot_at(&ballot(&id, &format!("u{user}"), option), now).is_ok();
                prop_assert_eq!(accepted, voters.insert(user));
                let tally = c.session().unwrap().tally();
                prop_assert_eq!(tally.values().sum::<u32>() as usize, voters.len());
            }
        }

        #[test]
        fn prop_closed_vote_rejects_every_ballot(offset_secs in 0u64..100, user in "[a-z]{1,6}") {
            let mut c = VoteCoordinator::new();
            let now = Instant::now();
            let id = c.trigger_at(options(&["A", "B"]), Duration::from_secs(15), now).unwrap().vote_id.clone();
            c.close(CloseReason::Explicit);
            let at = now + Duration::from_secs(offset_secs);
            prop_assert!(c.cast_ballot_at(&ballot(&id, &user, "A"), at).is_err());
        }
    }
}
