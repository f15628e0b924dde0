//! Per-request leader-election state machine.
//!
//! The original (`yadtreceiver.voting`) wires a generic `fysom` finite-state
//! machine with three callbacks stored as closures. `fysom` has no Rust
//! analogue and closures-in-both-directions (dispatcher owns the FSM, the
//! FSM's callbacks capture the dispatcher) would need `Rc<RefCell<..>>` on
//! both sides to compile. Per the source's own design note (spec.md §9),
//! this crate instead keeps `VotingState` as plain data and a transition
//! table; the dispatcher resolves the right action to take from the
//! [`Action`] a transition returns, looking itself up by `tracking_id`
//! rather than being captured by the FSM.

/// The three states a request negotiation can be in. Normative transition
/// table: spec.md §4.B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Negotiating,
    Spawning,
    Finish,
}

/// What the dispatcher must do in response to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No side effect; the transition only changed bookkeeping (or nothing
    /// changed at all, e.g. a late `showdown` while already finished).
    None,
    /// Broadcast `own_vote` to peers. Only produced once, at creation.
    BroadcastVote,
    /// Spawn the child process for this request.
    Spawn,
    /// Remove this tracking id from the registry.
    Cleanup,
}

/// State tracked for a single in-flight request, keyed by `tracking_id` in
/// the dispatcher's registry.
#[derive(Debug, Clone)]
pub struct VotingState {
    tracking_id: String,
    own_vote: String,
    phase: Phase,
}

impl VotingState {
    /// Creates a new negotiation. The caller must broadcast `own_vote`
    /// immediately (the returned [`Action::BroadcastVote`] is a reminder,
    /// not a deferred effect).
    pub fn create(tracking_id: impl Into<String>, own_vote: impl Into<String>) -> (Self, Action) {
        let state = VotingState {
            tracking_id: tracking_id.into(),
            own_vote: own_vote.into(),
            phase: Phase::Negotiating,
        };
        (state, Action::BroadcastVote)
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn own_vote(&self) -> &str {
        &self.own_vote
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// A peer's vote outranks ours: we keep negotiating, nothing to do.
    pub fn call(&mut self) -> Action {
        Action::None
    }

    /// A peer's vote beats ours: fold immediately.
    pub fn fold(&mut self) -> Action {
        match self.phase {
            Phase::Negotiating => {
                self.phase = Phase::Finish;
                Action::Cleanup
            }
            _ => Action::None,
        }
    }

    /// The showdown timer fired. Idempotent once `Finish` has been reached,
    /// per spec.md §4.B ("late showdown") and §9 (timer is never cancelled
    /// on fold).
    pub fn showdown(&mut self) -> Action {
        match self.phase {
            Phase::Negotiating => {
                self.phase = Phase::Spawning;
                Action::Spawn
            }
            Phase::Spawning | Phase::Finish => Action::None,
        }
    }

    /// The child process has been spawned successfully.
    pub fn spawned(&mut self) -> Action {
        match self.phase {
            Phase::Spawning => {
                self.phase = Phase::Finish;
                Action::Cleanup
            }
            _ => Action::None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finish)
    }
}

/// Reference tie-break policy from spec.md §4.B: a strictly greater peer
/// vote folds us; anything else (including equality) is a call.
pub fn should_fold(own_vote: &str, peer_vote: &str) -> bool {
    peer_vote > own_vote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_broadcasts_vote_and_starts_negotiating() {
        let (state, action) = VotingState::create("t1", "abc");
        assert_eq!(action, Action::BroadcastVote);
        assert_eq!(state.phase(), Phase::Negotiating);
    }

    #[test]
    fn fold_from_negotiating_cleans_up() {
        let (mut state, _) = VotingState::create("t1", "abc");
        assert_eq!(state.fold(), Action::Cleanup);
        assert_eq!(state.phase(), Phase::Finish);
    }

    #[test]
    fn showdown_spawns_once_negotiating() {
        let (mut state, _) = VotingState::create("t1", "abc");
        assert_eq!(state.showdown(), Action::Spawn);
        assert_eq!(state.phase(), Phase::Spawning);
    }

    #[test]
    fn late_showdown_after_finish_is_noop() {
        let (mut state, _) = VotingState::create("t1", "abc");
        state.fold();
        assert_eq!(state.showdown(), Action::None);
        assert_eq!(state.phase(), Phase::Finish);
    }

    #[test]
    fn spawned_after_showdown_cleans_up() {
        let (mut state, _) = VotingState::create("t1", "abc");
        state.showdown();
        assert_eq!(state.spawned(), Action::Cleanup);
        assert_eq!(state.phase(), Phase::Finish);
        assert!(state.is_finished());
    }

    #[test]
    fn tie_break_reference_policy() {
        assert!(should_fold("0x01", "0xFF"));
        assert!(!should_fold("0xFF", "0x01"));
        // equality: reference policy treats it as a call (not a fold), as
        // long as every peer agrees on this, per spec.md §4.B.
        assert!(!should_fold("abc", "abc"));
    }
}
