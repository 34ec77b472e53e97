//! Coordinator state machine.
//!
//! ```text
//!                RecvParticipantList           RecvFinalVoteCommit
//!   ┌──────┐    ───────────────────►  ┌─────────────────┐  ──────────►  ┌──────────────────────┐
//!   │ Init │                          │ WaitingForVotes │               │ WaitingForCommitAcks │
//!   └──────┘                          └─────────────────┘               └──────────────────────┘
//!      │ RecvVoteAbort                   │ RecvVoteAbort                    │ RecvFinalCommitAck
//!      ▼                                 ▼                                  ▼
//!   ┌─────────┐ ◄──────────────────────────┘                          ┌───────────┐
//!   │ Aborted │                                                       │ Committed │
//!   └─────────┘                                                       └───────────┘
//!
//!   Any other (state, event) pair moves the machine to Broken.
//! ```

use crate::error::CoordinatorError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tokio::sync::oneshot;

/// State of a transaction coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordinatorState {
    Init,
    WaitingForVotes,
    WaitingForCommitAcks,
    Committed,
    Aborted,
    /// An invalid event was delivered; the coordinator is unusable.
    Broken,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Init => write!(f, "init"),
            CoordinatorState::WaitingForVotes => write!(f, "waiting_for_votes"),
            CoordinatorState::WaitingForCommitAcks => write!(f, "waiting_for_commit_acks"),
            CoordinatorState::Committed => write!(f, "committed"),
            CoordinatorState::Aborted => write!(f, "aborted"),
            CoordinatorState::Broken => write!(f, "broken"),
        }
    }
}

impl CoordinatorState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoordinatorState::Committed | CoordinatorState::Aborted | CoordinatorState::Broken
        )
    }
}

/// Event delivered to the coordinator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorEvent {
    RecvParticipantList,
    RecvVoteAbort,
    RecvFinalVoteCommit,
    RecvFinalCommitAck,
}

impl fmt::Display for CoordinatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorEvent::RecvParticipantList => write!(f, "recv_participant_list"),
            CoordinatorEvent::RecvVoteAbort => write!(f, "recv_vote_abort"),
            CoordinatorEvent::RecvFinalVoteCommit => write!(f, "recv_final_vote_commit"),
            CoordinatorEvent::RecvFinalCommitAck => write!(f, "recv_final_commit_ack"),
        }
    }
}

type WaitResult = Result<CoordinatorState, CoordinatorError>;

#[derive(Debug)]
struct Waiter {
    targets: Vec<CoordinatorState>,
    tx: oneshot::Sender<WaitResult>,
}

#[derive(Debug)]
struct Inner {
    state: CoordinatorState,
    waiters: Vec<Waiter>,
}

impl Inner {
    /// Resolve every waiter settled by `self.state`.
    ///
    /// Once terminal, no waiter is left pending.
    fn notify(&mut self) {
        let state = self.state;
        let mut pending = Vec::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            if waiter.targets.contains(&state) {
                let _ = waiter.tx.send(Ok(state));
            } else if state == CoordinatorState::Broken {
                let _ = waiter.tx.send(Err(CoordinatorError::Broken));
            } else if state.is_terminal() {
                let _ = waiter
                    .tx
                    .send(Err(CoordinatorError::TargetUnreachable { current: state }));
            } else {
                pending.push(waiter);
            }
        }
        self.waiters = pending;
    }
}

/// Serialized transition table of one transaction coordinator.
///
/// All waiters must be resolved before the machine is dropped; reaching any
/// terminal state resolves them all.
#[derive(Debug)]
pub struct CoordinatorStateMachine {
    inner: Mutex<Inner>,
}

impl Default for CoordinatorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CoordinatorState::Init,
                waiters: Vec::new(),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> CoordinatorState {
        self.inner.lock().state
    }

    /// Apply `event` and return the new state.
    ///
    /// An invalid event moves the machine to `Broken` before the error is
    /// returned, so every later caller observes the broken state.
    pub fn on_event(&self, event: CoordinatorEvent) -> Result<CoordinatorState, CoordinatorError> {
        use CoordinatorEvent::*;
        use CoordinatorState::*;

        let mut inner = self.inner.lock();
        let from = inner.state;
        let next = match (from, event) {
            (Init, RecvVoteAbort) => Aborted,
            (Init, RecvParticipantList) => WaitingForVotes,
            (WaitingForVotes, RecvFinalVoteCommit) => WaitingForCommitAcks,
            (WaitingForVotes, RecvVoteAbort) => Aborted,
            (WaitingForCommitAcks, RecvFinalCommitAck) => Committed,
            // Re-delivery of the commit decision.
            (WaitingForCommitAcks, RecvFinalVoteCommit) => {
                tracing::debug!(event = %event, "Ignoring duplicate commit vote event");
                return Ok(WaitingForCommitAcks);
            }
            (Broken, _) => return Err(CoordinatorError::Broken),
            _ => {
                inner.state = Broken;
                inner.notify();
                tracing::error!(
                    from = %from,
                    event = %event,
                    "Invalid coordinator transition, state machine is broken"
                );
                return Err(CoordinatorError::InvalidTransition { from, event });
            }
        };

        inner.state = next;
        inner.notify();
        tracing::debug!(from = %from, to = %next, event = %event, "Coordinator transition");
        Ok(next)
    }

    /// Force the machine into `Broken` after an unrecoverable driver failure.
    ///
    /// Terminal machines are left as they are. Returns the resulting state.
    pub fn fail(&self) -> CoordinatorState {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            tracing::error!(from = %inner.state, "Coordinator failed, state machine is broken");
            inner.state = CoordinatorState::Broken;
            inner.notify();
        }
        inner.state
    }

    /// Wait until the machine reaches one of `targets`.
    ///
    /// The waiter is registered when this is called, not when the future is
    /// first polled. It resolves with the first target reached, or with an
    /// error once the machine settles where no target is reachable.
    pub fn wait_for_transition_to(
        &self,
        targets: &[CoordinatorState],
    ) -> impl Future<Output = WaitResult> + Send + 'static {
        let mut inner = self.inner.lock();
        let state = inner.state;

        let ready = if targets.contains(&state) {
            Some(Ok(state))
        } else if state == CoordinatorState::Broken {
            Some(Err(CoordinatorError::Broken))
        } else if state.is_terminal() {
            Some(Err(CoordinatorError::TargetUnreachable { current: state }))
        } else {
            None
        };

        let rx = match ready {
            Some(result) => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(result);
                rx
            }
            None => {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(Waiter {
                    targets: targets.to_vec(),
                    tx,
                });
                rx
            }
        };

        async move { rx.await.unwrap_or(Err(CoordinatorError::WaiterDropped)) }
    }

    /// Number of unresolved waiters.
    pub fn pending_waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl Drop for CoordinatorStateMachine {
    fn drop(&mut self) {
        let pending = self.inner.get_mut().waiters.len();
        if pending > 0 && !std::thread::panicking() {
            panic!(
                "coordinator state machine dropped in state {} with {} unresolved waiters",
                self.inner.get_mut().state,
                pending
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::CoordinatorEvent::*;
    use super::CoordinatorState::*;

    #[test]
    fn test_commit_path() {
        let sm = CoordinatorStateMachine::new();
        assert_eq!(sm.state(), Init);
        assert_eq!(sm.on_event(RecvParticipantList).unwrap(), WaitingForVotes);
        assert_eq!(sm.on_event(RecvFinalVoteCommit).unwrap(), WaitingForCommitAcks);
        assert_eq!(sm.on_event(RecvFinalCommitAck).unwrap(), Committed);
    }

    #[test]
    fn test_abort_paths() {
        let sm = CoordinatorStateMachine::new();
        assert_eq!(sm.on_event(RecvVoteAbort).unwrap(), Aborted);

        let sm = CoordinatorStateMachine::new();
        sm.on_event(RecvParticipantList).unwrap();
        assert_eq!(sm.on_event(RecvVoteAbort).unwrap(), Aborted);
    }

    #[test]
    fn test_abort_after_commit_decision_breaks() {
        let sm = CoordinatorStateMachine::new();
        sm.on_event(RecvParticipantList).unwrap();
        sm.on_event(RecvFinalVoteCommit).unwrap();

        let err = sm.on_event(RecvVoteAbort).unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::InvalidTransition {
                from: WaitingForCommitAcks,
                event: RecvVoteAbort
            }
        );
        assert_eq!(sm.state(), Broken);
        // Later callers see the broken state.
        assert_eq!(sm.on_event(RecvFinalCommitAck).unwrap_err(), CoordinatorError::Broken);
    }

    #[test]
    fn test_duplicate_final_commit_vote_is_idempotent() {
        let sm = CoordinatorStateMachine::new();
        sm.on_event(RecvParticipantList).unwrap();
        sm.on_event(RecvFinalVoteCommit).unwrap();
        assert_eq!(sm.on_event(RecvFinalVoteCommit).unwrap(), WaitingForCommitAcks);
        assert_eq!(sm.on_event(RecvFinalCommitAck).unwrap(), Committed);
    }

    #[test]
    fn test_terminal_states_break_on_any_event() {
        for event in [RecvParticipantList, RecvVoteAbort, RecvFinalVoteCommit, RecvFinalCommitAck] {
            let sm = CoordinatorStateMachine::new();
            sm.on_event(RecvVoteAbort).unwrap();
            assert!(sm.on_event(event).is_err());
            assert_eq!(sm.state(), Broken);
        }
    }

    #[test]
    fn test_invalid_from_init() {
        let sm = CoordinatorStateMachine::new();
        assert!(matches!(
            sm.on_event(RecvFinalCommitAck),
            Err(CoordinatorError::InvalidTransition { from: Init, .. })
        ));
        assert_eq!(sm.state(), Broken);
    }

    #[tokio::test]
    async fn test_wait_resolves_at_first_match_and_stays_fixed() {
        let sm = CoordinatorStateMachine::new();
        let outcome = sm.wait_for_transition_to(&[Committed, Aborted]);

        sm.on_event(RecvParticipantList).unwrap();
        sm.on_event(RecvFinalVoteCommit).unwrap();
        sm.on_event(RecvFinalCommitAck).unwrap();
        assert!(sm.on_event(RecvVoteAbort).is_err());
        assert_eq!(sm.state(), Broken);

        assert_eq!(outcome.await.unwrap(), Committed);
    }

    #[tokio::test]
    async fn test_independent_waiters_get_their_own_state() {
        let sm = CoordinatorStateMachine::new();
        let votes = sm.wait_for_transition_to(&[WaitingForVotes]);
        let acks = sm.wait_for_transition_to(&[WaitingForCommitAcks, Aborted]);
        let done = sm.wait_for_transition_to(&[Committed, Aborted]);
        assert_eq!(sm.pending_waiters(), 3);

        sm.on_event(RecvParticipantList).unwrap();
        assert_eq!(sm.pending_waiters(), 2);
        sm.on_event(RecvFinalVoteCommit).unwrap();
        sm.on_event(RecvFinalCommitAck).unwrap();
        assert_eq!(sm.pending_waiters(), 0);

        assert_eq!(votes.await.unwrap(), WaitingForVotes);
        assert_eq!(acks.await.unwrap(), WaitingForCommitAcks);
        assert_eq!(done.await.unwrap(), Committed);
    }

    #[tokio::test]
    async fn test_unreachable_targets_resolve_with_error() {
        let sm = CoordinatorStateMachine::new();
        let committed = sm.wait_for_transition_to(&[Committed]);
        sm.on_event(RecvVoteAbort).unwrap();
        assert_eq!(
            committed.await.unwrap_err(),
            CoordinatorError::TargetUnreachable { current: Aborted }
        );

        // Registered after settling.
        assert_eq!(
            sm.wait_for_transition_to(&[Committed]).await.unwrap_err(),
            CoordinatorError::TargetUnreachable { current: Aborted }
        );
        assert_eq!(sm.wait_for_transition_to(&[Aborted]).await.unwrap(), Aborted);
    }

    #[tokio::test]
    async fn test_broken_resolves_waiters_with_error() {
        let sm = CoordinatorStateMachine::new();
        let waiter = sm.wait_for_transition_to(&[Committed]);
        sm.on_event(RecvParticipantList).unwrap();
        assert_eq!(sm.fail(), Broken);
        assert_eq!(waiter.await.unwrap_err(), CoordinatorError::Broken);

        let broken = sm.wait_for_transition_to(&[Broken]).await;
        assert_eq!(broken.unwrap(), Broken);
    }

    #[test]
    fn test_fail_leaves_terminal_states() {
        let sm = CoordinatorStateMachine::new();
        sm.on_event(RecvVoteAbort).unwrap();
        assert_eq!(sm.fail(), Aborted);
    }

    #[tokio::test]
    async fn test_concurrent_events_serialize() {
        let sm = std::sync::Arc::new(CoordinatorStateMachine::new());
        sm.on_event(RecvParticipantList).unwrap();

        let a = {
            let sm = sm.clone();
            tokio::spawn(async move { sm.on_event(RecvFinalVoteCommit) })
        };
        let b = {
            let sm = sm.clone();
            tokio::spawn(async move { sm.on_event(RecvVoteAbort) })
        };
        let a = a.await.unwrap();
        let b = b.await.unwrap();

        // Commit first: the abort breaks the machine. Abort first: the commit
        // vote arrives in a terminal state and breaks it too.
        assert!(a.is_err() || b.is_err());
        assert_eq!(sm.state(), Broken);
    }

    #[test]
    #[should_panic(expected = "unresolved waiters")]
    fn test_drop_with_pending_waiter_panics() {
        let sm = CoordinatorStateMachine::new();
        let _waiter = sm.wait_for_transition_to(&[Committed]);
        drop(sm);
    }
}
