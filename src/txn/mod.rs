//! Two-phase commit coordination for cross-shard transactions.
//!
//! [`ParticipantList`] is the append-only vote ledger, [`CoordinatorStateMachine`]
//! the serialized transition table, and [`TransactionCoordinator`] drives both
//! against a [`ParticipantExecutor`] and a [`CoordinatorStore`].

mod coordinator;
mod executor;
mod participant_list;
mod state_machine;
mod store;

pub use coordinator::TransactionCoordinator;
pub use executor::{ParticipantExecutor, PrepareResponse};
pub use participant_list::{CommitDecision, ParticipantList, Vote};
pub use state_machine::{CoordinatorEvent, CoordinatorState, CoordinatorStateMachine};
pub use store::{CoordinatorDocument, CoordinatorStore, InMemoryCoordinatorStore};
