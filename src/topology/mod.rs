//! Topology tracking.
//!
//! ```text
//!   observation ──► stale? (same process, lower counter) ──► discard
//!        │
//!        ▼
//!   copy current description ──► TopologyStateMachine ──► publish Arc snapshot
//! ```

mod clock;
mod description;
mod state_machine;
mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use description::{
    is_stale, ServerDescription, ServerType, TopologyDescription, TopologyType, TopologyVersion,
};
pub use state_machine::{DiscoveryStateMachine, TopologyStateMachine};
pub use tracker::TopologyTracker;
