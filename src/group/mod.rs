//! Consumer group membership.
//!
//! - [`GroupCoordinator`]: join/sync/heartbeat/leave against the group's
//!   coordinator broker, plus offset commit and fetch
//! - [`MemberState`] / [`Membership`]: the member's state machine
//! - [`assignor`]: range, round-robin and sticky partition assignors, run
//!   by whichever member the coordinator elects leader

pub mod assignor;
mod coordinator;
mod state;

pub use assignor::{
    AssignmentInput, AssignmentOutput, PartitionAssignor, create_assignor, select_common_protocol,
};
pub use coordinator::GroupCoordinator;
pub use state::{MemberState, Membership};
