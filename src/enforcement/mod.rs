//! Quota and expiry enforcement: pure gate decisions, the push service
//! converging remote panel state with them, and the periodic usage sync
//! that feeds the accumulators they gate on.

pub mod service;
pub mod state;
pub mod sync;

pub use service::{EnforcementError, Enforcer};
pub use state::{agent_gate, subscriber_gate, BlockReason, GateState};
pub use sync::UsageSync;
