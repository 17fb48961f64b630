//! Pure gating rules. Given a row and a clock these decide whether an
//! account should be serving traffic, with no I/O, so the push logic and
//! the web layer share one source of truth.

use chrono::{DateTime, Utc};

use crate::db::{Agent, LocalUser};

/// Why an account is blocked. Ordering is a priority: a manually disabled
/// subscriber stays reported as manual even when also over quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Manual,
    UsageLimit,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Active,
    Blocked(BlockReason),
}

impl GateState {
    pub fn is_blocked(&self) -> bool {
        matches!(self, GateState::Blocked(_))
    }

    pub fn reason(&self) -> Option<BlockReason> {
        match self {
            GateState::Active => None,
            GateState::Blocked(r) => Some(*r),
        }
    }
}

/// Zero limit means unlimited; an account at exactly its limit is over it.
fn over_usage(used: i64, limit: i64) -> bool {
    limit > 0 && used >= limit
}

fn expired(expire_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expire_at.is_some_and(|at| at <= now)
}

pub fn subscriber_gate(user: &LocalUser, now: DateTime<Utc>) -> GateState {
    if user.manual_disabled {
        return GateState::Blocked(BlockReason::Manual);
    }
    if over_usage(user.used_bytes, user.plan_limit_bytes) {
        return GateState::Blocked(BlockReason::UsageLimit);
    }
    if expired(user.expire_at, now) {
        return GateState::Blocked(BlockReason::Expired);
    }
    GateState::Active
}

pub fn agent_gate(agent: &Agent, now: DateTime<Utc>) -> GateState {
    if over_usage(agent.total_used_bytes, agent.plan_limit_bytes) {
        return GateState::Blocked(BlockReason::UsageLimit);
    }
    if expired(agent.expire_at, now) {
        return GateState::Blocked(BlockReason::Expired);
    }
    GateState::Active
}
