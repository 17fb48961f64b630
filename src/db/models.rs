use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::panels::PanelKind;

/// A third-party VPN panel backend.
/// Corresponds to the `panels` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Panel {
    pub id: i64,
    pub owner_id: i64,
    pub panel_url: String,
    pub access_token: String,
    pub panel_type: String,
    /// Weighting applied to raw remote usage deltas before accumulation.
    pub usage_multiplier: f64,
    pub append_ratio_to_name: bool,
    /// Remote identity whose proxy settings seed newly provisioned users.
    pub template_username: Option<String>,
    /// Subscription URL configured for name-based filtering, if any.
    pub sub_url: Option<String>,
}

impl Panel {
    pub fn kind(&self) -> PanelKind {
        PanelKind::parse(&self.panel_type)
    }
}

/// A reseller tenant.
/// Corresponds to the `agents` table; `owner_id` is the external tenant ID.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub owner_id: i64,
    pub name: String,
    /// 0 means unlimited.
    pub plan_limit_bytes: i64,
    /// Monotonic accumulator, clamped at i64::MAX.
    pub total_used_bytes: i64,
    pub expire_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub disabled_pushed: bool,
    pub disabled_pushed_at: Option<DateTime<Utc>>,
    pub user_limit: i64,
    pub max_user_bytes: i64,
}

/// An end customer entitled to aggregated configs under one owner.
/// Corresponds to the `local_users` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LocalUser {
    pub owner_id: i64,
    pub username: String,
    pub plan_limit_bytes: i64,
    pub used_bytes: i64,
    pub expire_at: Option<DateTime<Utc>>,
    /// Operator override. Once set, quota logic must never re-enable the user.
    pub manual_disabled: bool,
    /// "The disable decision has already been broadcast to remote panels."
    pub disabled_pushed: bool,
    pub disabled_pushed_at: Option<DateTime<Utc>>,
    pub usage_limit_notified: bool,
    pub expire_limit_notified: bool,
    pub service_id: Option<i64>,
}

/// A (subscriber, panel) mapping joined with the panel columns the
/// collector and enforcement paths need.
#[derive(Debug, Clone, FromRow)]
pub struct LinkTarget {
    pub panel_id: i64,
    /// May encode several comma-joined identities for the sanaei vendor.
    pub remote_username: String,
    pub panel_url: String,
    pub access_token: String,
    pub panel_type: String,
    pub usage_multiplier: f64,
    pub append_ratio_to_name: bool,
}

impl LinkTarget {
    pub fn kind(&self) -> PanelKind {
        PanelKind::parse(&self.panel_type)
    }
}

/// One row of the usage sync enumeration: a panel link plus its delta
/// baseline and owning subscriber.
#[derive(Debug, Clone, FromRow)]
pub struct SyncLink {
    pub link_id: i64,
    pub owner_id: i64,
    pub local_username: String,
    pub panel_id: i64,
    pub remote_username: String,
    /// Last-observed cumulative remote counter.
    pub last_used_traffic: i64,
    pub panel_url: String,
    pub access_token: String,
    pub panel_type: String,
    pub usage_multiplier: f64,
}

impl SyncLink {
    pub fn kind(&self) -> PanelKind {
        PanelKind::parse(&self.panel_type)
    }
}
