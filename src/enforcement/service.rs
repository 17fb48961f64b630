//! Enforcement pushes: translate gate decisions into remote panel state.
//!
//! Every push is guarded by a `disabled_pushed` flag so repeated
//! evaluations of an unchanged account touch no panel. Pushes are
//! best-effort broadcasts: a failing target is logged and skipped, and
//! the flag flips anyway, since it exists to stop repeated broadcast
//! storms rather than to guarantee remote consistency.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{Agent, LinkTarget, LocalUser, OwnerScope, Store};
use crate::notifications::{format_usage, Notifier};
use crate::panels::PanelClients;

use super::state::{agent_gate, subscriber_gate, BlockReason, GateState};

#[derive(Debug, Error)]
pub enum EnforcementError {
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

pub struct Enforcer {
    store: Arc<dyn Store>,
    clients: Arc<PanelClients>,
    notifier: Arc<dyn Notifier>,
}

impl Enforcer {
    pub fn new(
        store: Arc<dyn Store>,
        clients: Arc<PanelClients>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            clients,
            notifier,
        }
    }

    /// Panels to push a subscriber's state onto. Explicit mappings win;
    /// a subscriber with none is pushed onto the fallback panel set
    /// (owner panels for direct evaluation, assigned panels during an
    /// agent cascade).
    async fn resolve_push_targets(
        &self,
        scope: &OwnerScope,
        username: &str,
        agent_cascade: bool,
    ) -> Result<Vec<LinkTarget>, sqlx::Error> {
        let mapped = self.store.list_mapped_links(scope, username).await?;
        if !mapped.is_empty() {
            return Ok(mapped);
        }
        let panels = if agent_cascade {
            self.store.list_assigned_panels(scope).await?
        } else {
            self.store.list_owner_panels(scope).await?
        };
        Ok(panels
            .into_iter()
            .map(|p| LinkTarget {
                panel_id: p.id,
                remote_username: username.to_string(),
                panel_url: p.panel_url,
                access_token: p.access_token,
                panel_type: p.panel_type,
                usage_multiplier: p.usage_multiplier,
                append_ratio_to_name: p.append_ratio_to_name,
            })
            .collect())
    }

    /// Broadcast a disable to every target, logging failures.
    async fn push_disable(&self, targets: &[LinkTarget]) {
        for t in targets {
            if let Err(e) = self
                .clients
                .disable_all(t.kind(), &t.panel_url, &t.access_token, &t.remote_username)
                .await
            {
                warn!(
                    remote = %t.remote_username,
                    panel = %t.panel_url,
                    error = %e,
                    "disable push failed"
                );
            }
        }
    }

    async fn push_enable(&self, targets: &[LinkTarget]) {
        for t in targets {
            if let Err(e) = self
                .clients
                .enable_all(t.kind(), &t.panel_url, &t.access_token, &t.remote_username)
                .await
            {
                warn!(
                    remote = %t.remote_username,
                    panel = %t.panel_url,
                    error = %e,
                    "enable push failed"
                );
            }
        }
    }

    /// Owners can mute limit-event messages with a setting; the one-shot
    /// notified flags are still advanced so un-muting later does not
    /// replay old crossings.
    async fn notifications_enabled(&self, scope: &OwnerScope) -> Result<bool, EnforcementError> {
        let setting =
            self.store
            .get_setting(scope, "limit_event_notifications_enabled")
                .await?;
        Ok(!matches!(setting.as_deref(), Some("0") | Some("false") | Some("off")))
    }

    async fn notify_subscriber_block(
        &self,
        scope: &OwnerScope,
        user: &LocalUser,
        reason: BlockReason,
    ) -> Result<(), EnforcementError> {
        let (already_sent, text) = match reason {
            BlockReason::UsageLimit => (
                user.usage_limit_notified,
                format!(
                    "{} reached the traffic limit ({} of {})",
                    user.username,
                    format_usage(user.used_bytes),
                    format_usage(user.plan_limit_bytes)
                ),
            ),
            BlockReason::Expired => (
                user.expire_limit_notified,
                format!("{} expired", user.username),
            ),
            BlockReason::Manual => return Ok(()),
        };
        if already_sent {
            return Ok(());
        }
        if self.notifications_enabled(scope).await? {
            if let Err(e) = self.notifier.notify(user.owner_id, &text).await {
                warn!(owner = user.owner_id, error = %e, "notification failed");
            }
        }
        match reason {
            BlockReason::UsageLimit => {
                self.store
                    .mark_usage_limit_notified(scope, &user.username)
                    .await?
            }
            BlockReason::Expired => {
                self.store
                    .mark_expire_limit_notified(scope, &user.username)
                    .await?
            }
            BlockReason::Manual => {}
        }
        Ok(())
    }

    /// Evaluate one subscriber and converge remote panel state with the
    /// verdict. Returns the gate so callers serving the subscription can
    /// shape the response without re-deriving it.
    pub async fn evaluate_subscriber(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<GateState, EnforcementError> {
        let Some(user) = self.store.get_local_user(scope, username).await? else {
            return Ok(GateState::Active);
        };
        let gate = subscriber_gate(&user, Utc::now());

        match gate {
            GateState::Blocked(reason) => {
                if !user.disabled_pushed {
                    let targets = self.resolve_push_targets(scope, username, false).await?;
                    self.push_disable(&targets).await;
                    self.store.mark_user_disabled_pushed(scope, username).await?;
                    info!(username, ?reason, "subscriber disabled on remote panels");
                }
                self.notify_subscriber_block(scope, &user, reason).await?;
            }
            GateState::Active => {
                if user.disabled_pushed {
                    let targets = self.resolve_push_targets(scope, username, false).await?;
                    self.push_enable(&targets).await;
                    self.store.clear_user_disabled_pushed(scope, username).await?;
                    info!(username, "subscriber re-enabled on remote panels");
                }
            }
        }
        Ok(gate)
    }

    /// Evaluate the owner's agent and cascade the verdict over every one
    /// of its subscribers. An exhausted agent disables all of them; a
    /// recovered agent re-enables only those whose own gates pass, and
    /// never the manually disabled ones.
    pub async fn evaluate_agent(&self, scope: &OwnerScope) -> Result<GateState, EnforcementError> {
        let Some(agent) = self.store.get_active_agent(scope).await? else {
            return Ok(GateState::Active);
        };
        let gate = agent_gate(&agent, Utc::now());

        match gate {
            GateState::Blocked(reason) => {
                if !agent.disabled_pushed {
                    self.cascade_disable(scope).await?;
                    self.store.mark_agent_disabled_pushed(scope).await?;
                    info!(owner = scope.canonical(), ?reason, "agent pool exhausted, cascade pushed");
                    self.notify_agent_block(scope, &agent, reason).await?;
                }
            }
            GateState::Active => {
                if agent.disabled_pushed {
                    self.cascade_enable(scope).await?;
                    self.store.clear_agent_disabled_pushed(scope).await?;
                    info!(owner = scope.canonical(), "agent recovered, cascade lifted");
                }
            }
        }
        Ok(gate)
    }

    async fn cascade_disable(&self, scope: &OwnerScope) -> Result<(), EnforcementError> {
        for username in self.store.list_usernames(scope).await? {
            let targets = self.resolve_push_targets(scope, &username, true).await?;
            self.push_disable(&targets).await;
            self.store.mark_user_disabled_pushed(scope, &username).await?;
        }
        Ok(())
    }

    async fn cascade_enable(&self, scope: &OwnerScope) -> Result<(), EnforcementError> {
        let now = Utc::now();
        for username in self.store.list_usernames(scope).await? {
            let Some(user) = self.store.get_local_user(scope, &username).await? else {
                continue;
            };
            // A subscriber blocked in their own right stays down; only
            // the agent-level block is being lifted here.
            if !user.disabled_pushed || subscriber_gate(&user, now).is_blocked() {
                continue;
            }
            let targets = self.resolve_push_targets(scope, &username, true).await?;
            self.push_enable(&targets).await;
            self.store.clear_user_disabled_pushed(scope, &username).await?;
        }
        Ok(())
    }

    async fn notify_agent_block(
        &self,
        scope: &OwnerScope,
        agent: &Agent,
        reason: BlockReason,
    ) -> Result<(), EnforcementError> {
        let text = match reason {
            BlockReason::UsageLimit => format!(
                "agent {} exhausted the plan ({} of {})",
                agent.name,
                format_usage(agent.total_used_bytes),
                format_usage(agent.plan_limit_bytes)
            ),
            BlockReason::Expired => format!("agent {} plan expired", agent.name),
            BlockReason::Manual => return Ok(()),
        };
        if self.notifications_enabled(scope).await? {
            if let Err(e) = self.notifier.notify(agent.owner_id, &text).await {
                warn!(owner = agent.owner_id, error = %e, "notification failed");
            }
        }
        Ok(())
    }

    /// Change a subscriber's quota locally and mirror it onto every
    /// mapped panel.
    pub async fn push_quota(
        &self,
        scope: &OwnerScope,
        username: &str,
        limit_bytes: Option<i64>,
        expire_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), EnforcementError> {
        if let Some(limit) = limit_bytes {
            self.store.set_plan_limit(scope, username, limit).await?;
        }
        if expire_at.is_some() {
            self.store.set_expire_at(scope, username, expire_at).await?;
        }
        let targets = self.resolve_push_targets(scope, username, false).await?;
        for t in targets {
            if let Err(e) = self
                .clients
                .update_quota_all(
                    t.kind(),
                    &t.panel_url,
                    &t.access_token,
                    &t.remote_username,
                    limit_bytes,
                    expire_at.map(|at| at.timestamp()),
                )
                .await
            {
                warn!(
                    remote = %t.remote_username,
                    panel = %t.panel_url,
                    error = %e,
                    "quota push failed"
                );
            }
        }
        // A raised limit or extended expiry may lift the block right away.
        self.evaluate_subscriber(scope, username).await?;
        Ok(())
    }

    /// Zero a subscriber's usage locally, on every mapped panel, and in
    /// the delta baselines so the next sync tick does not re-count old
    /// remote traffic.
    pub async fn push_usage_reset(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), EnforcementError> {
        self.store.reset_used_bytes(scope, username).await?;
        let targets = self.resolve_push_targets(scope, username, false).await?;
        for t in targets {
            if let Err(e) = self
                .clients
                .reset_usage_all(t.kind(), &t.panel_url, &t.access_token, &t.remote_username)
                .await
            {
                warn!(
                    remote = %t.remote_username,
                    panel = %t.panel_url,
                    error = %e,
                    "usage reset push failed"
                );
            }
        }
        self.store.reset_link_baselines(scope, username).await?;
        self.evaluate_subscriber(scope, username).await?;
        Ok(())
    }
}
