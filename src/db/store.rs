//! Persistence seam for the collector and enforcement services.
//!
//! The services talk to storage through this trait rather than holding a
//! pool directly, so their broadcast and cascade behavior can be exercised
//! against an in-memory double. [`PgStore`] is the production
//! implementation and delegates to the query modules in this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::panels::DisabledFilters;
use super::scope::OwnerScope;
use super::{agents, panels, users};
use super::{Agent, LinkTarget, LocalUser, Panel, SyncLink};

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_local_user(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<Option<LocalUser>, sqlx::Error>;

    async fn list_usernames(&self, scope: &OwnerScope) -> Result<Vec<String>, sqlx::Error>;

    async fn add_used_bytes(
        &self,
        owner_id: i64,
        username: &str,
        delta: i64,
    ) -> Result<(), sqlx::Error>;

    async fn mark_user_disabled_pushed(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error>;

    async fn clear_user_disabled_pushed(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error>;

    async fn mark_usage_limit_notified(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error>;

    async fn mark_expire_limit_notified(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error>;

    async fn set_plan_limit(
        &self,
        scope: &OwnerScope,
        username: &str,
        limit_bytes: i64,
    ) -> Result<(), sqlx::Error>;

    async fn set_expire_at(
        &self,
        scope: &OwnerScope,
        username: &str,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error>;

    async fn reset_used_bytes(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error>;

    async fn get_active_agent(&self, scope: &OwnerScope) -> Result<Option<Agent>, sqlx::Error>;

    async fn add_agent_used_bytes(&self, owner_id: i64, delta: i64) -> Result<(), sqlx::Error>;

    async fn mark_agent_disabled_pushed(&self, scope: &OwnerScope) -> Result<(), sqlx::Error>;

    async fn clear_agent_disabled_pushed(&self, scope: &OwnerScope) -> Result<(), sqlx::Error>;

    async fn list_mapped_links(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<Vec<LinkTarget>, sqlx::Error>;

    async fn list_owner_panels(&self, scope: &OwnerScope) -> Result<Vec<Panel>, sqlx::Error>;

    async fn list_assigned_panels(&self, scope: &OwnerScope) -> Result<Vec<Panel>, sqlx::Error>;

    async fn list_sync_links(&self) -> Result<Vec<SyncLink>, sqlx::Error>;

    async fn update_link_baseline(&self, link_id: i64, reading: i64) -> Result<(), sqlx::Error>;

    async fn reset_link_baselines(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error>;

    async fn delete_link(&self, link_id: i64) -> Result<(), sqlx::Error>;

    async fn load_disabled_filters(
        &self,
        panel_ids: &[i64],
    ) -> Result<DisabledFilters, sqlx::Error>;

    async fn get_setting(
        &self,
        scope: &OwnerScope,
        key: &str,
    ) -> Result<Option<String>, sqlx::Error>;
}

/// PostgreSQL-backed [`Store`].
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_local_user(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<Option<LocalUser>, sqlx::Error> {
        users::get_local_user(&self.pool, scope, username).await
    }

    async fn list_usernames(&self, scope: &OwnerScope) -> Result<Vec<String>, sqlx::Error> {
        users::list_usernames(&self.pool, scope).await
    }

    async fn add_used_bytes(
        &self,
        owner_id: i64,
        username: &str,
        delta: i64,
    ) -> Result<(), sqlx::Error> {
        users::add_used_bytes(&self.pool, owner_id, username, delta).await
    }

    async fn mark_user_disabled_pushed(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        users::mark_disabled_pushed(&self.pool, scope, username).await
    }

    async fn clear_user_disabled_pushed(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        users::clear_disabled_pushed(&self.pool, scope, username).await
    }

    async fn mark_usage_limit_notified(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        users::mark_usage_limit_notified(&self.pool, scope, username).await
    }

    async fn mark_expire_limit_notified(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        users::mark_expire_limit_notified(&self.pool, scope, username).await
    }

    async fn set_plan_limit(
        &self,
        scope: &OwnerScope,
        username: &str,
        limit_bytes: i64,
    ) -> Result<(), sqlx::Error> {
        users::set_plan_limit(&self.pool, scope, username, limit_bytes).await
    }

    async fn set_expire_at(
        &self,
        scope: &OwnerScope,
        username: &str,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error> {
        users::set_expire_at(&self.pool, scope, username, expire_at).await
    }

    async fn reset_used_bytes(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        users::reset_used_bytes(&self.pool, scope, username).await
    }

    async fn get_active_agent(&self, scope: &OwnerScope) -> Result<Option<Agent>, sqlx::Error> {
        agents::get_active_agent(&self.pool, scope).await
    }

    async fn add_agent_used_bytes(&self, owner_id: i64, delta: i64) -> Result<(), sqlx::Error> {
        agents::add_total_used_bytes(&self.pool, owner_id, delta).await
    }

    async fn mark_agent_disabled_pushed(&self, scope: &OwnerScope) -> Result<(), sqlx::Error> {
        agents::mark_disabled_pushed(&self.pool, scope).await
    }

    async fn clear_agent_disabled_pushed(&self, scope: &OwnerScope) -> Result<(), sqlx::Error> {
        agents::clear_disabled_pushed(&self.pool, scope).await
    }

    async fn list_mapped_links(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<Vec<LinkTarget>, sqlx::Error> {
        panels::list_mapped_links(&self.pool, scope, username).await
    }

    async fn list_owner_panels(&self, scope: &OwnerScope) -> Result<Vec<Panel>, sqlx::Error> {
        panels::list_owner_panels(&self.pool, scope).await
    }

    async fn list_assigned_panels(&self, scope: &OwnerScope) -> Result<Vec<Panel>, sqlx::Error> {
        panels::list_assigned_panels(&self.pool, scope).await
    }

    async fn list_sync_links(&self) -> Result<Vec<SyncLink>, sqlx::Error> {
        panels::list_sync_links(&self.pool).await
    }

    async fn update_link_baseline(&self, link_id: i64, reading: i64) -> Result<(), sqlx::Error> {
        panels::update_link_baseline(&self.pool, link_id, reading).await
    }

    async fn reset_link_baselines(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        panels::reset_link_baselines(&self.pool, scope, username).await
    }

    async fn delete_link(&self, link_id: i64) -> Result<(), sqlx::Error> {
        panels::delete_link(&self.pool, link_id).await
    }

    async fn load_disabled_filters(
        &self,
        panel_ids: &[i64],
    ) -> Result<DisabledFilters, sqlx::Error> {
        panels::load_disabled_filters(&self.pool, panel_ids).await
    }

    async fn get_setting(
        &self,
        scope: &OwnerScope,
        key: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        panels::get_setting(&self.pool, scope, key).await
    }
}
