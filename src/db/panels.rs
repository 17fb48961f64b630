use std::collections::{HashMap, HashSet};

use sqlx::{PgPool, Row};

use super::models::{LinkTarget, Panel, SyncLink};
use super::scope::OwnerScope;
use crate::collector::links::canonicalize_name;

/// Panel link mappings for one subscriber, joined with the panel columns
/// needed for fetching.
pub async fn list_mapped_links(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
) -> Result<Vec<LinkTarget>, sqlx::Error> {
    sqlx::query_as::<_, LinkTarget>(
        r#"
        SELECT pl.panel_id, pl.remote_username,
               p.panel_url, p.access_token, p.panel_type,
               p.usage_multiplier, p.append_ratio_to_name
        FROM panel_links pl
        JOIN panels p ON p.id = pl.panel_id
        WHERE pl.owner_id = ANY($1) AND pl.local_username = $2
        "#,
    )
    .bind(scope.ids())
    .bind(username)
    .fetch_all(pool)
    .await
}

/// All panels in the owner scope, for the "no explicit mapping" fallback.
pub async fn list_owner_panels(
    pool: &PgPool,
    scope: &OwnerScope,
) -> Result<Vec<Panel>, sqlx::Error> {
    sqlx::query_as::<_, Panel>(
        r#"
        SELECT id, owner_id, panel_url, access_token, panel_type,
               usage_multiplier, append_ratio_to_name, template_username, sub_url
        FROM panels
        WHERE owner_id = ANY($1)
        "#,
    )
    .bind(scope.ids())
    .fetch_all(pool)
    .await
}

/// Panels explicitly assigned to an agent: the secondary fallback used by
/// agent-level cascade pushes.
pub async fn list_assigned_panels(
    pool: &PgPool,
    scope: &OwnerScope,
) -> Result<Vec<Panel>, sqlx::Error> {
    sqlx::query_as::<_, Panel>(
        r#"
        SELECT p.id, p.owner_id, p.panel_url, p.access_token, p.panel_type,
               p.usage_multiplier, p.append_ratio_to_name, p.template_username, p.sub_url
        FROM agent_panels ap
        JOIN panels p ON p.id = ap.panel_id
        WHERE ap.agent_id = ANY($1)
        "#,
    )
    .bind(scope.ids())
    .fetch_all(pool)
    .await
}

/// Every panel link in the system, with panel columns and the delta
/// baseline. The sync loop walks this once per tick, in stable order.
pub async fn list_sync_links(pool: &PgPool) -> Result<Vec<SyncLink>, sqlx::Error> {
    sqlx::query_as::<_, SyncLink>(
        r#"
        SELECT pl.id AS link_id, pl.owner_id, pl.local_username, pl.panel_id,
               pl.remote_username, pl.last_used_traffic,
               p.panel_url, p.access_token, p.panel_type, p.usage_multiplier
        FROM panel_links pl
        JOIN panels p ON p.id = pl.panel_id
        ORDER BY pl.id ASC
        "#,
    )
    .fetch_all(pool)
    .await
}

pub async fn update_link_baseline(
    pool: &PgPool,
    link_id: i64,
    new_used: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE panel_links SET last_used_traffic = $1 WHERE id = $2")
        .bind(new_used)
        .bind(link_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Zero the baseline of every link of one subscriber, after a remote usage
/// reset has been pushed.
pub async fn reset_link_baselines(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE panel_links SET last_used_traffic = 0
        WHERE owner_id = ANY($1) AND local_username = $2
        "#,
    )
    .bind(scope.ids())
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop a link whose subscriber row no longer exists.
pub async fn delete_link(pool: &PgPool, link_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM panel_links WHERE id = $1")
        .bind(link_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Per-panel disabled filters, loaded in one batch for all panels involved
/// in a collection. Names are stored canonicalized so operator-entered
/// filters stay stable when panels inject live usage counters into names.
#[derive(Debug, Default, Clone)]
pub struct DisabledFilters {
    names: HashMap<i64, HashSet<String>>,
    ordinals: HashMap<i64, HashSet<usize>>,
}

impl DisabledFilters {
    pub fn names_for(&self, panel_id: i64) -> Option<&HashSet<String>> {
        self.names.get(&panel_id)
    }

    pub fn ordinals_for(&self, panel_id: i64) -> Option<&HashSet<usize>> {
        self.ordinals.get(&panel_id)
    }

    pub fn insert_name(&mut self, panel_id: i64, name: &str) {
        self.names
            .entry(panel_id)
            .or_default()
            .insert(canonicalize_name(name));
    }

    pub fn insert_ordinal(&mut self, panel_id: i64, ordinal: usize) {
        self.ordinals.entry(panel_id).or_default().insert(ordinal);
    }
}

pub async fn load_disabled_filters(
    pool: &PgPool,
    panel_ids: &[i64],
) -> Result<DisabledFilters, sqlx::Error> {
    let mut filters = DisabledFilters::default();
    if panel_ids.is_empty() {
        return Ok(filters);
    }

    let name_rows = sqlx::query(
        "SELECT panel_id, config_name FROM panel_disabled_configs WHERE panel_id = ANY($1)",
    )
    .bind(panel_ids)
    .fetch_all(pool)
    .await?;
    for row in name_rows {
        let panel_id: i64 = row.get("panel_id");
        let name: String = row.get("config_name");
        let canonical = canonicalize_name(&name);
        if !canonical.is_empty() {
            filters.names.entry(panel_id).or_default().insert(canonical);
        }
    }

    let ordinal_rows = sqlx::query(
        "SELECT panel_id, config_index FROM panel_disabled_numbers WHERE panel_id = ANY($1)",
    )
    .bind(panel_ids)
    .fetch_all(pool)
    .await?;
    for row in ordinal_rows {
        let panel_id: i64 = row.get("panel_id");
        let ordinal: i32 = row.get("config_index");
        if ordinal > 0 {
            filters
                .ordinals
                .entry(panel_id)
                .or_default()
                .insert(ordinal as usize);
        }
    }

    Ok(filters)
}

pub async fn get_setting(
    pool: &PgPool,
    scope: &OwnerScope,
    key: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        r#"SELECT value FROM settings WHERE owner_id = ANY($1) AND key = $2 LIMIT 1"#,
    )
    .bind(scope.ids())
    .bind(key)
    .fetch_optional(pool)
    .await
}

pub async fn set_setting(
    pool: &PgPool,
    scope: &OwnerScope,
    key: &str,
    value: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO settings (owner_id, key, value)
        VALUES ($1, $2, $3)
        ON CONFLICT (owner_id, key) DO UPDATE SET value = EXCLUDED.value
        "#,
    )
    .bind(scope.canonical())
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Resolve a subscription-endpoint identity to its owner.
pub async fn get_owner_id(
    pool: &PgPool,
    username: &str,
    app_key: &str,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT owner_id FROM app_users WHERE username = $1 AND app_key = $2 LIMIT 1",
    )
    .bind(username)
    .bind(app_key)
    .fetch_optional(pool)
    .await
}
