use sqlx::PgPool;

use super::models::Agent;
use super::scope::OwnerScope;

pub async fn get_active_agent(
    pool: &PgPool,
    scope: &OwnerScope,
) -> Result<Option<Agent>, sqlx::Error> {
    sqlx::query_as::<_, Agent>(
        r#"
        SELECT owner_id, name, plan_limit_bytes, total_used_bytes, expire_at,
               active, disabled_pushed, disabled_pushed_at, user_limit, max_user_bytes
        FROM agents
        WHERE owner_id = ANY($1) AND active = TRUE
        LIMIT 1
        "#,
    )
    .bind(scope.ids())
    .fetch_optional(pool)
    .await
}

/// Add usage to the agent accumulator; see `users::add_used_bytes` for the
/// atomicity contract.
pub async fn add_total_used_bytes(
    pool: &PgPool,
    owner_id: i64,
    delta: i64,
) -> Result<(), sqlx::Error> {
    if delta <= 0 {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE agents
        SET total_used_bytes = LEAST(total_used_bytes + $1, 9223372036854775807)
        WHERE owner_id = $2
        "#,
    )
    .bind(delta)
    .bind(owner_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_disabled_pushed(pool: &PgPool, scope: &OwnerScope) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE agents
        SET disabled_pushed = TRUE, disabled_pushed_at = NOW()
        WHERE owner_id = ANY($1)
        "#,
    )
    .bind(scope.ids())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_disabled_pushed(pool: &PgPool, scope: &OwnerScope) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE agents
        SET disabled_pushed = FALSE, disabled_pushed_at = NULL
        WHERE owner_id = ANY($1)
        "#,
    )
    .bind(scope.ids())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_plan_limit(
    pool: &PgPool,
    scope: &OwnerScope,
    limit_bytes: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE agents SET plan_limit_bytes = $1 WHERE owner_id = ANY($2)")
        .bind(limit_bytes)
        .bind(scope.ids())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_user_limit(
    pool: &PgPool,
    scope: &OwnerScope,
    max_users: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE agents SET user_limit = $1 WHERE owner_id = ANY($2)")
        .bind(max_users)
        .bind(scope.ids())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_max_user_bytes(
    pool: &PgPool,
    scope: &OwnerScope,
    max_bytes: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE agents SET max_user_bytes = $1 WHERE owner_id = ANY($2)")
        .bind(max_bytes)
        .bind(scope.ids())
        .execute(pool)
        .await?;
    Ok(())
}

/// Extend an agent's expiry by whole days. An agent without an expiry
/// starts counting from now.
pub async fn renew_days(pool: &PgPool, scope: &OwnerScope, days: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE agents
        SET expire_at = COALESCE(expire_at, NOW()) + make_interval(days => $1::int)
        WHERE owner_id = ANY($2)
        "#,
    )
    .bind(days)
    .bind(scope.ids())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_active(
    pool: &PgPool,
    scope: &OwnerScope,
    active: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE agents SET active = $1 WHERE owner_id = ANY($2)")
        .bind(active)
        .bind(scope.ids())
        .execute(pool)
        .await?;
    Ok(())
}
