use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::LocalUser;
use super::scope::OwnerScope;

pub async fn get_local_user(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
) -> Result<Option<LocalUser>, sqlx::Error> {
    sqlx::query_as::<_, LocalUser>(
        r#"
        SELECT owner_id, username, plan_limit_bytes, used_bytes, expire_at,
               manual_disabled, disabled_pushed, disabled_pushed_at,
               usage_limit_notified, expire_limit_notified, service_id
        FROM local_users
        WHERE owner_id = ANY($1) AND username = $2
        LIMIT 1
        "#,
    )
    .bind(scope.ids())
    .bind(username)
    .fetch_optional(pool)
    .await
}

pub async fn list_usernames(
    pool: &PgPool,
    scope: &OwnerScope,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT username FROM local_users WHERE owner_id = ANY($1) ORDER BY username",
    )
    .bind(scope.ids())
    .fetch_all(pool)
    .await
}

/// Add usage to a subscriber's accumulator. The UPDATE is a single
/// arithmetic statement so concurrent ticks and on-demand evaluations
/// compose without application-level locks; LEAST saturates at the
/// BIGINT bound instead of wrapping.
pub async fn add_used_bytes(
    pool: &PgPool,
    owner_id: i64,
    username: &str,
    delta: i64,
) -> Result<(), sqlx::Error> {
    if delta <= 0 {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE local_users
        SET used_bytes = LEAST(used_bytes + $1, 9223372036854775807)
        WHERE owner_id = $2 AND username = $3
        "#,
    )
    .bind(delta)
    .bind(owner_id)
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_disabled_pushed(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE local_users
        SET disabled_pushed = TRUE, disabled_pushed_at = NOW()
        WHERE owner_id = ANY($1) AND username = $2
        "#,
    )
    .bind(scope.ids())
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_disabled_pushed(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE local_users
        SET disabled_pushed = FALSE, disabled_pushed_at = NULL
        WHERE owner_id = ANY($1) AND username = $2
        "#,
    )
    .bind(scope.ids())
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_usage_limit_notified(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE local_users
        SET usage_limit_notified = TRUE
        WHERE owner_id = ANY($1) AND username = $2
        "#,
    )
    .bind(scope.ids())
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_expire_limit_notified(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE local_users
        SET expire_limit_notified = TRUE
        WHERE owner_id = ANY($1) AND username = $2
        "#,
    )
    .bind(scope.ids())
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}

/// Set a subscriber's byte limit. Clears the one-shot usage notification
/// flag so the next crossing notifies again.
pub async fn set_plan_limit(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
    limit_bytes: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE local_users
        SET plan_limit_bytes = $1, usage_limit_notified = FALSE
        WHERE owner_id = ANY($2) AND username = $3
        "#,
    )
    .bind(limit_bytes)
    .bind(scope.ids())
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}

/// Set a subscriber's expiry. Clears the one-shot expiry notification flag.
pub async fn set_expire_at(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
    expire_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE local_users
        SET expire_at = $1, expire_limit_notified = FALSE
        WHERE owner_id = ANY($2) AND username = $3
        "#,
    )
    .bind(expire_at)
    .bind(scope.ids())
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_manual_disabled(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
    disabled: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE local_users
        SET manual_disabled = $1
        WHERE owner_id = ANY($2) AND username = $3
        "#,
    )
    .bind(disabled)
    .bind(scope.ids())
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}

/// Zero a subscriber's accumulator, clearing the usage notified flag with it.
pub async fn reset_used_bytes(
    pool: &PgPool,
    scope: &OwnerScope,
    username: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE local_users
        SET used_bytes = 0, usage_limit_notified = FALSE
        WHERE owner_id = ANY($1) AND username = $2
        "#,
    )
    .bind(scope.ids())
    .bind(username)
    .execute(pool)
    .await?;
    Ok(())
}
