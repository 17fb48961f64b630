//! The unified subscription endpoint. One GET serves a subscriber their
//! aggregated link list and doubles as an on-demand enforcement pass:
//! the agent gate runs first, then the subscriber gate, and only a fully
//! active account gets links back. Blocked accounts get an empty body,
//! except the usage-limit case which serves a single placeholder config
//! whose name tells the subscriber what happened.

use axum::extract::{Path, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};

use crate::collector::links::filter_dedupe;
use crate::db::{self, LocalUser, OwnerScope};
use crate::enforcement::{BlockReason, GateState};

use super::error::AppError;
use super::{placeholder, AppState};

const PLAN_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-plan-limit-bytes");
const USED_HEADER: HeaderName = HeaderName::from_static("x-used-bytes");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-remaining-bytes");
const PUSHED_HEADER: HeaderName = HeaderName::from_static("x-disabled-pushed");

/// Placeholder served instead of real links once the quota is gone. Points
/// nowhere; only its display name matters.
const LIMIT_REACHED_CONFIG: &str =
    "vless://limitreached@info.info:80?encryption=none&security=none&type=tcp&headerType=none";
const LIMIT_REACHED_MESSAGE: &str = "User {username} has reached data limit ({used} / {limit})";

/// Status headers attached to every subscription response, empty-bodied
/// ones included. A missing subscriber row reports the zero state.
fn quota_headers(user: Option<&LocalUser>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let limit = user.map_or(0, |u| u.plan_limit_bytes);
    let used = user.map_or(0, |u| u.used_bytes);
    let remaining = if limit > 0 {
        (limit - used).max(0).to_string()
    } else {
        "unlimited".to_string()
    };
    insert_num(&mut headers, PLAN_LIMIT_HEADER, &limit.to_string());
    insert_num(&mut headers, USED_HEADER, &used.to_string());
    insert_num(&mut headers, REMAINING_HEADER, &remaining);
    insert_num(
        &mut headers,
        PUSHED_HEADER,
        if user.is_some_and(|u| u.disabled_pushed) {
            "1"
        } else {
            "0"
        },
    );
    headers
}

fn empty_with_headers(user: Option<&LocalUser>) -> Response {
    (quota_headers(user), plain(String::new())).into_response()
}

fn insert_num(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

fn plain(body: String) -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn limit_reached_body(
    state: &AppState,
    scope: &OwnerScope,
    user: &LocalUser,
) -> Result<String, sqlx::Error> {
    let template = db::panels::get_setting(&state.pool, scope, "limit_message")
        .await?
        .unwrap_or_else(|| LIMIT_REACHED_MESSAGE.to_string());
    let msg = template
        .replace("{username}", &user.username)
        .replace("{used}", &crate::notifications::format_usage(user.used_bytes))
        .replace(
            "{limit}",
            &crate::notifications::format_usage(user.plan_limit_bytes),
        );
    Ok(format!(
        "{LIMIT_REACHED_CONFIG}#{}",
        urlencoding::encode(&msg)
    ))
}

/// Owner-opted status config rendered from a settings template; goes to
/// the head of the list so client apps show it first.
async fn placeholder_config(
    state: &AppState,
    scope: &OwnerScope,
    user: &LocalUser,
) -> Result<Option<String>, sqlx::Error> {
    let enabled =
        db::panels::get_setting(&state.pool, scope, placeholder::PLACEHOLDER_ENABLED_KEY)
            .await?
            .is_some_and(|v| v != "0");
    if !enabled {
        return Ok(None);
    }
    let Some(template) =
        db::panels::get_setting(&state.pool, scope, placeholder::PLACEHOLDER_TEMPLATE_KEY).await?
    else {
        return Ok(None);
    };
    let template = template.trim().to_string();
    if template.is_empty() {
        return Ok(None);
    }
    Ok(Some(placeholder::render(&template, user, chrono::Utc::now())))
}

/// Owner-configured config appended to every aggregation, so subscribers
/// keep one working entry when all panels are down. A service-specific
/// override wins over the owner-wide one.
async fn emergency_config(
    state: &AppState,
    scope: &OwnerScope,
    user: &LocalUser,
) -> Result<Option<String>, sqlx::Error> {
    if let Some(sid) = user.service_id {
        let key = format!("emergency_config_service_{sid}");
        if let Some(cfg) = db::panels::get_setting(&state.pool, scope, &key).await? {
            return Ok(Some(cfg));
        }
    }
    db::panels::get_setting(&state.pool, scope, "emergency_config").await
}

pub async fn unified_links(
    State(state): State<AppState>,
    Path((username, app_key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let Some(owner_id) = db::panels::get_owner_id(&state.pool, &username, &app_key).await? else {
        return Err(AppError::NotFound);
    };
    let scope = OwnerScope::expand(&state.admin_ids, owner_id);

    if db::users::get_local_user(&state.pool, &scope, &username)
        .await?
        .is_none()
    {
        return Ok(empty_with_headers(None));
    }

    if state.enforcer.evaluate_agent(&scope).await?.is_blocked() {
        // Reload so the headers see the flag the cascade may have set.
        let user = db::users::get_local_user(&state.pool, &scope, &username).await?;
        return Ok(empty_with_headers(user.as_ref()));
    }

    let gate = state.enforcer.evaluate_subscriber(&scope, &username).await?;
    // Reload after evaluation; the push may have flipped the flags the
    // headers report.
    let Some(user) = db::users::get_local_user(&state.pool, &scope, &username).await? else {
        return Ok(empty_with_headers(None));
    };

    match gate {
        GateState::Blocked(BlockReason::Manual) | GateState::Blocked(BlockReason::Expired) => {
            Ok(empty_with_headers(Some(&user)))
        }
        GateState::Blocked(BlockReason::UsageLimit) => {
            let body = limit_reached_body(&state, &scope, &user).await?;
            let mut headers = quota_headers(Some(&user));
            insert_num(&mut headers, REMAINING_HEADER, "0");
            insert_num(&mut headers, PUSHED_HEADER, "1");
            Ok((headers, plain(body)).into_response())
        }
        GateState::Active => {
            let collection = state.collector.collect(&scope, &username).await?;
            let mut uniq = filter_dedupe(collection.links);
            if let Some(emerg) = emergency_config(&state, &scope, &user).await? {
                uniq.push(emerg.trim().to_string());
                uniq = filter_dedupe(uniq);
            }
            if !uniq.is_empty() {
                if let Some(status) = placeholder_config(&state, &scope, &user).await? {
                    uniq.insert(0, status);
                    uniq = filter_dedupe(uniq);
                }
            }
            let body = if !uniq.is_empty() {
                format!("{}\n", uniq.join("\n"))
            } else if !collection.errors.is_empty() {
                collection
                    .errors
                    .iter()
                    .map(|e| format!("# {e}\n"))
                    .collect()
            } else {
                String::new()
            };
            let headers = quota_headers(Some(&user));
            Ok((headers, plain(body)).into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(limit: i64, used: i64, pushed: bool) -> LocalUser {
        LocalUser {
            owner_id: 1,
            username: "alice".to_string(),
            plan_limit_bytes: limit,
            used_bytes: used,
            expire_at: None,
            manual_disabled: false,
            disabled_pushed: pushed,
            disabled_pushed_at: None,
            usage_limit_notified: false,
            expire_limit_notified: false,
            service_id: None,
        }
    }

    #[test]
    fn quota_headers_report_limits_and_flag() {
        let headers = quota_headers(Some(&user(100, 40, true)));
        assert_eq!(headers.get(PLAN_LIMIT_HEADER).unwrap(), "100");
        assert_eq!(headers.get(USED_HEADER).unwrap(), "40");
        assert_eq!(headers.get(REMAINING_HEADER).unwrap(), "60");
        assert_eq!(headers.get(PUSHED_HEADER).unwrap(), "1");
    }

    #[test]
    fn unlimited_plan_reports_unlimited_remaining() {
        let headers = quota_headers(Some(&user(0, 40, false)));
        assert_eq!(headers.get(REMAINING_HEADER).unwrap(), "unlimited");
        assert_eq!(headers.get(PUSHED_HEADER).unwrap(), "0");
    }

    #[test]
    fn blocked_responses_still_carry_status_headers() {
        // Blocked branches serve an empty body but API clients must still
        // be able to read the account state from the headers.
        let resp = empty_with_headers(Some(&user(100, 120, true)));
        let headers = resp.headers();
        assert_eq!(headers.get(PLAN_LIMIT_HEADER).unwrap(), "100");
        assert_eq!(headers.get(USED_HEADER).unwrap(), "120");
        assert_eq!(headers.get(REMAINING_HEADER).unwrap(), "0");
        assert_eq!(headers.get(PUSHED_HEADER).unwrap(), "1");

        let resp = empty_with_headers(None);
        let headers = resp.headers();
        assert_eq!(headers.get(PLAN_LIMIT_HEADER).unwrap(), "0");
        assert_eq!(headers.get(REMAINING_HEADER).unwrap(), "unlimited");
        assert_eq!(headers.get(PUSHED_HEADER).unwrap(), "0");
    }
}
