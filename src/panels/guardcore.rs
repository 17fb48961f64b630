//! Guardcore dialect. Subscriptions instead of users, bulk verb endpoints
//! taking a usernames array, and an `access_key`/`link` field that doubles
//! as the subscription URL.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::marzban::expect_ok;
use super::{
    has_allowed_scheme, normalize_expire_unix, panel_url_join, PanelClient, PanelError, UserInfo,
    READ_TIMEOUT, WRITE_TIMEOUT,
};

pub struct GuardcoreClient {
    http: Client,
}

impl GuardcoreClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    async fn bulk_verb(
        &self,
        panel_url: &str,
        token: &str,
        verb: &str,
        remote: &str,
    ) -> Result<(), PanelError> {
        let url = panel_url_join(panel_url, &format!("api/subscriptions/{verb}"));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "usernames": [remote] }))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        expect_ok(resp).await
    }
}

fn user_info_from_value(obj: &Value) -> UserInfo {
    // Usage comes under one of several names depending on panel version.
    let used_traffic = ["used_traffic", "total_usage", "current_usage"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_i64))
        .unwrap_or(0)
        .max(0);
    let key = obj
        .get("link")
        .or_else(|| obj.get("access_key"))
        .or_else(|| obj.get("subscription_url"))
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .map(str::to_owned);
    UserInfo {
        used_traffic,
        enabled: obj.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        key,
        expire_unix: obj
            .get("limit_expire")
            .or_else(|| obj.get("expire"))
            .and_then(Value::as_f64)
            .filter(|v| *v > 0.0)
            .and_then(normalize_expire_unix),
    }
}

/// The key may be an absolute subscription URL or a path relative to the
/// panel. Anything else is unusable.
fn resolve_sub_url(panel_url: &str, key: &str) -> Option<String> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    if key.starts_with("http://") || key.starts_with("https://") {
        return Some(key.to_string());
    }
    if let Some(path) = key.strip_prefix('/') {
        return Some(panel_url_join(panel_url, path));
    }
    None
}

#[async_trait]
impl PanelClient for GuardcoreClient {
    async fn get_user(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<UserInfo, PanelError> {
        let encoded = urlencoding::encode(remote);
        let url = panel_url_join(panel_url, &format!("api/subscriptions/{encoded}"));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .timeout(READ_TIMEOUT)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PanelError::status(status, &body));
        }
        let obj: Value = resp.json().await?;
        Ok(user_info_from_value(&obj))
    }

    async fn fetch_links(
        &self,
        panel_url: &str,
        _token: &str,
        _remote: &str,
        key: &str,
    ) -> Result<Vec<String>, PanelError> {
        let sub_url = resolve_sub_url(panel_url, key)
            .ok_or_else(|| PanelError::Payload("no usable subscription link".to_string()))?;
        let resp = self
            .http
            .get(&sub_url)
            .header("accept", "text/plain,application/json")
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PanelError::status(status, &body));
        }
        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);
        let body = resp.text().await.unwrap_or_default();
        if is_json {
            if let Ok(data) = serde_json::from_str::<Value>(&body) {
                let items = match &data {
                    Value::Array(items) => Some(items),
                    Value::Object(map) => map.get("links").and_then(Value::as_array),
                    _ => None,
                };
                if let Some(items) = items {
                    let links: Vec<String> = items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect();
                    if !links.is_empty() {
                        return Ok(links);
                    }
                }
            }
        }
        let links: Vec<String> = body
            .lines()
            .map(str::trim)
            .filter(|ln| has_allowed_scheme(ln))
            .map(str::to_owned)
            .collect();
        if !links.is_empty() {
            return Ok(links);
        }
        if let Some(decoded) = crate::collector::links::b64_decode_lenient(body.trim()) {
            let links: Vec<String> = decoded
                .lines()
                .map(str::trim)
                .filter(|ln| has_allowed_scheme(ln))
                .map(str::to_owned)
                .collect();
            if !links.is_empty() {
                return Ok(links);
            }
        }
        Err(PanelError::Payload("subscription body had no links".to_string()))
    }

    async fn disable(&self, panel_url: &str, token: &str, remote: &str) -> Result<(), PanelError> {
        self.bulk_verb(panel_url, token, "disable", remote).await
    }

    async fn enable(&self, panel_url: &str, token: &str, remote: &str) -> Result<(), PanelError> {
        self.bulk_verb(panel_url, token, "enable", remote).await
    }

    async fn reset_usage(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<(), PanelError> {
        self.bulk_verb(panel_url, token, "reset", remote).await
    }

    async fn update_quota(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
        limit_bytes: Option<i64>,
        expire_unix: Option<i64>,
    ) -> Result<(), PanelError> {
        let mut payload = serde_json::Map::new();
        if let Some(limit) = limit_bytes {
            payload.insert("limit_usage".to_string(), json!(limit.max(0)));
        }
        if let Some(expire) = expire_unix {
            // Validated as a future unix timestamp on the panel side.
            let now = chrono::Utc::now().timestamp();
            payload.insert("limit_expire".to_string(), json!(expire.max(now + 1)));
        }
        if payload.is_empty() {
            return Ok(());
        }
        let encoded = urlencoding::encode(remote);
        let url = panel_url_join(panel_url, &format!("api/subscriptions/{encoded}"));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(token)
            .json(&Value::Object(payload))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        expect_ok(resp).await
    }
}
