//! Marzban dialect. Authentication is a bearer token; user objects carry a
//! `status` string and a `subscription_url` whose last path segment is the
//! subscription key. Newer deployments serve `/sub/{key}/v2ray` as a base64
//! blob of newline-separated configs; older ones serve plain text at
//! `/sub/{key}/`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    has_allowed_scheme, panel_url_join, normalize_expire_unix, truncate, PanelClient, PanelError,
    UserInfo, READ_TIMEOUT, WRITE_TIMEOUT,
};

pub struct MarzbanClient {
    http: Client,
}

impl MarzbanClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

/// Normalize a Marzban user payload.
pub(crate) fn user_info_from_value(obj: &Value) -> UserInfo {
    let enabled = obj
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s != "disabled")
        .unwrap_or(true);
    let key = obj
        .get("subscription_url")
        .and_then(Value::as_str)
        .and_then(|u| u.trim_end_matches('/').rsplit('/').next())
        .filter(|k| !k.is_empty())
        .map(str::to_owned);
    UserInfo {
        used_traffic: obj.get("used_traffic").and_then(Value::as_i64).unwrap_or(0),
        enabled,
        key,
        expire_unix: obj
            .get("expire")
            .and_then(Value::as_f64)
            .and_then(normalize_expire_unix),
    }
}

/// Parse a subscription body: JSON list, `{"links": [...]}` object, base64
/// blob, or plain newline-separated text; only recognized schemes survive.
pub(crate) fn links_from_body(content_type: &str, body: &str) -> Vec<String> {
    if content_type.starts_with("application/json") {
        if let Ok(data) = serde_json::from_str::<Value>(body) {
            if let Some(arr) = data.as_array() {
                return arr
                    .iter()
                    .map(|x| match x.as_str() {
                        Some(s) => s.to_string(),
                        None => x.to_string(),
                    })
                    .collect();
            }
            if let Some(arr) = data.get("links").and_then(Value::as_array) {
                return arr
                    .iter()
                    .map(|x| match x.as_str() {
                        Some(s) => s.to_string(),
                        None => x.to_string(),
                    })
                    .collect();
            }
        }
    }

    let mut text = body.to_string();
    // Subscription bodies are frequently base64, often without padding.
    if let Some(decoded) = crate::collector::links::b64_decode_lenient(body) {
        if decoded.lines().any(|l| has_allowed_scheme(l.trim())) {
            text = decoded;
        }
    }

    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && has_allowed_scheme(l))
        .map(str::to_owned)
        .collect()
}

#[async_trait]
impl PanelClient for MarzbanClient {
    async fn get_user(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<UserInfo, PanelError> {
        let url = panel_url_join(panel_url, &format!("api/user/{remote}"));
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
        let mut errors: Vec<String> = Vec::new();

        let url = panel_url_join(panel_url, &format!("sub/{key}/v2ray"));
        match self
            .http
            .get(&url)
            .header("accept", "text/plain")
            .timeout(WRITE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                let body = resp.text().await.unwrap_or_default();
                let links = links_from_body("text/plain", &body);
                if !links.is_empty() {
                    return Ok(links);
                }
                errors.push("v2ray empty".to_string());
            }
            Ok(resp) => errors.push(format!("v2ray HTTP {}", resp.status().as_u16())),
            Err(e) => errors.push(truncate(&e.to_string(), 200)),
        }

        // Legacy plain-text endpoint.
        let url = panel_url_join(panel_url, &format!("sub/{key}/"));
        let resp = self
            .http
            .get(&url)
            .header("accept", "application/json,text/plain")
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            errors.push(format!("sub HTTP {}", resp.status().as_u16()));
            return Err(PanelError::Payload(errors.join("; ")));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = resp.text().await.unwrap_or_default();
        let links = links_from_body(&content_type, &body);
        if links.is_empty() {
            errors.push("sub empty".to_string());
            return Err(PanelError::Payload(errors.join("; ")));
        }
        Ok(links)
    }

    async fn disable(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<(), PanelError> {
        self.set_status(panel_url, token, remote, "disabled").await
    }

    async fn enable(&self, panel_url: &str, token: &str, remote: &str) -> Result<(), PanelError> {
        self.set_status(panel_url, token, remote, "active").await
    }

    async fn reset_usage(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<(), PanelError> {
        let url = panel_url_join(panel_url, &format!("api/user/{remote}/reset"));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        expect_ok(resp).await
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
            payload.insert("data_limit".to_string(), json!(limit));
            payload.insert("data_limit_reset_strategy".to_string(), json!("no_reset"));
        }
        if let Some(expire) = expire_unix {
            payload.insert("expire".to_string(), json!(expire));
        }
        if payload.is_empty() {
            return Ok(());
        }
        let url = panel_url_join(panel_url, &format!("api/user/{remote}"));
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

impl MarzbanClient {
    async fn set_status(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
        status: &str,
    ) -> Result<(), PanelError> {
        let url = panel_url_join(panel_url, &format!("api/user/{remote}"));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(token)
            .json(&json!({ "status": status }))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        expect_ok(resp).await
    }
}

pub(crate) async fn expect_ok(resp: reqwest::Response) -> Result<(), PanelError> {
    if resp.status() == reqwest::StatusCode::OK {
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(PanelError::status(status, &body))
    }
}
