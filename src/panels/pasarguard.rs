//! Pasarguard dialect. Bearer-token REST surface close to marzban, with a
//! status vocabulary where both "active" and "limited" count as enabled,
//! and a handful of candidate subscription link endpoints that are probed
//! in order.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::marzban::expect_ok;
use super::{
    has_allowed_scheme, normalize_expire_unix, panel_url_join, truncate, PanelClient, PanelError,
    UserInfo, READ_TIMEOUT, WRITE_TIMEOUT,
};

pub struct PasarguardClient {
    http: Client,
}

impl PasarguardClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

/// Pull every allowed-scheme string out of an arbitrary JSON payload. The
/// link endpoints return different shapes across versions, so we scan
/// recursively instead of pinning one.
fn extract_links(candidate: &Value, out: &mut Vec<String>) {
    match candidate {
        Value::String(s) => {
            let val = s.trim();
            if has_allowed_scheme(val) {
                out.push(val.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                extract_links(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                extract_links(item, out);
            }
        }
        _ => {}
    }
}

fn extract_links_from_text(text: &str) -> Vec<String> {
    let lines: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|ln| has_allowed_scheme(ln))
        .map(str::to_owned)
        .collect();
    if !lines.is_empty() {
        return lines;
    }
    let stripped = text.trim();
    if stripped.is_empty() {
        return Vec::new();
    }
    let Some(decoded) = crate::collector::links::b64_decode_lenient(stripped) else {
        return Vec::new();
    };
    decoded
        .lines()
        .map(str::trim)
        .filter(|ln| has_allowed_scheme(ln))
        .map(str::to_owned)
        .collect()
}

fn user_info_from_value(obj: &Value) -> UserInfo {
    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();
    let enabled = matches!(status.as_str(), "active" | "limited");
    let key = obj
        .get("subscription_url")
        .and_then(Value::as_str)
        .and_then(|sub| sub.trim_end_matches('/').rsplit('/').next())
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

#[async_trait]
impl PanelClient for PasarguardClient {
    async fn get_user(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<UserInfo, PanelError> {
        let encoded = urlencoding::encode(remote);
        let url = panel_url_join(panel_url, &format!("api/user/{encoded}"));
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
        let key = key.trim();
        if key.is_empty() {
            return Err(PanelError::Payload("no subscription key".to_string()));
        }
        let paths = [
            format!("sub/{key}/links"),
            format!("sub/{key}/links_base64"),
            format!("sub/{key}/"),
            format!("sub/{key}/info"),
            format!("sub/{key}/apps"),
        ];
        let mut errors: Vec<String> = Vec::new();
        for path in &paths {
            let url = panel_url_join(panel_url, path);
            let resp = match self
                .http
                .get(&url)
                .header("accept", "application/json,text/plain")
                .timeout(WRITE_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    errors.push(truncate(&e.to_string(), 200));
                    continue;
                }
            };
            if resp.status() != reqwest::StatusCode::OK {
                errors.push(format!("{path} HTTP {}", resp.status().as_u16()));
                continue;
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
                    let mut links = Vec::new();
                    extract_links(&data, &mut links);
                    if !links.is_empty() {
                        return Ok(links);
                    }
                }
            }
            let links = extract_links_from_text(&body);
            if !links.is_empty() {
                return Ok(links);
            }
            errors.push(format!("{path} empty"));
        }
        Err(PanelError::Payload(errors.join("; ")))
    }

    async fn disable(&self, panel_url: &str, token: &str, remote: &str) -> Result<(), PanelError> {
        let encoded = urlencoding::encode(remote);
        let url = panel_url_join(panel_url, &format!("api/user/{encoded}"));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(token)
            .json(&json!({ "status": "disabled" }))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        expect_ok(resp).await
    }

    async fn enable(&self, panel_url: &str, token: &str, remote: &str) -> Result<(), PanelError> {
        let encoded = urlencoding::encode(remote);
        let url = panel_url_join(panel_url, &format!("api/user/{encoded}"));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(token)
            .json(&json!({ "status": "active" }))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        expect_ok(resp).await
    }

    async fn reset_usage(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<(), PanelError> {
        let encoded = urlencoding::encode(remote);
        let url = panel_url_join(panel_url, &format!("api/user/{encoded}/reset"));
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
        let encoded = urlencoding::encode(remote);
        let url = panel_url_join(panel_url, &format!("api/user/{encoded}"));
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
