//! Marzneshin dialect, plus fallback to the older marzban wire shape.
//!
//! The two panels are one vendor family with diverging REST surfaces:
//! marzneshin serves `api/users/{name}` and `sub/{name}/{key}/links`, the
//! older shape serves `api/user/{name}` and `sub/{key}/v2ray`. Every call
//! here tries the newer surface first and falls back, so a panel of either
//! vintage works behind one client. Unknown panel types also dispatch here.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::marzban::{self, expect_ok, links_from_body};
use super::{
    panel_url_join, normalize_expire_unix, truncate, username_candidates, PanelClient, PanelError,
    UserInfo, READ_TIMEOUT, WRITE_TIMEOUT,
};

pub struct MarzneshinClient {
    http: Client,
}

impl MarzneshinClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

fn user_info_from_value(obj: &Value) -> UserInfo {
    UserInfo {
        used_traffic: obj.get("used_traffic").and_then(Value::as_i64).unwrap_or(0),
        enabled: obj.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        key: obj
            .get("key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .map(str::to_owned),
        expire_unix: obj
            .get("expire")
            .or_else(|| obj.get("expire_date"))
            .and_then(Value::as_f64)
            .and_then(normalize_expire_unix),
    }
}

#[async_trait]
impl PanelClient for MarzneshinClient {
    async fn get_user(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<UserInfo, PanelError> {
        let mut last_err: Option<PanelError> = None;

        for candidate in username_candidates(remote) {
            let url = panel_url_join(panel_url, &format!("api/users/{candidate}"));
            match self
                .http
                .get(&url)
                .bearer_auth(token)
                .timeout(READ_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    let obj: Value = resp.json().await?;
                    return Ok(user_info_from_value(&obj));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    last_err = Some(PanelError::status(status, &body));
                }
                Err(e) => last_err = Some(e.into()),
            }
        }

        // Older shape.
        for candidate in username_candidates(remote) {
            let url = panel_url_join(panel_url, &format!("api/user/{candidate}"));
            match self
                .http
                .get(&url)
                .bearer_auth(token)
                .timeout(READ_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    let obj: Value = resp.json().await?;
                    return Ok(marzban::user_info_from_value(&obj));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    last_err = Some(PanelError::status(status, &body));
                }
                Err(e) => last_err = Some(e.into()),
            }
        }

        Err(last_err.unwrap_or(PanelError::NotFound))
    }

    async fn fetch_links(
        &self,
        panel_url: &str,
        _token: &str,
        remote: &str,
        key: &str,
    ) -> Result<Vec<String>, PanelError> {
        let mut errors: Vec<String> = Vec::new();

        // Base64 blob endpoint of the older shape first; when it exists it
        // is the cheapest complete answer.
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

        for candidate in username_candidates(remote) {
            let url = panel_url_join(panel_url, &format!("sub/{candidate}/{key}/links"));
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
                    errors.push(format!("{} ({candidate})", truncate(&e.to_string(), 200)));
                    continue;
                }
            };
            if resp.status() != reqwest::StatusCode::OK {
                errors.push(format!("links HTTP {} ({candidate})", resp.status().as_u16()));
                continue;
            }
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = resp.text().await.unwrap_or_default();
            let links = links_from_body(&content_type, &body);
            if !links.is_empty() {
                return Ok(links);
            }
            errors.push(format!("links empty ({candidate})"));
        }

        Err(PanelError::Payload(errors.join("; ")))
    }

    async fn disable(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<(), PanelError> {
        let url = panel_url_join(panel_url, &format!("api/users/{remote}/disable"));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::OK {
            return Ok(());
        }
        // Older shape uses a status field instead of a verb endpoint.
        let url = panel_url_join(panel_url, &format!("api/user/{remote}"));
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
        let url = panel_url_join(panel_url, &format!("api/users/{remote}/enable"));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::OK {
            return Ok(());
        }
        let url = panel_url_join(panel_url, &format!("api/user/{remote}"));
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
        let url = panel_url_join(panel_url, &format!("api/users/{remote}/reset"));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::OK {
            return Ok(());
        }
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
        if limit_bytes.is_none() && expire_unix.is_none() {
            return Ok(());
        }

        let mut payload = serde_json::Map::new();
        payload.insert("username".to_string(), json!(remote));
        if let Some(limit) = limit_bytes {
            payload.insert("data_limit".to_string(), json!(limit));
            payload.insert("data_limit_reset_strategy".to_string(), json!("no_reset"));
        }
        if let Some(expire) = expire_unix {
            let date = chrono::DateTime::from_timestamp(expire, 0)
                .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
            if let Some(date) = date {
                payload.insert("expire_strategy".to_string(), json!("fixed_date"));
                payload.insert("expire_date".to_string(), json!(date));
            }
        }
        let url = panel_url_join(panel_url, &format!("api/users/{remote}"));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(token)
            .json(&Value::Object(payload))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::OK {
            return Ok(());
        }

        // Older shape takes a unix timestamp directly.
        let mut payload = serde_json::Map::new();
        if let Some(limit) = limit_bytes {
            payload.insert("data_limit".to_string(), json!(limit));
            payload.insert("data_limit_reset_strategy".to_string(), json!("no_reset"));
        }
        if let Some(expire) = expire_unix {
            payload.insert("expire".to_string(), json!(expire));
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
