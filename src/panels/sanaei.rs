//! 3x-ui (sanaei) dialect. Cookie-authenticated, no subscription endpoint:
//! links are assembled from inbound settings and the client UUID. The
//! enable flag lives inside each inbound's `settings` field, which is a
//! JSON document stored as a string, so mutations re-serialize it.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    normalize_expire_unix, panel_url_join, PanelClient, PanelError, UserInfo, READ_TIMEOUT,
    WRITE_TIMEOUT,
};

pub struct SanaeiClient {
    http: Client,
}

impl SanaeiClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    async fn list_inbounds(&self, panel_url: &str, token: &str) -> Result<Vec<Value>, PanelError> {
        let url = panel_url_join(panel_url, "panel/api/inbounds/list");
        let resp = self
            .http
            .get(&url)
            .header("accept", "application/json")
            .header(reqwest::header::COOKIE, token)
            .timeout(READ_TIMEOUT)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PanelError::status(status, &body));
        }
        let data: Value = resp.json().await?;
        let inbounds = data
            .get("obj")
            .or_else(|| data.get("inbounds"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(inbounds)
    }

    async fn push_inbound(
        &self,
        panel_url: &str,
        token: &str,
        inbound_id: i64,
        inbound: &Value,
    ) -> Result<(), PanelError> {
        let url = panel_url_join(panel_url, &format!("panel/api/inbound/update/{inbound_id}"));
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::COOKIE, token)
            .json(inbound)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(PanelError::status(status, &body))
        }
    }

    async fn set_enabled(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
        enabled: bool,
    ) -> Result<(), PanelError> {
        let inbounds = self.list_inbounds(panel_url, token).await?;
        let (mut inbound, _) = find_client(&inbounds, remote).ok_or(PanelError::NotFound)?;
        let inbound_id = inbound.get("id").and_then(Value::as_i64).unwrap_or(0);

        let mut settings = parse_settings(&inbound);
        if let Some(clients) = settings.get_mut("clients").and_then(Value::as_array_mut) {
            for cl in clients.iter_mut() {
                if client_email(cl) == Some(remote) {
                    cl["enable"] = json!(enabled);
                    break;
                }
            }
        }
        inbound["settings"] = json!(settings.to_string());
        self.push_inbound(panel_url, token, inbound_id, &inbound).await
    }
}

fn client_email(cl: &Value) -> Option<&str> {
    cl.get("email")
        .or_else(|| cl.get("Email"))
        .or_else(|| cl.get("username"))
        .and_then(Value::as_str)
}

fn parse_settings(inbound: &Value) -> Value {
    match inbound.get("settings") {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| json!({})),
        Some(v @ Value::Object(_)) => v.clone(),
        _ => json!({}),
    }
}

/// Search every inbound's client list for the target email. Returns the
/// owning inbound and the client object.
fn find_client(inbounds: &[Value], remote: &str) -> Option<(Value, Value)> {
    for inbound in inbounds {
        let settings = parse_settings(inbound);
        let Some(clients) = settings.get("clients").and_then(Value::as_array) else {
            continue;
        };
        for cl in clients {
            if client_email(cl) == Some(remote) {
                return Some((inbound.clone(), cl.clone()));
            }
        }
    }
    None
}

fn host_from_panel_url(panel_url: &str) -> String {
    reqwest::Url::parse(panel_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_default()
}

#[async_trait]
impl PanelClient for SanaeiClient {
    async fn get_user(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<UserInfo, PanelError> {
        let inbounds = self.list_inbounds(panel_url, token).await?;
        let (_, client) = find_client(&inbounds, remote).ok_or(PanelError::NotFound)?;

        let url = panel_url_join(
            panel_url,
            &format!("panel/api/inbounds/getClientTraffics/{remote}"),
        );
        let resp = self
            .http
            .get(&url)
            .header("accept", "application/json")
            .header(reqwest::header::COOKIE, token)
            .timeout(READ_TIMEOUT)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PanelError::status(status, &body));
        }
        let data: Value = resp.json().await?;
        let obj = data.get("obj").filter(|v| !v.is_null()).unwrap_or(&data);

        let up = obj.get("up").and_then(Value::as_i64).unwrap_or(0);
        let down = obj.get("down").and_then(Value::as_i64).unwrap_or(0);
        let enabled = obj.get("enable").and_then(Value::as_bool).unwrap_or(true);
        // expiryTime is milliseconds when positive; zero means no expiry.
        let expire_unix = obj
            .get("expiryTime")
            .or_else(|| obj.get("expiry_time"))
            .or_else(|| client.get("expiryTime"))
            .or_else(|| client.get("expiry_time"))
            .and_then(Value::as_f64)
            .filter(|v| *v > 0.0)
            .and_then(normalize_expire_unix);

        Ok(UserInfo {
            used_traffic: up.saturating_add(down),
            enabled,
            key: None,
            expire_unix,
        })
    }

    async fn fetch_links(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
        _key: &str,
    ) -> Result<Vec<String>, PanelError> {
        let inbounds = self.list_inbounds(panel_url, token).await?;
        let (inbound, client) = find_client(&inbounds, remote).ok_or(PanelError::NotFound)?;

        let uuid = client
            .get("id")
            .or_else(|| client.get("uuid"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let listen = inbound
            .get("listen")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);
        let host = listen.unwrap_or_else(|| host_from_panel_url(panel_url));
        let port = inbound.get("port").and_then(Value::as_i64).unwrap_or(0);
        let protocol = inbound
            .get("protocol")
            .and_then(Value::as_str)
            .unwrap_or("vless");
        let name = inbound
            .get("remark")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(remote);

        if host.is_empty() || port == 0 || uuid.is_empty() {
            return Err(PanelError::Payload("incomplete config".to_string()));
        }
        let mut link = format!("{protocol}://{uuid}@{host}:{port}?security=none#{name}");
        if !super::has_allowed_scheme(&link) {
            link = format!("vless://{uuid}@{host}:{port}?security=none#{name}");
        }
        Ok(vec![link])
    }

    async fn disable(&self, panel_url: &str, token: &str, remote: &str) -> Result<(), PanelError> {
        self.set_enabled(panel_url, token, remote, false).await
    }

    async fn enable(&self, panel_url: &str, token: &str, remote: &str) -> Result<(), PanelError> {
        self.set_enabled(panel_url, token, remote, true).await
    }

    async fn reset_usage(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<(), PanelError> {
        let inbounds = self.list_inbounds(panel_url, token).await?;
        let (inbound, _) = find_client(&inbounds, remote).ok_or(PanelError::NotFound)?;
        let inbound_id = inbound.get("id").and_then(Value::as_i64).unwrap_or(0);

        let url = panel_url_join(
            panel_url,
            &format!("panel/api/inbounds/{inbound_id}/resetClientTraffic/{remote}"),
        );
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::COOKIE, token)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(PanelError::status(status, &body))
        }
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
        let inbounds = self.list_inbounds(panel_url, token).await?;
        let (inbound, mut client) = find_client(&inbounds, remote).ok_or(PanelError::NotFound)?;
        let inbound_id = inbound.get("id").and_then(Value::as_i64).unwrap_or(0);

        if let Some(limit) = limit_bytes {
            client["totalGB"] = json!(limit);
        }
        if let Some(expire) = expire_unix {
            client["expiryTime"] = json!(expire.saturating_mul(1000));
        }
        let client_id = client
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let payload = json!({
            "id": inbound_id,
            "settings": json!({ "clients": [client] }).to_string(),
        });
        let url = panel_url_join(
            panel_url,
            &format!("panel/api/inbounds/updateClient/{client_id}"),
        );
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::COOKIE, token)
            .json(&payload)
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(PanelError::status(status, &body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound_with_clients(clients: Value) -> Value {
        json!({
            "id": 7,
            "protocol": "vless",
            "port": 443,
            "listen": "1.2.3.4",
            "remark": "edge",
            "settings": json!({ "clients": clients }).to_string(),
        })
    }

    #[test]
    fn finds_client_by_email_inside_settings_string() {
        let inbounds = vec![inbound_with_clients(json!([
            { "id": "uuid-a", "email": "alice" },
            { "id": "uuid-b", "email": "bob" },
        ]))];
        let (inbound, client) = find_client(&inbounds, "bob").unwrap();
        assert_eq!(inbound["id"], 7);
        assert_eq!(client["id"], "uuid-b");
        assert!(find_client(&inbounds, "carol").is_none());
    }

    #[test]
    fn finds_client_by_alternate_email_keys() {
        let inbounds = vec![inbound_with_clients(json!([
            { "id": "uuid-c", "username": "carol" },
        ]))];
        assert!(find_client(&inbounds, "carol").is_some());
    }

    #[test]
    fn settings_object_form_is_accepted() {
        let inbound = json!({
            "id": 1,
            "settings": { "clients": [{ "id": "u", "email": "dave" }] },
        });
        let (_, client) = find_client(&[inbound], "dave").unwrap();
        assert_eq!(client["email"], "dave");
    }
}
