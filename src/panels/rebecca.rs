//! Rebecca dialect. The REST surface is wire-compatible with marzban
//! (same user object, same `sub/{key}/v2ray` blob), so this client
//! delegates wholesale and only exists so the kind maps to its own entry
//! in the registry.

use async_trait::async_trait;
use reqwest::Client;

use super::marzban::MarzbanClient;
use super::{PanelClient, PanelError, UserInfo};

pub struct RebeccaClient {
    inner: MarzbanClient,
}

impl RebeccaClient {
    pub fn new(http: Client) -> Self {
        Self {
            inner: MarzbanClient::new(http),
        }
    }
}

#[async_trait]
impl PanelClient for RebeccaClient {
    async fn get_user(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<UserInfo, PanelError> {
        self.inner.get_user(panel_url, token, remote).await
    }

    async fn fetch_links(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
        key: &str,
    ) -> Result<Vec<String>, PanelError> {
        self.inner.fetch_links(panel_url, token, remote, key).await
    }

    async fn disable(&self, panel_url: &str, token: &str, remote: &str) -> Result<(), PanelError> {
        self.inner.disable(panel_url, token, remote).await
    }

    async fn enable(&self, panel_url: &str, token: &str, remote: &str) -> Result<(), PanelError> {
        self.inner.enable(panel_url, token, remote).await
    }

    async fn reset_usage(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<(), PanelError> {
        self.inner.reset_usage(panel_url, token, remote).await
    }

    async fn update_quota(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
        limit_bytes: Option<i64>,
        expire_unix: Option<i64>,
    ) -> Result<(), PanelError> {
        self.inner
            .update_quota(panel_url, token, remote, limit_bytes, expire_unix)
            .await
    }
}
