//! Panel client capability: one strategy per backend vendor dialect behind
//! a common trait, selected by the closed [`PanelKind`] enumeration.

pub mod guardcore;
pub mod marzban;
pub mod marzneshin;
pub mod pasarguard;
pub mod rebecca;
pub mod sanaei;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timeout ceiling for read calls.
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);
/// Timeout ceiling for mutation and subscription-body calls.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(20);

/// URI schemes accepted in aggregated output; anything else is dropped.
pub const ALLOWED_SCHEMES: [&str; 4] = ["vless://", "vmess://", "trojan://", "ss://"];

pub fn has_allowed_scheme(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    ALLOWED_SCHEMES.iter().any(|s| lower.starts_with(s))
}

/// Supported panel vendors. Unknown type strings fall back to marzneshin,
/// matching how unrecognized panels were historically dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelKind {
    Marzneshin,
    Marzban,
    Rebecca,
    Sanaei,
    Pasarguard,
    Guardcore,
}

impl PanelKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "marzban" => PanelKind::Marzban,
            "rebecca" => PanelKind::Rebecca,
            "sanaei" => PanelKind::Sanaei,
            "pasarguard" => PanelKind::Pasarguard,
            "guardcore" => PanelKind::Guardcore,
            _ => PanelKind::Marzneshin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PanelKind::Marzneshin => "marzneshin",
            PanelKind::Marzban => "marzban",
            PanelKind::Rebecca => "rebecca",
            PanelKind::Sanaei => "sanaei",
            PanelKind::Pasarguard => "pasarguard",
            PanelKind::Guardcore => "guardcore",
        }
    }
}

/// A subscriber's remote identity on one panel.
///
/// Exactly one vendor (sanaei) encodes a single subscriber as several
/// comma-joined identities, one per inbound; every other vendor carries a
/// single identity. Callers sum usage, AND-combine enablement and broadcast
/// mutations across the parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIdentity(Vec<String>);

impl RemoteIdentity {
    pub fn parse(kind: PanelKind, raw: &str) -> Self {
        let parts: Vec<String> = if kind == PanelKind::Sanaei {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        } else {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_owned()]
            }
        };
        RemoteIdentity(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_multi(&self) -> bool {
        self.0.len() > 1
    }
}

/// Normalized view of a remote user, independent of vendor dialect.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    pub used_traffic: i64,
    pub enabled: bool,
    /// Opaque subscription token; absent when the panel exposed none.
    pub key: Option<String>,
    /// Expiry as a unix timestamp in seconds, when the panel reported one.
    pub expire_unix: Option<i64>,
}

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{status} {body}")]
    Status { status: u16, body: String },
    #[error("user not found")]
    NotFound,
    #[error("{0}")]
    Payload(String),
}

impl PanelError {
    pub fn status(resp_status: reqwest::StatusCode, body: &str) -> Self {
        PanelError::Status {
            status: resp_status.as_u16(),
            body: truncate(body, 200),
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

/// Vendor capability consumed by the collector and the enforcement paths.
/// One implementation per panel dialect; all calls are best-effort network
/// operations bounded by the module timeouts.
#[async_trait]
pub trait PanelClient: Send + Sync {
    async fn get_user(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<UserInfo, PanelError>;

    async fn fetch_links(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
        key: &str,
    ) -> Result<Vec<String>, PanelError>;

    async fn disable(&self, panel_url: &str, token: &str, remote: &str)
        -> Result<(), PanelError>;

    async fn enable(&self, panel_url: &str, token: &str, remote: &str) -> Result<(), PanelError>;

    async fn reset_usage(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
    ) -> Result<(), PanelError>;

    async fn update_quota(
        &self,
        panel_url: &str,
        token: &str,
        remote: &str,
        limit_bytes: Option<i64>,
        expire_unix: Option<i64>,
    ) -> Result<(), PanelError>;
}

/// Registry holding one client per vendor, built once at startup. Tests
/// swap individual entries for mocks.
pub struct PanelClients {
    clients: HashMap<PanelKind, Arc<dyn PanelClient>>,
}

impl PanelClients {
    pub fn new(http: reqwest::Client) -> Self {
        let mut clients: HashMap<PanelKind, Arc<dyn PanelClient>> = HashMap::new();
        clients.insert(
            PanelKind::Marzneshin,
            Arc::new(marzneshin::MarzneshinClient::new(http.clone())),
        );
        clients.insert(
            PanelKind::Marzban,
            Arc::new(marzban::MarzbanClient::new(http.clone())),
        );
        clients.insert(
            PanelKind::Rebecca,
            Arc::new(rebecca::RebeccaClient::new(http.clone())),
        );
        clients.insert(
            PanelKind::Sanaei,
            Arc::new(sanaei::SanaeiClient::new(http.clone())),
        );
        clients.insert(
            PanelKind::Pasarguard,
            Arc::new(pasarguard::PasarguardClient::new(http.clone())),
        );
        clients.insert(
            PanelKind::Guardcore,
            Arc::new(guardcore::GuardcoreClient::new(http)),
        );
        PanelClients { clients }
    }

    pub fn with_client(mut self, kind: PanelKind, client: Arc<dyn PanelClient>) -> Self {
        self.clients.insert(kind, client);
        self
    }

    pub fn get(&self, kind: PanelKind) -> &dyn PanelClient {
        self.clients
            .get(&kind)
            .or_else(|| self.clients.get(&PanelKind::Marzneshin))
            .expect("registry always holds the marzneshin fallback")
            .as_ref()
    }

    /// Cumulative used traffic across every sub-identity of the mapping.
    /// Any failing part fails the whole reading: a partial sum would be
    /// indistinguishable from a counter reset to the sync loop.
    pub async fn fetch_used_traffic(
        &self,
        kind: PanelKind,
        panel_url: &str,
        token: &str,
        remote_raw: &str,
    ) -> Result<i64, PanelError> {
        let identity = RemoteIdentity::parse(kind, remote_raw);
        if identity.is_empty() {
            return Err(PanelError::NotFound);
        }
        let client = self.get(kind);
        let mut total: i64 = 0;
        for part in identity.parts() {
            let info = client.get_user(panel_url, token, part).await?;
            total = total.saturating_add(info.used_traffic.max(0));
        }
        Ok(total)
    }

    /// Merged user view: summed usage, AND-combined enablement, first key.
    pub async fn get_user_merged(
        &self,
        kind: PanelKind,
        panel_url: &str,
        token: &str,
        remote_raw: &str,
    ) -> Result<UserInfo, PanelError> {
        let identity = RemoteIdentity::parse(kind, remote_raw);
        if identity.is_empty() {
            return Err(PanelError::NotFound);
        }
        let client = self.get(kind);
        let mut merged: Option<UserInfo> = None;
        for part in identity.parts() {
            let info = client.get_user(panel_url, token, part).await?;
            merged = Some(match merged {
                None => info,
                Some(acc) => UserInfo {
                    used_traffic: acc.used_traffic.saturating_add(info.used_traffic.max(0)),
                    enabled: acc.enabled && info.enabled,
                    key: acc.key.or(info.key),
                    expire_unix: acc.expire_unix.or(info.expire_unix),
                },
            });
        }
        merged.ok_or(PanelError::NotFound)
    }

    /// Broadcast a mutation to every sub-identity; every part is attempted
    /// and the last failure, if any, is returned.
    pub async fn apply_all<'a, F>(
        &'a self,
        kind: PanelKind,
        remote_raw: &str,
        mut op: F,
    ) -> Result<(), PanelError>
    where
        F: FnMut(
            &'a dyn PanelClient,
            String,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), PanelError>> + Send + 'a>>,
    {
        let identity = RemoteIdentity::parse(kind, remote_raw);
        if identity.is_empty() {
            return Err(PanelError::NotFound);
        }
        let client = self.get(kind);
        let mut last_err = None;
        for part in identity.parts() {
            if let Err(e) = op(client, part.clone()).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn disable_all(
        &self,
        kind: PanelKind,
        panel_url: &str,
        token: &str,
        remote_raw: &str,
    ) -> Result<(), PanelError> {
        let url = panel_url.to_owned();
        let tok = token.to_owned();
        self.apply_all(kind, remote_raw, move |c, part| {
            let url = url.clone();
            let tok = tok.clone();
            Box::pin(async move { c.disable(&url, &tok, &part).await })
        })
        .await
    }

    pub async fn enable_all(
        &self,
        kind: PanelKind,
        panel_url: &str,
        token: &str,
        remote_raw: &str,
    ) -> Result<(), PanelError> {
        let url = panel_url.to_owned();
        let tok = token.to_owned();
        self.apply_all(kind, remote_raw, move |c, part| {
            let url = url.clone();
            let tok = tok.clone();
            Box::pin(async move { c.enable(&url, &tok, &part).await })
        })
        .await
    }

    pub async fn reset_usage_all(
        &self,
        kind: PanelKind,
        panel_url: &str,
        token: &str,
        remote_raw: &str,
    ) -> Result<(), PanelError> {
        let url = panel_url.to_owned();
        let tok = token.to_owned();
        self.apply_all(kind, remote_raw, move |c, part| {
            let url = url.clone();
            let tok = tok.clone();
            Box::pin(async move { c.reset_usage(&url, &tok, &part).await })
        })
        .await
    }

    pub async fn update_quota_all(
        &self,
        kind: PanelKind,
        panel_url: &str,
        token: &str,
        remote_raw: &str,
        limit_bytes: Option<i64>,
        expire_unix: Option<i64>,
    ) -> Result<(), PanelError> {
        let url = panel_url.to_owned();
        let tok = token.to_owned();
        self.apply_all(kind, remote_raw, move |c, part| {
            let url = url.clone();
            let tok = tok.clone();
            Box::pin(async move {
                c.update_quota(&url, &tok, &part, limit_bytes, expire_unix)
                    .await
            })
        })
        .await
    }
}

/// Join a path onto a panel base URL regardless of trailing slashes.
pub(crate) fn panel_url_join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Normalize a panel-reported expiry to unix seconds. Panels report either
/// seconds or milliseconds; values past the year 33658 are taken as ms.
pub(crate) fn normalize_expire_unix(raw: f64) -> Option<i64> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    let secs = if raw > 1e12 { raw / 1000.0 } else { raw };
    Some(secs as i64)
}

/// Username candidates to try in order: the identity as stored and, when it
/// differs, its lowercase form (some panel versions only accept lowercase).
pub(crate) fn username_candidates(remote: &str) -> Vec<String> {
    let lowered = remote.to_lowercase();
    if !lowered.is_empty() && lowered != remote {
        vec![remote.to_owned(), lowered]
    } else {
        vec![remote.to_owned()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parse_defaults_to_marzneshin() {
        assert_eq!(PanelKind::parse("sanaei"), PanelKind::Sanaei);
        assert_eq!(PanelKind::parse("MARZBAN"), PanelKind::Marzban);
        assert_eq!(PanelKind::parse("something-new"), PanelKind::Marzneshin);
        assert_eq!(PanelKind::parse(""), PanelKind::Marzneshin);
    }

    #[test]
    fn remote_identity_splits_only_for_sanaei() {
        let multi = RemoteIdentity::parse(PanelKind::Sanaei, "a, b ,,c");
        assert_eq!(multi.parts(), &["a", "b", "c"]);
        assert!(multi.is_multi());

        let single = RemoteIdentity::parse(PanelKind::Marzban, "a,b");
        assert_eq!(single.parts(), &["a,b"]);
        assert!(!single.is_multi());
    }

    #[test]
    fn expire_normalization_handles_ms_and_garbage() {
        assert_eq!(normalize_expire_unix(1_700_000_000.0), Some(1_700_000_000));
        assert_eq!(normalize_expire_unix(1_700_000_000_000.0), Some(1_700_000_000));
        assert_eq!(normalize_expire_unix(0.0), None);
        assert_eq!(normalize_expire_unix(-5.0), None);
        assert_eq!(normalize_expire_unix(f64::NAN), None);
    }

    #[test]
    fn candidates_include_lowercase_variant() {
        assert_eq!(username_candidates("Alice"), vec!["Alice", "alice"]);
        assert_eq!(username_candidates("bob"), vec!["bob"]);
    }

    #[test]
    fn scheme_gate_is_case_insensitive() {
        assert!(has_allowed_scheme("VLESS://x"));
        assert!(has_allowed_scheme("ss://y"));
        assert!(!has_allowed_scheme("http://z"));
    }
}
