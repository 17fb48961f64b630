//! Behavior of the per-vendor client registry across multi-identity
//! mappings: merged reads, broadcast writes, and partial-failure handling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use panelmux::panels::{
    PanelClient, PanelClients, PanelError, PanelKind, RemoteIdentity, UserInfo,
};

#[derive(Default)]
struct MockState {
    users: HashMap<String, UserInfo>,
    fail: Vec<String>,
    disabled: Vec<String>,
    enabled: Vec<String>,
}

#[derive(Clone, Default)]
struct MockPanel {
    state: Arc<Mutex<MockState>>,
}

impl MockPanel {
    fn with_user(self, remote: &str, used: i64, enabled: bool, key: Option<&str>) -> Self {
        self.state.lock().unwrap().users.insert(
            remote.to_string(),
            UserInfo {
                used_traffic: used,
                enabled,
                key: key.map(str::to_owned),
                expire_unix: None,
            },
        );
        self
    }

    fn failing_on(self, remote: &str) -> Self {
        self.state.lock().unwrap().fail.push(remote.to_string());
        self
    }

    fn disabled(&self) -> Vec<String> {
        self.state.lock().unwrap().disabled.clone()
    }

    fn enabled(&self) -> Vec<String> {
        self.state.lock().unwrap().enabled.clone()
    }

    fn should_fail(&self, remote: &str) -> bool {
        self.state.lock().unwrap().fail.iter().any(|r| r == remote)
    }
}

#[async_trait]
impl PanelClient for MockPanel {
    async fn get_user(&self, _url: &str, _token: &str, remote: &str) -> Result<UserInfo, PanelError> {
        if self.should_fail(remote) {
            return Err(PanelError::NotFound);
        }
        self.state
            .lock()
            .unwrap()
            .users
            .get(remote)
            .cloned()
            .ok_or(PanelError::NotFound)
    }

    async fn fetch_links(
        &self,
        _url: &str,
        _token: &str,
        remote: &str,
        _key: &str,
    ) -> Result<Vec<String>, PanelError> {
        Ok(vec![format!("vless://{remote}@host:443#cfg-{remote}")])
    }

    async fn disable(&self, _url: &str, _token: &str, remote: &str) -> Result<(), PanelError> {
        if self.should_fail(remote) {
            return Err(PanelError::Payload("mock failure".to_string()));
        }
        self.state.lock().unwrap().disabled.push(remote.to_string());
        Ok(())
    }

    async fn enable(&self, _url: &str, _token: &str, remote: &str) -> Result<(), PanelError> {
        self.state.lock().unwrap().enabled.push(remote.to_string());
        Ok(())
    }

    async fn reset_usage(&self, _url: &str, _token: &str, _remote: &str) -> Result<(), PanelError> {
        Ok(())
    }

    async fn update_quota(
        &self,
        _url: &str,
        _token: &str,
        _remote: &str,
        _limit: Option<i64>,
        _expire: Option<i64>,
    ) -> Result<(), PanelError> {
        Ok(())
    }
}

fn registry_with(mock: MockPanel) -> PanelClients {
    PanelClients::new(reqwest::Client::new()).with_client(PanelKind::Sanaei, Arc::new(mock))
}

#[tokio::test]
async fn multi_identity_usage_is_summed() {
    let mock = MockPanel::default()
        .with_user("a", 100, true, None)
        .with_user("b", 250, true, None);
    let clients = registry_with(mock);

    let total = clients
        .fetch_used_traffic(PanelKind::Sanaei, "https://p", "t", "a,b")
        .await
        .unwrap();
    assert_eq!(total, 350);
}

#[tokio::test]
async fn one_failing_identity_fails_the_whole_reading() {
    let mock = MockPanel::default()
        .with_user("a", 100, true, None)
        .failing_on("b");
    let clients = registry_with(mock);

    let res = clients
        .fetch_used_traffic(PanelKind::Sanaei, "https://p", "t", "a,b")
        .await;
    assert!(res.is_err());
}

#[tokio::test]
async fn merged_view_ands_enablement_and_keeps_first_key() {
    let mock = MockPanel::default()
        .with_user("a", 10, true, Some("key-a"))
        .with_user("b", 20, false, Some("key-b"));
    let clients = registry_with(mock);

    let info = clients
        .get_user_merged(PanelKind::Sanaei, "https://p", "t", "a,b")
        .await
        .unwrap();
    assert_eq!(info.used_traffic, 30);
    assert!(!info.enabled);
    assert_eq!(info.key.as_deref(), Some("key-a"));
}

#[tokio::test]
async fn disable_broadcast_attempts_every_identity_despite_failures() {
    let mock = MockPanel::default()
        .with_user("a", 0, true, None)
        .with_user("c", 0, true, None)
        .failing_on("b");
    let clients = registry_with(mock.clone());

    let res = clients
        .disable_all(PanelKind::Sanaei, "https://p", "t", "a,b,c")
        .await;
    // The failure surfaces, but the remaining identities were still pushed.
    assert!(res.is_err());
    assert_eq!(mock.disabled(), vec!["a", "c"]);
}

#[tokio::test]
async fn enable_broadcast_touches_every_identity() {
    let mock = MockPanel::default();
    let clients = registry_with(mock.clone());

    clients
        .enable_all(PanelKind::Sanaei, "https://p", "t", "x, y")
        .await
        .unwrap();
    assert_eq!(mock.enabled(), vec!["x", "y"]);
}

#[tokio::test]
async fn empty_identity_is_rejected() {
    let clients = registry_with(MockPanel::default());
    assert!(clients
        .fetch_used_traffic(PanelKind::Sanaei, "https://p", "t", " , ,")
        .await
        .is_err());
}

#[test]
fn identity_parsing_is_vendor_scoped() {
    let multi = RemoteIdentity::parse(PanelKind::Sanaei, "a,b");
    assert_eq!(multi.parts().len(), 2);
    let single = RemoteIdentity::parse(PanelKind::Guardcore, "a,b");
    assert_eq!(single.parts(), &["a,b"]);
}
