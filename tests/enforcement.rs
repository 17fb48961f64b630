//! Collector and enforcement behavior over an in-memory store: broadcast
//! idempotence, agent cascades, fallback target resolution, partial
//! failure isolation, and sync-driven recovery.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use panelmux::collector::cache::FetchCache;
use panelmux::collector::Collector;
use panelmux::db::panels::DisabledFilters;
use panelmux::db::{Agent, LinkTarget, LocalUser, OwnerScope, Panel, Store, SyncLink};
use panelmux::enforcement::{BlockReason, Enforcer, GateState, UsageSync};
use panelmux::notifications::{NotificationError, Notifier};
use panelmux::panels::{PanelClient, PanelClients, PanelError, PanelKind, UserInfo};

const OWNER: i64 = 7;

fn scope() -> OwnerScope {
    OwnerScope::single(OWNER)
}

fn local_user(username: &str, limit: i64, used: i64, pushed: bool) -> LocalUser {
    LocalUser {
        owner_id: OWNER,
        username: username.to_string(),
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

fn agent(limit: i64, used: i64, pushed: bool) -> Agent {
    Agent {
        owner_id: OWNER,
        name: "acme".to_string(),
        plan_limit_bytes: limit,
        total_used_bytes: used,
        expire_at: None,
        active: true,
        disabled_pushed: pushed,
        disabled_pushed_at: None,
        user_limit: 0,
        max_user_bytes: 0,
    }
}

fn panel(id: i64, url: &str) -> Panel {
    Panel {
        id,
        owner_id: OWNER,
        panel_url: url.to_string(),
        access_token: "t".to_string(),
        panel_type: "marzban".to_string(),
        usage_multiplier: 1.0,
        append_ratio_to_name: false,
        template_username: None,
        sub_url: None,
    }
}

fn mapped_target(panel_id: i64, url: &str, remote: &str) -> LinkTarget {
    LinkTarget {
        panel_id,
        remote_username: remote.to_string(),
        panel_url: url.to_string(),
        access_token: "t".to_string(),
        panel_type: "marzban".to_string(),
        usage_multiplier: 1.0,
        append_ratio_to_name: false,
    }
}

fn sync_link(link_id: i64, username: &str, url: &str, baseline: i64) -> SyncLink {
    SyncLink {
        link_id,
        owner_id: OWNER,
        local_username: username.to_string(),
        panel_id: 1,
        remote_username: username.to_string(),
        last_used_traffic: baseline,
        panel_url: url.to_string(),
        access_token: "t".to_string(),
        panel_type: "marzban".to_string(),
        usage_multiplier: 1.0,
    }
}

#[derive(Default)]
struct MemStore {
    users: Mutex<HashMap<String, LocalUser>>,
    agent: Mutex<Option<Agent>>,
    mapped: Mutex<HashMap<String, Vec<LinkTarget>>>,
    owner_panels: Mutex<Vec<Panel>>,
    assigned_panels: Mutex<Vec<Panel>>,
    sync_links: Mutex<Vec<SyncLink>>,
    settings: Mutex<HashMap<String, String>>,
}

impl MemStore {
    fn with_user(self, user: LocalUser) -> Self {
        self.users
            .lock()
            .unwrap()
            .insert(user.username.clone(), user);
        self
    }

    fn with_agent(self, agent: Agent) -> Self {
        *self.agent.lock().unwrap() = Some(agent);
        self
    }

    fn with_mapped(self, username: &str, targets: Vec<LinkTarget>) -> Self {
        self.mapped
            .lock()
            .unwrap()
            .insert(username.to_string(), targets);
        self
    }

    fn with_owner_panels(self, panels: Vec<Panel>) -> Self {
        *self.owner_panels.lock().unwrap() = panels;
        self
    }

    fn with_assigned_panels(self, panels: Vec<Panel>) -> Self {
        *self.assigned_panels.lock().unwrap() = panels;
        self
    }

    fn with_sync_links(self, links: Vec<SyncLink>) -> Self {
        *self.sync_links.lock().unwrap() = links;
        self
    }

    fn with_setting(self, key: &str, value: &str) -> Self {
        self.settings
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self
    }

    fn user_flag(&self, username: &str) -> bool {
        self.users.lock().unwrap()[username].disabled_pushed
    }

    fn agent_flag(&self) -> bool {
        self.agent.lock().unwrap().as_ref().unwrap().disabled_pushed
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_local_user(
        &self,
        _scope: &OwnerScope,
        username: &str,
    ) -> Result<Option<LocalUser>, sqlx::Error> {
        Ok(self.users.lock().unwrap().get(username).cloned())
    }

    async fn list_usernames(&self, _scope: &OwnerScope) -> Result<Vec<String>, sqlx::Error> {
        let mut names: Vec<String> = self.users.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn add_used_bytes(
        &self,
        _owner_id: i64,
        username: &str,
        delta: i64,
    ) -> Result<(), sqlx::Error> {
        if let Some(user) = self.users.lock().unwrap().get_mut(username) {
            user.used_bytes = user.used_bytes.saturating_add(delta);
        }
        Ok(())
    }

    async fn mark_user_disabled_pushed(
        &self,
        _scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        if let Some(user) = self.users.lock().unwrap().get_mut(username) {
            user.disabled_pushed = true;
            user.disabled_pushed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn clear_user_disabled_pushed(
        &self,
        _scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        if let Some(user) = self.users.lock().unwrap().get_mut(username) {
            user.disabled_pushed = false;
            user.disabled_pushed_at = None;
        }
        Ok(())
    }

    async fn mark_usage_limit_notified(
        &self,
        _scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        if let Some(user) = self.users.lock().unwrap().get_mut(username) {
            user.usage_limit_notified = true;
        }
        Ok(())
    }

    async fn mark_expire_limit_notified(
        &self,
        _scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        if let Some(user) = self.users.lock().unwrap().get_mut(username) {
            user.expire_limit_notified = true;
        }
        Ok(())
    }

    async fn set_plan_limit(
        &self,
        _scope: &OwnerScope,
        username: &str,
        limit_bytes: i64,
    ) -> Result<(), sqlx::Error> {
        if let Some(user) = self.users.lock().unwrap().get_mut(username) {
            user.plan_limit_bytes = limit_bytes;
            user.usage_limit_notified = false;
        }
        Ok(())
    }

    async fn set_expire_at(
        &self,
        _scope: &OwnerScope,
        username: &str,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error> {
        if let Some(user) = self.users.lock().unwrap().get_mut(username) {
            user.expire_at = expire_at;
            user.expire_limit_notified = false;
        }
        Ok(())
    }

    async fn reset_used_bytes(
        &self,
        _scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        if let Some(user) = self.users.lock().unwrap().get_mut(username) {
            user.used_bytes = 0;
            user.usage_limit_notified = false;
        }
        Ok(())
    }

    async fn get_active_agent(&self, _scope: &OwnerScope) -> Result<Option<Agent>, sqlx::Error> {
        Ok(self.agent.lock().unwrap().clone())
    }

    async fn add_agent_used_bytes(&self, _owner_id: i64, delta: i64) -> Result<(), sqlx::Error> {
        if let Some(agent) = self.agent.lock().unwrap().as_mut() {
            agent.total_used_bytes = agent.total_used_bytes.saturating_add(delta);
        }
        Ok(())
    }

    async fn mark_agent_disabled_pushed(&self, _scope: &OwnerScope) -> Result<(), sqlx::Error> {
        if let Some(agent) = self.agent.lock().unwrap().as_mut() {
            agent.disabled_pushed = true;
            agent.disabled_pushed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn clear_agent_disabled_pushed(&self, _scope: &OwnerScope) -> Result<(), sqlx::Error> {
        if let Some(agent) = self.agent.lock().unwrap().as_mut() {
            agent.disabled_pushed = false;
            agent.disabled_pushed_at = None;
        }
        Ok(())
    }

    async fn list_mapped_links(
        &self,
        _scope: &OwnerScope,
        username: &str,
    ) -> Result<Vec<LinkTarget>, sqlx::Error> {
        Ok(self
            .mapped
            .lock()
            .unwrap()
            .get(username)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_owner_panels(&self, _scope: &OwnerScope) -> Result<Vec<Panel>, sqlx::Error> {
        Ok(self.owner_panels.lock().unwrap().clone())
    }

    async fn list_assigned_panels(&self, _scope: &OwnerScope) -> Result<Vec<Panel>, sqlx::Error> {
        Ok(self.assigned_panels.lock().unwrap().clone())
    }

    async fn list_sync_links(&self) -> Result<Vec<SyncLink>, sqlx::Error> {
        Ok(self.sync_links.lock().unwrap().clone())
    }

    async fn update_link_baseline(&self, link_id: i64, reading: i64) -> Result<(), sqlx::Error> {
        if let Some(link) = self
            .sync_links
            .lock()
            .unwrap()
            .iter_mut()
            .find(|l| l.link_id == link_id)
        {
            link.last_used_traffic = reading;
        }
        Ok(())
    }

    async fn reset_link_baselines(
        &self,
        _scope: &OwnerScope,
        username: &str,
    ) -> Result<(), sqlx::Error> {
        for link in self
            .sync_links
            .lock()
            .unwrap()
            .iter_mut()
            .filter(|l| l.local_username == username)
        {
            link.last_used_traffic = 0;
        }
        Ok(())
    }

    async fn delete_link(&self, link_id: i64) -> Result<(), sqlx::Error> {
        self.sync_links
            .lock()
            .unwrap()
            .retain(|l| l.link_id != link_id);
        Ok(())
    }

    async fn load_disabled_filters(
        &self,
        _panel_ids: &[i64],
    ) -> Result<DisabledFilters, sqlx::Error> {
        Ok(DisabledFilters::default())
    }

    async fn get_setting(
        &self,
        _scope: &OwnerScope,
        key: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        Ok(self.settings.lock().unwrap().get(key).cloned())
    }
}

#[derive(Default)]
struct PanelState {
    users: HashMap<(String, String), UserInfo>,
    fail_urls: HashSet<String>,
    disabled: Vec<(String, String)>,
    enabled: Vec<(String, String)>,
}

#[derive(Clone, Default)]
struct FakePanel {
    state: Arc<Mutex<PanelState>>,
}

impl FakePanel {
    fn with_user(self, url: &str, remote: &str, used: i64, key: Option<&str>) -> Self {
        self.state.lock().unwrap().users.insert(
            (url.to_string(), remote.to_string()),
            UserInfo {
                used_traffic: used,
                enabled: true,
                key: key.map(str::to_owned),
                expire_unix: None,
            },
        );
        self
    }

    fn failing_url(self, url: &str) -> Self {
        self.state.lock().unwrap().fail_urls.insert(url.to_string());
        self
    }

    fn disabled(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().disabled.clone()
    }

    fn enabled(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().enabled.clone()
    }

    fn dead(&self, url: &str) -> bool {
        self.state.lock().unwrap().fail_urls.contains(url)
    }
}

#[async_trait]
impl PanelClient for FakePanel {
    async fn get_user(&self, url: &str, _token: &str, remote: &str) -> Result<UserInfo, PanelError> {
        if self.dead(url) {
            return Err(PanelError::Payload("connection refused".to_string()));
        }
        self.state
            .lock()
            .unwrap()
            .users
            .get(&(url.to_string(), remote.to_string()))
            .cloned()
            .ok_or(PanelError::NotFound)
    }

    async fn fetch_links(
        &self,
        url: &str,
        _token: &str,
        remote: &str,
        _key: &str,
    ) -> Result<Vec<String>, PanelError> {
        if self.dead(url) {
            return Err(PanelError::Payload("connection refused".to_string()));
        }
        let host = url.trim_start_matches("https://");
        Ok(vec![format!("vless://{remote}@{host}:443#cfg-{host}")])
    }

    async fn disable(&self, url: &str, _token: &str, remote: &str) -> Result<(), PanelError> {
        if self.dead(url) {
            return Err(PanelError::Payload("connection refused".to_string()));
        }
        self.state
            .lock()
            .unwrap()
            .disabled
            .push((url.to_string(), remote.to_string()));
        Ok(())
    }

    async fn enable(&self, url: &str, _token: &str, remote: &str) -> Result<(), PanelError> {
        self.state
            .lock()
            .unwrap()
            .enabled
            .push((url.to_string(), remote.to_string()));
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

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _chat_id: i64, text: &str) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

fn registry(mock: FakePanel) -> Arc<PanelClients> {
    Arc::new(PanelClients::new(reqwest::Client::new()).with_client(PanelKind::Marzban, Arc::new(mock)))
}

fn enforcer(store: Arc<MemStore>, mock: FakePanel) -> (Arc<Enforcer>, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let enforcer = Arc::new(Enforcer::new(store, registry(mock), notifier.clone()));
    (enforcer, notifier)
}

fn collector(store: Arc<MemStore>, mock: FakePanel) -> Collector {
    let cache = Arc::new(FetchCache::new(Duration::from_secs(60)));
    Collector::new(store, registry(mock), cache, 5)
}

#[tokio::test]
async fn disable_broadcast_fires_once_per_crossing() {
    let store = Arc::new(MemStore::default().with_user(local_user("alice", 100, 150, false)).with_mapped(
        "alice",
        vec![
            mapped_target(1, "https://p1", "alice"),
            mapped_target(2, "https://p2", "alice"),
        ],
    ));
    let mock = FakePanel::default();
    let (enforcer, _) = enforcer(store.clone(), mock.clone());

    let gate = enforcer.evaluate_subscriber(&scope(), "alice").await.unwrap();
    assert_eq!(gate, GateState::Blocked(BlockReason::UsageLimit));
    assert_eq!(mock.disabled().len(), 2);
    assert!(store.user_flag("alice"));

    // Re-evaluating an unchanged account must not broadcast again.
    enforcer.evaluate_subscriber(&scope(), "alice").await.unwrap();
    assert_eq!(mock.disabled().len(), 2);
}

#[tokio::test]
async fn agent_exhaustion_cascades_over_assigned_panels() {
    let store = Arc::new(
        MemStore::default()
            .with_agent(agent(1000, 2000, false))
            .with_user(local_user("bob", 0, 10, false))
            .with_user(local_user("carol", 0, 20, false))
            .with_assigned_panels(vec![panel(1, "https://p1")]),
    );
    let mock = FakePanel::default();
    let (enforcer, _) = enforcer(store.clone(), mock.clone());

    let gate = enforcer.evaluate_agent(&scope()).await.unwrap();
    assert_eq!(gate, GateState::Blocked(BlockReason::UsageLimit));
    let disabled = mock.disabled();
    assert!(disabled.contains(&("https://p1".to_string(), "bob".to_string())));
    assert!(disabled.contains(&("https://p1".to_string(), "carol".to_string())));
    assert!(store.user_flag("bob"));
    assert!(store.user_flag("carol"));
    assert!(store.agent_flag());
}

#[tokio::test]
async fn collection_falls_back_to_owner_panels() {
    let store = Arc::new(
        MemStore::default()
            .with_owner_panels(vec![panel(1, "https://p1"), panel(2, "https://p2")]),
    );
    let mock = FakePanel::default()
        .with_user("https://p1", "alice", 10, Some("k1"))
        .with_user("https://p2", "alice", 20, Some("k2"));
    let collector = collector(store, mock);

    let out = collector.collect(&scope(), "alice").await.unwrap();
    assert!(out.errors.is_empty());
    assert_eq!(out.links.len(), 2);
    // The fallback uses the local username as the remote identity.
    assert!(out.links.iter().all(|l| l.starts_with("vless://alice@")));
}

#[tokio::test]
async fn one_dead_panel_keeps_the_others_links() {
    let store = Arc::new(MemStore::default().with_owner_panels(vec![
        panel(1, "https://p1"),
        panel(2, "https://p2"),
        panel(3, "https://p3"),
    ]));
    let mock = FakePanel::default()
        .with_user("https://p1", "alice", 10, Some("k1"))
        .with_user("https://p3", "alice", 30, Some("k3"))
        .failing_url("https://p2");
    let collector = collector(store, mock);

    let out = collector.collect(&scope(), "alice").await.unwrap();
    assert_eq!(out.links.len(), 2);
    assert_eq!(out.errors.len(), 1);
    assert!(out.errors[0].contains("https://p2"));
}

#[tokio::test]
async fn idle_links_still_drive_recovery() {
    // An agent that was cascade-disabled generates no traffic, so its
    // links report a zero delta. The sync tick must still re-evaluate,
    // otherwise a raised limit would never lift the cascade.
    let store = Arc::new(
        MemStore::default()
            .with_agent(agent(1000, 500, true))
            .with_user(local_user("bob", 0, 100, true))
            .with_owner_panels(vec![panel(1, "https://p1")])
            .with_assigned_panels(vec![panel(1, "https://p1")])
            .with_sync_links(vec![sync_link(1, "bob", "https://p1", 500)]),
    );
    let mock = FakePanel::default().with_user("https://p1", "bob", 500, None);
    let (enforcer, _) = enforcer(store.clone(), mock.clone());
    let sync = UsageSync::new(store.clone(), registry(mock.clone()), enforcer, Vec::new());

    sync.run_tick().await.unwrap();

    assert!(mock
        .enabled()
        .contains(&("https://p1".to_string(), "bob".to_string())));
    assert!(!store.user_flag("bob"));
    assert!(!store.agent_flag());
}

#[tokio::test]
async fn agent_notification_honors_mute_setting() {
    let muted_store = Arc::new(
        MemStore::default()
            .with_agent(agent(1000, 2000, false))
            .with_setting("limit_event_notifications_enabled", "0"),
    );
    let (muted_enforcer, muted_notifier) = enforcer(muted_store.clone(), FakePanel::default());
    muted_enforcer.evaluate_agent(&scope()).await.unwrap();
    assert!(muted_notifier.sent.lock().unwrap().is_empty());
    // The cascade still happens; only the message is suppressed.
    assert!(muted_store.agent_flag());

    let loud_store = Arc::new(MemStore::default().with_agent(agent(1000, 2000, false)));
    let (loud_enforcer, loud_notifier) = enforcer(loud_store, FakePanel::default());
    loud_enforcer.evaluate_agent(&scope()).await.unwrap();
    assert_eq!(loud_notifier.sent.lock().unwrap().len(), 1);
}
