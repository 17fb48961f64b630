//! Short-lived memo for remote fetch results. Responses to a subscription
//! request hit every mapped panel; a subscriber refreshing their client a
//! few times in a row should not multiply that load.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::panels::UserInfo;

const MAX_ENTRIES: usize = 256;

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

pub struct FetchCache {
    ttl: Duration,
    users: DashMap<String, Entry<UserInfo>>,
    links: DashMap<String, Entry<Vec<String>>>,
}

impl FetchCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            users: DashMap::new(),
            links: DashMap::new(),
        }
    }

    fn fresh<V>(&self, entry: &Entry<V>) -> bool {
        entry.stored_at.elapsed() < self.ttl
    }

    pub fn user_key(panel_url: &str, remote: &str) -> String {
        format!("{panel_url}\u{1}{remote}")
    }

    pub fn links_key(panel_url: &str, remote: &str, key: &str) -> String {
        format!("{panel_url}\u{1}{remote}\u{1}{key}")
    }

    pub fn get_user(&self, key: &str) -> Option<UserInfo> {
        let entry = self.users.get(key)?;
        self.fresh(&entry).then(|| entry.value.clone())
    }

    pub fn put_user(&self, key: String, value: UserInfo) {
        evict_if_full(&self.users);
        self.users.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn get_links(&self, key: &str) -> Option<Vec<String>> {
        let entry = self.links.get(key)?;
        self.fresh(&entry).then(|| entry.value.clone())
    }

    pub fn put_links(&self, key: String, value: Vec<String>) {
        evict_if_full(&self.links);
        self.links.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }
}

fn evict_if_full<V>(map: &DashMap<String, Entry<V>>) {
    if map.len() < MAX_ENTRIES {
        return;
    }
    // Drop the stalest entry rather than refusing the insert.
    let oldest = map
        .iter()
        .min_by_key(|e| e.value().stored_at)
        .map(|e| e.key().clone());
    if let Some(key) = oldest {
        map.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl_miss_after() {
        let cache = FetchCache::new(Duration::from_secs(60));
        let key = FetchCache::user_key("https://p", "alice");
        assert!(cache.get_user(&key).is_none());

        let info = UserInfo {
            used_traffic: 5,
            enabled: true,
            key: None,
            expire_unix: None,
        };
        cache.put_user(key.clone(), info.clone());
        assert_eq!(cache.get_user(&key), Some(info));

        let expired = FetchCache::new(Duration::ZERO);
        expired.put_user(key.clone(), UserInfo::default());
        assert!(expired.get_user(&key).is_none());
    }

    #[test]
    fn eviction_keeps_map_bounded() {
        let cache = FetchCache::new(Duration::from_secs(60));
        for i in 0..300 {
            cache.put_links(format!("k{i}"), vec![format!("vless://u@h:{i}")]);
        }
        assert!(cache.links.len() <= MAX_ENTRIES);
    }

    #[test]
    fn keys_do_not_collide_across_fields() {
        assert_ne!(
            FetchCache::user_key("https://p/a", "b"),
            FetchCache::user_key("https://p", "a/b")
        );
    }
}
