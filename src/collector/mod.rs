//! Link collection: fan out to every panel a subscriber is mapped onto,
//! pull the subscription links, then apply per-panel disable filters and
//! the optional ratio suffix. Failures of individual panels degrade the
//! result instead of failing it; each failure is reported as a line the
//! caller can surface.

pub mod cache;
pub mod links;

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::db::panels::DisabledFilters;
use crate::db::{LinkTarget, OwnerScope, Store};
use crate::panels::{PanelClients, PanelKind, RemoteIdentity, UserInfo};
use cache::FetchCache;

/// Inner fan-out width for a single multi-identity mapping. Panels of that
/// vendor tend to run on small boxes; hitting one with more parallel
/// requests than this starves its other tenants.
const INNER_WORKERS: usize = 3;

pub struct Collection {
    pub links: Vec<String>,
    pub errors: Vec<String>,
    /// First successfully fetched remote view, for the status headers.
    pub sample: Option<UserInfo>,
}

pub struct Collector {
    store: Arc<dyn Store>,
    clients: Arc<PanelClients>,
    cache: Arc<FetchCache>,
    max_workers: usize,
}

impl Collector {
    pub fn new(
        store: Arc<dyn Store>,
        clients: Arc<PanelClients>,
        cache: Arc<FetchCache>,
        max_workers: usize,
    ) -> Self {
        Self {
            store,
            clients,
            cache,
            max_workers,
        }
    }

    /// Resolve the subscriber's panel targets: explicit mappings when any
    /// exist, otherwise every panel in the owner scope with the local
    /// username used as the remote identity.
    async fn resolve_targets(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<Vec<LinkTarget>, sqlx::Error> {
        let mapped = self.store.list_mapped_links(scope, username).await?;
        if !mapped.is_empty() {
            return Ok(mapped);
        }
        let panels = self.store.list_owner_panels(scope).await?;
        Ok(panels
            .into_iter()
            .map(|p| LinkTarget {
                panel_id: p.id,
                remote_username: username.to_string(),
                panel_url: p.panel_url,
                access_token: p.access_token,
                panel_type: p.panel_type,
                usage_multiplier: p.usage_multiplier,
                append_ratio_to_name: p.append_ratio_to_name,
            })
            .collect())
    }

    pub async fn collect(
        &self,
        scope: &OwnerScope,
        username: &str,
    ) -> Result<Collection, sqlx::Error> {
        let targets = self.resolve_targets(scope, username).await?;
        let panel_ids: Vec<i64> = targets.iter().map(|t| t.panel_id).collect();
        let filters = self.store.load_disabled_filters(&panel_ids).await?;

        let width = self.max_workers.min(targets.len()).max(1);
        let mut results = stream::iter(targets)
            .map(|target| self.collect_target(target, &filters))
            .buffer_unordered(width);

        let mut out = Collection {
            links: Vec::new(),
            errors: Vec::new(),
            sample: None,
        };
        while let Some((links, errors, sample)) = results.next().await {
            out.links.extend(links);
            out.errors.extend(errors);
            if out.sample.is_none() {
                out.sample = sample;
            }
        }
        debug!(
            username,
            links = out.links.len(),
            errors = out.errors.len(),
            "collection finished"
        );
        Ok(out)
    }

    async fn collect_target(
        &self,
        target: LinkTarget,
        filters: &DisabledFilters,
    ) -> (Vec<String>, Vec<String>, Option<UserInfo>) {
        let kind = target.kind();
        let identity = RemoteIdentity::parse(kind, &target.remote_username);

        let (mut links, errors, sample) = if kind == PanelKind::Sanaei && identity.is_multi() {
            self.collect_multi(&target, &identity).await
        } else {
            self.collect_single(&target, &target.remote_username).await
        };

        let empty_names = Default::default();
        let empty_ordinals = Default::default();
        links = links::apply_disabled_filters(
            links,
            filters.names_for(target.panel_id).unwrap_or(&empty_names),
            filters
                .ordinals_for(target.panel_id)
                .unwrap_or(&empty_ordinals),
        );
        links = links
            .into_iter()
            .map(|l| {
                links::maybe_append_ratio_to_name(
                    &l,
                    target.usage_multiplier,
                    target.append_ratio_to_name,
                )
            })
            .collect();
        (links, errors, sample)
    }

    /// One mapping, several remote identities on the same panel: fetch each
    /// part with a small inner fan-out and concatenate.
    async fn collect_multi(
        &self,
        target: &LinkTarget,
        identity: &RemoteIdentity,
    ) -> (Vec<String>, Vec<String>, Option<UserInfo>) {
        let width = INNER_WORKERS.min(identity.parts().len()).max(1);
        let mut parts = stream::iter(identity.parts().to_vec())
            .map(|part| async move { self.collect_single(target, &part).await })
            .buffer_unordered(width);

        let mut links = Vec::new();
        let mut errors = Vec::new();
        let mut sample = None;
        while let Some((ls, errs, info)) = parts.next().await {
            links.extend(ls);
            errors.extend(errs);
            if sample.is_none() {
                sample = info;
            }
        }
        (links, errors, sample)
    }

    async fn collect_single(
        &self,
        target: &LinkTarget,
        remote: &str,
    ) -> (Vec<String>, Vec<String>, Option<UserInfo>) {
        let kind = target.kind();
        let client = self.clients.get(kind);
        let mut errors = Vec::new();

        let user_key = FetchCache::user_key(&target.panel_url, remote);
        let info = match self.cache.get_user(&user_key) {
            Some(info) => Some(info),
            None => match client
                .get_user(&target.panel_url, &target.access_token, remote)
                .await
            {
                Ok(info) => {
                    self.cache.put_user(user_key, info.clone());
                    Some(info)
                }
                Err(e) => {
                    errors.push(format!("{remote}@{}: {e}", target.panel_url));
                    None
                }
            },
        };

        // Vendors with a subscription token need it before links can be
        // fetched; the one vendor without tokens assembles links directly.
        let key = match (&info, kind) {
            (_, PanelKind::Sanaei) => Some(String::new()),
            (Some(i), _) => i.key.clone(),
            (None, _) => None,
        };
        let links = match key {
            None => Vec::new(),
            Some(key) => {
                let links_key = FetchCache::links_key(&target.panel_url, remote, &key);
                match self.cache.get_links(&links_key) {
                    Some(links) => links,
                    None => match client
                        .fetch_links(&target.panel_url, &target.access_token, remote, &key)
                        .await
                    {
                        Ok(links) => {
                            self.cache.put_links(links_key, links.clone());
                            links
                        }
                        Err(e) => {
                            errors.push(format!("{remote}@{}: {e}", target.panel_url));
                            Vec::new()
                        }
                    },
                }
            }
        };

        (links, errors, info)
    }
}
