//! Periodic usage synchronization. Each tick walks every panel link, reads
//! the remote traffic counter, and accumulates the positive delta against
//! the stored baseline into the subscriber and agent accumulators. The
//! accumulators are monotonic: a remote counter that went backwards (panel
//! reinstall, remote reset) only re-baselines the link, it never subtracts.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::{OwnerScope, Store, SyncLink};
use crate::panels::PanelClients;

use super::service::{Enforcer, EnforcementError};

/// Scale a raw byte delta by the panel's usage multiplier, rounding to the
/// nearest byte. Non-finite or negative multipliers count as 1.0; a zero
/// multiplier is a deliberate "free panel" and zeroes the delta.
pub fn scale_delta(delta: i64, multiplier: f64) -> i64 {
    if delta <= 0 {
        return 0;
    }
    let m = if multiplier.is_finite() && multiplier >= 0.0 {
        multiplier
    } else {
        1.0
    };
    let scaled = (delta as f64 * m).round();
    if scaled >= i64::MAX as f64 {
        i64::MAX
    } else if scaled <= 0.0 {
        0
    } else {
        scaled as i64
    }
}

pub struct UsageSync {
    store: Arc<dyn Store>,
    clients: Arc<PanelClients>,
    enforcer: Arc<Enforcer>,
    admin_ids: Vec<i64>,
}

impl UsageSync {
    pub fn new(
        store: Arc<dyn Store>,
        clients: Arc<PanelClients>,
        enforcer: Arc<Enforcer>,
        admin_ids: Vec<i64>,
    ) -> Self {
        Self {
            store,
            clients,
            enforcer,
            admin_ids,
        }
    }

    fn scope_for(&self, owner_id: i64) -> OwnerScope {
        OwnerScope::expand(&self.admin_ids, owner_id)
    }

    /// Returns whether the remote counter was successfully read, whatever
    /// the delta turned out to be. Dropped links and failed reads do not
    /// count.
    async fn sync_link(&self, link: &SyncLink) -> Result<bool, EnforcementError> {
        let scope = self.scope_for(link.owner_id);

        if self
            .store
            .get_local_user(&scope, &link.local_username)
            .await?
            .is_none()
        {
            info!(
                link_id = link.link_id,
                username = %link.local_username,
                "dropping link with no subscriber row"
            );
            self.store.delete_link(link.link_id).await?;
            return Ok(false);
        }

        let reading = match self
            .clients
            .fetch_used_traffic(
                link.kind(),
                &link.panel_url,
                &link.access_token,
                &link.remote_username,
            )
            .await
        {
            Ok(reading) => reading,
            Err(e) => {
                warn!(
                    link_id = link.link_id,
                    panel = %link.panel_url,
                    error = %e,
                    "usage read failed"
                );
                return Ok(false);
            }
        };

        if reading < link.last_used_traffic {
            // Remote counter moved backwards. Re-baseline with zero delta;
            // accumulated usage stays untouched.
            debug!(
                link_id = link.link_id,
                baseline = link.last_used_traffic,
                reading,
                "counter reset detected, re-baselining"
            );
            self.store.update_link_baseline(link.link_id, reading).await?;
            return Ok(true);
        }

        let delta = reading - link.last_used_traffic;
        if delta == 0 {
            return Ok(true);
        }
        let scaled = scale_delta(delta, link.usage_multiplier);
        self.store
            .add_used_bytes(link.owner_id, &link.local_username, scaled)
            .await?;
        self.store.add_agent_used_bytes(link.owner_id, scaled).await?;
        self.store.update_link_baseline(link.link_id, reading).await?;
        debug!(
            link_id = link.link_id,
            delta, scaled, "usage accumulated"
        );
        Ok(true)
    }

    /// One synchronization pass: accumulate deltas for every link, then
    /// re-evaluate every subscriber whose counter could be read and every
    /// owner seen. Idle links still trigger evaluation; an account blocked
    /// by its agent must recover when the operator raises the limit even
    /// though no new traffic can arrive while it is disabled.
    pub async fn run_tick(&self) -> Result<(), EnforcementError> {
        let links = self.store.list_sync_links().await?;
        let mut touched_users: BTreeSet<(i64, String)> = BTreeSet::new();
        let mut touched_owners: BTreeSet<i64> = BTreeSet::new();

        for link in &links {
            match self.sync_link(link).await {
                Ok(true) => {
                    touched_users.insert((link.owner_id, link.local_username.clone()));
                    touched_owners.insert(link.owner_id);
                }
                Ok(false) => {}
                Err(e) => warn!(link_id = link.link_id, error = %e, "link sync failed"),
            }
        }

        for (owner_id, username) in &touched_users {
            let scope = self.scope_for(*owner_id);
            if let Err(e) = self.enforcer.evaluate_subscriber(&scope, username).await {
                warn!(username = %username, error = %e, "subscriber evaluation failed");
            }
        }
        for owner_id in &touched_owners {
            let scope = self.scope_for(*owner_id);
            if let Err(e) = self.enforcer.evaluate_agent(&scope).await {
                warn!(owner = owner_id, error = %e, "agent evaluation failed");
            }
        }
        debug!(
            links = links.len(),
            touched = touched_users.len(),
            "sync tick finished"
        );
        Ok(())
    }

    /// Tick until shutdown flips. Failures of a tick are logged and the
    /// loop keeps going; the background task only exits on shutdown.
    pub async fn run(self, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_tick().await {
                        warn!(error = %e, "sync tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("usage sync shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_applies_multiplier_with_rounding() {
        assert_eq!(scale_delta(100, 2.0), 200);
        assert_eq!(scale_delta(100, 1.0), 100);
        assert_eq!(scale_delta(3, 0.5), 2);
        assert_eq!(scale_delta(100, 1.337), 134);
    }

    #[test]
    fn scaling_treats_invalid_multipliers_as_identity() {
        assert_eq!(scale_delta(100, f64::NAN), 100);
        assert_eq!(scale_delta(100, f64::INFINITY), 100);
        assert_eq!(scale_delta(100, -2.0), 100);
    }

    #[test]
    fn scaling_zero_multiplier_discards_delta() {
        assert_eq!(scale_delta(100, 0.0), 0);
    }

    #[test]
    fn scaling_never_goes_negative_and_saturates() {
        assert_eq!(scale_delta(-50, 2.0), 0);
        assert_eq!(scale_delta(0, 2.0), 0);
        assert_eq!(scale_delta(i64::MAX, 2.0), i64::MAX);
    }
}
