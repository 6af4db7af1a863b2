//! Periodic retention sweep.
//!
//! Each tick purges events older than the retention window, expires groups
//! idle past their TTL and pending actions past `expires_at`, then drops
//! closed groups and actions older than the retention window along with
//! idle per-user locks. Runs until the cancellation token fires.
//!
//! Group expiry takes the owning user's lock so it never interleaves with a
//! correlation or generation for that user.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::correlate::UserLocks;
use crate::error::StoreResult;
use crate::store::{ActionStore, EventStore, GroupStore};

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub event_retention: chrono::Duration,
    pub group_ttl: chrono::Duration,
    pub interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            event_retention: chrono::Duration::days(30),
            group_ttl: chrono::Duration::hours(24),
            interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub purged_events: usize,
    pub expired_groups: usize,
    pub expired_actions: usize,
    pub purged_groups: usize,
    pub purged_actions: usize,
    pub pruned_locks: usize,
}

#[derive(Clone)]
pub struct RetentionJob {
    events: Arc<dyn EventStore>,
    groups: Arc<dyn GroupStore>,
    actions: Arc<dyn ActionStore>,
    locks: UserLocks,
    policy: RetentionPolicy,
}

impl RetentionJob {
    pub fn new(
        events: Arc<dyn EventStore>,
        groups: Arc<dyn GroupStore>,
        actions: Arc<dyn ActionStore>,
        locks: UserLocks,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            events,
            groups,
            actions,
            locks,
            policy,
        }
    }

    /// One sweep at `now`. Individual store failures are logged and the rest
    /// of the sweep still runs.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let cutoff = now - self.policy.event_retention;
        match self.events.purge_older_than(cutoff).await {
            Ok(ids) => {
                report.purged_events = ids.len();
                if let Err(e) = self.groups.forget_processed(&ids).await {
                    tracing::error!(target: "retention", error = %e, "ledger cleanup failed");
                }
            }
            Err(e) => tracing::error!(target: "retention", error = %e, "event purge failed"),
        }
        match self.expire_groups(now).await {
            Ok(n) => report.expired_groups = n,
            Err(e) => tracing::error!(target: "retention", error = %e, "group expiry failed"),
        }
        match self.actions.expire_due(now).await {
            Ok(n) => report.expired_actions = n,
            Err(e) => tracing::error!(target: "retention", error = %e, "action expiry failed"),
        }
        match self.groups.purge_closed_before(cutoff).await {
            Ok(n) => report.purged_groups = n,
            Err(e) => tracing::error!(target: "retention", error = %e, "group purge failed"),
        }
        match self.actions.purge_closed_before(cutoff).await {
            Ok(n) => report.purged_actions = n,
            Err(e) => tracing::error!(target: "retention", error = %e, "action purge failed"),
        }
        report.pruned_locks = self.locks.prune();

        counter!("retention_purged_events_total").increment(report.purged_events as u64);
        if report == SweepReport::default() {
            tracing::debug!(target: "retention", "nothing to sweep");
        } else {
            tracing::info!(
                target: "retention",
                purged_events = report.purged_events,
                expired_groups = report.expired_groups,
                expired_actions = report.expired_actions,
                purged_groups = report.purged_groups,
                purged_actions = report.purged_actions,
                pruned_locks = report.pruned_locks,
                "retention sweep"
            );
        }
        report
    }

    async fn expire_groups(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let ttl = self.policy.group_ttl;
        let mut expired = 0;
        for (user_id, correlation_id) in self.groups.stale_open(now, ttl).await? {
            let _guard = self.locks.acquire(&user_id).await;
            if self.groups.expire_if_stale(&correlation_id, now, ttl).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            target: "retention",
            interval_secs = self.policy.interval.as_secs(),
            retention_days = self.policy.event_retention.num_days(),
            "retention job started"
        );
        let mut interval = tokio::time::interval(self.policy.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(target: "retention", "retention job stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
    }
}
