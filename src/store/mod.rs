//! Store abstractions. The correlator and generator only see these traits,
//! so tests can run against the in-memory implementations in [`memory`].

pub mod memory;
pub mod snapshot;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StoreResult;
use crate::model::{ActionRecommendation, AppendResult, CorrelationGroup, Event, Platform};

pub use memory::{MemoryActionStore, MemoryEventStore, MemoryGroupStore, RollingQuota};

/// Durable per-user append log of normalized events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `event` unless its `event_id` is already present.
    async fn append(&self, event: Event) -> StoreResult<AppendResult>;

    /// Events for `user_id` strictly newer than `since`, oldest first.
    async fn recent(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<Vec<Event>>;

    async fn by_id(&self, event_id: &str) -> StoreResult<Option<Event>>;

    /// Secondary index read: one platform, strictly newer than `since`, oldest first.
    async fn by_platform(
        &self,
        user_id: &str,
        platform: Platform,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Event>>;

    /// Drop events with `timestamp < cutoff`. Returns the ids removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>>;

    async fn len(&self) -> StoreResult<usize>;
}

/// Keyed collection of correlation groups plus the per-event processing ledger.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn get(&self, correlation_id: &str) -> StoreResult<Option<CorrelationGroup>>;

    /// Insert or replace a single group.
    async fn upsert(&self, group: CorrelationGroup) -> StoreResult<()>;

    /// Apply every group change caused by processing `event_id` and record the
    /// event as processed, all-or-nothing.
    async fn commit(&self, event_id: &str, groups: Vec<CorrelationGroup>) -> StoreResult<()>;

    async fn is_processed(&self, event_id: &str) -> StoreResult<bool>;

    /// Correlation id of the group currently holding `event_id`, if any.
    async fn group_of_event(&self, event_id: &str) -> StoreResult<Option<String>>;

    /// Open groups for `user_id` created at or after `created_since`.
    async fn open_for_user(
        &self,
        user_id: &str,
        created_since: DateTime<Utc>,
    ) -> StoreResult<Vec<CorrelationGroup>>;

    /// Groups of any status updated at or after `updated_since`, newest first.
    async fn list_for_user(
        &self,
        user_id: &str,
        updated_since: DateTime<Utc>,
    ) -> StoreResult<Vec<CorrelationGroup>>;

    /// Open groups idle for `ttl` at `now`, as `(user_id, correlation_id)`.
    async fn stale_open(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<Vec<(String, String)>>;

    /// Expire one group if it is still open and idle. Callers hold the
    /// group's user lock.
    async fn expire_if_stale(
        &self,
        correlation_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Remove non-open groups last updated before `cutoff`, together with their
    /// membership and ledger entries. Returns the number of groups removed.
    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    /// Drop ledger entries for events that no longer exist.
    async fn forget_processed(&self, event_ids: &[String]) -> StoreResult<usize>;
}

/// Keyed collection of generated actions.
#[async_trait]
pub trait ActionStore: Send + Sync {
    async fn insert(&self, action: ActionRecommendation) -> StoreResult<()>;

    async fn get(&self, action_id: &str) -> StoreResult<Option<ActionRecommendation>>;

    /// Replace an existing action; `NotFound` if it was never inserted.
    async fn update(&self, action: ActionRecommendation) -> StoreResult<()>;

    /// All actions for `user_id`, newest `generated_at` first.
    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<ActionRecommendation>>;

    /// Non-expired actions generated at or after `since`.
    async fn count_live_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<usize>;

    /// Mark pending actions past `expires_at` as expired. Returns the number changed.
    async fn expire_due(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Remove non-pending actions generated before `cutoff`.
    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

/// Per-user generation counter over a rolling window.
#[async_trait]
pub trait QuotaCounter: Send + Sync {
    /// Atomically check the limit and, if below it, record one generation at `now`.
    async fn try_acquire(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Give back a reservation taken at `at` (used when persisting fails).
    async fn release(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Generations recorded inside the window ending at `now`.
    async fn used(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<u32>;

    fn limit(&self) -> u32;
}
