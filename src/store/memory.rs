//! In-memory store implementations guarded by `parking_lot` locks.
//! Used by the service (optionally backed by a JSON snapshot) and by tests.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};

use super::{ActionStore, EventStore, GroupStore, QuotaCounter};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    ActionRecommendation, ActionStatus, AppendResult, CorrelationGroup, Event, GroupStatus,
    Platform,
};

type TimeIndex = BTreeSet<(DateTime<Utc>, String)>;

// ------------------------------------------------------------
// Events
// ------------------------------------------------------------

#[derive(Debug, Default)]
struct EventsInner {
    by_id: HashMap<String, Event>,
    by_user: HashMap<String, TimeIndex>,
    by_platform: HashMap<(String, Platform), TimeIndex>,
}

impl EventsInner {
    fn insert(&mut self, event: Event) -> AppendResult {
        if self.by_id.contains_key(&event.event_id) {
            return AppendResult::Duplicate;
        }
        let key = (event.timestamp, event.event_id.clone());
        self.by_user
            .entry(event.user_id.clone())
            .or_default()
            .insert(key.clone());
        self.by_platform
            .entry((event.user_id.clone(), event.platform))
            .or_default()
            .insert(key);
        self.by_id.insert(event.event_id.clone(), event);
        AppendResult::Stored
    }

    fn read_index(&self, index: Option<&TimeIndex>, since: DateTime<Utc>) -> Vec<Event> {
        let Some(index) = index else {
            return Vec::new();
        };
        index
            .range((since, String::new())..)
            .filter(|(ts, _)| *ts > since)
            .filter_map(|(_, id)| self.by_id.get(id).cloned())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    inner: RwLock<EventsInner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events, oldest first (snapshot export).
    pub fn export(&self) -> Vec<Event> {
        let g = self.inner.read();
        let mut out: Vec<Event> = g.by_id.values().cloned().collect();
        out.sort_by(|a, b| (a.timestamp, &a.event_id).cmp(&(b.timestamp, &b.event_id)));
        out
    }

    pub fn import(&self, events: Vec<Event>) {
        let mut g = self.inner.write();
        for ev in events {
            g.insert(ev);
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: Event) -> StoreResult<AppendResult> {
        Ok(self.inner.write().insert(event))
    }

    async fn recent(&self, user_id: &str, since: DateTime<Utc>) -> StoreResult<Vec<Event>> {
        let g = self.inner.read();
        Ok(g.read_index(g.by_user.get(user_id), since))
    }

    async fn by_id(&self, event_id: &str) -> StoreResult<Option<Event>> {
        Ok(self.inner.read().by_id.get(event_id).cloned())
    }

    async fn by_platform(
        &self,
        user_id: &str,
        platform: Platform,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Event>> {
        let g = self.inner.read();
        Ok(g.read_index(g.by_platform.get(&(user_id.to_string(), platform)), since))
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut g = self.inner.write();
        let doomed: Vec<Event> = g
            .by_id
            .values()
            .filter(|e| e.timestamp < cutoff)
            .cloned()
            .collect();
        for ev in &doomed {
            let key = (ev.timestamp, ev.event_id.clone());
            if let Some(idx) = g.by_user.get_mut(&ev.user_id) {
                idx.remove(&key);
            }
            if let Some(idx) = g.by_platform.get_mut(&(ev.user_id.clone(), ev.platform)) {
                idx.remove(&key);
            }
            g.by_id.remove(&ev.event_id);
        }
        g.by_user.retain(|_, idx| !idx.is_empty());
        g.by_platform.retain(|_, idx| !idx.is_empty());
        Ok(doomed.into_iter().map(|e| e.event_id).collect())
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.inner.read().by_id.len())
    }
}

// ------------------------------------------------------------
// Groups
// ------------------------------------------------------------

#[derive(Debug, Default)]
struct GroupsInner {
    by_id: HashMap<String, CorrelationGroup>,
    by_user: HashMap<String, HashSet<String>>,
    member_of: HashMap<String, String>,
    processed: HashSet<String>,
}

impl GroupsInner {
    fn put(&mut self, group: CorrelationGroup) {
        if let Some(old) = self.by_id.get(&group.correlation_id) {
            let stale: Vec<String> = old.member_ids().map(str::to_string).collect();
            for id in stale {
                if self.member_of.get(&id) == Some(&group.correlation_id) {
                    self.member_of.remove(&id);
                }
            }
        }
        for id in group.member_ids() {
            self.member_of
                .insert(id.to_string(), group.correlation_id.clone());
        }
        self.by_user
            .entry(group.user_id.clone())
            .or_default()
            .insert(group.correlation_id.clone());
        self.by_id.insert(group.correlation_id.clone(), group);
    }

    fn for_user(&self, user_id: &str) -> impl Iterator<Item = &CorrelationGroup> {
        self.by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryGroupStore {
    inner: RwLock<GroupsInner>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All groups plus the processed-event ledger (snapshot export).
    pub fn export(&self) -> (Vec<CorrelationGroup>, Vec<String>) {
        let g = self.inner.read();
        let mut groups: Vec<CorrelationGroup> = g.by_id.values().cloned().collect();
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut processed: Vec<String> = g.processed.iter().cloned().collect();
        processed.sort();
        (groups, processed)
    }

    pub fn import(&self, groups: Vec<CorrelationGroup>, processed: Vec<String>) {
        let mut g = self.inner.write();
        for group in groups {
            g.put(group);
        }
        g.processed.extend(processed);
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn get(&self, correlation_id: &str) -> StoreResult<Option<CorrelationGroup>> {
        Ok(self.inner.read().by_id.get(correlation_id).cloned())
    }

    async fn upsert(&self, group: CorrelationGroup) -> StoreResult<()> {
        self.inner.write().put(group);
        Ok(())
    }

    async fn commit(&self, event_id: &str, groups: Vec<CorrelationGroup>) -> StoreResult<()> {
        let mut g = self.inner.write();
        for group in groups {
            g.put(group);
        }
        g.processed.insert(event_id.to_string());
        Ok(())
    }

    async fn is_processed(&self, event_id: &str) -> StoreResult<bool> {
        Ok(self.inner.read().processed.contains(event_id))
    }

    async fn group_of_event(&self, event_id: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.read().member_of.get(event_id).cloned())
    }

    async fn open_for_user(
        &self,
        user_id: &str,
        created_since: DateTime<Utc>,
    ) -> StoreResult<Vec<CorrelationGroup>> {
        let g = self.inner.read();
        let mut out: Vec<CorrelationGroup> = g
            .for_user(user_id)
            .filter(|grp| grp.is_open() && grp.created_at >= created_since)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        updated_since: DateTime<Utc>,
    ) -> StoreResult<Vec<CorrelationGroup>> {
        let g = self.inner.read();
        let mut out: Vec<CorrelationGroup> = g
            .for_user(user_id)
            .filter(|grp| grp.last_updated_at >= updated_since)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        Ok(out)
    }

    async fn stale_open(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<Vec<(String, String)>> {
        let g = self.inner.read();
        let mut out: Vec<(String, String)> = g
            .by_id
            .values()
            .filter(|grp| grp.is_open() && grp.is_stale(now, ttl))
            .map(|grp| (grp.user_id.clone(), grp.correlation_id.clone()))
            .collect();
        out.sort();
        Ok(out)
    }

    async fn expire_if_stale(
        &self,
        correlation_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut g = self.inner.write();
        match g.by_id.get_mut(correlation_id) {
            Some(grp) if grp.is_open() && grp.is_stale(now, ttl) => {
                grp.status = GroupStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut g = self.inner.write();
        let doomed: Vec<CorrelationGroup> = g
            .by_id
            .values()
            .filter(|grp| !grp.is_open() && grp.last_updated_at < cutoff)
            .cloned()
            .collect();
        for grp in &doomed {
            for id in grp.member_ids() {
                if g.member_of.get(id) == Some(&grp.correlation_id) {
                    g.member_of.remove(id);
                }
                g.processed.remove(id);
            }
            if let Some(ids) = g.by_user.get_mut(&grp.user_id) {
                ids.remove(&grp.correlation_id);
            }
            g.by_id.remove(&grp.correlation_id);
        }
        g.by_user.retain(|_, ids| !ids.is_empty());
        Ok(doomed.len())
    }

    async fn forget_processed(&self, event_ids: &[String]) -> StoreResult<usize> {
        let mut g = self.inner.write();
        Ok(event_ids
            .iter()
            .filter(|id| g.processed.remove(id.as_str()))
            .count())
    }
}

// ------------------------------------------------------------
// Actions
// ------------------------------------------------------------

#[derive(Debug, Default)]
struct ActionsInner {
    by_id: HashMap<String, ActionRecommendation>,
    by_user: HashMap<String, TimeIndex>,
}

#[derive(Debug, Default)]
pub struct MemoryActionStore {
    inner: RwLock<ActionsInner>,
}

impl MemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(&self) -> Vec<ActionRecommendation> {
        let g = self.inner.read();
        let mut out: Vec<ActionRecommendation> = g.by_id.values().cloned().collect();
        out.sort_by(|a, b| a.generated_at.cmp(&b.generated_at));
        out
    }

    pub fn import(&self, actions: Vec<ActionRecommendation>) {
        let mut g = self.inner.write();
        for a in actions {
            g.by_user
                .entry(a.user_id.clone())
                .or_default()
                .insert((a.generated_at, a.action_id.clone()));
            g.by_id.insert(a.action_id.clone(), a);
        }
    }
}

#[async_trait]
impl ActionStore for MemoryActionStore {
    async fn insert(&self, action: ActionRecommendation) -> StoreResult<()> {
        self.import(vec![action]);
        Ok(())
    }

    async fn get(&self, action_id: &str) -> StoreResult<Option<ActionRecommendation>> {
        Ok(self.inner.read().by_id.get(action_id).cloned())
    }

    async fn update(&self, action: ActionRecommendation) -> StoreResult<()> {
        let mut g = self.inner.write();
        match g.by_id.get_mut(&action.action_id) {
            Some(slot) => {
                *slot = action;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "action",
                id: action.action_id,
            }),
        }
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<ActionRecommendation>> {
        let g = self.inner.read();
        let Some(index) = g.by_user.get(user_id) else {
            return Ok(Vec::new());
        };
        Ok(index
            .iter()
            .rev()
            .filter_map(|(_, id)| g.by_id.get(id).cloned())
            .collect())
    }

    async fn count_live_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let g = self.inner.read();
        let Some(index) = g.by_user.get(user_id) else {
            return Ok(0);
        };
        Ok(index
            .range((since, String::new())..)
            .filter_map(|(_, id)| g.by_id.get(id))
            .filter(|a| a.is_live(now))
            .count())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut g = self.inner.write();
        let mut n = 0;
        for a in g.by_id.values_mut() {
            if a.status == ActionStatus::Pending && now >= a.expires_at {
                a.status = ActionStatus::Expired;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut g = self.inner.write();
        let doomed: Vec<(String, DateTime<Utc>, String)> = g
            .by_id
            .values()
            .filter(|a| a.status != ActionStatus::Pending && a.generated_at < cutoff)
            .map(|a| (a.user_id.clone(), a.generated_at, a.action_id.clone()))
            .collect();
        for (user_id, at, id) in &doomed {
            if let Some(idx) = g.by_user.get_mut(user_id) {
                idx.remove(&(*at, id.clone()));
            }
            g.by_id.remove(id);
        }
        g.by_user.retain(|_, idx| !idx.is_empty());
        Ok(doomed.len())
    }
}

// ------------------------------------------------------------
// Quota
// ------------------------------------------------------------

/// Rolling-window generation counter. Each user keeps the timestamps of the
/// generations inside the window; check-and-record happens under one lock.
#[derive(Debug)]
pub struct RollingQuota {
    limit: u32,
    window: Duration,
    inner: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RollingQuota {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Default policy: 20 generations per trailing 24 hours.
    pub fn daily(limit: u32) -> Self {
        Self::new(limit, Duration::hours(24))
    }

    fn evict(buf: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
        while let Some(&front) = buf.front() {
            if front <= cutoff {
                buf.pop_front();
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl QuotaCounter for RollingQuota {
    async fn try_acquire(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut g = self.inner.lock();
        let buf = g.entry(user_id.to_string()).or_default();
        Self::evict(buf, now - self.window);
        if buf.len() as u32 >= self.limit {
            return Ok(false);
        }
        buf.push_back(now);
        Ok(true)
    }

    async fn release(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut g = self.inner.lock();
        if let Some(buf) = g.get_mut(user_id) {
            if let Some(pos) = buf.iter().rposition(|t| *t == at) {
                buf.remove(pos);
            }
        }
        Ok(())
    }

    async fn used(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<u32> {
        let mut g = self.inner.lock();
        let Some(buf) = g.get_mut(user_id) else {
            return Ok(0);
        };
        Self::evict(buf, now - self.window);
        Ok(buf.len() as u32)
    }

    fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionType, EventType, Priority};
    use chrono::TimeZone;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn ev(id: &str, user: &str, platform: Platform, min: i64) -> Event {
        Event::new(id, user, platform, EventType::Message, t(min))
    }

    #[tokio::test]
    async fn duplicate_append_leaves_store_unchanged() {
        let store = MemoryEventStore::new();
        assert_eq!(
            store.append(ev("e1", "u1", Platform::Chat, 0)).await.unwrap(),
            AppendResult::Stored
        );
        let mut again = ev("e1", "u1", Platform::Docs, 5);
        again.urgency_score = 0.9;
        assert_eq!(store.append(again).await.unwrap(), AppendResult::Duplicate);
        assert_eq!(store.len().await.unwrap(), 1);
        let kept = store.by_id("e1").await.unwrap().unwrap();
        assert_eq!(kept.platform, Platform::Chat);
    }

    #[tokio::test]
    async fn recent_is_ascending_and_strictly_newer() {
        let store = MemoryEventStore::new();
        for (id, min) in [("c", 20), ("a", 0), ("b", 10)] {
            store.append(ev(id, "u1", Platform::Chat, min)).await.unwrap();
        }
        store.append(ev("other", "u2", Platform::Chat, 15)).await.unwrap();
        let ids: Vec<String> = store
            .recent("u1", t(0))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn platform_index_and_purge() {
        let store = MemoryEventStore::new();
        store.append(ev("a", "u1", Platform::Chat, 0)).await.unwrap();
        store.append(ev("b", "u1", Platform::Docs, 10)).await.unwrap();
        store.append(ev("c", "u1", Platform::Chat, 20)).await.unwrap();
        let chat = store
            .by_platform("u1", Platform::Chat, t(-1))
            .await
            .unwrap();
        assert_eq!(chat.len(), 2);

        assert_eq!(store.purge_older_than(t(15)).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.by_id("a").await.unwrap().is_none());
        assert!(store.recent("u1", t(-60)).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn group_membership_index_follows_evictions() {
        let store = MemoryGroupStore::new();
        let mut g = CorrelationGroup::new("g1", "u1", "e1", t(0));
        g.admit("e2", 0.5, t(1));
        store.commit("e2", vec![g.clone()]).await.unwrap();
        assert_eq!(store.group_of_event("e2").await.unwrap().as_deref(), Some("g1"));
        assert!(store.is_processed("e2").await.unwrap());

        g.evict("e2");
        store.upsert(g).await.unwrap();
        assert!(store.group_of_event("e2").await.unwrap().is_none());
        assert_eq!(store.group_of_event("e1").await.unwrap().as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn stale_groups_expire() {
        let store = MemoryGroupStore::new();
        store
            .upsert(CorrelationGroup::new("g1", "u1", "e1", t(0)))
            .await
            .unwrap();
        let ttl = Duration::hours(24);
        assert!(store.stale_open(t(60), ttl).await.unwrap().is_empty());
        let stale = store.stale_open(t(24 * 60), ttl).await.unwrap();
        assert_eq!(stale, vec![("u1".to_string(), "g1".to_string())]);

        // Touched after listing: no longer stale, left open.
        let mut g = store.get("g1").await.unwrap().unwrap();
        g.admit("e2", 0.6, t(23 * 60));
        store.commit("e2", vec![g]).await.unwrap();
        assert!(!store.expire_if_stale("g1", t(24 * 60), ttl).await.unwrap());

        assert!(store.expire_if_stale("g1", t(47 * 60), ttl).await.unwrap());
        assert!(!store.expire_if_stale("g1", t(48 * 60), ttl).await.unwrap());
        assert!(store.open_for_user("u1", t(-10)).await.unwrap().is_empty());
        assert_eq!(store.list_for_user("u1", t(-10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_groups_and_ledger_are_purged() {
        let store = MemoryGroupStore::new();
        let mut closed = CorrelationGroup::new("g1", "u1", "e1", t(0));
        closed.admit("e2", 0.5, t(1));
        store.commit("e2", vec![closed.clone()]).await.unwrap();
        closed.status = GroupStatus::Expired;
        store.upsert(closed).await.unwrap();
        store
            .commit("e3", vec![CorrelationGroup::new("g2", "u1", "e3", t(2))])
            .await
            .unwrap();
        store.commit("lonely", Vec::new()).await.unwrap();

        assert_eq!(store.purge_closed_before(t(10)).await.unwrap(), 1);
        assert!(store.get("g1").await.unwrap().is_none());
        assert!(store.group_of_event("e2").await.unwrap().is_none());
        assert!(!store.is_processed("e2").await.unwrap());
        // Open groups survive regardless of age.
        assert!(store.get("g2").await.unwrap().is_some());
        assert!(store.is_processed("e3").await.unwrap());

        let forgotten = store
            .forget_processed(&["lonely".to_string(), "never".to_string()])
            .await
            .unwrap();
        assert_eq!(forgotten, 1);
        let (groups, processed) = store.export();
        assert_eq!(groups.len(), 1);
        assert_eq!(processed, vec!["e3".to_string()]);
    }

    #[tokio::test]
    async fn live_count_ignores_expired_actions() {
        let store = MemoryActionStore::new();
        let urgent = ActionRecommendation::new(
            "a1", "u1", "g1", "Fix login bug", "d", Priority::Urgent, ActionType::Fix, 10, t(0),
        );
        let low = ActionRecommendation::new(
            "a2", "u1", "g2", "Update runbook", "d", Priority::Low, ActionType::Update, 10, t(0),
        );
        store.insert(urgent).await.unwrap();
        store.insert(low).await.unwrap();
        let now = t(5 * 60);
        assert_eq!(store.count_live_since("u1", t(-1), now).await.unwrap(), 1);
        assert_eq!(store.expire_due(now).await.unwrap(), 1);
        assert_eq!(
            store.get("a1").await.unwrap().unwrap().status,
            ActionStatus::Expired
        );

        assert_eq!(store.purge_closed_before(t(1)).await.unwrap(), 1);
        assert!(store.get("a1").await.unwrap().is_none());
        let left = store.list_for_user("u1").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].action_id, "a2");
    }

    #[tokio::test]
    async fn quota_is_bounded_and_rolls() {
        let q = RollingQuota::daily(2);
        assert!(q.try_acquire("u1", t(0)).await.unwrap());
        assert!(q.try_acquire("u1", t(1)).await.unwrap());
        assert!(!q.try_acquire("u1", t(2)).await.unwrap());
        assert!(q.try_acquire("u2", t(2)).await.unwrap());
        q.release("u1", t(1)).await.unwrap();
        assert_eq!(q.used("u1", t(3)).await.unwrap(), 1);
        assert!(q.try_acquire("u1", t(24 * 60 + 1)).await.unwrap());
    }
}
