//! JSON snapshot of the in-memory stores so a restart does not lose state.
//! Written via tmp file + rename; a missing file simply means "start empty".

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{MemoryActionStore, MemoryEventStore, MemoryGroupStore};
use crate::error::{StoreError, StoreResult};
use crate::model::{ActionRecommendation, CorrelationGroup, Event};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub groups: Vec<CorrelationGroup>,
    #[serde(default)]
    pub processed_events: Vec<String>,
    #[serde(default)]
    pub actions: Vec<ActionRecommendation>,
}

impl Snapshot {
    pub fn capture(
        events: &MemoryEventStore,
        groups: &MemoryGroupStore,
        actions: &MemoryActionStore,
    ) -> Self {
        let (groups, processed_events) = groups.export();
        Self {
            events: events.export(),
            groups,
            processed_events,
            actions: actions.export(),
        }
    }

    pub fn restore_into(
        self,
        events: &MemoryEventStore,
        groups: &MemoryGroupStore,
        actions: &MemoryActionStore,
    ) {
        events.import(self.events);
        groups.import(self.groups, self.processed_events);
        actions.import(self.actions);
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(io_err)?;
            }
        }
        let json = serde_json::to_vec(self).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp).map_err(io_err)?;
        f.write_all(&json).map_err(io_err)?;
        f.sync_all().map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    /// `Ok(None)` when no snapshot exists yet.
    pub fn load(path: &Path) -> StoreResult<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("snapshot {}: {e}", path.display())))
    }
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Snapshot(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, Platform};
    use crate::store::{EventStore, GroupStore};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/snapshot.json");
        assert!(Snapshot::load(&path).unwrap().is_none());

        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let events = MemoryEventStore::new();
        let groups = MemoryGroupStore::new();
        let actions = MemoryActionStore::new();
        events
            .append(Event::new("e1", "u1", Platform::Chat, EventType::Message, ts))
            .await
            .unwrap();
        groups
            .commit("e1", vec![CorrelationGroup::new("g1", "u1", "e1", ts)])
            .await
            .unwrap();
        Snapshot::capture(&events, &groups, &actions)
            .save(&path)
            .unwrap();

        let (e2, g2, a2) = (
            MemoryEventStore::new(),
            MemoryGroupStore::new(),
            MemoryActionStore::new(),
        );
        Snapshot::load(&path)
            .unwrap()
            .unwrap()
            .restore_into(&e2, &g2, &a2);
        assert_eq!(e2.len().await.unwrap(), 1);
        assert!(g2.is_processed("e1").await.unwrap());
        assert_eq!(g2.group_of_event("e1").await.unwrap().as_deref(), Some("g1"));
    }

    #[test]
    fn garbage_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            Snapshot::load(&path),
            Err(StoreError::Corrupt(_))
        ));
    }
}
