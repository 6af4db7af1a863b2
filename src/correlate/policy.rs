//! Similarity policy table with optional hot-reload from a JSON file.
//!
//! JSON shape (every key optional, missing keys keep defaults):
//! {
//!   "weights": { "same_project": 0.4, "keyword_overlap": 0.3, "cross_platform": 0.2,
//!                "time_proximity": 0.15, "type_pair": 0.15, "urgency_alignment": 0.1 },
//!   "proximity_horizon_minutes": 30,
//!   "type_pairs": [["message", "pull_request"], ["mention", "review_requested"]]
//! }
//!
//! On each `current()` call the file's modified time is checked and the policy
//! reloaded if it changed. A file that fails to parse keeps the previous policy.

use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use parking_lot::RwLock;

use crate::model::EventType;

/// Per-signal weights. Not normalized; the weighted sum is clamped to [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub same_project: f32,
    pub keyword_overlap: f32,
    pub cross_platform: f32,
    pub time_proximity: f32,
    pub type_pair: f32,
    pub urgency_alignment: f32,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            same_project: 0.4,
            keyword_overlap: 0.3,
            cross_platform: 0.2,
            time_proximity: 0.15,
            type_pair: 0.15,
            urgency_alignment: 0.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityPolicy {
    pub weights: SimilarityWeights,
    /// Time proximity decays linearly to zero over this horizon.
    pub proximity_horizon_minutes: i64,
    /// Unordered event-type pairs known to describe the same work.
    pub type_pairs: Vec<(EventType, EventType)>,
}

impl Default for SimilarityPolicy {
    fn default() -> Self {
        use EventType::*;
        Self {
            weights: SimilarityWeights::default(),
            proximity_horizon_minutes: 30,
            type_pairs: vec![
                (Message, PullRequest),
                (Message, Issue),
                (Message, PageEdit),
                (Mention, ReviewRequested),
                (Mention, PullRequest),
                (ThreadReply, PullRequest),
                (ReviewRequested, PullRequest),
                (ReviewComment, PullRequest),
                (Commit, PullRequest),
                (Issue, PullRequest),
                (Issue, Commit),
                (PageEdit, PullRequest),
                (PageComment, PageEdit),
                (Meeting, PageEdit),
                (Meeting, Message),
            ],
        }
    }
}

impl SimilarityPolicy {
    pub fn is_known_pair(&self, a: EventType, b: EventType) -> bool {
        self.type_pairs
            .iter()
            .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

/// Where the correlator gets its current policy from.
pub trait PolicySource: Send + Sync {
    fn current(&self) -> Arc<SimilarityPolicy>;
}

/// Fixed policy, typically from `PipelineConfig`.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy(Arc<SimilarityPolicy>);

impl StaticPolicy {
    pub fn new(policy: SimilarityPolicy) -> Self {
        Self(Arc::new(policy))
    }
}

impl PolicySource for StaticPolicy {
    fn current(&self) -> Arc<SimilarityPolicy> {
        self.0.clone()
    }
}

/// Hot-reload wrapper: reloads when the policy file mtime changes.
#[derive(Debug)]
pub struct HotReloadPolicy {
    path: PathBuf,
    inner: RwLock<State>,
}

#[derive(Debug)]
struct State {
    policy: Arc<SimilarityPolicy>,
    last_modified: Option<SystemTime>,
}

impl HotReloadPolicy {
    /// `fallback` is served until the file exists and parses.
    pub fn new(path: impl AsRef<Path>, fallback: SimilarityPolicy) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            inner: RwLock::new(State {
                policy: Arc::new(fallback),
                last_modified: None,
            }),
        }
    }
}

impl PolicySource for HotReloadPolicy {
    fn current(&self) -> Arc<SimilarityPolicy> {
        let mtime = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return self.inner.read().policy.clone(),
        };
        if self.inner.read().last_modified == Some(mtime) {
            return self.inner.read().policy.clone();
        }

        let mut guard = self.inner.write();
        // Another caller may have reloaded while we waited for the write lock.
        if guard.last_modified != Some(mtime) {
            match load_policy_file(&self.path) {
                Ok(p) => {
                    tracing::info!(target: "correlate", path = %self.path.display(), "similarity policy reloaded");
                    guard.policy = Arc::new(p);
                }
                Err(e) => {
                    tracing::warn!(target: "correlate", error = %e, "similarity policy reload failed; keeping previous");
                }
            }
            guard.last_modified = Some(mtime);
        }
        guard.policy.clone()
    }
}

/// Load a policy directly (no caching). Public for tests/tools.
pub fn load_policy_file(path: &Path) -> io::Result<SimilarityPolicy> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, thread, time::Duration};

    #[test]
    fn pairs_are_unordered() {
        let p = SimilarityPolicy::default();
        assert!(p.is_known_pair(EventType::PullRequest, EventType::Message));
        assert!(p.is_known_pair(EventType::Message, EventType::PullRequest));
        assert!(!p.is_known_pair(EventType::Commit, EventType::Meeting));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let p: SimilarityPolicy =
            serde_json::from_str(r#"{"weights":{"same_project":0.5}}"#).unwrap();
        assert!((p.weights.same_project - 0.5).abs() < f32::EPSILON);
        assert!((p.weights.keyword_overlap - 0.3).abs() < f32::EPSILON);
        assert_eq!(p.proximity_horizon_minutes, 30);
        assert!(!p.type_pairs.is_empty());
    }

    #[test]
    fn loads_and_hot_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("similarity.json");

        let hot = HotReloadPolicy::new(&path, SimilarityPolicy::default());
        assert_eq!(*hot.current(), SimilarityPolicy::default());

        {
            let mut f = fs::File::create(&path).unwrap();
            write!(f, r#"{{"weights":{{"cross_platform":0.05}},"type_pairs":[]}}"#).unwrap();
            f.sync_all().unwrap();
        }
        let p1 = hot.current();
        assert!((p1.weights.cross_platform - 0.05).abs() < f32::EPSILON);
        assert!(p1.type_pairs.is_empty());

        // Coarse mtime granularity on some filesystems.
        thread::sleep(Duration::from_millis(1100));
        {
            let mut f = fs::File::create(&path).unwrap();
            write!(f, "not json").unwrap();
            f.sync_all().unwrap();
        }
        let p2 = hot.current();
        assert!((p2.weights.cross_platform - 0.05).abs() < f32::EPSILON);
    }
}
