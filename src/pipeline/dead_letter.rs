//! Bounded in-memory log of work items the pipeline gave up on.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Correlation,
    Generation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub at: DateTime<Utc>,
    pub stage: Stage,
    pub user_id: String,
    /// Event id for correlation, correlation id for generation.
    pub item_id: String,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug)]
pub struct DeadLetterLog {
    inner: Mutex<VecDeque<DeadLetter>>,
    cap: usize,
}

impl DeadLetterLog {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 10_000);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    pub fn push(&self, entry: DeadLetter) {
        let mut v = self.inner.lock();
        if v.len() == self.cap {
            v.pop_front();
        }
        v.push_back(entry);
    }

    /// Newest last.
    pub fn snapshot_last_n(&self, n: usize) -> Vec<DeadLetter> {
        let v = self.inner.lock();
        let start = v.len().saturating_sub(n);
        v.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(id: &str) -> DeadLetter {
        DeadLetter {
            at: Utc::now(),
            stage: Stage::Correlation,
            user_id: "u1".into(),
            item_id: id.into(),
            attempts: 4,
            reason: "store unavailable".into(),
        }
    }

    #[test]
    fn ring_drops_oldest() {
        let log = DeadLetterLog::with_capacity(2);
        log.push(letter("e1"));
        log.push(letter("e2"));
        log.push(letter("e3"));
        let ids: Vec<String> = log.snapshot_last_n(10).into_iter().map(|d| d.item_id).collect();
        assert_eq!(ids, vec!["e2".to_string(), "e3".to_string()]);
        assert_eq!(log.snapshot_last_n(1)[0].item_id, "e3");
    }
}
