//! Pairwise event similarity: a weighted sum of independent signals, each in
//! [0, 1], clamped to [0, 1].

use chrono::Duration;
use serde::Serialize;
use std::collections::BTreeSet;

use super::policy::SimilarityPolicy;
use crate::model::Event;

/// Per-signal contributions, kept for debug logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SimilarityBreakdown {
    pub same_project: f32,
    pub keyword_overlap: f32,
    pub cross_platform: f32,
    pub time_proximity: f32,
    pub type_pair: f32,
    pub urgency_alignment: f32,
}

impl SimilarityBreakdown {
    pub fn total(&self) -> f32 {
        (self.same_project
            + self.keyword_overlap
            + self.cross_platform
            + self.time_proximity
            + self.type_pair
            + self.urgency_alignment)
            .clamp(0.0, 1.0)
    }
}

pub fn similarity(a: &Event, b: &Event, policy: &SimilarityPolicy) -> f32 {
    breakdown(a, b, policy).total()
}

pub fn breakdown(a: &Event, b: &Event, policy: &SimilarityPolicy) -> SimilarityBreakdown {
    let w = &policy.weights;
    SimilarityBreakdown {
        same_project: if same_project(a, b) { w.same_project } else { 0.0 },
        keyword_overlap: w.keyword_overlap * jaccard(&a.keywords, &b.keywords),
        cross_platform: if a.platform != b.platform {
            w.cross_platform
        } else {
            0.0
        },
        time_proximity: w.time_proximity
            * time_proximity(a, b, Duration::minutes(policy.proximity_horizon_minutes)),
        type_pair: if policy.is_known_pair(a.event_type, b.event_type) {
            w.type_pair
        } else {
            0.0
        },
        urgency_alignment: w.urgency_alignment
            * (1.0 - (clamp01(a.urgency_score) - clamp01(b.urgency_score)).abs()),
    }
}

fn same_project(a: &Event, b: &Event) -> bool {
    match (&a.project_context, &b.project_context) {
        (Some(x), Some(y)) => {
            let (x, y) = (x.trim(), y.trim());
            !x.is_empty() && x.eq_ignore_ascii_case(y)
        }
        _ => false,
    }
}

/// |A ∩ B| / |A ∪ B|; two empty sets share nothing.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// 1 at Δt = 0, decaying linearly to 0 at `horizon`.
pub fn time_proximity(a: &Event, b: &Event, horizon: Duration) -> f32 {
    let horizon_ms = horizon.num_milliseconds();
    if horizon_ms <= 0 {
        return 0.0;
    }
    let dt = (a.timestamp - b.timestamp).num_milliseconds().abs();
    (1.0 - dt as f32 / horizon_ms as f32).max(0.0)
}

fn clamp01(x: f32) -> f32 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
