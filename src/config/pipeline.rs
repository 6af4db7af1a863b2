// src/config/pipeline.rs
//! Pipeline tuning, read from `config/pipeline.toml`.
//!
//! Every section and key is optional. Out-of-range values are clamped back
//! into a usable range rather than rejected.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use crate::correlate::{CorrelatorSettings, SimilarityPolicy};
use crate::generate::LinkTemplates;

pub const ENV_PATH: &str = "PIPELINE_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/pipeline.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ingest: IngestSection,
    pub retention: RetentionSection,
    pub correlation: CorrelationSection,
    pub similarity: SimilarityPolicy,
    pub generation: GenerationSection,
    pub workers: WorkersSection,
    pub links: LinkTemplates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    /// Events stamped further than this into the future are rejected.
    pub max_future_skew_secs: i64,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            max_future_skew_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub event_days: i64,
    pub group_ttl_hours: i64,
    pub sweep_interval_secs: u64,
    /// Only used when SNAPSHOT_PATH is set.
    pub snapshot_interval_secs: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            event_days: 30,
            group_ttl_hours: 24,
            sweep_interval_secs: 300,
            snapshot_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSection {
    pub window_minutes: i64,
    pub threshold: f32,
    /// Optional JSON similarity policy, hot-reloaded on change. When set it
    /// overrides `[similarity]`.
    pub policy_path: Option<PathBuf>,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            window_minutes: 30,
            threshold: 0.3,
            policy_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub daily_limit: u32,
    pub reasoning_timeout_secs: u64,
    pub min_title_chars: usize,
    pub max_title_chars: usize,
    /// Generic titles rejected by the quality gate (exact or near match).
    pub denylist: Vec<String>,
    /// Normalized Levenshtein similarity at or above which a title counts as a
    /// near match of a denylisted phrase.
    pub near_match: f64,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            daily_limit: 20,
            reasoning_timeout_secs: 8,
            min_title_chars: 8,
            max_title_chars: crate::model::MAX_TITLE_CHARS,
            denylist: [
                "check messages",
                "review activity",
                "follow up",
                "stay updated",
                "check notifications",
                "review updates",
                "catch up",
                "check in",
                "check in with team",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            near_match: 0.85,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub correlation_shards: usize,
    pub generation_shards: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub dead_letter_capacity: usize,
    /// Notifications buffered for delivery before new ones are dropped.
    pub notification_capacity: usize,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            correlation_shards: 4,
            generation_shards: 2,
            queue_capacity: 1024,
            max_retries: 3,
            dead_letter_capacity: 256,
            notification_capacity: 256,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml(s: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(s).context("parsing pipeline config")?;
        Ok(cfg.sanitized())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// 1) $PIPELINE_CONFIG_PATH (must exist)
    /// 2) config/pipeline.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
        let default = PathBuf::from(DEFAULT_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(Self::default())
    }

    fn sanitized(mut self) -> Self {
        let d = PipelineConfig::default();

        if self.ingest.max_future_skew_secs < 0 {
            self.ingest.max_future_skew_secs = d.ingest.max_future_skew_secs;
        }

        let r = &mut self.retention;
        r.event_days = r.event_days.max(1);
        r.group_ttl_hours = r.group_ttl_hours.max(1);
        r.sweep_interval_secs = r.sweep_interval_secs.max(1);
        r.snapshot_interval_secs = r.snapshot_interval_secs.max(1);

        let c = &mut self.correlation;
        c.window_minutes = c.window_minutes.max(1);
        if !(0.0..=1.0).contains(&c.threshold) {
            c.threshold = d.correlation.threshold;
        }

        if self.similarity.proximity_horizon_minutes <= 0 {
            self.similarity.proximity_horizon_minutes = d.similarity.proximity_horizon_minutes;
        }

        let g = &mut self.generation;
        g.reasoning_timeout_secs = g.reasoning_timeout_secs.clamp(1, 60);
        if g.min_title_chars > g.max_title_chars {
            std::mem::swap(&mut g.min_title_chars, &mut g.max_title_chars);
        }
        g.max_title_chars = g.max_title_chars.clamp(1, crate::model::MAX_TITLE_CHARS);
        g.min_title_chars = g.min_title_chars.clamp(1, g.max_title_chars);
        if !(0.0..=1.0).contains(&g.near_match) {
            g.near_match = d.generation.near_match;
        }
        g.denylist = g
            .denylist
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let w = &mut self.workers;
        w.correlation_shards = w.correlation_shards.clamp(1, 64);
        w.generation_shards = w.generation_shards.clamp(1, 64);
        w.queue_capacity = w.queue_capacity.max(1);
        w.dead_letter_capacity = w.dead_letter_capacity.max(1);
        w.notification_capacity = w.notification_capacity.max(1);

        self
    }

    pub fn correlator_settings(&self) -> CorrelatorSettings {
        CorrelatorSettings {
            window: chrono::Duration::minutes(self.correlation.window_minutes),
            threshold: self.correlation.threshold,
        }
    }

    pub fn reasoning_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.generation.reasoning_timeout_secs)
    }

    pub fn event_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention.event_days)
    }

    pub fn group_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention.group_ttl_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = PipelineConfig::from_toml("").unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.generation.daily_limit, 20);
        assert_eq!(cfg.correlation.window_minutes, 30);
    }

    #[test]
    fn sections_parse_and_bad_values_are_clamped() {
        let cfg = PipelineConfig::from_toml(
            r#"
            [correlation]
            threshold = 4.0
            window_minutes = 0

            [similarity]
            type_pairs = [["commit", "issue"]]

            [similarity.weights]
            same_project = 0.5

            [generation]
            reasoning_timeout_secs = 0
            denylist = ["  Check Messages ", ""]

            [workers]
            correlation_shards = 0
            "#,
        )
        .unwrap();
        assert!((cfg.correlation.threshold - 0.3).abs() < f32::EPSILON);
        assert_eq!(cfg.correlation.window_minutes, 1);
        assert_eq!(
            cfg.similarity.type_pairs,
            vec![(EventType::Commit, EventType::Issue)]
        );
        assert!((cfg.similarity.weights.same_project - 0.5).abs() < f32::EPSILON);
        assert_eq!(cfg.generation.reasoning_timeout_secs, 1);
        assert_eq!(cfg.generation.denylist, vec!["check messages".to_string()]);
        assert_eq!(cfg.workers.correlation_shards, 1);
    }

    #[test]
    fn inverted_title_bounds_never_exceed_the_cap() {
        let cfg = PipelineConfig::from_toml(
            "[generation]\nmin_title_chars = 100\nmax_title_chars = 60\n",
        )
        .unwrap();
        assert_eq!(cfg.generation.max_title_chars, crate::model::MAX_TITLE_CHARS);
        assert!(cfg.generation.min_title_chars <= cfg.generation.max_title_chars);

        let cfg = PipelineConfig::from_toml(
            "[generation]\nmin_title_chars = 30\nmax_title_chars = 10\n",
        )
        .unwrap();
        assert_eq!(cfg.generation.min_title_chars, 10);
        assert_eq!(cfg.generation.max_title_chars, 30);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(PipelineConfig::from_toml("[retention\nevent_days = 1").is_err());
    }
}
