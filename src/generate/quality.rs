//! Quality gate for generated titles.

use strsim::normalized_levenshtein;

use crate::config::pipeline::GenerationSection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    EmptyTitle,
    TooShort(usize),
    TooLong(usize),
    Generic(String),
}

impl Rejection {
    /// Label used for the `actions_skipped_total{reason}` series.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::EmptyTitle => "empty_title",
            Rejection::TooShort(_) => "title_too_short",
            Rejection::TooLong(_) => "title_too_long",
            Rejection::Generic(_) => "generic_title",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    min_chars: usize,
    max_chars: usize,
    denylist: Vec<String>,
    near_match: f64,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::from_config(&GenerationSection::default())
    }
}

fn canonical(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl QualityGate {
    pub fn from_config(cfg: &GenerationSection) -> Self {
        Self {
            min_chars: cfg.min_title_chars,
            max_chars: cfg.max_title_chars,
            denylist: cfg.denylist.iter().map(|d| canonical(d)).collect(),
            near_match: cfg.near_match,
        }
    }

    pub fn check(&self, title: &str) -> Result<(), Rejection> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Rejection::EmptyTitle);
        }
        let n = title.chars().count();
        if n < self.min_chars {
            return Err(Rejection::TooShort(n));
        }
        if n > self.max_chars {
            return Err(Rejection::TooLong(n));
        }
        let c = canonical(title);
        for phrase in &self.denylist {
            if c == *phrase || normalized_levenshtein(&c, phrase) >= self.near_match {
                return Err(Rejection::Generic(phrase.clone()));
            }
        }
        Ok(())
    }
}
