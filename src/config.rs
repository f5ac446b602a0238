// src/config.rs
//! Pipeline configuration, loaded once at process start and passed by
//! reference into the engines. Validation failures are fatal and happen
//! before the store is touched.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{ClusteringRunConfig, Entity, WindowSpec, DEFAULT_TAG};

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";
pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const ENV_STORE_DIR: &str = "STORE_DIR";
pub const ENV_DEDUP_DRY_RUN: &str = "DEDUP_DRY_RUN";
pub const ENV_METRICS_TEXTFILE: &str = "METRICS_TEXTFILE";

/// Upper bound for a clustering window (100 years).
pub const MAX_WINDOW_DAYS: u32 = 36_500;
/// Upper bound for the dedup comparison window (one year).
pub const MAX_DEDUP_WINDOW_HOURS: i64 = 24 * 366;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    /// Ordered: the first tag with a matching keyword wins.
    #[serde(default)]
    pub tags: Vec<TagRule>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("data/store")
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_title_threshold")]
    pub title_threshold: f32,
    #[serde(default = "default_body_threshold")]
    pub body_threshold: f32,
    #[serde(default = "default_hard_threshold")]
    pub hard_title_threshold: f32,
    #[serde(default = "default_hard_threshold")]
    pub hard_body_threshold: f32,
    #[serde(default = "default_time_window_hours")]
    pub time_window_hours: i64,
    #[serde(default = "default_dedup_version")]
    pub dedup_version: String,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_title_threshold() -> f32 {
    0.70
}
fn default_body_threshold() -> f32 {
    0.75
}
fn default_hard_threshold() -> f32 {
    0.99
}
fn default_time_window_hours() -> i64 {
    48
}
fn default_dedup_version() -> String {
    "v1".to_string()
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_threshold: default_title_threshold(),
            body_threshold: default_body_threshold(),
            hard_title_threshold: default_hard_threshold(),
            hard_body_threshold: default_hard_threshold(),
            time_window_hours: default_time_window_hours(),
            dedup_version: default_dedup_version(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_body_char_limit")]
    pub body_char_limit: usize,
    #[serde(default = "default_min_text_length")]
    pub min_text_length: usize,
}

fn default_model() -> String {
    "feature-hashing-v1".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_body_char_limit() -> usize {
    4000
}
fn default_min_text_length() -> usize {
    200
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            dims: default_dims(),
            body_char_limit: default_body_char_limit(),
            min_text_length: default_min_text_length(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowSpec>,
    #[serde(default = "default_eps")]
    pub eps: f32,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_min_story_size")]
    pub min_story_size: usize,
    #[serde(default = "default_min_cohesion")]
    pub min_cohesion: f32,
    #[serde(default = "default_true")]
    pub tagging: bool,
    /// Articles carrying one of these tags never enter the vector matrix.
    #[serde(default)]
    pub exclude_tags: Vec<String>,
}

fn default_windows() -> Vec<WindowSpec> {
    [(3, 3), (7, 5), (14, 8), (30, 10)]
        .into_iter()
        .map(|(days, min_articles)| WindowSpec { days, min_articles })
        .collect()
}
fn default_eps() -> f32 {
    0.5
}
fn default_min_samples() -> usize {
    2
}
fn default_min_story_size() -> usize {
    2
}
fn default_min_cohesion() -> f32 {
    0.55
}
fn default_true() -> bool {
    true
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            eps: default_eps(),
            min_samples: default_min_samples(),
            min_story_size: default_min_story_size(),
            min_cohesion: default_min_cohesion(),
            tagging: true,
            exclude_tags: Vec::new(),
        }
    }
}

impl ClusteringConfig {
    pub fn run_config(&self) -> ClusteringRunConfig {
        ClusteringRunConfig {
            windows: self.windows.clone(),
            eps: self.eps,
            min_samples: self.min_samples,
            min_story_size: self.min_story_size,
            min_cohesion: self.min_cohesion,
            tagging: self.tagging,
            exclude_tags: self.exclude_tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TagRule {
    pub name: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus textfile written at the end of a run.
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            dedup: DedupConfig::default(),
            embedding: EmbeddingConfig::default(),
            clustering: ClusteringConfig::default(),
            tags: Vec::new(),
            entities: Vec::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse + validate a TOML document. Env overrides are not applied.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(s).context("parsing pipeline config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit path, then apply env overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let mut cfg: PipelineConfig = toml::from_str(&content)
            .with_context(|| format!("parsing pipeline config {}", path.display()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load using env var + fallback:
    /// 1) $PIPELINE_CONFIG_PATH
    /// 2) config/pipeline.toml
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let pb = PathBuf::from(DEFAULT_CONFIG_PATH);
        if !pb.exists() {
            bail!("no pipeline config found at {DEFAULT_CONFIG_PATH} (set {ENV_CONFIG_PATH})");
        }
        Self::load_from(&pb)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(ENV_STORE_DIR) {
            if !dir.trim().is_empty() {
                self.store.dir = PathBuf::from(dir.trim());
            }
        }
        if let Some(v) = parse_flag_env(std::env::var(ENV_DEDUP_DRY_RUN).ok()) {
            self.dedup.dry_run = v;
        }
        if let Ok(p) = std::env::var(ENV_METRICS_TEXTFILE) {
            if !p.trim().is_empty() {
                self.metrics.textfile = Some(PathBuf::from(p.trim()));
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.dedup;
        for (name, v) in [
            ("dedup.title_threshold", d.title_threshold),
            ("dedup.body_threshold", d.body_threshold),
            ("dedup.hard_title_threshold", d.hard_title_threshold),
            ("dedup.hard_body_threshold", d.hard_body_threshold),
        ] {
            if !(-1.0..=1.0).contains(&v) {
                bail!("{name} must be within [-1, 1], got {v}");
            }
        }
        if d.hard_title_threshold < d.title_threshold || d.hard_body_threshold < d.body_threshold {
            bail!("hard-duplicate thresholds must not be below semantic thresholds");
        }
        if d.time_window_hours <= 0 || d.time_window_hours > MAX_DEDUP_WINDOW_HOURS {
            bail!(
                "dedup.time_window_hours must be within 1..={MAX_DEDUP_WINDOW_HOURS}, got {}",
                d.time_window_hours
            );
        }

        let e = &self.embedding;
        if e.dims == 0 {
            bail!("embedding.dims must be positive");
        }
        if e.body_char_limit == 0 {
            bail!("embedding.body_char_limit must be positive");
        }

        let c = &self.clustering;
        if !(c.eps > 0.0 && c.eps <= 2.0) {
            bail!("clustering.eps must be within (0, 2], got {}", c.eps);
        }
        if c.min_samples == 0 {
            bail!("clustering.min_samples must be at least 1");
        }
        if c.min_story_size == 0 {
            bail!("clustering.min_story_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&c.min_cohesion) {
            bail!("clustering.min_cohesion must be within [0, 1]");
        }
        if c.windows.is_empty() {
            bail!("clustering.windows must not be empty");
        }
        let mut seen_days = HashSet::new();
        for w in &c.windows {
            if w.days == 0 || w.days > MAX_WINDOW_DAYS {
                bail!(
                    "clustering window days must be within 1..={MAX_WINDOW_DAYS}, got {}",
                    w.days
                );
            }
            if w.min_articles == 0 {
                bail!("clustering window {}d needs min_articles >= 1", w.days);
            }
            if !seen_days.insert(w.days) {
                bail!("duplicate clustering window {}d", w.days);
            }
        }

        validate_tags(&self.tags)?;

        let mut seen_ids = HashSet::new();
        for ent in &self.entities {
            if ent.entity_id.trim().is_empty() {
                bail!("entity {:?} has an empty entity_id", ent.name);
            }
            if !seen_ids.insert(ent.entity_id.as_str()) {
                bail!("duplicate entity_id {}", ent.entity_id);
            }
            if ent.match_by_ticker && ent.ticker.as_deref().map_or(true, |t| t.trim().is_empty()) {
                bail!("entity {} uses match_by_ticker without a ticker", ent.entity_id);
            }
        }
        Ok(())
    }
}

pub fn validate_tags(tags: &[TagRule]) -> Result<()> {
    let mut seen = HashSet::new();
    for t in tags {
        let name = t.name.trim();
        if name.is_empty() {
            bail!("tag with empty name");
        }
        if name == DEFAULT_TAG {
            bail!("tag name {DEFAULT_TAG:?} is reserved for unmatched articles");
        }
        if !seen.insert(name) {
            bail!("duplicate tag {name}");
        }
        if t.keywords.iter().all(|k| k.trim().is_empty()) {
            bail!("tag {name} has no keywords");
        }
    }
    Ok(())
}

// "1"/"true"/"yes" → true, "0"/"false"/"no" → false, anything else ignored.
fn parse_flag_env(raw: Option<String>) -> Option<bool> {
    match raw?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
