//! # Records
//! Shapes persisted in the article store: raw articles (authoritative),
//! embedded articles (derived 1:1 cache), dedup groups, story cluster
//! snapshots and clustering run audits.
//!
//! Timestamps are UTC. Vectors are plain `Vec<f32>`; an empty vector means
//! "missing" and makes the owning article ineligible for comparison.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag assigned when no keyword matches.
pub const DEFAULT_TAG: &str = "other";

/// An entity tracked by the pipeline (company, industry, macro theme...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub entity_id: String,
    pub name: String,
    #[serde(default = "default_entity_type")]
    pub entity_type: String,
    #[serde(default)]
    pub ticker: Option<String>,
    /// Legacy resolution path: select raw articles by ticker instead of id.
    #[serde(default)]
    pub match_by_ticker: bool,
}

fn default_entity_type() -> String {
    "company".to_string()
}

/// Upstream eligibility decision attached to a raw article by ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionGate {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Raw ingested article, unique on `(content_hash, entity_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawArticle {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content_hash: String,
    pub entity_id: String,
    pub entity_name: String,
    pub entity_type: String,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub published_at_raw: Option<String>,
    #[serde(default)]
    pub published_at_utc: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub raw_text: String,
    #[serde(default)]
    pub text_length: usize,
    #[serde(default)]
    pub ingestion_gate: Option<IngestionGate>,
    /// Why the embedding stage turned this article down, once it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_skipped: Option<String>,
}

impl RawArticle {
    /// Fill in the derived key fields (`content_hash`, `id`, `text_length`).
    /// Already-set values are left alone.
    pub fn with_derived_keys(mut self) -> Self {
        if self.content_hash.is_empty() {
            self.content_hash = content_hash(&self.raw_text);
        }
        if self.id.is_empty() {
            self.id = raw_article_id(&self.entity_id, &self.content_hash);
        }
        if self.text_length == 0 {
            self.text_length = self.raw_text.chars().count();
        }
        self
    }

    /// Gate-less articles count as allowed.
    pub fn gate_allowed(&self) -> bool {
        self.ingestion_gate.as_ref().map_or(true, |g| g.allowed)
    }
}

/// Deterministic 64-bit hex digest of article text.
pub fn content_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.as_bytes());
    hex_prefix(&digest, 8)
}

pub fn raw_article_id(entity_id: &str, content_hash: &str) -> String {
    format!("{entity_id}:{content_hash}")
}

pub(crate) fn hex_prefix(bytes: &[u8], n: usize) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(n * 2);
    for b in bytes.iter().take(n) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArticleEmbeddings {
    #[serde(default)]
    pub title: Vec<f32>,
    #[serde(default)]
    pub body: Vec<f32>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub embedded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingFlags {
    #[serde(default)]
    pub embedded: bool,
    #[serde(default)]
    pub semantically_deduped: bool,
    #[serde(default)]
    pub is_canonical: bool,
    #[serde(default)]
    pub dedup_group_id: Option<String>,
}

/// Embedded article derived from exactly one raw article.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddedArticle {
    pub id: String,
    pub raw_article_id: String,
    pub entity_id: String,
    #[serde(default)]
    pub entity_name: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub ticker: Option<String>,
    pub title: String,
    /// Body text as submitted to the embedder (already truncated).
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Length of the full raw text, used for canonical selection.
    #[serde(default)]
    pub text_length: usize,
    #[serde(default)]
    pub embeddings: ArticleEmbeddings,
    #[serde(default)]
    pub published_at_utc: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    #[serde(default)]
    pub processing: ProcessingFlags,
}

impl EmbeddedArticle {
    pub fn id_for_raw(raw_article_id: &str) -> String {
        format!("emb:{raw_article_id}")
    }

    /// Dedup-safe: never grouped, or the canonical member of its group.
    pub fn is_dedup_safe(&self) -> bool {
        !self.processing.semantically_deduped || self.processing.is_canonical
    }
}

/// Similarity parameters a dedup group was produced with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupParams {
    pub title_threshold: f32,
    pub body_threshold: f32,
    pub hard_dup_title: f32,
    pub hard_dup_body: f32,
    pub time_window_hours: i64,
}

/// One real-world article seen as N >= 2 embedded articles. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupGroup {
    pub group_id: String,
    pub dedup_version: String,
    pub entity_id: String,
    #[serde(default)]
    pub entity_name: String,
    #[serde(default)]
    pub ticker: Option<String>,
    pub canonical_article_id: String,
    pub member_article_ids: Vec<String>,
    pub hard_duplicate_ids: Vec<String>,
    pub semantic_duplicate_ids: Vec<String>,
    pub group_size: usize,
    pub dedup_params: DedupParams,
    pub created_at: DateTime<Utc>,
}

/// Flag update applied to one member after its group was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupFlagUpdate {
    pub article_id: String,
    pub group_id: String,
    pub is_canonical: bool,
}

/// Snapshot key: the unit of full replacement for story clusters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub entity_id: String,
    pub window_days: u32,
}

impl SnapshotKey {
    pub fn new(entity_id: impl Into<String>, window_days: u32) -> Self {
        Self {
            entity_id: entity_id.into(),
            window_days,
        }
    }
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}d", self.entity_id, self.window_days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterArticleRef {
    pub article_id: String,
    pub raw_article_id: String,
    pub title: String,
    pub published_at_utc: Option<DateTime<Utc>>,
    pub tag: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimeWindow {
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

impl TimeWindow {
    /// Half-open `[start, end)` membership.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start_utc && ts < self.end_utc
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterMetadata {
    pub size: usize,
    pub first_published: Option<DateTime<Utc>>,
    pub last_published: Option<DateTime<Utc>>,
    pub duration_hours: Option<f64>,
    pub velocity: Option<f64>,
    /// Member count per tag.
    pub tag_counts: BTreeMap<String, usize>,
}

/// Field names owned by the clustering engine. Consumers may not annotate these.
pub const CLUSTER_RESERVED_FIELDS: &[&str] = &[
    "cluster_id",
    "run_id",
    "entity_id",
    "entity_name",
    "entity_type",
    "ticker",
    "window_days",
    "tag",
    "time_window",
    "articles",
    "centroid",
    "cohesion",
    "cluster_metadata",
    "created_at",
    "last_updated",
];

/// Story cluster snapshot record for one `(entity_id, window_days)` key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoryCluster {
    pub cluster_id: String,
    pub run_id: String,
    pub entity_id: String,
    pub entity_name: String,
    pub entity_type: String,
    #[serde(default)]
    pub ticker: Option<String>,
    pub window_days: u32,
    pub tag: String,
    pub time_window: TimeWindow,
    pub articles: Vec<ClusterArticleRef>,
    pub centroid: Vec<f32>,
    pub cohesion: f32,
    pub cluster_metadata: ClusterMetadata,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Top-level fields added by downstream consumers (summary, stance...).
    #[serde(flatten)]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

impl StoryCluster {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::new(self.entity_id.clone(), self.window_days)
    }

    pub fn size(&self) -> usize {
        self.cluster_metadata.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowSpec {
    pub days: u32,
    pub min_articles: usize,
}

/// Configuration snapshot recorded with a clustering run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusteringRunConfig {
    pub windows: Vec<WindowSpec>,
    pub eps: f32,
    pub min_samples: usize,
    pub min_story_size: usize,
    pub min_cohesion: f32,
    pub tagging: bool,
    pub exclude_tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusteringRunStats {
    pub entities: usize,
    pub windows_processed: usize,
    pub windows_skipped: usize,
    pub windows_failed: usize,
    pub clusters_created: usize,
    pub clusters_rejected: usize,
    pub articles_clustered: usize,
    pub noise_articles: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
}

/// Audit record, written once per clustering invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusteringRun {
    pub run_id: String,
    pub run_timestamp: DateTime<Utc>,
    pub config: ClusteringRunConfig,
    pub stats: ClusteringRunStats,
    pub status: RunStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: &str) -> RawArticle {
        RawArticle {
            id: String::new(),
            content_hash: String::new(),
            entity_id: "company_us_tech_002".into(),
            entity_name: "Microsoft".into(),
            entity_type: "company".into(),
            ticker: Some("MSFT".into()),
            source: "wire".into(),
            title: "t".into(),
            url: None,
            published_at_raw: None,
            published_at_utc: None,
            ingested_at: Utc::now(),
            raw_text: text.into(),
            text_length: 0,
            ingestion_gate: None,
            embedding_skipped: None,
        }
    }

    #[test]
    fn content_hash_is_stable_and_short() {
        let a = content_hash("Azure revenue beats estimates");
        let b = content_hash("Azure revenue beats estimates");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, content_hash("Azure revenue misses estimates"));
    }

    #[test]
    fn derived_keys_fill_only_missing_fields() {
        let r = raw("héllo").with_derived_keys();
        assert_eq!(r.text_length, 5);
        assert!(r.id.starts_with("company_us_tech_002:"));

        let mut preset = raw("abc");
        preset.id = "fixed".into();
        let r = preset.with_derived_keys();
        assert_eq!(r.id, "fixed");
    }

    #[test]
    fn gate_defaults_to_allowed() {
        let mut r = raw("x");
        assert!(r.gate_allowed());
        r.ingestion_gate = Some(IngestionGate {
            allowed: false,
            reason: Some("too_short".into()),
        });
        assert!(!r.gate_allowed());
    }

    #[test]
    fn window_is_half_open() {
        let end = Utc::now();
        let w = TimeWindow {
            start_utc: end - chrono::Duration::days(3),
            end_utc: end,
        };
        assert!(w.contains(w.start_utc));
        assert!(!w.contains(end));
    }
}
