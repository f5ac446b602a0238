// src/pipeline.rs
//! Stage orchestration for batch runs: `import`, `embed`, `dedup`, `cluster`,
//! `all` (embed → dedup → cluster), `stats` and `audit`.
//!
//! Every stage returns a summary; the binary prints the combined
//! [`RunSummary`] as JSON at the end of a run.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::clustering::ClusteringEngine;
use crate::config::{EmbeddingConfig, PipelineConfig};
use crate::dedup::{DedupEngine, DedupSummary};
use crate::embedding::{run_embedding, EmbeddingProvider, EmbeddingSummary, HashingEmbedder};
use crate::models::{ClusteringRunStats, RawArticle};
use crate::snapshot::{audit_snapshots, snapshot_stats, SnapshotAudit, SnapshotStats};
use crate::store::ArticleStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Import(PathBuf),
    Embed,
    Dedup,
    Cluster,
    All,
    Stats,
    Audit,
}

impl Stage {
    /// Parse CLI args (without the program name).
    pub fn from_args(args: &[String]) -> Result<Self> {
        let Some(cmd) = args.first() else {
            return Ok(Stage::All);
        };
        match cmd.as_str() {
            "import" => {
                let path = args
                    .get(1)
                    .ok_or_else(|| anyhow!("usage: import <raw_articles.json>"))?;
                Ok(Stage::Import(PathBuf::from(path)))
            }
            "embed" => Ok(Stage::Embed),
            "dedup" => Ok(Stage::Dedup),
            "cluster" => Ok(Stage::Cluster),
            "all" => Ok(Stage::All),
            "stats" => Ok(Stage::Stats),
            "audit" => Ok(Stage::Audit),
            other => bail!(
                "unknown stage {other:?} (expected import|embed|dedup|cluster|all|stats|audit)"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub read: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Articles whose raw publication date could not be parsed.
    pub unparsed_dates: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import: Option<ImportSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<EmbeddingSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clustering: Option<ClusteringRunStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<SnapshotAudit>,
}

/// Parse `published_at_raw` (RFC 3339, then RFC 2822) into UTC.
pub fn parse_published_at(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Load a JSON array of raw articles from the fetcher and insert them.
/// Rows already stored under the same `(content_hash, entity_id)` are ignored.
pub async fn import_raw_articles(store: &dyn ArticleStore, path: &Path) -> Result<ImportSummary> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading raw articles from {}", path.display()))?;
    let mut articles: Vec<RawArticle> = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing raw articles in {}", path.display()))?;

    let mut unparsed_dates = 0;
    for a in articles.iter_mut() {
        if a.published_at_utc.is_some() {
            continue;
        }
        if let Some(raw) = a.published_at_raw.as_deref() {
            a.published_at_utc = parse_published_at(raw);
            if a.published_at_utc.is_none() {
                debug!(title = %a.title, raw, "unparseable publication date");
                unparsed_dates += 1;
            }
        }
    }

    let inserted = store.insert_raw_articles(&articles).await?;
    let summary = ImportSummary {
        read: articles.len(),
        inserted,
        duplicates: articles.len() - inserted,
        unparsed_dates,
    };
    info!(
        path = %path.display(),
        read = summary.read,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        "raw articles imported"
    );
    Ok(summary)
}

/// Provider for the configured model name.
pub fn provider_for(cfg: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    if cfg.model.starts_with("feature-hashing") {
        return Ok(Box::new(HashingEmbedder::new(cfg.dims)));
    }
    bail!("unsupported embedding model {:?}", cfg.model)
}

pub struct Pipeline<'a> {
    cfg: &'a PipelineConfig,
    store: &'a dyn ArticleStore,
    provider: Box<dyn EmbeddingProvider>,
}

impl<'a> Pipeline<'a> {
    pub fn new(cfg: &'a PipelineConfig, store: &'a dyn ArticleStore) -> Result<Self> {
        Ok(Self {
            cfg,
            store,
            provider: provider_for(&cfg.embedding)?,
        })
    }

    pub fn with_provider(mut self, provider: Box<dyn EmbeddingProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub async fn run(&self, stage: &Stage, now: DateTime<Utc>) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        match stage {
            Stage::Import(path) => {
                summary.import = Some(import_raw_articles(self.store, path).await?);
            }
            Stage::Embed => summary.embedding = Some(self.embed().await?),
            Stage::Dedup => summary.dedup = Some(self.dedup().await?),
            Stage::Cluster => summary.clustering = Some(self.cluster(now).await?),
            Stage::All => {
                summary.embedding = Some(self.embed().await?);
                summary.dedup = Some(self.dedup().await?);
                summary.clustering = Some(self.cluster(now).await?);
                summary.snapshot = Some(snapshot_stats(self.store).await?);
            }
            Stage::Stats => summary.snapshot = Some(snapshot_stats(self.store).await?),
            Stage::Audit => summary.audit = Some(audit_snapshots(self.store).await?),
        }
        Ok(summary)
    }

    async fn embed(&self) -> Result<EmbeddingSummary> {
        run_embedding(self.store, self.provider.as_ref(), &self.cfg.embedding).await
    }

    async fn dedup(&self) -> Result<DedupSummary> {
        DedupEngine::new(&self.cfg.dedup).run(self.store).await
    }

    async fn cluster(&self, now: DateTime<Utc>) -> Result<ClusteringRunStats> {
        if self.cfg.entities.is_empty() {
            info!(target: "clustering", "no entities configured; nothing to cluster");
        }
        let engine = ClusteringEngine::new(&self.cfg.clustering, &self.cfg.tags);
        let run = engine.run(self.store, &self.cfg.entities, now).await?;
        Ok(run.stats)
    }
}
