//! Article store abstraction.
//!
//! The [`ArticleStore`] trait covers every read and write the pipeline makes,
//! so engines stay independent of the backing store. Two implementations ship:
//! [`memory::InMemoryStore`] for tests and [`json_file::JsonFileStore`], a
//! directory of JSON collections for local batch runs.
//!
//! Implementations must be `Send + Sync`.

pub mod json_file;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    ClusteringRun, DedupFlagUpdate, DedupGroup, EmbeddedArticle, RawArticle, SnapshotKey,
    StoryCluster,
};
use crate::resolver::{CandidateQuery, RawArticleFilter};

pub use json_file::JsonFileStore;
pub use memory::InMemoryStore;

/// Read filter over story clusters. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterFilter {
    pub entity_id: Option<String>,
    pub window_days: Option<u32>,
    pub tag: Option<String>,
    pub min_size: usize,
}

impl ClusterFilter {
    pub fn matches(&self, c: &StoryCluster) -> bool {
        self.entity_id.as_ref().map_or(true, |e| &c.entity_id == e)
            && self.window_days.map_or(true, |w| c.window_days == w)
            && self.tag.as_ref().map_or(true, |t| &c.tag == t)
            && c.size() >= self.min_size
    }
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Insert raw articles; rows whose `(content_hash, entity_id)` already
    /// exists are ignored. Returns the number inserted.
    async fn insert_raw_articles(&self, articles: &[RawArticle]) -> Result<usize>;

    /// Raw articles without an embedded counterpart that the embedding
    /// stage has not already turned down.
    async fn raw_articles_pending_embedding(&self) -> Result<Vec<RawArticle>>;

    /// Record why these raw articles will not be embedded. Returns the number
    /// of rows updated.
    async fn mark_embedding_skipped(&self, raw_ids: &[String], reason: &str) -> Result<usize>;

    async fn find_raw_article_ids(&self, filter: &RawArticleFilter) -> Result<Vec<String>>;

    /// Insert embedded articles; a second row for the same raw article is
    /// ignored. Returns the number inserted.
    async fn insert_embedded_articles(&self, articles: &[EmbeddedArticle]) -> Result<usize>;

    /// Embedded articles with `semantically_deduped != true`.
    async fn find_undeduped_articles(&self) -> Result<Vec<EmbeddedArticle>>;

    async fn find_embedded_articles(&self, query: &CandidateQuery) -> Result<Vec<EmbeddedArticle>>;

    async fn get_embedded_articles(&self, ids: &[String]) -> Result<Vec<EmbeddedArticle>>;

    async fn insert_dedup_group(&self, group: &DedupGroup) -> Result<()>;

    /// Apply dedup flags. Returns the number of articles updated.
    async fn mark_dedup_members(&self, updates: &[DedupFlagUpdate]) -> Result<usize>;

    async fn dedup_groups(&self) -> Result<Vec<DedupGroup>>;

    /// Remove the whole snapshot for a key. Returns the number removed.
    async fn delete_clusters(&self, key: &SnapshotKey) -> Result<usize>;

    async fn insert_clusters(&self, clusters: &[StoryCluster]) -> Result<usize>;

    async fn find_clusters(&self, filter: &ClusterFilter) -> Result<Vec<StoryCluster>>;

    /// Set a consumer-owned top-level field on a cluster. Returns `false`
    /// when no cluster has that id.
    async fn annotate_cluster(
        &self,
        cluster_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<bool>;

    async fn insert_clustering_run(&self, run: &ClusteringRun) -> Result<()>;

    async fn clustering_runs(&self) -> Result<Vec<ClusteringRun>>;
}
