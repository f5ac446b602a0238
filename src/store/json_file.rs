// src/store/json_file.rs
//! Directory-backed store: one pretty-printed JSON array per collection.
//!
//! Reads are served from memory. Every mutation rewrites the affected
//! collection file through a temp file + rename, so a crash leaves either the
//! previous or the new file, never a torn one. Two mutations are two writes:
//! a snapshot delete and the following insert are not one atomic step.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::memory::{Collections, InMemoryStore};
use super::{ArticleStore, ClusterFilter};
use crate::models::{
    ClusteringRun, DedupFlagUpdate, DedupGroup, EmbeddedArticle, RawArticle, SnapshotKey,
    StoryCluster,
};
use crate::resolver::{CandidateQuery, RawArticleFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Raw,
    Embedded,
    DedupGroups,
    Clusters,
    Runs,
}

impl Collection {
    fn file_name(self) -> &'static str {
        match self {
            Collection::Raw => "articles_raw.json",
            Collection::Embedded => "articles_embedded.json",
            Collection::DedupGroups => "semantic_dedup_groups.json",
            Collection::Clusters => "story_clusters.json",
            Collection::Runs => "clustering_runs.json",
        }
    }
}

#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    mem: InMemoryStore,
}

impl JsonFileStore {
    /// Open (or create) a store directory and load every collection present.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating store dir {}", dir.display()))?;

        let collections = Collections {
            articles_raw: load(&dir, Collection::Raw).await?,
            articles_embedded: load(&dir, Collection::Embedded).await?,
            semantic_dedup_groups: load(&dir, Collection::DedupGroups).await?,
            story_clusters: load(&dir, Collection::Clusters).await?,
            clustering_runs: load(&dir, Collection::Runs).await?,
        };
        tracing::debug!(
            dir = %dir.display(),
            raw = collections.articles_raw.len(),
            embedded = collections.articles_embedded.len(),
            clusters = collections.story_clusters.len(),
            "json store opened"
        );

        Ok(Self {
            dir,
            mem: InMemoryStore::from_collections(collections),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn flush(&self, which: Collection) -> Result<()> {
        let bytes = self.mem.read(|c| match which {
            Collection::Raw => serde_json::to_vec_pretty(&c.articles_raw),
            Collection::Embedded => serde_json::to_vec_pretty(&c.articles_embedded),
            Collection::DedupGroups => serde_json::to_vec_pretty(&c.semantic_dedup_groups),
            Collection::Clusters => serde_json::to_vec_pretty(&c.story_clusters),
            Collection::Runs => serde_json::to_vec_pretty(&c.clustering_runs),
        })??;

        let path = self.dir.join(which.file_name());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

async fn load<T: DeserializeOwned>(dir: &Path, which: Collection) -> Result<Vec<T>> {
    let path = dir.join(which.file_name());
    match fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

#[async_trait]
impl ArticleStore for JsonFileStore {
    async fn insert_raw_articles(&self, articles: &[RawArticle]) -> Result<usize> {
        let n = self.mem.insert_raw_articles(articles).await?;
        if n > 0 {
            self.flush(Collection::Raw).await?;
        }
        Ok(n)
    }

    async fn raw_articles_pending_embedding(&self) -> Result<Vec<RawArticle>> {
        self.mem.raw_articles_pending_embedding().await
    }

    async fn mark_embedding_skipped(&self, raw_ids: &[String], reason: &str) -> Result<usize> {
        let n = self.mem.mark_embedding_skipped(raw_ids, reason).await?;
        if n > 0 {
            self.flush(Collection::Raw).await?;
        }
        Ok(n)
    }

    async fn find_raw_article_ids(&self, filter: &RawArticleFilter) -> Result<Vec<String>> {
        self.mem.find_raw_article_ids(filter).await
    }

    async fn insert_embedded_articles(&self, articles: &[EmbeddedArticle]) -> Result<usize> {
        let n = self.mem.insert_embedded_articles(articles).await?;
        if n > 0 {
            self.flush(Collection::Embedded).await?;
        }
        Ok(n)
    }

    async fn find_undeduped_articles(&self) -> Result<Vec<EmbeddedArticle>> {
        self.mem.find_undeduped_articles().await
    }

    async fn find_embedded_articles(&self, query: &CandidateQuery) -> Result<Vec<EmbeddedArticle>> {
        self.mem.find_embedded_articles(query).await
    }

    async fn get_embedded_articles(&self, ids: &[String]) -> Result<Vec<EmbeddedArticle>> {
        self.mem.get_embedded_articles(ids).await
    }

    async fn insert_dedup_group(&self, group: &DedupGroup) -> Result<()> {
        self.mem.insert_dedup_group(group).await?;
        self.flush(Collection::DedupGroups).await
    }

    async fn mark_dedup_members(&self, updates: &[DedupFlagUpdate]) -> Result<usize> {
        let n = self.mem.mark_dedup_members(updates).await?;
        if n > 0 {
            self.flush(Collection::Embedded).await?;
        }
        Ok(n)
    }

    async fn dedup_groups(&self) -> Result<Vec<DedupGroup>> {
        self.mem.dedup_groups().await
    }

    async fn delete_clusters(&self, key: &SnapshotKey) -> Result<usize> {
        let n = self.mem.delete_clusters(key).await?;
        if n > 0 {
            self.flush(Collection::Clusters).await?;
        }
        Ok(n)
    }

    async fn insert_clusters(&self, clusters: &[StoryCluster]) -> Result<usize> {
        let n = self.mem.insert_clusters(clusters).await?;
        if n > 0 {
            self.flush(Collection::Clusters).await?;
        }
        Ok(n)
    }

    async fn find_clusters(&self, filter: &ClusterFilter) -> Result<Vec<StoryCluster>> {
        self.mem.find_clusters(filter).await
    }

    async fn annotate_cluster(
        &self,
        cluster_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<bool> {
        let found = self.mem.annotate_cluster(cluster_id, field, value).await?;
        if found {
            self.flush(Collection::Clusters).await?;
        }
        Ok(found)
    }

    async fn insert_clustering_run(&self, run: &ClusteringRun) -> Result<()> {
        self.mem.insert_clustering_run(run).await?;
        self.flush(Collection::Runs).await
    }

    async fn clustering_runs(&self) -> Result<Vec<ClusteringRun>> {
        self.mem.clustering_runs().await
    }
}
