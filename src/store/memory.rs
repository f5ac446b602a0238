//! In-memory [`ArticleStore`] used by tests and as the working set of
//! [`JsonFileStore`](super::JsonFileStore).
//!
//! All collections live behind one `RwLock`, so every trait call observes a
//! consistent view. Insertion order is preserved.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::RwLock;

use super::{ArticleStore, ClusterFilter};
use crate::models::{
    ClusteringRun, DedupFlagUpdate, DedupGroup, EmbeddedArticle, RawArticle, SnapshotKey,
    StoryCluster, CLUSTER_RESERVED_FIELDS,
};
use crate::resolver::{CandidateQuery, RawArticleFilter};

/// Every collection the pipeline persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collections {
    #[serde(default)]
    pub articles_raw: Vec<RawArticle>,
    #[serde(default)]
    pub articles_embedded: Vec<EmbeddedArticle>,
    #[serde(default)]
    pub semantic_dedup_groups: Vec<DedupGroup>,
    #[serde(default)]
    pub story_clusters: Vec<StoryCluster>,
    #[serde(default)]
    pub clustering_runs: Vec<ClusteringRun>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Collections>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_collections(c: Collections) -> Self {
        Self {
            inner: RwLock::new(c),
        }
    }

    /// Run `f` against a read-locked view of the collections.
    pub fn read<R>(&self, f: impl FnOnce(&Collections) -> R) -> Result<R> {
        let guard = self.inner.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(f(&guard))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Collections) -> R) -> Result<R> {
        let mut guard = self.inner.write().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl ArticleStore for InMemoryStore {
    async fn insert_raw_articles(&self, articles: &[RawArticle]) -> Result<usize> {
        self.write(|c| {
            let mut keys: HashSet<(String, String)> = c
                .articles_raw
                .iter()
                .map(|a| (a.content_hash.clone(), a.entity_id.clone()))
                .collect();
            let mut ids: HashSet<String> = c.articles_raw.iter().map(|a| a.id.clone()).collect();
            let mut inserted = 0;
            for a in articles {
                let a = a.clone().with_derived_keys();
                if !keys.insert((a.content_hash.clone(), a.entity_id.clone())) {
                    continue;
                }
                if !ids.insert(a.id.clone()) {
                    continue;
                }
                c.articles_raw.push(a);
                inserted += 1;
            }
            Ok(inserted)
        })?
    }

    async fn raw_articles_pending_embedding(&self) -> Result<Vec<RawArticle>> {
        self.read(|c| {
            let embedded: HashSet<&str> = c
                .articles_embedded
                .iter()
                .map(|e| e.raw_article_id.as_str())
                .collect();
            c.articles_raw
                .iter()
                .filter(|r| r.embedding_skipped.is_none() && !embedded.contains(r.id.as_str()))
                .cloned()
                .collect()
        })
    }

    async fn mark_embedding_skipped(&self, raw_ids: &[String], reason: &str) -> Result<usize> {
        let wanted: HashSet<&str> = raw_ids.iter().map(String::as_str).collect();
        self.write(|c| {
            let mut updated = 0;
            for a in c
                .articles_raw
                .iter_mut()
                .filter(|a| wanted.contains(a.id.as_str()))
            {
                a.embedding_skipped = Some(reason.to_string());
                updated += 1;
            }
            updated
        })
    }

    async fn find_raw_article_ids(&self, filter: &RawArticleFilter) -> Result<Vec<String>> {
        self.read(|c| {
            c.articles_raw
                .iter()
                .filter(|a| filter.matches(a))
                .map(|a| a.id.clone())
                .collect()
        })
    }

    async fn insert_embedded_articles(&self, articles: &[EmbeddedArticle]) -> Result<usize> {
        self.write(|c| {
            let mut raw_ids: HashSet<String> = c
                .articles_embedded
                .iter()
                .map(|e| e.raw_article_id.clone())
                .collect();
            let mut inserted = 0;
            for a in articles {
                if raw_ids.insert(a.raw_article_id.clone()) {
                    c.articles_embedded.push(a.clone());
                    inserted += 1;
                }
            }
            Ok(inserted)
        })?
    }

    async fn find_undeduped_articles(&self) -> Result<Vec<EmbeddedArticle>> {
        self.read(|c| {
            c.articles_embedded
                .iter()
                .filter(|a| !a.processing.semantically_deduped)
                .cloned()
                .collect()
        })
    }

    async fn find_embedded_articles(&self, query: &CandidateQuery) -> Result<Vec<EmbeddedArticle>> {
        self.read(|c| {
            c.articles_embedded
                .iter()
                .filter(|a| query.matches(a))
                .cloned()
                .collect()
        })
    }

    async fn get_embedded_articles(&self, ids: &[String]) -> Result<Vec<EmbeddedArticle>> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.read(|c| {
            c.articles_embedded
                .iter()
                .filter(|a| wanted.contains(a.id.as_str()))
                .cloned()
                .collect()
        })
    }

    async fn insert_dedup_group(&self, group: &DedupGroup) -> Result<()> {
        self.write(|c| {
            if c
                .semantic_dedup_groups
                .iter()
                .any(|g| g.group_id == group.group_id)
            {
                bail!("dedup group {} already exists", group.group_id);
            }
            c.semantic_dedup_groups.push(group.clone());
            Ok(())
        })?
    }

    async fn mark_dedup_members(&self, updates: &[DedupFlagUpdate]) -> Result<usize> {
        self.write(|c| {
            let mut updated = 0;
            for u in updates {
                if let Some(a) = c
                    .articles_embedded
                    .iter_mut()
                    .find(|a| a.id == u.article_id)
                {
                    a.processing.semantically_deduped = true;
                    a.processing.dedup_group_id = Some(u.group_id.clone());
                    a.processing.is_canonical = u.is_canonical;
                    updated += 1;
                }
            }
            Ok(updated)
        })?
    }

    async fn dedup_groups(&self) -> Result<Vec<DedupGroup>> {
        self.read(|c| c.semantic_dedup_groups.clone())
    }

    async fn delete_clusters(&self, key: &SnapshotKey) -> Result<usize> {
        self.write(|c| {
            let before = c.story_clusters.len();
            c.story_clusters
                .retain(|s| !(s.entity_id == key.entity_id && s.window_days == key.window_days));
            before - c.story_clusters.len()
        })
    }

    async fn insert_clusters(&self, clusters: &[StoryCluster]) -> Result<usize> {
        self.write(|c| {
            let mut ids: HashSet<String> =
                c.story_clusters.iter().map(|s| s.cluster_id.clone()).collect();
            for s in clusters {
                if !ids.insert(s.cluster_id.clone()) {
                    bail!("story cluster {} already exists", s.cluster_id);
                }
            }
            c.story_clusters.extend(clusters.iter().cloned());
            Ok(clusters.len())
        })?
    }

    async fn find_clusters(&self, filter: &ClusterFilter) -> Result<Vec<StoryCluster>> {
        self.read(|c| {
            c.story_clusters
                .iter()
                .filter(|s| filter.matches(s))
                .cloned()
                .collect()
        })
    }

    async fn annotate_cluster(
        &self,
        cluster_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<bool> {
        if field.trim().is_empty() || CLUSTER_RESERVED_FIELDS.contains(&field) {
            bail!("field {field:?} is owned by clustering and cannot be annotated");
        }
        self.write(|c| {
            match c
                .story_clusters
                .iter_mut()
                .find(|s| s.cluster_id == cluster_id)
            {
                Some(s) => {
                    s.annotations.insert(field.to_string(), value);
                    true
                }
                None => false,
            }
        })
    }

    async fn insert_clustering_run(&self, run: &ClusteringRun) -> Result<()> {
        self.write(|c| c.clustering_runs.push(run.clone()))?;
        Ok(())
    }

    async fn clustering_runs(&self) -> Result<Vec<ClusteringRun>> {
        self.read(|c| c.clustering_runs.clone())
    }
}
