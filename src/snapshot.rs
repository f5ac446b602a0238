//! # Story cluster snapshots
//! Write side: [`SnapshotWriter`] is the only path that mutates story
//! clusters. Replacement is delete-then-insert per `(entity_id, window_days)`
//! key; a crash between the two leaves that key empty until the next run.
//!
//! Read side: helpers for downstream consumers (quality scoring, stance
//! resolution), which read clusters and may attach their own top-level fields
//! through [`annotate_cluster`] but never touch clustering-owned fields.

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::models::{EmbeddedArticle, SnapshotKey, StoryCluster};
use crate::store::{ArticleStore, ClusterFilter};

pub struct SnapshotWriter<'a> {
    store: &'a dyn ArticleStore,
}

impl<'a> SnapshotWriter<'a> {
    pub fn new(store: &'a dyn ArticleStore) -> Self {
        Self { store }
    }

    /// Drop every cluster stored under `key`. Returns how many were removed.
    pub async fn reset(&self, key: &SnapshotKey) -> Result<usize> {
        let removed = self.store.delete_clusters(key).await?;
        debug!(target: "clustering", %key, removed, "snapshot reset");
        Ok(removed)
    }

    /// Insert the new snapshot for a key that has just been reset.
    pub async fn write(&self, key: &SnapshotKey, clusters: &[StoryCluster]) -> Result<usize> {
        if let Some(stray) = clusters.iter().find(|c| &c.key() != key) {
            bail!(
                "cluster {} belongs to {} and cannot be written under {key}",
                stray.cluster_id,
                stray.key()
            );
        }
        if clusters.is_empty() {
            return Ok(0);
        }
        self.store.insert_clusters(clusters).await
    }

    /// Reset then write. Returns `(removed, inserted)`.
    pub async fn replace(
        &self,
        key: &SnapshotKey,
        clusters: &[StoryCluster],
    ) -> Result<(usize, usize)> {
        let removed = self.reset(key).await?;
        let inserted = self.write(key, clusters).await?;
        Ok((removed, inserted))
    }
}

/// Clusters for one entity with at least `min_size` members, largest first.
pub async fn clusters_for_entity(
    store: &dyn ArticleStore,
    entity_id: &str,
    window_days: Option<u32>,
    min_size: usize,
) -> Result<Vec<StoryCluster>> {
    let mut clusters = store
        .find_clusters(&ClusterFilter {
            entity_id: Some(entity_id.to_string()),
            window_days,
            min_size,
            ..ClusterFilter::default()
        })
        .await?;
    clusters.sort_by(|a, b| {
        b.size()
            .cmp(&a.size())
            .then_with(|| a.window_days.cmp(&b.window_days))
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });
    Ok(clusters)
}

pub async fn clusters_by_tag(
    store: &dyn ArticleStore,
    tag: &str,
    window_days: Option<u32>,
) -> Result<Vec<StoryCluster>> {
    store
        .find_clusters(&ClusterFilter {
            tag: Some(tag.to_string()),
            window_days,
            ..ClusterFilter::default()
        })
        .await
}

/// Member embedded articles in the cluster's own order. Members that no
/// longer exist in the store are skipped.
pub async fn articles_for_cluster(
    store: &dyn ArticleStore,
    cluster: &StoryCluster,
) -> Result<Vec<EmbeddedArticle>> {
    let ids: Vec<String> = cluster.articles.iter().map(|a| a.article_id.clone()).collect();
    let mut by_id: HashMap<String, EmbeddedArticle> = store
        .get_embedded_articles(&ids)
        .await?
        .into_iter()
        .map(|a| (a.id.clone(), a))
        .collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

/// Attach a consumer-owned top-level field to a cluster.
pub async fn annotate_cluster(
    store: &dyn ArticleStore,
    cluster_id: &str,
    field: &str,
    value: serde_json::Value,
) -> Result<()> {
    if !store.annotate_cluster(cluster_id, field, value).await? {
        bail!("story cluster {cluster_id} not found");
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
    pub total: usize,
    pub articles: usize,
    pub by_tag: BTreeMap<String, usize>,
    pub by_entity: BTreeMap<String, usize>,
    pub by_window: BTreeMap<u32, usize>,
}

pub async fn snapshot_stats(store: &dyn ArticleStore) -> Result<SnapshotStats> {
    let clusters = store.find_clusters(&ClusterFilter::default()).await?;
    let mut stats = SnapshotStats::default();
    for c in &clusters {
        stats.total += 1;
        stats.articles += c.size();
        *stats.by_tag.entry(c.tag.clone()).or_default() += 1;
        *stats.by_entity.entry(c.entity_id.clone()).or_default() += 1;
        *stats.by_window.entry(c.window_days).or_default() += 1;
    }
    Ok(stats)
}

/// Integrity findings over the stored snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotAudit {
    pub duplicate_cluster_ids: Vec<String>,
    /// Keys holding clusters from more than one run: a stale snapshot survived.
    pub mixed_run_keys: Vec<(SnapshotKey, Vec<String>)>,
}

impl SnapshotAudit {
    pub fn is_clean(&self) -> bool {
        self.duplicate_cluster_ids.is_empty() && self.mixed_run_keys.is_empty()
    }
}

pub async fn audit_snapshots(store: &dyn ArticleStore) -> Result<SnapshotAudit> {
    let clusters = store.find_clusters(&ClusterFilter::default()).await?;

    let mut seen = BTreeSet::new();
    let mut dups = BTreeSet::new();
    let mut runs: BTreeMap<SnapshotKey, BTreeSet<String>> = BTreeMap::new();
    for c in &clusters {
        if !seen.insert(c.cluster_id.as_str()) {
            dups.insert(c.cluster_id.clone());
        }
        runs.entry(c.key()).or_default().insert(c.run_id.clone());
    }

    let audit = SnapshotAudit {
        duplicate_cluster_ids: dups.into_iter().collect(),
        mixed_run_keys: runs
            .into_iter()
            .filter(|(_, r)| r.len() > 1)
            .map(|(k, r)| (k, r.into_iter().collect()))
            .collect(),
    };
    if !audit.is_clean() {
        warn!(
            target: "clustering",
            duplicates = audit.duplicate_cluster_ids.len(),
            mixed_keys = audit.mixed_run_keys.len(),
            "snapshot audit found problems"
        );
    }
    Ok(audit)
}
