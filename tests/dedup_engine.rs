// tests/dedup_engine.rs
mod common;

use anyhow::{bail, Result};
use async_trait::async_trait;
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use story_resolver::config::DedupConfig;
use story_resolver::dedup::DedupEngine;
use story_resolver::models::{
    ClusteringRun, DedupFlagUpdate, DedupGroup, EmbeddedArticle, RawArticle, SnapshotKey,
    StoryCluster,
};
use story_resolver::resolver::{CandidateQuery, RawArticleFilter};
use story_resolver::store::ClusterFilter;
use story_resolver::{ArticleStore, InMemoryStore};

async fn all_embedded(store: &InMemoryStore) -> Vec<EmbeddedArticle> {
    store.read(|c| c.articles_embedded.clone()).unwrap()
}

/// Four same-entity articles within two hours: titles at cosine 0.75 and
/// bodies at 0.85 to the first one. Above semantic, below hard thresholds.
fn semantic_four() -> Vec<Doc> {
    vec![
        doc("base", "E", hours_ago(10), unit(0)).title_vec(unit(0)).text_len(400),
        doc("s1", "E", hours_ago(9), blend(0, 1, 0.85))
            .title_vec(blend(0, 1, 0.75))
            .text_len(1200),
        doc("s2", "E", hours_ago(9) + chrono::Duration::minutes(30), blend(0, 2, 0.85))
            .title_vec(blend(0, 2, 0.75))
            .text_len(800),
        doc("s3", "E", hours_ago(8), blend(0, 3, 0.85))
            .title_vec(blend(0, 3, 0.75))
            .text_len(300),
    ]
}

#[tokio::test]
async fn four_semantic_duplicates_form_one_group_with_longest_canonical() {
    let store = InMemoryStore::new();
    let docs = semantic_four();
    seed(&store, &docs).await;

    let cfg = DedupConfig::default();
    let summary = DedupEngine::new(&cfg).run(&store).await.unwrap();
    assert_eq!(summary.groups_created, 1);
    assert_eq!(summary.articles_grouped, 4);
    assert_eq!(summary.semantic_duplicates, 3);
    assert_eq!(summary.hard_duplicates, 0);

    let groups = store.dedup_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    let g = &groups[0];
    assert_eq!(g.group_size, 4);
    assert_eq!(g.canonical_article_id, docs[1].embedded_id());
    assert_eq!(g.dedup_version, "v1");
    assert_eq!(g.dedup_params.title_threshold, 0.70);
    assert!(g.member_article_ids.contains(&g.canonical_article_id));

    let arts = all_embedded(&store).await;
    assert!(arts.iter().all(|a| a.processing.semantically_deduped));
    assert!(arts
        .iter()
        .all(|a| a.processing.dedup_group_id.as_deref() == Some(g.group_id.as_str())));
    let canon: Vec<_> = arts.iter().filter(|a| a.processing.is_canonical).collect();
    assert_eq!(canon.len(), 1);
    assert_eq!(canon[0].id, docs[1].embedded_id());
}

#[tokio::test]
async fn hard_duplicates_are_classified_as_hard() {
    let store = InMemoryStore::new();
    seed(
        &store,
        &[
            doc("a", "E", hours_ago(5), unit(4)),
            doc("b", "E", hours_ago(4), unit(4)),
        ],
    )
    .await;

    DedupEngine::new(&DedupConfig::default()).run(&store).await.unwrap();
    let g = &store.dedup_groups().await.unwrap()[0];
    assert_eq!(g.hard_duplicate_ids.len(), 1);
    assert!(g.semantic_duplicate_ids.is_empty());
}

#[tokio::test]
async fn second_run_does_no_work() {
    let store = InMemoryStore::new();
    seed(&store, &semantic_four()).await;
    let cfg = DedupConfig::default();

    let first = DedupEngine::new(&cfg).run(&store).await.unwrap();
    let before = all_embedded(&store).await;
    let second = DedupEngine::new(&cfg).run(&store).await.unwrap();

    assert_eq!(first.groups_created, 1);
    assert_eq!(second.groups_created, 0);
    assert_eq!(second.candidates, 0);
    assert_eq!(store.dedup_groups().await.unwrap().len(), 1);
    assert_eq!(all_embedded(&store).await, before);
}

#[tokio::test]
async fn dissimilar_and_cross_entity_articles_stay_singletons() {
    let store = InMemoryStore::new();
    seed(
        &store,
        &[
            doc("a", "E", hours_ago(5), unit(0)),
            doc("other-entity", "F", hours_ago(5), unit(0)),
            doc("too-late", "E", hours_ago(5) + chrono::Duration::hours(49), unit(0)),
            doc("unrelated", "E", hours_ago(4), unit(5)),
        ],
    )
    .await;

    let summary = DedupEngine::new(&DedupConfig::default()).run(&store).await.unwrap();
    assert_eq!(summary.groups_created, 0);
    assert!(all_embedded(&store)
        .await
        .iter()
        .all(|a| !a.processing.semantically_deduped));
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let store = InMemoryStore::new();
    seed(&store, &semantic_four()).await;
    let cfg = DedupConfig {
        dry_run: true,
        ..DedupConfig::default()
    };

    let summary = DedupEngine::new(&cfg).run(&store).await.unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.groups_created, 1);
    assert!(store.dedup_groups().await.unwrap().is_empty());
    assert!(all_embedded(&store)
        .await
        .iter()
        .all(|a| !a.processing.semantically_deduped));
}

#[tokio::test]
async fn out_of_range_window_fails_before_any_write() {
    let store = InMemoryStore::new();
    seed(&store, &semantic_four()).await;
    let cfg = DedupConfig {
        time_window_hours: 9_000_000_000_000,
        ..DedupConfig::default()
    };

    assert!(DedupEngine::new(&cfg).run(&store).await.is_err());
    assert!(store.dedup_groups().await.unwrap().is_empty());
    assert!(all_embedded(&store)
        .await
        .iter()
        .all(|a| !a.processing.semantically_deduped));
}

/// Delegates to an in-memory store, failing the first N group inserts or
/// flag updates.
struct FlakyStore {
    inner: InMemoryStore,
    fail_group_inserts: AtomicUsize,
    fail_flag_updates: AtomicUsize,
}

impl FlakyStore {
    fn new(fail_group_inserts: usize, fail_flag_updates: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_group_inserts: AtomicUsize::new(fail_group_inserts),
            fail_flag_updates: AtomicUsize::new(fail_flag_updates),
        }
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ArticleStore for FlakyStore {
    async fn insert_raw_articles(&self, articles: &[RawArticle]) -> Result<usize> {
        self.inner.insert_raw_articles(articles).await
    }
    async fn raw_articles_pending_embedding(&self) -> Result<Vec<RawArticle>> {
        self.inner.raw_articles_pending_embedding().await
    }
    async fn mark_embedding_skipped(&self, raw_ids: &[String], reason: &str) -> Result<usize> {
        self.inner.mark_embedding_skipped(raw_ids, reason).await
    }
    async fn find_raw_article_ids(&self, filter: &RawArticleFilter) -> Result<Vec<String>> {
        self.inner.find_raw_article_ids(filter).await
    }
    async fn insert_embedded_articles(&self, articles: &[EmbeddedArticle]) -> Result<usize> {
        self.inner.insert_embedded_articles(articles).await
    }
    async fn find_undeduped_articles(&self) -> Result<Vec<EmbeddedArticle>> {
        self.inner.find_undeduped_articles().await
    }
    async fn find_embedded_articles(&self, query: &CandidateQuery) -> Result<Vec<EmbeddedArticle>> {
        self.inner.find_embedded_articles(query).await
    }
    async fn get_embedded_articles(&self, ids: &[String]) -> Result<Vec<EmbeddedArticle>> {
        self.inner.get_embedded_articles(ids).await
    }
    async fn insert_dedup_group(&self, group: &DedupGroup) -> Result<()> {
        if take_failure(&self.fail_group_inserts) {
            bail!("simulated write failure for {}", group.group_id);
        }
        self.inner.insert_dedup_group(group).await
    }
    async fn mark_dedup_members(&self, updates: &[DedupFlagUpdate]) -> Result<usize> {
        if take_failure(&self.fail_flag_updates) {
            bail!("simulated flag update failure");
        }
        self.inner.mark_dedup_members(updates).await
    }
    async fn dedup_groups(&self) -> Result<Vec<DedupGroup>> {
        self.inner.dedup_groups().await
    }
    async fn delete_clusters(&self, key: &SnapshotKey) -> Result<usize> {
        self.inner.delete_clusters(key).await
    }
    async fn insert_clusters(&self, clusters: &[StoryCluster]) -> Result<usize> {
        self.inner.insert_clusters(clusters).await
    }
    async fn find_clusters(&self, filter: &ClusterFilter) -> Result<Vec<StoryCluster>> {
        self.inner.find_clusters(filter).await
    }
    async fn annotate_cluster(
        &self,
        cluster_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<bool> {
        self.inner.annotate_cluster(cluster_id, field, value).await
    }
    async fn insert_clustering_run(&self, run: &ClusteringRun) -> Result<()> {
        self.inner.insert_clustering_run(run).await
    }
    async fn clustering_runs(&self) -> Result<Vec<ClusteringRun>> {
        self.inner.clustering_runs().await
    }
}

fn two_entity_pairs() -> Vec<Doc> {
    vec![
        doc("e1", "E", hours_ago(6), unit(0)),
        doc("e2", "E", hours_ago(5), unit(0)),
        doc("f1", "F", hours_ago(4), unit(1)),
        doc("f2", "F", hours_ago(3), unit(1)),
    ]
}

#[tokio::test]
async fn one_failed_group_does_not_block_the_next() {
    let store = FlakyStore::new(1, 0);
    seed(&store, &two_entity_pairs()).await;
    let cfg = DedupConfig::default();

    let summary = DedupEngine::new(&cfg).run(&store).await.unwrap();
    assert_eq!(summary.failed_groups, 1);
    assert_eq!(summary.groups_created, 1);
    let groups = store.dedup_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].entity_id, "F");

    // The failed group's articles were left unprocessed and are picked up again.
    let retry = DedupEngine::new(&cfg).run(&store).await.unwrap();
    assert_eq!(retry.failed_groups, 0);
    assert_eq!(retry.groups_created, 1);
    assert_eq!(store.dedup_groups().await.unwrap().len(), 2);
}

#[tokio::test]
async fn retry_completes_a_group_whose_flags_were_not_written() {
    let store = FlakyStore::new(0, 1);
    seed(&store, &two_entity_pairs()[..2]).await;
    let cfg = DedupConfig::default();

    let first = DedupEngine::new(&cfg).run(&store).await.unwrap();
    assert_eq!(first.failed_groups, 1);
    assert_eq!(store.dedup_groups().await.unwrap().len(), 1);

    let retry = DedupEngine::new(&cfg).run(&store).await.unwrap();
    assert_eq!(retry.failed_groups, 0);
    assert_eq!(retry.groups_created, 0);
    assert_eq!(retry.groups_healed, 1);
    assert_eq!(retry.articles_healed, 2);
    assert_eq!(store.dedup_groups().await.unwrap().len(), 1);
    assert!(store
        .inner
        .read(|c| c.articles_embedded.iter().all(|a| a.processing.semantically_deduped))
        .unwrap());
}

#[tokio::test]
async fn late_arrival_does_not_duplicate_a_half_written_group() {
    let store = FlakyStore::new(0, 1);
    let pairs = two_entity_pairs();
    seed(&store, &pairs[..2]).await;
    let cfg = DedupConfig::default();

    DedupEngine::new(&cfg).run(&store).await.unwrap();
    let recorded = store.dedup_groups().await.unwrap();
    assert_eq!(recorded.len(), 1);

    // A third copy of the story lands before the retry.
    let late = doc("e3", "E", hours_ago(4), unit(0));
    seed(&store, std::slice::from_ref(&late)).await;

    let retry = DedupEngine::new(&cfg).run(&store).await.unwrap();
    assert_eq!(retry.groups_healed, 1);
    assert_eq!(retry.groups_created, 0);

    let groups = store.dedup_groups().await.unwrap();
    assert_eq!(groups, recorded);

    let arts = all_embedded(&store.inner).await;
    for d in &pairs[..2] {
        let a = arts.iter().find(|a| a.id == d.embedded_id()).unwrap();
        assert_eq!(a.processing.dedup_group_id.as_deref(), Some(groups[0].group_id.as_str()));
    }
    assert_eq!(arts.iter().filter(|a| a.processing.is_canonical).count(), 1);
    let e3 = arts.iter().find(|a| a.id == late.embedded_id()).unwrap();
    assert!(!e3.processing.semantically_deduped);
}
