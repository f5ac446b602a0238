//! # Story clustering
//! For every `(entity, window)` pair: reset the snapshot key, resolve the
//! window's dedup-safe candidates, tag them, run DBSCAN over body vectors and
//! persist clusters that pass the size and cohesion floors.
//!
//! Tags are metadata only. The whole eligible set is clustered at once and
//! each accepted cluster is labelled with its dominant member tag.
//!
//! Pairs run sequentially. A failure inside one pair is logged and counted and
//! the run moves on to the next pair.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ClusteringConfig, TagRule};
use crate::dbscan::{Dbscan, Distance, NOISE};
use crate::models::{
    ClusterArticleRef, ClusterMetadata, ClusteringRun, ClusteringRunStats, EmbeddedArticle,
    Entity, RunStatus, SnapshotKey, StoryCluster, TimeWindow, WindowSpec, DEFAULT_TAG,
};
use crate::resolver::{dedup_safe_filter, resolve_raw_ids};
use crate::similarity::{centroid, cohesion};
use crate::snapshot::SnapshotWriter;
use crate::store::ArticleStore;
use crate::tagger::ArticleTagger;

/// What happened to one `(entity, window)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Skipped {
        reason: SkipReason,
        found: usize,
    },
    Clustered {
        accepted: usize,
        rejected: usize,
        articles_clustered: usize,
        noise: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    FewRawArticles,
    FewCandidates,
    FewEligible,
}

/// A candidate that made it into the vector matrix.
#[derive(Debug, Clone)]
struct Considered<'a> {
    article: &'a EmbeddedArticle,
    published: DateTime<Utc>,
    tag: String,
}

pub struct ClusteringEngine<'a> {
    cfg: &'a ClusteringConfig,
    tagger: ArticleTagger,
    dbscan: Dbscan,
}

impl<'a> ClusteringEngine<'a> {
    pub fn new(cfg: &'a ClusteringConfig, tags: &[TagRule]) -> Self {
        Self {
            cfg,
            tagger: ArticleTagger::new(tags),
            dbscan: Dbscan::new(cfg.eps, cfg.min_samples).with_metric(Distance::Cosine),
        }
    }

    pub fn run_id_for(now: DateTime<Utc>) -> String {
        format!("run_{}", now.format("%Y%m%dT%H%M%SZ"))
    }

    /// Process every configured window for every entity, then record the run.
    pub async fn run(
        &self,
        store: &dyn ArticleStore,
        entities: &[Entity],
        now: DateTime<Utc>,
    ) -> Result<ClusteringRun> {
        crate::metrics::ensure_metrics_described();

        let run_id = Self::run_id_for(now);
        let mut stats = ClusteringRunStats {
            entities: entities.len(),
            ..ClusteringRunStats::default()
        };
        info!(
            target: "clustering",
            %run_id,
            entities = entities.len(),
            windows = self.cfg.windows.len(),
            "clustering run started"
        );

        for entity in entities {
            for window in &self.cfg.windows {
                let started = Instant::now();
                let outcome = self.process_pair(store, entity, window, now, &run_id).await;
                histogram!("clustering_window_ms").record(started.elapsed().as_secs_f64() * 1000.0);
                counter!("clustering_windows_total").increment(1);

                match outcome {
                    Ok(PairOutcome::Skipped { reason, found }) => {
                        info!(
                            target: "clustering",
                            entity_id = %entity.entity_id,
                            window_days = window.days,
                            ?reason,
                            found,
                            min_articles = window.min_articles,
                            "window skipped"
                        );
                        counter!("clustering_windows_skipped_total").increment(1);
                        stats.windows_skipped += 1;
                    }
                    Ok(PairOutcome::Clustered {
                        accepted,
                        rejected,
                        articles_clustered,
                        noise,
                    }) => {
                        info!(
                            target: "clustering",
                            entity_id = %entity.entity_id,
                            window_days = window.days,
                            accepted,
                            rejected,
                            noise,
                            "window clustered"
                        );
                        stats.windows_processed += 1;
                        stats.clusters_created += accepted;
                        stats.clusters_rejected += rejected;
                        stats.articles_clustered += articles_clustered;
                        stats.noise_articles += noise;
                    }
                    Err(e) => {
                        warn!(
                            target: "clustering",
                            entity_id = %entity.entity_id,
                            window_days = window.days,
                            error = %e,
                            "window failed"
                        );
                        counter!("clustering_window_failures_total").increment(1);
                        stats.windows_failed += 1;
                    }
                }
            }
        }

        let run = ClusteringRun {
            run_id,
            run_timestamp: now,
            config: self.cfg.run_config(),
            stats,
            status: RunStatus::Completed,
        };
        store
            .insert_clustering_run(&run)
            .await
            .with_context(|| format!("recording clustering run {}", run.run_id))?;

        info!(
            target: "clustering",
            run_id = %run.run_id,
            processed = run.stats.windows_processed,
            skipped = run.stats.windows_skipped,
            failed = run.stats.windows_failed,
            clusters = run.stats.clusters_created,
            rejected = run.stats.clusters_rejected,
            "clustering run complete"
        );
        Ok(run)
    }

    /// One `(entity, window)` pair. Once the window bounds are known the
    /// snapshot key is cleared before anything else, so a skip or a later
    /// failure leaves it empty.
    pub async fn process_pair(
        &self,
        store: &dyn ArticleStore,
        entity: &Entity,
        window: &WindowSpec,
        now: DateTime<Utc>,
        run_id: &str,
    ) -> Result<PairOutcome> {
        let time_window = window_ending_at(now, window.days)?;
        let key = SnapshotKey::new(entity.entity_id.clone(), window.days);
        let writer = SnapshotWriter::new(store);
        writer.reset(&key).await?;

        let raw_ids =
            resolve_raw_ids(store, entity, time_window.start_utc, time_window.end_utc).await?;
        if raw_ids.len() < window.min_articles {
            return Ok(PairOutcome::Skipped {
                reason: SkipReason::FewRawArticles,
                found: raw_ids.len(),
            });
        }

        let candidates = store
            .find_embedded_articles(&dedup_safe_filter(raw_ids))
            .await?;
        if candidates.len() < window.min_articles {
            return Ok(PairOutcome::Skipped {
                reason: SkipReason::FewCandidates,
                found: candidates.len(),
            });
        }

        let considered = self.considered(&candidates, &time_window);
        if considered.len() < window.min_articles {
            return Ok(PairOutcome::Skipped {
                reason: SkipReason::FewEligible,
                found: considered.len(),
            });
        }

        let vectors: Vec<&[f32]> = considered
            .iter()
            .map(|c| c.article.embeddings.body.as_slice())
            .collect();
        let labels = self.dbscan.fit_predict(&vectors)?;

        let mut by_label: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        let mut noise = 0;
        for (i, &label) in labels.iter().enumerate() {
            if label == NOISE {
                noise += 1;
            } else {
                by_label.entry(label).or_default().push(i);
            }
        }
        counter!("clustering_noise_articles_total").increment(noise as u64);

        let mut accepted = Vec::new();
        let mut rejected = 0;
        for (label, members) in by_label {
            if members.len() < self.cfg.min_story_size {
                debug!(target: "clustering", label, size = members.len(), "cluster below min size");
                rejected += 1;
                continue;
            }
            let member_vecs: Vec<&[f32]> = members.iter().map(|&i| vectors[i]).collect();
            let center = centroid(&member_vecs)?;
            let score = cohesion(&member_vecs, &center)?;
            if score < self.cfg.min_cohesion {
                debug!(target: "clustering", label, cohesion = score, "cluster below min cohesion");
                rejected += 1;
                continue;
            }

            let picked: Vec<&Considered> = members.iter().map(|&i| &considered[i]).collect();
            accepted.push(self.build_cluster(
                entity,
                window.days,
                &time_window,
                run_id,
                now,
                accepted.len(),
                &picked,
                center,
                score,
            ));
        }
        counter!("clustering_clusters_rejected_total").increment(rejected as u64);

        writer.write(&key, &accepted).await?;
        counter!("clustering_clusters_accepted_total").increment(accepted.len() as u64);

        Ok(PairOutcome::Clustered {
            articles_clustered: accepted.iter().map(StoryCluster::size).sum(),
            accepted: accepted.len(),
            rejected,
            noise,
        })
    }

    /// Tag, drop excluded tags and articles that cannot be placed in the
    /// window, then order by `(published_at, id)`.
    fn considered<'c>(
        &self,
        candidates: &'c [EmbeddedArticle],
        time_window: &TimeWindow,
    ) -> Vec<Considered<'c>> {
        let excluded: HashSet<&str> = self.cfg.exclude_tags.iter().map(String::as_str).collect();
        let dims = majority_dims(candidates, time_window);

        let mut out: Vec<Considered> = candidates
            .iter()
            .filter_map(|a| {
                let published = a.published_at_utc.filter(|ts| time_window.contains(*ts))?;
                if a.embeddings.body.is_empty() || Some(a.embeddings.body.len()) != dims {
                    debug!(target: "clustering", article_id = %a.id, "no usable body vector");
                    return None;
                }
                let tag = if self.cfg.tagging {
                    self.tagger.tag(&a.title, &a.body_text).to_string()
                } else {
                    DEFAULT_TAG.to_string()
                };
                if excluded.contains(tag.as_str()) {
                    return None;
                }
                Some(Considered {
                    article: a,
                    published,
                    tag,
                })
            })
            .collect();

        out.sort_by(|x, y| {
            x.published
                .cmp(&y.published)
                .then_with(|| x.article.id.cmp(&y.article.id))
        });
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn build_cluster(
        &self,
        entity: &Entity,
        window_days: u32,
        time_window: &TimeWindow,
        run_id: &str,
        now: DateTime<Utc>,
        ordinal: usize,
        members: &[&Considered],
        center: Vec<f32>,
        score: f32,
    ) -> StoryCluster {
        let mut tag_counts: BTreeMap<String, usize> = BTreeMap::new();
        for m in members {
            *tag_counts.entry(m.tag.clone()).or_default() += 1;
        }
        let tag = self.dominant_tag(&tag_counts);

        let first = members.iter().map(|m| m.published).min();
        let last = members.iter().map(|m| m.published).max();
        let duration_hours = match (first, last) {
            (Some(f), Some(l)) => Some((l - f).num_seconds() as f64 / 3600.0),
            _ => None,
        };
        let size = members.len();
        let velocity = duration_hours.map(|h| if h > 0.0 { size as f64 / h } else { size as f64 });

        let cluster_id = format!(
            "{}|{}|{}d|{}|{}",
            entity.entity_id,
            tag,
            window_days,
            now.format("%Y%m%d"),
            ordinal
        );

        StoryCluster {
            cluster_id,
            run_id: run_id.to_string(),
            entity_id: entity.entity_id.clone(),
            entity_name: entity.name.clone(),
            entity_type: entity.entity_type.clone(),
            ticker: entity.ticker.clone(),
            window_days,
            tag,
            time_window: *time_window,
            articles: members
                .iter()
                .map(|m| ClusterArticleRef {
                    article_id: m.article.id.clone(),
                    raw_article_id: m.article.raw_article_id.clone(),
                    title: m.article.title.clone(),
                    published_at_utc: Some(m.published),
                    tag: m.tag.clone(),
                })
                .collect(),
            centroid: center,
            cohesion: score,
            cluster_metadata: ClusterMetadata {
                size,
                first_published: first,
                last_published: last,
                duration_hours,
                velocity,
                tag_counts,
            },
            created_at: now,
            last_updated: now,
            annotations: BTreeMap::new(),
        }
    }

    /// Most frequent tag; ties go to the earlier tag in configured order.
    fn dominant_tag(&self, counts: &BTreeMap<String, usize>) -> String {
        counts
            .iter()
            .min_by(|(ta, ca), (tb, cb)| {
                cb.cmp(ca)
                    .then_with(|| self.tagger.rank(ta).cmp(&self.tagger.rank(tb)))
                    .then_with(|| ta.cmp(tb))
            })
            .map(|(t, _)| t.clone())
            .unwrap_or_else(|| DEFAULT_TAG.to_string())
    }
}

/// `[now - days, now)`. Errors when the start falls outside the
/// representable date range.
pub fn window_ending_at(now: DateTime<Utc>, days: u32) -> Result<TimeWindow> {
    let start_utc = Duration::try_days(i64::from(days))
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| anyhow!("{days}d window ending at {now} is out of range"))?;
    Ok(TimeWindow {
        start_utc,
        end_utc: now,
    })
}

/// Most common body vector length among in-window candidates; ties go to the
/// longer length. Articles with any other length are left out of the matrix.
fn majority_dims(candidates: &[EmbeddedArticle], time_window: &TimeWindow) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for a in candidates {
        let n = a.embeddings.body.len();
        if n > 0 && a.published_at_utc.is_some_and(|ts| time_window.contains(ts)) {
            *counts.entry(n).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|(da, ca), (db, cb)| ca.cmp(cb).then_with(|| da.cmp(db)))
        .map(|(dims, _)| dims)
}
