//! # Semantic deduplication
//! Groups not-yet-processed embedded articles that report the same real-world
//! story, picks one canonical member per group and flags every member.
//!
//! Policy, in publication order: each unprocessed article opens a group and
//! scans forward over same-entity articles inside the time window. A candidate
//! joins as a *hard* duplicate when title and body similarity both reach the
//! hard thresholds, otherwise as a *semantic* duplicate when both reach the
//! semantic thresholds. Singletons produce no record. The canonical member has
//! the longest raw text (earliest published wins ties).
//!
//! Only articles with `semantically_deduped != true` are loaded, so a second
//! run over unchanged data does no work. An unflagged article that an
//! existing group record already lists (its flags were never written) is
//! healed from that record and never regrouped.

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use metrics::counter;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::config::DedupConfig;
use crate::models::{hex_prefix, DedupFlagUpdate, DedupGroup, DedupParams, EmbeddedArticle};
use crate::similarity::cosine_similarity;
use crate::store::ArticleStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    Hard,
    Semantic,
}

/// A group found by [`plan_groups`], not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedGroup {
    pub group_id: String,
    pub entity_id: String,
    pub entity_name: String,
    pub ticker: Option<String>,
    /// Member ids in publication order; the base article comes first.
    pub member_ids: Vec<String>,
    pub hard_duplicate_ids: Vec<String>,
    pub semantic_duplicate_ids: Vec<String>,
    pub canonical_id: String,
}

impl PlannedGroup {
    pub fn flag_updates(&self) -> Vec<DedupFlagUpdate> {
        self.member_ids
            .iter()
            .map(|id| DedupFlagUpdate {
                article_id: id.clone(),
                group_id: self.group_id.clone(),
                is_canonical: *id == self.canonical_id,
            })
            .collect()
    }

    fn into_record(self, cfg: &DedupConfig) -> DedupGroup {
        DedupGroup {
            group_size: self.member_ids.len(),
            group_id: self.group_id,
            dedup_version: cfg.dedup_version.clone(),
            entity_id: self.entity_id,
            entity_name: self.entity_name,
            ticker: self.ticker,
            canonical_article_id: self.canonical_id,
            member_article_ids: self.member_ids,
            hard_duplicate_ids: self.hard_duplicate_ids,
            semantic_duplicate_ids: self.semantic_duplicate_ids,
            dedup_params: params_of(cfg),
            created_at: Utc::now(),
        }
    }
}

pub fn params_of(cfg: &DedupConfig) -> DedupParams {
    DedupParams {
        title_threshold: cfg.title_threshold,
        body_threshold: cfg.body_threshold,
        hard_dup_title: cfg.hard_title_threshold,
        hard_dup_body: cfg.hard_body_threshold,
        time_window_hours: cfg.time_window_hours,
    }
}

/// Outcome of [`plan_groups`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupPlan {
    pub groups: Vec<PlannedGroup>,
    /// Articles without a timestamp or a vector; never compared.
    pub ineligible: usize,
}

/// Classify one candidate against its base. `None` = not a duplicate.
pub fn classify(
    base: &EmbeddedArticle,
    candidate: &EmbeddedArticle,
    cfg: &DedupConfig,
) -> Result<Option<DuplicateKind>> {
    let title_sim = cosine_similarity(&base.embeddings.title, &candidate.embeddings.title)?;
    let body_sim = cosine_similarity(&base.embeddings.body, &candidate.embeddings.body)?;

    if title_sim >= cfg.hard_title_threshold && body_sim >= cfg.hard_body_threshold {
        return Ok(Some(DuplicateKind::Hard));
    }
    if title_sim >= cfg.title_threshold && body_sim >= cfg.body_threshold {
        return Ok(Some(DuplicateKind::Semantic));
    }
    Ok(None)
}

fn is_eligible(a: &EmbeddedArticle) -> bool {
    a.published_at_utc.is_some()
        && !a.embeddings.title.is_empty()
        && !a.embeddings.body.is_empty()
        && !a.id.is_empty()
}

/// Pure grouping pass over unprocessed articles. No I/O.
pub fn plan_groups(articles: &[EmbeddedArticle], cfg: &DedupConfig) -> Result<DedupPlan> {
    let window = Duration::try_hours(cfg.time_window_hours).ok_or_else(|| {
        anyhow!("dedup.time_window_hours {} is out of range", cfg.time_window_hours)
    })?;

    let mut eligible: Vec<&EmbeddedArticle> = articles.iter().filter(|a| is_eligible(a)).collect();
    let ineligible = articles.len() - eligible.len();
    eligible.sort_by(|a, b| {
        a.published_at_utc
            .cmp(&b.published_at_utc)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut processed = vec![false; eligible.len()];
    let mut groups = Vec::new();

    for i in 0..eligible.len() {
        if processed[i] {
            continue;
        }
        let base = eligible[i];
        let Some(base_ts) = base.published_at_utc else {
            continue;
        };

        let mut members = vec![i];
        let mut hard = Vec::new();
        let mut semantic = Vec::new();

        for j in (i + 1)..eligible.len() {
            if processed[j] {
                continue;
            }
            let cand = eligible[j];
            let Some(cand_ts) = cand.published_at_utc else {
                continue;
            };
            // Sorted ascending: everything after this is further away.
            if cand_ts - base_ts > window {
                break;
            }
            if cand.entity_id != base.entity_id {
                continue;
            }

            match classify(base, cand, cfg) {
                Ok(Some(kind)) => {
                    processed[j] = true;
                    members.push(j);
                    match kind {
                        DuplicateKind::Hard => hard.push(cand.id.clone()),
                        DuplicateKind::Semantic => semantic.push(cand.id.clone()),
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(
                        target: "dedup",
                        base = %base.id,
                        candidate = %cand.id,
                        error = %e,
                        "comparison skipped"
                    );
                }
            }
        }

        if members.len() < 2 {
            continue;
        }
        processed[i] = true;

        // Longest text wins; strict `>` keeps the earliest on ties.
        let mut canonical = members[0];
        for &m in &members[1..] {
            if eligible[m].text_length > eligible[canonical].text_length {
                canonical = m;
            }
        }

        let member_ids: Vec<String> = members.iter().map(|&m| eligible[m].id.clone()).collect();
        groups.push(PlannedGroup {
            group_id: group_id_for(&base.entity_id, &member_ids),
            entity_id: base.entity_id.clone(),
            entity_name: base.entity_name.clone(),
            ticker: base.ticker.clone(),
            canonical_id: eligible[canonical].id.clone(),
            member_ids,
            hard_duplicate_ids: hard,
            semantic_duplicate_ids: semantic,
        });
    }

    Ok(DedupPlan { groups, ineligible })
}

/// `dg_` + 16 hex chars of SHA-256 over entity id and ordered member ids.
pub fn group_id_for(entity_id: &str, member_ids: &[String]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(entity_id.as_bytes());
    for id in member_ids {
        hasher.update(b"\x1f");
        hasher.update(id.as_bytes());
    }
    format!("dg_{}", hex_prefix(&hasher.finalize(), 8))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupSummary {
    pub candidates: usize,
    pub ineligible: usize,
    /// Recorded groups whose missing member flags were written this run.
    pub groups_healed: usize,
    pub articles_healed: usize,
    pub groups_created: usize,
    pub articles_grouped: usize,
    pub hard_duplicates: usize,
    pub semantic_duplicates: usize,
    pub failed_groups: usize,
    pub dry_run: bool,
}

pub struct DedupEngine<'a> {
    cfg: &'a DedupConfig,
}

impl<'a> DedupEngine<'a> {
    pub fn new(cfg: &'a DedupConfig) -> Self {
        Self { cfg }
    }

    /// Load unprocessed articles, group them and persist each group
    /// independently. A failed group is logged and counted; later groups
    /// still run.
    pub async fn run(&self, store: &dyn ArticleStore) -> Result<DedupSummary> {
        crate::metrics::ensure_metrics_described();

        let articles = store.find_undeduped_articles().await?;
        info!(target: "dedup", candidates = articles.len(), "loaded unprocessed articles");

        let candidates = articles.len();
        let existing = store.dedup_groups().await?;
        let (heals, fresh) = split_recorded(articles, &existing);
        let plan = plan_groups(&fresh, self.cfg)?;

        let mut summary = DedupSummary {
            candidates,
            ineligible: plan.ineligible,
            dry_run: self.cfg.dry_run,
            ..DedupSummary::default()
        };
        counter!("dedup_ineligible_total").increment(plan.ineligible as u64);

        for (group_id, updates) in heals {
            if self.cfg.dry_run {
                info!(target: "dedup", %group_id, members = updates.len(), "dry run: heal not written");
                summary.groups_healed += 1;
                summary.articles_healed += updates.len();
                continue;
            }
            match store.mark_dedup_members(&updates).await {
                Ok(_) => {
                    debug!(target: "dedup", %group_id, members = updates.len(), "group flags healed");
                    summary.groups_healed += 1;
                    summary.articles_healed += updates.len();
                }
                Err(e) => {
                    warn!(target: "dedup", %group_id, error = %e, "healing group flags failed");
                    counter!("dedup_group_failures_total").increment(1);
                    summary.failed_groups += 1;
                }
            }
        }

        if self.cfg.dry_run {
            for g in &plan.groups {
                info!(
                    target: "dedup",
                    group_id = %g.group_id,
                    entity_id = %g.entity_id,
                    size = g.member_ids.len(),
                    canonical = %g.canonical_id,
                    "dry run: group not written"
                );
                summary.groups_created += 1;
                summary.articles_grouped += g.member_ids.len();
                summary.hard_duplicates += g.hard_duplicate_ids.len();
                summary.semantic_duplicates += g.semantic_duplicate_ids.len();
            }
            return Ok(summary);
        }

        for g in plan.groups {
            let size = g.member_ids.len();
            let hard = g.hard_duplicate_ids.len();
            let semantic = g.semantic_duplicate_ids.len();
            let group_id = g.group_id.clone();

            match self.persist(store, g).await {
                Ok(()) => {
                    debug!(target: "dedup", %group_id, size, hard, semantic, "group persisted");
                    summary.groups_created += 1;
                    summary.articles_grouped += size;
                    summary.hard_duplicates += hard;
                    summary.semantic_duplicates += semantic;
                }
                Err(e) => {
                    warn!(target: "dedup", %group_id, error = %e, "group persistence failed");
                    counter!("dedup_group_failures_total").increment(1);
                    summary.failed_groups += 1;
                }
            }
        }

        counter!("dedup_groups_created_total").increment(summary.groups_created as u64);
        counter!("dedup_articles_grouped_total").increment(summary.articles_grouped as u64);

        info!(
            target: "dedup",
            groups_created = summary.groups_created,
            groups_healed = summary.groups_healed,
            articles_grouped = summary.articles_grouped,
            hard = summary.hard_duplicates,
            semantic = summary.semantic_duplicates,
            ineligible = summary.ineligible,
            failed = summary.failed_groups,
            "semantic dedup complete"
        );
        Ok(summary)
    }

    async fn persist(&self, store: &dyn ArticleStore, group: PlannedGroup) -> Result<()> {
        let updates = group.flag_updates();
        store.insert_dedup_group(&group.into_record(self.cfg)).await?;
        store.mark_dedup_members(&updates).await?;
        Ok(())
    }
}

/// Separate unflagged articles that an existing group already lists from the
/// ones still to be grouped. Listed articles get the flags their record
/// implies, keyed by group id.
pub fn split_recorded(
    articles: Vec<EmbeddedArticle>,
    existing: &[DedupGroup],
) -> (BTreeMap<String, Vec<DedupFlagUpdate>>, Vec<EmbeddedArticle>) {
    let mut owner: HashMap<&str, &DedupGroup> = HashMap::new();
    for g in existing {
        for id in &g.member_article_ids {
            owner.entry(id.as_str()).or_insert(g);
        }
    }

    let mut heals: BTreeMap<String, Vec<DedupFlagUpdate>> = BTreeMap::new();
    let mut fresh = Vec::new();
    for a in articles {
        match owner.get(a.id.as_str()) {
            Some(g) => heals.entry(g.group_id.clone()).or_default().push(DedupFlagUpdate {
                is_canonical: a.id == g.canonical_article_id,
                article_id: a.id,
                group_id: g.group_id.clone(),
            }),
            None => fresh.push(a),
        }
    }
    (heals, fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArticleEmbeddings, ProcessingFlags};
    use chrono::{DateTime, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 20, 9, 0, 0).unwrap()
    }

    fn art(id: &str, entity: &str, mins: i64, title: Vec<f32>, body: Vec<f32>, len: usize) -> EmbeddedArticle {
        EmbeddedArticle {
            id: id.into(),
            raw_article_id: format!("raw-{id}"),
            entity_id: entity.into(),
            entity_name: entity.into(),
            entity_type: "company".into(),
            ticker: None,
            title: id.into(),
            body_text: String::new(),
            url: None,
            text_length: len,
            embeddings: ArticleEmbeddings {
                title,
                body,
                model: "test".into(),
                embedded_at: None,
            },
            published_at_utc: Some(t0() + Duration::minutes(mins)),
            ingested_at: t0(),
            processing: ProcessingFlags::default(),
        }
    }

    fn e(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; 4];
        v[i] = 1.0;
        v
    }

    #[test]
    fn hard_duplicates_group_with_longest_canonical() {
        let cfg = DedupConfig::default();
        let arts = vec![
            art("a", "E", 0, e(0), e(1), 100),
            art("b", "E", 30, e(0), e(1), 500),
            art("c", "E", 60, e(2), e(3), 900),
        ];
        let plan = plan_groups(&arts, &cfg).unwrap();
        assert_eq!(plan.groups.len(), 1);
        let g = &plan.groups[0];
        assert_eq!(g.member_ids, vec!["a", "b"]);
        assert_eq!(g.hard_duplicate_ids, vec!["b"]);
        assert!(g.semantic_duplicate_ids.is_empty());
        assert_eq!(g.canonical_id, "b");
    }

    #[test]
    fn canonical_tie_goes_to_earliest() {
        let cfg = DedupConfig::default();
        let arts = vec![
            art("late", "E", 90, e(0), e(1), 300),
            art("early", "E", 10, e(0), e(1), 300),
        ];
        let plan = plan_groups(&arts, &cfg).unwrap();
        assert_eq!(plan.groups[0].canonical_id, "early");
    }

    #[test]
    fn never_crosses_entities_or_the_time_window() {
        let cfg = DedupConfig {
            time_window_hours: 2,
            ..DedupConfig::default()
        };
        let arts = vec![
            art("a", "E", 0, e(0), e(1), 10),
            art("x", "F", 5, e(0), e(1), 10),
            art("far", "E", 3 * 60, e(0), e(1), 10),
        ];
        let plan = plan_groups(&arts, &cfg).unwrap();
        assert!(plan.groups.is_empty());
    }

    #[test]
    fn ineligible_articles_are_counted_not_compared() {
        let cfg = DedupConfig::default();
        let mut no_ts = art("n", "E", 0, e(0), e(1), 10);
        no_ts.published_at_utc = None;
        let no_vec = art("v", "E", 0, vec![], e(1), 10);
        let arts = vec![no_ts, no_vec, art("a", "E", 1, e(0), e(1), 10)];
        let plan = plan_groups(&arts, &cfg).unwrap();
        assert_eq!(plan.ineligible, 2);
        assert!(plan.groups.is_empty());
    }

    #[test]
    fn mismatched_dims_skip_the_pair_only() {
        let cfg = DedupConfig::default();
        let arts = vec![
            art("a", "E", 0, e(0), e(1), 10),
            art("odd", "E", 1, vec![1.0, 0.0], vec![0.0, 1.0], 10),
            art("b", "E", 2, e(0), e(1), 20),
        ];
        let plan = plan_groups(&arts, &cfg).unwrap();
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].member_ids, vec!["a", "b"]);
    }

    #[test]
    fn group_ids_are_deterministic() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let g1 = group_id_for("E", &ids);
        assert_eq!(g1, group_id_for("E", &ids));
        assert_ne!(g1, group_id_for("F", &ids));
        assert!(g1.starts_with("dg_"));
        assert_eq!(g1.len(), 3 + 16);
    }

    #[test]
    fn flag_updates_mark_exactly_one_canonical() {
        let cfg = DedupConfig::default();
        let arts = vec![
            art("a", "E", 0, e(0), e(1), 10),
            art("b", "E", 1, e(0), e(1), 30),
            art("c", "E", 2, e(0), e(1), 20),
        ];
        let plan = plan_groups(&arts, &cfg).unwrap();
        let ups = plan.groups[0].flag_updates();
        assert_eq!(ups.len(), 3);
        assert_eq!(ups.iter().filter(|u| u.is_canonical).count(), 1);
        assert!(ups.iter().find(|u| u.article_id == "b").unwrap().is_canonical);
    }
}
