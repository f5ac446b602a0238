//! # Candidate resolution
//! Query layer between the store and the clustering engine.
//!
//! - [`resolve_raw_ids`]: raw-article ids for one entity in `[start, end)`.
//! - [`dedup_safe_filter`]: embedded articles among those ids that are either
//!   singletons (never grouped) or the canonical member of their group.
//!
//! Queries are plain data; stores evaluate them with `matches`.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

use crate::models::{EmbeddedArticle, Entity, RawArticle};
use crate::store::ArticleStore;

/// How raw articles are attributed to an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitySelector {
    EntityId(String),
    /// Legacy path for company entities ingested before entity ids existed.
    Tickers(Vec<String>),
}

impl EntitySelector {
    /// Prefers the entity id; tickers only when the entity opts in.
    pub fn for_entity(entity: &Entity) -> Result<Self> {
        if entity.match_by_ticker {
            if let Some(t) = entity.ticker.as_deref().filter(|t| !t.trim().is_empty()) {
                return Ok(Self::Tickers(vec![t.trim().to_string()]));
            }
        }
        if !entity.entity_id.trim().is_empty() {
            return Ok(Self::EntityId(entity.entity_id.clone()));
        }
        bail!(
            "no valid identifier for entity {:?} (entity_type={})",
            entity.name,
            entity.entity_type
        )
    }
}

/// Raw-article selection: entity + half-open UTC range on `published_at_utc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArticleFilter {
    pub selector: EntitySelector,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

impl RawArticleFilter {
    pub fn matches(&self, a: &RawArticle) -> bool {
        let Some(ts) = a.published_at_utc else {
            return false;
        };
        if ts < self.start_utc || ts >= self.end_utc {
            return false;
        }
        match &self.selector {
            EntitySelector::EntityId(id) => &a.entity_id == id,
            EntitySelector::Tickers(tickers) => a
                .ticker
                .as_deref()
                .is_some_and(|t| tickers.iter().any(|x| x.eq_ignore_ascii_case(t))),
        }
    }
}

/// Embedded-article selection by raw id, optionally restricted to dedup-safe rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub raw_article_ids: HashSet<String>,
    pub dedup_safe_only: bool,
}

impl CandidateQuery {
    /// `raw_article_id IN ids AND (NOT semantically_deduped OR is_canonical)`.
    pub fn matches(&self, a: &EmbeddedArticle) -> bool {
        if !self.raw_article_ids.contains(&a.raw_article_id) {
            return false;
        }
        !self.dedup_safe_only || a.is_dedup_safe()
    }
}

/// Compose the dedup-safe candidate query for a resolved id set.
pub fn dedup_safe_filter<I, S>(raw_ids: I) -> CandidateQuery
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CandidateQuery {
        raw_article_ids: raw_ids.into_iter().map(Into::into).collect(),
        dedup_safe_only: true,
    }
}

/// Raw article ids published for `entity` in `[start, end)`.
pub async fn resolve_raw_ids(
    store: &dyn ArticleStore,
    entity: &Entity,
    start_utc: DateTime<Utc>,
    end_utc: DateTime<Utc>,
) -> Result<Vec<String>> {
    let filter = RawArticleFilter {
        selector: EntitySelector::for_entity(entity)?,
        start_utc,
        end_utc,
    };
    let ids = store.find_raw_article_ids(&filter).await?;
    debug!(
        target: "clustering",
        entity_id = %entity.entity_id,
        entity_type = %entity.entity_type,
        selector = ?filter.selector,
        found = ids.len(),
        "resolved raw articles"
    );
    Ok(ids)
}
