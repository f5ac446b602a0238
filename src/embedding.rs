//! # Embedding stage
//! Derives exactly one [`EmbeddedArticle`] per eligible raw article.
//!
//! The vectors themselves come from an [`EmbeddingProvider`]; this crate only
//! ships [`HashingEmbedder`], a deterministic feature-hashing model that keeps
//! offline runs and tests free of model downloads.

use anyhow::{bail, Result};
use chrono::Utc;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::models::{ArticleEmbeddings, EmbeddedArticle, ProcessingFlags, RawArticle};
use crate::store::ArticleStore;

#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed at most the first `max_chars` characters of `text`.
    /// Deterministic for equal input; always `dims()` long.
    async fn embed(&self, text: &str, max_chars: usize) -> Result<Vec<f32>>;
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
}

static RE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?u)\b\w+\b").expect("token regex"));

/// Signed feature hashing of lowercased unigrams and bigrams, L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
    model: String,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            model: format!("feature-hashing-{}", dims.max(1)),
        }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut idx = [0u8; 8];
        idx.copy_from_slice(&digest[..8]);
        let slot = (u64::from_le_bytes(idx) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (slot, sign)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = RE_TOKEN.find_iter(&lower).map(|m| m.as_str()).collect();

        let mut v = vec![0.0f32; self.dims];
        for t in &tokens {
            let (i, s) = self.bucket(t);
            v[i] += s;
        }
        for pair in tokens.windows(2) {
            let (i, s) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            v[i] += 0.5 * s;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str, max_chars: usize) -> Result<Vec<f32>> {
        Ok(self.vectorize(&truncate_chars(text, max_chars)))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmbeddingSummary {
    pub embedded: usize,
    pub gate_filtered: usize,
    pub skipped_ineligible: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eligibility {
    Eligible,
    GateRejected,
    Ineligible,
}

fn eligibility(raw: &RawArticle, cfg: &EmbeddingConfig) -> Eligibility {
    if !raw.gate_allowed() {
        return Eligibility::GateRejected;
    }
    let text_len = if raw.text_length > 0 {
        raw.text_length
    } else {
        raw.raw_text.chars().count()
    };
    if raw.title.trim().is_empty() || raw.raw_text.trim().is_empty() || text_len < cfg.min_text_length
    {
        return Eligibility::Ineligible;
    }
    Eligibility::Eligible
}

async fn embed_one(
    raw: &RawArticle,
    provider: &dyn EmbeddingProvider,
    cfg: &EmbeddingConfig,
) -> Result<EmbeddedArticle> {
    let title = raw.title.trim();
    let body_text = truncate_chars(&raw.raw_text, cfg.body_char_limit);

    let title_vec = provider.embed(title, cfg.body_char_limit).await?;
    let body_vec = provider.embed(&body_text, cfg.body_char_limit).await?;
    if title_vec.len() != provider.dims() || body_vec.len() != provider.dims() {
        bail!(
            "provider {} returned {}/{} dims, expected {}",
            provider.model_name(),
            title_vec.len(),
            body_vec.len(),
            provider.dims()
        );
    }

    Ok(EmbeddedArticle {
        id: EmbeddedArticle::id_for_raw(&raw.id),
        raw_article_id: raw.id.clone(),
        entity_id: raw.entity_id.clone(),
        entity_name: raw.entity_name.clone(),
        entity_type: raw.entity_type.clone(),
        ticker: raw.ticker.clone(),
        title: title.to_string(),
        body_text,
        url: raw.url.clone(),
        text_length: raw.raw_text.chars().count(),
        embeddings: ArticleEmbeddings {
            title: title_vec,
            body: body_vec,
            model: provider.model_name().to_string(),
            embedded_at: Some(Utc::now()),
        },
        published_at_utc: raw.published_at_utc,
        ingested_at: raw.ingested_at,
        processing: ProcessingFlags {
            embedded: true,
            ..ProcessingFlags::default()
        },
    })
}

pub const SKIP_GATE: &str = "ingestion_gate";
pub const SKIP_INELIGIBLE: &str = "ineligible";

/// Embed every raw article that has no embedded counterpart yet.
///
/// Re-running creates nothing new for already embedded articles. Gate and
/// eligibility rejections are recorded on the raw row and not re-checked on
/// later runs. A provider failure skips that article only and leaves it
/// pending.
pub async fn run_embedding(
    store: &dyn ArticleStore,
    provider: &dyn EmbeddingProvider,
    cfg: &EmbeddingConfig,
) -> Result<EmbeddingSummary> {
    crate::metrics::ensure_metrics_described();

    let pending = store.raw_articles_pending_embedding().await?;
    info!(target: "embedding", pending = pending.len(), model = provider.model_name(), "embedding raw articles");

    let mut summary = EmbeddingSummary::default();
    let mut batch = Vec::new();
    let mut gated = Vec::new();
    let mut ineligible = Vec::new();

    for raw in &pending {
        match eligibility(raw, cfg) {
            Eligibility::GateRejected => {
                gated.push(raw.id.clone());
                continue;
            }
            Eligibility::Ineligible => {
                debug!(target: "embedding", raw_article_id = %raw.id, "missing title/text or too short");
                ineligible.push(raw.id.clone());
                continue;
            }
            Eligibility::Eligible => {}
        }

        match embed_one(raw, provider, cfg).await {
            Ok(doc) => batch.push(doc),
            Err(e) => {
                warn!(target: "embedding", raw_article_id = %raw.id, error = %e, "embedding failed");
                summary.failed += 1;
            }
        }
    }

    summary.embedded = store.insert_embedded_articles(&batch).await?;
    summary.gate_filtered = gated.len();
    summary.skipped_ineligible = ineligible.len();
    if !gated.is_empty() {
        store.mark_embedding_skipped(&gated, SKIP_GATE).await?;
    }
    if !ineligible.is_empty() {
        store.mark_embedding_skipped(&ineligible, SKIP_INELIGIBLE).await?;
    }

    counter!("embedding_articles_total").increment(summary.embedded as u64);
    counter!("embedding_skipped_total")
        .increment((summary.gate_filtered + summary.skipped_ineligible + summary.failed) as u64);

    info!(
        target: "embedding",
        embedded = summary.embedded,
        gate_filtered = summary.gate_filtered,
        skipped = summary.skipped_ineligible,
        failed = summary.failed,
        "embedding complete"
    );
    Ok(summary)
}
