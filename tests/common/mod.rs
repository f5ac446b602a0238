// tests/common/mod.rs
// Shared fixtures: fixed clock, unit/blended vectors, raw + embedded article pairs.
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use story_resolver::models::{
    ArticleEmbeddings, EmbeddedArticle, Entity, ProcessingFlags, RawArticle,
};
use story_resolver::ArticleStore;

pub const DIMS: usize = 8;

/// Fixed "now" for every scenario (a Tuesday, noon UTC).
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 20, 12, 0, 0).unwrap()
}

pub fn hours_ago(h: i64) -> DateTime<Utc> {
    now() - Duration::hours(h)
}

pub fn unit(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[i] = 1.0;
    v
}

/// `cos * e_base + sqrt(1 - cos²) * e_other`: cosine to `e_base` is exactly `cos`.
pub fn blend(base: usize, other: usize, cos: f32) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[base] = cos;
    v[other] = (1.0 - cos * cos).sqrt();
    v
}

pub fn entity(id: &str) -> Entity {
    Entity {
        entity_id: id.into(),
        name: format!("{id} Corp"),
        entity_type: "company".into(),
        ticker: None,
        match_by_ticker: false,
    }
}

/// One article, described once and materialized as both raw and embedded rows.
#[derive(Debug, Clone)]
pub struct Doc {
    pub key: String,
    pub entity_id: String,
    pub published: DateTime<Utc>,
    pub title: String,
    pub title_vec: Vec<f32>,
    pub body_vec: Vec<f32>,
    pub text_len: usize,
}

pub fn doc(key: &str, entity_id: &str, published: DateTime<Utc>, body_vec: Vec<f32>) -> Doc {
    Doc {
        key: key.into(),
        entity_id: entity_id.into(),
        published,
        title: format!("headline {key}"),
        title_vec: body_vec.clone(),
        body_vec,
        text_len: 500,
    }
}

impl Doc {
    pub fn title(mut self, t: &str) -> Self {
        self.title = t.into();
        self
    }

    pub fn title_vec(mut self, v: Vec<f32>) -> Self {
        self.title_vec = v;
        self
    }

    pub fn text_len(mut self, n: usize) -> Self {
        self.text_len = n;
        self
    }

    pub fn raw_id(&self) -> String {
        format!("{}:raw-{}", self.entity_id, self.key)
    }

    pub fn embedded_id(&self) -> String {
        EmbeddedArticle::id_for_raw(&self.raw_id())
    }

    pub fn raw(&self) -> RawArticle {
        RawArticle {
            id: self.raw_id(),
            content_hash: String::new(),
            entity_id: self.entity_id.clone(),
            entity_name: format!("{} Corp", self.entity_id),
            entity_type: "company".into(),
            ticker: None,
            source: "wire".into(),
            title: self.title.clone(),
            url: Some(format!("https://news.example/{}", self.key)),
            published_at_raw: None,
            published_at_utc: Some(self.published),
            ingested_at: self.published,
            raw_text: format!("body text of article {}", self.key),
            text_length: self.text_len,
            ingestion_gate: None,
            embedding_skipped: None,
        }
    }

    pub fn embedded(&self) -> EmbeddedArticle {
        EmbeddedArticle {
            id: self.embedded_id(),
            raw_article_id: self.raw_id(),
            entity_id: self.entity_id.clone(),
            entity_name: format!("{} Corp", self.entity_id),
            entity_type: "company".into(),
            ticker: None,
            title: self.title.clone(),
            body_text: format!("body text of article {}", self.key),
            url: None,
            text_length: self.text_len,
            embeddings: ArticleEmbeddings {
                title: self.title_vec.clone(),
                body: self.body_vec.clone(),
                model: "fixture".into(),
                embedded_at: Some(self.published),
            },
            published_at_utc: Some(self.published),
            ingested_at: self.published,
            processing: ProcessingFlags {
                embedded: true,
                ..ProcessingFlags::default()
            },
        }
    }
}

pub async fn seed(store: &dyn ArticleStore, docs: &[Doc]) {
    let raws: Vec<RawArticle> = docs.iter().map(Doc::raw).collect();
    let embs: Vec<EmbeddedArticle> = docs.iter().map(Doc::embedded).collect();
    assert_eq!(store.insert_raw_articles(&raws).await.unwrap(), docs.len());
    assert_eq!(store.insert_embedded_articles(&embs).await.unwrap(), docs.len());
}
