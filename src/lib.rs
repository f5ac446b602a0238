// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod metrics;
pub mod models;
pub mod store;

// Stage 1: raw articles -> embedded articles
pub mod embedding;

// Stage 2: semantic dedup
pub mod dedup;
pub mod similarity;

// Stage 3: multi-window story clustering
pub mod clustering;
pub mod dbscan;
pub mod resolver;
pub mod snapshot;
pub mod tagger;

pub mod pipeline;

// ---- Re-exports for stable public API ----
pub use crate::config::PipelineConfig;
pub use crate::pipeline::{Pipeline, RunSummary, Stage};
pub use crate::store::{ArticleStore, InMemoryStore, JsonFileStore};
