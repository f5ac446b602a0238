//! Prometheus metrics for batch runs.
//!
//! Series are described once so they appear in the exposition even at zero.
//! The binary installs the recorder and writes the rendered text to a
//! textfile at the end of a run (node-exporter textfile collector style).

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::path::Path;

pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("embedding_articles_total", "Embedded articles created.");
        describe_counter!(
            "embedding_skipped_total",
            "Raw articles skipped by the embedding stage."
        );
        describe_counter!("dedup_groups_created_total", "Dedup groups persisted.");
        describe_counter!(
            "dedup_articles_grouped_total",
            "Embedded articles assigned to a dedup group."
        );
        describe_counter!(
            "dedup_ineligible_total",
            "Articles excluded from dedup (missing timestamp or vectors)."
        );
        describe_counter!(
            "dedup_group_failures_total",
            "Dedup groups whose persistence failed."
        );
        describe_counter!("clustering_windows_total", "Entity/window pairs processed.");
        describe_counter!(
            "clustering_windows_skipped_total",
            "Entity/window pairs skipped for insufficient data."
        );
        describe_counter!(
            "clustering_window_failures_total",
            "Entity/window pairs that failed and were skipped."
        );
        describe_counter!(
            "clustering_clusters_accepted_total",
            "Story clusters persisted."
        );
        describe_counter!(
            "clustering_clusters_rejected_total",
            "Clusters rejected by the size or cohesion floor."
        );
        describe_counter!(
            "clustering_noise_articles_total",
            "Articles labelled as noise by density clustering."
        );
        describe_histogram!(
            "clustering_window_ms",
            "Time spent on one entity/window pair in milliseconds."
        );
        describe_gauge!(
            "pipeline_last_run_ts",
            "Unix ts when a pipeline stage last finished."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already installed.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Write the current exposition to `path` (temp file + rename).
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        gauge!("pipeline_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, self.render())
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}
