//! # DBSCAN
//! Density-based clustering over dense vectors.
//!
//! Semantics follow the usual definition: a point is *core* when at least
//! `min_samples` points (itself included) lie within `eps`; clusters grow
//! from core points through their neighborhoods; everything unreachable is
//! noise, labelled [`NOISE`]. Labels are assigned in input order, so equal
//! input yields equal labels.

use anyhow::{bail, Result};
use std::collections::VecDeque;

use crate::similarity::cosine_distance;

pub const NOISE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    #[default]
    Cosine,
    Euclidean,
}

impl Distance {
    pub fn between(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        match self {
            Distance::Cosine => cosine_distance(a, b),
            Distance::Euclidean => {
                if a.len() != b.len() {
                    bail!("vector length mismatch ({} vs {})", a.len(), b.len());
                }
                Ok(a.iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Dbscan {
    pub eps: f32,
    pub min_samples: usize,
    pub metric: Distance,
}

impl Dbscan {
    pub fn new(eps: f32, min_samples: usize) -> Self {
        Self {
            eps,
            min_samples,
            metric: Distance::Cosine,
        }
    }

    pub fn with_metric(mut self, metric: Distance) -> Self {
        self.metric = metric;
        self
    }

    /// One label per input row. Errors on ragged input.
    pub fn fit_predict<V: AsRef<[f32]>>(&self, points: &[V]) -> Result<Vec<i32>> {
        if !(self.eps > 0.0) {
            bail!("eps must be positive");
        }
        if self.min_samples == 0 {
            bail!("min_samples must be at least 1");
        }

        let n = points.len();
        let neighbors = self.neighborhoods(points)?;

        let mut labels = vec![NOISE; n];
        let mut visited = vec![false; n];
        let mut next_label = 0i32;

        for start in 0..n {
            if visited[start] || neighbors[start].len() < self.min_samples {
                continue;
            }
            // `start` is an unvisited core point: grow a new cluster from it.
            let label = next_label;
            next_label += 1;

            let mut queue = VecDeque::from([start]);
            visited[start] = true;
            labels[start] = label;

            while let Some(p) = queue.pop_front() {
                if neighbors[p].len() < self.min_samples {
                    continue; // border point: labelled but not expanded
                }
                for &q in &neighbors[p] {
                    if labels[q] == NOISE {
                        labels[q] = label;
                    }
                    if !visited[q] {
                        visited[q] = true;
                        queue.push_back(q);
                    }
                }
            }
        }

        Ok(labels)
    }

    fn neighborhoods<V: AsRef<[f32]>>(&self, points: &[V]) -> Result<Vec<Vec<usize>>> {
        let n = points.len();
        let mut out = vec![Vec::new(); n];
        for i in 0..n {
            out[i].push(i);
            for j in (i + 1)..n {
                let d = self.metric.between(points[i].as_ref(), points[j].as_ref())?;
                if d <= self.eps {
                    out[i].push(j);
                    out[j].push(i);
                }
            }
        }
        Ok(out)
    }
}
