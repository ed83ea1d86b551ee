//! Per-frame semblance buffer.
//!
//! A 2-D array `[node × time]` accumulating the stacked image energy for
//! one padded search window. The padded columns absorb shifted trace
//! samples; peak detection and all reductions work on the unpadded view.
//! Rows can be snapshotted into a cache keyed by the stable node identity
//! and restored verbatim on the refined octree of the next recursion pass.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;

use crate::error::{QSeekError, Result};
use crate::octree::NodeKey;
use crate::peaks::{self, Peak};

/// Snapshot of semblance rows from a previous refinement pass.
pub type SemblanceCache = HashMap<NodeKey, Vec<f32>>;

/// The maximum-semblance trace of one processed window.
#[derive(Debug, Clone)]
pub struct SemblanceTrace {
    pub start_time: DateTime<Utc>,
    pub sampling_rate: f64,
    pub samples: Vec<f32>,
}

pub struct Semblance {
    /// Window start time, padding excluded.
    pub start_time: DateTime<Utc>,
    pub sampling_rate: f64,
    pub padding_samples: usize,
    n_nodes: usize,
    n_samples_total: usize,
    data: Vec<f32>,
}

impl Semblance {
    pub fn new(
        n_nodes: usize,
        n_samples_total: usize,
        start_time: DateTime<Utc>,
        sampling_rate: f64,
        padding_samples: usize,
    ) -> Result<Self> {
        if n_samples_total < 2 * padding_samples {
            return Err(QSeekError::config(format!(
                "semblance buffer of {n_samples_total} samples cannot hold \
                 2 × {padding_samples} padding samples"
            )));
        }
        Ok(Self {
            start_time,
            sampling_rate,
            padding_samples,
            n_nodes,
            n_samples_total,
            data: vec![0.0; n_nodes * n_samples_total],
        })
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn n_samples_total(&self) -> usize {
        self.n_samples_total
    }

    pub fn n_samples_unpadded(&self) -> usize {
        self.n_samples_total - 2 * self.padding_samples
    }

    pub fn nbytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Mutable flat buffer for the stacking kernel, row stride
    /// [`Self::n_samples_total`].
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn row(&self, node: usize) -> &[f32] {
        let start = node * self.n_samples_total;
        &self.data[start..start + self.n_samples_total]
    }

    /// Divide every sample by the cumulative image weight.
    pub fn normalize(&mut self, cumulative_weight: f32) {
        if cumulative_weight == 0.0 || cumulative_weight == 1.0 {
            return;
        }
        let scale = 1.0 / cumulative_weight;
        for value in &mut self.data {
            *value *= scale;
        }
    }

    /// Undo the image pre-exponentiation after stacking.
    pub fn apply_exponent(&mut self, exponent: f32) {
        if exponent == 1.0 {
            return;
        }
        for value in &mut self.data {
            *value = value.powf(exponent);
        }
    }

    /// Maximum over nodes for every unpadded time sample.
    pub fn max_semblance(&self) -> Vec<f32> {
        let n_unpadded = self.n_samples_unpadded();
        let mut maxima = vec![0.0_f32; n_unpadded];
        for node in 0..self.n_nodes {
            let row = &self.row(node)[self.padding_samples..self.padding_samples + n_unpadded];
            for (max, &value) in maxima.iter_mut().zip(row) {
                if value > *max {
                    *max = value;
                }
            }
        }
        maxima
    }

    /// Index of the maximum node for every unpadded time sample.
    ///
    /// The argmax over the node axis is independent per time sample and
    /// parallelized over time.
    pub fn maxima_node_idx(&self, pool: &rayon::ThreadPool) -> Vec<usize> {
        let n_unpadded = self.n_samples_unpadded();
        let padding = self.padding_samples;
        let stride = self.n_samples_total;
        let data = &self.data;
        let n_nodes = self.n_nodes;

        pool.install(|| {
            (0..n_unpadded)
                .into_par_iter()
                .map(|time| {
                    let column = padding + time;
                    let mut best_node = 0;
                    let mut best_value = f32::NEG_INFINITY;
                    for node in 0..n_nodes {
                        let value = data[node * stride + column];
                        if value > best_value {
                            best_value = value;
                            best_node = node;
                        }
                    }
                    best_node
                })
                .collect()
        })
    }

    /// Semblance of every node at one unpadded time sample.
    pub fn time_slice(&self, time_idx: usize) -> Vec<f32> {
        let column = self.padding_samples + time_idx;
        (0..self.n_nodes)
            .map(|node| self.data[node * self.n_samples_total + column])
            .collect()
    }

    /// Peaks of the maximum-semblance trace.
    pub fn find_peaks(&self, height: f32, prominence: f32, distance: usize) -> Vec<Peak> {
        peaks::find_peaks(&self.max_semblance(), height, prominence, distance)
    }

    pub fn get_trace(&self) -> SemblanceTrace {
        SemblanceTrace {
            start_time: self.start_time,
            sampling_rate: self.sampling_rate,
            samples: self.max_semblance(),
        }
    }

    /// Absolute time of an unpadded sample index.
    pub fn time_of(&self, time_idx: usize) -> DateTime<Utc> {
        self.start_time
            + Duration::microseconds((time_idx as f64 / self.sampling_rate * 1e6) as i64)
    }

    /// Snapshot all rows keyed by their stable node identity.
    ///
    /// `node_keys` must list the leaf keys in iteration order. Call after
    /// normalization so restored rows are directly comparable.
    pub fn snapshot_cache(&self, node_keys: &[NodeKey]) -> Result<SemblanceCache> {
        self.check_keys(node_keys)?;
        let mut cache = SemblanceCache::with_capacity(self.n_nodes);
        for (node, key) in node_keys.iter().enumerate() {
            cache.insert(*key, self.row(node).to_vec());
        }
        Ok(cache)
    }

    /// Per-node mask of rows available in the cache.
    pub fn cache_mask(node_keys: &[NodeKey], cache: &SemblanceCache) -> Vec<bool> {
        node_keys.iter().map(|key| cache.contains_key(key)).collect()
    }

    /// Restore cached rows verbatim. Applied after normalization: the
    /// stacking kernel skipped these rows entirely.
    pub fn apply_cache(&mut self, node_keys: &[NodeKey], cache: &SemblanceCache) -> Result<()> {
        self.check_keys(node_keys)?;
        for (node, key) in node_keys.iter().enumerate() {
            if let Some(cached_row) = cache.get(key) {
                if cached_row.len() != self.n_samples_total {
                    return Err(QSeekError::data(
                        "cached semblance row has mismatching length",
                    ));
                }
                let start = node * self.n_samples_total;
                self.data[start..start + self.n_samples_total].copy_from_slice(cached_row);
            }
        }
        Ok(())
    }

    fn check_keys(&self, node_keys: &[NodeKey]) -> Result<()> {
        if node_keys.len() != self.n_nodes {
            return Err(QSeekError::data(format!(
                "got {} node keys for {} semblance rows",
                node_keys.len(),
                self.n_nodes
            )));
        }
        Ok(())
    }
}
