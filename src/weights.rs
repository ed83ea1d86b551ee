//! Optional station weighting by source-receiver distance.
//!
//! Applies an exponential decay `w(d) = exp(-(d/r)^p)` so distant stations
//! contribute less to the stack. Per-node distance vectors are kept in a
//! byte-bounded LRU; misses are computed in batch and inserted under a
//! lock, hits are read without recomputation.

use std::sync::Mutex;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::cache::ByteLru;
use crate::error::{QSeekError, Result};
use crate::octree::{NodeKey, Octree};
use crate::station::Stations;

const MB: usize = 1024 * 1024;

fn default_exponent() -> f64 {
    0.5
}

fn default_radius() -> f64 {
    8_000.0
}

fn default_lut_cache_size() -> usize {
    200 * MB
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StationWeights {
    /// Exponent of the decay function, in `[0, 3]`.
    #[serde(default = "default_exponent")]
    pub exponent: f64,
    /// Decay radius in meters.
    #[serde(default = "default_radius")]
    pub radius_meters: f64,
    /// Budget of the node distance LRU in bytes.
    #[serde(default = "default_lut_cache_size")]
    pub lut_cache_size: usize,

    #[serde(skip)]
    stations: Stations,
    #[serde(skip)]
    node_lut: Option<Mutex<ByteLru<NodeKey, Vec<f32>>>>,
}

impl Default for StationWeights {
    fn default() -> Self {
        Self {
            exponent: default_exponent(),
            radius_meters: default_radius(),
            lut_cache_size: default_lut_cache_size(),
            stations: Stations::default(),
            node_lut: None,
        }
    }
}

impl StationWeights {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=3.0).contains(&self.exponent) {
            return Err(QSeekError::config(format!(
                "station weight exponent {} outside [0, 3]",
                self.exponent
            )));
        }
        if self.radius_meters <= 0.0 {
            return Err(QSeekError::config("station weight radius must be positive"));
        }
        Ok(())
    }

    /// Bind the station set and pre-fill the distance LUT for the coarse
    /// octree.
    pub fn prepare(&mut self, stations: &Stations, octree: &Octree) -> Result<()> {
        info!("preparing station weights");
        self.validate()?;
        self.stations = stations.clone();
        self.node_lut = Some(Mutex::new(ByteLru::new(self.lut_cache_size)));
        // Pre-fill for the coarse grid; refinement nodes fill in lazily.
        let _ = self.get_weights(octree, stations)?;
        Ok(())
    }

    fn node_distances(&self, location: &crate::geo::Location) -> Vec<f32> {
        self.stations
            .iter()
            .map(|sta| sta.distance_to(location) as f32)
            .collect()
    }

    fn calc_weight(&self, distance: f32) -> f32 {
        let ratio = distance as f64 / self.radius_meters;
        (-(ratio.powf(self.exponent))).exp() as f32
    }

    /// Weight matrix `[n_nodes × n_stations]` for the requested stations.
    ///
    /// Distance vectors come from the LUT; missing nodes are computed on
    /// the spot and inserted. The lock is held across the walk so inserts
    /// serialize with concurrent queries.
    pub fn get_weights(&self, octree: &Octree, stations: &Stations) -> Result<Vec<f32>> {
        // Map the requested stations onto the prepared distance vectors.
        let prepared_nsls = self.stations.all_nsls();
        let mut station_indices = Vec::with_capacity(stations.n_stations());
        for nsl in stations.all_nsls() {
            let index = prepared_nsls
                .iter()
                .position(|candidate| *candidate == nsl)
                .ok_or_else(|| {
                    QSeekError::data(format!("station {nsl} missing from weight tables"))
                })?;
            station_indices.push(index);
        }

        let entry_bytes = prepared_nsls.len() * std::mem::size_of::<f32>();
        let mut lut = self
            .node_lut
            .as_ref()
            .ok_or_else(|| QSeekError::config("station weights not prepared"))?
            .lock()
            .expect("weights LUT lock");

        let n_nodes = octree.n_nodes();
        let mut weights = Vec::with_capacity(n_nodes * station_indices.len());
        let mut n_misses = 0_usize;
        for node in octree.iter_leaves() {
            let key = octree.node_key(node);
            if !lut.contains(&key) {
                let location = octree.node_location(node);
                lut.insert(key, self.node_distances(&location), entry_bytes);
                n_misses += 1;
            }
            let distances = lut
                .get(&key)
                .ok_or_else(|| QSeekError::data("weight LUT lost a freshly filled node"))?;
            for &index in &station_indices {
                weights.push(distances[index]);
            }
        }
        if n_misses > 0 {
            debug!(
                "filled weight lut for {n_misses} nodes, cache hit rate {:.1}%",
                lut.hit_rate() * 100.0
            );
        }
        drop(lut);

        for value in &mut weights {
            *value = self.calc_weight(*value);
        }
        Ok(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Location;
    use crate::station::Station;

    fn stations() -> Stations {
        let mut stations = Stations::from_stations(
            (0..3)
                .map(|i| Station {
                    network: "XX".into(),
                    station: format!("S{i:02}"),
                    location_code: String::new(),
                    coords: Location {
                        east_shift: i as f64 * 2_000.0 + 100.0,
                        ..Location::new(0.0, 0.0)
                    },
                })
                .collect(),
        );
        stations.load().unwrap();
        stations
    }

    fn octree() -> Octree {
        let mut tree = Octree::default();
        tree.init().unwrap();
        tree
    }

    #[test]
    fn test_weight_bounds_and_monotonicity() {
        let weights = StationWeights::default();
        assert_eq!(weights.calc_weight(0.0), 1.0);
        let mut previous = 1.0;
        for distance in [100.0, 1_000.0, 10_000.0, 100_000.0, 1e7] {
            let weight = weights.calc_weight(distance);
            assert!(weight <= previous);
            assert!(weight >= 0.0);
            previous = weight;
        }
        assert!(weights.calc_weight(1e9) < 1e-3);
    }

    #[test]
    fn test_exponent_validation() {
        let weights = StationWeights {
            exponent: 4.0,
            ..Default::default()
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_weight_matrix_shape_and_repeatability() {
        let stations = stations();
        let tree = octree();
        let mut weights = StationWeights::default();
        weights.prepare(&stations, &tree).unwrap();

        let first = weights.get_weights(&tree, &stations).unwrap();
        assert_eq!(first.len(), tree.n_nodes() * stations.n_stations());
        let second = weights.get_weights(&tree, &stations).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_lut_refills_after_eviction() {
        let stations = stations();
        let tree = octree();
        let mut weights = StationWeights {
            // Room for a fraction of the tree only.
            lut_cache_size: 100 * std::mem::size_of::<f32>() * 3,
            ..Default::default()
        };
        weights.prepare(&stations, &tree).unwrap();
        let result = weights.get_weights(&tree, &stations).unwrap();
        assert_eq!(result.len(), tree.n_nodes() * stations.n_stations());
    }
}
