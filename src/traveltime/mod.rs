//! Travel-time tables.
//!
//! Two pluggable providers map `(source node, receiver)` to a travel time
//! for a phase: the 1-D layered [`layered::CakeTracer`] and the 3-D
//! [`eikonal::FastMarchingTracer`]. Both persist their tables to the cache
//! directory and serve batch queries through byte-bounded LRUs. Phase
//! identifiers carry the provider prefix, e.g. `cake:P` or `fm:S`.

pub mod earthmodel;
pub mod eikonal;
pub mod layered;
pub mod npy;
pub mod sptree;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QSeekError, Result};
use crate::geo::Location;
use crate::octree::Octree;
use crate::station::{Station, Stations};
use crate::util::CacheDir;

pub use earthmodel::{EarthModel, VelocityModel, Wave};
pub use eikonal::FastMarchingTracer;
pub use layered::CakeTracer;

/// A modelled phase arrival at a receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelledArrival {
    pub phase: String,
    pub time: DateTime<Utc>,
}

impl ModelledArrival {
    /// Build an arrival from a travel time; NaN yields `None`.
    pub fn from_travel_time(
        phase: &str,
        event_time: DateTime<Utc>,
        travel_time: f64,
    ) -> Option<Self> {
        if !travel_time.is_finite() {
            return None;
        }
        Some(Self {
            phase: phase.to_string(),
            time: event_time + Duration::microseconds((travel_time * 1e6) as i64),
        })
    }
}

/// Pluggable travel-time providers, dispatched by the `tracer` tag.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "tracer")]
pub enum RayTracer {
    #[serde(rename = "cake")]
    Cake(CakeTracer),
    #[serde(rename = "fast-marching")]
    FastMarching(FastMarchingTracer),
}

impl RayTracer {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cake(_) => "cake",
            Self::FastMarching(_) => "fast-marching",
        }
    }

    pub fn get_available_phases(&self) -> Vec<String> {
        match self {
            Self::Cake(tracer) => tracer.get_available_phases(),
            Self::FastMarching(tracer) => tracer.get_available_phases(),
        }
    }

    /// Build or load the tables for the requested phases.
    pub fn prepare(
        &mut self,
        octree: &Octree,
        stations: &mut Stations,
        phases: &[String],
        cache_dir: &CacheDir,
    ) -> Result<()> {
        match self {
            Self::Cake(tracer) => tracer.prepare(octree, stations, phases, cache_dir),
            Self::FastMarching(tracer) => tracer.prepare(octree, stations, phases, cache_dir),
        }
    }

    /// Travel times `[n_nodes × n_stations]` in seconds, NaN where
    /// undefined.
    pub fn get_travel_times(
        &self,
        phase: &str,
        octree: &Octree,
        stations: &Stations,
    ) -> Result<Vec<f64>> {
        match self {
            Self::Cake(tracer) => tracer.get_travel_times(phase, octree, stations),
            Self::FastMarching(tracer) => tracer.get_travel_times(phase, octree, stations),
        }
    }

    pub fn get_travel_time(
        &self,
        phase: &str,
        source: &Location,
        receiver: &Station,
    ) -> Result<f64> {
        match self {
            Self::Cake(tracer) => tracer.get_travel_time(phase, source, &receiver.coords),
            Self::FastMarching(tracer) => tracer.get_travel_time(phase, source, receiver),
        }
    }

    /// Absolute arrival times per receiver, `None` where undefined.
    pub fn get_arrivals(
        &self,
        phase: &str,
        event_time: DateTime<Utc>,
        source: &Location,
        receivers: &Stations,
    ) -> Result<Vec<Option<ModelledArrival>>> {
        match self {
            Self::Cake(tracer) => tracer.get_arrivals(phase, event_time, source, receivers),
            Self::FastMarching(tracer) => tracer.get_arrivals(phase, event_time, source, receivers),
        }
    }
}

/// The configured tracer set.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RayTracers {
    pub tracers: Vec<RayTracer>,
}

impl Default for RayTracers {
    fn default() -> Self {
        Self {
            tracers: vec![RayTracer::Cake(CakeTracer::default())],
        }
    }
}

impl RayTracers {
    /// Every requested phase must be provided by exactly one tracer.
    pub fn validate_phases(&self, phases: &[String]) -> Result<()> {
        for phase in phases {
            let n_providers = self
                .tracers
                .iter()
                .filter(|tracer| tracer.get_available_phases().contains(phase))
                .count();
            match n_providers {
                0 => {
                    return Err(QSeekError::config(format!(
                        "no ray tracer provides phase {phase}"
                    )));
                }
                1 => {}
                _ => {
                    return Err(QSeekError::config(format!(
                        "phase {phase} is provided by multiple ray tracers"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn prepare(
        &mut self,
        octree: &Octree,
        stations: &mut Stations,
        phases: &[String],
        cache_dir: &CacheDir,
    ) -> Result<()> {
        self.validate_phases(phases)?;
        for tracer in &mut self.tracers {
            tracer.prepare(octree, stations, phases, cache_dir)?;
        }
        Ok(())
    }

    pub fn get_phase_tracer(&self, phase: &str) -> Result<&RayTracer> {
        self.tracers
            .iter()
            .find(|tracer| tracer.get_available_phases().contains(&phase.to_string()))
            .ok_or_else(|| QSeekError::config(format!("no ray tracer provides phase {phase}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_validation() {
        let tracers = RayTracers::default();
        tracers
            .validate_phases(&["cake:P".to_string(), "cake:S".to_string()])
            .unwrap();
        assert!(tracers.validate_phases(&["fm:P".to_string()]).is_err());

        let both = RayTracers {
            tracers: vec![
                RayTracer::Cake(CakeTracer::default()),
                RayTracer::Cake(CakeTracer::default()),
            ],
        };
        assert!(both.validate_phases(&["cake:P".to_string()]).is_err());
    }

    #[test]
    fn test_modelled_arrival_from_nan_is_none() {
        let now = Utc::now();
        assert!(ModelledArrival::from_travel_time("cake:P", now, f64::NAN).is_none());
        let arrival = ModelledArrival::from_travel_time("cake:P", now, 1.5).unwrap();
        assert_eq!(arrival.time, now + Duration::microseconds(1_500_000));
    }
}
