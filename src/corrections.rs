//! Station corrections.
//!
//! Per-(phase, station) travel-time delays added to the modelled times
//! before shifting. Corrections usually come out of a finished run: the
//! mean residual between observed picks and modelled arrivals per station
//! and phase.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::detection::EventDetections;

/// Pluggable correction providers, dispatched by the `corrections` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "corrections")]
pub enum StationCorrections {
    #[serde(rename = "constant")]
    Constant(ConstantCorrections),
}

impl StationCorrections {
    /// Delay per requested station for a phase; unknown stations get 0.
    pub fn get_delays(&self, nsls: &[String], phase: &str) -> Vec<f64> {
        match self {
            Self::Constant(corrections) => corrections.get_delays(nsls, phase),
        }
    }
}

/// Static delay table, seconds per phase and NSL code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstantCorrections {
    #[serde(default)]
    pub delays: BTreeMap<String, BTreeMap<String, f64>>,
}

impl ConstantCorrections {
    pub fn get_delays(&self, nsls: &[String], phase: &str) -> Vec<f64> {
        let phase_delays = self.delays.get(phase);
        nsls.iter()
            .map(|nsl| {
                phase_delays
                    .and_then(|delays| delays.get(nsl))
                    .copied()
                    .unwrap_or(0.0)
            })
            .collect()
    }

    /// Derive corrections from the pick residuals of a finished run.
    pub fn from_detections(detections: &EventDetections) -> Self {
        let mut sums: BTreeMap<(String, String), (f64, usize)> = BTreeMap::new();
        for detection in detections.iter() {
            for receiver in &detection.receivers {
                for arrival in &receiver.phase_arrivals {
                    if let Some(residual) = arrival.residual_seconds() {
                        let entry = sums
                            .entry((arrival.phase.clone(), receiver.station.nsl()))
                            .or_insert((0.0, 0));
                        entry.0 += residual;
                        entry.1 += 1;
                    }
                }
            }
        }

        let mut delays: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for ((phase, nsl), (sum, count)) in sums {
            delays
                .entry(phase)
                .or_default()
                .insert(nsl, sum / count as f64);
        }
        Self { delays }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_station_gets_zero_delay() {
        let corrections = ConstantCorrections {
            delays: BTreeMap::from([(
                "cake:P".to_string(),
                BTreeMap::from([("XX.AAA.".to_string(), 0.25)]),
            )]),
        };
        let delays = corrections.get_delays(
            &["XX.AAA.".to_string(), "XX.BBB.".to_string()],
            "cake:P",
        );
        assert_eq!(delays, vec![0.25, 0.0]);

        let delays = corrections.get_delays(&["XX.AAA.".to_string()], "cake:S");
        assert_eq!(delays, vec![0.0]);
    }
}
