//! Post-detection magnitude and feature extractors.
//!
//! These run after a detection is finalized, against the shared waveform
//! access handle and under the controller's concurrency cap. Heavyweight
//! scientific processors live outside this crate; the built-ins are a
//! Richter-style local magnitude and a peak-amplitude feature.

use chrono::Duration;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::detection::{EventDetection, EventFeature, EventMagnitude};
use crate::error::Result;
use crate::provider::WaveformAccessor;

fn default_window_seconds() -> f64 {
    10.0
}

/// Richter-style local magnitude from peak amplitudes and hypocentral
/// distances (Hutton & Boore attenuation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalMagnitude {
    /// Waveform window after origin time, seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: f64,
}

impl Default for LocalMagnitude {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
        }
    }
}

/// Pluggable magnitude calculators, dispatched by the `magnitude` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "magnitude")]
pub enum MagnitudeCalculator {
    #[serde(rename = "local")]
    Local(LocalMagnitude),
}

impl MagnitudeCalculator {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
        }
    }

    pub fn add_magnitude(
        &self,
        accessor: &WaveformAccessor,
        event: &mut EventDetection,
    ) -> Result<()> {
        match self {
            Self::Local(calculator) => calculator.add_magnitude(accessor, event),
        }
    }
}

impl LocalMagnitude {
    fn add_magnitude(&self, accessor: &WaveformAccessor, event: &mut EventDetection) -> Result<()> {
        let window = Duration::microseconds((self.window_seconds * 1e6) as i64);
        let traces = accessor.get_waveforms(event.time, event.time + window);

        let source = event.location;
        let mut station_magnitudes = Vec::new();
        for receiver in &event.receivers {
            let Some(trace) = traces.iter().find(|tr| tr.nsl() == receiver.station.nsl()) else {
                continue;
            };
            let Some(amplitude) = trace.peak_amplitude(event.time, event.time + window) else {
                continue;
            };
            if amplitude <= 0.0 {
                continue;
            }
            let distance_km = (receiver.station.distance_to(&source) / 1e3).max(0.1);
            // Hutton & Boore (1987) attenuation for Southern California.
            let ml = (amplitude as f64).log10()
                + 1.11 * distance_km.log10()
                + 0.001_89 * distance_km
                - 2.09;
            station_magnitudes.push(ml);
        }

        if station_magnitudes.is_empty() {
            return Ok(());
        }
        let n = station_magnitudes.len() as f64;
        let average = station_magnitudes.iter().sum::<f64>() / n;
        let variance = station_magnitudes
            .iter()
            .map(|ml| (ml - average).powi(2))
            .sum::<f64>()
            / n;
        event.magnitudes.push(EventMagnitude {
            magnitude: "ML".to_string(),
            average,
            error: variance.sqrt(),
        });
        Ok(())
    }
}

/// Peak waveform amplitude around the modelled arrivals, per receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveformAmplitudes {
    /// Half window around each arrival, seconds.
    #[serde(default = "default_amplitude_window")]
    pub window_seconds: f64,
}

fn default_amplitude_window() -> f64 {
    5.0
}

impl Default for WaveformAmplitudes {
    fn default() -> Self {
        Self {
            window_seconds: default_amplitude_window(),
        }
    }
}

/// Pluggable feature extractors, dispatched by the `feature` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "feature")]
pub enum FeatureExtractor {
    #[serde(rename = "waveform-amplitudes")]
    WaveformAmplitudes(WaveformAmplitudes),
}

impl FeatureExtractor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WaveformAmplitudes(_) => "waveform-amplitudes",
        }
    }

    pub fn add_features(
        &self,
        accessor: &WaveformAccessor,
        event: &mut EventDetection,
    ) -> Result<()> {
        match self {
            Self::WaveformAmplitudes(extractor) => extractor.add_features(accessor, event),
        }
    }
}

impl WaveformAmplitudes {
    fn add_features(&self, accessor: &WaveformAccessor, event: &mut EventDetection) -> Result<()> {
        let window = Duration::microseconds((self.window_seconds * 1e6) as i64);
        let traces = accessor.get_waveforms(event.time - window, event.time + window * 4);

        let mut amplitudes = serde_json::Map::new();
        for receiver in &event.receivers {
            let Some(trace) = traces.iter().find(|tr| tr.nsl() == receiver.station.nsl()) else {
                continue;
            };
            for arrival in &receiver.phase_arrivals {
                let time = arrival.model.time;
                if let Some(amplitude) = trace.peak_amplitude(time - window, time + window) {
                    amplitudes.insert(
                        format!("{}:{}", receiver.station.nsl(), arrival.phase),
                        json!(amplitude),
                    );
                }
            }
        }
        debug!(
            "extracted {} waveform amplitudes for event {}",
            amplitudes.len(),
            event.time
        );
        event.features.push(EventFeature {
            feature: "waveform-amplitudes".to_string(),
            value: serde_json::Value::Object(amplitudes),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionReceiver;
    use crate::geo::Location;
    use crate::provider::{SyntheticProvider, SyntheticSource, WaveformProvider};
    use crate::station::{Station, Stations};
    use chrono::{DateTime, Utc};

    fn setup() -> (WaveformAccessor, EventDetection) {
        let start = DateTime::parse_from_rfc3339("2023-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event_time = start + Duration::seconds(60);

        let mut stations = Stations::from_stations(vec![Station {
            network: "XX".into(),
            station: "AAA".into(),
            location_code: String::new(),
            coords: Location {
                east_shift: 1_000.0,
                ..Location::new(0.0, 0.0)
            },
        }]);
        stations.load().unwrap();

        let mut provider = WaveformProvider::Synthetic(SyntheticProvider {
            start_time: start,
            end_time: start + Duration::seconds(300),
            sources: vec![SyntheticSource {
                time: event_time,
                east_shift: 0.0,
                north_shift: 0.0,
                depth: 5_000.0,
                amplitude: 100.0,
            }],
            ..Default::default()
        });
        provider.prepare(&stations).unwrap();
        let accessor = provider.accessor().unwrap();

        let event = EventDetection {
            time: event_time,
            location: Location {
                depth: 5_000.0,
                ..Location::new(0.0, 0.0)
            },
            semblance: 0.8,
            distance_border: 5_000.0,
            in_bounds: true,
            n_stations: 1,
            uncertainty: None,
            receivers: vec![DetectionReceiver {
                station: stations.stations[0].clone(),
                phase_arrivals: Vec::new(),
            }],
            magnitudes: Vec::new(),
            features: Vec::new(),
        };
        (accessor, event)
    }

    #[test]
    fn test_local_magnitude_attaches_estimate() {
        let (accessor, mut event) = setup();
        MagnitudeCalculator::Local(LocalMagnitude::default())
            .add_magnitude(&accessor, &mut event)
            .unwrap();
        assert_eq!(event.magnitudes.len(), 1);
        let magnitude = &event.magnitudes[0];
        assert_eq!(magnitude.magnitude, "ML");
        assert!(magnitude.average.is_finite());
    }

    #[test]
    fn test_amplitude_feature_covers_arrivals() {
        let (accessor, mut event) = setup();
        event.receivers[0].phase_arrivals.push(crate::detection::PhaseDetection {
            phase: "cake:P".into(),
            model: crate::traveltime::ModelledArrival {
                phase: "cake:P".into(),
                time: event.time + Duration::seconds(1),
            },
            observed: None,
        });

        FeatureExtractor::WaveformAmplitudes(WaveformAmplitudes::default())
            .add_features(&accessor, &mut event)
            .unwrap();
        assert_eq!(event.features.len(), 1);
        let value = event.features[0].value.as_object().unwrap();
        assert!(value.contains_key("XX.AAA.:cake:P"));
    }
}
