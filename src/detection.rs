//! Event detections and their append-only store.
//!
//! A finalized [`EventDetection`] carries the source location, the peak
//! semblance, per-receiver phase arrivals and the spatial uncertainty
//! estimated from the post-peak semblance distribution. Detections are
//! appended to a JSONL stream in the run directory and never mutated by
//! the search core afterwards.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{QSeekError, Result};
use crate::geo::Location;
use crate::octree::{Node, Octree};
use crate::semblance::SemblanceTrace;
use crate::station::Station;
use crate::traveltime::ModelledArrival;

/// Semblance fraction bounding the uncertainty volume, one standard
/// deviation under a Gaussian peak.
const UNCERTAINTY_THRESHOLD: f64 = 0.606_530_659_712_633_4; // 1/sqrt(e)

/// Axis-aligned uncertainty box as signed offsets from the peak node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionUncertainty {
    /// Uncertainty in east direction in meters.
    pub east: (f64, f64),
    /// Uncertainty in north direction in meters.
    pub north: (f64, f64),
    /// Uncertainty in depth in meters.
    pub depth: (f64, f64),
}

impl DetectionUncertainty {
    /// Bounding box of all leaves whose semblance exceeds the peak value
    /// scaled by `1/√e`, relative to the peak node center.
    pub fn from_peak_node(octree: &Octree, source_node: &Node) -> Result<Self> {
        if source_node.semblance <= 0.0 {
            return Err(QSeekError::data(
                "source node must have a semblance value",
            ));
        }
        let threshold = source_node.semblance * UNCERTAINTY_THRESHOLD as f32;

        let mut east = (f64::INFINITY, f64::NEG_INFINITY);
        let mut north = east;
        let mut depth = east;
        for node in octree.iter_leaves() {
            if node.semblance < threshold {
                continue;
            }
            let offsets = (
                node.east - source_node.east,
                node.north - source_node.north,
                node.depth - source_node.depth,
            );
            east = (east.0.min(offsets.0), east.1.max(offsets.0));
            north = (north.0.min(offsets.1), north.1.max(offsets.1));
            depth = (depth.0.min(offsets.2), depth.1.max(offsets.2));
        }
        Ok(Self { east, north, depth })
    }
}

/// Modelled and observed arrival of one phase at one receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDetection {
    pub phase: String,
    pub model: ModelledArrival,
    #[serde(default)]
    pub observed: Option<DateTime<Utc>>,
}

impl PhaseDetection {
    /// Observed minus modelled arrival in seconds.
    pub fn residual_seconds(&self) -> Option<f64> {
        let observed = self.observed?;
        Some((observed - self.model.time).num_microseconds()? as f64 * 1e-6)
    }
}

/// A receiver participating in a detection with its phase arrivals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReceiver {
    pub station: Station,
    #[serde(default)]
    pub phase_arrivals: Vec<PhaseDetection>,
}

/// Magnitude attached by a post-processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMagnitude {
    pub magnitude: String,
    pub average: f64,
    #[serde(default)]
    pub error: f64,
}

/// Generic feature attached by a post-processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFeature {
    pub feature: String,
    pub value: serde_json::Value,
}

/// A finalized event detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDetection {
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub location: Location,
    pub semblance: f32,
    pub distance_border: f64,
    pub in_bounds: bool,
    pub n_stations: usize,
    #[serde(default)]
    pub uncertainty: Option<DetectionUncertainty>,
    #[serde(default)]
    pub receivers: Vec<DetectionReceiver>,
    #[serde(default)]
    pub magnitudes: Vec<EventMagnitude>,
    #[serde(default)]
    pub features: Vec<EventFeature>,
}

impl EventDetection {
    pub fn add_receivers(
        &mut self,
        stations: impl IntoIterator<Item = Station>,
        phase_arrivals: Vec<Option<PhaseDetection>>,
    ) {
        for (station, arrival) in stations.into_iter().zip(phase_arrivals) {
            match self
                .receivers
                .iter_mut()
                .find(|receiver| receiver.station.nsl() == station.nsl())
            {
                Some(receiver) => {
                    receiver.phase_arrivals.extend(arrival);
                }
                None => {
                    self.receivers.push(DetectionReceiver {
                        station,
                        phase_arrivals: arrival.into_iter().collect(),
                    });
                }
            }
        }
    }
}

/// Append-only detection store in the run directory.
#[derive(Debug)]
pub struct EventDetections {
    rundir: PathBuf,
    detections: Vec<EventDetection>,
}

impl EventDetections {
    pub fn new(rundir: &Path) -> Result<Self> {
        fs::create_dir_all(rundir.join("detections"))?;
        Ok(Self {
            rundir: rundir.to_path_buf(),
            detections: Vec::new(),
        })
    }

    /// Load previously emitted detections from a run directory.
    pub fn load_rundir(rundir: &Path) -> Result<Self> {
        let mut store = Self::new(rundir)?;
        let file = store.detections_file();
        if file.exists() {
            let reader = BufReader::new(File::open(&file)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                store.detections.push(serde_json::from_str(&line)?);
            }
        }
        Ok(store)
    }

    fn detections_file(&self) -> PathBuf {
        self.rundir.join("detections").join("detections.jsonl")
    }

    fn semblance_file(&self) -> PathBuf {
        self.rundir.join("detections").join("semblance.dat")
    }

    pub fn n_detections(&self) -> usize {
        self.detections.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventDetection> {
        self.detections.iter()
    }

    pub fn latest(&self) -> Option<&EventDetection> {
        self.detections.last()
    }

    /// Append a detection to the JSONL stream.
    pub fn add(&mut self, detection: EventDetection) -> Result<()> {
        let mut line = serde_json::to_string(&detection)?;
        line.push('\n');
        append_with_retry(&self.detections_file(), line.as_bytes())?;
        self.detections.push(detection);
        Ok(())
    }

    /// Rewrite the JSONL stream with updated detections, e.g. after an
    /// offline feature-extraction pass.
    pub fn replace_all(&mut self, detections: Vec<EventDetection>) -> Result<()> {
        let mut payload = String::new();
        for detection in &detections {
            payload.push_str(&serde_json::to_string(detection)?);
            payload.push('\n');
        }
        fs::write(self.detections_file(), payload)?;
        self.detections = detections;
        Ok(())
    }

    /// Append a window's maximum-semblance trace to the binary log.
    pub fn add_semblance_trace(&self, trace: &SemblanceTrace) -> Result<()> {
        let mut record = Vec::with_capacity(20 + trace.samples.len() * 4);
        record
            .write_i64::<LittleEndian>(trace.start_time.timestamp_micros())
            .and_then(|()| record.write_f64::<LittleEndian>(trace.sampling_rate))
            .and_then(|()| record.write_u32::<LittleEndian>(trace.samples.len() as u32))?;
        for &sample in &trace.samples {
            record.write_f32::<LittleEndian>(sample)?;
        }
        append_with_retry(&self.semblance_file(), &record)
    }

    /// Export all detections as CSV next to the JSONL stream.
    pub fn export_csv(&self) -> Result<PathBuf> {
        let path = self.rundir.join("detections").join("detections.csv");
        let mut file = File::create(&path)?;
        writeln!(
            file,
            "time,lat,lon,east_shift,north_shift,depth,semblance,distance_border,in_bounds,n_stations"
        )?;
        for detection in &self.detections {
            let location = &detection.location;
            writeln!(
                file,
                "{},{},{},{},{},{},{},{},{},{}",
                detection.time.to_rfc3339(),
                location.lat,
                location.lon,
                location.east_shift,
                location.north_shift,
                location.depth,
                detection.semblance,
                detection.distance_border,
                detection.in_bounds,
                detection.n_stations
            )?;
        }
        Ok(path)
    }
}

/// Append bytes; persistent-state writes retry once before giving up.
fn append_with_retry(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut last_error = None;
    for attempt in 0..2 {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(bytes));
        match result {
            Ok(()) => return Ok(()),
            Err(error) => {
                if attempt == 0 {
                    warn!("write to {} failed, retrying: {error}", path.display());
                }
                last_error = Some(error);
            }
        }
    }
    Err(QSeekError::io(format!(
        "cannot write {}: {}",
        path.display(),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn temp_rundir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "qseek_detections_{tag}_{}_{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn detection(seconds: i64) -> EventDetection {
        EventDetection {
            time: DateTime::parse_from_rfc3339("2023-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
                + chrono::Duration::seconds(seconds),
            location: Location {
                depth: 5_000.0,
                ..Location::new(45.0, 11.0)
            },
            semblance: 0.5,
            distance_border: 1_000.0,
            in_bounds: true,
            n_stations: 5,
            uncertainty: None,
            receivers: Vec::new(),
            magnitudes: Vec::new(),
            features: Vec::new(),
        }
    }

    #[test]
    fn test_store_roundtrip() {
        let rundir = temp_rundir("roundtrip");
        let mut store = EventDetections::new(&rundir).unwrap();
        store.add(detection(0)).unwrap();
        store.add(detection(10)).unwrap();

        let restored = EventDetections::load_rundir(&rundir).unwrap();
        assert_eq!(restored.n_detections(), 2);
        assert_eq!(restored.latest().unwrap().time, detection(10).time);

        let _ = fs::remove_dir_all(&rundir);
    }

    #[test]
    fn test_csv_export() {
        let rundir = temp_rundir("csv");
        let mut store = EventDetections::new(&rundir).unwrap();
        store.add(detection(0)).unwrap();
        let path = store.export_csv().unwrap();
        let content = fs::read_to_string(path).unwrap();
        assert!(content.lines().count() == 2);
        assert!(content.contains("2023-01-01T00:00:00"));

        let _ = fs::remove_dir_all(&rundir);
    }

    #[test]
    fn test_uncertainty_bounding_box() {
        let mut octree = Octree::default();
        octree.init().unwrap();

        // Put the peak on one node and a neighbor above threshold.
        let n_nodes = octree.n_nodes();
        let mut semblance = vec![0.0_f32; n_nodes];
        semblance[0] = 1.0;
        semblance[1] = 0.7; // neighbor in depth direction
        semblance[2] = 0.1; // below 1/sqrt(e), excluded
        octree.map_semblance(&semblance).unwrap();

        let peak = octree.leaf(0).unwrap().clone();
        let uncertainty = DetectionUncertainty::from_peak_node(&octree, &peak).unwrap();
        assert_eq!(uncertainty.east, (0.0, 0.0));
        assert_eq!(uncertainty.north, (0.0, 0.0));
        assert_eq!(uncertainty.depth, (0.0, 2_000.0));
    }

    #[test]
    fn test_uncertainty_requires_semblance() {
        let mut octree = Octree::default();
        octree.init().unwrap();
        let node = octree.leaf(0).unwrap().clone();
        assert!(DetectionUncertainty::from_peak_node(&octree, &node).is_err());
    }

    #[test]
    fn test_add_receivers_merges_phases() {
        let mut event = detection(0);
        let station = Station {
            network: "XX".into(),
            station: "AAA".into(),
            location_code: String::new(),
            coords: Location::new(45.0, 11.0),
        };
        let arrival = PhaseDetection {
            phase: "cake:P".into(),
            model: ModelledArrival {
                phase: "cake:P".into(),
                time: event.time,
            },
            observed: None,
        };
        event.add_receivers([station.clone()], vec![Some(arrival.clone())]);
        let second = PhaseDetection {
            phase: "cake:S".into(),
            ..arrival
        };
        event.add_receivers([station], vec![Some(second)]);

        assert_eq!(event.receivers.len(), 1);
        assert_eq!(event.receivers[0].phase_arrivals.len(), 2);
        let phases: HashSet<_> = event.receivers[0]
            .phase_arrivals
            .iter()
            .map(|p| p.phase.clone())
            .collect();
        assert_eq!(phases.len(), 2);
    }
}
