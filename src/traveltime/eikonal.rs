//! 3-D travel times from fast-marching eikonal solutions.
//!
//! For every station a first-arrival time volume is solved on a regular
//! Cartesian grid covering the octree box, with the station seeding time
//! zero. Volumes persist to the cache directory and are queried by
//! nearest or trilinear interpolation at node centers; per-node rows are
//! kept in a byte-bounded LRU like the 1-D tables.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cache::ByteLru;
use crate::error::{QSeekError, Result};
use crate::geo::Location;
use crate::octree::{NodeKey, Octree};
use crate::station::{Station, Stations};
use crate::traveltime::earthmodel::{VelocityGrid3D, VelocityModel};
use crate::traveltime::npy::{read_npy_f32, write_npy_f32};
use crate::traveltime::ModelledArrival;
use crate::util::CacheDir;

const VOLUME_MAGIC: &[u8; 5] = b"QS3DT";
const MB: usize = 1024 * 1024;

/// Solve the eikonal equation `|∇T| = 1/v` on the grid by fast marching,
/// seeding time zero at `seed`.
pub fn eikonal_solve(grid: &VelocityGrid3D, seed: [usize; 3]) -> Result<Vec<f32>> {
    let [n_east, n_north, n_depth] = grid.shape;
    let n_total = n_east * n_north * n_depth;
    let spacing = grid.grid_spacing;

    let mut times = vec![f64::INFINITY; n_total];
    let mut frozen = vec![false; n_total];
    // Min-heap on the bit pattern; valid for non-negative times.
    let mut narrow: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();

    let seed_index = grid.index(seed[0], seed[1], seed[2]);
    times[seed_index] = 0.0;
    narrow.push(Reverse((0_u64, seed_index)));

    let strides = [n_north * n_depth, n_depth, 1];
    let shape = [n_east, n_north, n_depth];

    while let Some(Reverse((_, index))) = narrow.pop() {
        if frozen[index] {
            continue;
        }
        frozen[index] = true;

        let coords = [
            index / strides[0],
            (index / strides[1]) % n_north,
            index % n_depth,
        ];

        for axis in 0..3 {
            for direction in [-1_isize, 1] {
                let position = coords[axis] as isize + direction;
                if position < 0 || position as usize >= shape[axis] {
                    continue;
                }
                let neighbor =
                    (index as isize + direction * strides[axis] as isize) as usize;
                if frozen[neighbor] {
                    continue;
                }

                let velocity = grid.velocities[neighbor];
                if velocity <= 0.0 {
                    continue;
                }
                let updated = update_time(&times, neighbor, &strides, &shape, spacing / velocity);
                if updated < times[neighbor] {
                    times[neighbor] = updated;
                    narrow.push(Reverse((updated.to_bits(), neighbor)));
                }
            }
        }
    }

    Ok(times.into_iter().map(|t| t as f32).collect())
}

/// Solve the local quadratic update at `index` from the smallest known
/// neighbor time per axis.
fn update_time(
    times: &[f64],
    index: usize,
    strides: &[usize; 3],
    shape: &[usize; 3],
    h_slowness: f64,
) -> f64 {
    let coords = [
        index / strides[0],
        (index / strides[1]) % shape[1],
        index % shape[2],
    ];

    let mut known = [f64::INFINITY; 3];
    for axis in 0..3 {
        let mut best = f64::INFINITY;
        if coords[axis] > 0 {
            best = best.min(times[index - strides[axis]]);
        }
        if coords[axis] + 1 < shape[axis] {
            best = best.min(times[index + strides[axis]]);
        }
        known[axis] = best;
    }
    known.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let [a1, a2, a3] = known;
    if !a1.is_finite() {
        return f64::INFINITY;
    }

    // One-sided update.
    let mut time = a1 + h_slowness;
    if time <= a2 {
        return time;
    }
    // Two axes contribute.
    let discriminant = 2.0 * h_slowness * h_slowness - (a1 - a2) * (a1 - a2);
    if discriminant >= 0.0 {
        time = 0.5 * (a1 + a2 + discriminant.sqrt());
        if time <= a3 {
            return time;
        }
    }
    // All three axes contribute.
    let sum = a1 + a2 + a3;
    let sum_sq = a1 * a1 + a2 * a2 + a3 * a3;
    let discriminant = sum * sum - 3.0 * (sum_sq - h_slowness * h_slowness);
    if discriminant >= 0.0 {
        let candidate = (sum + discriminant.sqrt()) / 3.0;
        if candidate >= a3 {
            return candidate;
        }
    }
    time
}

/// Interpolation scheme for volume queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationMethod {
    Nearest,
    #[default]
    Linear,
}

/// Per-station first-arrival volume with its grid geometry.
#[derive(Debug, Serialize, Deserialize)]
pub struct StationTravelTimeVolume {
    pub station: Station,
    pub center: Location,
    pub velocity_model_hash: String,

    pub east_bounds: (f64, f64),
    pub north_bounds: (f64, f64),
    pub depth_bounds: (f64, f64),
    pub grid_spacing: f64,

    pub created: DateTime<Utc>,

    #[serde(skip)]
    shape: [usize; 3],
    #[serde(skip)]
    travel_times: Option<Vec<f32>>,
    #[serde(skip)]
    file: Option<PathBuf>,
}

impl StationTravelTimeVolume {
    /// Solve the station's volume on the velocity grid.
    pub fn calculate(model: &VelocityGrid3D, station: &Station) -> Result<Self> {
        let seed = model.station_index(station)?;
        debug!(
            "calculating travel time volume for {}, grid size {:?}, spacing {} m",
            station.nsl(),
            model.shape,
            model.grid_spacing
        );
        let travel_times = eikonal_solve(model, seed)?;
        Ok(Self {
            station: station.clone(),
            center: model.center,
            velocity_model_hash: model.hash(),
            east_bounds: model.east_bounds,
            north_bounds: model.north_bounds,
            depth_bounds: model.depth_bounds,
            grid_spacing: model.grid_spacing,
            created: Utc::now(),
            shape: model.shape,
            travel_times: Some(travel_times),
            file: None,
        })
    }

    pub fn filename(&self) -> String {
        format!("{}-{}.3dtt", self.station.nsl(), self.velocity_model_hash)
    }

    /// Persist header and float32 volume into a single archive file.
    pub fn save(&self, directory: &Path) -> Result<PathBuf> {
        let travel_times = self
            .travel_times
            .as_ref()
            .ok_or_else(|| QSeekError::table("travel times have not been calculated yet"))?;
        let file = directory.join(self.filename());
        debug!("saving travel times to {}", file.display());

        let mut writer = BufWriter::new(File::create(&file)?);
        let header = serde_json::to_vec(self)?;
        writer.write_all(VOLUME_MAGIC)?;
        writer.write_u32::<LittleEndian>(header.len() as u32)?;
        writer.write_all(&header)?;
        write_npy_f32(&mut writer, self.shape, travel_times)?;
        writer.flush()?;
        Ok(file)
    }

    /// Read the header of a persisted volume; the payload loads lazily.
    pub fn load(file: &Path) -> Result<Self> {
        debug!("loading travel times from {}", file.display());
        let mut reader = BufReader::new(File::open(file)?);
        let mut magic = [0_u8; 5];
        reader.read_exact(&mut magic)?;
        if &magic != VOLUME_MAGIC {
            return Err(QSeekError::table(format!(
                "{} is not a travel time volume",
                file.display()
            )));
        }
        let header_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut header = vec![0_u8; header_len];
        reader.read_exact(&mut header)?;
        let mut volume: Self = serde_json::from_slice(&header)?;
        volume.file = Some(file.to_path_buf());
        Ok(volume)
    }

    /// Map the archive and pull the volume into memory if needed.
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if self.travel_times.is_some() {
            return Ok(());
        }
        let path = self
            .file
            .as_ref()
            .ok_or_else(|| QSeekError::table("travel time volume has no backing file"))?;
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }
            .map_err(|e| QSeekError::io(format!("cannot map {}: {e}", path.display())))?;

        let mut cursor = Cursor::new(&mmap[..]);
        let mut magic = [0_u8; 5];
        cursor.read_exact(&mut magic)?;
        let header_len = cursor.read_u32::<LittleEndian>()? as usize;
        cursor.set_position(cursor.position() + header_len as u64);

        let (shape, travel_times) = read_npy_f32(&mut cursor)?;
        self.shape = shape;
        self.travel_times = Some(travel_times);
        Ok(())
    }

    fn times(&self) -> Result<&[f32]> {
        self.travel_times
            .as_deref()
            .ok_or_else(|| QSeekError::table("travel time volume payload not loaded"))
    }

    /// Interpolate at an `(east, north, depth)` offset from the volume
    /// center; NaN outside the grid.
    pub fn interpolate(&self, offset: (f64, f64, f64), method: InterpolationMethod) -> Result<f64> {
        let times = self.times()?;
        let fractional = [
            (offset.0 - self.east_bounds.0) / self.grid_spacing,
            (offset.1 - self.north_bounds.0) / self.grid_spacing,
            (offset.2 - self.depth_bounds.0) / self.grid_spacing,
        ];
        for (axis, &value) in fractional.iter().enumerate() {
            if value < 0.0 || value > (self.shape[axis] - 1) as f64 {
                return Ok(f64::NAN);
            }
        }

        let index =
            |e: usize, n: usize, d: usize| (e * self.shape[1] + n) * self.shape[2] + d;

        match method {
            InterpolationMethod::Nearest => {
                let e = fractional[0].round() as usize;
                let n = fractional[1].round() as usize;
                let d = fractional[2].round() as usize;
                Ok(times[index(e, n, d)] as f64)
            }
            InterpolationMethod::Linear => {
                let lower: Vec<usize> = fractional
                    .iter()
                    .zip(self.shape)
                    .map(|(&f, n)| (f.floor() as usize).min(n.saturating_sub(2)))
                    .collect();
                let t: Vec<f64> = fractional
                    .iter()
                    .zip(&lower)
                    .map(|(&f, &lo)| f - lo as f64)
                    .collect();

                let mut value = 0.0;
                for corner in 0..8 {
                    let offsets = [(corner >> 2) & 1, (corner >> 1) & 1, corner & 1];
                    let mut weight = 1.0;
                    for axis in 0..3 {
                        weight *= if offsets[axis] == 1 {
                            t[axis]
                        } else {
                            1.0 - t[axis]
                        };
                    }
                    if weight == 0.0 {
                        continue;
                    }
                    let e = (lower[0] + offsets[0]).min(self.shape[0] - 1);
                    let n = (lower[1] + offsets[1]).min(self.shape[1] - 1);
                    let d = (lower[2] + offsets[2]).min(self.shape[2] - 1);
                    value += weight * times[index(e, n, d)] as f64;
                }
                Ok(value)
            }
        }
    }
}

fn default_lut_cache_size() -> usize {
    256 * MB
}

/// Eikonal tracer for a single phase.
#[derive(Debug, Serialize, Deserialize)]
pub struct FastMarchingPhaseTracer {
    pub velocity_model: VelocityModel,
    #[serde(default)]
    pub interpolation_method: InterpolationMethod,
    #[serde(default = "default_lut_cache_size")]
    pub lut_cache_size: usize,

    #[serde(skip)]
    volumes: HashMap<String, StationTravelTimeVolume>,
    #[serde(skip)]
    station_order: Vec<String>,
    #[serde(skip)]
    node_lut: Option<Mutex<ByteLru<NodeKey, Vec<f32>>>>,
}

impl FastMarchingPhaseTracer {
    pub fn new(velocity_model: VelocityModel) -> Self {
        Self {
            velocity_model,
            interpolation_method: InterpolationMethod::default(),
            lut_cache_size: default_lut_cache_size(),
            volumes: HashMap::new(),
            station_order: Vec::new(),
            node_lut: None,
        }
    }

    /// Build or load the per-station volumes. Stations outside the
    /// velocity model box are blacklisted.
    pub fn prepare(
        &mut self,
        octree: &Octree,
        stations: &mut Stations,
        grid_spacing: f64,
        cache_dir: &CacheDir,
    ) -> Result<()> {
        let grid = self.velocity_model.build_grid(octree, grid_spacing)?;

        let outside: Vec<String> = stations
            .iter()
            .filter(|station| !grid.is_inside(station))
            .map(Station::nsl)
            .collect();
        for nsl in outside {
            stations.blacklist_station(&nsl, "outside the velocity model")?;
        }

        let model_hash = grid.hash();
        let volume_dir = cache_dir.subdir(&format!("fast-marching-cache/{model_hash}"))?;

        for entry in std::fs::read_dir(&volume_dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == "3dtt") {
                continue;
            }
            match StationTravelTimeVolume::load(&path) {
                Ok(volume) if volume.velocity_model_hash == model_hash => {
                    self.volumes.insert(volume.station.nsl(), volume);
                }
                Ok(volume) => {
                    warn!("stale travel time volume {}", volume.filename());
                }
                Err(error) => {
                    warn!("removing bad travel time file {}: {error}", path.display());
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        info!("loaded {} travel time volumes from cache", self.volumes.len());

        let missing: Vec<Station> = stations
            .iter()
            .filter(|station| !self.volumes.contains_key(&station.nsl()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            info!(
                "pre-calculating travel time volumes for {} stations...",
                missing.len()
            );
            let started = Utc::now();
            let solved: Vec<Result<StationTravelTimeVolume>> = missing
                .par_iter()
                .map(|station| {
                    let volume = StationTravelTimeVolume::calculate(&grid, station)?;
                    volume.save(&volume_dir)?;
                    Ok(volume)
                })
                .collect();
            for volume in solved {
                let volume = volume?;
                self.volumes.insert(volume.station.nsl(), volume);
            }
            info!(
                "pre-calculated travel time volumes in {}",
                Utc::now() - started
            );
        }

        for volume in self.volumes.values_mut() {
            volume.ensure_loaded()?;
        }
        self.station_order = stations.all_nsls();
        self.node_lut = Some(Mutex::new(ByteLru::new(self.lut_cache_size)));
        Ok(())
    }

    fn volume(&self, nsl: &str) -> Result<&StationTravelTimeVolume> {
        self.volumes
            .get(nsl)
            .ok_or_else(|| QSeekError::table(format!("no travel time volume for station {nsl}")))
    }

    pub fn get_travel_time(&self, source: &Location, receiver: &Station) -> Result<f64> {
        let volume = self.volume(&receiver.nsl())?;
        volume.interpolate(source.offset_from(&volume.center), self.interpolation_method)
    }

    /// Travel times `[n_nodes × n_stations]`, served through the node LUT.
    pub fn get_travel_times(&self, octree: &Octree, stations: &Stations) -> Result<Vec<f64>> {
        let mut station_indices = Vec::with_capacity(stations.n_stations());
        for nsl in stations.all_nsls() {
            let index = self
                .station_order
                .iter()
                .position(|candidate| *candidate == nsl)
                .ok_or_else(|| {
                    QSeekError::table(format!("station {nsl} missing from travel time volumes"))
                })?;
            station_indices.push(index);
        }

        let entry_bytes = self.station_order.len() * std::mem::size_of::<f32>();
        let mut lut = self
            .node_lut
            .as_ref()
            .ok_or_else(|| QSeekError::table("tracer not prepared"))?
            .lock()
            .expect("travel time LUT lock");

        let mut times = Vec::with_capacity(octree.n_nodes() * station_indices.len());
        for node in octree.iter_leaves() {
            let key = octree.node_key(node);
            if !lut.contains(&key) {
                let location = octree.node_location(node);
                let mut row = Vec::with_capacity(self.station_order.len());
                for nsl in &self.station_order {
                    let volume = self.volume(nsl)?;
                    let time = volume.interpolate(
                        location.offset_from(&volume.center),
                        self.interpolation_method,
                    )?;
                    row.push(time as f32);
                }
                lut.insert(key, row, entry_bytes);
            }
            let row = lut
                .get(&key)
                .ok_or_else(|| QSeekError::table("travel time LUT lost a filled node"))?;
            for &index in &station_indices {
                times.push(row[index] as f64);
            }
        }
        Ok(times)
    }
}

fn default_phase_tracers() -> BTreeMap<String, FastMarchingPhaseTracer> {
    BTreeMap::from([
        (
            "fm:P".to_string(),
            FastMarchingPhaseTracer::new(VelocityModel::Constant { velocity: 5_500.0 }),
        ),
        (
            "fm:S".to_string(),
            FastMarchingPhaseTracer::new(VelocityModel::Constant { velocity: 3_200.0 }),
        ),
    ])
}

/// Ray tracer backed by fast-marching volumes, one sub-tracer per phase.
#[derive(Debug, Serialize, Deserialize)]
pub struct FastMarchingTracer {
    #[serde(default = "default_phase_tracers")]
    pub tracers: BTreeMap<String, FastMarchingPhaseTracer>,
    /// Volume grid spacing in meters; defaults to the octree size limit.
    #[serde(default)]
    pub grid_spacing: Option<f64>,
}

impl Default for FastMarchingTracer {
    fn default() -> Self {
        Self {
            tracers: default_phase_tracers(),
            grid_spacing: None,
        }
    }
}

impl FastMarchingTracer {
    pub fn get_available_phases(&self) -> Vec<String> {
        self.tracers.keys().cloned().collect()
    }

    pub fn prepare(
        &mut self,
        octree: &Octree,
        stations: &mut Stations,
        phases: &[String],
        cache_dir: &CacheDir,
    ) -> Result<()> {
        let grid_spacing = self.grid_spacing.unwrap_or(octree.size_limit);
        for (phase, tracer) in &mut self.tracers {
            if phases.contains(phase) {
                tracer.prepare(octree, stations, grid_spacing, cache_dir)?;
            }
        }
        Ok(())
    }

    fn tracer(&self, phase: &str) -> Result<&FastMarchingPhaseTracer> {
        self.tracers
            .get(phase)
            .ok_or_else(|| QSeekError::table(format!("phase {phase} is not defined")))
    }

    pub fn get_travel_times(
        &self,
        phase: &str,
        octree: &Octree,
        stations: &Stations,
    ) -> Result<Vec<f64>> {
        self.tracer(phase)?.get_travel_times(octree, stations)
    }

    pub fn get_travel_time(
        &self,
        phase: &str,
        source: &Location,
        receiver: &Station,
    ) -> Result<f64> {
        self.tracer(phase)?.get_travel_time(source, receiver)
    }

    pub fn get_arrivals(
        &self,
        phase: &str,
        event_time: DateTime<Utc>,
        source: &Location,
        receivers: &Stations,
    ) -> Result<Vec<Option<ModelledArrival>>> {
        let tracer = self.tracer(phase)?;
        let mut arrivals = Vec::with_capacity(receivers.n_stations());
        for receiver in receivers.iter() {
            let time = tracer.get_travel_time(source, receiver)?;
            arrivals.push(ModelledArrival::from_travel_time(phase, event_time, time));
        }
        Ok(arrivals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KM: f64 = 1e3;

    fn octree() -> Octree {
        let mut tree = Octree::with_bounds(
            1.0 * KM,
            500.0,
            (-5.0 * KM, 5.0 * KM),
            (-5.0 * KM, 5.0 * KM),
            (0.0, 10.0 * KM),
        );
        tree.init().unwrap();
        tree
    }

    fn station(east: f64, north: f64) -> Station {
        Station {
            network: "XX".into(),
            station: "AAA".into(),
            location_code: String::new(),
            coords: Location {
                east_shift: east,
                north_shift: north,
                ..Location::new(0.0, 0.0)
            },
        }
    }

    #[test]
    fn test_constant_velocity_solution_matches_straight_ray() {
        let tree = octree();
        let grid = VelocityModel::Constant { velocity: 5_000.0 }
            .build_grid(&tree, 500.0)
            .unwrap();
        let sta = station(0.0, 0.0);
        let volume = StationTravelTimeVolume::calculate(&grid, &sta).unwrap();

        for (offset, distance) in [
            ((2.0 * KM, 0.0, 0.0), 2.0 * KM),
            ((0.0, 0.0, 5.0 * KM), 5.0 * KM),
            ((3.0 * KM, 0.0, 4.0 * KM), 5.0 * KM),
        ] {
            let time = volume
                .interpolate(offset, InterpolationMethod::Linear)
                .unwrap();
            let expected = distance / 5_000.0;
            let error = (time - expected).abs() / expected;
            assert!(
                error < 0.1,
                "time {time} vs {expected} at offset {offset:?}"
            );
        }
    }

    #[test]
    fn test_outside_grid_is_nan() {
        let tree = octree();
        let grid = VelocityModel::Constant { velocity: 5_000.0 }
            .build_grid(&tree, 500.0)
            .unwrap();
        let volume = StationTravelTimeVolume::calculate(&grid, &station(0.0, 0.0)).unwrap();
        let time = volume
            .interpolate((100.0 * KM, 0.0, 0.0), InterpolationMethod::Linear)
            .unwrap();
        assert!(time.is_nan());
    }

    #[test]
    fn test_volume_roundtrip() {
        let tree = octree();
        let grid = VelocityModel::Constant { velocity: 5_000.0 }
            .build_grid(&tree, 1.0 * KM)
            .unwrap();
        let volume = StationTravelTimeVolume::calculate(&grid, &station(1.0 * KM, 0.0)).unwrap();

        let dir = std::env::temp_dir().join(format!(
            "qseek_3dtt_{}_{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let file = volume.save(&dir).unwrap();

        let mut restored = StationTravelTimeVolume::load(&file).unwrap();
        assert_eq!(restored.velocity_model_hash, volume.velocity_model_hash);
        restored.ensure_loaded().unwrap();

        let offset = (2.0 * KM, -1.0 * KM, 3.0 * KM);
        let original = volume.interpolate(offset, InterpolationMethod::Linear).unwrap();
        let reloaded = restored.interpolate(offset, InterpolationMethod::Linear).unwrap();
        assert_eq!(original.to_bits(), reloaded.to_bits());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prepare_blacklists_outside_stations() {
        let tree = octree();
        let mut stations = Stations::from_stations(vec![
            station(0.0, 0.0),
            Station {
                station: "FAR".into(),
                ..station(100.0 * KM, 0.0)
            },
        ]);
        stations.load().unwrap();

        let cache = CacheDir::at(std::env::temp_dir().join(format!(
            "qseek_fmm_{}_{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        )));

        let mut tracer = FastMarchingPhaseTracer::new(VelocityModel::Constant {
            velocity: 5_000.0,
        });
        tracer.prepare(&tree, &mut stations, 1.0 * KM, &cache).unwrap();
        assert_eq!(stations.n_stations(), 1);

        let times = tracer.get_travel_times(&tree, &stations).unwrap();
        assert_eq!(times.len(), tree.n_nodes());
        assert!(times.iter().all(|t| t.is_finite()));

        let _ = cache.clear();
    }
}
