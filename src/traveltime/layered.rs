//! Travel times through 1-D layered earth models.
//!
//! First arrivals combine the direct ray (solved by bisection on the ray
//! parameter) with head waves refracted along deeper, faster interfaces.
//! Because evaluating a single time is expensive at octree scale, the
//! solver is sampled into a persisted [`SpTree`] per phase; batch queries
//! run against a byte-bounded LRU keyed by the content hash of the
//! coordinate rows, so identical geometries return bit-identical times.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::cache::ByteLru;
use crate::error::{QSeekError, Result};
use crate::geo::Location;
use crate::octree::Octree;
use crate::station::Stations;
use crate::traveltime::earthmodel::{EarthModel, Layer, Wave};
use crate::traveltime::sptree::SpTree;
use crate::traveltime::ModelledArrival;
use crate::util::{sha256_hex_f64, CacheDir};

const TABLE_MAGIC: &[u8; 5] = b"QSTT1";

/// Phase rule, e.g. `P,p`: the first arrival among the listed phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timing {
    pub definition: String,
}

impl Timing {
    pub fn new(definition: &str) -> Self {
        Self {
            definition: definition.to_string(),
        }
    }

    /// Identifier usable in file names, separators stripped.
    pub fn id(&self) -> String {
        self.definition
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect()
    }

    /// The wave type all listed phases agree on.
    pub fn wave(&self) -> Result<Wave> {
        let mut wave = None;
        for phase in self.definition.split(',') {
            let leg = match phase.trim().chars().next() {
                Some('P' | 'p') => Wave::P,
                Some('S' | 's') => Wave::S,
                other => {
                    return Err(QSeekError::config(format!(
                        "unsupported phase definition {other:?} in {:?}",
                        self.definition
                    )));
                }
            };
            if *wave.get_or_insert(leg) != leg {
                return Err(QSeekError::config(format!(
                    "mixed wave types in phase definition {:?}",
                    self.definition
                )));
            }
        }
        wave.ok_or_else(|| QSeekError::config("empty phase definition"))
    }
}

/// Constant-velocity segments of the profile between two depths.
///
/// Depths below the deepest layer extend it; depths above the model top
/// clamp to it.
fn segments_between(profile: &[Layer], z_top: f64, z_bottom: f64) -> Vec<(f64, f64)> {
    let mut segments = Vec::new();
    if z_bottom <= z_top {
        return segments;
    }
    for layer in profile {
        let top = layer.top.max(z_top);
        let bottom = layer.bottom.min(z_bottom);
        if bottom > top {
            segments.push((bottom - top, layer.velocity));
        }
    }
    if let Some(last) = profile.last() {
        if z_bottom > last.bottom {
            segments.push((z_bottom - last.bottom.max(z_top), last.velocity));
        }
    }
    segments
}

fn velocity_at(profile: &[Layer], depth: f64) -> f64 {
    for layer in profile {
        if depth < layer.bottom {
            return layer.velocity;
        }
    }
    profile.last().map_or(0.0, |layer| layer.velocity)
}

/// Direct ray time through the segments for a horizontal offset `x`,
/// solved by bisection on the ray parameter.
fn direct_time(segments: &[(f64, f64)], x: f64) -> Option<f64> {
    if segments.is_empty() {
        return None;
    }
    if x <= 0.0 {
        return Some(segments.iter().map(|&(h, v)| h / v).sum());
    }

    let v_max = segments.iter().map(|&(_, v)| v).fold(0.0, f64::max);
    let offset = |p: f64| -> f64 {
        segments
            .iter()
            .map(|&(h, v)| {
                let sin = p * v;
                h * sin / (1.0 - sin * sin).sqrt()
            })
            .sum()
    };

    let mut lo = 0.0;
    let mut hi = (1.0 - 1e-12) / v_max;
    if offset(hi) < x {
        // Numerically saturated, the ray grazes the fastest segment.
        lo = hi;
    }
    for _ in 0..80 {
        let mid = 0.5 * (lo + hi);
        if offset(mid) < x {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let p = 0.5 * (lo + hi);
    let time = segments
        .iter()
        .map(|&(h, v)| {
            let sin = p * v;
            h / (v * (1.0 - sin * sin).sqrt())
        })
        .sum();
    Some(time)
}

/// Head wave along the interface at `z_refractor` with velocity `v_ref`.
fn head_wave_time(
    profile: &[Layer],
    z_source: f64,
    z_receiver: f64,
    z_refractor: f64,
    v_ref: f64,
    x: f64,
) -> Option<f64> {
    let mut leg_time = 0.0;
    let mut leg_offset = 0.0;
    for z_start in [z_source, z_receiver] {
        for (h, v) in segments_between(profile, z_start, z_refractor) {
            if v >= v_ref {
                return None;
            }
            let sin = v / v_ref;
            let cos = (1.0 - sin * sin).sqrt();
            leg_offset += h * sin / cos;
            leg_time += h / (v * cos);
        }
    }
    if leg_offset > x {
        // Inside the critical distance.
        return None;
    }
    Some((x - leg_offset) / v_ref + leg_time)
}

/// First arrival between two depths separated by a 3-D slant distance.
pub fn first_arrival(
    profile: &[Layer],
    source_depth: f64,
    receiver_depth: f64,
    slant_distance: f64,
) -> Option<f64> {
    if profile.is_empty() {
        return None;
    }
    let model_top = profile.first().map_or(0.0, |layer| layer.top);
    let z_source = source_depth.max(model_top);
    let z_receiver = receiver_depth.max(model_top);

    let z_lo = z_source.min(z_receiver);
    let z_hi = z_source.max(z_receiver);
    let dz = z_hi - z_lo;
    let x = (slant_distance * slant_distance - dz * dz).max(0.0).sqrt();

    let mut best: Option<f64> = None;
    let mut consider = |candidate: Option<f64>| {
        if let Some(time) = candidate {
            best = Some(best.map_or(time, |current| current.min(time)));
        }
    };

    // Direct ray.
    if dz > 0.0 {
        consider(direct_time(&segments_between(profile, z_lo, z_hi), x));
    } else {
        consider(Some(x / velocity_at(profile, z_lo)));
    }

    // Head waves along deeper, faster interfaces.
    for layer in profile {
        if layer.top <= z_hi {
            continue;
        }
        consider(head_wave_time(
            profile,
            z_source,
            z_receiver,
            layer.top,
            layer.velocity,
            x,
        ));
    }

    best
}

/// A persisted travel-time table for one phase rule and earth model.
#[derive(Debug, Serialize, Deserialize)]
pub struct TravelTimeTree {
    pub earthmodel: EarthModel,
    pub timing: Timing,
    pub earthmodel_hash: String,

    pub distance_bounds: (f64, f64),
    pub source_depth_bounds: (f64, f64),
    pub receiver_depth_bounds: (f64, f64),
    pub time_tolerance: f64,
    pub spatial_tolerance: f64,

    pub created: DateTime<Utc>,

    #[serde(skip)]
    sptree: Option<SpTree>,
    #[serde(skip)]
    file: Option<PathBuf>,
    #[serde(skip)]
    cache: Option<Mutex<ByteLru<String, Vec<f32>>>>,
}

impl TravelTimeTree {
    /// Sample a fresh table for the given geometry.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        earthmodel: EarthModel,
        timing: Timing,
        distance_bounds: (f64, f64),
        source_depth_bounds: (f64, f64),
        receiver_depth_bounds: (f64, f64),
        time_tolerance: f64,
        spatial_tolerance: f64,
    ) -> Result<Self> {
        earthmodel.validate()?;
        let wave = timing.wave()?;
        let profile = earthmodel.profile(wave);

        info!(
            "pre-calculating traveltime tree for {:?} ({:?})",
            timing.definition, wave
        );
        let sptree = SpTree::build(
            |[receiver_depth, source_depth, distance]| {
                first_arrival(&profile, source_depth, receiver_depth, distance)
            },
            [
                [receiver_depth_bounds.0, receiver_depth_bounds.1],
                [source_depth_bounds.0, source_depth_bounds.1],
                [distance_bounds.0, distance_bounds.1],
            ],
            time_tolerance,
            spatial_tolerance,
        )?;
        debug!("sampled traveltime tree with {} cells", sptree.n_leaves());

        Ok(Self {
            earthmodel_hash: earthmodel.hash(),
            earthmodel,
            timing,
            distance_bounds,
            source_depth_bounds,
            receiver_depth_bounds,
            time_tolerance,
            spatial_tolerance,
            created: Utc::now(),
            sptree: Some(sptree),
            file: None,
            cache: None,
        })
    }

    /// Reuse check: enclosing bounds, tolerances at least as tight, and
    /// the identical model.
    #[allow(clippy::too_many_arguments)]
    pub fn is_suited(
        &self,
        timing: &Timing,
        earthmodel_hash: &str,
        distance_bounds: (f64, f64),
        source_depth_bounds: (f64, f64),
        receiver_depth_bounds: (f64, f64),
        time_tolerance: f64,
        spatial_tolerance: f64,
    ) -> bool {
        let encloses = |own: (f64, f64), requested: (f64, f64)| {
            own.0 <= requested.0 && own.1 >= requested.1
        };
        self.timing == *timing
            && self.earthmodel_hash == earthmodel_hash
            && encloses(self.distance_bounds, distance_bounds)
            && encloses(self.source_depth_bounds, source_depth_bounds)
            && encloses(self.receiver_depth_bounds, receiver_depth_bounds)
            && self.time_tolerance <= time_tolerance
            && self.spatial_tolerance <= spatial_tolerance
    }

    pub fn filename(&self) -> String {
        format!("{}-{}.sptree", self.timing.id(), self.earthmodel_hash)
    }

    /// Persist header and tree payload into a single archive file.
    pub fn save(&self, directory: &Path) -> Result<PathBuf> {
        let sptree = self
            .sptree
            .as_ref()
            .ok_or_else(|| QSeekError::table("travel time tree has not been calculated"))?;
        let file = directory.join(self.filename());
        info!("saving traveltimes to {}", file.display());

        let mut writer = BufWriter::new(File::create(&file)?);
        let header = serde_json::to_vec(self)?;
        writer.write_all(TABLE_MAGIC)?;
        writer.write_u32::<LittleEndian>(header.len() as u32)?;
        writer.write_all(&header)?;
        sptree.write_to(&mut writer)?;
        writer.flush()?;
        Ok(file)
    }

    /// Load the header of a persisted table; the payload stays on disk
    /// until [`Self::ensure_loaded`].
    pub fn load(file: &Path) -> Result<Self> {
        debug!("loading traveltimes from {}", file.display());
        let mut reader = BufReader::new(File::open(file)?);
        let mut magic = [0_u8; 5];
        reader.read_exact(&mut magic)?;
        if &magic != TABLE_MAGIC {
            return Err(QSeekError::table(format!(
                "{} is not a traveltime archive",
                file.display()
            )));
        }
        let header_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut header = vec![0_u8; header_len];
        reader.read_exact(&mut header)?;
        let mut tree: Self = serde_json::from_slice(&header)?;
        tree.file = Some(file.to_path_buf());
        Ok(tree)
    }

    /// Load the sampled tree payload from the archive if not in memory.
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if self.sptree.is_some() {
            return Ok(());
        }
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| QSeekError::table("travel time tree has no backing file"))?;
        let mut reader = BufReader::new(File::open(file)?);
        let mut magic = [0_u8; 5];
        reader.read_exact(&mut magic)?;
        let header_len = reader.read_u32::<LittleEndian>()? as usize;
        reader.seek_relative(header_len as i64)?;
        self.sptree = Some(SpTree::read_from(&mut reader)?);
        Ok(())
    }

    /// Bound the coordinate-hash LRU.
    pub fn init_cache(&mut self, capacity_bytes: usize) {
        self.cache = Some(Mutex::new(ByteLru::new(capacity_bytes)));
    }

    fn sptree(&self) -> Result<&SpTree> {
        self.sptree
            .as_ref()
            .ok_or_else(|| QSeekError::table("travel time tree payload not loaded"))
    }

    /// Interpolate one source-receiver pair.
    pub fn get_travel_time(&self, source: &Location, receiver: &Location) -> Result<f64> {
        let sptree = self.sptree()?;
        Ok(sptree.interpolate([
            receiver.effective_depth(),
            source.effective_depth(),
            receiver.distance_to(source),
        ]))
    }

    /// Interpolate the full `[n_nodes × n_stations]` matrix.
    ///
    /// Each node's coordinate row is keyed by its content hash; repeated
    /// queries with identical coordinates are served from the LRU and
    /// return bit-identical times.
    pub fn get_travel_times(&self, octree: &Octree, stations: &Stations) -> Result<Vec<f64>> {
        let sptree = self.sptree()?;
        let receiver_depths: Vec<f64> = stations.iter().map(|sta| sta.effective_depth()).collect();
        let n_stations = receiver_depths.len();
        debug!("calculating traveltimes for {n_stations} stations");

        let mut times = Vec::with_capacity(octree.n_nodes() * n_stations);
        let mut coords = Vec::with_capacity(n_stations);
        let mut flat = Vec::with_capacity(n_stations * 3);

        for node in octree.iter_leaves() {
            let location = octree.node_location(node);
            coords.clear();
            flat.clear();
            for (station, receiver_depth) in stations.iter().zip(&receiver_depths) {
                let row = [
                    *receiver_depth,
                    location.effective_depth(),
                    station.distance_to(&location),
                ];
                flat.extend_from_slice(&row);
                coords.push(row);
            }

            let row_times = self.cached_interpolation(sptree, &flat, &coords)?;
            times.extend(row_times.iter().map(|&t| t as f64));
        }
        Ok(times)
    }

    fn cached_interpolation(
        &self,
        sptree: &SpTree,
        flat: &[f64],
        coords: &[[f64; 3]],
    ) -> Result<Vec<f32>> {
        let Some(cache) = &self.cache else {
            return Ok(sptree
                .interpolate_many(coords)
                .into_iter()
                .map(|t| t as f32)
                .collect());
        };

        let key = sha256_hex_f64(flat);
        let mut cache = cache.lock().expect("traveltime cache lock");
        if let Some(times) = cache.get(&key) {
            return Ok(times.clone());
        }
        let times: Vec<f32> = sptree
            .interpolate_many(coords)
            .into_iter()
            .map(|t| t as f32)
            .collect();
        cache.insert(key, times.clone(), times.len() * 4 + 64);
        Ok(times)
    }

    pub fn cache_bytes(&self) -> usize {
        self.cache
            .as_ref()
            .map_or(0, |cache| cache.lock().expect("traveltime cache lock").used_bytes())
    }
}

fn default_timings() -> BTreeMap<String, Timing> {
    BTreeMap::from([
        ("cake:P".to_string(), Timing::new("P,p")),
        ("cake:S".to_string(), Timing::new("S,s")),
    ])
}

/// Ray tracer over a 1-D layered model with persisted lookup tables.
#[derive(Debug, Serialize, Deserialize)]
pub struct CakeTracer {
    #[serde(default = "default_timings")]
    pub timings: BTreeMap<String, Timing>,
    #[serde(default)]
    pub earthmodel: EarthModel,

    #[serde(skip)]
    trees: HashMap<String, TravelTimeTree>,
}

impl Default for CakeTracer {
    fn default() -> Self {
        Self {
            timings: default_timings(),
            earthmodel: EarthModel::default(),
            trees: HashMap::new(),
        }
    }
}

impl CakeTracer {
    /// Default phase rules over the given earth model.
    pub fn with_earthmodel(earthmodel: EarthModel) -> Self {
        Self {
            earthmodel,
            ..Default::default()
        }
    }

    pub fn get_available_phases(&self) -> Vec<String> {
        self.timings.keys().cloned().collect()
    }

    /// Build or reuse the per-phase tables for the requested phases.
    pub fn prepare(
        &mut self,
        octree: &Octree,
        stations: &Stations,
        phases: &[String],
        cache_dir: &CacheDir,
    ) -> Result<()> {
        let wanted: Vec<&String> = phases
            .iter()
            .filter(|phase| self.timings.contains_key(*phase))
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }
        self.earthmodel.validate()?;

        let table_dir = cache_dir.subdir("cake")?;
        let mut cached_trees = Vec::new();
        for entry in std::fs::read_dir(&table_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "sptree") {
                match TravelTimeTree::load(&path) {
                    Ok(tree) => cached_trees.push(tree),
                    Err(error) => {
                        log::warn!("skipping bad traveltime file {}: {error}", path.display());
                    }
                }
            }
        }

        let distances = octree.distances_stations(stations);
        let distance_bounds = (
            distances.iter().cloned().fold(f64::INFINITY, f64::min),
            distances.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        );
        let source_depth_bounds = octree.depth_bounds;
        let receiver_depths: Vec<f64> = stations.iter().map(|sta| sta.effective_depth()).collect();
        let receiver_depth_bounds = (
            receiver_depths.iter().cloned().fold(f64::INFINITY, f64::min),
            receiver_depths.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        );
        let spatial_tolerance = octree.size_limit / 2.0;
        let time_tolerance = octree.size_limit / (self.earthmodel.vmin() * 3.0);

        let model_hash = self.earthmodel.hash();
        let cache_bytes =
            (octree.n_nodes() * 8).max(64) * (stations.n_stations() * 4 + 64);

        for phase in wanted {
            let timing = &self.timings[phase];
            let position = cached_trees.iter().position(|tree| {
                tree.is_suited(
                    timing,
                    &model_hash,
                    distance_bounds,
                    source_depth_bounds,
                    receiver_depth_bounds,
                    time_tolerance,
                    spatial_tolerance,
                )
            });
            let mut tree = match position {
                Some(index) => {
                    info!("using cached traveltime tree for {phase}");
                    let mut tree = cached_trees.swap_remove(index);
                    tree.ensure_loaded()?;
                    tree
                }
                None => {
                    let tree = TravelTimeTree::new(
                        self.earthmodel.clone(),
                        timing.clone(),
                        distance_bounds,
                        source_depth_bounds,
                        receiver_depth_bounds,
                        time_tolerance,
                        spatial_tolerance,
                    )?;
                    tree.save(&table_dir)?;
                    tree
                }
            };
            tree.init_cache(cache_bytes);
            self.trees.insert(phase.clone(), tree);
        }
        Ok(())
    }

    fn tree(&self, phase: &str) -> Result<&TravelTimeTree> {
        self.trees
            .get(phase)
            .ok_or_else(|| QSeekError::table(format!("phase {phase} is not defined")))
    }

    pub fn get_travel_times(
        &self,
        phase: &str,
        octree: &Octree,
        stations: &Stations,
    ) -> Result<Vec<f64>> {
        let tree = self.tree(phase)?;
        debug!(
            "{phase} coordinate cache size is {}",
            crate::util::human_readable_bytes(tree.cache_bytes() as f64)
        );
        tree.get_travel_times(octree, stations)
    }

    pub fn get_travel_time(
        &self,
        phase: &str,
        source: &Location,
        receiver: &Location,
    ) -> Result<f64> {
        self.tree(phase)?.get_travel_time(source, receiver)
    }

    pub fn get_arrivals(
        &self,
        phase: &str,
        event_time: DateTime<Utc>,
        source: &Location,
        receivers: &Stations,
    ) -> Result<Vec<Option<ModelledArrival>>> {
        let tree = self.tree(phase)?;
        let mut arrivals = Vec::with_capacity(receivers.n_stations());
        for receiver in receivers.iter() {
            let time = tree.get_travel_time(source, &receiver.coords)?;
            arrivals.push(ModelledArrival::from_travel_time(phase, event_time, time));
        }
        Ok(arrivals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KM: f64 = 1e3;

    fn constant_profile(velocity: f64) -> Vec<Layer> {
        vec![Layer {
            top: 0.0,
            bottom: 50.0 * KM,
            velocity,
        }]
    }

    #[test]
    fn test_homogeneous_first_arrival_is_straight_ray() {
        let profile = constant_profile(5_500.0);
        for (zs, zr, slant) in [
            (5_000.0, 0.0, 7_071.0),
            (10_000.0, 0.0, 10_000.0),
            (3_000.0, 1_000.0, 2_000.0),
        ] {
            let time = first_arrival(&profile, zs, zr, slant).unwrap();
            assert!(
                (time - slant / 5_500.0).abs() < 1e-3,
                "time {time} for slant {slant}"
            );
        }
    }

    #[test]
    fn test_same_depth_horizontal_ray() {
        let profile = constant_profile(4_000.0);
        let time = first_arrival(&profile, 2_000.0, 2_000.0, 8_000.0).unwrap();
        assert!((time - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_head_wave_beats_direct_at_distance() {
        // Two layers: 5 km of 4 km/s over an 8 km/s half space.
        let profile = vec![
            Layer {
                top: 0.0,
                bottom: 5.0 * KM,
                velocity: 4_000.0,
            },
            Layer {
                top: 5.0 * KM,
                bottom: 50.0 * KM,
                velocity: 8_000.0,
            },
        ];
        // Surface source and receiver, 40 km apart.
        let x = 40.0 * KM;
        let time = first_arrival(&profile, 0.0, 0.0, x).unwrap();

        let direct = x / 4_000.0;
        let sin = 4_000.0 / 8_000.0_f64;
        let cos = (1.0 - sin * sin).sqrt();
        // Classic refraction formula: x/v2 + 2 h cos(theta)/v1.
        let expected = x / 8_000.0 + 2.0 * 5.0 * KM * cos / 4_000.0;
        assert!(time < direct);
        assert!((time - expected).abs() < 1e-6, "time {time} vs {expected}");

        // Close in, the direct wave is first.
        let near = first_arrival(&profile, 0.0, 0.0, 2.0 * KM).unwrap();
        assert!((near - 2.0 * KM / 4_000.0).abs() < 1e-6);
    }

    fn test_tree() -> TravelTimeTree {
        TravelTimeTree::new(
            EarthModel::constant(5_500.0, 3_200.0, 30.0 * KM),
            Timing::new("P,p"),
            (0.0, 30.0 * KM),
            (0.0, 20.0 * KM),
            (0.0, 100.0),
            0.05,
            250.0,
        )
        .unwrap()
    }

    #[test]
    fn test_tree_matches_analytic_times() {
        let tree = test_tree();
        let source = Location {
            depth: 5.0 * KM,
            ..Location::new(0.0, 0.0)
        };
        let receiver = Location {
            east_shift: 3.0 * KM,
            ..Location::new(0.0, 0.0)
        };
        let time = tree.get_travel_time(&source, &receiver).unwrap();
        let expected = (source.depth.hypot(3.0 * KM)) / 5_500.0;
        assert!((time - expected).abs() < 0.1, "time {time} vs {expected}");
    }

    #[test]
    fn test_persisted_tree_returns_identical_times() {
        let tree = test_tree();
        let dir = std::env::temp_dir().join(format!(
            "qseek_sptree_{}_{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let file = tree.save(&dir).unwrap();
        let mut restored = TravelTimeTree::load(&file).unwrap();
        assert_eq!(restored.earthmodel_hash, tree.earthmodel_hash);
        restored.ensure_loaded().unwrap();

        let source = Location {
            depth: 8.0 * KM,
            east_shift: 2.0 * KM,
            ..Location::new(0.0, 0.0)
        };
        let receiver = Location::new(0.0, 0.0);
        let original = tree.get_travel_time(&source, &receiver).unwrap();
        let reloaded = restored.get_travel_time(&source, &receiver).unwrap();
        assert_eq!(original.to_bits(), reloaded.to_bits());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_is_suited_bounds_logic() {
        let tree = test_tree();
        let timing = Timing::new("P,p");
        let hash = tree.earthmodel_hash.clone();

        // Narrower request within bounds: suited.
        assert!(tree.is_suited(
            &timing,
            &hash,
            (1_000.0, 20.0 * KM),
            (1_000.0, 10.0 * KM),
            (0.0, 50.0),
            0.1,
            500.0,
        ));
        // Wider distance bounds: not suited.
        assert!(!tree.is_suited(
            &timing,
            &hash,
            (0.0, 60.0 * KM),
            (0.0, 10.0 * KM),
            (0.0, 50.0),
            0.1,
            500.0,
        ));
        // Tighter tolerance than sampled: not suited.
        assert!(!tree.is_suited(
            &timing,
            &hash,
            (0.0, 20.0 * KM),
            (0.0, 10.0 * KM),
            (0.0, 50.0),
            0.01,
            500.0,
        ));
        // Different model: not suited.
        assert!(!tree.is_suited(
            &timing,
            "deadbeef",
            (0.0, 20.0 * KM),
            (0.0, 10.0 * KM),
            (0.0, 50.0),
            0.1,
            500.0,
        ));
    }

    #[test]
    fn test_repeated_batch_queries_are_bit_identical() {
        use crate::octree::Octree;
        use crate::station::{Station, Stations};

        let mut tree = test_tree();
        tree.init_cache(16 * 1024 * 1024);

        let mut octree = Octree::with_bounds(
            2.0 * KM,
            500.0,
            (-4.0 * KM, 4.0 * KM),
            (-4.0 * KM, 4.0 * KM),
            (0.0, 8.0 * KM),
        );
        octree.init().unwrap();

        let mut stations = Stations::from_stations(
            (0..3)
                .map(|i| Station {
                    network: "XX".into(),
                    station: format!("S{i:02}"),
                    location_code: String::new(),
                    coords: Location {
                        east_shift: 1_000.0 + i as f64 * 700.0,
                        ..Location::new(0.0, 0.0)
                    },
                })
                .collect(),
        );
        stations.load().unwrap();

        let first = tree.get_travel_times(&octree, &stations).unwrap();
        let second = tree.get_travel_times(&octree, &stations).unwrap();
        assert_eq!(first.len(), octree.n_nodes() * 3);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_out_of_bounds_is_nan() {
        let tree = test_tree();
        let source = Location {
            depth: 25.0 * KM,
            ..Location::new(0.0, 0.0)
        };
        let receiver = Location::new(0.0, 0.0);
        assert!(tree.get_travel_time(&source, &receiver).unwrap().is_nan());
    }

    #[test]
    fn test_timing_parsing() {
        assert_eq!(Timing::new("P,p").id(), "Pp");
        assert_eq!(Timing::new("P,p").wave().unwrap(), Wave::P);
        assert_eq!(Timing::new("S,s").wave().unwrap(), Wave::S);
        assert!(Timing::new("P,s").wave().is_err());
        assert!(Timing::new("x").wave().is_err());
    }
}
