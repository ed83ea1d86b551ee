//! Streaming search controller.
//!
//! Owns the run directory, prepares the travel-time tables, consumes the
//! provider's chronologically ordered batch stream, runs one
//! [`SearchTraces`] frame per window and dispatches finalized detections
//! to the post-processors under a bounded concurrency cap. Progress is
//! persisted only after a batch's detections are safely appended, so an
//! interrupted run resumes without losing or duplicating events.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::corrections::StationCorrections;
use crate::detection::{EventDetection, EventDetections};
use crate::error::{QSeekError, Result};
use crate::image::ImageFunctions;
use crate::octree::Octree;
use crate::postprocess::{FeatureExtractor, MagnitudeCalculator};
use crate::provider::{WaveformAccessor, WaveformProvider};
use crate::search::{SearchContext, SearchTraces};
use crate::station::Stations;
use crate::stats::SearchStats;
use crate::traveltime::RayTracers;
use crate::util::{time_to_path, CacheDir};
use crate::weights::StationWeights;

/// Supported image sampling rates in Hz.
const SAMPLING_RATES: [f64; 5] = [10.0, 20.0, 25.0, 50.0, 100.0];

/// Concurrency cap for post-detection magnitude and feature extraction.
const POST_PROCESSING_CONCURRENCY: usize = 8;

fn default_sampling_rate() -> f64 {
    100.0
}

fn default_detection_threshold() -> f32 {
    0.05
}

fn default_node_split_threshold() -> f32 {
    0.9
}

fn default_detection_blinding() -> f64 {
    2.0
}

fn default_image_mean_p() -> f32 {
    1.0
}

fn default_window_length() -> f64 {
    300.0
}

fn default_n_threads_argmax() -> usize {
    4
}

/// The persisted search configuration (`search.json`).
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,
    #[serde(default)]
    pub stations: Stations,
    #[serde(default)]
    pub data_provider: WaveformProvider,
    #[serde(default)]
    pub octree: Octree,
    #[serde(default)]
    pub image_functions: ImageFunctions,
    #[serde(default)]
    pub ray_tracers: RayTracers,
    #[serde(default)]
    pub station_corrections: Option<StationCorrections>,
    #[serde(default)]
    pub station_weights: Option<StationWeights>,
    #[serde(default)]
    pub magnitudes: Vec<MagnitudeCalculator>,
    #[serde(default)]
    pub features: Vec<FeatureExtractor>,

    /// Sampling rate for the image functions, one of 10, 20, 25, 50,
    /// 100 Hz.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    /// Detection threshold for the stacked semblance.
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f32,
    /// Node split threshold relative to the detected peak, in `(0, 1)`.
    #[serde(default = "default_node_split_threshold")]
    pub node_split_threshold: f32,
    /// Blinding before and after a detection peak, seconds.
    #[serde(default = "default_detection_blinding")]
    pub detection_blinding_seconds: f64,
    /// Image pre-exponentiation, in `[1, 2]`.
    #[serde(default = "default_image_mean_p")]
    pub image_mean_p: f32,
    /// Processing window length, seconds.
    #[serde(default = "default_window_length")]
    pub window_length_seconds: f64,
    /// Threads for stacking and migration, 0 uses all cores.
    #[serde(default)]
    pub n_threads_parstack: usize,
    /// Threads for the node argmax.
    #[serde(default = "default_n_threads_argmax")]
    pub n_threads_argmax: usize,

    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
}

fn default_project_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            project_dir: default_project_dir(),
            stations: Stations::default(),
            data_provider: WaveformProvider::default(),
            octree: Octree::default(),
            image_functions: ImageFunctions::default(),
            ray_tracers: RayTracers::default(),
            station_corrections: None,
            station_weights: None,
            magnitudes: Vec::new(),
            features: Vec::new(),
            sampling_rate: default_sampling_rate(),
            detection_threshold: default_detection_threshold(),
            node_split_threshold: default_node_split_threshold(),
            detection_blinding_seconds: default_detection_blinding(),
            image_mean_p: default_image_mean_p(),
            window_length_seconds: default_window_length(),
            n_threads_parstack: 0,
            n_threads_argmax: default_n_threads_argmax(),
            created: Utc::now(),
        }
    }
}

impl SearchConfig {
    /// Fatal-at-startup validation of all scalar settings and unions.
    pub fn validate(&mut self) -> Result<()> {
        if !SAMPLING_RATES.contains(&self.sampling_rate) {
            return Err(QSeekError::config(format!(
                "sampling rate {} Hz not supported, choose from {SAMPLING_RATES:?}",
                self.sampling_rate
            )));
        }
        if self.detection_threshold <= 0.0 {
            return Err(QSeekError::config("detection threshold must be positive"));
        }
        if !(0.0..1.0).contains(&self.node_split_threshold) || self.node_split_threshold == 0.0 {
            return Err(QSeekError::config(
                "node split threshold must be within (0, 1)",
            ));
        }
        if !(1.0..=2.0).contains(&self.image_mean_p) {
            return Err(QSeekError::config("image exponent must be within [1, 2]"));
        }
        if self.window_length_seconds <= 0.0 {
            return Err(QSeekError::config("window length must be positive"));
        }
        if self.n_threads_argmax == 0 {
            return Err(QSeekError::config("argmax needs at least one thread"));
        }
        self.image_functions.validate()?;
        self.ray_tracers
            .validate_phases(&self.image_functions.get_phases())?;
        self.octree.init()?;
        if let Some(weights) = &self.station_weights {
            weights.validate()?;
        }
        Ok(())
    }

    pub fn window_length(&self) -> Duration {
        Duration::microseconds((self.window_length_seconds * 1e6) as i64)
    }
}

/// Resume marker (`progress.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchProgress {
    pub time_progress: Option<DateTime<Utc>>,
}

pub struct Search {
    config: SearchConfig,
    config_stem: String,
    cache_dir: CacheDir,
    rundir: Option<PathBuf>,
    progress: SearchProgress,
    detections: Option<EventDetections>,
    context: Option<Arc<SearchContext>>,
    stats: SearchStats,
    window_padding: Duration,
    shift_range: Duration,
    travel_time_ranges: HashMap<String, (f64, f64)>,
}

impl Search {
    pub fn new(config: SearchConfig, cache_dir: CacheDir) -> Self {
        Self {
            config,
            config_stem: String::new(),
            cache_dir,
            rundir: None,
            progress: SearchProgress::default(),
            detections: None,
            context: None,
            stats: SearchStats::default(),
            window_padding: Duration::zero(),
            shift_range: Duration::zero(),
            travel_time_ranges: HashMap::new(),
        }
    }

    /// Load a configuration file; the file stem names the run directory.
    pub fn from_config(path: &Path, cache_dir: CacheDir) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            QSeekError::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut config: SearchConfig = serde_json::from_str(&text)
            .map_err(|e| QSeekError::config(format!("bad config {}: {e}", path.display())))?;
        config.validate()?;

        let mut search = Self::new(config, cache_dir);
        search.config_stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(search)
    }

    /// Resume from an existing run directory.
    pub fn load_rundir(rundir: &Path, cache_dir: CacheDir) -> Result<Self> {
        let config_file = rundir.join("search.json");
        let text = fs::read_to_string(&config_file).map_err(|e| {
            QSeekError::data(format!("cannot read {}: {e}", config_file.display()))
        })?;
        let mut config: SearchConfig = serde_json::from_str(&text)?;
        config.validate()?;

        let mut search = Self::new(config, cache_dir);
        search.rundir = Some(rundir.to_path_buf());
        search.detections = Some(EventDetections::load_rundir(rundir)?);

        let progress_file = rundir.join("progress.json");
        if progress_file.exists() {
            search.progress = serde_json::from_str(&fs::read_to_string(progress_file)?)?;
        }
        Ok(search)
    }

    pub fn rundir(&self) -> Result<&Path> {
        self.rundir
            .as_deref()
            .ok_or_else(|| QSeekError::config("run directory not initialized"))
    }

    pub fn progress(&self) -> &SearchProgress {
        &self.progress
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Programmatic adjustments before `start()`, e.g. extending the data
    /// span of a resumed run.
    pub fn config_mut(&mut self) -> &mut SearchConfig {
        &mut self.config
    }

    pub fn n_detections(&self) -> usize {
        self.detections
            .as_ref()
            .map_or(0, EventDetections::n_detections)
    }

    pub fn detections(&self) -> Option<&EventDetections> {
        self.detections.as_ref()
    }

    /// Expected run directory for this configuration.
    pub fn rundir_path(&self) -> PathBuf {
        let name = if self.config_stem.is_empty() {
            format!("run-{}", time_to_path(self.config.created))
        } else {
            self.config_stem.clone()
        };
        self.config.project_dir.join(name)
    }

    /// Create the run directory and persist the immutable configuration.
    ///
    /// With `force`, an existing directory is renamed to
    /// `NAME.bak-<creation-time>` first.
    pub fn init_rundir(&mut self, force: bool) -> Result<()> {
        if self.rundir.is_some() {
            return Ok(());
        }
        let rundir = self.rundir_path();

        if rundir.exists() {
            if !force {
                return Err(QSeekError::config(format!(
                    "rundir {} already exists",
                    rundir.display()
                )));
            }
            let created: DateTime<Utc> = fs::metadata(&rundir)
                .and_then(|meta| meta.created().or_else(|_| meta.modified()))
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            let backup = rundir.with_file_name(format!(
                "{}.bak-{}",
                rundir
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                time_to_path(created)
            ));
            fs::rename(&rundir, &backup)?;
            info!("created backup of existing rundir to {}", backup.display());
        }

        fs::create_dir_all(&rundir)?;
        self.rundir = Some(rundir.clone());
        self.write_config()?;
        self.detections = Some(EventDetections::new(&rundir)?);
        info!("created new rundir {}", rundir.display());
        Ok(())
    }

    /// Write `search.json`, the resolved stations and the CSV export.
    fn write_config(&mut self) -> Result<()> {
        let rundir = self.rundir()?.to_path_buf();
        debug!("writing search config to {}", rundir.join("search.json").display());
        fs::write(
            rundir.join("search.json"),
            serde_json::to_string_pretty(&self.config)?,
        )?;

        self.config.stations.load()?;
        fs::write(
            rundir.join("stations.json"),
            serde_json::to_string_pretty(&self.config.stations.stations)?,
        )?;
        let csv_dir = rundir.join("csv");
        fs::create_dir_all(&csv_dir)?;
        self.config.stations.export_csv(&csv_dir.join("stations.csv"))?;
        Ok(())
    }

    /// Persist the resume marker; advanced only after a batch's
    /// detections are stored.
    fn set_progress(&mut self, time: DateTime<Utc>) -> Result<()> {
        self.progress.time_progress = Some(time);
        let path = self.rundir()?.join("progress.json");
        let payload = serde_json::to_string(&self.progress)?;

        let mut last_error = None;
        for attempt in 0..2 {
            match fs::write(&path, &payload) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    if attempt == 0 {
                        warn!("writing progress failed, retrying: {error}");
                    }
                    last_error = Some(error);
                }
            }
        }
        Err(QSeekError::io(format!(
            "cannot write progress: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Build travel-time tables, resolve boundaries and the shared
    /// context. CPU-heavy table preparation runs on the blocking pool.
    pub async fn prepare(&mut self) -> Result<()> {
        info!("preparing search...");
        let mut stations = self.config.stations.clone();
        stations.load()?;

        let mut octree = self.config.octree.clone();
        octree.init()?;

        let mut ray_tracers = std::mem::take(&mut self.config.ray_tracers);
        let mut station_weights = self.config.station_weights.take();
        let phases = self.config.image_functions.get_phases();
        let cache_dir = self.cache_dir.clone();

        let (octree, stations, ray_tracers, station_weights, travel_time_ranges) =
            tokio::task::spawn_blocking(move || {
                ray_tracers.prepare(&octree, &mut stations, &phases, &cache_dir)?;
                if let Some(weights) = &mut station_weights {
                    weights.prepare(&stations, &octree)?;
                }

                // Timing ranges over the coarse octree bound the shifts.
                let mut ranges = HashMap::new();
                for phase in &phases {
                    let tracer = ray_tracers.get_phase_tracer(phase)?;
                    let times = tracer.get_travel_times(phase, &octree, &stations)?;
                    let finite = times.iter().filter(|t| t.is_finite());
                    let min = finite.clone().cloned().fold(f64::INFINITY, f64::min);
                    let max = finite.cloned().fold(f64::NEG_INFINITY, f64::max);
                    if !min.is_finite() || !max.is_finite() {
                        return Err(QSeekError::data(format!(
                            "no finite travel times for phase {phase}"
                        )));
                    }
                    info!("time shift ranges: {phase} / {min:.2} - {max:.2} s");
                    ranges.insert(phase.clone(), (min, max));
                }
                Ok((octree, stations, ray_tracers, station_weights, ranges))
            })
            .await
            .map_err(|error| QSeekError::data(format!("table preparation failed: {error}")))??;

        self.config.data_provider.prepare(&stations)?;
        self.travel_time_ranges = travel_time_ranges;
        self.init_boundaries()?;

        let parstack_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.n_threads_parstack)
            .thread_name(|i| format!("qseek-parstack-{i}"))
            .build()
            .map_err(|e| QSeekError::config(format!("cannot build stacking pool: {e}")))?;
        let argmax_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.n_threads_argmax)
            .thread_name(|i| format!("qseek-argmax-{i}"))
            .build()
            .map_err(|e| QSeekError::config(format!("cannot build argmax pool: {e}")))?;

        self.context = Some(Arc::new(SearchContext {
            sampling_rate: self.config.sampling_rate,
            detection_threshold: self.config.detection_threshold,
            node_split_threshold: self.config.node_split_threshold,
            image_mean_p: self.config.image_mean_p,
            detection_blinding_seconds: self.config.detection_blinding_seconds,
            window_padding: self.window_padding,
            octree,
            stations,
            ray_tracers,
            station_corrections: self.config.station_corrections.clone(),
            station_weights,
            parstack_pool,
            argmax_pool,
            cancelled: SearchContext::new_cancellation_flag(),
        }));
        Ok(())
    }

    /// Derive shift range and window padding; refuse too-short windows.
    fn init_boundaries(&mut self) -> Result<()> {
        let shift_min = self
            .travel_time_ranges
            .values()
            .map(|range| range.0)
            .fold(f64::INFINITY, f64::min);
        let shift_max = self
            .travel_time_ranges
            .values()
            .map(|range| range.1)
            .fold(f64::NEG_INFINITY, f64::max);
        self.shift_range = Duration::microseconds(((shift_max - shift_min) * 1e6) as i64);

        let blinding =
            Duration::microseconds((self.config.detection_blinding_seconds * 1e6) as i64);
        self.window_padding =
            self.shift_range + blinding + self.config.image_functions.get_blinding();

        let window_length = self.config.window_length();
        if window_length < self.window_padding * 2 + self.shift_range {
            return Err(QSeekError::config(format!(
                "window length {window_length} is too short for the travel time range \
                 {} and window padding {}; increase window length to at least {}",
                self.shift_range,
                self.window_padding,
                self.shift_range + self.window_padding * 2
            )));
        }

        info!("using trace window padding: {}", self.window_padding);
        info!("time shift range: {}", self.shift_range);
        Ok(())
    }

    /// Run the streaming search to completion or cancellation.
    pub async fn start(&mut self) -> Result<()> {
        self.rundir()?;
        self.prepare().await?;

        info!("starting search...");
        self.stats.reset_start_time();
        let processing_start = Utc::now();

        if let Some(time) = self.progress.time_progress {
            info!("continuing search from {time}");
        }

        let context = self
            .context
            .clone()
            .ok_or_else(|| QSeekError::config("search context missing after prepare"))?;

        // Watch for Ctrl-C; frames poll the flag between refinement
        // passes, the batch loop checks it between windows.
        {
            let context = context.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("cancellation requested, finishing current batch");
                    context.request_cancellation();
                }
            });
        }

        let mut stream = self.config.data_provider.iter_batches(
            self.config.window_length(),
            self.window_padding,
            self.progress.time_progress,
            self.window_padding * 2,
        )?;

        while let Some(batch) = stream.next().await {
            if context.is_cancelled() {
                return Err(QSeekError::Cancelled);
            }
            let batch_start = Utc::now();
            self.stats.queue_size = stream.queue_len();

            let mut images = self.config.image_functions.process(&batch)?;
            images.set_stations(&context.stations)?;
            images.apply_exponent(self.config.image_mean_p);

            let frame = SearchTraces::new(
                context.clone(),
                images,
                batch.start_time,
                batch.end_time,
            );
            let (detections, semblance_trace) = frame.search().await?;

            let store = self
                .detections
                .as_mut()
                .ok_or_else(|| QSeekError::config("detection store missing"))?;
            store.add_semblance_trace(&semblance_trace)?;

            if !detections.is_empty() {
                self.new_detections(detections).await?;
            }

            self.stats.empty_batches = stream.empty_batches;
            self.stats.short_batches = stream.short_batches;
            self.stats
                .add_processed_batch(&batch, Utc::now() - batch_start, true);
            self.set_progress(batch.end_time)?;
        }

        if context.is_cancelled() {
            return Err(QSeekError::Cancelled);
        }

        if let Some(store) = &self.detections {
            store.export_csv()?;
        }
        info!("finished search in {}", Utc::now() - processing_start);
        info!("found {} detections", self.n_detections());
        Ok(())
    }

    /// Run post-processors with bounded concurrency, then append the
    /// detections in time order.
    pub async fn new_detections(&mut self, detections: Vec<EventDetection>) -> Result<()> {
        let accessor = self.config.data_provider.accessor();
        let semaphore = Arc::new(Semaphore::new(POST_PROCESSING_CONCURRENCY));

        let mut tasks = Vec::with_capacity(detections.len());
        for detection in detections {
            let accessor = accessor.clone();
            let semaphore = semaphore.clone();
            let magnitudes = self.config.magnitudes.clone();
            let features = self.config.features.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                add_magnitudes_and_features(detection, accessor, &magnitudes, &features)
            }));
        }

        let store = self
            .detections
            .as_mut()
            .ok_or_else(|| QSeekError::config("detection store missing"))?;
        for task in tasks {
            let detection = task
                .await
                .map_err(|error| QSeekError::data(format!("post-processing failed: {error}")))?;
            info!(
                "new detection at {} semblance {:.3}",
                detection.time, detection.semblance
            );
            store.add(detection)?;
        }

        if store.n_detections() > 0 && store.n_detections() % 100 == 0 {
            store.export_csv()?;
        }
        Ok(())
    }
}

impl Search {
    /// Re-run magnitude and feature extraction over an existing run and
    /// rewrite the detection stream.
    pub async fn extract_features(&mut self) -> Result<()> {
        self.config.stations.load()?;
        self.config.data_provider.prepare(&self.config.stations)?;
        let accessor = self.config.data_provider.accessor();
        let semaphore = Arc::new(Semaphore::new(POST_PROCESSING_CONCURRENCY));

        let store = self
            .detections
            .as_mut()
            .ok_or_else(|| QSeekError::config("detection store missing"))?;
        info!(
            "extracting features for {} detections",
            store.n_detections()
        );

        let mut tasks = Vec::with_capacity(store.n_detections());
        for detection in store.iter() {
            let mut detection = detection.clone();
            detection.magnitudes.clear();
            detection.features.clear();
            let accessor = accessor.clone();
            let semaphore = semaphore.clone();
            let magnitudes = self.config.magnitudes.clone();
            let features = self.config.features.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                add_magnitudes_and_features(detection, accessor, &magnitudes, &features)
            }));
        }

        let mut updated = Vec::with_capacity(tasks.len());
        for task in tasks {
            updated.push(task.await.map_err(|error| {
                QSeekError::data(format!("feature extraction failed: {error}"))
            })?);
        }
        store.replace_all(updated)?;
        store.export_csv()?;
        Ok(())
    }

    /// Derive station corrections from the pick residuals of this run and
    /// write a follow-up configuration next to the run directory.
    pub fn derive_corrections(&self) -> Result<PathBuf> {
        use crate::corrections::ConstantCorrections;

        let store = self
            .detections
            .as_ref()
            .ok_or_else(|| QSeekError::config("detection store missing"))?;
        let corrections = ConstantCorrections::from_detections(store);
        let n_delays: usize = corrections.delays.values().map(|delays| delays.len()).sum();
        info!("derived {n_delays} station delays");

        let rundir = self.rundir()?;
        let name = rundir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string());
        let path = rundir
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{name}-corrections.json"));

        let mut config = serde_json::to_value(&self.config)?;
        config["station_corrections"] =
            serde_json::to_value(StationCorrections::Constant(corrections))?;
        fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        Ok(path)
    }
}

/// Attach magnitudes and features; events out of bounds are passed
/// through untouched.
fn add_magnitudes_and_features(
    mut detection: EventDetection,
    accessor: Option<WaveformAccessor>,
    magnitudes: &[MagnitudeCalculator],
    features: &[FeatureExtractor],
) -> EventDetection {
    if !detection.in_bounds {
        return detection;
    }
    let Some(accessor) = accessor else {
        return detection;
    };
    for calculator in magnitudes {
        debug!("adding magnitude from {}", calculator.name());
        if let Err(error) = calculator.add_magnitude(&accessor, &mut detection) {
            warn!("magnitude {} failed: {error}", calculator.name());
        }
    }
    for extractor in features {
        debug!("adding features from {}", extractor.name());
        if let Err(error) = extractor.add_features(&accessor, &mut detection) {
            warn!("feature {} failed: {error}", extractor.name());
        }
    }
    detection
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = SearchConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_scalars_rejected() {
        let mut config = SearchConfig {
            sampling_rate: 42.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = SearchConfig {
            node_split_threshold: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = SearchConfig {
            n_threads_argmax: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = SearchConfig::default();
        config.validate().unwrap();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let mut restored: SearchConfig = serde_json::from_str(&json).unwrap();
        restored.validate().unwrap();
        assert_eq!(restored.sampling_rate, config.sampling_rate);
        assert_eq!(restored.window_length_seconds, config.window_length_seconds);
        assert_eq!(
            restored.image_functions.get_phases(),
            config.image_functions.get_phases()
        );
    }

    #[test]
    fn test_unknown_phase_rejected() {
        let json = serde_json::json!({
            "image_functions": [
                {"image": "envelope", "phase": "bogus:X"}
            ]
        });
        let mut config: SearchConfig = serde_json::from_value(json).unwrap();
        assert!(config.validate().is_err());
    }
}
