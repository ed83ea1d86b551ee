//! End-to-end detection scenarios on synthetic impulse data.
//!
//! Each scenario builds a run with the synthetic waveform provider, a
//! constant-velocity layered model and envelope image functions, then
//! drives the full streaming search: batch loop, stacking, octree
//! refinement and detection emission.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};

use qseek::geo::Location;
use qseek::image::{EnvelopeFunction, ImageFunction, ImageFunctions};
use qseek::octree::Octree;
use qseek::provider::{SyntheticProvider, SyntheticSource, WaveformProvider};
use qseek::search::{Search, SearchConfig};
use qseek::station::{Station, Stations};
use qseek::traveltime::{CakeTracer, EarthModel, RayTracer, RayTracers};
use qseek::util::CacheDir;

const KM: f64 = 1e3;
const VP: f64 = 5_500.0;
const VS: f64 = 3_200.0;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2023-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "qseek_scenario_{tag}_{}_{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn surface_stations() -> Stations {
    // Asymmetric layout: distinct source distances avoid coincidental
    // alignment of one phase's onsets under the other phase's shifts.
    let positions = [
        (-6.0 * KM, -4.0 * KM),
        (7.0 * KM, -5.0 * KM),
        (-5.0 * KM, 6.5 * KM),
        (4.0 * KM, 7.0 * KM),
        (1.0 * KM, 2.0 * KM),
    ];
    let mut stations = Stations::from_stations(
        positions
            .iter()
            .enumerate()
            .map(|(i, &(east, north))| Station {
                network: "XX".into(),
                station: format!("S{i:02}"),
                location_code: String::new(),
                coords: Location {
                    east_shift: east,
                    north_shift: north,
                    ..Location::new(0.0, 0.0)
                },
            })
            .collect(),
    );
    stations.load().unwrap();
    stations
}

struct Scenario {
    project_dir: PathBuf,
    cache_dir: PathBuf,
    config: SearchConfig,
}

impl Scenario {
    fn new(
        tag: &str,
        sources: Vec<SyntheticSource>,
        span_seconds: i64,
        root_size: f64,
        size_limit: f64,
    ) -> Self {
        let project_dir = temp_dir(&format!("{tag}_project"));
        let cache_dir = temp_dir(&format!("{tag}_cache"));

        let provider = SyntheticProvider {
            origin: Location::new(0.0, 0.0),
            start_time: t0(),
            end_time: t0() + Duration::seconds(span_seconds),
            sampling_rate: 100.0,
            velocity_p: VP,
            velocity_s: Some(VS),
            sources,
            noise_level: 0.01,
            pulse_width_seconds: 1.0,
            ..Default::default()
        };

        let octree = Octree::with_bounds(
            root_size,
            size_limit,
            (-10.0 * KM, 10.0 * KM),
            (-10.0 * KM, 10.0 * KM),
            (0.0, 20.0 * KM),
        );

        // P rides on the vertical component, S on the horizontal.
        let image_functions = ImageFunctions {
            functions: vec![
                ImageFunction::Envelope(EnvelopeFunction {
                    phase: "cake:P".into(),
                    weight: 1.0,
                    blinding_seconds: 0.5,
                    channel_selector: "Z".into(),
                }),
                ImageFunction::Envelope(EnvelopeFunction {
                    phase: "cake:S".into(),
                    weight: 1.0,
                    blinding_seconds: 0.5,
                    channel_selector: "E".into(),
                }),
            ],
        };

        let ray_tracers = RayTracers {
            tracers: vec![RayTracer::Cake(CakeTracer::with_earthmodel(
                EarthModel::constant(VP, VS, 50.0 * KM),
            ))],
        };

        let mut config = SearchConfig {
            project_dir: project_dir.clone(),
            stations: surface_stations(),
            data_provider: WaveformProvider::Synthetic(provider),
            octree,
            image_functions,
            ray_tracers,
            detection_threshold: 0.3,
            detection_blinding_seconds: 2.0,
            window_length_seconds: span_seconds as f64,
            ..Default::default()
        };
        config.validate().unwrap();

        Self {
            project_dir,
            cache_dir,
            config,
        }
    }

    fn window_seconds(mut self, seconds: f64) -> Self {
        self.config.window_length_seconds = seconds;
        self
    }

    async fn run(self) -> (Search, PathBuf, PathBuf) {
        let cache = CacheDir::at(&self.cache_dir);
        let mut search = Search::new(self.config, cache);
        search.init_rundir(false).unwrap();
        search.start().await.unwrap();
        (search, self.project_dir, self.cache_dir)
    }
}

fn source(seconds_after_t0: f64, east: f64, north: f64, depth: f64, amplitude: f32) -> SyntheticSource {
    SyntheticSource {
        time: t0() + Duration::microseconds((seconds_after_t0 * 1e6) as i64),
        east_shift: east,
        north_shift: north,
        depth,
        amplitude,
    }
}

fn cleanup(paths: &[PathBuf]) {
    for path in paths {
        let _ = fs::remove_dir_all(path);
    }
}

fn seconds_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (a - b).num_microseconds().unwrap_or(0) as f64 * 1e-6
}

#[tokio::test]
async fn single_synthetic_source_is_located() {
    let scenario = Scenario::new(
        "single",
        vec![source(60.0, 0.0, 0.0, 5.0 * KM, 1.0)],
        120,
        2.0 * KM,
        250.0,
    );
    let size_limit = scenario.config.octree.size_limit;
    let (search, project, cache) = scenario.run().await;

    let store = search.detections().unwrap();
    assert_eq!(store.n_detections(), 1, "expected exactly one detection");

    let detection = store.latest().unwrap();
    let dt = seconds_between(detection.time, t0() + Duration::seconds(60));
    assert!(dt.abs() <= 0.03, "origin time off by {dt} s");

    assert!(detection.location.east_shift.abs() <= size_limit);
    assert!(detection.location.north_shift.abs() <= size_limit);
    assert!((detection.location.depth - 5.0 * KM).abs() <= size_limit);
    assert!(detection.semblance > 0.3);
    assert!(detection.in_bounds);
    assert!(detection.uncertainty.is_some());

    // Receivers carry modelled arrivals for both phases.
    assert_eq!(detection.receivers.len(), 5);
    assert!(detection
        .receivers
        .iter()
        .all(|receiver| receiver.phase_arrivals.len() == 2));

    cleanup(&[project, cache]);
}

#[tokio::test]
async fn source_at_node_center_is_sample_accurate() {
    // A source exactly on an attainable fine-node center aligns all
    // stations without quantization error.
    let scenario = Scenario::new(
        "aligned",
        vec![source(60.0, 125.0, 125.0, 4_875.0, 1.0)],
        120,
        2.0 * KM,
        250.0,
    );
    let (search, project, cache) = scenario.run().await;

    let store = search.detections().unwrap();
    assert_eq!(store.n_detections(), 1);
    let detection = store.latest().unwrap();

    let dt = seconds_between(detection.time, t0() + Duration::seconds(60));
    assert!(dt.abs() <= 0.02 + 1e-9, "origin time off by {dt} s");
    assert_eq!(detection.location.east_shift, 125.0);
    assert_eq!(detection.location.north_shift, 125.0);
    assert_eq!(detection.location.depth, 4_875.0);

    cleanup(&[project, cache]);
}

#[tokio::test]
async fn coarser_root_converges_through_refinement() {
    // Starting from 4 km roots the frame has to split four times to reach
    // the 250 m leaves; the result must match the fine-grid accuracy.
    let scenario = Scenario::new(
        "refine",
        vec![source(60.0, 0.0, 0.0, 5.0 * KM, 1.0)],
        120,
        4.0 * KM,
        250.0,
    );
    let (search, project, cache) = scenario.run().await;

    let store = search.detections().unwrap();
    assert_eq!(store.n_detections(), 1);
    let detection = store.latest().unwrap();

    assert!(detection.location.east_shift.abs() <= 250.0);
    assert!(detection.location.north_shift.abs() <= 250.0);
    assert!((detection.location.depth - 5.0 * KM).abs() <= 250.0);
    // The uncertainty volume shrank to fine-node scale.
    let uncertainty = detection.uncertainty.as_ref().unwrap();
    assert!(uncertainty.east.1 - uncertainty.east.0 <= 4.0 * KM);

    cleanup(&[project, cache]);
}

#[tokio::test]
async fn two_sources_outside_blinding_yield_two_detections() {
    let scenario = Scenario::new(
        "pair",
        vec![
            source(60.0, 0.0, 0.0, 5.0 * KM, 1.0),
            source(64.0, 0.0, 0.0, 5.0 * KM, 1.0),
        ],
        120,
        2.0 * KM,
        250.0,
    );
    let (search, project, cache) = scenario.run().await;

    let store = search.detections().unwrap();
    assert_eq!(store.n_detections(), 2);

    let detections: Vec<_> = store.iter().collect();
    assert!(detections[0].time < detections[1].time);
    let dt = seconds_between(detections[1].time, detections[0].time);
    assert!((dt - 4.0).abs() <= 0.05, "detection spacing {dt} s");

    cleanup(&[project, cache]);
}

#[tokio::test]
async fn sources_within_blinding_merge_to_strongest() {
    let scenario = Scenario::new(
        "blinded",
        vec![
            source(60.0, 0.0, 0.0, 5.0 * KM, 1.0),
            source(61.0, 0.0, 0.0, 5.0 * KM, 0.5),
        ],
        120,
        2.0 * KM,
        250.0,
    );
    let (search, project, cache) = scenario.run().await;

    let store = search.detections().unwrap();
    assert_eq!(store.n_detections(), 1, "blinding must suppress the weaker peak");

    let detection = store.latest().unwrap();
    let dt = seconds_between(detection.time, t0() + Duration::seconds(60));
    assert!(dt.abs() <= 0.05, "kept peak should be the stronger one, dt {dt} s");

    cleanup(&[project, cache]);
}

#[tokio::test]
async fn source_near_volume_border_is_flagged() {
    let scenario = Scenario::new(
        "border",
        vec![source(60.0, 0.0, 0.0, 19.9 * KM, 1.0)],
        120,
        2.0 * KM,
        250.0,
    );
    let (search, project, cache) = scenario.run().await;

    let store = search.detections().unwrap();
    assert_eq!(store.n_detections(), 1);
    let detection = store.latest().unwrap();

    assert!(!detection.in_bounds);
    assert!(detection.distance_border < 250.0);
    assert!((detection.location.depth - 19.9 * KM).abs() <= 500.0);

    cleanup(&[project, cache]);
}

#[tokio::test]
async fn interrupted_run_resumes_without_duplicates() {
    // First pass only covers the first window; the resumed run picks up
    // at the persisted progress and must only add the second event.
    let scenario = Scenario::new(
        "resume",
        vec![
            source(30.0, 0.0, 0.0, 5.0 * KM, 1.0),
            source(90.0, 0.0, 0.0, 5.0 * KM, 1.0),
        ],
        120,
        2.0 * KM,
        250.0,
    )
    .window_seconds(60.0);

    let project = scenario.project_dir.clone();
    let cache_path = scenario.cache_dir.clone();
    let mut config = scenario.config;

    // Truncate the data span so the first run stops after one window.
    let full_end = t0() + Duration::seconds(120);
    if let WaveformProvider::Synthetic(provider) = &mut config.data_provider {
        provider.end_time = t0() + Duration::seconds(60);
    }

    let mut first = Search::new(config, CacheDir::at(&cache_path));
    first.init_rundir(false).unwrap();
    first.start().await.unwrap();

    assert_eq!(first.n_detections(), 1);
    let progress_after_first = first.progress().time_progress.unwrap();
    assert_eq!(progress_after_first, t0() + Duration::seconds(60));
    let rundir = first.rundir().unwrap().to_path_buf();
    drop(first);

    let mut resumed = Search::load_rundir(&rundir, CacheDir::at(&cache_path)).unwrap();
    assert_eq!(resumed.n_detections(), 1);
    if let WaveformProvider::Synthetic(provider) = &mut resumed.config_mut().data_provider {
        provider.end_time = full_end;
    }
    resumed.start().await.unwrap();

    assert_eq!(resumed.n_detections(), 2, "resume must only add the second event");
    let detections: Vec<_> = resumed.detections().unwrap().iter().collect();
    let dt = seconds_between(detections[1].time, detections[0].time);
    assert!((dt - 60.0).abs() <= 0.1, "events {dt} s apart");

    let progress_final = resumed.progress().time_progress.unwrap();
    assert!(progress_final > progress_after_first);
    assert_eq!(progress_final, full_end);

    cleanup(&[project, cache_path]);
}

#[tokio::test]
async fn window_too_short_is_refused() {
    let scenario = Scenario::new(
        "short_window",
        vec![source(10.0, 0.0, 0.0, 5.0 * KM, 1.0)],
        120,
        2.0 * KM,
        250.0,
    )
    .window_seconds(15.0);

    let project = scenario.project_dir.clone();
    let cache_path = scenario.cache_dir.clone();

    let mut search = Search::new(scenario.config, CacheDir::at(&cache_path));
    search.init_rundir(false).unwrap();
    let error = search.start().await.unwrap_err();
    assert!(error.to_string().contains("too short"), "got: {error}");

    cleanup(&[project, cache_path]);
}
