//! Waveform providers.
//!
//! The acquisition backend is a pluggable tagged variant; the core only
//! relies on its capability set: `prepare`, a chronologically ordered
//! padded batch stream with bounded prefetching, and an optional random
//! access handle for post-processors.
//!
//! The built-in `synthetic` provider renders impulse traces for configured
//! point sources under a constant-velocity assumption. It drives the
//! end-to-end test scenarios and doubles as a dry-run data source.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{QSeekError, Result};
use crate::geo::Location;
use crate::station::Stations;
use crate::waveform::{Trace, WaveformBatch};

/// Pluggable waveform backends, dispatched by the `provider` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider")]
pub enum WaveformProvider {
    #[serde(rename = "synthetic")]
    Synthetic(SyntheticProvider),
}

impl WaveformProvider {
    /// Bind the provider to the resolved station inventory.
    pub fn prepare(&mut self, stations: &Stations) -> Result<()> {
        match self {
            Self::Synthetic(provider) => provider.prepare(stations),
        }
    }

    /// Start streaming padded batches through a bounded prefetch queue.
    pub fn iter_batches(
        &self,
        window_increment: Duration,
        window_padding: Duration,
        start_time: Option<DateTime<Utc>>,
        min_length: Duration,
    ) -> Result<BatchStream> {
        match self {
            Self::Synthetic(provider) => {
                provider.iter_batches(window_increment, window_padding, start_time, min_length)
            }
        }
    }

    /// Random waveform access for magnitude and feature extraction, when
    /// the backend supports it.
    pub fn accessor(&self) -> Option<WaveformAccessor> {
        match self {
            Self::Synthetic(provider) => Some(WaveformAccessor::Synthetic(provider.clone())),
        }
    }
}

impl Default for WaveformProvider {
    fn default() -> Self {
        Self::Synthetic(SyntheticProvider::default())
    }
}

/// Random-access handle shared by the post-detection extractors.
#[derive(Debug, Clone)]
pub enum WaveformAccessor {
    Synthetic(SyntheticProvider),
}

impl WaveformAccessor {
    pub fn get_waveforms(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Trace> {
        match self {
            Self::Synthetic(provider) => provider.render_traces(start, end),
        }
    }
}

/// Stream of chronologically ordered batches fed by a prefetch task.
///
/// Empty and too-short batches are logged, counted and skipped here so the
/// controller only sees usable windows.
pub struct BatchStream {
    rx: mpsc::Receiver<WaveformBatch>,
    min_length: Duration,
    received: usize,
    pub empty_batches: usize,
    pub short_batches: usize,
}

impl BatchStream {
    pub async fn next(&mut self) -> Option<WaveformBatch> {
        loop {
            if self.received > 0 && self.rx.len() == 0 {
                warn!("waveform queue ran empty, prefetching is too slow");
            }
            let mut batch = self.rx.recv().await?;
            self.received += 1;

            batch.clean_traces();
            if batch.is_empty() {
                warn!("empty batch {}", batch.i_batch);
                self.empty_batches += 1;
                continue;
            }
            if batch.duration() < self.min_length {
                warn!(
                    "duration of batch {} too short: {}",
                    batch.i_batch,
                    batch.duration()
                );
                self.short_batches += 1;
                continue;
            }
            return Some(batch);
        }
    }

    /// Current prefetch queue depth.
    pub fn queue_len(&self) -> usize {
        self.rx.len()
    }
}

/// A point source emitting one impulse per available phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticSource {
    pub time: DateTime<Utc>,
    pub east_shift: f64,
    pub north_shift: f64,
    pub depth: f64,
    #[serde(default = "default_amplitude")]
    pub amplitude: f32,
}

fn default_amplitude() -> f32 {
    1.0
}

fn default_sampling_rate() -> f64 {
    100.0
}

fn default_velocity_p() -> f64 {
    5_500.0
}

fn default_prefetch() -> usize {
    4
}

/// Impulse-train waveform generator for a fixed station set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticProvider {
    /// Geographic anchor for the source offsets.
    pub origin: Location,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    #[serde(default = "default_velocity_p")]
    pub velocity_p: f64,
    /// Render S impulses as well when set (m/s).
    #[serde(default)]
    pub velocity_s: Option<f64>,
    #[serde(default)]
    pub sources: Vec<SyntheticSource>,
    /// Uniform noise amplitude added to every sample.
    #[serde(default)]
    pub noise_level: f32,
    /// Half width of the triangular source pulse in seconds; zero renders
    /// single-sample impulses.
    #[serde(default)]
    pub pulse_width_seconds: f64,
    /// Queue depth of the asynchronous prefetcher.
    #[serde(default = "default_prefetch")]
    pub prefetch_batches: usize,

    /// Station set bound at prepare time.
    #[serde(skip)]
    pub stations: Stations,
}

impl Default for SyntheticProvider {
    fn default() -> Self {
        let start = DateTime::parse_from_rfc3339("2023-01-01T00:00:00Z")
            .expect("static timestamp")
            .with_timezone(&Utc);
        Self {
            origin: Location::new(0.0, 0.0),
            start_time: start,
            end_time: start + Duration::minutes(10),
            sampling_rate: default_sampling_rate(),
            velocity_p: default_velocity_p(),
            velocity_s: None,
            sources: Vec::new(),
            noise_level: 0.0,
            pulse_width_seconds: 0.0,
            prefetch_batches: default_prefetch(),
            stations: Stations::default(),
        }
    }
}

impl SyntheticProvider {
    fn prepare(&mut self, stations: &Stations) -> Result<()> {
        info!("preparing synthetic waveform provider");
        if self.start_time >= self.end_time {
            return Err(QSeekError::config("start_time must be before end_time"));
        }
        self.stations = stations.clone();
        Ok(())
    }

    fn iter_batches(
        &self,
        window_increment: Duration,
        window_padding: Duration,
        start_time: Option<DateTime<Utc>>,
        min_length: Duration,
    ) -> Result<BatchStream> {
        if self.stations.n_stations() == 0 {
            return Err(QSeekError::data(
                "no stations bound, has prepare() been called?",
            ));
        }
        let start = start_time.unwrap_or(self.start_time).max(self.start_time);
        let end = self.end_time;
        if start >= end {
            return Err(QSeekError::data(format!(
                "no waveforms left in time span {start} - {end}"
            )));
        }
        info!("searching time span from {start} to {end} ({})", end - start);

        let span_us = (end - start).num_microseconds().unwrap_or(0);
        let increment_us = window_increment.num_microseconds().unwrap_or(1).max(1);
        let n_batches = ((span_us + increment_us - 1) / increment_us) as usize;

        let provider = self.clone();
        let (tx, rx) = mpsc::channel(self.prefetch_batches.max(1));
        tokio::spawn(async move {
            debug!("start prefetching data, queue size {}", provider.prefetch_batches);
            for i_batch in 0..n_batches {
                let batch_start = start + window_increment * i_batch as i32;
                let batch_end = (batch_start + window_increment).min(end);
                let batch = provider.generate_window(
                    batch_start,
                    batch_end,
                    window_padding,
                    i_batch,
                    n_batches,
                );
                if tx.send(batch).await.is_err() {
                    debug!("batch consumer dropped, stopping prefetcher");
                    break;
                }
            }
        });

        Ok(BatchStream {
            rx,
            min_length,
            received: 0,
            empty_batches: 0,
            short_batches: 0,
        })
    }

    fn generate_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        padding: Duration,
        i_batch: usize,
        n_batches: usize,
    ) -> WaveformBatch {
        WaveformBatch {
            traces: self.render_traces(start - padding, end + padding),
            start_time: start,
            end_time: end,
            i_batch,
            n_batches,
        }
    }

    /// Render pulse traces for all stations over an absolute time span.
    ///
    /// P onsets go to the vertical component `HHZ`; with an S velocity
    /// configured, S onsets go to the horizontal `HHE`.
    pub fn render_traces(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Trace> {
        let span = (end - start).num_microseconds().unwrap_or(0) as f64 * 1e-6;
        let n_samples = (span * self.sampling_rate).round() as usize;

        let mut traces = Vec::with_capacity(self.stations.n_stations() * 2);
        for (i_station, station) in self.stations.iter().enumerate() {
            traces.push(self.render_component(
                station,
                "HHZ",
                self.velocity_p,
                start,
                n_samples,
                i_station as u64,
            ));
            if let Some(velocity_s) = self.velocity_s {
                traces.push(self.render_component(
                    station,
                    "HHE",
                    velocity_s,
                    start,
                    n_samples,
                    i_station as u64 | 1 << 32,
                ));
            }
        }
        traces
    }

    fn render_component(
        &self,
        station: &crate::station::Station,
        channel: &str,
        velocity: f64,
        start: DateTime<Utc>,
        n_samples: usize,
        seed_salt: u64,
    ) -> Trace {
        let mut samples = vec![0.0_f32; n_samples];
        if self.noise_level > 0.0 {
            let seed = (start.timestamp() as u64)
                .wrapping_mul(31)
                .wrapping_add(seed_salt);
            let mut rng = StdRng::seed_from_u64(seed);
            for sample in &mut samples {
                *sample = self.noise_level * (rng.random::<f32>() - 0.5);
            }
        }

        let half_width = (self.pulse_width_seconds * self.sampling_rate).round() as i64;
        for source in &self.sources {
            let source_location = Location {
                east_shift: source.east_shift,
                north_shift: source.north_shift,
                depth: source.depth,
                ..self.origin
            };
            let distance = station.distance_to(&source_location);
            let arrival = source.time + Duration::microseconds((distance / velocity * 1e6) as i64);
            let offset = (arrival - start).num_microseconds().unwrap_or(i64::MIN) as f64 * 1e-6;
            let center = (offset * self.sampling_rate).round() as i64;

            if half_width == 0 {
                if center >= 0 && (center as usize) < n_samples {
                    samples[center as usize] += source.amplitude;
                }
                continue;
            }
            for tap in -half_width..=half_width {
                let index = center + tap;
                if index < 0 || index as usize >= n_samples {
                    continue;
                }
                let taper = 1.0 - tap.abs() as f32 / half_width as f32;
                samples[index as usize] += source.amplitude * taper;
            }
        }

        Trace {
            network: station.network.clone(),
            station: station.station.clone(),
            location: station.location_code.clone(),
            channel: channel.to_string(),
            start_time: start,
            delta_t: 1.0 / self.sampling_rate,
            samples,
        }
    }
}
