//! Phase-onset image functions.
//!
//! An image function turns raw waveforms into per-station characteristic
//! function traces for one seismic phase. The stacking kernel consumes
//! [`WaveformImage`]s; the tagged [`ImageFunction`] variants are the
//! pluggable processing backends. Sophisticated pickers live outside this
//! crate and only need to satisfy the same contract.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{QSeekError, Result};
use crate::station::Stations;
use crate::waveform::{Trace, WaveformBatch};

fn default_weight() -> f32 {
    1.0
}

/// Rectified-amplitude characteristic function.
///
/// The simplest onset image: the absolute sample value. Sharp arrivals stay
/// sample-accurate, which also makes this the reference function for the
/// synthetic scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeFunction {
    /// Phase this image maps onto, e.g. `cake:P`.
    pub phase: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
    /// Edge exclusion applied to both trace ends, in seconds.
    #[serde(default)]
    pub blinding_seconds: f64,
    /// Channel suffix this image consumes, e.g. `Z` for vertical
    /// components; empty matches all channels.
    #[serde(default)]
    pub channel_selector: String,
}

fn default_short_window() -> f64 {
    0.5
}

fn default_long_window() -> f64 {
    5.0
}

/// Short-term over long-term average ratio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaLtaFunction {
    pub phase: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub blinding_seconds: f64,
    #[serde(default)]
    pub channel_selector: String,
    #[serde(default = "default_short_window")]
    pub short_window_seconds: f64,
    #[serde(default = "default_long_window")]
    pub long_window_seconds: f64,
}

/// Pluggable image functions, dispatched by the `image` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "image")]
pub enum ImageFunction {
    #[serde(rename = "envelope")]
    Envelope(EnvelopeFunction),
    #[serde(rename = "sta-lta")]
    StaLta(StaLtaFunction),
}

impl ImageFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Envelope(_) => "envelope",
            Self::StaLta(_) => "sta-lta",
        }
    }

    pub fn phase(&self) -> &str {
        match self {
            Self::Envelope(f) => &f.phase,
            Self::StaLta(f) => &f.phase,
        }
    }

    pub fn weight(&self) -> f32 {
        match self {
            Self::Envelope(f) => f.weight,
            Self::StaLta(f) => f.weight,
        }
    }

    pub fn blinding(&self) -> Duration {
        let seconds = match self {
            Self::Envelope(f) => f.blinding_seconds,
            Self::StaLta(f) => f.blinding_seconds,
        };
        Duration::microseconds((seconds * 1e6) as i64)
    }

    pub fn channel_selector(&self) -> &str {
        match self {
            Self::Envelope(f) => &f.channel_selector,
            Self::StaLta(f) => &f.channel_selector,
        }
    }

    /// Compute the characteristic function for every matching trace of
    /// the batch.
    pub fn process(&self, batch: &WaveformBatch) -> Result<WaveformImage> {
        let selector = self.channel_selector();
        let mut traces = Vec::with_capacity(batch.traces.len());
        for trace in &batch.traces {
            if !selector.is_empty() && !trace.channel.ends_with(selector) {
                continue;
            }
            let mut cf = trace.clone();
            cf.samples = match self {
                Self::Envelope(_) => trace.samples.iter().map(|v| v.abs()).collect(),
                Self::StaLta(f) => sta_lta(
                    &trace.samples,
                    (f.short_window_seconds * trace.sampling_rate()).round() as usize,
                    (f.long_window_seconds * trace.sampling_rate()).round() as usize,
                ),
            };
            blind_edges(&mut cf, self.blinding());
            traces.push(cf);
        }
        Ok(WaveformImage {
            image_function: self.name(),
            phase: self.phase().to_string(),
            weight: self.weight(),
            blinding: self.blinding(),
            traces,
            stations: Stations::default(),
        })
    }
}

/// Classic STA/LTA ratio with causal running means.
fn sta_lta(samples: &[f32], n_short: usize, n_long: usize) -> Vec<f32> {
    let n_short = n_short.max(1);
    let n_long = n_long.max(n_short + 1);
    let mut cf = vec![0.0_f32; samples.len()];

    let mut short_sum = 0.0_f64;
    let mut long_sum = 0.0_f64;
    for i in 0..samples.len() {
        let value = samples[i].abs() as f64;
        short_sum += value;
        long_sum += value;
        if i >= n_short {
            short_sum -= samples[i - n_short].abs() as f64;
        }
        if i >= n_long {
            long_sum -= samples[i - n_long].abs() as f64;
        }
        let sta = short_sum / n_short as f64;
        let lta = long_sum / n_long.min(i + 1) as f64;
        cf[i] = if lta > 1e-12 { (sta / lta) as f32 } else { 0.0 };
    }
    cf
}

/// Zero out the unreliable samples at both trace ends.
fn blind_edges(trace: &mut Trace, blinding: Duration) {
    let n_blind = ((blinding.num_microseconds().unwrap_or(0) as f64 * 1e-6)
        * trace.sampling_rate())
    .round() as usize;
    let n_samples = trace.samples.len();
    if n_blind == 0 || n_samples == 0 {
        return;
    }
    let n_blind = n_blind.min(n_samples);
    trace.samples[..n_blind].fill(0.0);
    trace.samples[n_samples - n_blind..].fill(0.0);
}

/// Characteristic-function traces of one image function over one batch.
#[derive(Debug, Clone)]
pub struct WaveformImage {
    pub image_function: &'static str,
    pub phase: String,
    pub weight: f32,
    pub blinding: Duration,
    pub traces: Vec<Trace>,
    /// Stations matching `traces`, in trace order.
    pub stations: Stations,
}

impl WaveformImage {
    pub fn n_stations(&self) -> usize {
        self.traces.len()
    }

    pub fn delta_t(&self) -> f64 {
        self.traces.first().map_or(0.0, |tr| tr.delta_t)
    }

    pub fn sampling_rate(&self) -> f64 {
        self.traces.first().map_or(0.0, Trace::sampling_rate)
    }

    /// Bind the matching stations, dropping traces without a known station.
    pub fn set_stations(&mut self, stations: &Stations) -> Result<()> {
        let known = stations.all_nsls();
        let before = self.traces.len();
        self.traces.retain(|tr| known.contains(&tr.nsl()));
        if self.traces.len() < before {
            warn!(
                "dropped {} traces without a matching station",
                before - self.traces.len()
            );
        }
        let nsls: Vec<String> = self.traces.iter().map(Trace::nsl).collect();
        self.stations = stations.select_from_nsls(&nsls)?;
        Ok(())
    }

    /// Raise all samples to `exponent`; characteristic functions are
    /// non-negative so this sharpens the onsets.
    pub fn apply_exponent(&mut self, exponent: f32) {
        if exponent == 1.0 {
            return;
        }
        for trace in &mut self.traces {
            for sample in &mut trace.samples {
                *sample = sample.powf(exponent);
            }
        }
    }

    /// Decimate to the target rate by an integer factor, keeping the block
    /// maximum so onset peaks survive. Optionally rescales so the global
    /// maximum is preserved exactly.
    pub fn downsample(&mut self, sampling_rate: f64, max_normalize: bool) -> Result<()> {
        let current = self.sampling_rate();
        if current == 0.0 || (current - sampling_rate).abs() < 1e-9 {
            return Ok(());
        }
        let factor = current / sampling_rate;
        if factor < 1.0 || (factor - factor.round()).abs() > 1e-9 {
            return Err(QSeekError::config(format!(
                "cannot downsample from {current} Hz to {sampling_rate} Hz"
            )));
        }
        let factor = factor.round() as usize;
        debug!("downsampling image to {sampling_rate} Hz (factor {factor})");

        for trace in &mut self.traces {
            let max_before = trace.samples.iter().cloned().fold(0.0_f32, f32::max);
            let decimated: Vec<f32> = trace
                .samples
                .chunks(factor)
                .map(|chunk| chunk.iter().cloned().fold(0.0_f32, f32::max))
                .collect();
            trace.samples = decimated;
            trace.delta_t *= factor as f64;
            if max_normalize && max_before > 0.0 {
                let max_after = trace.samples.iter().cloned().fold(0.0_f32, f32::max);
                if max_after > 0.0 {
                    let scale = max_before / max_after;
                    for sample in &mut trace.samples {
                        *sample *= scale;
                    }
                }
            }
        }
        Ok(())
    }

    /// Per-trace sample offsets relative to a reference time.
    pub fn get_offsets(&self, reference: DateTime<Utc>) -> Vec<i64> {
        self.traces
            .iter()
            .map(|tr| -tr.index_of(reference))
            .collect()
    }

    /// Search observed arrivals: the characteristic-function maximum within
    /// the blinding window around each modelled arrival.
    pub fn search_phase_arrivals(
        &self,
        modelled_arrivals: &[Option<DateTime<Utc>>],
    ) -> Vec<Option<DateTime<Utc>>> {
        let window = self.blinding.max(Duration::seconds(1));
        self.traces
            .iter()
            .zip(modelled_arrivals)
            .map(|(trace, modelled)| {
                let modelled = (*modelled)?;
                let i_start = trace.index_of(modelled - window).max(0) as usize;
                let i_end = (trace.index_of(modelled + window).max(0) as usize)
                    .min(trace.samples.len());
                if i_start >= i_end {
                    return None;
                }
                let (best, value) = trace.samples[i_start..i_end]
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
                if *value <= 0.0 {
                    return None;
                }
                let index = (i_start + best) as f64;
                Some(
                    trace.start_time
                        + Duration::microseconds((index * trace.delta_t * 1e6) as i64),
                )
            })
            .collect()
    }
}

/// The configured set of image functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageFunctions {
    pub functions: Vec<ImageFunction>,
}

impl Default for ImageFunctions {
    fn default() -> Self {
        Self {
            functions: vec![ImageFunction::Envelope(EnvelopeFunction {
                phase: "cake:P".to_string(),
                weight: 1.0,
                blinding_seconds: 0.5,
                channel_selector: String::new(),
            })],
        }
    }
}

impl ImageFunctions {
    /// Reject configurations that provide the same phase twice.
    pub fn validate(&self) -> Result<()> {
        let phases = self.get_phases();
        let mut unique = phases.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != phases.len() {
            return Err(QSeekError::config("a phase was provided twice"));
        }
        if phases.is_empty() {
            return Err(QSeekError::config("no image functions configured"));
        }
        Ok(())
    }

    pub fn get_phases(&self) -> Vec<String> {
        self.functions
            .iter()
            .map(|f| f.phase().to_string())
            .collect()
    }

    /// The largest per-image edge exclusion.
    pub fn get_blinding(&self) -> Duration {
        self.functions
            .iter()
            .map(ImageFunction::blinding)
            .max()
            .unwrap_or_else(Duration::zero)
    }

    pub fn cumulative_weight(&self) -> f32 {
        self.functions.iter().map(ImageFunction::weight).sum()
    }

    /// Process a batch through every function.
    pub fn process(&self, batch: &WaveformBatch) -> Result<WaveformImages> {
        let mut images = Vec::with_capacity(self.functions.len());
        for function in &self.functions {
            debug!("calculating images from {}", function.name());
            images.push(function.process(batch)?);
        }
        Ok(WaveformImages { images })
    }
}

/// Images of one batch, one per configured function.
#[derive(Debug, Clone)]
pub struct WaveformImages {
    pub images: Vec<WaveformImage>,
}

impl WaveformImages {
    pub fn n_images(&self) -> usize {
        self.images.len()
    }

    pub fn cumulative_weight(&self) -> f32 {
        self.images.iter().map(|img| img.weight).sum()
    }

    pub fn set_stations(&mut self, stations: &Stations) -> Result<()> {
        for image in &mut self.images {
            image.set_stations(stations)?;
        }
        Ok(())
    }

    pub fn apply_exponent(&mut self, exponent: f32) {
        for image in &mut self.images {
            image.apply_exponent(exponent);
        }
    }

    pub fn downsample(&mut self, sampling_rate: f64, max_normalize: bool) -> Result<()> {
        for image in &mut self.images {
            image.downsample(sampling_rate, max_normalize)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Location;
    use crate::station::Station;

    fn impulse_batch() -> WaveformBatch {
        let start = DateTime::parse_from_rfc3339("2023-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut samples = vec![0.0_f32; 1000];
        samples[400] = -2.0;
        WaveformBatch {
            traces: vec![Trace {
                network: "XX".into(),
                station: "AAA".into(),
                location: String::new(),
                channel: "HHZ".into(),
                start_time: start,
                delta_t: 0.01,
                samples,
            }],
            start_time: start,
            end_time: start + Duration::seconds(10),
            i_batch: 0,
            n_batches: 1,
        }
    }

    #[test]
    fn test_envelope_rectifies_and_blinds() {
        let function = ImageFunction::Envelope(EnvelopeFunction {
            phase: "cake:P".into(),
            weight: 1.0,
            blinding_seconds: 1.0,
            channel_selector: String::new(),
        });
        let image = function.process(&impulse_batch()).unwrap();
        let samples = &image.traces[0].samples;
        assert_eq!(samples[400], 2.0);
        assert!(samples[..100].iter().all(|&v| v == 0.0));
        assert!(samples[900..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_sta_lta_peaks_after_onset() {
        let function = ImageFunction::StaLta(StaLtaFunction {
            phase: "cake:P".into(),
            weight: 1.0,
            blinding_seconds: 0.0,
            channel_selector: String::new(),
            short_window_seconds: 0.05,
            long_window_seconds: 2.0,
        });
        let image = function.process(&impulse_batch()).unwrap();
        let samples = &image.traces[0].samples;
        let peak = samples
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert!((400..=405).contains(&peak), "peak at {peak}");
    }

    #[test]
    fn test_duplicate_phase_rejected() {
        let functions = ImageFunctions {
            functions: vec![
                ImageFunction::Envelope(EnvelopeFunction {
                    phase: "cake:P".into(),
                    weight: 1.0,
                    blinding_seconds: 0.0,
                    channel_selector: String::new(),
                }),
                ImageFunction::StaLta(StaLtaFunction {
                    phase: "cake:P".into(),
                    weight: 1.0,
                    blinding_seconds: 0.0,
                    channel_selector: String::new(),
                    short_window_seconds: 0.5,
                    long_window_seconds: 5.0,
                }),
            ],
        };
        assert!(functions.validate().is_err());
    }

    #[test]
    fn test_downsample_block_max() {
        let mut image = ImageFunction::Envelope(EnvelopeFunction {
            phase: "cake:P".into(),
            weight: 1.0,
            blinding_seconds: 0.0,
            channel_selector: String::new(),
        })
        .process(&impulse_batch())
        .unwrap();

        image.downsample(50.0, true).unwrap();
        let samples = &image.traces[0].samples;
        assert_eq!(samples.len(), 500);
        assert_eq!(image.traces[0].delta_t, 0.02);
        assert_eq!(samples[200], 2.0);

        assert!(image.downsample(30.0, false).is_err());
    }

    #[test]
    fn test_set_stations_selects_by_nsl() {
        let mut stations = Stations::from_stations(vec![Station {
            network: "XX".into(),
            station: "AAA".into(),
            location_code: String::new(),
            coords: Location {
                east_shift: 100.0,
                ..Location::new(10.0, 10.0)
            },
        }]);
        stations.load().unwrap();

        let mut image = ImageFunction::Envelope(EnvelopeFunction {
            phase: "cake:P".into(),
            weight: 1.0,
            blinding_seconds: 0.0,
            channel_selector: String::new(),
        })
        .process(&impulse_batch())
        .unwrap();
        image.set_stations(&stations).unwrap();
        assert_eq!(image.stations.n_stations(), 1);
    }

    #[test]
    fn test_observed_arrival_search() {
        let function = ImageFunction::Envelope(EnvelopeFunction {
            phase: "cake:P".into(),
            weight: 1.0,
            blinding_seconds: 0.0,
            channel_selector: String::new(),
        });
        let batch = impulse_batch();
        let image = function.process(&batch).unwrap();
        let onset = batch.start_time + Duration::seconds(4);
        // Modelled arrival slightly off; the observed pick snaps to the peak.
        let modelled = onset + Duration::milliseconds(300);
        let observed = image.search_phase_arrivals(&[Some(modelled)]);
        assert_eq!(observed[0], Some(onset));
    }
}
