//! Waveform traces and batches.
//!
//! A [`Trace`] is a regularly sampled single-channel time series tagged with
//! its NSL code. The streaming controller consumes [`WaveformBatch`]es:
//! chronologically ordered, padded windows of traces for all stations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Single-channel, regularly sampled time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub network: String,
    pub station: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub channel: String,
    pub start_time: DateTime<Utc>,
    /// Sampling interval in seconds.
    pub delta_t: f64,
    pub samples: Vec<f32>,
}

impl Trace {
    pub fn nsl(&self) -> String {
        format!("{}.{}.{}", self.network, self.station, self.location)
    }

    pub fn sampling_rate(&self) -> f64 {
        1.0 / self.delta_t
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time
            + Duration::microseconds((self.samples.len() as f64 * self.delta_t * 1e6) as i64)
    }

    /// Sample index of an absolute time, rounded to the nearest sample.
    pub fn index_of(&self, time: DateTime<Utc>) -> i64 {
        let offset = (time - self.start_time).num_microseconds().unwrap_or(0) as f64 * 1e-6;
        (offset / self.delta_t).round() as i64
    }

    pub fn nbytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }

    /// True when the trace holds at least one finite sample.
    pub fn has_signal(&self) -> bool {
        self.samples.iter().any(|v| v.is_finite())
    }

    /// Maximum absolute amplitude within an absolute time window.
    pub fn peak_amplitude(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f32> {
        let i_start = self.index_of(start).max(0) as usize;
        let i_end = (self.index_of(end).max(0) as usize).min(self.samples.len());
        if i_start >= i_end {
            return None;
        }
        self.samples[i_start..i_end]
            .iter()
            .map(|v| v.abs())
            .fold(None, |acc: Option<f32>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            })
    }
}

/// Padded window of traces handed to the image functions.
#[derive(Debug, Clone)]
pub struct WaveformBatch {
    pub traces: Vec<Trace>,
    /// Window start, padding excluded.
    pub start_time: DateTime<Utc>,
    /// Window end, padding excluded.
    pub end_time: DateTime<Utc>,
    pub i_batch: usize,
    pub n_batches: usize,
}

impl WaveformBatch {
    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    /// Drop traces without any finite sample; zero out stray non-finite
    /// samples in the remaining traces.
    pub fn clean_traces(&mut self) {
        self.traces.retain(Trace::has_signal);
        for trace in &mut self.traces {
            if trace.samples.iter().any(|v| !v.is_finite()) {
                for sample in &mut trace.samples {
                    if !sample.is_finite() {
                        *sample = 0.0;
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn cumulative_bytes(&self) -> usize {
        self.traces.iter().map(Trace::nbytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(samples: Vec<f32>) -> Trace {
        Trace {
            network: "XX".into(),
            station: "AAA".into(),
            location: String::new(),
            channel: "HHZ".into(),
            start_time: DateTime::parse_from_rfc3339("2023-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            delta_t: 0.01,
            samples,
        }
    }

    #[test]
    fn test_index_of() {
        let tr = trace(vec![0.0; 1000]);
        assert_eq!(tr.index_of(tr.start_time), 0);
        let one_second = tr.start_time + Duration::seconds(1);
        assert_eq!(tr.index_of(one_second), 100);
    }

    #[test]
    fn test_clean_traces() {
        let mut batch = WaveformBatch {
            traces: vec![
                trace(vec![1.0, f32::NAN, 3.0]),
                trace(vec![f32::NAN, f32::NAN]),
            ],
            start_time: Utc::now(),
            end_time: Utc::now(),
            i_batch: 0,
            n_batches: 1,
        };
        batch.clean_traces();
        assert_eq!(batch.traces.len(), 1);
        assert_eq!(batch.traces[0].samples, vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn test_peak_amplitude() {
        let tr = trace(vec![0.0, -4.0, 2.0, 0.0]);
        let peak = tr
            .peak_amplitude(tr.start_time, tr.start_time + Duration::seconds(1))
            .unwrap();
        assert_eq!(peak, 4.0);
    }
}
