//! Live runtime counters for the streaming search.
//!
//! Tracks processed batches, throughput and an ETA over a rolling window
//! of batch processing times. The counters are plain values logged
//! periodically; they carry no rendering of their own.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use log::info;

use crate::util::human_readable_bytes;
use crate::waveform::WaveformBatch;

/// Rolling window of per-batch processing times.
const PROCESSING_TIME_WINDOW: usize = 25;

#[derive(Debug)]
pub struct SearchStats {
    pub batch_count: usize,
    pub batch_count_total: usize,
    pub batch_time: Option<DateTime<Utc>>,
    /// Input bytes processed per wall-clock second.
    pub processing_rate_bytes: f64,
    /// Trace seconds processed per wall-clock second.
    pub processing_rate_time: f64,
    pub queue_size: usize,
    pub empty_batches: usize,
    pub short_batches: usize,

    search_start: DateTime<Utc>,
    batch_processing_times: VecDeque<Duration>,
}

impl Default for SearchStats {
    fn default() -> Self {
        Self {
            batch_count: 0,
            batch_count_total: 0,
            batch_time: None,
            processing_rate_bytes: 0.0,
            processing_rate_time: 0.0,
            queue_size: 0,
            empty_batches: 0,
            short_batches: 0,
            search_start: Utc::now(),
            batch_processing_times: VecDeque::with_capacity(PROCESSING_TIME_WINDOW),
        }
    }
}

impl SearchStats {
    pub fn reset_start_time(&mut self) {
        self.search_start = Utc::now();
    }

    pub fn add_processed_batch(
        &mut self,
        batch: &WaveformBatch,
        duration: Duration,
        show_log: bool,
    ) {
        self.batch_count = batch.i_batch + 1;
        self.batch_count_total = batch.n_batches;
        self.batch_time = Some(batch.end_time);
        if self.batch_processing_times.len() == PROCESSING_TIME_WINDOW {
            self.batch_processing_times.pop_front();
        }
        self.batch_processing_times.push_back(duration);

        let seconds = (duration.num_microseconds().unwrap_or(1) as f64 * 1e-6).max(1e-6);
        self.processing_rate_bytes = batch.cumulative_bytes() as f64 / seconds;
        self.processing_rate_time =
            batch.duration().num_microseconds().unwrap_or(0) as f64 * 1e-6 / seconds;
        if show_log {
            self.log();
        }
    }

    /// Fraction of the dataset processed, in percent.
    pub fn processed_percent(&self) -> f64 {
        if self.batch_count_total == 0 {
            return 0.0;
        }
        self.batch_count as f64 / self.batch_count_total as f64 * 100.0
    }

    /// Projected remaining wall-clock time at the current pace.
    pub fn time_remaining(&self) -> Duration {
        if self.batch_count == 0 {
            return Duration::zero();
        }
        let remaining = self.batch_count_total.saturating_sub(self.batch_count);
        if remaining == 0 {
            return Duration::zero();
        }
        let elapsed = Utc::now() - self.search_start;
        elapsed / self.batch_count as i32 * remaining as i32
    }

    pub fn log(&self) {
        let batch_time = self
            .batch_time
            .map(|time| time.to_rfc3339())
            .unwrap_or_else(|| "?".to_string());
        info!(
            "{:.1}% processed - batch {}/{} {} in {}",
            self.processed_percent(),
            self.batch_count,
            self.batch_count_total,
            batch_time,
            self.batch_processing_times
                .back()
                .copied()
                .unwrap_or_else(Duration::zero)
        );
        info!(
            "processing rate {}/s, {:.1} t/s, queue {}, remaining {}",
            human_readable_bytes(self.processing_rate_bytes),
            self.processing_rate_time,
            self.queue_size,
            self.time_remaining()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(i_batch: usize, n_batches: usize) -> WaveformBatch {
        let start = Utc::now();
        WaveformBatch {
            traces: Vec::new(),
            start_time: start,
            end_time: start + Duration::seconds(60),
            i_batch,
            n_batches,
        }
    }

    #[test]
    fn test_progress_percent() {
        let mut stats = SearchStats::default();
        assert_eq!(stats.processed_percent(), 0.0);
        stats.add_processed_batch(&batch(4, 10), Duration::seconds(1), false);
        assert!((stats.processed_percent() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rolling_window_is_bounded() {
        let mut stats = SearchStats::default();
        for i in 0..100 {
            stats.add_processed_batch(&batch(i, 200), Duration::seconds(1), false);
        }
        assert_eq!(stats.batch_processing_times.len(), PROCESSING_TIME_WINDOW);
    }

    #[test]
    fn test_time_remaining_reaches_zero() {
        let mut stats = SearchStats::default();
        stats.add_processed_batch(&batch(9, 10), Duration::seconds(1), false);
        assert_eq!(stats.time_remaining(), Duration::zero());
    }
}
