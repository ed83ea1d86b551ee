//! Stack-and-migrate kernel.
//!
//! For every candidate source node, shifts each station's characteristic
//! function trace by the modelled travel time and accumulates it into the
//! semblance buffer. Station-count normalization is baked into the weight
//! so masked stations keep per-node contributions stable. The node axis is
//! the parallel dimension; each worker owns one semblance row.

use rayon::prelude::*;

use crate::error::{QSeekError, Result};
use crate::image::WaveformImage;
use crate::semblance::Semblance;

/// Stack one image into the semblance buffer.
///
/// * `travel_times` - `[n_nodes × n_stations]` seconds; `NaN` marks
///   (node, station) pairs without a defined time, which contribute
///   nothing.
/// * `offsets` - per-station sample offset of the trace start relative to
///   the buffer start.
/// * `station_weights` - optional `[n_nodes × n_stations]` distance decay
///   factors, multiplied into the weight matrix.
/// * `skip_nodes` - per-node mask of rows restored from the semblance
///   cache; their stacking is suppressed entirely.
pub fn stack_image(
    semblance: &mut Semblance,
    image: &WaveformImage,
    travel_times: &[f64],
    offsets: &[i64],
    station_weights: Option<&[f32]>,
    skip_nodes: Option<&[bool]>,
    pool: &rayon::ThreadPool,
) -> Result<()> {
    let n_nodes = semblance.n_nodes();
    let n_stations = image.n_stations();
    let n_samples_total = semblance.n_samples_total();

    if n_stations == 0 {
        return Err(QSeekError::data("image holds no traces to stack"));
    }
    if travel_times.len() != n_nodes * n_stations {
        return Err(QSeekError::data(format!(
            "travel time matrix has {} entries, expected {} × {}",
            travel_times.len(),
            n_nodes,
            n_stations
        )));
    }
    if offsets.len() != n_stations {
        return Err(QSeekError::data("offsets do not match station count"));
    }

    let delta_t = image.delta_t();
    if ((1.0 / delta_t) - semblance.sampling_rate).abs() > 1e-6 {
        return Err(QSeekError::config(format!(
            "image sampling rate {:.3} Hz does not match semblance rate {:.3} Hz",
            1.0 / delta_t,
            semblance.sampling_rate
        )));
    }

    let image_weight = image.weight;
    let traces = &image.traces;
    let data = semblance.data_mut();

    pool.install(|| {
        data.par_chunks_mut(n_samples_total)
            .enumerate()
            .for_each(|(node, row)| {
                if skip_nodes.is_some_and(|mask| mask[node]) {
                    return;
                }
                let tt_row = &travel_times[node * n_stations..(node + 1) * n_stations];
                let station_contribution =
                    tt_row.iter().filter(|tt| tt.is_finite()).count() as f32;
                if station_contribution == 0.0 {
                    return;
                }
                let base_weight = image_weight / station_contribution;

                for (i_station, &travel_time) in tt_row.iter().enumerate() {
                    if !travel_time.is_finite() {
                        continue;
                    }
                    let mut weight = base_weight;
                    if let Some(decay) = station_weights {
                        weight *= decay[node * n_stations + i_station];
                    }
                    if weight == 0.0 {
                        continue;
                    }

                    let shift = (-travel_time / delta_t).round() as i64;
                    let samples = &traces[i_station].samples;
                    let start = offsets[i_station] + shift;

                    let j_lo = start.max(0) as usize;
                    let j_hi = ((start + samples.len() as i64).min(n_samples_total as i64))
                        .max(0) as usize;
                    if j_lo >= j_hi {
                        continue;
                    }
                    let k0 = (j_lo as i64 - start) as usize;
                    for (target, &sample) in row[j_lo..j_hi]
                        .iter_mut()
                        .zip(&samples[k0..k0 + (j_hi - j_lo)])
                    {
                        *target += weight * sample;
                    }
                }
            });
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::Trace;
    use chrono::{Duration, Utc};

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn image(traces: Vec<Vec<f32>>, weight: f32) -> WaveformImage {
        let start = Utc::now();
        WaveformImage {
            image_function: "envelope",
            phase: "cake:P".into(),
            weight,
            blinding: Duration::zero(),
            traces: traces
                .into_iter()
                .enumerate()
                .map(|(i, samples)| Trace {
                    network: "XX".into(),
                    station: format!("S{i}"),
                    location: String::new(),
                    channel: "HHZ".into(),
                    start_time: start,
                    delta_t: 0.01,
                    samples,
                })
                .collect(),
            stations: Default::default(),
        }
    }

    fn semblance(n_nodes: usize, n_total: usize) -> Semblance {
        Semblance::new(n_nodes, n_total, Utc::now(), 100.0, 0).unwrap()
    }

    #[test]
    fn test_shift_alignment() {
        // Impulse at sample 150, travel time 1 s at 100 Hz: the energy must
        // land at the source time sample 50.
        let mut trace = vec![0.0_f32; 400];
        trace[150] = 1.0;
        let image = image(vec![trace], 1.0);
        let mut semblance = semblance(1, 400);

        stack_image(&mut semblance, &image, &[1.0], &[0], None, None, &pool()).unwrap();

        let row = semblance.row(0);
        assert_eq!(row[50], 1.0);
        assert_eq!(row.iter().filter(|&&v| v != 0.0).count(), 1);
    }

    #[test]
    fn test_offset_shifts_origin() {
        let mut trace = vec![0.0_f32; 100];
        trace[10] = 1.0;
        let image = image(vec![trace], 1.0);
        let mut semblance = semblance(1, 400);

        // Trace starts 200 samples into the buffer.
        stack_image(&mut semblance, &image, &[0.5], &[200], None, None, &pool()).unwrap();
        assert_eq!(semblance.row(0)[160], 1.0);
    }

    #[test]
    fn test_station_count_normalization() {
        let mut a = vec![0.0_f32; 100];
        a[30] = 1.0;
        let mut b = vec![0.0_f32; 100];
        b[30] = 1.0;
        let image = image(vec![a, b], 1.0);
        let mut semblance = semblance(2, 100);

        // Node 0 sees both stations, node 1 only one (NaN masks the other).
        let travel_times = [0.0, 0.0, 0.0, f64::NAN];
        stack_image(
            &mut semblance,
            &image,
            &travel_times,
            &[0, 0],
            None,
            None,
            &pool(),
        )
        .unwrap();

        assert_eq!(semblance.row(0)[30], 1.0);
        assert_eq!(semblance.row(1)[30], 1.0);
    }

    #[test]
    fn test_all_nan_node_stays_zero() {
        let mut trace = vec![0.0_f32; 100];
        trace[30] = 1.0;
        let image = image(vec![trace], 1.0);
        let mut semblance = semblance(1, 100);

        stack_image(&mut semblance, &image, &[f64::NAN], &[0], None, None, &pool()).unwrap();
        assert!(semblance.row(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_skip_mask_suppresses_row() {
        let mut trace = vec![0.0_f32; 100];
        trace[30] = 1.0;
        let image = image(vec![trace.clone(), trace], 1.0);
        let mut semblance = semblance(2, 100);

        stack_image(
            &mut semblance,
            &image,
            &[0.0, 0.0, 0.0, 0.0],
            &[0, 0],
            None,
            Some(&[true, false]),
            &pool(),
        )
        .unwrap();
        assert!(semblance.row(0).iter().all(|&v| v == 0.0));
        assert_eq!(semblance.row(1)[30], 1.0);
    }

    #[test]
    fn test_station_weights_scale_contributions() {
        let mut trace = vec![0.0_f32; 100];
        trace[30] = 1.0;
        let image = image(vec![trace], 2.0);
        let mut semblance = semblance(1, 100);

        stack_image(
            &mut semblance,
            &image,
            &[0.0],
            &[0],
            Some(&[0.5]),
            None,
            &pool(),
        )
        .unwrap();
        assert_eq!(semblance.row(0)[30], 1.0);
    }

    #[test]
    fn test_out_of_buffer_samples_are_dropped() {
        let mut trace = vec![0.0_f32; 100];
        trace[5] = 1.0;
        let image = image(vec![trace], 1.0);
        let mut semblance = semblance(1, 100);

        // Shift of 10 samples pushes the impulse before the buffer start.
        stack_image(&mut semblance, &image, &[0.1], &[0], None, None, &pool()).unwrap();
        assert!(semblance.row(0).iter().all(|&v| v == 0.0));
    }
}
