//! Single-window search engine.
//!
//! Processes one padded waveform window: stacks every image onto a fresh
//! copy of the octree template, finds semblance peaks, refines the octree
//! around promising energy and re-stacks until no node can split further,
//! then emits detections with per-receiver phase arrivals.
//!
//! Refinement passes reuse the semblance rows of unchanged leaves through
//! the per-frame cache keyed by stable node identity; the cache never
//! leaves the frame, so windows cannot observe each other's refinements.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::detection::{DetectionUncertainty, EventDetection, PhaseDetection};
use crate::error::{QSeekError, Result};
use crate::image::WaveformImages;
use crate::kernel::stack_image;
use crate::octree::Octree;
use crate::semblance::{Semblance, SemblanceCache, SemblanceTrace};
use crate::search::SearchContext;

/// Outcome of one stacking pass over the current octree resolution.
enum LevelOutcome {
    /// Nodes were split; run the next pass with the snapshot cache.
    Refine { cache: SemblanceCache },
    Done {
        detections: Vec<EventDetection>,
        trace: SemblanceTrace,
    },
}

pub struct SearchTraces {
    context: Arc<SearchContext>,
    images: WaveformImages,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl SearchTraces {
    pub fn new(
        context: Arc<SearchContext>,
        images: WaveformImages,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            context,
            images,
            start_time,
            end_time,
        }
    }

    /// Number of semblance samples for this window, padding included.
    ///
    /// The unpadded view always spans exactly `round(duration · rate)`
    /// samples, independent of the padding.
    fn n_samples_semblance(&self) -> usize {
        let context = &self.context;
        let duration =
            (self.end_time - self.start_time).num_microseconds().unwrap_or(0) as f64 * 1e-6;
        let padding =
            context.window_padding.num_microseconds().unwrap_or(0) as f64 * 1e-6;
        let padding_samples = (padding * context.sampling_rate).round() as usize;
        (duration * context.sampling_rate).round() as usize + 2 * padding_samples
    }

    /// Run the frame to completion.
    ///
    /// The stacking passes are CPU bound and run on the blocking pool so
    /// the streaming controller stays responsive.
    pub async fn search(mut self) -> Result<(Vec<EventDetection>, SemblanceTrace)> {
        let context = self.context.clone();
        let n_samples = self.n_samples_semblance();
        let start_time = self.start_time;

        self.images.downsample(context.sampling_rate, true)?;
        let images = Arc::new(self.images);

        // Every frame operates on a private copy of the octree template.
        let mut octree = context.octree.clone();
        octree.reset();

        let mut cache = SemblanceCache::new();

        loop {
            if context.is_cancelled() {
                return Err(QSeekError::Cancelled);
            }
            let task_context = context.clone();
            let task_images = images.clone();
            let (returned_octree, outcome) = tokio::task::spawn_blocking(move || {
                let mut octree = octree;
                let outcome = process_level(
                    &task_context,
                    &task_images,
                    &mut octree,
                    &cache,
                    start_time,
                    n_samples,
                )?;
                Ok::<_, QSeekError>((octree, outcome))
            })
            .await
            .map_err(|error| QSeekError::data(format!("stacking task failed: {error}")))??;

            octree = returned_octree;
            match outcome {
                LevelOutcome::Refine { cache: snapshot } => {
                    cache = snapshot;
                }
                LevelOutcome::Done { detections, trace } => {
                    return Ok((detections, trace));
                }
            }
        }
    }
}

/// Stack all images at the octree's current resolution and either refine
/// or emit detections.
fn process_level(
    context: &SearchContext,
    images: &WaveformImages,
    octree: &mut Octree,
    cache: &SemblanceCache,
    start_time: DateTime<Utc>,
    n_samples: usize,
) -> Result<LevelOutcome> {
    let sampling_rate = context.sampling_rate;
    let padding_seconds =
        context.window_padding.num_microseconds().unwrap_or(0) as f64 * 1e-6;
    let padding_samples = (padding_seconds * sampling_rate).round() as usize;

    let node_keys: Vec<_> = octree
        .iter_leaves()
        .map(|node| octree.node_key(node))
        .collect();
    let mut semblance = Semblance::new(
        node_keys.len(),
        n_samples,
        start_time,
        sampling_rate,
        padding_samples,
    )?;

    let skip_nodes = if cache.is_empty() {
        None
    } else {
        Some(Semblance::cache_mask(&node_keys, cache))
    };

    let buffer_start = start_time - context.window_padding;
    for image in &images.images {
        debug!("stacking image {} ({})", image.image_function, image.phase);
        let tracer = context.ray_tracers.get_phase_tracer(&image.phase)?;
        let mut travel_times =
            tracer.get_travel_times(&image.phase, octree, &image.stations)?;

        if let Some(corrections) = &context.station_corrections {
            let delays = corrections.get_delays(&image.stations.all_nsls(), &image.phase);
            let n_stations = delays.len();
            for (index, time) in travel_times.iter_mut().enumerate() {
                *time += delays[index % n_stations];
            }
        }

        let station_weights = match &context.station_weights {
            Some(weights) => Some(weights.get_weights(octree, &image.stations)?),
            None => None,
        };

        stack_image(
            &mut semblance,
            image,
            &travel_times,
            &image.get_offsets(buffer_start),
            station_weights.as_deref(),
            skip_nodes.as_deref(),
            &context.parstack_pool,
        )?;
    }

    semblance.apply_exponent(1.0 / context.image_mean_p);
    semblance.normalize(images.cumulative_weight());
    // Cached rows were skipped by the kernel; restore them verbatim now
    // that normalization is done.
    semblance.apply_cache(&node_keys, cache)?;

    let threshold = context
        .detection_threshold
        .powf(context.image_mean_p);
    let blinding_samples =
        (context.detection_blinding_seconds * sampling_rate).round() as usize;
    let peaks = semblance.find_peaks(threshold, threshold, blinding_samples);

    if peaks.is_empty() {
        return Ok(LevelOutcome::Done {
            detections: Vec::new(),
            trace: semblance.get_trace(),
        });
    }

    let maxima_node_idx = semblance.maxima_node_idx(&context.argmax_pool);

    // Union of split candidates over all peaks of this frame.
    let mut refine_keys = HashSet::new();
    for peak in &peaks {
        octree.map_semblance(&semblance.time_slice(peak.index))?;
        let source_node = octree.leaf(maxima_node_idx[peak.index])?;
        if !source_node.can_split(octree.size_limit) {
            continue;
        }
        refine_keys.extend(octree.nodes_above(peak.value * context.node_split_threshold));
    }

    if !refine_keys.is_empty() {
        let snapshot = semblance.snapshot_cache(&node_keys)?;
        let n_split = octree.split_nodes(&refine_keys);
        if n_split > 0 {
            info!("energy detected, refining {n_split} nodes");
            return Ok(LevelOutcome::Refine { cache: snapshot });
        }
    }

    // Converged: build detections, ascending in time by peak order.
    let n_stations = images
        .images
        .iter()
        .map(|image| image.stations.n_stations())
        .max()
        .unwrap_or(0);

    let mut detections = Vec::with_capacity(peaks.len());
    for peak in &peaks {
        let time = semblance.time_of(peak.index);
        octree.map_semblance(&semblance.time_slice(peak.index))?;

        let source_node = octree.leaf(maxima_node_idx[peak.index])?.clone();
        let source_location = octree.node_location(&source_node);

        let mut detection = EventDetection {
            time,
            location: source_location,
            semblance: peak.value,
            distance_border: octree.distance_to_border(&source_node),
            in_bounds: octree.is_node_in_bounds(&source_node),
            n_stations,
            uncertainty: Some(DetectionUncertainty::from_peak_node(octree, &source_node)?),
            receivers: Vec::new(),
            magnitudes: Vec::new(),
            features: Vec::new(),
        };

        // Attach modelled arrivals and observed picks per image.
        for image in &images.images {
            let tracer = context.ray_tracers.get_phase_tracer(&image.phase)?;
            let arrivals_model =
                tracer.get_arrivals(&image.phase, time, &source_location, &image.stations)?;
            let arrivals_observed = image.search_phase_arrivals(
                &arrivals_model
                    .iter()
                    .map(|arrival| arrival.as_ref().map(|a| a.time))
                    .collect::<Vec<_>>(),
            );

            let phase_detections = arrivals_model
                .into_iter()
                .zip(arrivals_observed)
                .map(|(model, observed)| {
                    model.map(|model| PhaseDetection {
                        phase: image.phase.clone(),
                        model,
                        observed,
                    })
                })
                .collect();
            detection.add_receivers(image.stations.iter().cloned(), phase_detections);
        }

        detections.push(detection);
    }

    Ok(LevelOutcome::Done {
        detections,
        trace: semblance.get_trace(),
    })
}
