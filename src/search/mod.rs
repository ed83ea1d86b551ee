//! The search engine: per-window frame processing and the streaming
//! controller driving it.

pub mod controller;
pub mod frame;

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Duration;

use crate::corrections::StationCorrections;
use crate::octree::Octree;
use crate::station::Stations;
use crate::traveltime::RayTracers;
use crate::weights::StationWeights;

pub use controller::{Search, SearchConfig, SearchProgress};
pub use frame::SearchTraces;

/// Read-mostly state shared between the controller and its frames.
///
/// Built once after `prepare()`; frames receive it behind an `Arc` and
/// only ever clone the octree template.
pub struct SearchContext {
    pub sampling_rate: f64,
    pub detection_threshold: f32,
    pub node_split_threshold: f32,
    pub image_mean_p: f32,
    pub detection_blinding_seconds: f64,
    pub window_padding: Duration,

    pub octree: Octree,
    pub stations: Stations,
    pub ray_tracers: RayTracers,
    pub station_corrections: Option<StationCorrections>,
    pub station_weights: Option<StationWeights>,

    pub parstack_pool: rayon::ThreadPool,
    pub argmax_pool: rayon::ThreadPool,

    cancelled: AtomicBool,
}

impl SearchContext {
    pub fn request_cancellation(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn new_cancellation_flag() -> AtomicBool {
        AtomicBool::new(false)
    }
}
