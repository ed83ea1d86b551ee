//! QSeek detects, locates and characterizes earthquakes by continuously
//! scanning multi-station seismic waveform streams.
//!
//! The core is an adaptive-octree stacking-and-migration search: for each
//! time window, per-station phase-onset images are stacked along modelled
//! travel times onto a volumetric grid of candidate sources, the grid is
//! refined around energy concentrations, and discrete detections with
//! per-receiver phase arrivals are emitted.

pub mod cache;
pub mod cli;
pub mod corrections;
pub mod detection;
pub mod error;
pub mod geo;
pub mod image;
pub mod kernel;
pub mod octree;
pub mod peaks;
pub mod postprocess;
pub mod provider;
pub mod schemas;
pub mod search;
pub mod semblance;
pub mod station;
pub mod stats;
pub mod traveltime;
pub mod util;
pub mod waveform;
pub mod weights;
