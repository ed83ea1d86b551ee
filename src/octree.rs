//! Adaptive octree over the search volume.
//!
//! The volume `east_bounds × north_bounds × depth_bounds` is tiled by cubic
//! root nodes of `root_size`; nodes split recursively into eight children of
//! half size down to `size_limit`. Iteration yields leaves only, in a fixed
//! depth-first child order, so semblance vectors map onto the tree by
//! position. Splits are memoized per node: `reset()` detaches children but
//! keeps them cached, and a later split reattaches the same subtree.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{QSeekError, Result};
use crate::geo::Location;
use crate::station::Stations;

const KM: f64 = 1e3;

/// Leaf count sentinel for "not computed yet".
const LEAF_COUNT_DIRTY: usize = usize::MAX;

/// Requested split below the size limit; recovered locally by skipping.
#[derive(Debug, thiserror::Error)]
#[error("cannot split node of size {size} m below limit {limit} m")]
pub struct NodeSplitError {
    pub size: f64,
    pub limit: f64,
}

/// Stable node identity: the tree's geographic anchor plus the node's
/// center and size. Used as cache key across refinement passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey {
    anchor: (u64, u64),
    east: u64,
    north: u64,
    depth: u64,
    size: u64,
}

/// A cubic cell of the search volume.
///
/// `children` is either empty (leaf) or holds exactly eight half-size
/// children. `cached_children` keeps a detached subtree alive across
/// `reset()` so re-splitting is cheap and reproduces the same nodes.
#[derive(Debug, Clone)]
pub struct Node {
    pub east: f64,
    pub north: f64,
    pub depth: f64,
    pub size: f64,
    pub semblance: f32,
    children: Vec<Node>,
    cached_children: Vec<Node>,
}

impl Node {
    fn new(east: f64, north: f64, depth: f64, size: f64) -> Self {
        Self {
            east,
            north,
            depth,
            size,
            semblance: 0.0,
            children: Vec::new(),
            cached_children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn can_split(&self, size_limit: f64) -> bool {
        self.size / 2.0 >= size_limit
    }

    /// Attach eight half-size children, creating them on first use and
    /// reattaching the memoized set afterwards.
    fn split(&mut self, size_limit: f64) -> std::result::Result<(), NodeSplitError> {
        if !self.children.is_empty() {
            return Ok(());
        }
        if self.cached_children.is_empty() {
            let half_size = self.size / 2.0;
            if half_size < size_limit {
                return Err(NodeSplitError {
                    size: self.size,
                    limit: size_limit,
                });
            }
            let offset = half_size / 2.0;
            let mut children = Vec::with_capacity(8);
            for east in [-1.0, 1.0] {
                for north in [-1.0, 1.0] {
                    for depth in [-1.0, 1.0] {
                        children.push(Node::new(
                            self.east + east * offset,
                            self.north + north * offset,
                            self.depth + depth * offset,
                            half_size,
                        ));
                    }
                }
            }
            self.cached_children = children;
        }
        self.children = std::mem::take(&mut self.cached_children);
        Ok(())
    }

    /// Detach children into the memo cache and zero all semblance.
    fn reset(&mut self) {
        self.semblance = 0.0;
        if !self.children.is_empty() {
            self.cached_children = std::mem::take(&mut self.children);
        }
        for child in &mut self.cached_children {
            child.reset();
        }
    }
}

fn default_root_size() -> f64 {
    2.0 * KM
}

fn default_size_limit() -> f64 {
    500.0
}

fn default_east_bounds() -> (f64, f64) {
    (-10.0 * KM, 10.0 * KM)
}

fn default_depth_bounds() -> (f64, f64) {
    (0.0, 20.0 * KM)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Octree {
    #[serde(default)]
    pub center_lat: f64,
    #[serde(default)]
    pub center_lon: f64,
    #[serde(default)]
    pub surface_elevation: f64,
    /// Edge length of the root nodes in meters.
    #[serde(default = "default_root_size")]
    pub root_size: f64,
    /// Minimum leaf edge length in meters.
    #[serde(default = "default_size_limit")]
    pub size_limit: f64,
    #[serde(default = "default_east_bounds")]
    pub east_bounds: (f64, f64),
    #[serde(default = "default_east_bounds")]
    pub north_bounds: (f64, f64),
    #[serde(default = "default_depth_bounds")]
    pub depth_bounds: (f64, f64),

    #[serde(skip)]
    root_nodes: Vec<Node>,
    #[serde(skip, default = "dirty_leaf_count")]
    leaf_count: AtomicUsize,
}

fn dirty_leaf_count() -> AtomicUsize {
    AtomicUsize::new(LEAF_COUNT_DIRTY)
}

impl Default for Octree {
    fn default() -> Self {
        Self {
            center_lat: 0.0,
            center_lon: 0.0,
            surface_elevation: 0.0,
            root_size: default_root_size(),
            size_limit: default_size_limit(),
            east_bounds: default_east_bounds(),
            north_bounds: default_east_bounds(),
            depth_bounds: default_depth_bounds(),
            root_nodes: Vec::new(),
            leaf_count: dirty_leaf_count(),
        }
    }
}

impl Clone for Octree {
    fn clone(&self) -> Self {
        Self {
            center_lat: self.center_lat,
            center_lon: self.center_lon,
            surface_elevation: self.surface_elevation,
            root_size: self.root_size,
            size_limit: self.size_limit,
            east_bounds: self.east_bounds,
            north_bounds: self.north_bounds,
            depth_bounds: self.depth_bounds,
            root_nodes: self.root_nodes.clone(),
            leaf_count: AtomicUsize::new(self.leaf_count.load(Ordering::Relaxed)),
        }
    }
}

impl Octree {
    /// Configured but uninitialized tree at the default geographic
    /// center; call [`Self::init`] before use.
    pub fn with_bounds(
        root_size: f64,
        size_limit: f64,
        east_bounds: (f64, f64),
        north_bounds: (f64, f64),
        depth_bounds: (f64, f64),
    ) -> Self {
        Self {
            root_size,
            size_limit,
            east_bounds,
            north_bounds,
            depth_bounds,
            ..Default::default()
        }
    }

    /// Validate the configuration and lay out the root node lattice.
    pub fn init(&mut self) -> Result<()> {
        for (name, bounds) in [
            ("east_bounds", self.east_bounds),
            ("north_bounds", self.north_bounds),
            ("depth_bounds", self.depth_bounds),
        ] {
            if bounds.0 >= bounds.1 {
                return Err(QSeekError::config(format!(
                    "invalid octree {name} {bounds:?}"
                )));
            }
        }
        if self.size_limit <= 0.0 || self.root_size < self.size_limit {
            return Err(QSeekError::config(format!(
                "invalid octree size limits: root {} m, limit {} m",
                self.root_size, self.size_limit
            )));
        }
        let (ext_east, ext_north, ext_depth) = self.extent();
        if ext_east < self.root_size || ext_north < self.root_size || ext_depth < self.root_size {
            return Err(QSeekError::config(format!(
                "octree bounds too small for root size {} m",
                self.root_size
            )));
        }

        self.root_nodes = self.layout_root_nodes();
        self.invalidate_leaf_count();
        Ok(())
    }

    pub fn extent(&self) -> (f64, f64, f64) {
        (
            self.east_bounds.1 - self.east_bounds.0,
            self.north_bounds.1 - self.north_bounds.0,
            self.depth_bounds.1 - self.depth_bounds.0,
        )
    }

    fn layout_root_nodes(&self) -> Vec<Node> {
        let size = self.root_size;
        let (ext_east, ext_north, ext_depth) = self.extent();
        let counts = (
            (ext_east / size).floor() as usize,
            (ext_north / size).floor() as usize,
            (ext_depth / size).floor() as usize,
        );

        let mut nodes = Vec::with_capacity(counts.0 * counts.1 * counts.2);
        for i_east in 0..counts.0 {
            for i_north in 0..counts.1 {
                for i_depth in 0..counts.2 {
                    nodes.push(Node::new(
                        self.east_bounds.0 + size * (i_east as f64 + 0.5),
                        self.north_bounds.0 + size * (i_north as f64 + 0.5),
                        self.depth_bounds.0 + size * (i_depth as f64 + 0.5),
                        size,
                    ));
                }
            }
        }
        nodes
    }

    fn invalidate_leaf_count(&self) {
        self.leaf_count.store(LEAF_COUNT_DIRTY, Ordering::Relaxed);
    }

    /// Number of leaves, cached until the next split or reset.
    pub fn n_nodes(&self) -> usize {
        let cached = self.leaf_count.load(Ordering::Relaxed);
        if cached != LEAF_COUNT_DIRTY {
            return cached;
        }
        let count = self.iter_leaves().count();
        self.leaf_count.store(count, Ordering::Relaxed);
        count
    }

    /// Depth-first leaf iteration in fixed child order.
    pub fn iter_leaves(&self) -> LeafIter<'_> {
        LeafIter {
            stack: self.root_nodes.iter().rev().collect(),
        }
    }

    /// Leaf by position in iteration order.
    pub fn leaf(&self, index: usize) -> Result<&Node> {
        self.iter_leaves()
            .nth(index)
            .ok_or_else(|| QSeekError::data(format!("bad node index {index}")))
    }

    /// Write the semblance vector onto the leaves in iteration order.
    pub fn map_semblance(&mut self, semblance: &[f32]) -> Result<()> {
        let mut index = 0;
        let n_values = semblance.len();
        for root in &mut self.root_nodes {
            map_semblance_node(root, semblance, &mut index)?;
        }
        if index != n_values {
            return Err(QSeekError::data(format!(
                "semblance has bad length {n_values}, expected {index}"
            )));
        }
        Ok(())
    }

    /// Keys of all leaves with semblance at or above the threshold.
    pub fn nodes_above(&self, semblance_threshold: f32) -> Vec<NodeKey> {
        self.iter_leaves()
            .filter(|node| node.semblance >= semblance_threshold)
            .map(|node| self.node_key(node))
            .collect()
    }

    /// Split all leaves matching the given keys.
    ///
    /// Nodes that cannot split are skipped. Returns the number of splits.
    pub fn split_nodes(&mut self, keys: &HashSet<NodeKey>) -> usize {
        let anchor = self.anchor_bits();
        let size_limit = self.size_limit;
        let mut n_split = 0;
        for root in &mut self.root_nodes {
            n_split += split_matching(root, keys, anchor, size_limit);
        }
        if n_split > 0 {
            self.invalidate_leaf_count();
        }
        n_split
    }

    /// Detach all children (keeping them memoized) and zero all semblance.
    pub fn reset(&mut self) {
        for root in &mut self.root_nodes {
            root.reset();
        }
        self.invalidate_leaf_count();
    }

    fn anchor_bits(&self) -> (u64, u64) {
        (self.center_lat.to_bits(), self.center_lon.to_bits())
    }

    /// Stable identity of a node within this tree.
    pub fn node_key(&self, node: &Node) -> NodeKey {
        NodeKey {
            anchor: self.anchor_bits(),
            east: node.east.to_bits(),
            north: node.north.to_bits(),
            depth: node.depth.to_bits(),
            size: node.size.to_bits(),
        }
    }

    /// Realize a node center as a geographic location.
    pub fn node_location(&self, node: &Node) -> Location {
        Location {
            lat: self.center_lat,
            lon: self.center_lon,
            east_shift: node.east,
            north_shift: node.north,
            elevation: self.surface_elevation,
            depth: node.depth,
        }
    }

    /// Minimum distance from the node center to the six volume faces.
    pub fn distance_to_border(&self, node: &Node) -> f64 {
        let distances = [
            node.east - self.east_bounds.0,
            self.east_bounds.1 - node.east,
            node.north - self.north_bounds.0,
            self.north_bounds.1 - node.north,
            node.depth - self.depth_bounds.0,
            self.depth_bounds.1 - node.depth,
        ];
        distances.into_iter().fold(f64::INFINITY, f64::min)
    }

    /// A node is in bounds when it keeps at least one minimum leaf edge of
    /// distance to every face.
    pub fn is_node_in_bounds(&self, node: &Node) -> bool {
        self.distance_to_border(node) >= self.size_limit
    }

    /// Smallest attainable leaf edge, `root_size / 2^k ≥ size_limit`.
    pub fn smallest_node_size(&self) -> f64 {
        let mut size = self.root_size;
        while size / 2.0 >= self.size_limit {
            size /= 2.0;
        }
        size
    }

    /// Distances from every leaf to every station, row-major
    /// `[n_nodes × n_stations]`.
    pub fn distances_stations(&self, stations: &Stations) -> Vec<f64> {
        let station_list: Vec<_> = stations.iter().collect();
        let mut distances = Vec::with_capacity(self.n_nodes() * station_list.len());
        for node in self.iter_leaves() {
            let location = self.node_location(node);
            for station in &station_list {
                distances.push(station.distance_to(&location));
            }
        }
        distances
    }
}

fn map_semblance_node(node: &mut Node, semblance: &[f32], index: &mut usize) -> Result<()> {
    if node.children.is_empty() {
        let value = *semblance.get(*index).ok_or_else(|| {
            QSeekError::data(format!(
                "semblance has bad length {}, more leaves remain",
                semblance.len()
            ))
        })?;
        node.semblance = value;
        *index += 1;
        return Ok(());
    }
    for child in &mut node.children {
        map_semblance_node(child, semblance, index)?;
    }
    Ok(())
}

fn split_matching(
    node: &mut Node,
    keys: &HashSet<NodeKey>,
    anchor: (u64, u64),
    size_limit: f64,
) -> usize {
    if node.children.is_empty() {
        let key = NodeKey {
            anchor,
            east: node.east.to_bits(),
            north: node.north.to_bits(),
            depth: node.depth.to_bits(),
            size: node.size.to_bits(),
        };
        if keys.contains(&key) && node.split(size_limit).is_ok() {
            return 1;
        }
        return 0;
    }
    let mut n_split = 0;
    for child in &mut node.children {
        n_split += split_matching(child, keys, anchor, size_limit);
    }
    n_split
}

/// Depth-first leaf iterator with an explicit stack.
pub struct LeafIter<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for LeafIter<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            if node.children.is_empty() {
                return Some(node);
            }
            for child in node.children.iter().rev() {
                self.stack.push(child);
            }
        }
        None
    }
}
