//! Earth models backing the travel-time tables.
//!
//! The 1-D [`EarthModel`] is a stack of constant-velocity layers in the
//! classic ND column convention (depth, vp, vs, rho; kilometers and km/s).
//! The 3-D [`VelocityModel`] variants rasterize onto a regular Cartesian
//! grid covering the search volume for the eikonal solver. Model identity
//! is a content hash used in table file names and reuse checks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{QSeekError, Result};
use crate::geo::Location;
use crate::octree::Octree;
use crate::station::Station;

const KM: f64 = 1e3;

/// Seismic wave type selected by a phase rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Wave {
    P,
    S,
}

/// A constant-velocity layer in SI units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layer {
    pub top: f64,
    pub bottom: f64,
    pub velocity: f64,
}

impl Layer {
    pub fn thickness(&self) -> f64 {
        self.bottom - self.top
    }
}

/// 1-D layered earth model, ND rows `(depth_km, vp_km_s, vs_km_s, rho)`.
///
/// Consecutive rows delimit layers; the upper row's velocities apply to the
/// whole layer. The default is a generic continental crust over mantle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EarthModel {
    pub layers: Vec<(f64, f64, f64, f64)>,
}

impl Default for EarthModel {
    fn default() -> Self {
        Self {
            layers: vec![
                (0.00, 5.50, 3.59, 2.7),
                (1.00, 5.50, 3.59, 2.7),
                (1.00, 6.00, 3.92, 2.7),
                (4.00, 6.00, 3.92, 2.7),
                (4.00, 6.20, 4.05, 2.7),
                (8.00, 6.20, 4.05, 2.7),
                (8.00, 6.30, 4.12, 2.7),
                (13.00, 6.30, 4.12, 2.7),
                (13.00, 6.40, 4.18, 2.7),
                (17.00, 6.40, 4.18, 2.7),
                (17.00, 6.50, 4.25, 2.7),
                (22.00, 6.50, 4.25, 2.7),
                (22.00, 6.60, 4.31, 2.7),
                (26.00, 6.60, 4.31, 2.7),
                (26.00, 6.80, 4.44, 2.7),
                (30.00, 6.80, 4.44, 2.7),
                (30.00, 8.10, 5.29, 2.7),
                (45.00, 8.10, 5.29, 2.7),
            ],
        }
    }
}

impl EarthModel {
    /// Constant-velocity model, handy for synthetic scenarios.
    pub fn constant(vp: f64, vs: f64, max_depth: f64) -> Self {
        Self {
            layers: vec![
                (0.0, vp / KM, vs / KM, 2.7),
                (max_depth / KM, vp / KM, vs / KM, 2.7),
            ],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.layers.len() < 2 {
            return Err(QSeekError::config("earth model needs at least two rows"));
        }
        let mut previous_depth = f64::NEG_INFINITY;
        for &(depth, vp, vs, _rho) in &self.layers {
            if depth < previous_depth {
                return Err(QSeekError::config(format!(
                    "earth model depths must be non-decreasing, got {depth} km"
                )));
            }
            if vp <= 0.0 || vs <= 0.0 {
                return Err(QSeekError::config("earth model velocities must be positive"));
            }
            previous_depth = depth;
        }
        Ok(())
    }

    /// Piecewise-constant profile for one wave type, in SI units.
    pub fn profile(&self, wave: Wave) -> Vec<Layer> {
        let mut layers = Vec::new();
        for pair in self.layers.windows(2) {
            let (top, vp_top, vs_top, _) = pair[0];
            let (bottom, ..) = pair[1];
            if bottom <= top {
                continue;
            }
            let velocity = match wave {
                Wave::P => vp_top,
                Wave::S => vs_top,
            };
            layers.push(Layer {
                top: top * KM,
                bottom: bottom * KM,
                velocity: velocity * KM,
            });
        }
        layers
    }

    /// Slowest non-zero velocity over both wave types.
    pub fn vmin(&self) -> f64 {
        self.layers
            .iter()
            .flat_map(|&(_, vp, vs, _)| [vp, vs])
            .filter(|&v| v > 0.0)
            .fold(f64::INFINITY, f64::min)
            * KM
    }

    /// Velocity at a depth in meters, the last layer extends downward.
    pub fn velocity_at(&self, wave: Wave, depth: f64) -> f64 {
        let profile = self.profile(wave);
        for layer in &profile {
            if depth < layer.bottom {
                return layer.velocity;
            }
        }
        profile.last().map_or(0.0, |layer| layer.velocity)
    }

    /// Content hash identifying this model.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for &(depth, vp, vs, rho) in &self.layers {
            hasher.update(depth.to_le_bytes());
            hasher.update(vp.to_le_bytes());
            hasher.update(vs.to_le_bytes());
            hasher.update(rho.to_le_bytes());
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Regular Cartesian velocity grid covering the search volume.
///
/// Axes are east, north, depth; values are C-ordered with depth fastest.
#[derive(Debug, Clone)]
pub struct VelocityGrid3D {
    pub center: Location,
    pub grid_spacing: f64,
    pub east_bounds: (f64, f64),
    pub north_bounds: (f64, f64),
    pub depth_bounds: (f64, f64),
    pub shape: [usize; 3],
    pub velocities: Vec<f64>,
}

impl VelocityGrid3D {
    fn coords(lo: f64, hi: f64, spacing: f64) -> usize {
        (((hi - lo) / spacing).floor() as usize).max(1) + 1
    }

    fn empty(octree: &Octree, grid_spacing: f64) -> Self {
        let shape = [
            Self::coords(octree.east_bounds.0, octree.east_bounds.1, grid_spacing),
            Self::coords(octree.north_bounds.0, octree.north_bounds.1, grid_spacing),
            Self::coords(octree.depth_bounds.0, octree.depth_bounds.1, grid_spacing),
        ];
        Self {
            center: Location {
                lat: octree.center_lat,
                lon: octree.center_lon,
                east_shift: 0.0,
                north_shift: 0.0,
                elevation: octree.surface_elevation,
                depth: 0.0,
            },
            grid_spacing,
            east_bounds: octree.east_bounds,
            north_bounds: octree.north_bounds,
            depth_bounds: octree.depth_bounds,
            shape,
            velocities: vec![0.0; shape[0] * shape[1] * shape[2]],
        }
    }

    pub fn index(&self, i_east: usize, i_north: usize, i_depth: usize) -> usize {
        (i_east * self.shape[1] + i_north) * self.shape[2] + i_depth
    }

    pub fn axis_value(&self, axis: usize, index: usize) -> f64 {
        let lo = match axis {
            0 => self.east_bounds.0,
            1 => self.north_bounds.0,
            _ => self.depth_bounds.0,
        };
        lo + index as f64 * self.grid_spacing
    }

    /// Offset `(east, north, depth)` of a station relative to the grid
    /// center, on the grid's depth convention.
    pub fn station_offset(&self, station: &Station) -> (f64, f64, f64) {
        station.coords.offset_from(&self.center)
    }

    /// True when the station position falls inside the grid box.
    pub fn is_inside(&self, station: &Station) -> bool {
        let (east, north, depth) = self.station_offset(station);
        east >= self.east_bounds.0
            && east <= self.east_bounds.1
            && north >= self.north_bounds.0
            && north <= self.north_bounds.1
            && depth >= self.depth_bounds.0
            && depth <= self.depth_bounds.1
    }

    /// Nearest grid index of a station position.
    pub fn station_index(&self, station: &Station) -> Result<[usize; 3]> {
        if !self.is_inside(station) {
            return Err(QSeekError::table(format!(
                "station {} is outside the velocity model",
                station.nsl()
            )));
        }
        let (east, north, depth) = self.station_offset(station);
        let clamp = |value: f64, n: usize| -> usize {
            (value.round().max(0.0) as usize).min(n - 1)
        };
        Ok([
            clamp((east - self.east_bounds.0) / self.grid_spacing, self.shape[0]),
            clamp((north - self.north_bounds.0) / self.grid_spacing, self.shape[1]),
            clamp((depth - self.depth_bounds.0) / self.grid_spacing, self.shape[2]),
        ])
    }

    /// Content hash over geometry and velocities.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for value in [
            self.grid_spacing,
            self.east_bounds.0,
            self.east_bounds.1,
            self.north_bounds.0,
            self.north_bounds.1,
            self.depth_bounds.0,
            self.depth_bounds.1,
        ] {
            hasher.update(value.to_le_bytes());
        }
        for velocity in &self.velocities {
            hasher.update(velocity.to_le_bytes());
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Pluggable 3-D velocity models, dispatched by the `model` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model")]
pub enum VelocityModel {
    /// Homogeneous half space.
    #[serde(rename = "constant")]
    Constant { velocity: f64 },
    /// Rasterized 1-D layered model.
    #[serde(rename = "layered")]
    Layered { earthmodel: EarthModel, wave: Wave },
}

impl VelocityModel {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Constant { velocity } => {
                if *velocity <= 0.0 {
                    return Err(QSeekError::config("constant velocity must be positive"));
                }
                Ok(())
            }
            Self::Layered { earthmodel, .. } => earthmodel.validate(),
        }
    }

    /// Rasterize onto a grid covering the octree volume.
    pub fn build_grid(&self, octree: &Octree, grid_spacing: f64) -> Result<VelocityGrid3D> {
        self.validate()?;
        let mut grid = VelocityGrid3D::empty(octree, grid_spacing);
        match self {
            Self::Constant { velocity } => {
                grid.velocities.fill(*velocity);
            }
            Self::Layered { earthmodel, wave } => {
                for i_depth in 0..grid.shape[2] {
                    let depth = grid.axis_value(2, i_depth);
                    let velocity = earthmodel.velocity_at(*wave, depth);
                    for i_east in 0..grid.shape[0] {
                        for i_north in 0..grid.shape[1] {
                            let index = grid.index(i_east, i_north, i_depth);
                            grid.velocities[index] = velocity;
                        }
                    }
                }
            }
        }
        Ok(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model_is_valid() {
        let model = EarthModel::default();
        model.validate().unwrap();
        assert_eq!(model.vmin(), 3.59 * KM);
    }

    #[test]
    fn test_profile_units_and_layering() {
        let model = EarthModel::default();
        let profile = model.profile(Wave::P);
        assert_eq!(profile[0].top, 0.0);
        assert_eq!(profile[0].bottom, 1.0 * KM);
        assert_eq!(profile[0].velocity, 5.5 * KM);
        // Zero-thickness transition rows are skipped.
        assert!(profile.iter().all(|layer| layer.thickness() > 0.0));
    }

    #[test]
    fn test_hash_changes_with_model() {
        let a = EarthModel::default();
        let mut b = EarthModel::default();
        b.layers[0].1 += 0.1;
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), EarthModel::default().hash());
    }

    #[test]
    fn test_velocity_at_extends_last_layer() {
        let model = EarthModel::constant(5_500.0, 3_200.0, 20.0 * KM);
        assert_eq!(model.velocity_at(Wave::P, 5.0 * KM), 5_500.0);
        assert_eq!(model.velocity_at(Wave::P, 100.0 * KM), 5_500.0);
        assert_eq!(model.velocity_at(Wave::S, 1.0 * KM), 3_200.0);
    }

    #[test]
    fn test_constant_grid_covers_octree() {
        let mut octree = Octree::default();
        octree.init().unwrap();
        let model = VelocityModel::Constant { velocity: 5_500.0 };
        let grid = model.build_grid(&octree, 1_000.0).unwrap();
        assert_eq!(grid.shape, [21, 21, 21]);
        assert!(grid.velocities.iter().all(|&v| v == 5_500.0));
    }

    #[test]
    fn test_station_inside_and_index() {
        let mut octree = Octree::default();
        octree.init().unwrap();
        let grid = VelocityModel::Constant { velocity: 5_500.0 }
            .build_grid(&octree, 1_000.0)
            .unwrap();

        let station = Station {
            network: "XX".into(),
            station: "AAA".into(),
            location_code: String::new(),
            coords: Location {
                east_shift: 1_500.0,
                north_shift: -2_000.0,
                ..Location::new(0.0, 0.0)
            },
        };
        assert!(grid.is_inside(&station));
        assert_eq!(grid.station_index(&station).unwrap(), [12, 8, 0]);

        let outside = Station {
            coords: Location {
                east_shift: 50_000.0,
                ..Location::new(0.0, 0.0)
            },
            ..station
        };
        assert!(!grid.is_inside(&outside));
    }
}
