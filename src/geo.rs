//! Geodetic locations with local Cartesian offsets.
//!
//! A [`Location`] anchors at a geographic point `(lat, lon, elevation)` and
//! carries local offsets `(east_shift, north_shift, depth)` in meters.
//! Distances between arbitrary locations go through ECEF coordinates;
//! locations sharing the same anchor use the exact Cartesian fast path.

use serde::{Deserialize, Serialize};

/// WGS-84 semi-major axis in meters.
const WGS84_A: f64 = 6_378_137.0;
/// WGS-84 first eccentricity squared.
const WGS84_E2: f64 = 6.694_379_990_141_317e-3;
/// Mean earth radius used for offset-to-latlon transforms.
const EARTH_RADIUS: f64 = 6_371_008.8;

/// Coordinate system selector for bulk coordinate exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordSystem {
    Geographic,
    Cartesian,
}

/// Geographic anchor plus local Cartesian offsets. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub east_shift: f64,
    #[serde(default)]
    pub north_shift: f64,
    #[serde(default)]
    pub elevation: f64,
    #[serde(default)]
    pub depth: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            east_shift: 0.0,
            north_shift: 0.0,
            elevation: 0.0,
            depth: 0.0,
        }
    }

    /// Depth below the reference ellipsoid, elevation removed.
    pub fn effective_depth(&self) -> f64 {
        self.depth - self.elevation
    }

    /// Elevation above the reference ellipsoid, depth removed.
    pub fn effective_elevation(&self) -> f64 {
        self.elevation - self.depth
    }

    /// Geographic coordinates with the horizontal shifts applied.
    pub fn effective_lat_lon(&self) -> (f64, f64) {
        if self.north_shift == 0.0 && self.east_shift == 0.0 {
            return (self.lat, self.lon);
        }
        ne_to_lat_lon(self.lat, self.lon, self.north_shift, self.east_shift)
    }

    /// Earth-centered earth-fixed coordinates of the effective position.
    pub fn as_ecef(&self) -> [f64; 3] {
        let (lat, lon) = self.effective_lat_lon();
        geodetic_to_ecef(lat, lon, self.effective_elevation())
    }

    /// Distance to another location in meters.
    ///
    /// Locations sharing the anchor use the exact local Cartesian distance;
    /// everything else goes through ECEF.
    pub fn distance_to(&self, other: &Location) -> f64 {
        if self.lat == other.lat && self.lon == other.lon {
            let de = self.east_shift - other.east_shift;
            let dn = self.north_shift - other.north_shift;
            let dd = self.effective_depth() - other.effective_depth();
            return (de * de + dn * dn + dd * dd).sqrt();
        }
        let a = self.as_ecef();
        let b = other.as_ecef();
        let dx = a[0] - b[0];
        let dy = a[1] - b[1];
        let dz = a[2] - b[2];
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Great-circle surface distance to another location in meters.
    pub fn surface_distance_to(&self, other: &Location) -> f64 {
        if self.lat == other.lat && self.lon == other.lon {
            let de = self.east_shift - other.east_shift;
            let dn = self.north_shift - other.north_shift;
            return (de * de + dn * dn).sqrt();
        }
        let (lat1, lon1) = self.effective_lat_lon();
        let (lat2, lon2) = other.effective_lat_lon();
        haversine(lat1, lon1, lat2, lon2)
    }

    /// Offset `(east, north, depth)` of this location relative to `other`.
    ///
    /// Both locations must share the same geographic anchor; the vertical
    /// component is the difference of effective depths.
    pub fn offset_from(&self, other: &Location) -> (f64, f64, f64) {
        (
            self.east_shift - other.east_shift,
            self.north_shift - other.north_shift,
            self.effective_depth() - other.effective_depth(),
        )
    }

    /// Bake the horizontal shifts into the geographic anchor.
    pub fn shifted_origin(&self) -> Location {
        let (lat, lon) = self.effective_lat_lon();
        Location {
            lat,
            lon,
            east_shift: 0.0,
            north_shift: 0.0,
            elevation: self.elevation,
            depth: self.depth,
        }
    }
}

/// Shift a geographic point by local north/east offsets in meters.
///
/// Spherical azimuthal solution, accurate to well below the octree node
/// sizes for offsets of a few hundred kilometers.
pub fn ne_to_lat_lon(lat: f64, lon: f64, north: f64, east: f64) -> (f64, f64) {
    let lat_rad = lat.to_radians();
    let lon_rad = lon.to_radians();

    let distance = (north * north + east * east).sqrt() / EARTH_RADIUS;
    let azimuth = east.atan2(north);

    let lat_new = (lat_rad.sin() * distance.cos()
        + lat_rad.cos() * distance.sin() * azimuth.cos())
    .asin();
    let lon_new = lon_rad
        + (azimuth.sin() * distance.sin() * lat_rad.cos())
            .atan2(distance.cos() - lat_rad.sin() * lat_new.sin());

    (lat_new.to_degrees(), lon_new.to_degrees())
}

/// Convert geodetic coordinates (degrees, meters) to ECEF meters.
pub fn geodetic_to_ecef(lat: f64, lon: f64, elevation: f64) -> [f64; 3] {
    let lat_rad = lat.to_radians();
    let lon_rad = lon.to_radians();

    let sin_lat = lat_rad.sin();
    let cos_lat = lat_rad.cos();
    let prime_vertical = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    [
        (prime_vertical + elevation) * cos_lat * lon_rad.cos(),
        (prime_vertical + elevation) * cos_lat * lon_rad.sin(),
        (prime_vertical * (1.0 - WGS84_E2) + elevation) * sin_lat,
    ]
}

fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KM: f64 = 1e3;

    #[test]
    fn test_surface_distance() {
        let loc = Location::new(11.0, 23.55);
        let other = Location::new(13.123, 21.12);
        let distance = loc.surface_distance_to(&other);
        assert!(distance > 100.0 * KM && distance < 500.0 * KM);
    }

    #[test]
    fn test_distance_same_origin() {
        let loc = Location::new(11.0, 23.55);

        for offset in [-10.0 * KM, -250.0, 250.0, 10.0 * KM] {
            for axis in 0..4 {
                let mut other = loc;
                match axis {
                    0 => other.north_shift = offset,
                    1 => other.east_shift = offset,
                    2 => other.elevation = offset,
                    _ => other.depth = offset,
                }
                assert_eq!(loc.distance_to(&other), offset.abs());

                let shifted = other.shifted_origin();
                let ecef_distance = loc.distance_to(&shifted);
                assert!(
                    (ecef_distance - offset.abs()).abs() / offset.abs() < 1e-2,
                    "ecef distance {ecef_distance} vs offset {offset}"
                );
            }
        }
    }

    #[test]
    fn test_location_offset() {
        let loc = Location::new(11.0, 23.55);

        let mut other = loc;
        other.north_shift = 100.0;
        other.east_shift = 100.0;
        other.depth = 100.0;
        assert_eq!(other.offset_from(&loc), (100.0, 100.0, 100.0));

        let mut other = loc;
        other.north_shift = 100.0;
        other.east_shift = 100.0;
        other.elevation = 100.0;
        assert_eq!(other.offset_from(&loc), (100.0, 100.0, -100.0));

        other.depth = 10.0;
        assert_eq!(other.offset_from(&loc), (100.0, 100.0, -90.0));
    }

    #[test]
    fn test_ne_to_lat_lon_north_shift() {
        // 111.19 km per degree of latitude on the mean sphere.
        let (lat, lon) = ne_to_lat_lon(0.0, 0.0, 111_190.0, 0.0);
        assert!((lat - 1.0).abs() < 1e-3);
        assert!(lon.abs() < 1e-9);
    }

    #[test]
    fn test_ecef_equator() {
        let [x, y, z] = geodetic_to_ecef(0.0, 0.0, 0.0);
        assert!((x - WGS84_A).abs() < 1e-6);
        assert!(y.abs() < 1e-6);
        assert!(z.abs() < 1e-6);
    }
}
