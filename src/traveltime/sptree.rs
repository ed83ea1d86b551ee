//! Adaptive sampled-parameter interpolation tree.
//!
//! Samples an expensive scalar function over a 3-D parameter box and
//! subdivides cells until trilinear interpolation of the corner samples
//! reproduces the function within a value tolerance `ftol`, or the cell
//! half-extent falls below the spatial tolerance `xtol`. Undefined samples
//! (no arrival) are stored as NaN and isolate to cells at the spatial
//! tolerance.

use std::collections::HashMap;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{QSeekError, Result};

/// Hard recursion cap, a backstop beneath the spatial tolerance.
const MAX_DEPTH: usize = 16;

type Bounds = [[f64; 2]; 3];

#[derive(Debug, Clone)]
struct Cell {
    /// Corner samples; bit 2/1/0 of the index select the upper bound on
    /// axis 0/1/2.
    corners: [f32; 8],
    children: Vec<Cell>,
}

impl Cell {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SpTree {
    bounds: Bounds,
    root: Cell,
}

fn corner_point(bounds: &Bounds, corner: usize) -> [f64; 3] {
    [
        bounds[0][(corner >> 2) & 1],
        bounds[1][(corner >> 1) & 1],
        bounds[2][corner & 1],
    ]
}

fn child_bounds(bounds: &Bounds, octant: usize) -> Bounds {
    let mut child = *bounds;
    for axis in 0..3 {
        let mid = 0.5 * (bounds[axis][0] + bounds[axis][1]);
        if (octant >> (2 - axis)) & 1 == 0 {
            child[axis][1] = mid;
        } else {
            child[axis][0] = mid;
        }
    }
    child
}

fn trilinear(corners: &[f32; 8], t: [f64; 3]) -> f64 {
    if corners.iter().any(|value| value.is_nan()) {
        return f64::NAN;
    }
    let mut result = 0.0;
    for (corner, &value) in corners.iter().enumerate() {
        let mut weight = 1.0;
        for (axis, &t_axis) in t.iter().enumerate() {
            let hi = (corner >> (2 - axis)) & 1 == 1;
            weight *= if hi { t_axis } else { 1.0 - t_axis };
        }
        result += weight * value as f64;
    }
    result
}

fn normalized(bounds: &Bounds, point: [f64; 3]) -> [f64; 3] {
    let mut t = [0.0; 3];
    for axis in 0..3 {
        let [lo, hi] = bounds[axis];
        t[axis] = if hi > lo {
            (point[axis] - lo) / (hi - lo)
        } else {
            0.0
        };
    }
    t
}

impl SpTree {
    /// Sample `f` adaptively over `bounds`.
    pub fn build<F>(f: F, bounds: Bounds, ftol: f64, xtol: f64) -> Result<Self>
    where
        F: Fn([f64; 3]) -> Option<f64>,
    {
        if ftol <= 0.0 || xtol <= 0.0 {
            return Err(QSeekError::table("tolerances must be positive"));
        }
        for axis in bounds {
            if axis[0] > axis[1] {
                return Err(QSeekError::table(format!("invalid parameter bounds {axis:?}")));
            }
        }

        let mut memo: HashMap<[u64; 3], f32> = HashMap::new();
        let mut eval = |point: [f64; 3]| -> f32 {
            let key = [
                point[0].to_bits(),
                point[1].to_bits(),
                point[2].to_bits(),
            ];
            *memo
                .entry(key)
                .or_insert_with(|| f(point).map_or(f32::NAN, |value| value as f32))
        };

        let root = build_cell(&mut eval, &bounds, ftol, xtol, 0);
        Ok(Self { bounds, root })
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn n_leaves(&self) -> usize {
        fn count(cell: &Cell) -> usize {
            if cell.is_leaf() {
                1
            } else {
                cell.children.iter().map(count).sum()
            }
        }
        count(&self.root)
    }

    /// Interpolate at a point; NaN outside the bounds or in undefined
    /// regions.
    pub fn interpolate(&self, point: [f64; 3]) -> f64 {
        for axis in 0..3 {
            let [lo, hi] = self.bounds[axis];
            if point[axis] < lo || point[axis] > hi {
                return f64::NAN;
            }
        }

        let mut cell = &self.root;
        let mut bounds = self.bounds;
        while !cell.is_leaf() {
            let mut octant = 0;
            for axis in 0..3 {
                let mid = 0.5 * (bounds[axis][0] + bounds[axis][1]);
                if point[axis] > mid {
                    octant |= 1 << (2 - axis);
                }
            }
            bounds = child_bounds(&bounds, octant);
            cell = &cell.children[octant];
        }
        trilinear(&cell.corners, normalized(&bounds, point))
    }

    pub fn interpolate_many(&self, points: &[[f64; 3]]) -> Vec<f64> {
        points.iter().map(|&point| self.interpolate(point)).collect()
    }

    /// Serialize bounds and the cell tree in preorder.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for axis in &self.bounds {
            writer.write_f64::<LittleEndian>(axis[0])?;
            writer.write_f64::<LittleEndian>(axis[1])?;
        }
        write_cell(writer, &self.root)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bounds = [[0.0; 2]; 3];
        for axis in &mut bounds {
            axis[0] = reader.read_f64::<LittleEndian>()?;
            axis[1] = reader.read_f64::<LittleEndian>()?;
        }
        let root = read_cell(reader, 0)?;
        Ok(Self { bounds, root })
    }
}

fn build_cell<F>(eval: &mut F, bounds: &Bounds, ftol: f64, xtol: f64, depth: usize) -> Cell
where
    F: FnMut([f64; 3]) -> f32,
{
    let mut corners = [0.0_f32; 8];
    for (corner, value) in corners.iter_mut().enumerate() {
        *value = eval(corner_point(bounds, corner));
    }
    let cell = Cell {
        corners,
        children: Vec::new(),
    };

    if depth >= MAX_DEPTH {
        return cell;
    }
    let splittable = (0..3).any(|axis| (bounds[axis][1] - bounds[axis][0]) / 2.0 >= xtol);
    if !splittable {
        return cell;
    }

    // Probe the interpolation error at the center and the face centers.
    let center = [
        0.5 * (bounds[0][0] + bounds[0][1]),
        0.5 * (bounds[1][0] + bounds[1][1]),
        0.5 * (bounds[2][0] + bounds[2][1]),
    ];
    let mut probes = vec![center];
    for axis in 0..3 {
        for side in 0..2 {
            let mut probe = center;
            probe[axis] = bounds[axis][side];
            probes.push(probe);
        }
    }

    let mut error: f64 = 0.0;
    for probe in probes {
        let actual = eval(probe) as f64;
        let interpolated = trilinear(&corners, normalized(bounds, probe));
        let probe_error = match (actual.is_nan(), interpolated.is_nan()) {
            (true, true) => 0.0,
            (false, false) => (actual - interpolated).abs(),
            _ => f64::INFINITY,
        };
        error = error.max(probe_error);
    }
    if error <= ftol {
        return cell;
    }

    let children = (0..8)
        .map(|octant| build_cell(eval, &child_bounds(bounds, octant), ftol, xtol, depth + 1))
        .collect();
    Cell { corners, children }
}

fn write_cell<W: Write>(writer: &mut W, cell: &Cell) -> Result<()> {
    if cell.is_leaf() {
        writer.write_u8(0)?;
        for &value in &cell.corners {
            writer.write_f32::<LittleEndian>(value)?;
        }
    } else {
        writer.write_u8(1)?;
        for &value in &cell.corners {
            writer.write_f32::<LittleEndian>(value)?;
        }
        for child in &cell.children {
            write_cell(writer, child)?;
        }
    }
    Ok(())
}

fn read_cell<R: Read>(reader: &mut R, depth: usize) -> Result<Cell> {
    if depth > MAX_DEPTH {
        return Err(QSeekError::table("corrupt sampled-parameter tree payload"));
    }
    let flag = reader.read_u8()?;
    let mut corners = [0.0_f32; 8];
    for value in &mut corners {
        *value = reader.read_f32::<LittleEndian>()?;
    }
    let children = match flag {
        0 => Vec::new(),
        1 => (0..8)
            .map(|_| read_cell(reader, depth + 1))
            .collect::<Result<Vec<_>>>()?,
        other => {
            return Err(QSeekError::table(format!(
                "corrupt sampled-parameter tree, bad cell flag {other}"
            )));
        }
    };
    Ok(Cell { corners, children })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const BOUNDS: Bounds = [[0.0, 100.0], [0.0, 20_000.0], [0.0, 30_000.0]];

    fn spherical_time(point: [f64; 3]) -> Option<f64> {
        // Homogeneous travel time from depth difference and distance.
        let [receiver_depth, source_depth, distance] = point;
        let dz = source_depth - receiver_depth;
        Some((distance * distance + dz * dz).sqrt() / 5_500.0)
    }

    #[test]
    fn test_linear_function_stays_coarse() {
        let tree = SpTree::build(
            |point| Some(point[0] + 2.0 * point[1] + 3.0 * point[2]),
            BOUNDS,
            1.0,
            10.0,
        )
        .unwrap();
        assert_eq!(tree.n_leaves(), 1);
    }

    #[test]
    fn test_interpolation_accuracy() {
        let ftol = 0.05;
        let tree = SpTree::build(spherical_time, BOUNDS, ftol, 100.0).unwrap();
        assert!(tree.n_leaves() > 1);

        let mut worst: f64 = 0.0;
        for i in 0..500 {
            let point = [
                (i % 7) as f64 * 14.0,
                (i % 13) as f64 * 1_500.0,
                1_000.0 + (i % 29) as f64 * 1_000.0,
            ];
            let exact = spherical_time(point).unwrap();
            let interpolated = tree.interpolate(point);
            worst = worst.max((exact - interpolated).abs());
        }
        // Probing is sparse, allow some slack over the nominal tolerance.
        assert!(worst < 4.0 * ftol, "worst error {worst}");
    }

    #[test]
    fn test_outside_bounds_is_nan() {
        let tree = SpTree::build(spherical_time, BOUNDS, 0.1, 1_000.0).unwrap();
        assert!(tree.interpolate([-1.0, 0.0, 0.0]).is_nan());
        assert!(tree.interpolate([0.0, 0.0, 40_000.0]).is_nan());
    }

    #[test]
    fn test_undefined_regions_interpolate_to_nan() {
        let tree = SpTree::build(
            |point| {
                if point[2] > 15_000.0 {
                    None
                } else {
                    spherical_time(point)
                }
            },
            BOUNDS,
            0.1,
            2_000.0,
        )
        .unwrap();
        assert!(tree.interpolate([0.0, 1_000.0, 29_000.0]).is_nan());
        assert!(tree.interpolate([0.0, 1_000.0, 5_000.0]).is_finite());
    }

    #[test]
    fn test_io_roundtrip_is_bit_identical() {
        let tree = SpTree::build(spherical_time, BOUNDS, 0.05, 500.0).unwrap();

        let mut buffer = Vec::new();
        tree.write_to(&mut buffer).unwrap();
        let restored = SpTree::read_from(&mut Cursor::new(&buffer)).unwrap();

        assert_eq!(restored.bounds(), tree.bounds());
        assert_eq!(restored.n_leaves(), tree.n_leaves());
        for i in 0..200 {
            let point = [
                (i % 5) as f64 * 20.0,
                (i % 11) as f64 * 1_800.0,
                (i % 17) as f64 * 1_700.0,
            ];
            let a = tree.interpolate(point);
            let b = restored.interpolate(point);
            assert!(a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()));
        }
    }
}
