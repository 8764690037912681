use crate::geometry::bounding_box::Aabb;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};

fn is_false(value: &bool) -> bool {
    !*value
}

/// An axis aligned cube in the octree grid, identified by integer
/// coordinates and an exponent. The side length is `2^e`; a regular cell
/// covers the half-open box `[x * 2^e, (x + 1) * 2^e)` per axis.
///
/// The `centered` variant covers `[-2^(e-1), +2^(e-1))` per axis. It is the
/// only cell form that straddles the origin and is required as the common
/// root of trees located on both sides of a coordinate plane. A centered
/// cell always carries `x = y = z = 0`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub e: i32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub centered: bool,
}

/// Arithmetic shift that keeps flooring for arbitrarily large distances.
fn floor_shift(value: i64, shift: i32) -> i64 {
    if shift >= 63 {
        if value < 0 {
            -1
        } else {
            0
        }
    } else {
        value >> shift
    }
}

impl Cell {
    pub fn new(x: i64, y: i64, z: i64, e: i32) -> Self {
        Cell {
            x,
            y,
            z,
            e,
            centered: false,
        }
    }

    pub fn centered(e: i32) -> Self {
        Cell {
            x: 0,
            y: 0,
            z: 0,
            e,
            centered: true,
        }
    }

    /// The cell at exponent `e` containing the given point.
    pub fn at_point(point: &Point3<f64>, e: i32) -> Self {
        let side = (e as f64).exp2();
        Cell::new(
            (point.x / side).floor() as i64,
            (point.y / side).floor() as i64,
            (point.z / side).floor() as i64,
            e,
        )
    }

    /// The unique smallest cell containing the given non-empty bounding box.
    /// Boxes that straddle a coordinate plane get a centered cell.
    pub fn containing(bounds: &Aabb<f64>) -> Self {
        let min = bounds.min();
        let max = bounds.max();
        let straddle = (min.x < 0.0 && max.x >= 0.0)
            || (min.y < 0.0 && max.y >= 0.0)
            || (min.z < 0.0 && max.z >= 0.0);
        if straddle {
            let m = min
                .coords
                .amax()
                .max(max.coords.amax());
            let mut e = if m > 0.0 {
                m.log2().ceil() as i32 + 1
            } else {
                1
            };
            loop {
                let candidate = Cell::centered(e);
                if candidate.contains_point(&min) && candidate.contains_point(&max) {
                    return candidate;
                }
                e += 1;
            }
        }
        let extent = (max - min).amax();
        let mut e = if extent > 0.0 {
            extent.log2().ceil() as i32
        } else {
            0
        };
        loop {
            let candidate = Cell::at_point(&min, e);
            if candidate.contains_point(&max) {
                return candidate;
            }
            e += 1;
        }
    }

    /// Side length, `2^e`.
    #[inline]
    pub fn side(&self) -> f64 {
        (self.e as f64).exp2()
    }

    pub fn center(&self) -> Point3<f64> {
        if self.centered {
            Point3::origin()
        } else {
            let side = self.side();
            Point3::new(
                (self.x as f64 + 0.5) * side,
                (self.y as f64 + 0.5) * side,
                (self.z as f64 + 0.5) * side,
            )
        }
    }

    pub fn bounds(&self) -> Aabb<f64> {
        if self.centered {
            let half = (self.e as f64 - 1.0).exp2();
            Aabb::new(
                Point3::new(-half, -half, -half),
                Point3::new(half, half, half),
            )
        } else {
            let side = self.side();
            Aabb::new(
                Point3::new(
                    self.x as f64 * side,
                    self.y as f64 * side,
                    self.z as f64 * side,
                ),
                Point3::new(
                    (self.x + 1) as f64 * side,
                    (self.y + 1) as f64 * side,
                    (self.z + 1) as f64 * side,
                ),
            )
        }
    }

    /// Half-open containment test matching the grid tiling: a point exactly
    /// on a cell's upper face belongs to the neighbouring cell.
    pub fn contains_point(&self, point: &Point3<f64>) -> bool {
        let bounds = self.bounds();
        let min = bounds.min();
        let max = bounds.max();
        min.x <= point.x
            && point.x < max.x
            && min.y <= point.y
            && point.y < max.y
            && min.z <= point.z
            && point.z < max.z
    }

    /// The octant of the given point relative to the cell center,
    /// as `x + 2y + 4z` with each bit set on the upper side.
    pub fn octant_of(&self, point: &Point3<f64>) -> u8 {
        let center = self.center();
        let mut octant = 0;
        if point.x >= center.x {
            octant |= 1;
        }
        if point.y >= center.y {
            octant |= 2;
        }
        if point.z >= center.z {
            octant |= 4;
        }
        octant
    }

    /// The child cell in the given octant. The 8 children tile the cell.
    pub fn child(&self, octant: u8) -> Cell {
        debug_assert!(octant < 8);
        let bx = (octant & 1) as i64;
        let by = ((octant >> 1) & 1) as i64;
        let bz = ((octant >> 2) & 1) as i64;
        if self.centered {
            // children are the 8 regular cells touching the origin
            Cell::new(bx - 1, by - 1, bz - 1, self.e - 1)
        } else {
            Cell::new(
                self.x * 2 + bx,
                self.y * 2 + by,
                self.z * 2 + bz,
                self.e - 1,
            )
        }
    }

    pub fn children(&self) -> [Cell; 8] {
        std::array::from_fn(|octant| self.child(octant as u8))
    }

    pub fn parent(&self) -> Cell {
        if self.centered {
            Cell::centered(self.e + 1)
        } else {
            Cell::new(
                floor_shift(self.x, 1),
                floor_shift(self.y, 1),
                floor_shift(self.z, 1),
                self.e + 1,
            )
        }
    }

    /// The ancestor of a regular cell at the given (coarser) exponent.
    fn ancestor_at(&self, e: i32) -> Cell {
        debug_assert!(!self.centered);
        debug_assert!(e >= self.e);
        let shift = e - self.e;
        Cell::new(
            floor_shift(self.x, shift),
            floor_shift(self.y, shift),
            floor_shift(self.z, shift),
            e,
        )
    }

    pub fn contains_cell(&self, other: &Cell) -> bool {
        match (self.centered, other.centered) {
            (false, false) => other.e <= self.e && other.ancestor_at(self.e) == *self,
            (false, true) => false,
            (true, true) => other.e <= self.e,
            (true, false) => {
                // contained iff the ancestor one level below self touches the origin
                if other.e > self.e - 1 {
                    return false;
                }
                let anc = other.ancestor_at(self.e - 1);
                (-1..=0).contains(&anc.x)
                    && (-1..=0).contains(&anc.y)
                    && (-1..=0).contains(&anc.z)
            }
        }
    }

    /// The child octant through which the given regular descendant cell is
    /// reached. `other` must be a proper descendant and not centered.
    pub fn octant_of_cell(&self, other: &Cell) -> u8 {
        debug_assert!(!other.centered);
        debug_assert!(self.contains_cell(other));
        let anc = other.ancestor_at(self.e - 1);
        let mut octant = 0;
        if self.centered {
            if anc.x == 0 {
                octant |= 1;
            }
            if anc.y == 0 {
                octant |= 2;
            }
            if anc.z == 0 {
                octant |= 4;
            }
        } else {
            octant |= (anc.x - self.x * 2) as u8;
            octant |= ((anc.y - self.y * 2) as u8) << 1;
            octant |= ((anc.z - self.z * 2) as u8) << 2;
        }
        octant
    }

    /// The smallest cell containing both operands. Cells located on both
    /// sides of a coordinate plane (or involving a centered operand that is
    /// not already contained in the other) get the smallest sufficient
    /// centered cell.
    pub fn common_root(a: &Cell, b: &Cell) -> Cell {
        if a.contains_cell(b) {
            return *a;
        }
        if b.contains_cell(a) {
            return *b;
        }
        let straddle = a.centered
            || b.centered
            || (a.x >= 0) != (b.x >= 0)
            || (a.y >= 0) != (b.y >= 0)
            || (a.z >= 0) != (b.z >= 0);
        if straddle {
            let mut e = a.e.max(b.e) + 1;
            loop {
                let candidate = Cell::centered(e);
                if candidate.contains_cell(a) && candidate.contains_cell(b) {
                    return candidate;
                }
                e += 1;
            }
        }
        let mut a = *a;
        let mut b = *b;
        while a.e < b.e {
            a = a.parent();
        }
        while b.e < a.e {
            b = b.parent();
        }
        while a != b {
            a = a.parent();
            b = b.parent();
        }
        a
    }
}

impl Debug for Cell {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.centered {
            write!(f, "Cell(centered, e={})", self.e)
        } else {
            write!(f, "Cell({},{},{}, e={})", self.x, self.y, self.z, self.e)
        }
    }
}
