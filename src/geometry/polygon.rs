use crate::error::Error;
use crate::geometry::bounding_box::{Aabb, OptionAabb};
use crate::geometry::plane::Plane;
use nalgebra::{Point2, Point3, Vector3};

/// A planar polygon in 3D, used for proximity queries: a point is "near"
/// the polygon if its distance to the polygon region is at most some
/// tolerance.
#[derive(Clone, Debug)]
pub struct Polygon3 {
    plane: Plane,
    // orthonormal in-plane basis for the 2D tests
    u: Vector3<f64>,
    v: Vector3<f64>,
    origin: Point3<f64>,
    flat: Vec<Point2<f64>>,
    bounds: Aabb<f64>,
}

impl Polygon3 {
    /// Builds a polygon from at least three vertices. The vertices are
    /// expected to be coplanar; the plane is taken from the first three
    /// non-collinear ones.
    pub fn new(vertices: Vec<Point3<f64>>) -> Result<Self, Error> {
        if vertices.len() < 3 {
            return Err(Error::invalid_input("polygon needs at least 3 vertices"));
        }
        let origin = vertices[0];
        let mut plane = None;
        for i in 1..vertices.len() - 1 {
            let a = vertices[i] - origin;
            let b = vertices[i + 1] - origin;
            if a.cross(&b).norm_squared() > 0.0 {
                plane = Some(Plane::from_triangle(origin, vertices[i], vertices[i + 1]));
                break;
            }
        }
        let plane = plane.ok_or_else(|| Error::invalid_input("polygon vertices are collinear"))?;
        let u = (vertices[1] - origin).normalize();
        let v = plane.normal.cross(&u);
        let flat = vertices
            .iter()
            .map(|p| {
                let d = p - origin;
                Point2::new(d.dot(&u), d.dot(&v))
            })
            .collect();
        let bounds = OptionAabb::from_points(vertices.iter())
            .into_aabb()
            .expect("at least 3 vertices");
        Ok(Polygon3 {
            plane,
            u,
            v,
            origin,
            flat,
            bounds,
        })
    }

    pub fn plane(&self) -> &Plane {
        &self.plane
    }

    /// Bounding box of the polygon grown by the tolerance in every
    /// direction. Anything outside cannot be near the polygon.
    pub fn padded_bounds(&self, tolerance: f64) -> Aabb<f64> {
        self.bounds.inflate(tolerance)
    }

    fn project_flat(&self, p: &Point3<f64>) -> Point2<f64> {
        let d = p - self.origin;
        Point2::new(d.dot(&self.u), d.dot(&self.v))
    }

    fn contains_flat(&self, q: &Point2<f64>) -> bool {
        // even-odd crossing test
        let mut inside = false;
        let n = self.flat.len();
        for i in 0..n {
            let a = self.flat[i];
            let b = self.flat[(i + 1) % n];
            if (a.y > q.y) != (b.y > q.y) {
                let t = (q.y - a.y) / (b.y - a.y);
                if q.x < a.x + t * (b.x - a.x) {
                    inside = !inside;
                }
            }
        }
        inside
    }

    fn boundary_distance_sq(&self, q: &Point2<f64>) -> f64 {
        let n = self.flat.len();
        let mut best = f64::INFINITY;
        for i in 0..n {
            let a = self.flat[i];
            let b = self.flat[(i + 1) % n];
            let ab = b - a;
            let len_sq = ab.norm_squared();
            let t = if len_sq > 0.0 {
                ((q - a).dot(&ab) / len_sq).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let closest = a + ab * t;
            best = best.min((q - closest).norm_squared());
        }
        best
    }

    /// Euclidean distance of the point to the polygon region is at most
    /// `tolerance`.
    pub fn within_distance(&self, p: &Point3<f64>, tolerance: f64) -> bool {
        let h = self.plane.height(p);
        if h.abs() > tolerance {
            return false;
        }
        let q = self.project_flat(p);
        if self.contains_flat(&q) {
            return true;
        }
        h * h + self.boundary_distance_sq(&q) <= tolerance * tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::Polygon3;
    use nalgebra::Point3;

    fn unit_square() -> Polygon3 {
        Polygon3::new(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_degenerate_input() {
        assert!(Polygon3::new(vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0)]).is_err());
        assert!(Polygon3::new(vec![
            Point3::origin(),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ])
        .is_err());
    }

    #[test]
    fn inside_and_above() {
        let poly = unit_square();
        assert!(poly.within_distance(&Point3::new(0.5, 0.5, 0.0), 0.1));
        assert!(poly.within_distance(&Point3::new(0.5, 0.5, 0.05), 0.1));
        assert!(!poly.within_distance(&Point3::new(0.5, 0.5, 0.2), 0.1));
    }

    #[test]
    fn near_edge_and_corner() {
        let poly = unit_square();
        // next to an edge, inside tolerance
        assert!(poly.within_distance(&Point3::new(1.05, 0.5, 0.0), 0.1));
        // diagonal from a corner: distance is sqrt(2)*0.1 > 0.1
        assert!(!poly.within_distance(&Point3::new(1.1, 1.1, 0.0), 0.1));
        assert!(poly.within_distance(&Point3::new(1.1, 1.1, 0.0), 0.2));
        // off the plane next to the edge: combined distance counts
        assert!(!poly.within_distance(&Point3::new(1.08, 0.5, 0.08), 0.1));
    }

    #[test]
    fn padded_bounds() {
        let poly = unit_square();
        let bounds = poly.padded_bounds(0.5);
        assert_eq!(bounds.min(), Point3::new(-0.5, -0.5, -0.5));
        assert_eq!(bounds.max(), Point3::new(1.5, 1.5, 0.5));
    }
}
