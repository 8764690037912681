use crate::geometry::bounding_box::Aabb;
use crate::geometry::plane::{BoxSide, Plane};
use nalgebra::{Matrix4, Point3};

/// A convex region described as the intersection of half-spaces.
/// All plane normals point into the region.
#[derive(Clone, Debug)]
pub struct ConvexHull {
    planes: Vec<Plane>,
}

impl ConvexHull {
    /// The normals of the given planes must already point inward.
    pub fn from_planes(planes: Vec<Plane>) -> Self {
        ConvexHull { planes }
    }

    /// The hull form of an axis aligned box.
    pub fn from_aabb(bounds: &Aabb<f64>) -> Self {
        let min = bounds.min();
        let max = bounds.max();
        ConvexHull {
            planes: vec![
                Plane::new(nalgebra::Vector3::x(), min.x),
                Plane::new(-nalgebra::Vector3::x(), -max.x),
                Plane::new(nalgebra::Vector3::y(), min.y),
                Plane::new(-nalgebra::Vector3::y(), -max.y),
                Plane::new(nalgebra::Vector3::z(), min.z),
                Plane::new(-nalgebra::Vector3::z(), -max.z),
            ],
        }
    }

    /// Hull of a (possibly non-axis-aligned) hexahedron given by the eight
    /// transformed corners of a cube, in `x + 2y + 4z` octant order.
    /// Plane orientations are fixed up against the interior point, so the
    /// corner transform may mirror.
    pub fn from_corners(corners: &[Point3<f64>; 8]) -> Self {
        let mut interior = nalgebra::Vector3::zeros();
        for c in corners {
            interior += c.coords;
        }
        let interior = Point3::from(interior / 8.0);

        let mut planes = vec![
            // x min / max faces
            Plane::from_triangle(corners[0], corners[2], corners[4]),
            Plane::from_triangle(corners[1], corners[5], corners[3]),
            // y min / max faces
            Plane::from_triangle(corners[0], corners[4], corners[1]),
            Plane::from_triangle(corners[2], corners[3], corners[6]),
            // z min / max faces
            Plane::from_triangle(corners[0], corners[1], corners[2]),
            Plane::from_triangle(corners[4], corners[6], corners[5]),
        ];
        for plane in &mut planes {
            if !plane.is_on_positive_side(&interior) {
                plane.normal = -plane.normal;
                plane.b = -plane.b;
            }
        }
        ConvexHull { planes }
    }

    /// The view frustum of a camera, derived by applying the inverse
    /// view-projection matrix to the corners of the canonical NDC cube.
    pub fn from_view_projection_inverse(view_projection_inv: &Matrix4<f64>) -> Self {
        let ndc = Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let corners = ndc.corners().map(|c| view_projection_inv.transform_point(&c));
        Self::from_corners(&corners)
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn contains(&self, point: &Point3<f64>) -> bool {
        self.planes.iter().all(|p| p.height(point) >= 0.0)
    }

    /// Classifies a box against the hull.
    ///
    /// `Outside` is decided per half-space, so a box that only overlaps the
    /// hull's corner regions may be classified as `Intersecting` even though
    /// it is disjoint. That is the conservative direction: traversal will
    /// visit the node and the per-point test rejects its points.
    pub fn classify(&self, bounds: &Aabb<f64>) -> BoxSide {
        let mut all_inside = true;
        for plane in &self.planes {
            match plane.classify_half_space(bounds) {
                BoxSide::Outside => return BoxSide::Outside,
                BoxSide::Intersecting => all_inside = false,
                BoxSide::Inside => {}
            }
        }
        if all_inside {
            BoxSide::Inside
        } else {
            BoxSide::Intersecting
        }
    }
}
