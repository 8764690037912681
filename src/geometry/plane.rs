use crate::geometry::bounding_box::Aabb;
use nalgebra::{Point3, Vector3};

/// An oriented plane `normal . p = b` with unit normal.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Plane {
    pub normal: Vector3<f64>,
    pub b: f64,
}

/// Where a box sits relative to a slab or half-space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoxSide {
    Inside,
    Outside,
    Intersecting,
}

impl Plane {
    pub fn new(normal: Vector3<f64>, b: f64) -> Self {
        Plane { normal, b }
    }

    pub fn from_triangle(p1: Point3<f64>, p2: Point3<f64>, p3: Point3<f64>) -> Self {
        let normal = (p2 - p1).cross(&(p3 - p1)).normalize();
        let b = normal.dot(&p1.coords);
        Plane { normal, b }
    }

    pub fn from_point_and_normal(point: Point3<f64>, normal: Vector3<f64>) -> Self {
        let normal = normal.normalize();
        let b = normal.dot(&point.coords);
        Plane { normal, b }
    }

    /// Signed height of the point over the plane.
    #[inline]
    pub fn height(&self, p: &Point3<f64>) -> f64 {
        self.normal.dot(&p.coords) - self.b
    }

    pub fn is_on_positive_side(&self, p: &Point3<f64>) -> bool {
        self.height(p) >= 0.0
    }

    pub fn project(&self, p: &Point3<f64>) -> Point3<f64> {
        p - self.normal * self.height(p)
    }

    /// Signed height range of the box corners over the plane.
    pub fn height_range(&self, bounds: &Aabb<f64>) -> (f64, f64) {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for corner in bounds.corners() {
            let h = self.height(&corner);
            min = min.min(h);
            max = max.max(h);
        }
        (min, max)
    }

    /// Classifies the box against the slab `|height| <= distance`.
    pub fn classify_slab(&self, bounds: &Aabb<f64>, distance: f64) -> BoxSide {
        let (min, max) = self.height_range(bounds);
        if min > distance || max < -distance {
            BoxSide::Outside
        } else if -distance <= min && max <= distance {
            BoxSide::Inside
        } else {
            BoxSide::Intersecting
        }
    }

    /// Classifies the box against the positive half-space `height >= 0`.
    pub fn classify_half_space(&self, bounds: &Aabb<f64>) -> BoxSide {
        let (min, max) = self.height_range(bounds);
        if min >= 0.0 {
            BoxSide::Inside
        } else if max < 0.0 {
            BoxSide::Outside
        } else {
            BoxSide::Intersecting
        }
    }
}
