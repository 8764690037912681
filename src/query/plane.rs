use crate::geometry::plane::{BoxSide, Plane};
use crate::index::node::PointsNode;
use crate::query::{FilterState, Query};
use nalgebra::Point3;

fn state_of(side: BoxSide) -> FilterState {
    match side {
        BoxSide::Inside => FilterState::FullyInside,
        BoxSide::Outside => FilterState::FullyOutside,
        BoxSide::Intersecting => FilterState::Partial,
    }
}

/// All points within `distance` of the plane (a slab of twice the
/// distance). Its complement, points farther than `distance`, is
/// [crate::query::Not] of this query.
#[derive(Clone, Debug)]
pub struct NearPlane {
    plane: Plane,
    distance: f64,
}

impl NearPlane {
    pub fn new(plane: Plane, distance: f64) -> Self {
        NearPlane { plane, distance }
    }
}

impl Query for NearPlane {
    fn filter_node(&self, node: &PointsNode) -> FilterState {
        let Some(bounds) = node.bounding_box() else {
            return FilterState::FullyOutside;
        };
        state_of(self.plane.classify_slab(&bounds, self.distance))
    }

    fn filter_point(&self, position: &Point3<f64>) -> bool {
        self.plane.height(position).abs() <= self.distance
    }
}

/// All points within `distance` of at least one of the planes.
#[derive(Clone, Debug)]
pub struct NearAnyPlane {
    planes: Vec<Plane>,
    distance: f64,
}

impl NearAnyPlane {
    pub fn new(planes: Vec<Plane>, distance: f64) -> Self {
        NearAnyPlane { planes, distance }
    }
}

impl Query for NearAnyPlane {
    fn filter_node(&self, node: &PointsNode) -> FilterState {
        let Some(bounds) = node.bounding_box() else {
            return FilterState::FullyOutside;
        };
        let mut any_intersecting = false;
        for plane in &self.planes {
            match plane.classify_slab(&bounds, self.distance) {
                BoxSide::Inside => return FilterState::FullyInside,
                BoxSide::Intersecting => any_intersecting = true,
                BoxSide::Outside => {}
            }
        }
        if any_intersecting {
            FilterState::Partial
        } else {
            FilterState::FullyOutside
        }
    }

    fn filter_point(&self, position: &Point3<f64>) -> bool {
        self.planes
            .iter()
            .any(|plane| plane.height(position).abs() <= self.distance)
    }
}
