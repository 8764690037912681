use crate::geometry::bounding_box::Aabb;
use crate::geometry::polygon::Polygon3;
use crate::index::node::PointsNode;
use crate::query::{FilterState, Query};
use nalgebra::Point3;

/// All points within `tolerance` of a planar polygon.
///
/// Node classification only ever rejects: the padded bounding box of the
/// polygon is a coarse hull, so nodes overlapping it still go through the
/// per-point test. A node is never `FullyInside` a polygon neighbourhood.
#[derive(Clone, Debug)]
pub struct NearPolygon {
    polygon: Polygon3,
    tolerance: f64,
    padded: Aabb<f64>,
}

impl NearPolygon {
    pub fn new(polygon: Polygon3, tolerance: f64) -> Self {
        let padded = polygon.padded_bounds(tolerance);
        NearPolygon {
            polygon,
            tolerance,
            padded,
        }
    }
}

impl Query for NearPolygon {
    fn filter_node(&self, node: &PointsNode) -> FilterState {
        let Some(bounds) = node.bounding_box() else {
            return FilterState::FullyOutside;
        };
        if self.padded.intersects(&bounds) {
            FilterState::Partial
        } else {
            FilterState::FullyOutside
        }
    }

    fn filter_point(&self, position: &Point3<f64>) -> bool {
        self.polygon.within_distance(position, self.tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::NearPolygon;
    use crate::cancel::CancellationToken;
    use crate::chunk::Chunk;
    use crate::geometry::polygon::Polygon3;
    use crate::index::builder::OctreeBuilder;
    use crate::query::{collect_positions, QueryOptions};
    use crate::store::memory::InMemoryBlobStore;
    use crate::store::Storage;
    use nalgebra::Point3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    #[test]
    fn polygon_neighbourhood_matches_reference() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let mut rng = StdRng::seed_from_u64(1);
        let positions: Vec<Point3<f64>> = (0..3000)
            .map(|_| Point3::new(rng.gen(), rng.gen(), rng.gen()))
            .collect();
        let root = OctreeBuilder::new(&storage, 64, CancellationToken::new())
            .build_chunk(&Chunk::new(positions.clone()))
            .unwrap();

        let polygon = Polygon3::new(vec![
            Point3::new(0.2, 0.2, 0.5),
            Point3::new(0.8, 0.2, 0.5),
            Point3::new(0.8, 0.8, 0.5),
            Point3::new(0.2, 0.8, 0.5),
        ])
        .unwrap();
        let tolerance = 0.1;
        let reference = polygon.clone();
        let got = collect_positions(
            root,
            NearPolygon::new(polygon, tolerance),
            QueryOptions::default(),
        )
        .unwrap();

        let expected = positions
            .iter()
            .filter(|p| reference.within_distance(p, tolerance))
            .count();
        assert_eq!(got.len(), expected);
        assert!(expected > 0);
        assert!(got.iter().all(|p| reference.within_distance(p, tolerance + 1e-6)));
    }

    #[test]
    fn far_away_nodes_are_pruned_without_point_tests() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let positions: Vec<Point3<f64>> =
            (0..100).map(|i| Point3::new(i as f64 + 10.0, 0.0, 0.0)).collect();
        let root = OctreeBuilder::new(&storage, 16, CancellationToken::new())
            .build_chunk(&Chunk::new(positions))
            .unwrap();
        let polygon = Polygon3::new(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ])
        .unwrap();
        let got = collect_positions(
            root,
            NearPolygon::new(polygon, 0.5),
            QueryOptions::default(),
        )
        .unwrap();
        assert!(got.is_empty());
    }
}
