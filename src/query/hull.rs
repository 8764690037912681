use crate::geometry::bounding_box::Aabb;
use crate::geometry::hull::ConvexHull;
use crate::geometry::plane::BoxSide;
use crate::index::node::PointsNode;
use crate::query::{FilterState, Query};
use nalgebra::{Matrix4, Point3};

fn state_of(side: BoxSide) -> FilterState {
    match side {
        BoxSide::Inside => FilterState::FullyInside,
        BoxSide::Outside => FilterState::FullyOutside,
        BoxSide::Intersecting => FilterState::Partial,
    }
}

/// All points inside a convex hull of half-spaces.
#[derive(Clone, Debug)]
pub struct InsideHull {
    hull: ConvexHull,
}

impl InsideHull {
    pub fn new(hull: ConvexHull) -> Self {
        InsideHull { hull }
    }

    /// The view-frustum query: the hull is derived by applying the inverse
    /// view-projection matrix to the corners of the canonical NDC cube.
    pub fn frustum(view_projection_inv: &Matrix4<f64>) -> Self {
        InsideHull {
            hull: ConvexHull::from_view_projection_inverse(view_projection_inv),
        }
    }
}

impl Query for InsideHull {
    fn filter_node(&self, node: &PointsNode) -> FilterState {
        let Some(bounds) = node.bounding_box() else {
            return FilterState::FullyOutside;
        };
        state_of(self.hull.classify(&bounds))
    }

    fn filter_point(&self, position: &Point3<f64>) -> bool {
        self.hull.contains(position)
    }
}

/// All points inside an axis-aligned box. Node classification uses the box
/// directly; the semantics equal the hull form of the box.
#[derive(Clone, Debug)]
pub struct InsideBox {
    bounds: Aabb<f64>,
}

impl InsideBox {
    pub fn new(bounds: Aabb<f64>) -> Self {
        InsideBox { bounds }
    }
}

impl Query for InsideBox {
    fn filter_node(&self, node: &PointsNode) -> FilterState {
        let Some(bounds) = node.bounding_box() else {
            return FilterState::FullyOutside;
        };
        if self.bounds.contains_aabb(&bounds) {
            FilterState::FullyInside
        } else if self.bounds.intersects(&bounds) {
            FilterState::Partial
        } else {
            FilterState::FullyOutside
        }
    }

    fn filter_point(&self, position: &Point3<f64>) -> bool {
        self.bounds.contains(position)
    }
}

#[cfg(test)]
mod tests {
    use super::{InsideBox, InsideHull};
    use crate::cancel::CancellationToken;
    use crate::chunk::Chunk;
    use crate::geometry::bounding_box::Aabb;
    use crate::geometry::hull::ConvexHull;
    use crate::index::builder::OctreeBuilder;
    use crate::index::node::Node;
    use crate::query::{collect_positions, Not, QueryOptions};
    use crate::store::memory::InMemoryBlobStore;
    use crate::store::Storage;
    use nalgebra::{Isometry3, Matrix4, Perspective3, Point3, Vector3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn cloud(storage: &Storage, n: usize, seed: u64) -> (Arc<Node>, Vec<Point3<f64>>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let positions: Vec<Point3<f64>> = (0..n)
            .map(|_| Point3::new(rng.gen(), rng.gen(), rng.gen()))
            .collect();
        let root = OctreeBuilder::new(storage, 64, CancellationToken::new())
            .build_chunk(&Chunk::new(positions.clone()))
            .unwrap();
        (root, positions)
    }

    #[test]
    fn inside_box_matches_reference() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let (root, positions) = cloud(&storage, 3000, 1);
        let region = Aabb::new(Point3::new(0.2, 0.2, 0.2), Point3::new(0.7, 0.6, 0.9));
        let got =
            collect_positions(Arc::clone(&root), InsideBox::new(region), QueryOptions::default())
                .unwrap();
        let expected = positions.iter().filter(|p| region.contains(p)).count();
        assert_eq!(got.len(), expected);
        let slack = region.inflate(1e-6);
        assert!(got.iter().all(|p| slack.contains(p)));
    }

    #[test]
    fn box_and_complement_partition_the_cloud() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let (root, positions) = cloud(&storage, 2000, 2);
        let region = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(0.5, 1.0, 1.0));
        let inside = collect_positions(
            Arc::clone(&root),
            InsideBox::new(region),
            QueryOptions::default(),
        )
        .unwrap();
        let outside = collect_positions(
            Arc::clone(&root),
            Not(InsideBox::new(region)),
            QueryOptions::default(),
        )
        .unwrap();
        assert_eq!(inside.len() + outside.len(), positions.len());
    }

    #[test]
    fn hull_form_of_a_box_agrees_with_the_box() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let (root, _) = cloud(&storage, 2000, 3);
        let region = Aabb::new(Point3::new(0.1, 0.3, 0.2), Point3::new(0.8, 0.7, 0.95));
        let via_box =
            collect_positions(Arc::clone(&root), InsideBox::new(region), QueryOptions::default())
                .unwrap();
        let via_hull = collect_positions(
            Arc::clone(&root),
            InsideHull::new(ConvexHull::from_aabb(&region)),
            QueryOptions::default(),
        )
        .unwrap();
        assert_eq!(via_box.len(), via_hull.len());
    }

    #[test]
    fn hull_and_complement_partition_the_cloud() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let (root, positions) = cloud(&storage, 2000, 5);
        let hull = ConvexHull::from_aabb(&Aabb::new(
            Point3::new(0.25, 0.25, 0.25),
            Point3::new(0.75, 0.75, 0.75),
        ));
        let inside = collect_positions(
            Arc::clone(&root),
            InsideHull::new(hull.clone()),
            QueryOptions::default(),
        )
        .unwrap();
        let outside = collect_positions(
            Arc::clone(&root),
            Not(InsideHull::new(hull)),
            QueryOptions::default(),
        )
        .unwrap();
        assert_eq!(inside.len() + outside.len(), positions.len());
    }

    #[test]
    fn frustum_query_matches_the_hull_predicate() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let (root, positions) = cloud(&storage, 3000, 4);

        let camera = Point3::new(0.5, 0.5, 3.0);
        let target = Point3::new(0.5, 0.5, 0.0);
        let view = Isometry3::look_at_rh(&camera, &target, &Vector3::y());
        let proj = Perspective3::new(1.0, 0.6, 0.1, 10.0);
        let view_projection_inv: Matrix4<f64> = view.inverse().to_matrix() * proj.inverse();

        let query = InsideHull::frustum(&view_projection_inv);
        let hull = ConvexHull::from_view_projection_inverse(&view_projection_inv);

        let got = collect_positions(Arc::clone(&root), query, QueryOptions::default()).unwrap();
        let expected = positions.iter().filter(|p| hull.contains(p)).count();
        assert_eq!(got.len(), expected);
        assert!(expected > 0, "frustum should see part of the cloud");
        assert!(got
            .iter()
            .all(|p| hull.planes().iter().all(|plane| plane.height(p) >= -1e-6)));
    }
}
