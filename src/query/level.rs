use crate::error::Error;
use crate::index::node::{Node, PointsNode};
use crate::query::{execute, FilterState, Query, QueryOptions, QueryStream};
use std::sync::Arc;

fn points(node: &Arc<Node>) -> &PointsNode {
    node.as_points().expect("resolved node is regular")
}

/// Streams the tree at a bounded depth: nodes `level` steps below the root
/// yield their lod samples, leaves higher up yield their full data. Level 0
/// is just the root's sample.
///
/// Cell exponents decrease by one per tree level, so the depth bound is
/// expressed through the executor's exponent floor.
pub fn points_at_level<Q: Query>(
    root: &Arc<Node>,
    query: Q,
    level: u32,
) -> Result<QueryStream<Q>, Error> {
    let root = root.resolve()?;
    let floor = root.cell().e - level as i32;
    Ok(execute(
        root,
        query,
        QueryOptions {
            min_exponent: Some(floor),
        },
    ))
}

/// Approximate number of points a [points_at_level] stream would yield.
///
/// Counts are accumulated from the stored per-node sample sizes without
/// touching attribute blobs. For cells only partially covered by the query
/// the whole cell is counted, so the result is an overestimate; fully
/// covered and fully excluded cells are counted exactly.
pub fn count_at_level<Q: Query>(root: &Arc<Node>, query: &Q, level: u32) -> Result<u64, Error> {
    count_rec(root, query, level)
}

fn count_rec<Q: Query>(node: &Arc<Node>, query: &Q, remaining: u32) -> Result<u64, Error> {
    let node = node.resolve()?;
    let pts = points(&node);
    if pts.point_count_tree() == 0 {
        return Ok(0);
    }
    if query.filter_node(pts) == FilterState::FullyOutside {
        return Ok(0);
    }
    if pts.is_leaf() {
        return Ok(pts.point_count_node() as u64);
    }
    if remaining == 0 {
        return Ok(pts.lod_point_count() as u64);
    }
    let mut sum = 0;
    if let Some(slots) = pts.subnodes() {
        for slot in slots.iter().flatten() {
            sum += count_rec(&slot.value()?, query, remaining - 1)?;
        }
    }
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::{count_at_level, points_at_level};
    use crate::cancel::CancellationToken;
    use crate::chunk::Chunk;
    use crate::geometry::bounding_box::Aabb;
    use crate::index::builder::OctreeBuilder;
    use crate::index::lod::LodGenerator;
    use crate::index::node::Node;
    use crate::query::hull::InsideBox;
    use crate::query::All;
    use crate::store::memory::InMemoryBlobStore;
    use crate::store::Storage;
    use nalgebra::Point3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn lod_tree(storage: &Storage, n: usize, split_limit: usize, seed: u64) -> Arc<Node> {
        let mut rng = StdRng::seed_from_u64(seed);
        let positions: Vec<Point3<f64>> = (0..n)
            .map(|_| Point3::new(rng.gen(), rng.gen(), rng.gen()))
            .collect();
        let root = OctreeBuilder::new(storage, split_limit, CancellationToken::new())
            .build_chunk(&Chunk::new(positions))
            .unwrap();
        LodGenerator::new(storage, split_limit, CancellationToken::new())
            .generate(root)
            .unwrap()
    }

    #[test]
    fn level_zero_yields_the_root_sample() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let root = lod_tree(&storage, 3000, 64, 1);
        let chunks: Vec<_> = points_at_level(&root, All, 0)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].len() <= 64);
    }

    #[test]
    fn deeper_levels_yield_more_points() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let root = lod_tree(&storage, 3000, 64, 2);
        let mut previous = 0;
        for level in 0..4 {
            let total: usize = points_at_level(&root, All, level)
                .unwrap()
                .map(|chunk| chunk.map(|c| c.len()))
                .sum::<Result<usize, _>>()
                .unwrap();
            assert!(total >= previous, "level {level}: {total} < {previous}");
            previous = total;
        }
    }

    #[test]
    fn counting_matches_the_stream_for_unfiltered_queries() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let root = lod_tree(&storage, 2000, 32, 3);
        for level in 0..4 {
            let streamed: usize = points_at_level(&root, All, level)
                .unwrap()
                .map(|chunk| chunk.map(|c| c.len()))
                .sum::<Result<usize, _>>()
                .unwrap();
            let counted = count_at_level(&root, &All, level).unwrap();
            assert_eq!(counted, streamed as u64);
        }
    }

    #[test]
    fn counting_overestimates_partial_regions() {
        let storage = Storage::new(Arc::new(InMemoryBlobStore::new()));
        let root = lod_tree(&storage, 2000, 32, 4);
        let region = InsideBox::new(Aabb::new(
            Point3::new(0.1, 0.1, 0.1),
            Point3::new(0.6, 0.55, 0.7),
        ));
        for level in 0..4 {
            let streamed: usize = points_at_level(&root, &region, level)
                .unwrap()
                .map(|chunk| chunk.map(|c| c.len()))
                .sum::<Result<usize, _>>()
                .unwrap();
            let counted = count_at_level(&root, &region, level).unwrap();
            assert!(
                counted >= streamed as u64,
                "level {level}: count {counted} < stream {streamed}"
            );
        }
    }
}
