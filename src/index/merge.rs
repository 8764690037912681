use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::geometry::bounding_box::OptionAabb;
use crate::geometry::cell::Cell;
use crate::index::builder::{OctreeBuilder, PointData};
use crate::index::node::{publish_link, publish_node, Node, NodeParams, PointsNode};
use crate::store::Storage;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Combines two independently built octrees into one.
///
/// The roots are aligned into the smallest common enclosing cell, then
/// overlapping cells are combined recursively subject to the split limit,
/// re-splitting leaves where the union grows past it. The output is a new
/// tree; both inputs stay intact in the store. Merged nodes never carry lod
/// attributes; the lod pass runs after all merging is done.
pub struct MergeEngine<'a> {
    storage: &'a Storage,
    split_limit: usize,
    cancel: CancellationToken,
}

fn points(node: &Arc<Node>) -> &PointsNode {
    node.as_points().expect("resolved node is regular")
}

impl<'a> MergeEngine<'a> {
    pub fn new(storage: &'a Storage, split_limit: usize, cancel: CancellationToken) -> Self {
        MergeEngine {
            storage,
            split_limit,
            cancel,
        }
    }

    fn builder(&self) -> OctreeBuilder<'a> {
        OctreeBuilder::new(self.storage, self.split_limit, self.cancel.clone())
    }

    /// Merges two trees. The union of the input point multisets equals the
    /// multiset of points in the output; point order is not preserved.
    pub fn merge(&self, a: Arc<Node>, b: Arc<Node>) -> Result<Arc<Node>, Error> {
        let a = a.resolve()?;
        let b = b.resolve()?;
        let count_a = points(&a).point_count_tree();
        let count_b = points(&b).point_count_tree();
        if count_a == 0 && count_b == 0 {
            // a merge may never produce an empty tree
            return Err(Error::corrupt("merge of two empty trees"));
        }
        if count_a == 0 {
            return Ok(b);
        }
        if count_b == 0 {
            return Ok(a);
        }

        let root = Cell::common_root(&a.cell(), &b.cell());
        log::debug!(
            "merging {} ({count_a} points) and {} ({count_b} points) at {root:?}",
            a.id(),
            b.id()
        );
        let merged = self.merge_into_cell(root, a, b)?;
        let count = merged.point_count_tree()?;
        if count != count_a + count_b {
            return Err(Error::corrupt(format!(
                "merge lost points: {count_a} + {count_b} -> {count}"
            )));
        }
        Ok(merged)
    }

    /// Merges the contents of `a` and `b`, both contained in `cell`, into a
    /// node at exactly `cell`.
    fn merge_into_cell(&self, cell: Cell, a: Arc<Node>, b: Arc<Node>) -> Result<Arc<Node>, Error> {
        self.cancel.check()?;
        let a = self.fit_to_cell(a, cell)?;
        let b = self.fit_to_cell(b, cell)?;
        let content_a = a.resolve()?;
        let content_b = b.resolve()?;
        let pa = points(&content_a);
        let pb = points(&content_b);

        match (pa.is_leaf(), pb.is_leaf()) {
            (true, true) => {
                let data = PointData::concat(PointData::from_leaf(pa)?, PointData::from_leaf(pb)?);
                self.rebuild(cell, data)
            }
            (true, false) => self.insert_data(cell, content_b, PointData::from_leaf(pa)?),
            (false, true) => self.insert_data(cell, content_a, PointData::from_leaf(pb)?),
            (false, false) => {
                let mut subnodes: [Option<Arc<Node>>; 8] = Default::default();
                for octant in 0u8..8 {
                    let merged = match (pa.subnode(octant), pb.subnode(octant)) {
                        (Some(ra), Some(rb)) => Some(self.merge_into_cell(
                            cell.child(octant),
                            ra.value()?,
                            rb.value()?,
                        )?),
                        (Some(ra), None) => Some(ra.value()?),
                        (None, Some(rb)) => Some(rb.value()?),
                        (None, None) => None,
                    };
                    subnodes[octant as usize] = merged;
                }
                self.publish_inner(cell, subnodes)
            }
        }
    }

    /// Pours loose samples into the subtree rooted at `node` (contained in
    /// `cell`), re-splitting leaves that grow past the split limit.
    fn insert_data(&self, cell: Cell, node: Arc<Node>, data: PointData) -> Result<Arc<Node>, Error> {
        self.cancel.check()?;
        let content = node.resolve()?;
        let pts = points(&content);
        if pts.is_leaf() {
            let merged = PointData::concat(PointData::from_leaf(pts)?, data);
            return self.rebuild(cell, merged);
        }

        let mut buckets: [Vec<u32>; 8] = Default::default();
        for (i, p) in data.positions.iter().enumerate() {
            buckets[cell.octant_of(p) as usize].push(i as u32);
        }

        let mut subnodes: [Option<Arc<Node>>; 8] = Default::default();
        for octant in 0u8..8 {
            let bucket = &buckets[octant as usize];
            let existing = pts.subnode(octant);
            subnodes[octant as usize] = match (existing, bucket.is_empty()) {
                (Some(r), true) => Some(r.value()?),
                (Some(r), false) => {
                    Some(self.insert_data(cell.child(octant), r.value()?, data.take(bucket))?)
                }
                (None, false) => {
                    Some(self.builder().build_on_cell(data.take(bucket), cell.child(octant))?)
                }
                (None, true) => None,
            };
        }
        self.publish_inner(cell, subnodes)
    }

    fn rebuild(&self, cell: Cell, data: PointData) -> Result<Arc<Node>, Error> {
        if data.len() <= self.split_limit {
            self.builder().make_leaf(data, cell)
        } else {
            self.builder().build_on_cell(data, cell)
        }
    }

    fn publish_inner(
        &self,
        cell: Cell,
        subnodes: [Option<Arc<Node>>; 8],
    ) -> Result<Arc<Node>, Error> {
        let mut point_count_tree = 0u64;
        let mut bounding_box = OptionAabb::empty();
        let mut any = false;
        for child in subnodes.iter().flatten() {
            any = true;
            let content = child.resolve()?;
            let child_points = points(&content);
            point_count_tree += child_points.point_count_tree();
            if let Some(bounds) = child_points.bounding_box() {
                bounding_box.extend_union(&bounds.into());
            }
        }
        if !any || point_count_tree == 0 {
            return Err(Error::corrupt("merge produced an empty inner node"));
        }
        Ok(publish_node(
            self.storage,
            NodeParams {
                cell,
                bounding_box,
                point_count_tree,
                point_count_node: 0,
                subnodes: Some(subnodes),
                attributes: BTreeMap::new(),
            },
        )?)
    }

    /// Returns a node at exactly `target` covering the same content.
    ///
    /// Regular cells are reached by wrapping the node in a chain of
    /// single-child inner nodes, zero-padded siblings. A centered root
    /// absorbs a regular-celled tree through the matching child octant. A
    /// centered tree lifted into a larger centered cell redistributes its
    /// octants; a centered leaf becomes a forwarding link node instead:
    /// both cells share the origin as their center, so the stored relative
    /// positions remain valid without rewriting any blob.
    fn fit_to_cell(&self, node: Arc<Node>, target: Cell) -> Result<Arc<Node>, Error> {
        if node.cell() == target {
            return Ok(node);
        }
        let content = node.resolve()?;
        let cell = content.cell();
        if cell == target {
            return Ok(content);
        }
        if !target.contains_cell(&cell) {
            return Err(Error::corrupt(format!(
                "cannot lift {cell:?} into non-enclosing {target:?}"
            )));
        }
        let pts = points(&content);

        if cell.centered {
            // only a centered cell can enclose another centered cell
            debug_assert!(target.centered);
            if pts.is_leaf() {
                return Ok(publish_link(self.storage, target, &content)?);
            }
            let mut subnodes: [Option<Arc<Node>>; 8] = Default::default();
            for octant in 0u8..8 {
                if let Some(r) = pts.subnode(octant) {
                    // each octant of the smaller centered cell lies in the
                    // same octant of the larger one
                    subnodes[octant as usize] =
                        Some(self.fit_to_cell(r.value()?, target.child(octant))?);
                }
            }
            return self.publish_inner(target, subnodes);
        }

        // regular cell: wrap upwards one level at a time
        let mut current = content;
        let mut current_cell = cell;
        while current_cell != target {
            let up = if target.centered && current_cell.e == target.e - 1 {
                target
            } else {
                current_cell.parent()
            };
            let octant = up.octant_of_cell(&current_cell);
            let current_points = points(&current);
            let point_count_tree = current_points.point_count_tree();
            let bounding_box: OptionAabb<f64> = match current_points.bounding_box() {
                Some(bounds) => bounds.into(),
                None => OptionAabb::empty(),
            };
            let mut subnodes: [Option<Arc<Node>>; 8] = Default::default();
            subnodes[octant as usize] = Some(Arc::clone(&current));
            current = publish_node(
                self.storage,
                NodeParams {
                    cell: up,
                    bounding_box,
                    point_count_tree,
                    point_count_node: 0,
                    subnodes: Some(subnodes),
                    attributes: BTreeMap::new(),
                },
            )?;
            current_cell = up;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::MergeEngine;
    use crate::cancel::CancellationToken;
    use crate::chunk::Chunk;
    use crate::index::builder::OctreeBuilder;
    use crate::index::collect_all_points;
    use crate::index::node::Node;
    use crate::store::memory::InMemoryBlobStore;
    use crate::store::Storage;
    use nalgebra::Point3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn storage() -> Storage {
        Storage::new(Arc::new(InMemoryBlobStore::new()))
    }

    fn build(storage: &Storage, split_limit: usize, positions: Vec<Point3<f64>>) -> Arc<Node> {
        OctreeBuilder::new(storage, split_limit, CancellationToken::new())
            .build_chunk(&Chunk::new(positions))
            .unwrap()
    }

    fn random_positions(n: usize, offset: f64, seed: u64) -> Vec<Point3<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Point3::new(
                    rng.gen::<f64>() + offset,
                    rng.gen::<f64>() + offset,
                    rng.gen::<f64>() + offset,
                )
            })
            .collect()
    }

    use crate::index::testing::assert_same_point_multiset;

    fn check_structure(node: &Arc<Node>) {
        let node = node.resolve().unwrap();
        let points = node.as_points().unwrap();
        match points.subnodes() {
            None => {
                let relative = points.positions().unwrap().unwrap();
                assert_eq!(relative.len() as u64, points.point_count_tree());
                let cell = points.cell();
                let bounds = cell.bounds().inflate(cell.side() * 1e-6);
                for p in points.to_absolute(&relative) {
                    assert!(bounds.contains(&p));
                }
            }
            Some(slots) => {
                assert_eq!(points.point_count_node(), 0);
                let mut sum = 0;
                for slot in slots.iter().flatten() {
                    let child = slot.value().unwrap();
                    assert!(points.cell().contains_cell(&child.cell()));
                    sum += child.point_count_tree().unwrap();
                    check_structure(&child);
                }
                assert_eq!(sum, points.point_count_tree());
            }
        }
    }

    #[test]
    fn merge_two_small_leaves() {
        let storage = storage();
        let a = build(&storage, 10, vec![Point3::new(0.25, 0.25, 0.25)]);
        let b = build(&storage, 10, vec![Point3::new(0.75, 0.75, 0.75)]);
        let engine = MergeEngine::new(&storage, 10, CancellationToken::new());
        let merged = engine.merge(a, b).unwrap();
        assert_eq!(merged.point_count_tree().unwrap(), 2);
        check_structure(&merged);
    }

    #[test]
    fn merge_overlapping_clouds_preserves_the_multiset() {
        let storage = storage();
        let pos_a = random_positions(4200, 0.0, 1);
        let pos_b = random_positions(4200, 0.3, 2);
        let a = build(&storage, 1000, pos_a.clone());
        let b = build(&storage, 1000, pos_b.clone());
        let engine = MergeEngine::new(&storage, 1000, CancellationToken::new());
        let merged = engine.merge(a, b).unwrap();

        assert_eq!(merged.point_count_tree().unwrap(), 8400);
        check_structure(&merged);

        let mut expected = pos_a;
        expected.extend(pos_b);
        let collected = collect_all_points(&merged).unwrap();
        assert_same_point_multiset(&collected, &expected, 1e-5);
    }

    #[test]
    fn merge_is_commutative_on_the_point_multiset() {
        let storage = storage();
        let pos_a = random_positions(500, 0.0, 3);
        let pos_b = random_positions(700, 0.5, 4);
        let engine = MergeEngine::new(&storage, 100, CancellationToken::new());

        let ab = engine
            .merge(
                build(&storage, 100, pos_a.clone()),
                build(&storage, 100, pos_b.clone()),
            )
            .unwrap();
        let ba = engine
            .merge(
                build(&storage, 100, pos_b.clone()),
                build(&storage, 100, pos_a.clone()),
            )
            .unwrap();

        assert_same_point_multiset(
            &collect_all_points(&ab).unwrap(),
            &collect_all_points(&ba).unwrap(),
            1e-5,
        );
    }

    #[test]
    fn merge_is_associative_on_the_point_multiset() {
        let storage = storage();
        let pos_a = random_positions(400, 0.0, 5);
        let pos_b = random_positions(400, 0.4, 6);
        let pos_c = random_positions(400, 0.8, 7);
        let engine = MergeEngine::new(&storage, 100, CancellationToken::new());

        let left = engine
            .merge(
                engine
                    .merge(
                        build(&storage, 100, pos_a.clone()),
                        build(&storage, 100, pos_b.clone()),
                    )
                    .unwrap(),
                build(&storage, 100, pos_c.clone()),
            )
            .unwrap();
        let right = engine
            .merge(
                build(&storage, 100, pos_a.clone()),
                engine
                    .merge(
                        build(&storage, 100, pos_b.clone()),
                        build(&storage, 100, pos_c.clone()),
                    )
                    .unwrap(),
            )
            .unwrap();

        assert_same_point_multiset(
            &collect_all_points(&left).unwrap(),
            &collect_all_points(&right).unwrap(),
            1e-5,
        );
    }

    #[test]
    fn merge_across_the_origin_gets_a_centered_root() {
        let storage = storage();
        let a = build(&storage, 10, random_positions(20, 1.0, 8));
        let b = build(&storage, 10, random_positions(20, -2.0, 9));
        let engine = MergeEngine::new(&storage, 10, CancellationToken::new());
        let merged = engine.merge(a, b).unwrap();
        assert!(merged.cell().centered);
        assert_eq!(merged.point_count_tree().unwrap(), 40);
        check_structure(&merged);
    }

    #[test]
    fn merge_straddling_leaves_lifts_without_losing_points() {
        let storage = storage();
        // both chunks straddle the origin, with different extents, so both
        // roots are centered cells of different exponents
        let a = build(
            &storage,
            100,
            vec![Point3::new(-0.5, -0.5, -0.5), Point3::new(0.5, 0.5, 0.5)],
        );
        let b = build(
            &storage,
            100,
            vec![Point3::new(-3.0, -0.5, 0.5), Point3::new(3.0, 0.5, -0.5)],
        );
        assert!(a.cell().centered);
        assert!(b.cell().centered);
        assert_ne!(a.cell(), b.cell());

        let engine = MergeEngine::new(&storage, 100, CancellationToken::new());
        let merged = engine.merge(a, b).unwrap();
        assert_eq!(merged.point_count_tree().unwrap(), 4);
        let collected = collect_all_points(&merged).unwrap();
        assert_eq!(collected.len(), 4);
    }

    #[test]
    fn merge_with_empty_returns_the_other_tree() {
        let storage = storage();
        let a = build(&storage, 10, vec![Point3::new(1.0, 1.0, 1.0)]);
        let empty = build(&storage, 10, vec![]);
        let engine = MergeEngine::new(&storage, 10, CancellationToken::new());
        let merged = engine.merge(Arc::clone(&a), empty).unwrap();
        assert_eq!(merged.id(), a.id());
    }

    #[test]
    fn merge_of_two_empties_is_fatal() {
        let storage = storage();
        let a = build(&storage, 10, vec![]);
        let b = build(&storage, 10, vec![]);
        let engine = MergeEngine::new(&storage, 10, CancellationToken::new());
        assert!(matches!(
            engine.merge(a, b),
            Err(crate::error::Error::Corrupt(_))
        ));
    }

    #[test]
    fn resplit_when_union_exceeds_split_limit() {
        let storage = storage();
        let a = build(&storage, 100, random_positions(80, 0.0, 10));
        let b = build(&storage, 100, random_positions(80, 0.0, 11));
        let engine = MergeEngine::new(&storage, 100, CancellationToken::new());
        let merged = engine.merge(a, b).unwrap();
        assert_eq!(merged.point_count_tree().unwrap(), 160);
        // 160 points with a limit of 100 cannot stay a single leaf
        assert!(!merged.resolve().unwrap().as_points().unwrap().is_leaf());
        check_structure(&merged);
    }
}
