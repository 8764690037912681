pub mod hull;
pub mod knn;
pub mod level;
pub mod plane;
pub mod polygon;

use crate::error::Error;
use crate::index::node::{Node, PointsNode};
use nalgebra::{Point3, Vector3};
use std::sync::Arc;

/// Classification of a whole node against a query region. A node in
/// `FullyOutside` is pruned without touching its attribute blobs; a node in
/// `FullyInside` yields its points without per-point tests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterState {
    FullyInside,
    Partial,
    FullyOutside,
}

/// A spatial predicate driving the uniform octree traversal.
///
/// `filter_node` classifies against the node's tight bounding box;
/// `filter_point` decides individual points of partially covered nodes.
/// Implementations must be conservative: a node may only be classified
/// `FullyOutside` if none of its points can match, and `FullyInside` only
/// if all of them do.
pub trait Query: Send + Sync {
    fn filter_node(&self, node: &PointsNode) -> FilterState;
    fn filter_point(&self, position: &Point3<f64>) -> bool;
}

impl<Q: Query + ?Sized> Query for &Q {
    fn filter_node(&self, node: &PointsNode) -> FilterState {
        (**self).filter_node(node)
    }
    fn filter_point(&self, position: &Point3<f64>) -> bool {
        (**self).filter_point(position)
    }
}

/// Matches every point; turns the executor into a plain enumeration.
pub struct All;

impl Query for All {
    fn filter_node(&self, _node: &PointsNode) -> FilterState {
        FilterState::FullyInside
    }
    fn filter_point(&self, _position: &Point3<f64>) -> bool {
        true
    }
}

/// The complement of a query region.
pub struct Not<Q>(pub Q);

impl<Q: Query> Query for Not<Q> {
    fn filter_node(&self, node: &PointsNode) -> FilterState {
        match self.0.filter_node(node) {
            FilterState::FullyInside => FilterState::FullyOutside,
            FilterState::FullyOutside => FilterState::FullyInside,
            FilterState::Partial => FilterState::Partial,
        }
    }
    fn filter_point(&self, position: &Point3<f64>) -> bool {
        !self.0.filter_point(position)
    }
}

/// One batch of query results: absolute positions with whatever optional
/// attribute columns the producing node carries. Absent attributes stay
/// `None` rather than failing the query.
#[derive(Clone, Debug, Default)]
pub struct ResultChunk {
    pub positions: Vec<Point3<f64>>,
    pub colors: Option<Vec<[u8; 4]>>,
    pub normals: Option<Vec<Vector3<f32>>>,
    pub intensities: Option<Vec<i32>>,
    pub classifications: Option<Vec<u8>>,
}

impl ResultChunk {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn keep(&self, keep: &[bool]) -> ResultChunk {
        fn filter<T: Copy>(values: &Option<Vec<T>>, keep: &[bool]) -> Option<Vec<T>> {
            values.as_ref().map(|values| {
                values
                    .iter()
                    .zip(keep)
                    .filter(|(_, &k)| k)
                    .map(|(v, _)| *v)
                    .collect()
            })
        }
        ResultChunk {
            positions: self
                .positions
                .iter()
                .zip(keep)
                .filter(|(_, &k)| k)
                .map(|(p, _)| *p)
                .collect(),
            colors: filter(&self.colors, keep),
            normals: filter(&self.normals, keep),
            intensities: filter(&self.intensities, keep),
            classifications: filter(&self.classifications, keep),
        }
    }
}

/// Reads the yieldable samples of a node: its own points when it stores
/// any, its lod sample otherwise (inner nodes reached at the traversal
/// floor). Returns `None` for nodes carrying neither.
pub(crate) fn node_samples(node: &PointsNode) -> Result<Option<ResultChunk>, Error> {
    if node.has_attribute(crate::index::attribute::Attribute::Positions) {
        let relative = node.positions()?.expect("attribute is present");
        Ok(Some(ResultChunk {
            positions: node.to_absolute(&relative),
            colors: node.colors()?.map(|a| a.as_ref().clone()),
            normals: node.normals()?.map(|a| a.as_ref().clone()),
            intensities: node.intensities()?.map(|a| a.as_ref().clone()),
            classifications: node.classifications()?.map(|a| a.as_ref().clone()),
        }))
    } else if node.has_attribute(crate::index::attribute::Attribute::LodPositions) {
        let relative = node.lod_positions()?.expect("attribute is present");
        Ok(Some(ResultChunk {
            positions: node.to_absolute(&relative),
            colors: node.lod_colors()?.map(|a| a.as_ref().clone()),
            normals: node.lod_normals()?.map(|a| a.as_ref().clone()),
            intensities: node.lod_intensities()?.map(|a| a.as_ref().clone()),
            classifications: node.lod_classifications()?.map(|a| a.as_ref().clone()),
        }))
    } else {
        Ok(None)
    }
}

/// Traversal options. `min_exponent` is the cell-exponent floor: the
/// traversal does not descend into cells smaller than `2^min_exponent` and
/// yields the lod sample of the inner node reached there instead.
#[derive(Copy, Clone, Debug, Default)]
pub struct QueryOptions {
    pub min_exponent: Option<i32>,
}

/// Starts a lazy query over the tree. Results are pulled on demand; each
/// pull may block on loading node records or attribute blobs.
pub fn execute<Q: Query>(root: Arc<Node>, query: Q, options: QueryOptions) -> QueryStream<Q> {
    QueryStream {
        query,
        stack: vec![root],
        min_exponent: options.min_exponent.unwrap_or(i32::MIN),
    }
}

/// The executor: a work-stack state machine over pending nodes, so a
/// caller can stop mid-stream without paying for the rest of the tree.
pub struct QueryStream<Q> {
    query: Q,
    stack: Vec<Arc<Node>>,
    min_exponent: i32,
}

impl<Q: Query> QueryStream<Q> {
    fn visit(&mut self, node: Arc<Node>) -> Result<Option<ResultChunk>, Error> {
        let node = node.resolve()?;
        let points = node.as_points().expect("resolved node");
        if points.point_count_tree() == 0 {
            return Ok(None);
        }
        let state = self.query.filter_node(points);
        if state == FilterState::FullyOutside {
            return Ok(None);
        }

        let at_floor = points.cell().e <= self.min_exponent;
        if points.is_leaf() || at_floor {
            let Some(chunk) = node_samples(points)? else {
                return Ok(None);
            };
            let chunk = match state {
                FilterState::FullyInside => chunk,
                _ => {
                    let keep: Vec<bool> = chunk
                        .positions
                        .iter()
                        .map(|p| self.query.filter_point(p))
                        .collect();
                    chunk.keep(&keep)
                }
            };
            if chunk.is_empty() {
                return Ok(None);
            }
            return Ok(Some(chunk));
        }

        if let Some(slots) = points.subnodes() {
            // reversed so octant 0 is popped first
            for slot in slots.iter().rev().flatten() {
                self.stack.push(slot.value()?);
            }
        }
        Ok(None)
    }
}

impl<Q: Query> Iterator for QueryStream<Q> {
    type Item = Result<ResultChunk, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            match self.visit(node) {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => continue,
                Err(e) => {
                    self.stack.clear();
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Convenience: runs the query to completion and returns the matching
/// positions.
pub fn collect_positions<Q: Query>(
    root: Arc<Node>,
    query: Q,
    options: QueryOptions,
) -> Result<Vec<Point3<f64>>, Error> {
    let mut out = Vec::new();
    for chunk in execute(root, query, options) {
        out.extend(chunk?.positions);
    }
    Ok(out)
}
