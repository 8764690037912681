use crate::cancel::CancellationToken;
use crate::chunk::Chunk;
use crate::error::Error;
use crate::geometry::bounding_box::OptionAabb;
use crate::geometry::cell::Cell;
use crate::index::attribute::{
    encode_classifications, encode_colors, encode_intensities, encode_normals, encode_positions,
    Attribute,
};
use crate::index::node::{publish_node, Node, NodeParams, PointsNode};
use crate::kdtree::KdTree;
use crate::store::{Storage, StoreError};
use nalgebra::{Point3, Vector3};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Once a cell's exponent has sunk this far below the root exponent, the
/// octant recursion stops splitting. Cells this small are at the limit of
/// the coordinate precision, so points that still share one are treated as
/// coincident and kept in a single oversized leaf.
const SPLIT_EXPONENT_RANGE: i32 = 52;

/// Absolute point samples with their parallel attribute arrays; the common
/// working form of builder, merge and lod generation.
#[derive(Clone, Debug, Default)]
pub(crate) struct PointData {
    pub positions: Vec<Point3<f64>>,
    pub colors: Option<Vec<[u8; 4]>>,
    pub normals: Option<Vec<Vector3<f32>>>,
    pub intensities: Option<Vec<i32>>,
    pub classifications: Option<Vec<u8>>,
}

impl PointData {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        PointData {
            positions: chunk.positions().to_vec(),
            colors: chunk.colors().map(<[_]>::to_vec),
            normals: chunk.normals().map(<[_]>::to_vec),
            intensities: chunk.intensities().map(<[_]>::to_vec),
            classifications: chunk.classifications().map(<[_]>::to_vec),
        }
    }

    /// Decodes a leaf's stored arrays back into absolute samples.
    pub fn from_leaf(node: &PointsNode) -> Result<Self, StoreError> {
        let relative = node.positions()?.ok_or_else(|| StoreError::Missing {
            key: format!("{}.Positions", node.id()),
        })?;
        Ok(PointData {
            positions: node.to_absolute(&relative),
            colors: node.colors()?.map(|a| a.as_ref().clone()),
            normals: node.normals()?.map(|a| a.as_ref().clone()),
            intensities: node.intensities()?.map(|a| a.as_ref().clone()),
            classifications: node.classifications()?.map(|a| a.as_ref().clone()),
        })
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn take(&self, indices: &[u32]) -> PointData {
        fn gather<T: Copy>(source: &Option<Vec<T>>, indices: &[u32]) -> Option<Vec<T>> {
            source
                .as_ref()
                .map(|values| indices.iter().map(|&i| values[i as usize]).collect())
        }
        PointData {
            positions: indices
                .iter()
                .map(|&i| self.positions[i as usize])
                .collect(),
            colors: gather(&self.colors, indices),
            normals: gather(&self.normals, indices),
            intensities: gather(&self.intensities, indices),
            classifications: gather(&self.classifications, indices),
        }
    }

    /// Concatenates two sample sets. An optional attribute survives only
    /// when both sides carry it, so the parallel arrays stay aligned.
    pub fn concat(mut a: PointData, mut b: PointData) -> PointData {
        fn join<T>(a: &mut Option<Vec<T>>, b: &mut Option<Vec<T>>) -> Option<Vec<T>> {
            match (a.take(), b.take()) {
                (Some(mut left), Some(mut right)) => {
                    left.append(&mut right);
                    Some(left)
                }
                _ => None,
            }
        }
        let colors = join(&mut a.colors, &mut b.colors);
        let normals = join(&mut a.normals, &mut b.normals);
        let intensities = join(&mut a.intensities, &mut b.intensities);
        let classifications = join(&mut a.classifications, &mut b.classifications);
        let mut positions = a.positions;
        positions.append(&mut b.positions);
        PointData {
            positions,
            colors,
            normals,
            intensities,
            classifications,
        }
    }

    pub fn bounds(&self) -> OptionAabb<f64> {
        OptionAabb::from_points(self.positions.iter())
    }

    fn check_aligned(&self) -> Result<(), Error> {
        let n = self.positions.len();
        let ok = self.colors.as_ref().map_or(true, |a| a.len() == n)
            && self.normals.as_ref().map_or(true, |a| a.len() == n)
            && self.intensities.as_ref().map_or(true, |a| a.len() == n)
            && self.classifications.as_ref().map_or(true, |a| a.len() == n);
        if ok {
            Ok(())
        } else {
            Err(Error::corrupt("attribute array length != position length"))
        }
    }
}

/// Builds a fresh octree from one batch of samples by recursive octant
/// partition. Nodes are written post-order: every child record is in the
/// store before its parent record.
pub struct OctreeBuilder<'a> {
    storage: &'a Storage,
    split_limit: usize,
    cancel: CancellationToken,
}

impl<'a> OctreeBuilder<'a> {
    pub fn new(storage: &'a Storage, split_limit: usize, cancel: CancellationToken) -> Self {
        OctreeBuilder {
            storage,
            split_limit,
            cancel,
        }
    }

    pub fn split_limit(&self) -> usize {
        self.split_limit
    }

    /// Builds the octree of one chunk and returns its root.
    pub fn build_chunk(&self, chunk: &Chunk) -> Result<Arc<Node>, Error> {
        chunk.validate()?;
        let Some(bounds) = chunk.bounds() else {
            return self.empty_node();
        };
        let root_cell = Cell::containing(&bounds);
        self.build_on_cell(PointData::from_chunk(chunk), root_cell)
    }

    /// Builds an octree over the given samples, rooted at the given cell.
    /// All positions must lie within the cell.
    pub fn build_on_cell(&self, data: PointData, cell: Cell) -> Result<Arc<Node>, Error> {
        if data.is_empty() {
            return self.empty_node();
        }
        data.check_aligned()?;
        let floor = cell.e - SPLIT_EXPONENT_RANGE;
        let indices: Vec<u32> = (0..data.len() as u32).collect();
        self.build_rec(&data, indices, cell, floor)
    }

    /// The sentinel node of an empty input: no points, no attributes.
    pub fn empty_node(&self) -> Result<Arc<Node>, Error> {
        Ok(publish_node(
            self.storage,
            NodeParams {
                cell: Cell::new(0, 0, 0, 0),
                bounding_box: OptionAabb::empty(),
                point_count_tree: 0,
                point_count_node: 0,
                subnodes: None,
                attributes: BTreeMap::new(),
            },
        )?)
    }

    fn build_rec(
        &self,
        data: &PointData,
        indices: Vec<u32>,
        cell: Cell,
        floor: i32,
    ) -> Result<Arc<Node>, Error> {
        self.cancel.check()?;
        if indices.len() <= self.split_limit || cell.e <= floor {
            return self.make_leaf(data.take(&indices), cell);
        }

        let mut buckets: [Vec<u32>; 8] = Default::default();
        for &i in &indices {
            let octant = cell.octant_of(&data.positions[i as usize]);
            buckets[octant as usize].push(i);
        }
        drop(indices);

        let mut subnodes: [Option<Arc<Node>>; 8] = Default::default();
        let mut point_count_tree = 0u64;
        let mut bounding_box = OptionAabb::empty();
        for (octant, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let child = self.build_rec(data, bucket, cell.child(octant as u8), floor)?;
            let points = child.as_points().expect("freshly built nodes are regular");
            point_count_tree += points.point_count_tree();
            if let Some(child_bounds) = points.bounding_box() {
                bounding_box.extend_union(&child_bounds.into());
            }
            subnodes[octant] = Some(child);
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

    /// Writes a leaf: attribute blobs first, then the node record.
    pub(crate) fn make_leaf(&self, data: PointData, cell: Cell) -> Result<Arc<Node>, Error> {
        data.check_aligned()?;
        let center = cell.center();
        let relative: Vec<Point3<f32>> = data
            .positions
            .iter()
            .map(|p| {
                Point3::new(
                    (p.x - center.x) as f32,
                    (p.y - center.y) as f32,
                    (p.z - center.z) as f32,
                )
            })
            .collect();
        let kd_tree = KdTree::build(&relative);

        let mut attributes = BTreeMap::new();
        let mut write = |attribute: Attribute, bytes: Vec<u8>| -> Result<(), StoreError> {
            let key = uuid::Uuid::new_v4().to_string();
            self.storage.put(&key, &bytes)?;
            attributes.insert(attribute, key);
            Ok(())
        };
        write(Attribute::Positions, encode_positions(&relative))?;
        write(Attribute::KdTree, kd_tree.encode())?;
        if let Some(colors) = &data.colors {
            write(Attribute::Colors, encode_colors(colors))?;
        }
        if let Some(normals) = &data.normals {
            write(Attribute::Normals, encode_normals(normals))?;
        }
        if let Some(intensities) = &data.intensities {
            write(Attribute::Intensities, encode_intensities(intensities))?;
        }
        if let Some(classifications) = &data.classifications {
            write(
                Attribute::Classifications,
                encode_classifications(classifications),
            )?;
        }

        Ok(publish_node(
            self.storage,
            NodeParams {
                cell,
                bounding_box: data.bounds(),
                point_count_tree: data.len() as u64,
                point_count_node: data.len() as u32,
                subnodes: None,
                attributes,
            },
        )?)
    }
}
