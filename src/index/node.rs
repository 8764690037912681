use crate::geometry::bounding_box::{Aabb, OptionAabb};
use crate::geometry::cell::Cell;
use crate::index::attribute::{
    decode_classifications, decode_colors, decode_intensities, decode_normals, decode_positions,
    Attribute,
};
use crate::kdtree::KdTree;
use crate::store::reference::{Loader, PersistentRef};
use crate::store::{Storage, StoreError};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type NodeId = String;

/// An octree node. The regular kind carries cell, bounds, counts, attribute
/// blobs and up to eight children; the link kind is a forwarding pointer
/// created when a tree root is lifted into an enclosing cell during merge,
/// and is transparent to traversal.
#[derive(Debug)]
pub enum Node {
    Points(PointsNode),
    Link(LinkNode),
}

/// Immutable record of a regular octree node.
///
/// Once published the record never changes, with one exception: the lod and
/// normal passes may republish the same id with a superset of attributes.
/// Attribute blob contents themselves are immutable.
#[derive(Debug)]
pub struct PointsNode {
    id: NodeId,
    cell: Cell,
    bounding_box: OptionAabb<f64>,
    point_count_tree: u64,
    point_count_node: u32,
    lod_point_count: u32,
    subnodes: Option<Box<[Option<PersistentRef<Node>>; 8]>>,
    attributes: BTreeMap<Attribute, String>,
    storage: Storage,
}

#[derive(Debug)]
pub struct LinkNode {
    id: NodeId,
    cell: Cell,
    target: PersistentRef<Node>,
}

/// Fields of a node about to be published. Subnodes are handed over as
/// strong references so freshly built children seed the lazy references.
pub struct NodeParams {
    pub cell: Cell,
    pub bounding_box: OptionAabb<f64>,
    pub point_count_tree: u64,
    pub point_count_node: u32,
    pub subnodes: Option<[Option<Arc<Node>>; 8]>,
    pub attributes: BTreeMap<Attribute, String>,
}

// ---------------------------------------------------------------------------
// wire form
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(tag = "NodeType")]
enum NodeRecord {
    PointCloudNode {
        #[serde(rename = "Id")]
        id: String,
        #[serde(rename = "Cell")]
        cell: Cell,
        #[serde(rename = "BoundingBoxExact")]
        bounding_box: OptionAabb<f64>,
        #[serde(rename = "PointCountTree")]
        point_count_tree: u64,
        #[serde(rename = "PointCountNode")]
        point_count_node: u32,
        #[serde(rename = "LodPointCount", default, skip_serializing_if = "Option::is_none")]
        lod_point_count: Option<u32>,
        #[serde(rename = "Subnodes")]
        subnodes: Option<[Option<String>; 8]>,
        #[serde(rename = "Attributes")]
        attributes: BTreeMap<Attribute, String>,
    },
    LinkedNode {
        #[serde(rename = "Id")]
        id: String,
        #[serde(rename = "Cell")]
        cell: Cell,
        #[serde(rename = "TargetId")]
        target: String,
    },
}

/// Loads [Node]s by id; the loader behind every parent → child reference.
pub struct NodeLoader {
    storage: Storage,
}

impl NodeLoader {
    pub fn new(storage: Storage) -> Self {
        NodeLoader { storage }
    }
}

impl Loader<Node> for NodeLoader {
    fn load(&self, key: &str) -> Result<Arc<Node>, StoreError> {
        Node::load(&self.storage, key)
    }
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Points(n) => &n.id,
            Node::Link(n) => &n.id,
        }
    }

    pub fn cell(&self) -> Cell {
        match self {
            Node::Points(n) => n.cell,
            Node::Link(n) => n.cell,
        }
    }

    pub fn as_points(&self) -> Option<&PointsNode> {
        match self {
            Node::Points(n) => Some(n),
            Node::Link(_) => None,
        }
    }

    /// Follows link nodes until a regular node is reached.
    pub fn resolve(self: &Arc<Node>) -> Result<Arc<Node>, StoreError> {
        let mut current = Arc::clone(self);
        for _ in 0..64 {
            match &*current {
                Node::Points(_) => return Ok(current),
                Node::Link(link) => current = link.target.value()?,
            }
        }
        Err(StoreError::codec(self.id(), "linked node chain does not terminate"))
    }

    /// Total number of points in the subtree. Follows links.
    pub fn point_count_tree(self: &Arc<Node>) -> Result<u64, StoreError> {
        Ok(self
            .resolve()?
            .as_points()
            .expect("resolved to a regular node")
            .point_count_tree)
    }

    /// Reads a node record from the store, through the weak cache.
    pub fn load(storage: &Storage, key: &str) -> Result<Arc<Node>, StoreError> {
        if let Some(node) = storage.cache_get::<Node>(key) {
            return Ok(node);
        }
        let bytes = storage.get_required(key)?;
        let record: NodeRecord = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::codec(key, e.to_string()))?;
        let node = Arc::new(Node::from_record(storage, record));
        storage.cache_put(key, &node);
        Ok(node)
    }

    fn from_record(storage: &Storage, record: NodeRecord) -> Node {
        let loader: Arc<dyn Loader<Node>> = Arc::new(NodeLoader::new(storage.clone()));
        match record {
            NodeRecord::PointCloudNode {
                id,
                cell,
                bounding_box,
                point_count_tree,
                point_count_node,
                lod_point_count,
                subnodes,
                attributes,
            } => {
                let subnodes = subnodes.map(|ids| {
                    Box::new(ids.map(|slot| {
                        slot.map(|child_id| PersistentRef::new(child_id, Arc::clone(&loader)))
                    }))
                });
                Node::Points(PointsNode {
                    id,
                    cell,
                    bounding_box,
                    point_count_tree,
                    point_count_node,
                    lod_point_count: lod_point_count.unwrap_or(0),
                    subnodes,
                    attributes,
                    storage: storage.clone(),
                })
            }
            NodeRecord::LinkedNode { id, cell, target } => Node::Link(LinkNode {
                id,
                cell,
                target: PersistentRef::new(target, loader),
            }),
        }
    }
}

impl PointsNode {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cell(&self) -> Cell {
        self.cell
    }

    /// Tight bounding box of the contained points; `None` for the empty node.
    pub fn bounding_box(&self) -> Option<Aabb<f64>> {
        self.bounding_box.into_aabb()
    }

    pub fn point_count_tree(&self) -> u64 {
        self.point_count_tree
    }

    pub fn point_count_node(&self) -> u32 {
        self.point_count_node
    }

    pub fn lod_point_count(&self) -> u32 {
        self.lod_point_count
    }

    pub fn is_leaf(&self) -> bool {
        self.subnodes.is_none()
    }

    pub fn subnodes(&self) -> Option<&[Option<PersistentRef<Node>>; 8]> {
        self.subnodes.as_deref()
    }

    pub fn subnode(&self, octant: u8) -> Option<&PersistentRef<Node>> {
        self.subnodes
            .as_deref()
            .and_then(|slots| slots[octant as usize].as_ref())
    }

    pub fn attributes(&self) -> &BTreeMap<Attribute, String> {
        &self.attributes
    }

    pub fn has_attribute(&self, attribute: Attribute) -> bool {
        self.attributes.contains_key(&attribute)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn array<T, D>(&self, attribute: Attribute, decode: D) -> Result<Option<Arc<T>>, StoreError>
    where
        T: Send + Sync + 'static,
        D: FnOnce(&[u8]) -> Result<T, String>,
    {
        let Some(key) = self.attributes.get(&attribute) else {
            return Ok(None);
        };
        match self.storage.get_typed(key, decode)? {
            Some(value) => Ok(Some(value)),
            // the node references the blob, so absence is an integrity error
            None => Err(StoreError::Missing { key: key.clone() }),
        }
    }

    /// Cell-relative positions of the points stored directly at this node.
    pub fn positions(&self) -> Result<Option<Arc<Vec<Point3<f32>>>>, StoreError> {
        self.array(Attribute::Positions, decode_positions)
    }

    pub fn colors(&self) -> Result<Option<Arc<Vec<[u8; 4]>>>, StoreError> {
        self.array(Attribute::Colors, decode_colors)
    }

    pub fn normals(&self) -> Result<Option<Arc<Vec<Vector3<f32>>>>, StoreError> {
        self.array(Attribute::Normals, decode_normals)
    }

    pub fn intensities(&self) -> Result<Option<Arc<Vec<i32>>>, StoreError> {
        self.array(Attribute::Intensities, decode_intensities)
    }

    pub fn classifications(&self) -> Result<Option<Arc<Vec<u8>>>, StoreError> {
        self.array(Attribute::Classifications, decode_classifications)
    }

    pub fn kd_tree(&self) -> Result<Option<Arc<KdTree>>, StoreError> {
        self.array(Attribute::KdTree, KdTree::decode)
    }

    pub fn lod_positions(&self) -> Result<Option<Arc<Vec<Point3<f32>>>>, StoreError> {
        self.array(Attribute::LodPositions, decode_positions)
    }

    pub fn lod_colors(&self) -> Result<Option<Arc<Vec<[u8; 4]>>>, StoreError> {
        self.array(Attribute::LodColors, decode_colors)
    }

    pub fn lod_normals(&self) -> Result<Option<Arc<Vec<Vector3<f32>>>>, StoreError> {
        self.array(Attribute::LodNormals, decode_normals)
    }

    pub fn lod_intensities(&self) -> Result<Option<Arc<Vec<i32>>>, StoreError> {
        self.array(Attribute::LodIntensities, decode_intensities)
    }

    pub fn lod_classifications(&self) -> Result<Option<Arc<Vec<u8>>>, StoreError> {
        self.array(Attribute::LodClassifications, decode_classifications)
    }

    pub fn lod_kd_tree(&self) -> Result<Option<Arc<KdTree>>, StoreError> {
        self.array(Attribute::LodKdTree, KdTree::decode)
    }

    /// Converts cell-relative positions back to absolute coordinates.
    pub fn to_absolute(&self, relative: &[Point3<f32>]) -> Vec<Point3<f64>> {
        let center = self.cell.center();
        relative
            .iter()
            .map(|p| {
                Point3::new(
                    center.x + p.x as f64,
                    center.y + p.y as f64,
                    center.z + p.z as f64,
                )
            })
            .collect()
    }

    fn to_record(&self) -> NodeRecord {
        NodeRecord::PointCloudNode {
            id: self.id.clone(),
            cell: self.cell,
            bounding_box: self.bounding_box,
            point_count_tree: self.point_count_tree,
            point_count_node: self.point_count_node,
            lod_point_count: if self.lod_point_count > 0 {
                Some(self.lod_point_count)
            } else {
                None
            },
            subnodes: self.subnodes.as_deref().map(|slots| {
                std::array::from_fn(|i| slots[i].as_ref().map(|r| r.key().to_string()))
            }),
            attributes: self.attributes.clone(),
        }
    }
}

fn encode_record(record: &NodeRecord) -> Vec<u8> {
    serde_json::to_vec(record).expect("node records serialize")
}

/// Writes a fresh node under a new id. Children, if any, must already be
/// published: the parent record is always written after its subtree.
pub fn publish_node(storage: &Storage, params: NodeParams) -> Result<Arc<Node>, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let loader: Arc<dyn Loader<Node>> = Arc::new(NodeLoader::new(storage.clone()));
    let subnodes = params.subnodes.map(|slots| {
        Box::new(slots.map(|slot| {
            slot.map(|child| {
                PersistentRef::with_value(child.id().to_string(), Arc::clone(&loader), &child)
            })
        }))
    });
    let node = PointsNode {
        id: id.clone(),
        cell: params.cell,
        bounding_box: params.bounding_box,
        point_count_tree: params.point_count_tree,
        point_count_node: params.point_count_node,
        lod_point_count: 0,
        subnodes,
        attributes: params.attributes,
        storage: storage.clone(),
    };
    storage.put(&id, &encode_record(&node.to_record()))?;
    let node = Arc::new(Node::Points(node));
    storage.cache_put(&id, &node);
    Ok(node)
}

/// Writes a link node forwarding to `target`, viewed at `cell`.
pub fn publish_link(storage: &Storage, cell: Cell, target: &Arc<Node>) -> Result<Arc<Node>, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let loader: Arc<dyn Loader<Node>> = Arc::new(NodeLoader::new(storage.clone()));
    let record = NodeRecord::LinkedNode {
        id: id.clone(),
        cell,
        target: target.id().to_string(),
    };
    storage.put(&id, &encode_record(&record))?;
    let node = Arc::new(Node::Link(LinkNode {
        id: id.clone(),
        cell,
        target: PersistentRef::with_value(target.id().to_string(), loader, target),
    }));
    storage.cache_put(&id, &node);
    Ok(node)
}

/// Republishes a node under its existing id with additional attributes,
/// the only admitted mutation. `added` must not collide with contents of
/// existing attributes.
pub fn republish_node(
    storage: &Storage,
    node: &PointsNode,
    added: BTreeMap<Attribute, String>,
    lod_point_count: u32,
) -> Result<Arc<Node>, StoreError> {
    let mut attributes = node.attributes.clone();
    attributes.extend(added);
    let updated = PointsNode {
        id: node.id.clone(),
        cell: node.cell,
        bounding_box: node.bounding_box,
        point_count_tree: node.point_count_tree,
        point_count_node: node.point_count_node,
        lod_point_count: lod_point_count.max(node.lod_point_count),
        subnodes: node.subnodes.clone(),
        attributes,
        storage: storage.clone(),
    };
    storage.put_superseding(&node.id, &encode_record(&updated.to_record()))?;
    let updated = Arc::new(Node::Points(updated));
    storage.cache_put(&node.id, &updated);
    Ok(updated)
}
