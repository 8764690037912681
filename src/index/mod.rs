pub mod attribute;
pub mod builder;
pub mod import;
pub mod lod;
pub mod merge;
pub mod node;
pub mod normals;
pub mod sampling;

use crate::error::Error;
use crate::index::node::{Node, NodeLoader};
use crate::store::reference::PersistentRef;
use crate::store::Storage;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The named handle of a persisted octree: consumers look a tree up by a
/// symbolic key instead of a raw node id. Re-publishing a handle under the
/// same key follows last-writer-wins; the trees referenced by earlier
/// versions stay intact in the store.
pub struct PointSet {
    id: String,
    split_limit: usize,
    root: PersistentRef<Node>,
}

#[derive(Serialize, Deserialize)]
struct PointSetRecord {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "RootNodeId")]
    root_node_id: String,
    #[serde(rename = "SplitLimit")]
    split_limit: u32,
}

impl PointSet {
    /// Persists a handle for `root` under the caller-chosen key.
    pub fn create(
        storage: &Storage,
        key: &str,
        root: &Arc<Node>,
        split_limit: usize,
    ) -> Result<PointSet, Error> {
        let record = PointSetRecord {
            id: uuid::Uuid::new_v4().to_string(),
            root_node_id: root.id().to_string(),
            split_limit: split_limit as u32,
        };
        let bytes = serde_json::to_vec(&record).expect("handle records serialize");
        storage.put_superseding(key, &bytes)?;
        let loader = Arc::new(NodeLoader::new(storage.clone()));
        Ok(PointSet {
            id: record.id,
            split_limit,
            root: PersistentRef::with_value(record.root_node_id, loader, root),
        })
    }

    /// Looks up a handle. A missing key is reported as `Ok(None)`, not as
    /// an error.
    pub fn open(storage: &Storage, key: &str) -> Result<Option<PointSet>, Error> {
        let Some(bytes) = storage.get(key)? else {
            return Ok(None);
        };
        let record: PointSetRecord = serde_json::from_slice(&bytes)
            .map_err(|e| Error::corrupt(format!("point set handle {key}: {e}")))?;
        let loader = Arc::new(NodeLoader::new(storage.clone()));
        Ok(Some(PointSet {
            id: record.id,
            split_limit: record.split_limit as usize,
            root: PersistentRef::new(record.root_node_id, loader),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn split_limit(&self) -> usize {
        self.split_limit
    }

    pub fn root_node_id(&self) -> &str {
        self.root.key()
    }

    pub fn root(&self) -> Result<Arc<Node>, Error> {
        Ok(self.root.value()?)
    }

    pub fn point_count(&self) -> Result<u64, Error> {
        Ok(self.root()?.point_count_tree()?)
    }

    /// Every point of the tree, materialized. Intended for small sets and
    /// tests; large sets should stream through the query engine instead.
    pub fn enumerate_points(&self) -> Result<Vec<Point3<f64>>, Error> {
        collect_all_points(&self.root()?)
    }
}

/// Collects the absolute positions of all points stored in the tree's
/// leaves, following link nodes. Lod samples are replicas of leaf data and
/// are not part of the enumeration.
pub fn collect_all_points(root: &Arc<Node>) -> Result<Vec<Point3<f64>>, Error> {
    let mut out = Vec::new();
    collect_rec(root, &mut out)?;
    Ok(out)
}

fn collect_rec(node: &Arc<Node>, out: &mut Vec<Point3<f64>>) -> Result<(), Error> {
    let node = node.resolve()?;
    let points = node.as_points().expect("resolved node");
    if let Some(relative) = points.positions()? {
        out.extend(points.to_absolute(&relative));
    }
    if let Some(slots) = points.subnodes() {
        for slot in slots.iter().flatten() {
            collect_rec(&slot.value()?, out)?;
        }
    }
    Ok(())
}
