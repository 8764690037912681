use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::index::attribute::{encode_normals, Attribute};
use crate::index::node::{republish_node, Node, PointsNode};
use crate::store::Storage;
use nalgebra::{Point3, Vector3};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Produces per-point unit normals for a batch of absolute positions.
/// Estimators typically fit a plane through the k nearest neighbours of
/// each point; the crate only fixes the seam.
pub trait NormalEstimator: Send + Sync {
    fn estimate(&self, positions: &[Point3<f64>]) -> Vec<Vector3<f32>>;
}

impl<F> NormalEstimator for F
where
    F: Fn(&[Point3<f64>]) -> Vec<Vector3<f32>> + Send + Sync,
{
    fn estimate(&self, positions: &[Point3<f64>]) -> Vec<Vector3<f32>> {
        self(positions)
    }
}

/// Adds normals to every node that stores positions but lacks them,
/// bottom-up, republishing each touched node under its id. Runs before the
/// lod pass in the import pipeline, so lod sampling carries the leaf
/// normals into the inner samples; nodes that already own a lod sample
/// without normals get those estimated here as well.
pub struct NormalGenerator<'a> {
    storage: &'a Storage,
    estimator: Arc<dyn NormalEstimator>,
    cancel: CancellationToken,
}

fn points(node: &Arc<Node>) -> &PointsNode {
    node.as_points().expect("resolved node is regular")
}

impl<'a> NormalGenerator<'a> {
    pub fn new(
        storage: &'a Storage,
        estimator: Arc<dyn NormalEstimator>,
        cancel: CancellationToken,
    ) -> Self {
        NormalGenerator {
            storage,
            estimator,
            cancel,
        }
    }

    pub fn generate(&self, root: Arc<Node>) -> Result<Arc<Node>, Error> {
        let root = root.resolve()?;
        self.generate_rec(root)
    }

    fn generate_rec(&self, node: Arc<Node>) -> Result<Arc<Node>, Error> {
        self.cancel.check()?;
        let node = node.resolve()?;
        let pts = points(&node);

        if let Some(slots) = pts.subnodes() {
            for octant in 0u8..8 {
                if let Some(slot) = &slots[octant as usize] {
                    // children republish under their ids; the parent record
                    // keeps referencing them unchanged
                    self.generate_rec(slot.value()?)?;
                }
            }
        }

        let mut added = BTreeMap::new();
        if let Some(relative) = pts.positions()? {
            if !pts.has_attribute(Attribute::Normals) {
                let normals = self.estimate(pts, &pts.to_absolute(&relative))?;
                let key = uuid::Uuid::new_v4().to_string();
                self.storage.put(&key, &encode_normals(&normals))?;
                added.insert(Attribute::Normals, key);
            }
        }
        if let Some(relative) = pts.lod_positions()? {
            if !pts.has_attribute(Attribute::LodNormals) {
                let normals = self.estimate(pts, &pts.to_absolute(&relative))?;
                let key = uuid::Uuid::new_v4().to_string();
                self.storage.put(&key, &encode_normals(&normals))?;
                added.insert(Attribute::LodNormals, key);
            }
        }

        if added.is_empty() {
            return Ok(node);
        }
        let lod_point_count = pts.lod_point_count();
        Ok(republish_node(self.storage, pts, added, lod_point_count)?)
    }

    fn estimate(
        &self,
        node: &PointsNode,
        positions: &[Point3<f64>],
    ) -> Result<Vec<Vector3<f32>>, Error> {
        let normals = self.estimator.estimate(positions);
        if normals.len() != positions.len() {
            return Err(Error::invalid_input(format!(
                "normal estimator returned {} normals for {} positions at node {}",
                normals.len(),
                positions.len(),
                node.id()
            )));
        }
        Ok(normals)
    }
}
