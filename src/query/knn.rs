use crate::error::Error;
use crate::geometry::bounding_box::Aabb;
use crate::index::node::{Node, PointsNode};
use crate::kdtree::KdTree;
use nalgebra::{Point3, Vector3};
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Upper bound on hits taken from a single leaf's kd-tree in line and ray
/// queries.
const NEAR_LINE_LEAF_CAP: usize = 1000;

/// A single query hit with its attributes; absent attribute arrays yield
/// `None` fields.
#[derive(Clone, Debug, PartialEq)]
pub struct PointSample {
    pub position: Point3<f64>,
    pub distance: f64,
    pub color: Option<[u8; 4]>,
    pub normal: Option<Vector3<f32>>,
    pub intensity: Option<i32>,
    pub classification: Option<u8>,
}

struct HeapSample(PointSample);

impl PartialEq for HeapSample {
    fn eq(&self, other: &Self) -> bool {
        self.0.distance == other.0.distance
    }
}
impl Eq for HeapSample {}
impl Ord for HeapSample {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.distance.total_cmp(&other.0.distance)
    }
}
impl PartialOrd for HeapSample {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn points(node: &Arc<Node>) -> &PointsNode {
    node.as_points().expect("resolved node is regular")
}

/// The leaf's kd-tree, rebuilt from the positions if the stored blob was
/// lost. The tree is regenerable by design.
fn leaf_kd_tree(node: &PointsNode, positions: &[Point3<f32>]) -> Result<Arc<KdTree>, Error> {
    match node.kd_tree()? {
        Some(tree) => Ok(tree),
        None => Ok(Arc::new(KdTree::build(positions))),
    }
}

struct LeafColumns {
    colors: Option<Arc<Vec<[u8; 4]>>>,
    normals: Option<Arc<Vec<Vector3<f32>>>>,
    intensities: Option<Arc<Vec<i32>>>,
    classifications: Option<Arc<Vec<u8>>>,
}

impl LeafColumns {
    fn load(node: &PointsNode) -> Result<Self, Error> {
        Ok(LeafColumns {
            colors: node.colors()?,
            normals: node.normals()?,
            intensities: node.intensities()?,
            classifications: node.classifications()?,
        })
    }

    fn sample(&self, index: usize, position: Point3<f64>, distance: f64) -> PointSample {
        PointSample {
            position,
            distance,
            color: self.colors.as_ref().map(|a| a[index]),
            normal: self.normals.as_ref().map(|a| a[index]),
            intensity: self.intensities.as_ref().map(|a| a[index]),
            classification: self.classifications.as_ref().map(|a| a[index]),
        }
    }
}

/// The up to `k` nearest points to `query` within `radius`, with their
/// attributes, sorted by distance.
///
/// Descends into the child nearest to the query first and shrinks the
/// search radius as candidates accumulate; subtrees whose bounding box is
/// farther than the current radius are pruned without attribute access.
pub fn k_nearest(
    root: &Arc<Node>,
    query: &Point3<f64>,
    radius: f64,
    k: usize,
) -> Result<Vec<PointSample>, Error> {
    if k == 0 || radius < 0.0 {
        return Ok(vec![]);
    }
    let mut best: BinaryHeap<HeapSample> = BinaryHeap::with_capacity(k + 1);
    k_nearest_rec(root, query, radius, k, &mut best)?;
    let mut hits: Vec<PointSample> = best.into_iter().map(|h| h.0).collect();
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    Ok(hits)
}

fn effective_radius(radius: f64, best: &BinaryHeap<HeapSample>, k: usize) -> f64 {
    if best.len() == k {
        best.peek()
            .map(|worst| worst.0.distance.min(radius))
            .unwrap_or(radius)
    } else {
        radius
    }
}

fn k_nearest_rec(
    node: &Arc<Node>,
    query: &Point3<f64>,
    radius: f64,
    k: usize,
    best: &mut BinaryHeap<HeapSample>,
) -> Result<(), Error> {
    let node = node.resolve()?;
    let pts = points(&node);
    if pts.point_count_tree() == 0 {
        return Ok(());
    }
    let Some(bounds) = pts.bounding_box() else {
        return Ok(());
    };
    let r = effective_radius(radius, best, k);
    if bounds.distance_sq(query) > r * r {
        return Ok(());
    }

    if pts.is_leaf() {
        let Some(relative) = pts.positions()? else {
            return Ok(());
        };
        let kd = leaf_kd_tree(pts, &relative)?;
        let center = pts.cell().center();
        let query_rel = Point3::new(
            (query.x - center.x) as f32,
            (query.y - center.y) as f32,
            (query.z - center.z) as f32,
        );
        // slight inflation compensates the narrowing to f32
        let r32 = (r * (1.0 + 1e-6)) as f32;
        let hits = kd.k_nearest(&relative, &query_rel, r32, k);
        if hits.is_empty() {
            return Ok(());
        }
        let columns = LeafColumns::load(pts)?;
        for (index, _) in hits {
            let p = relative[index as usize];
            let position = Point3::new(
                center.x + p.x as f64,
                center.y + p.y as f64,
                center.z + p.z as f64,
            );
            let distance = (position - query).norm();
            if distance > radius {
                continue;
            }
            best.push(HeapSample(columns.sample(index as usize, position, distance)));
            if best.len() > k {
                best.pop();
            }
        }
        return Ok(());
    }

    // nearest child first, so the radius shrinks early
    let mut children: Vec<(f64, Arc<Node>)> = Vec::new();
    if let Some(slots) = pts.subnodes() {
        for slot in slots.iter().flatten() {
            let child = slot.value()?.resolve()?;
            let child_pts = points(&child);
            let distance_sq = match child_pts.bounding_box() {
                Some(bounds) => bounds.distance_sq(query),
                None => continue,
            };
            children.push((distance_sq, child));
        }
    }
    children.sort_by(|a, b| a.0.total_cmp(&b.0));
    for (_, child) in children {
        k_nearest_rec(&child, query, radius, k, best)?;
    }
    Ok(())
}

fn point_segment_distance(point: &Point3<f64>, p0: &Point3<f64>, p1: &Point3<f64>) -> f64 {
    let dir = p1 - p0;
    let len_sq = dir.norm_squared();
    let t = if len_sq > 0.0 {
        ((point - p0).dot(&dir) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    (point - (p0 + dir * t)).norm()
}

/// Slab test: does the segment `p0..p1` touch the box?
fn segment_intersects_box(bounds: &Aabb<f64>, p0: &Point3<f64>, p1: &Point3<f64>) -> bool {
    let dir = p1 - p0;
    let mut t_min = 0.0f64;
    let mut t_max = 1.0f64;
    for axis in 0..3 {
        if dir[axis] == 0.0 {
            if p0[axis] < bounds.min()[axis] || p0[axis] > bounds.max()[axis] {
                return false;
            }
            continue;
        }
        let inv = 1.0 / dir[axis];
        let mut t0 = (bounds.min()[axis] - p0[axis]) * inv;
        let mut t1 = (bounds.max()[axis] - p0[axis]) * inv;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        t_min = t_min.max(t0);
        t_max = t_max.min(t1);
        if t_max < t_min {
            return false;
        }
    }
    true
}

/// Clips the ray `origin + t * direction, t >= 0` against the box.
/// A ray starting inside the box clips to its exit segment; a ray that
/// misses returns `None`.
fn clip_ray_to_box(
    bounds: &Aabb<f64>,
    origin: &Point3<f64>,
    direction: &Vector3<f64>,
) -> Option<(Point3<f64>, Point3<f64>)> {
    let mut t_min = 0.0f64;
    let mut t_max = f64::INFINITY;
    for axis in 0..3 {
        if direction[axis] == 0.0 {
            if origin[axis] < bounds.min()[axis] || origin[axis] > bounds.max()[axis] {
                return None;
            }
            continue;
        }
        let inv = 1.0 / direction[axis];
        let mut t0 = (bounds.min()[axis] - origin[axis]) * inv;
        let mut t1 = (bounds.max()[axis] - origin[axis]) * inv;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        t_min = t_min.max(t0);
        t_max = t_max.min(t1);
        if t_max < t_min {
            return None;
        }
    }
    if !t_max.is_finite() {
        return None;
    }
    Some((origin + direction * t_min, origin + direction * t_max))
}

/// All points within `radius` of the segment `p0..p1`, sorted by distance
/// to the segment. Each leaf contributes at most [NEAR_LINE_LEAF_CAP] hits.
pub fn near_line(
    root: &Arc<Node>,
    p0: &Point3<f64>,
    p1: &Point3<f64>,
    radius: f64,
) -> Result<Vec<PointSample>, Error> {
    let mut hits = Vec::new();
    let mut stack = vec![Arc::clone(root)];
    while let Some(node) = stack.pop() {
        let node = node.resolve()?;
        let pts = points(&node);
        if pts.point_count_tree() == 0 {
            continue;
        }
        let Some(bounds) = pts.bounding_box() else {
            continue;
        };
        // the inflated box contains the Euclidean neighbourhood of the box
        if !segment_intersects_box(&bounds.inflate(radius), p0, p1) {
            continue;
        }
        if !pts.is_leaf() {
            if let Some(slots) = pts.subnodes() {
                for slot in slots.iter().flatten() {
                    stack.push(slot.value()?);
                }
            }
            continue;
        }
        let Some(relative) = pts.positions()? else {
            continue;
        };
        let kd = leaf_kd_tree(pts, &relative)?;
        let center = pts.cell().center();
        let to_rel = |p: &Point3<f64>| {
            Point3::new(
                (p.x - center.x) as f32,
                (p.y - center.y) as f32,
                (p.z - center.z) as f32,
            )
        };
        let r32 = (radius * (1.0 + 1e-6)) as f32;
        let leaf_hits = kd.near_line(&relative, &to_rel(p0), &to_rel(p1), r32, NEAR_LINE_LEAF_CAP);
        if leaf_hits.is_empty() {
            continue;
        }
        let columns = LeafColumns::load(pts)?;
        for (index, _) in leaf_hits {
            let p = relative[index as usize];
            let position = Point3::new(
                center.x + p.x as f64,
                center.y + p.y as f64,
                center.z + p.z as f64,
            );
            let distance = point_segment_distance(&position, p0, p1);
            if distance > radius {
                continue;
            }
            hits.push(columns.sample(index as usize, position, distance));
        }
    }
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    Ok(hits)
}

/// All points within `radius` of the ray, sorted by distance. The ray is
/// clipped against the root's bounding box (inflated by the radius); a ray
/// that misses the tree entirely yields no hits.
pub fn near_ray(
    root: &Arc<Node>,
    origin: &Point3<f64>,
    direction: &Vector3<f64>,
    radius: f64,
) -> Result<Vec<PointSample>, Error> {
    let resolved = root.resolve()?;
    let pts = points(&resolved);
    let Some(bounds) = pts.bounding_box() else {
        return Ok(vec![]);
    };
    let Some((p0, p1)) = clip_ray_to_box(&bounds.inflate(radius), origin, direction) else {
        return Ok(vec![]);
    };
    near_line(&resolved, &p0, &p1, radius)
}
