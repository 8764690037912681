use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::Point3;
use std::collections::BinaryHeap;
use std::io::Cursor;

/// A balanced kd-tree over a leaf's cell-relative positions.
///
/// The tree is left-balanced and stored as a single permutation of point
/// indices in implicit heap order (children of slot `i` at `2i + 1` and
/// `2i + 2`); the split axis cycles with the depth, the split value is the
/// node's own coordinate. Searches take the position slice the tree was
/// built over, so the persisted form is just the permutation and can be
/// regenerated from the positions at any time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KdTree {
    heap: Vec<u32>,
}

/// A search hit: index into the position array and distance to the query.
pub type Hit = (u32, f32);

#[derive(PartialEq)]
struct Candidate {
    distance: f32,
    index: u32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // ordered by distance, ties by index, so the heap maximum is the
        // worst candidate and equal-distance hits keep the lower index
        self.distance
            .total_cmp(&other.distance)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Number of nodes in the left subtree of a left-balanced tree of `n` nodes.
fn left_subtree_size(n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let h = usize::BITS as usize - 1 - n.leading_zeros() as usize;
    let half = 1usize << (h - 1);
    let last_level = n - ((1usize << h) - 1);
    (half - 1) + last_level.min(half)
}

fn distance_sq(a: &Point3<f32>, b: &Point3<f32>) -> f32 {
    (a - b).norm_squared()
}

/// Squared distance from a point to the segment `p0..p1`.
fn segment_distance_sq(point: &Point3<f32>, p0: &Point3<f32>, p1: &Point3<f32>) -> f32 {
    let dir = p1 - p0;
    let len_sq = dir.norm_squared();
    let t = if len_sq > 0.0 {
        ((point - p0).dot(&dir) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let closest = p0 + dir * t;
    distance_sq(point, &closest)
}

impl KdTree {
    /// Builds the tree over the given positions. `O(n log n)`.
    pub fn build(points: &[Point3<f32>]) -> Self {
        assert!(points.len() <= u32::MAX as usize);
        let mut scratch: Vec<u32> = (0..points.len() as u32).collect();
        let mut heap = vec![0u32; points.len()];
        Self::place(points, &mut scratch, 0, 0, &mut heap);
        KdTree { heap }
    }

    fn place(points: &[Point3<f32>], slice: &mut [u32], slot: usize, depth: usize, heap: &mut [u32]) {
        if slice.is_empty() {
            return;
        }
        let axis = depth % 3;
        let mid = left_subtree_size(slice.len());
        slice.select_nth_unstable_by(mid, |&a, &b| {
            points[a as usize][axis]
                .total_cmp(&points[b as usize][axis])
                .then(a.cmp(&b))
        });
        heap[slot] = slice[mid];
        let (left, rest) = slice.split_at_mut(mid);
        let right = &mut rest[1..];
        Self::place(points, left, 2 * slot + 1, depth + 1, heap);
        Self::place(points, right, 2 * slot + 2, depth + 1, heap);
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn permutation(&self) -> &[u32] {
        &self.heap
    }

    /// Up to `k` nearest points within `radius` of `query`, sorted by
    /// distance (ties by lower index). `points` must be the array the tree
    /// was built over.
    pub fn k_nearest(
        &self,
        points: &[Point3<f32>],
        query: &Point3<f32>,
        radius: f32,
        k: usize,
    ) -> Vec<Hit> {
        debug_assert_eq!(points.len(), self.heap.len());
        if k == 0 || self.heap.is_empty() {
            return vec![];
        }
        let mut best: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        self.nearest_rec(points, query, radius, k, 0, 0, &mut best);
        let mut hits: Vec<Hit> = best
            .into_iter()
            .map(|c| (c.index, c.distance))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits
    }

    fn nearest_rec(
        &self,
        points: &[Point3<f32>],
        query: &Point3<f32>,
        radius: f32,
        k: usize,
        slot: usize,
        depth: usize,
        best: &mut BinaryHeap<Candidate>,
    ) {
        if slot >= self.heap.len() {
            return;
        }
        let index = self.heap[slot];
        let point = &points[index as usize];
        let distance = distance_sq(query, point).sqrt();
        if distance <= radius {
            best.push(Candidate { distance, index });
            if best.len() > k {
                best.pop();
            }
        }

        let axis = depth % 3;
        let delta = query[axis] - point[axis];
        let (near, far) = if delta < 0.0 {
            (2 * slot + 1, 2 * slot + 2)
        } else {
            (2 * slot + 2, 2 * slot + 1)
        };
        self.nearest_rec(points, query, radius, k, near, depth + 1, best);
        let mut prune = radius;
        if best.len() == k {
            if let Some(worst) = best.peek() {
                prune = prune.min(worst.distance);
            }
        }
        if delta.abs() <= prune {
            self.nearest_rec(points, query, radius, k, far, depth + 1, best);
        }
    }

    /// Up to `cap` points within `radius` of the segment `p0..p1`, sorted
    /// by distance to the segment (ties by lower index).
    pub fn near_line(
        &self,
        points: &[Point3<f32>],
        p0: &Point3<f32>,
        p1: &Point3<f32>,
        radius: f32,
        cap: usize,
    ) -> Vec<Hit> {
        debug_assert_eq!(points.len(), self.heap.len());
        if cap == 0 || self.heap.is_empty() {
            return vec![];
        }
        let mut best: BinaryHeap<Candidate> = BinaryHeap::with_capacity(cap + 1);
        self.near_line_rec(points, p0, p1, radius, cap, 0, 0, &mut best);
        let mut hits: Vec<Hit> = best
            .into_iter()
            .map(|c| (c.index, c.distance))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits
    }

    #[allow(clippy::too_many_arguments)]
    fn near_line_rec(
        &self,
        points: &[Point3<f32>],
        p0: &Point3<f32>,
        p1: &Point3<f32>,
        radius: f32,
        cap: usize,
        slot: usize,
        depth: usize,
        best: &mut BinaryHeap<Candidate>,
    ) {
        if slot >= self.heap.len() {
            return;
        }
        let index = self.heap[slot];
        let point = &points[index as usize];
        let distance = segment_distance_sq(point, p0, p1).sqrt();
        if distance <= radius {
            best.push(Candidate { distance, index });
            if best.len() > cap {
                best.pop();
            }
        }

        let axis = depth % 3;
        let split = point[axis];
        let interval_min = p0[axis].min(p1[axis]);
        let interval_max = p0[axis].max(p1[axis]);
        let mut prune = radius;
        if best.len() == cap {
            if let Some(worst) = best.peek() {
                prune = prune.min(worst.distance);
            }
        }
        // left subtree holds points with coordinate <= split, right >= split
        if interval_min - split <= prune {
            self.near_line_rec(points, p0, p1, radius, cap, 2 * slot + 1, depth + 1, best);
        }
        if split - interval_max <= prune {
            self.near_line_rec(points, p0, p1, radius, cap, 2 * slot + 2, depth + 1, best);
        }
    }

    /// Length-prefixed little-endian permutation.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 4 * self.heap.len());
        out.write_u32::<LittleEndian>(self.heap.len() as u32)
            .expect("vec write");
        for &index in &self.heap {
            out.write_u32::<LittleEndian>(index).expect("vec write");
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut cursor = Cursor::new(bytes);
        let len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| e.to_string())? as usize;
        let mut heap = Vec::with_capacity(len);
        for _ in 0..len {
            heap.push(
                cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| e.to_string())?,
            );
        }
        for &index in &heap {
            if index as usize >= len {
                return Err(format!("kd-tree index {index} out of range {len}"));
            }
        }
        Ok(KdTree { heap })
    }
}
