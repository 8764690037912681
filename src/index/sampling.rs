use crate::chunk::Chunk;
use crate::error::Error;
use nalgebra::Point3;
use std::collections::HashMap;
use std::sync::Arc;

pub type Reprojection = Arc<dyn Fn(Point3<f64>) -> Point3<f64> + Send + Sync>;

/// Per-chunk preprocessing: optional reprojection followed by optional
/// minimum-distance thinning.
#[derive(Clone, Default)]
pub struct ChunkPipeline {
    reproject: Option<Reprojection>,
    min_dist: f64,
}

impl ChunkPipeline {
    pub fn new(reproject: Option<Reprojection>, min_dist: f64) -> Result<Self, Error> {
        if !min_dist.is_finite() || min_dist < 0.0 {
            return Err(Error::invalid_input(format!(
                "min_dist must be finite and >= 0, got {min_dist}"
            )));
        }
        Ok(ChunkPipeline {
            reproject,
            min_dist,
        })
    }

    pub fn process(&self, chunk: &Chunk) -> Result<Chunk, Error> {
        chunk.validate()?;
        let reprojected = match &self.reproject {
            Some(transform) => {
                let mapped = chunk.map_positions(|p| transform(p));
                mapped.validate()?;
                mapped
            }
            None => chunk.clone(),
        };
        if self.min_dist > 0.0 {
            Ok(thin_by_min_dist(&reprojected, self.min_dist))
        } else {
            Ok(reprojected)
        }
    }
}

fn grid_key(p: &Point3<f64>, min_dist: f64) -> (i64, i64, i64) {
    (
        (p.x / min_dist).floor() as i64,
        (p.y / min_dist).floor() as i64,
        (p.z / min_dist).floor() as i64,
    )
}

/// Thins the chunk so that no two kept points are closer than `min_dist`.
///
/// Points are bucketed into a grid of `min_dist` sized cells; a point is
/// kept if no already-kept point in its own or the 26 neighbouring cells is
/// within `min_dist`. First-come wins, so the result is deterministic in
/// the input order.
pub fn thin_by_min_dist(chunk: &Chunk, min_dist: f64) -> Chunk {
    debug_assert!(min_dist > 0.0);
    let mut kept_by_cell: HashMap<(i64, i64, i64), Vec<u32>> = HashMap::new();
    let mut kept: Vec<usize> = Vec::new();
    let positions = chunk.positions();
    let min_dist_sq = min_dist * min_dist;

    'points: for (i, p) in positions.iter().enumerate() {
        let (cx, cy, cz) = grid_key(p, min_dist);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let Some(neighbours) = kept_by_cell.get(&(cx + dx, cy + dy, cz + dz)) else {
                        continue;
                    };
                    for &j in neighbours {
                        let q = &positions[j as usize];
                        if (p - q).norm_squared() < min_dist_sq {
                            continue 'points;
                        }
                    }
                }
            }
        }
        kept_by_cell.entry((cx, cy, cz)).or_default().push(i as u32);
        kept.push(i);
    }
    chunk.take(&kept)
}
