use crate::error::Error;
use crate::geometry::bounding_box::{Aabb, OptionAabb};
use nalgebra::{Point3, Vector3};
use std::hash::{Hash, Hasher};

/// A batch of raw samples handed to the importer: parallel arrays of
/// absolute double-precision positions and optional per-point attributes.
///
/// Chunks are produced by format parsers outside of this crate. The
/// contract: all present arrays have the same length, positions are finite.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    positions: Vec<Point3<f64>>,
    colors: Option<Vec<[u8; 4]>>,
    normals: Option<Vec<Vector3<f32>>>,
    intensities: Option<Vec<i32>>,
    classifications: Option<Vec<u8>>,
    bounds: OptionAabb<f64>,
}

impl Chunk {
    pub fn new(positions: Vec<Point3<f64>>) -> Self {
        let bounds = OptionAabb::from_points(positions.iter());
        Chunk {
            positions,
            colors: None,
            normals: None,
            intensities: None,
            classifications: None,
            bounds,
        }
    }

    pub fn with_colors(mut self, colors: Vec<[u8; 4]>) -> Self {
        self.colors = Some(colors);
        self
    }

    pub fn with_normals(mut self, normals: Vec<Vector3<f32>>) -> Self {
        self.normals = Some(normals);
        self
    }

    pub fn with_intensities(mut self, intensities: Vec<i32>) -> Self {
        self.intensities = Some(intensities);
        self
    }

    pub fn with_classifications(mut self, classifications: Vec<u8>) -> Self {
        self.classifications = Some(classifications);
        self
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Point3<f64>] {
        &self.positions
    }

    pub fn colors(&self) -> Option<&[[u8; 4]]> {
        self.colors.as_deref()
    }

    pub fn normals(&self) -> Option<&[Vector3<f32>]> {
        self.normals.as_deref()
    }

    pub fn intensities(&self) -> Option<&[i32]> {
        self.intensities.as_deref()
    }

    pub fn classifications(&self) -> Option<&[u8]> {
        self.classifications.as_deref()
    }

    /// The cached bounding box; `None` for an empty chunk.
    pub fn bounds(&self) -> Option<Aabb<f64>> {
        self.bounds.into_aabb()
    }

    /// Checks the input contract.
    pub fn validate(&self) -> Result<(), Error> {
        let n = self.positions.len();
        let check = |name: &str, len: Option<usize>| -> Result<(), Error> {
            match len {
                Some(l) if l != n => Err(Error::invalid_input(format!(
                    "chunk {name} array has length {l}, expected {n}"
                ))),
                _ => Ok(()),
            }
        };
        check("colors", self.colors.as_ref().map(Vec::len))?;
        check("normals", self.normals.as_ref().map(Vec::len))?;
        check("intensities", self.intensities.as_ref().map(Vec::len))?;
        check(
            "classifications",
            self.classifications.as_ref().map(Vec::len),
        )?;
        for (i, p) in self.positions.iter().enumerate() {
            if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
                return Err(Error::invalid_input(format!(
                    "chunk position {i} is not finite: {p:?}"
                )));
            }
        }
        Ok(())
    }

    /// A new chunk with the selected samples, keeping input order.
    pub fn take(&self, indices: &[usize]) -> Chunk {
        fn gather<T: Copy>(source: &Option<Vec<T>>, indices: &[usize]) -> Option<Vec<T>> {
            source
                .as_ref()
                .map(|values| indices.iter().map(|&i| values[i]).collect())
        }
        let positions: Vec<Point3<f64>> = indices.iter().map(|&i| self.positions[i]).collect();
        let bounds = OptionAabb::from_points(positions.iter());
        Chunk {
            positions,
            colors: gather(&self.colors, indices),
            normals: gather(&self.normals, indices),
            intensities: gather(&self.intensities, indices),
            classifications: gather(&self.classifications, indices),
            bounds,
        }
    }

    /// Applies a pure per-point transform to the positions and recomputes
    /// the bounding box. Attributes are untouched.
    pub fn map_positions<F>(&self, transform: F) -> Chunk
    where
        F: Fn(Point3<f64>) -> Point3<f64>,
    {
        let positions: Vec<Point3<f64>> = self.positions.iter().map(|&p| transform(p)).collect();
        let bounds = OptionAabb::from_points(positions.iter());
        Chunk {
            positions,
            colors: self.colors.clone(),
            normals: self.normals.clone(),
            intensities: self.intensities.clone(),
            classifications: self.classifications.clone(),
            bounds,
        }
    }

    /// Hash over the full chunk content, used for chunk deduplication.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.positions.len().hash(&mut hasher);
        for p in &self.positions {
            p.x.to_bits().hash(&mut hasher);
            p.y.to_bits().hash(&mut hasher);
            p.z.to_bits().hash(&mut hasher);
        }
        self.colors.hash(&mut hasher);
        if let Some(normals) = &self.normals {
            for n in normals {
                n.x.to_bits().hash(&mut hasher);
                n.y.to_bits().hash(&mut hasher);
                n.z.to_bits().hash(&mut hasher);
            }
        }
        self.intensities.hash(&mut hasher);
        self.classifications.hash(&mut hasher);
        hasher.finish()
    }
}
