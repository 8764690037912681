use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// The closed set of per-node attribute arrays. Each value of this enum
/// identifies one blob hanging off a node; the codec is chosen by the name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Attribute {
    Positions,
    Colors,
    Normals,
    Intensities,
    Classifications,
    KdTree,
    LodPositions,
    LodColors,
    LodNormals,
    LodIntensities,
    LodClassifications,
    LodKdTree,
}

impl Attribute {
    /// The lod counterpart of a node-level attribute.
    pub fn lod_variant(self) -> Attribute {
        match self {
            Attribute::Positions => Attribute::LodPositions,
            Attribute::Colors => Attribute::LodColors,
            Attribute::Normals => Attribute::LodNormals,
            Attribute::Intensities => Attribute::LodIntensities,
            Attribute::Classifications => Attribute::LodClassifications,
            Attribute::KdTree => Attribute::LodKdTree,
            lod => lod,
        }
    }

    pub fn is_lod(self) -> bool {
        matches!(
            self,
            Attribute::LodPositions
                | Attribute::LodColors
                | Attribute::LodNormals
                | Attribute::LodIntensities
                | Attribute::LodClassifications
                | Attribute::LodKdTree
        )
    }
}

// ---------------------------------------------------------------------------
// array codecs: length-prefixed little-endian records, exact roundtrip
// ---------------------------------------------------------------------------

fn read_len(cursor: &mut Cursor<&[u8]>) -> Result<usize, String> {
    Ok(cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| e.to_string())? as usize)
}

pub fn encode_positions(values: &[Point3<f32>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 12 * values.len());
    out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
    for p in values {
        out.write_f32::<LittleEndian>(p.x).unwrap();
        out.write_f32::<LittleEndian>(p.y).unwrap();
        out.write_f32::<LittleEndian>(p.z).unwrap();
    }
    out
}

pub fn decode_positions(bytes: &[u8]) -> Result<Vec<Point3<f32>>, String> {
    let mut cursor = Cursor::new(bytes);
    let len = read_len(&mut cursor)?;
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        let x = cursor.read_f32::<LittleEndian>().map_err(|e| e.to_string())?;
        let y = cursor.read_f32::<LittleEndian>().map_err(|e| e.to_string())?;
        let z = cursor.read_f32::<LittleEndian>().map_err(|e| e.to_string())?;
        values.push(Point3::new(x, y, z));
    }
    Ok(values)
}

pub fn encode_normals(values: &[Vector3<f32>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 12 * values.len());
    out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
    for n in values {
        out.write_f32::<LittleEndian>(n.x).unwrap();
        out.write_f32::<LittleEndian>(n.y).unwrap();
        out.write_f32::<LittleEndian>(n.z).unwrap();
    }
    out
}

pub fn decode_normals(bytes: &[u8]) -> Result<Vec<Vector3<f32>>, String> {
    Ok(decode_positions(bytes)?
        .into_iter()
        .map(|p| p.coords)
        .collect())
}

pub fn encode_colors(values: &[[u8; 4]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 * values.len());
    out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
    for rgba in values {
        out.extend_from_slice(rgba);
    }
    out
}

pub fn decode_colors(bytes: &[u8]) -> Result<Vec<[u8; 4]>, String> {
    let mut cursor = Cursor::new(bytes);
    let len = read_len(&mut cursor)?;
    let rest = &bytes[4..];
    if rest.len() != len * 4 {
        return Err(format!("color array of {len} entries has {} bytes", rest.len()));
    }
    Ok(rest
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect())
}

pub fn encode_intensities(values: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 * values.len());
    out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
    for v in values {
        out.write_i32::<LittleEndian>(*v).unwrap();
    }
    out
}

pub fn decode_intensities(bytes: &[u8]) -> Result<Vec<i32>, String> {
    let mut cursor = Cursor::new(bytes);
    let len = read_len(&mut cursor)?;
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(cursor.read_i32::<LittleEndian>().map_err(|e| e.to_string())?);
    }
    Ok(values)
}

pub fn encode_classifications(values: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + values.len());
    out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
    out.extend_from_slice(values);
    out
}

pub fn decode_classifications(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let mut cursor = Cursor::new(bytes);
    let len = read_len(&mut cursor)?;
    let rest = &bytes[4..];
    if rest.len() != len {
        return Err(format!(
            "classification array of {len} entries has {} bytes",
            rest.len()
        ));
    }
    Ok(rest.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Vector3};

    #[test]
    fn lod_variants() {
        assert_eq!(Attribute::Positions.lod_variant(), Attribute::LodPositions);
        assert_eq!(Attribute::KdTree.lod_variant(), Attribute::LodKdTree);
        assert_eq!(Attribute::LodColors.lod_variant(), Attribute::LodColors);
        assert!(Attribute::LodNormals.is_lod());
        assert!(!Attribute::Normals.is_lod());
    }

    #[test]
    fn attribute_names_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&Attribute::LodPositions).unwrap(),
            "\"LodPositions\""
        );
        let back: Attribute = serde_json::from_str("\"Classifications\"").unwrap();
        assert_eq!(back, Attribute::Classifications);
    }

    #[test]
    fn positions_roundtrip() {
        let values = vec![
            Point3::new(0.5, -1.25, 3.0),
            Point3::new(f32::MIN_POSITIVE, 0.0, -0.0),
        ];
        let bytes = encode_positions(&values);
        assert_eq!(bytes.len(), 4 + 24);
        assert_eq!(decode_positions(&bytes).unwrap(), values);
    }

    #[test]
    fn normals_roundtrip() {
        let values = vec![Vector3::new(0.0, 0.0, 1.0), Vector3::new(-1.0, 0.0, 0.0)];
        assert_eq!(decode_normals(&encode_normals(&values)).unwrap(), values);
    }

    #[test]
    fn colors_roundtrip_and_length_check() {
        let values = vec![[0, 64, 128, 255], [1, 2, 3, 4]];
        let bytes = encode_colors(&values);
        assert_eq!(decode_colors(&bytes).unwrap(), values);
        assert!(decode_colors(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn intensities_roundtrip() {
        let values = vec![i32::MIN, -1, 0, 42, i32::MAX];
        assert_eq!(
            decode_intensities(&encode_intensities(&values)).unwrap(),
            values
        );
    }

    #[test]
    fn classifications_roundtrip() {
        let values = vec![0u8, 2, 6, 255];
        assert_eq!(
            decode_classifications(&encode_classifications(&values)).unwrap(),
            values
        );
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(decode_positions(&[1, 0]).is_err());
        assert!(decode_intensities(&[5, 0, 0, 0, 1]).is_err());
    }
}
