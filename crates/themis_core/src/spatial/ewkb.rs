//! EWKB (PostGIS-compatible) geometry parsing.
//!
//! Supports Point, LineString, and Polygon in XY or XYZ, both byte orders,
//! with or without the embedded SRID. Parse failures are `BadGeometry`.

use crate::error::{CoreError, CoreResult};

const TYPE_POINT: u32 = 1;
const TYPE_LINESTRING: u32 = 2;
const TYPE_POLYGON: u32 = 3;

const FLAG_Z: u32 = 0x8000_0000;
const FLAG_M: u32 = 0x4000_0000;
const FLAG_SRID: u32 = 0x2000_0000;

/// A parsed coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    /// X (longitude/easting).
    pub x: f64,
    /// Y (latitude/northing).
    pub y: f64,
    /// Optional elevation.
    pub z: Option<f64>,
}

/// A parsed geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// A single position.
    Point(Coord),
    /// An ordered path of positions.
    LineString(Vec<Coord>),
    /// An outer ring plus optional holes.
    Polygon(Vec<Vec<Coord>>),
}

/// An axis-aligned minimum bounding rectangle.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Mbr {
    /// Minimum x.
    pub min_x: f64,
    /// Minimum y.
    pub min_y: f64,
    /// Maximum x.
    pub max_x: f64,
    /// Maximum y.
    pub max_y: f64,
}

impl Mbr {
    /// Returns true if the rectangles share any area (boundaries count).
    #[must_use]
    pub fn intersects(&self, other: &Mbr) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Returns true if `self` lies entirely inside `other`.
    #[must_use]
    pub fn within(&self, other: &Mbr) -> bool {
        self.min_x >= other.min_x
            && self.max_x <= other.max_x
            && self.min_y >= other.min_y
            && self.max_y <= other.max_y
    }

    /// Returns true if the point is inside or on the boundary.
    #[must_use]
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Area of the rectangle in coordinate units.
    #[must_use]
    pub fn area(&self) -> f64 {
        (self.max_x - self.min_x).max(0.0) * (self.max_y - self.min_y).max(0.0)
    }
}

impl Geometry {
    /// All coordinates of the geometry, flattened.
    #[must_use]
    pub fn coords(&self) -> Vec<Coord> {
        match self {
            Geometry::Point(c) => vec![*c],
            Geometry::LineString(cs) => cs.clone(),
            Geometry::Polygon(rings) => rings.iter().flatten().copied().collect(),
        }
    }

    /// Computes the minimum bounding rectangle.
    ///
    /// # Errors
    ///
    /// Returns `BadGeometry` for an empty geometry.
    pub fn mbr(&self) -> CoreResult<Mbr> {
        let coords = self.coords();
        if coords.is_empty() {
            return Err(CoreError::bad_geometry("empty geometry has no extent"));
        }
        let mut mbr = Mbr {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for c in &coords {
            mbr.min_x = mbr.min_x.min(c.x);
            mbr.min_y = mbr.min_y.min(c.y);
            mbr.max_x = mbr.max_x.max(c.x);
            mbr.max_y = mbr.max_y.max(c.y);
        }
        Ok(mbr)
    }

    /// Arithmetic-mean centroid of all coordinates.
    ///
    /// # Errors
    ///
    /// Returns `BadGeometry` for an empty geometry.
    pub fn centroid(&self) -> CoreResult<(f64, f64)> {
        let coords = self.coords();
        if coords.is_empty() {
            return Err(CoreError::bad_geometry("empty geometry has no centroid"));
        }
        let n = coords.len() as f64;
        let (sx, sy) = coords
            .iter()
            .fold((0.0, 0.0), |(sx, sy), c| (sx + c.x, sy + c.y));
        Ok((sx / n, sy / n))
    }

    /// The elevation range of the geometry, if any coordinate carries Z.
    #[must_use]
    pub fn z_range(&self) -> Option<(f64, f64)> {
        let zs: Vec<f64> = self.coords().iter().filter_map(|c| c.z).collect();
        if zs.is_empty() {
            return None;
        }
        let min = zs.iter().copied().fold(f64::INFINITY, f64::min);
        let max = zs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some((min, max))
    }
}

/// Parses an EWKB byte string.
///
/// # Errors
///
/// Returns [`CoreError::BadGeometry`] on truncation, unknown geometry
/// types, NaN coordinates, or structural errors.
pub fn parse_ewkb(bytes: &[u8]) -> CoreResult<Geometry> {
    let mut reader = Reader::new(bytes);
    let geometry = parse_geometry(&mut reader)?;
    if !reader.is_empty() {
        return Err(CoreError::bad_geometry("trailing bytes after geometry"));
    }
    Ok(geometry)
}

fn parse_geometry(reader: &mut Reader<'_>) -> CoreResult<Geometry> {
    let little_endian = match reader.read_u8()? {
        0 => false,
        1 => true,
        other => {
            return Err(CoreError::bad_geometry(format!(
                "invalid byte-order flag {other}"
            )));
        }
    };

    let raw_type = reader.read_u32(little_endian)?;
    let has_z = raw_type & FLAG_Z != 0;
    if raw_type & FLAG_M != 0 {
        return Err(CoreError::bad_geometry("M coordinates are not supported"));
    }
    if raw_type & FLAG_SRID != 0 {
        // SRID is read and discarded; coordinates are stored as-is.
        let _srid = reader.read_u32(little_endian)?;
    }

    match raw_type & 0x0000_FFFF {
        TYPE_POINT => Ok(Geometry::Point(read_coord(reader, little_endian, has_z)?)),
        TYPE_LINESTRING => {
            let coords = read_coord_seq(reader, little_endian, has_z)?;
            if coords.len() < 2 {
                return Err(CoreError::bad_geometry("linestring needs two points"));
            }
            Ok(Geometry::LineString(coords))
        }
        TYPE_POLYGON => {
            let ring_count = reader.read_u32(little_endian)? as usize;
            if ring_count == 0 {
                return Err(CoreError::bad_geometry("polygon needs an outer ring"));
            }
            if ring_count > reader.remaining() {
                return Err(CoreError::bad_geometry("ring count exceeds input"));
            }
            let mut rings = Vec::with_capacity(ring_count);
            for _ in 0..ring_count {
                let ring = read_coord_seq(reader, little_endian, has_z)?;
                if ring.len() < 4 {
                    return Err(CoreError::bad_geometry("ring needs four points"));
                }
                rings.push(ring);
            }
            Ok(Geometry::Polygon(rings))
        }
        other => Err(CoreError::bad_geometry(format!(
            "unsupported geometry type {other}"
        ))),
    }
}

fn read_coord_seq(
    reader: &mut Reader<'_>,
    little_endian: bool,
    has_z: bool,
) -> CoreResult<Vec<Coord>> {
    let count = reader.read_u32(little_endian)? as usize;
    if count > reader.remaining() {
        return Err(CoreError::bad_geometry("point count exceeds input"));
    }
    let mut coords = Vec::with_capacity(count);
    for _ in 0..count {
        coords.push(read_coord(reader, little_endian, has_z)?);
    }
    Ok(coords)
}

fn read_coord(reader: &mut Reader<'_>, little_endian: bool, has_z: bool) -> CoreResult<Coord> {
    let x = reader.read_f64(little_endian)?;
    let y = reader.read_f64(little_endian)?;
    let z = if has_z {
        Some(reader.read_f64(little_endian)?)
    } else {
        None
    };
    if x.is_nan() || y.is_nan() || z.is_some_and(f64::is_nan) {
        return Err(CoreError::bad_geometry("NaN coordinate"));
    }
    Ok(Coord { x, y, z })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| CoreError::bad_geometry("unexpected end of EWKB"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self, little_endian: bool) -> CoreResult<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().expect("4 bytes");
        Ok(if little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    fn read_f64(&mut self, little_endian: bool) -> CoreResult<f64> {
        let raw: [u8; 8] = self.take(8)?.try_into().expect("8 bytes");
        Ok(if little_endian {
            f64::from_le_bytes(raw)
        } else {
            f64::from_be_bytes(raw)
        })
    }
}

/// Encodes a little-endian EWKB point. Test and ingestion helper.
#[must_use]
pub fn point_ewkb(x: f64, y: f64) -> Vec<u8> {
    let mut out = vec![1u8];
    out.extend_from_slice(&TYPE_POINT.to_le_bytes());
    out.extend_from_slice(&x.to_le_bytes());
    out.extend_from_slice(&y.to_le_bytes());
    out
}

/// Encodes a little-endian EWKB polygon from an outer ring.
///
/// The ring is closed automatically if its last point differs from the
/// first.
#[must_use]
pub fn polygon_ewkb(ring: &[(f64, f64)]) -> Vec<u8> {
    let mut closed: Vec<(f64, f64)> = ring.to_vec();
    if closed.first() != closed.last() {
        if let Some(&first) = closed.first() {
            closed.push(first);
        }
    }
    let mut out = vec![1u8];
    out.extend_from_slice(&TYPE_POLYGON.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(closed.len() as u32).to_le_bytes());
    for (x, y) in closed {
        out.extend_from_slice(&x.to_le_bytes());
        out.extend_from_slice(&y.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_point() {
        let geometry = parse_ewkb(&point_ewkb(13.4, 52.5)).unwrap();
        match geometry {
            Geometry::Point(c) => {
                assert!((c.x - 13.4).abs() < f64::EPSILON);
                assert!((c.y - 52.5).abs() < f64::EPSILON);
                assert!(c.z.is_none());
            }
            other => panic!("expected point, got {other:?}"),
        }
    }

    #[test]
    fn parse_point_with_srid_and_z() {
        // Big-endian point with SRID 4326 and Z.
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&(TYPE_POINT | FLAG_SRID | FLAG_Z).to_be_bytes());
        bytes.extend_from_slice(&4326u32.to_be_bytes());
        bytes.extend_from_slice(&1.0f64.to_be_bytes());
        bytes.extend_from_slice(&2.0f64.to_be_bytes());
        bytes.extend_from_slice(&3.0f64.to_be_bytes());

        let geometry = parse_ewkb(&bytes).unwrap();
        match geometry {
            Geometry::Point(c) => {
                assert_eq!((c.x, c.y, c.z), (1.0, 2.0, Some(3.0)));
            }
            other => panic!("expected point, got {other:?}"),
        }
        assert_eq!(geometry.z_range(), Some((3.0, 3.0)));
    }

    #[test]
    fn parse_polygon_and_mbr() {
        let bytes = polygon_ewkb(&[(0.0, 0.0), (4.0, 0.0), (4.0, 2.0), (0.0, 2.0)]);
        let geometry = parse_ewkb(&bytes).unwrap();
        let mbr = geometry.mbr().unwrap();
        assert_eq!(
            mbr,
            Mbr {
                min_x: 0.0,
                min_y: 0.0,
                max_x: 4.0,
                max_y: 2.0
            }
        );
        let (cx, cy) = geometry.centroid().unwrap();
        assert!((cx - 1.6).abs() < 1e-9);
        assert!((cy - 0.8).abs() < 1e-9);
    }

    #[test]
    fn truncated_input_is_bad_geometry() {
        let bytes = point_ewkb(1.0, 2.0);
        for cut in 1..bytes.len() {
            let err = parse_ewkb(&bytes[..cut]).unwrap_err();
            assert_eq!(err.kind(), "BadGeometry", "cut at {cut}");
        }
    }

    #[test]
    fn garbage_is_bad_geometry() {
        assert_eq!(parse_ewkb(b"not ewkb").unwrap_err().kind(), "BadGeometry");
        assert_eq!(parse_ewkb(&[]).unwrap_err().kind(), "BadGeometry");
        // Byte-order flag must be 0 or 1.
        assert_eq!(parse_ewkb(&[7, 0, 0, 0, 1]).unwrap_err().kind(), "BadGeometry");
    }

    #[test]
    fn nan_coordinate_rejected() {
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&TYPE_POINT.to_le_bytes());
        bytes.extend_from_slice(&f64::NAN.to_le_bytes());
        bytes.extend_from_slice(&2.0f64.to_le_bytes());
        assert_eq!(parse_ewkb(&bytes).unwrap_err().kind(), "BadGeometry");
    }

    #[test]
    fn mbr_predicates() {
        let a = Mbr {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 2.0,
            max_y: 2.0,
        };
        let b = Mbr {
            min_x: 1.0,
            min_y: 1.0,
            max_x: 3.0,
            max_y: 3.0,
        };
        let outer = Mbr {
            min_x: -1.0,
            min_y: -1.0,
            max_x: 5.0,
            max_y: 5.0,
        };
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(a.within(&outer));
        assert!(!outer.within(&a));
        assert!(a.contains_point(1.0, 1.0));
        assert!(!a.contains_point(5.0, 5.0));
    }
}
