//! Construction des buffers (points, lignes, polygones)
//!
//! Un buffer de ligne est l'union des rectangles de chaque segment et des
//! disques de jonction aux sommets intérieurs. Un buffer de polygone est le
//! polygone augmenté (ou diminué) du buffer de ses anneaux.

use std::f64::consts::FRAC_PI_2;

use geo::{Area, BooleanOps, Coord, Geometry, LineString, MultiPolygon, Polygon};

use super::{union_all, GeometryKind, AREA_EPSILON};
use crate::CnError;

/// Nombre de segments par quart de cercle pour les points
pub const POINT_SEGMENTS: usize = 5;

/// Nombre de segments par quart de cercle pour les lignes
pub const LINE_SEGMENTS: usize = 2;

/// Style d'extrémité des buffers de lignes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapStyle {
    /// Demi-disque à chaque extrémité
    Round,
    /// Coupé net à l'extrémité
    Flat,
}

/// Bufferise une géométrie avec les paramètres fixes du pipeline:
/// points en cap rond (5 segments), lignes en cap plat (2 segments).
///
/// Retourne `Ok(None)` quand le résultat est dégénéré (distance nulle ou négative
/// sur un point ou une ligne). Les types non supportés sont une erreur.
pub fn buffer_geometry(geometry: &Geometry, distance: f64) -> Result<Option<Geometry>, CnError> {
    match GeometryKind::of(geometry) {
        GeometryKind::Point => Ok(buffer_points(geometry, distance, POINT_SEGMENTS)),
        GeometryKind::Line => {
            buffer_lines(geometry, distance, LINE_SEGMENTS, CapStyle::Flat).map(non_empty)
        }
        GeometryKind::Polygon | GeometryKind::Other => Err(CnError::geometry(
            "buffer",
            format!("unsupported geometry type {}", GeometryKind::of(geometry)),
        )),
    }
}

/// Buffer de polygone (positif: dilatation, négatif: érosion)
pub fn buffer_polygons(
    mp: &MultiPolygon,
    distance: f64,
    segments: usize,
) -> Result<MultiPolygon, CnError> {
    if distance == 0.0 || mp.0.is_empty() {
        return Ok(mp.clone());
    }

    let rings: Vec<MultiPolygon> = mp
        .0
        .iter()
        .flat_map(|p| std::iter::once(p.exterior()).chain(p.interiors().iter()))
        .filter_map(|ring| linestring_buffer(ring, distance.abs(), segments, CapStyle::Round))
        .collect();
    let boundary = union_all(rings)?;

    if distance > 0.0 {
        union_all(vec![mp.clone(), boundary])
    } else {
        super::guarded("buffer", || mp.difference(&boundary))
    }
}

fn non_empty(mp: MultiPolygon) -> Option<Geometry> {
    if mp.unsigned_area() <= AREA_EPSILON {
        None
    } else if mp.0.len() == 1 {
        mp.0.into_iter().next().map(Geometry::Polygon)
    } else {
        Some(Geometry::MultiPolygon(mp))
    }
}

fn buffer_points(geometry: &Geometry, distance: f64, segments: usize) -> Option<Geometry> {
    if distance <= 0.0 {
        return None;
    }
    let polygons: Vec<Polygon> = match geometry {
        Geometry::Point(p) => vec![disc(p.0, distance, segments)],
        Geometry::MultiPoint(mp) => mp.0.iter().map(|p| disc(p.0, distance, segments)).collect(),
        _ => return None,
    };
    match polygons.len() {
        0 => None,
        1 => polygons.into_iter().next().map(Geometry::Polygon),
        _ => union_all(polygons.into_iter().map(|p| MultiPolygon::new(vec![p])).collect())
            .ok()
            .and_then(non_empty),
    }
}

fn buffer_lines(
    geometry: &Geometry,
    distance: f64,
    segments: usize,
    cap: CapStyle,
) -> Result<MultiPolygon, CnError> {
    if distance <= 0.0 {
        return Ok(MultiPolygon::new(Vec::new()));
    }
    let owned;
    let lines: Vec<&LineString> = match geometry {
        Geometry::LineString(ls) => vec![ls],
        Geometry::MultiLineString(mls) => mls.0.iter().collect(),
        Geometry::Line(l) => {
            owned = LineString::new(vec![l.start, l.end]);
            vec![&owned]
        }
        _ => Vec::new(),
    };

    let parts: Vec<MultiPolygon> = lines
        .into_iter()
        .filter_map(|ls| linestring_buffer(ls, distance, segments, cap))
        .collect();
    union_all(parts)
}

/// Buffer d'une polyligne: rectangles par segment, disques aux jonctions
fn linestring_buffer(
    ls: &LineString,
    distance: f64,
    segments: usize,
    cap: CapStyle,
) -> Option<MultiPolygon> {
    let coords: Vec<Coord> = ls
        .0
        .iter()
        .copied()
        .filter(|c| c.x.is_finite() && c.y.is_finite())
        .fold(Vec::new(), |mut acc: Vec<Coord>, c| {
            if acc.last().map_or(true, |&last| last != c) {
                acc.push(c);
            }
            acc
        });

    if coords.is_empty() {
        return None;
    }
    if coords.len() == 1 {
        // Ligne réduite à un point
        return match cap {
            CapStyle::Flat => None,
            CapStyle::Round => Some(MultiPolygon::new(vec![disc(coords[0], distance, segments)])),
        };
    }

    let closed = coords.len() > 2 && coords.first() == coords.last();
    let mut pieces: Vec<Polygon> = coords
        .windows(2)
        .map(|pair| segment_rectangle(pair[0], pair[1], distance))
        .collect();

    // Jonctions rondes aux sommets intérieurs
    for c in &coords[1..coords.len() - 1] {
        pieces.push(disc(*c, distance, segments));
    }
    if closed {
        pieces.push(disc(coords[0], distance, segments));
    } else if cap == CapStyle::Round {
        pieces.push(disc(coords[0], distance, segments));
        pieces.push(disc(coords[coords.len() - 1], distance, segments));
    }

    union_all(pieces.into_iter().map(|p| MultiPolygon::new(vec![p])).collect()).ok()
}

fn segment_rectangle(a: Coord, b: Coord, d: f64) -> Polygon {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len = (dx * dx + dy * dy).sqrt();
    let (nx, ny) = (-dy / len * d, dx / len * d);

    Polygon::new(
        LineString::new(vec![
            Coord { x: a.x + nx, y: a.y + ny },
            Coord { x: a.x - nx, y: a.y - ny },
            Coord { x: b.x - nx, y: b.y - ny },
            Coord { x: b.x + nx, y: b.y + ny },
            Coord { x: a.x + nx, y: a.y + ny },
        ]),
        vec![],
    )
}

/// Disque approché par `4 * segments` sommets
fn disc(center: Coord, radius: f64, segments: usize) -> Polygon {
    let n = 4 * segments.max(1);
    let step = FRAC_PI_2 / segments.max(1) as f64;
    let mut coords: Vec<Coord> = (0..n)
        .map(|i| {
            let angle = step * i as f64;
            Coord {
                x: center.x + radius * angle.cos(),
                y: center.y + radius * angle.sin(),
            }
        })
        .collect();
    coords.push(coords[0]);
    Polygon::new(LineString::new(coords), vec![])
}
