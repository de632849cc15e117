//! Réparation des polygones avant une opération booléenne
//!
//! Nettoyage des anneaux (doublons, fermeture, anneaux dégénérés), orientation,
//! re-noding par une union à vide, puis convex hull en dernier recours.

use geo::orient::{Direction, Orient};
use geo::{Area, BooleanOps, ConvexHull, Coord, LineString, MultiPoint, MultiPolygon, Point, Polygon};
use tracing::warn;

use super::{guarded, AREA_EPSILON};

/// Tolérance de comparaison des coordonnées (mètres)
const TOLERANCE: f64 = 1e-6;

/// Répare un multipolygone; les parties irréparables sont remplacées par leur convex hull
pub fn repair_multi_polygon(mp: &MultiPolygon) -> MultiPolygon {
    let cleaned: Vec<Polygon> = mp.0.iter().filter_map(clean_polygon).collect();
    if cleaned.is_empty() {
        return MultiPolygon::new(Vec::new());
    }

    // Re-noding: une union avec un ensemble vide résout les auto-intersections simples
    let candidate = MultiPolygon::new(cleaned.clone());
    let empty = MultiPolygon::new(Vec::new());
    match guarded("repair", || candidate.union(&empty)) {
        Ok(renoded) => renoded,
        Err(e) => {
            warn!(error = %e, parts = cleaned.len(), "Re-noding failed, using convex hull per part");
            MultiPolygon::new(cleaned.iter().filter_map(convex_hull_fallback).collect())
        }
    }
}

/// Nettoie un polygone: anneaux fermés, sans doublons consécutifs, orientation standard
pub fn clean_polygon(polygon: &Polygon) -> Option<Polygon> {
    let exterior = clean_ring(polygon.exterior())?;
    let interiors: Vec<LineString> = polygon.interiors().iter().filter_map(clean_ring).collect();
    Some(Polygon::new(exterior, interiors).orient(Direction::Default))
}

/// Nettoie un anneau; retourne None s'il est dégénéré (moins de 3 sommets distincts ou aire nulle)
fn clean_ring(ring: &LineString) -> Option<LineString> {
    let mut coords: Vec<Coord> = Vec::with_capacity(ring.0.len());
    for &c in ring.0.iter() {
        if !c.x.is_finite() || !c.y.is_finite() {
            continue;
        }
        if coords.last().map_or(true, |&last| !coords_equal(last, c)) {
            coords.push(c);
        }
    }

    if coords.len() < 3 {
        return None;
    }

    let first = coords[0];
    let last = coords[coords.len() - 1];
    if !coords_equal(first, last) {
        let gap = ((first.x - last.x).powi(2) + (first.y - last.y).powi(2)).sqrt();
        if gap > TOLERANCE * 1_000.0 {
            warn!(points = coords.len(), gap_meters = gap, "Auto-closing unclosed ring");
        }
        coords.push(first);
    } else {
        let n = coords.len();
        coords[n - 1] = first;
    }

    if coords.len() < 4 {
        return None;
    }

    let ring = LineString::new(coords);
    let area = Polygon::new(ring.clone(), vec![]).unsigned_area();
    if area <= AREA_EPSILON {
        return None;
    }
    Some(ring)
}

/// Calcule un convex hull à partir des sommets d'un polygone
pub fn convex_hull_fallback(polygon: &Polygon) -> Option<Polygon> {
    let points: Vec<Point> = polygon
        .exterior()
        .0
        .iter()
        .filter(|c| c.x.is_finite() && c.y.is_finite())
        .map(|c| Point::new(c.x, c.y))
        .collect();

    if points.len() < 3 {
        return None;
    }

    let hull = MultiPoint::new(points).convex_hull();
    (hull.unsigned_area() > AREA_EPSILON).then_some(hull)
}

/// Compare deux coordonnées avec tolérance
fn coords_equal(a: Coord, b: Coord) -> bool {
    (a.x - b.x).abs() < TOLERANCE && (a.y - b.y).abs() < TOLERANCE
}
