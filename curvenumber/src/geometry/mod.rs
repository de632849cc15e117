//! Opérations spatiales sur les couches: clip, buffer, dissolve, union, difference, merge
//!
//! Les opérations booléennes s'appuient sur `geo::BooleanOps`. Un échec
//! (panique du moteur sur une géométrie invalide) est converti en
//! `CnError::Geometry`; les unions et différences sont retentées une fois
//! après réparation des opérandes.
//!
//! Règles aux frontières: deux polygones qui ne partagent qu'une arête ont une
//! intersection d'aire nulle; les morceaux d'aire inférieure à `AREA_EPSILON`
//! sont supprimés de tous les résultats.

pub mod buffer;
pub mod repair;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use geo::{
    Area, BooleanOps, BoundingRect, Contains, Geometry, Intersects, MultiLineString, MultiPoint,
    MultiPolygon, Point, Polygon, Rect,
};
use tracing::{debug, warn};

use crate::types::{Field, Layer, Schema, Value};
use crate::CnError;

pub use buffer::{buffer_geometry, buffer_polygons};
pub use repair::repair_multi_polygon;

/// Aire en dessous de laquelle une géométrie est considérée vide (m²)
pub const AREA_EPSILON: f64 = 1e-6;

/// Catégorie de géométrie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Point,
    Line,
    Polygon,
    Other,
}

impl GeometryKind {
    pub fn of(geometry: &Geometry) -> Self {
        match geometry {
            Geometry::Point(_) | Geometry::MultiPoint(_) => Self::Point,
            Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => Self::Line,
            Geometry::Polygon(_)
            | Geometry::MultiPolygon(_)
            | Geometry::Rect(_)
            | Geometry::Triangle(_) => Self::Polygon,
            Geometry::GeometryCollection(_) => Self::Other,
        }
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Point => "point",
            Self::Line => "line",
            Self::Polygon => "polygon",
            Self::Other => "collection",
        };
        f.write_str(label)
    }
}

/// Partie surfacique d'une géométrie
pub fn to_multi_polygon(geometry: &Geometry) -> Option<MultiPolygon> {
    match geometry {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        Geometry::Rect(r) => Some(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::Triangle(t) => Some(MultiPolygon::new(vec![t.to_polygon()])),
        Geometry::GeometryCollection(gc) => {
            let polygons: Vec<Polygon> = gc
                .0
                .iter()
                .filter_map(to_multi_polygon)
                .flat_map(|mp| mp.0)
                .collect();
            (!polygons.is_empty()).then(|| MultiPolygon::new(polygons))
        }
        _ => None,
    }
}

/// Géométrie résultat: None si vide, Polygon si une seule partie
pub fn from_multi_polygon(mp: MultiPolygon) -> Option<Geometry> {
    let parts: Vec<Polygon> = mp
        .0
        .into_iter()
        .filter(|p| p.unsigned_area() > AREA_EPSILON)
        .collect();
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next().map(Geometry::Polygon),
        _ => Some(Geometry::MultiPolygon(MultiPolygon::new(parts))),
    }
}

/// Vrai si la géométrie est absente ou d'aire nulle (pour les surfaces)
pub fn is_empty_geometry(geometry: Option<&Geometry>) -> bool {
    match geometry {
        None => true,
        Some(g) => match GeometryKind::of(g) {
            GeometryKind::Polygon => g.unsigned_area() <= AREA_EPSILON,
            _ => g.bounding_rect().is_none(),
        },
    }
}

/// Exécute une opération du moteur géométrique en capturant ses paniques
pub(crate) fn guarded<F>(operation: &str, op: F) -> Result<MultiPolygon, CnError>
where
    F: FnOnce() -> MultiPolygon,
{
    catch_unwind(AssertUnwindSafe(op)).map_err(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "geometry engine panicked".to_string());
        CnError::geometry(operation, reason)
    })
}

/// Opération booléenne binaire, retentée une fois après réparation des opérandes
fn boolean_with_repair<F>(
    operation: &str,
    a: &MultiPolygon,
    b: &MultiPolygon,
    op: F,
) -> Result<MultiPolygon, CnError>
where
    F: Fn(&MultiPolygon, &MultiPolygon) -> MultiPolygon,
{
    match guarded(operation, || op(a, b)) {
        Ok(result) => Ok(result),
        Err(e) => {
            warn!(operation = operation, error = %e, "Boolean operation failed, retrying after repair");
            let a = repair_multi_polygon(a);
            let b = repair_multi_polygon(b);
            guarded(operation, || op(&a, &b))
        }
    }
}

pub fn union_pair(a: &MultiPolygon, b: &MultiPolygon) -> Result<MultiPolygon, CnError> {
    if a.0.is_empty() {
        return Ok(b.clone());
    }
    if b.0.is_empty() {
        return Ok(a.clone());
    }
    boolean_with_repair("union", a, b, |x, y| x.union(y))
}

pub fn difference_pair(a: &MultiPolygon, b: &MultiPolygon) -> Result<MultiPolygon, CnError> {
    if a.0.is_empty() || b.0.is_empty() || !bbox_intersects(a, b) {
        return Ok(a.clone());
    }
    boolean_with_repair("difference", a, b, |x, y| x.difference(y))
}

pub fn intersection_pair(a: &MultiPolygon, b: &MultiPolygon) -> Result<MultiPolygon, CnError> {
    if a.0.is_empty() || b.0.is_empty() || !bbox_intersects(a, b) {
        return Ok(MultiPolygon::new(Vec::new()));
    }
    boolean_with_repair("intersection", a, b, |x, y| x.intersection(y))
}

fn bbox_intersects(a: &MultiPolygon, b: &MultiPolygon) -> bool {
    match (a.bounding_rect(), b.bounding_rect()) {
        (Some(ra), Some(rb)) => ra.intersects(&rb),
        _ => false,
    }
}

/// Union de plusieurs surfaces par réduction pairée
pub fn union_all(mut parts: Vec<MultiPolygon>) -> Result<MultiPolygon, CnError> {
    parts.retain(|p| !p.0.is_empty());
    if parts.is_empty() {
        return Ok(MultiPolygon::new(Vec::new()));
    }
    while parts.len() > 1 {
        let mut next = Vec::with_capacity(parts.len() / 2 + 1);
        let mut iter = parts.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => next.push(union_pair(&a, &b)?),
                None => next.push(a),
            }
        }
        parts = next;
    }
    Ok(parts.pop().unwrap_or_else(|| MultiPolygon::new(Vec::new())))
}

/// Surface dissoute de toutes les géométries surfaciques d'une couche
pub fn dissolved_area(layer: &Layer) -> Result<MultiPolygon, CnError> {
    union_all(
        layer
            .features()
            .iter()
            .filter_map(|f| f.geometry.as_ref().and_then(to_multi_polygon))
            .collect(),
    )
}

/// Découpe chaque feature par une surface. Les features entièrement hors de la
/// surface sont supprimées; les attributs sont conservés.
pub fn clip_to_area(input: &Layer, area: &MultiPolygon) -> Result<Layer, CnError> {
    let mut output = input.empty_like(input.name.clone());
    let Some(area_bbox) = area.bounding_rect() else {
        return Ok(output);
    };

    for feature in input.features() {
        let Some(geometry) = &feature.geometry else {
            continue;
        };
        if !geometry
            .bounding_rect()
            .map_or(false, |r| r.intersects(&area_bbox))
        {
            continue;
        }

        let clipped = match GeometryKind::of(geometry) {
            GeometryKind::Polygon => {
                let mp = to_multi_polygon(geometry).unwrap_or_else(|| MultiPolygon::new(vec![]));
                from_multi_polygon(intersection_pair(&mp, area)?)
            }
            GeometryKind::Line => clip_lines(geometry, area),
            GeometryKind::Point => clip_points(geometry, area),
            GeometryKind::Other => None,
        };

        if let Some(clipped) = clipped {
            output.push_feature_with_id(feature.id, Some(clipped), feature.attributes().to_vec());
        }
    }

    debug!(
        layer = %input.name,
        input = input.len(),
        output = output.len(),
        "Clipped layer"
    );
    Ok(output)
}

/// Découpe une couche par l'union des géométries d'une couche masque
pub fn clip(input: &Layer, mask: &Layer) -> Result<Layer, CnError> {
    let area = dissolved_area(mask)?;
    clip_to_area(input, &area)
}

fn clip_lines(geometry: &Geometry, area: &MultiPolygon) -> Option<Geometry> {
    let mls = match geometry {
        Geometry::LineString(ls) => MultiLineString::new(vec![ls.clone()]),
        Geometry::MultiLineString(mls) => mls.clone(),
        Geometry::Line(l) => MultiLineString::new(vec![geo::LineString::new(vec![l.start, l.end])]),
        _ => return None,
    };
    let clipped = catch_unwind(AssertUnwindSafe(|| area.clip(&mls, false))).ok()?;
    let mut lines: Vec<_> = clipped.0.into_iter().filter(|ls| ls.0.len() >= 2).collect();
    match lines.len() {
        0 => None,
        1 => lines.pop().map(Geometry::LineString),
        _ => Some(Geometry::MultiLineString(MultiLineString::new(lines))),
    }
}

fn clip_points(geometry: &Geometry, area: &MultiPolygon) -> Option<Geometry> {
    let points: Vec<Point> = match geometry {
        Geometry::Point(p) => vec![*p],
        Geometry::MultiPoint(mp) => mp.0.clone(),
        _ => return None,
    };
    let mut kept: Vec<Point> = points.into_iter().filter(|p| area.contains(p)).collect();
    match kept.len() {
        0 => None,
        1 => kept.pop().map(Geometry::Point),
        _ => Some(Geometry::MultiPoint(MultiPoint::new(kept))),
    }
}

/// Retire de chaque feature surfacique la surface donnée; les résultats vides sont supprimés
pub fn difference_with_area(input: &Layer, area: &MultiPolygon) -> Result<Layer, CnError> {
    let mut output = input.empty_like(input.name.clone());
    for feature in input.features() {
        let Some(mp) = feature.geometry.as_ref().and_then(to_multi_polygon) else {
            continue;
        };
        if let Some(rest) = from_multi_polygon(difference_pair(&mp, area)?) {
            output.push_feature_with_id(feature.id, Some(rest), feature.attributes().to_vec());
        }
    }
    Ok(output)
}

/// Différence de couches: `a` privée de la surface dissoute de `b`
pub fn difference(a: &Layer, b: &Layer) -> Result<Layer, CnError> {
    let area = dissolved_area(b)?;
    difference_with_area(a, &area)
}

/// Fusionne les features par valeurs des champs de regroupement.
/// Sans champ, la couche entière devient une seule feature sans attribut.
pub fn dissolve(layer: &Layer, by_fields: &[&str]) -> Result<Layer, CnError> {
    let indices: Vec<usize> = by_fields
        .iter()
        .map(|name| layer.field_index(name))
        .collect::<Result<_, _>>()?;

    let schema = Schema::new(
        indices
            .iter()
            .map(|&i| layer.schema().fields()[i].clone())
            .collect(),
    );

    // Groupes dans l'ordre de première apparition
    let mut groups: Vec<(Vec<Option<String>>, Vec<Value>, Vec<MultiPolygon>)> = Vec::new();
    for feature in layer.features() {
        let Some(mp) = feature.geometry.as_ref().and_then(to_multi_polygon) else {
            continue;
        };
        let key: Vec<Option<String>> = indices.iter().map(|&i| feature.get(i).as_key()).collect();
        match groups.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, _, parts)) => parts.push(mp),
            None => {
                let values = indices.iter().map(|&i| feature.get(i).clone()).collect();
                groups.push((key, values, vec![mp]));
            }
        }
    }

    let mut output = Layer::with_schema(layer.name.clone(), schema);
    output.epsg = layer.epsg;
    for (_, values, parts) in groups {
        if let Some(geometry) = from_multi_polygon(union_all(parts)?) {
            output.push_feature(Some(geometry), values);
        }
    }
    Ok(output)
}

/// Nom de champ libre dans un schéma (suffixe `_2`, `_3`... en cas de collision)
fn unique_name(schema: &Schema, name: &str) -> String {
    if !schema.contains(name) {
        return name.to_string();
    }
    (2..)
        .map(|i| format!("{}_{}", name, i))
        .find(|candidate| !schema.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}

/// Union (overlay) de deux couches surfaciques: une feature par combinaison
/// maximale de recouvrement. Les parties propres à une seule couche portent des
/// valeurs nulles pour les champs de l'autre. Les champs de `b` homonymes d'un
/// champ de `a` sont suffixés `_2`.
pub fn union(a: &Layer, b: &Layer) -> Result<Layer, CnError> {
    let mut schema = a.schema().clone();
    let b_fields: Vec<Field> = b
        .schema()
        .fields()
        .iter()
        .map(|f| Field::new(unique_name(&schema, &f.name), f.field_type))
        .collect();
    for field in b_fields {
        schema.push(field);
    }

    let a_width = a.schema().len();
    let b_width = b.schema().len();
    let null_a = vec![Value::Null; a_width];
    let null_b = vec![Value::Null; b_width];

    let a_parts: Vec<(usize, MultiPolygon, Option<Rect>)> = surface_parts(a);
    let b_parts: Vec<(usize, MultiPolygon, Option<Rect>)> = surface_parts(b);
    let a_area = union_all(a_parts.iter().map(|(_, mp, _)| mp.clone()).collect())?;
    let b_area = union_all(b_parts.iter().map(|(_, mp, _)| mp.clone()).collect())?;

    let mut output = Layer::with_schema(format!("{}_union_{}", a.name, b.name), schema);
    output.epsg = a.epsg;

    for (ai, a_geom, a_bbox) in &a_parts {
        let a_attrs = a.features()[*ai].attributes();
        for (bi, b_geom, b_bbox) in &b_parts {
            let overlaps = match (a_bbox, b_bbox) {
                (Some(ra), Some(rb)) => ra.intersects(rb),
                _ => false,
            };
            if !overlaps {
                continue;
            }
            if let Some(piece) = from_multi_polygon(intersection_pair(a_geom, b_geom)?) {
                let mut attrs = a_attrs.to_vec();
                attrs.extend_from_slice(b.features()[*bi].attributes());
                output.push_feature(Some(piece), attrs);
            }
        }
        if let Some(rest) = from_multi_polygon(difference_pair(a_geom, &b_area)?) {
            let mut attrs = a_attrs.to_vec();
            attrs.extend_from_slice(&null_b);
            output.push_feature(Some(rest), attrs);
        }
    }

    for (bi, b_geom, _) in &b_parts {
        if let Some(rest) = from_multi_polygon(difference_pair(b_geom, &a_area)?) {
            let mut attrs = null_a.clone();
            attrs.extend_from_slice(b.features()[*bi].attributes());
            output.push_feature(Some(rest), attrs);
        }
    }

    debug!(
        a = %a.name,
        b = %b.name,
        features = output.len(),
        "Union overlay completed"
    );
    Ok(output)
}

fn surface_parts(layer: &Layer) -> Vec<(usize, MultiPolygon, Option<Rect>)> {
    layer
        .features()
        .iter()
        .enumerate()
        .filter_map(|(i, f)| {
            let mp = f.geometry.as_ref().and_then(to_multi_polygon)?;
            let bbox = mp.bounding_rect();
            Some((i, mp, bbox))
        })
        .collect()
}

/// Concatène des couches: schéma = union ordonnée des schémas, géométries inchangées
pub fn merge(layers: &[Layer], name: &str) -> Layer {
    let mut schema = Schema::default();
    for layer in layers {
        for field in layer.schema().fields() {
            schema.push(field.clone());
        }
    }

    let mut output = Layer::with_schema(name, schema.clone());
    if let Some(first) = layers.first() {
        output.epsg = first.epsg;
    }
    for layer in layers {
        for feature in layer.features() {
            let attrs = layer.project_attributes(feature, &schema);
            output.push_feature(feature.geometry.clone(), attrs);
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Geometry {
        Geometry::Polygon(Rect::new((x0, y0), (x1, y1)).to_polygon())
    }

    fn layer_with(name: &str, field: &str, items: Vec<(Geometry, i64)>) -> Layer {
        let mut layer = Layer::new(name);
        layer.add_field(field, FieldType::Integer);
        for (geom, v) in items {
            layer.push_feature(Some(geom), vec![Value::Int(v)]);
        }
        layer
    }

    fn total_area(layer: &Layer) -> f64 {
        layer
            .features()
            .iter()
            .filter_map(|f| f.geometry.as_ref())
            .map(|g| g.unsigned_area())
            .sum()
    }

    #[test]
    fn test_clip_drops_outside_features() {
        let input = layer_with(
            "in",
            "v",
            vec![(rect(0.0, 0.0, 10.0, 10.0), 1), (rect(50.0, 50.0, 60.0, 60.0), 2)],
        );
        let mask = layer_with("mask", "m", vec![(rect(5.0, 0.0, 20.0, 10.0), 0)]);

        let clipped = clip(&input, &mask).unwrap();
        assert_eq!(clipped.len(), 1);
        assert!((total_area(&clipped) - 50.0).abs() < 1e-6);
        assert_eq!(clipped.features()[0].get(0), &Value::Int(1));
    }

    #[test]
    fn test_dissolve_without_fields_collapses_layer() {
        let input = layer_with(
            "in",
            "v",
            vec![(rect(0.0, 0.0, 10.0, 10.0), 1), (rect(10.0, 0.0, 20.0, 10.0), 2)],
        );
        let dissolved = dissolve(&input, &[]).unwrap();
        assert_eq!(dissolved.len(), 1);
        assert!(dissolved.schema().is_empty());
        assert!((total_area(&dissolved) - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_dissolve_by_field_groups() {
        let input = layer_with(
            "in",
            "v",
            vec![
                (rect(0.0, 0.0, 10.0, 10.0), 1),
                (rect(5.0, 0.0, 15.0, 10.0), 1),
                (rect(30.0, 0.0, 40.0, 10.0), 2),
            ],
        );
        let dissolved = dissolve(&input, &["v"]).unwrap();
        assert_eq!(dissolved.len(), 2);
        assert_eq!(dissolved.features()[0].get(0), &Value::Int(1));
        assert!((total_area(&dissolved) - 250.0).abs() < 1e-6);
    }

    #[test]
    fn test_dissolve_missing_field() {
        let input = layer_with("in", "v", vec![(rect(0.0, 0.0, 1.0, 1.0), 1)]);
        assert!(matches!(
            dissolve(&input, &["nope"]),
            Err(CnError::FieldNotFound { .. })
        ));
    }

    #[test]
    fn test_union_pieces_and_nulls() {
        let a = layer_with("a", "LandUse_code", vec![(rect(0.0, 0.0, 10.0, 10.0), 30000)]);
        let b = layer_with("b", "HSG", vec![(rect(5.0, 0.0, 15.0, 10.0), 2)]);

        let result = union(&a, &b).unwrap();
        assert_eq!(result.schema().names().collect::<Vec<_>>(), vec!["LandUse_code", "HSG"]);
        assert_eq!(result.len(), 3);
        assert!((total_area(&result) - 150.0).abs() < 1e-6);

        let both = result
            .features()
            .iter()
            .filter(|f| !f.get(0).is_null() && !f.get(1).is_null())
            .count();
        let only_b = result
            .features()
            .iter()
            .filter(|f| f.get(0).is_null() && f.get(1) == &Value::Int(2))
            .count();
        assert_eq!(both, 1);
        assert_eq!(only_b, 1);
    }

    #[test]
    fn test_union_renames_duplicate_fields() {
        let a = layer_with("a", "ID", vec![(rect(0.0, 0.0, 1.0, 1.0), 1)]);
        let b = layer_with("b", "ID", vec![(rect(0.0, 0.0, 1.0, 1.0), 2)]);
        let result = union(&a, &b).unwrap();
        assert_eq!(result.schema().names().collect::<Vec<_>>(), vec!["ID", "ID_2"]);
    }

    #[test]
    fn test_shared_edge_is_not_an_overlap() {
        let a = layer_with("a", "v", vec![(rect(0.0, 0.0, 10.0, 10.0), 1)]);
        let b = layer_with("b", "w", vec![(rect(10.0, 0.0, 20.0, 10.0), 2)]);
        let result = union(&a, &b).unwrap();
        // Aucune pièce commune: seulement les deux parties propres
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_difference() {
        let a = layer_with("a", "v", vec![(rect(0.0, 0.0, 10.0, 10.0), 1)]);
        let b = layer_with("b", "w", vec![(rect(0.0, 0.0, 10.0, 5.0), 2)]);
        let result = difference(&a, &b).unwrap();
        assert_eq!(result.len(), 1);
        assert!((total_area(&result) - 50.0).abs() < 1e-6);

        let covered = difference(&b, &a).unwrap();
        assert!(covered.is_empty());
    }

    #[test]
    fn test_merge_concatenates_schemas() {
        let a = layer_with("a", "x", vec![(rect(0.0, 0.0, 1.0, 1.0), 1)]);
        let b = layer_with("b", "y", vec![(rect(2.0, 2.0, 3.0, 3.0), 2)]);
        let merged = merge(&[a, b], "merged");

        assert_eq!(merged.schema().names().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(merged.features()[0].attributes(), &[Value::Int(1), Value::Null]);
        assert_eq!(merged.features()[1].attributes(), &[Value::Null, Value::Int(2)]);
    }

    #[test]
    fn test_clip_lines_and_points() {
        let mut input = Layer::new("mixed");
        input.push_feature(
            Some(Geometry::LineString(geo::LineString::from(vec![(-5.0, 5.0), (15.0, 5.0)]))),
            vec![],
        );
        input.push_feature(Some(Geometry::Point(Point::new(50.0, 50.0))), vec![]);
        let area = MultiPolygon::new(vec![Rect::new((0.0, 0.0), (10.0, 10.0)).to_polygon()]);

        let clipped = clip_to_area(&input, &area).unwrap();
        assert_eq!(clipped.len(), 1);
        assert!(matches!(clipped.features()[0].geometry, Some(Geometry::LineString(_))));
    }
}
