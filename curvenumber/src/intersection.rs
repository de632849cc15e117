//! Superposition de la couche d'occupation du sol et de la couche des groupes hydrologiques

use geo::Area;
use tracing::{debug, info};

use crate::aoi::Aoi;
use crate::cancel::StageContext;
use crate::geometry::{
    clip_to_area, difference_with_area, dissolved_area, from_multi_polygon, merge, union,
};
use crate::types::{fields, FieldType, Layer, Value};
use crate::CnError;

/// Nom de la couche combinée occupation du sol + HSG
pub const INTERSECTED_LAYER_NAME: &str = "Intersected_LandUse_HSG";

/// Nom de la couche de sol préparée
pub const SOIL_LAYER_NAME: &str = "Soil_Layer_HSG";

/// Écart relatif d'aire en dessous duquel deux couches couvrent la même emprise
const AREA_RELATIVE_TOLERANCE: f64 = 1e-9;

/// Combine occupation du sol et sol: découpe de la plus grande couche à
/// l'emprise de la plus petite, union, puis suppression des features sans `source`.
///
/// # Errors
///
/// `CnError::FieldNotFound` si `source` ou `HSG` manque; erreurs géométriques;
/// `CnError::Cancelled`.
pub fn intersect(land_use: Layer, soil: Layer, ctx: &mut StageContext) -> Result<Layer, CnError> {
    land_use.field_index(fields::SOURCE)?;
    soil.field_index(fields::HSG)?;
    info!(
        land_use = land_use.len(),
        soil = soil.len(),
        "Intersecting land-use and soil layers"
    );

    let (land_use, soil) = clip_larger_to_smaller(land_use, soil)?;
    ctx.checkpoint()?;

    let mut combined = union(&land_use, &soil)?;
    combined.name = INTERSECTED_LAYER_NAME.to_string();
    ctx.checkpoint()?;

    let source_idx = combined.field_index(fields::SOURCE)?;
    let before = combined.len();
    combined.retain_features(|f| !f.get(source_idx).is_null());
    debug!(
        dropped = before - combined.len(),
        kept = combined.len(),
        "Dropped features without land-use source"
    );
    Ok(combined)
}

/// Découpe la couche d'aire dissoute la plus grande à l'emprise de la plus petite.
/// Deux couches d'aire égale sont retournées telles quelles.
pub fn clip_larger_to_smaller(a: Layer, b: Layer) -> Result<(Layer, Layer), CnError> {
    let area_a = dissolved_area(&a)?;
    let area_b = dissolved_area(&b)?;
    let (size_a, size_b) = (area_a.unsigned_area(), area_b.unsigned_area());

    let scale = size_a.max(size_b).max(1.0);
    if (size_a - size_b).abs() <= scale * AREA_RELATIVE_TOLERANCE {
        return Ok((a, b));
    }

    if size_a > size_b {
        debug!(larger = %a.name, smaller = %b.name, "Clipping larger layer to smaller extent");
        Ok((clip_to_area(&a, &area_b)?, b))
    } else {
        debug!(larger = %b.name, smaller = %a.name, "Clipping larger layer to smaller extent");
        Ok((a, clip_to_area(&b, &area_a)?))
    }
}

/// Prépare la couche de sol pour une AOI: découpe, puis sous-couche d'eau
/// (`HSG = 0`) sur toute la partie de l'AOI non couverte par le sol.
pub fn prepare_soil_layer(soil: &Layer, aoi: &Aoi) -> Result<Layer, CnError> {
    soil.field_index(fields::HSG)?;
    let aoi_area = aoi.to_multi_polygon();
    let clipped = clip_to_area(soil, &aoi_area)?;

    let mut water = Layer::new("water_underlay");
    water.add_field(fields::HSG, FieldType::Integer);
    if let Some(geometry) = from_multi_polygon(aoi_area) {
        water.push_feature(Some(geometry), vec![Value::Int(0)]);
    }
    let coverage = dissolved_area(&clipped)?;
    let water = difference_with_area(&water, &coverage)?;

    debug!(
        soil = clipped.len(),
        water = water.len(),
        "Soil layer prepared"
    );
    Ok(merge(&[water, clipped], SOIL_LAYER_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{BoundingRect, Geometry, Rect};

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Option<Geometry> {
        Some(Geometry::Polygon(Rect::new((x0, y0), (x1, y1)).to_polygon()))
    }

    fn land_use() -> Layer {
        let mut layer = Layer::new("LandUse_Layer");
        layer.add_field(fields::SOURCE, FieldType::Text);
        layer.add_field(fields::LAND_USE_CODE, FieldType::Integer);
        layer.push_feature(rect(0.0, 0.0, 10.0, 10.0), vec!["Lesy".into(), Value::Int(30000)]);
        layer
    }

    fn soil(x1: f64) -> Layer {
        let mut layer = Layer::new("Soil");
        layer.add_field(fields::HSG, FieldType::Integer);
        layer.push_feature(rect(0.0, 0.0, x1 / 2.0, 10.0), vec![Value::Int(2)]);
        layer.push_feature(rect(x1 / 2.0, 0.0, x1, 10.0), vec![Value::Int(4)]);
        layer
    }

    #[test]
    fn test_intersect_carries_both_attributes() {
        let combined = intersect(land_use(), soil(10.0), &mut StageContext::default()).unwrap();
        assert_eq!(combined.len(), 2);
        let hsg = combined.field_index(fields::HSG).unwrap();
        let code = combined.field_index(fields::LAND_USE_CODE).unwrap();
        for feature in combined.features() {
            assert_eq!(feature.get(code), &Value::Int(30000));
            assert!(!feature.get(hsg).is_null());
        }
    }

    #[test]
    fn test_larger_soil_is_clipped() {
        // Sol plus étendu que l'occupation du sol: pas de feature sans source
        let combined = intersect(land_use(), soil(40.0), &mut StageContext::default()).unwrap();
        let source = combined.field_index(fields::SOURCE).unwrap();
        assert!(combined.features().iter().all(|f| !f.get(source).is_null()));
        let total: f64 = combined
            .features()
            .iter()
            .map(|f| f.geometry.as_ref().unwrap().unsigned_area())
            .sum();
        assert!((total - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_intersect_requires_hsg() {
        let err = intersect(land_use(), Layer::new("Soil"), &mut StageContext::default()).unwrap_err();
        assert!(matches!(err, CnError::FieldNotFound { .. }));
    }

    #[test]
    fn test_prepare_soil_fills_water() {
        let aoi = Aoi::Extent(Rect::new((0.0, 0.0), (20.0, 10.0)));
        let prepared = prepare_soil_layer(&soil(10.0), &aoi).unwrap();
        let hsg = prepared.field_index(fields::HSG).unwrap();

        let water: f64 = prepared
            .features()
            .iter()
            .filter(|f| f.get(hsg) == &Value::Int(0))
            .map(|f| f.geometry.as_ref().unwrap().unsigned_area())
            .sum();
        assert!((water - 100.0).abs() < 1e-6);
        assert_eq!(prepared.len(), 3);
    }

    #[test]
    fn test_soil_only_piece_is_dropped() {
        // Même aire, emprises décalées: pas de découpe, la partie propre au sol n'a pas de source
        let mut soil = Layer::new("Soil");
        soil.add_field(fields::HSG, FieldType::Integer);
        soil.push_feature(rect(5.0, 0.0, 15.0, 10.0), vec![Value::Int(3)]);

        let combined = intersect(land_use(), soil, &mut StageContext::default()).unwrap();
        assert_eq!(combined.len(), 2);

        let source = combined.field_index(fields::SOURCE).unwrap();
        let hsg = combined.field_index(fields::HSG).unwrap();
        assert!(combined.features().iter().all(|f| !f.get(source).is_null()));

        let total: f64 = combined
            .features()
            .iter()
            .map(|f| f.geometry.as_ref().unwrap().unsigned_area())
            .sum();
        assert!((total - 100.0).abs() < 1e-6);

        let with_soil: Vec<_> = combined.features().iter().filter(|f| !f.get(hsg).is_null()).collect();
        assert_eq!(with_soil.len(), 1);
        let bbox = with_soil[0].geometry.as_ref().unwrap().bounding_rect().unwrap();
        assert!((bbox.min().x - 5.0).abs() < 1e-9 && (bbox.max().x - 10.0).abs() < 1e-9);
    }
}
