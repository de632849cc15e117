//! Zone d'intérêt (AOI): polygone ou emprise rectangulaire en S-JTSK

use geo::{BoundingRect, Coord, MultiPolygon, Rect};
use tracing::debug;

use crate::geometry::dissolve;
use crate::types::{fields, FieldType, Layer, EPSG_SJTSK};
use crate::CnError;

/// Bornes de la République tchèque en S-JTSK (mètres)
pub const CZ_X_MIN: f64 = -920_000.0;
pub const CZ_X_MAX: f64 = -420_000.0;
pub const CZ_Y_MIN: f64 = -1_230_000.0;
pub const CZ_Y_MAX: f64 = -920_000.0;

/// Zone d'intérêt d'un calcul
#[derive(Debug, Clone, PartialEq)]
pub enum Aoi {
    /// Polygone dessiné ou importé
    Polygon(MultiPolygon),
    /// Emprise rectangulaire
    Extent(Rect),
}

impl Aoi {
    /// Emprise à partir des bornes `ymin, xmin, ymax, xmax`
    pub fn from_extent(ymin: f64, xmin: f64, ymax: f64, xmax: f64) -> Self {
        Self::Extent(Rect::new(Coord { x: xmin, y: ymin }, Coord { x: xmax, y: ymax }))
    }

    /// AOI polygonale à partir d'une couche (union de ses surfaces)
    pub fn from_layer(layer: &Layer) -> Result<Self, CnError> {
        if layer.epsg != EPSG_SJTSK {
            return Err(CnError::configuration(format!(
                "AOI layer '{}' is in EPSG:{}, expected EPSG:{}",
                layer.name, layer.epsg, EPSG_SJTSK
            )));
        }
        let area = crate::geometry::dissolved_area(layer)?;
        if area.0.is_empty() {
            return Err(CnError::configuration(format!(
                "AOI layer '{}' has no polygon geometry",
                layer.name
            )));
        }
        Ok(Self::Polygon(area))
    }

    pub fn to_multi_polygon(&self) -> MultiPolygon {
        match self {
            Self::Polygon(mp) => mp.clone(),
            Self::Extent(rect) => MultiPolygon::new(vec![rect.to_polygon()]),
        }
    }

    pub fn bounding_rect(&self) -> Option<Rect> {
        match self {
            Self::Polygon(mp) => mp.bounding_rect(),
            Self::Extent(rect) => Some(*rect),
        }
    }

    /// Vérifie que l'AOI est non vide et contenue dans les bornes tchèques
    pub fn validate(&self) -> Result<(), CnError> {
        let rect = self
            .bounding_rect()
            .ok_or_else(|| CnError::configuration("AOI is empty"))?;
        let (min, max) = (rect.min(), rect.max());

        if min.x < CZ_X_MIN || max.x > CZ_X_MAX || min.y < CZ_Y_MIN || max.y > CZ_Y_MAX {
            return Err(CnError::configuration(format!(
                "AOI extent ({:.0}, {:.0}, {:.0}, {:.0}) is outside the Czech Republic S-JTSK bounds",
                min.x, min.y, max.x, max.y
            )));
        }
        if rect.width() <= 0.0 || rect.height() <= 0.0 {
            return Err(CnError::configuration("AOI extent has zero width or height"));
        }
        Ok(())
    }
}

/// Fusionne une couche en une seule feature portant uniquement `ID = 1`
pub fn dissolve_aoi(layer: &Layer) -> Result<Layer, CnError> {
    let mut dissolved = dissolve(layer, &[])?;
    let idx = dissolved.add_field(fields::ID, FieldType::Integer);
    for feature in dissolved.features_mut() {
        feature.set(idx, 1i64);
    }
    debug!(layer = %layer.name, features = layer.len(), "AOI dissolved");
    Ok(dissolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use geo::{Area, Geometry};

    #[test]
    fn test_validate_inside_bounds() {
        let aoi = Aoi::from_extent(-1_100_000.0, -700_000.0, -1_099_000.0, -699_000.0);
        assert!(aoi.validate().is_ok());
    }

    #[test]
    fn test_validate_outside_bounds() {
        let aoi = Aoi::from_extent(0.0, 0.0, 10.0, 10.0);
        assert!(matches!(aoi.validate(), Err(CnError::Configuration(_))));
    }

    #[test]
    fn test_dissolve_aoi_single_feature_with_id() {
        let mut layer = Layer::new("aoi");
        layer.add_field("name", FieldType::Text);
        for x in [0.0, 10.0] {
            layer.push_feature(
                Some(Geometry::Polygon(Rect::new((x, 0.0), (x + 10.0, 10.0)).to_polygon())),
                vec![Value::from("part")],
            );
        }

        let dissolved = dissolve_aoi(&layer).unwrap();
        assert_eq!(dissolved.len(), 1);
        assert_eq!(dissolved.schema().names().collect::<Vec<_>>(), vec!["ID"]);
        assert_eq!(dissolved.features()[0].get(0), &Value::Int(1));
        let area = dissolved.features()[0].geometry.as_ref().unwrap().unsigned_area();
        assert!((area - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_from_layer_rejects_other_crs() {
        let mut layer = Layer::new("aoi");
        layer.epsg = 4326;
        assert!(Aoi::from_layer(&layer).is_err());
    }
}
