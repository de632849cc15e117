//! Règles d'attributs: classification par mot-clé, incréments de code, distances de buffer
//!
//! Les règles sont chargées une fois (voir le crate applicatif) puis appliquées
//! couche par couche. Les valeurs des tables de règles sont comparées via
//! [`Value::as_key`], ce qui rend `3`, `3.0` et `"3"` équivalents.

use std::collections::HashMap;

use tracing::debug;

use crate::cancel::StageContext;
use crate::error::WarningKind;
use crate::geometry::buffer_geometry;
use crate::types::{fields, FieldType, Layer, Value};
use crate::CnError;

const STAGE: &str = "stack";

/// `{keywords, code}`: une couche dont le nom contient un des mots-clés reçoit le code
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordRule {
    pub keywords: Vec<String>,
    pub code: i64,
}

impl KeywordRule {
    pub fn new<S: Into<String>>(keywords: impl IntoIterator<Item = S>, code: i64) -> Self {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
            code,
        }
    }

    /// Vrai si un mot-clé est une sous-chaîne (insensible à la casse) du nom
    pub fn matches(&self, layer_name: &str) -> bool {
        let name = layer_name.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| !k.is_empty())
            .any(|k| name.contains(&k.to_lowercase()))
    }
}

/// Liste ordonnée de règles de classification; la première qui correspond gagne
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationRules {
    rules: Vec<KeywordRule>,
}

impl ClassificationRules {
    pub fn new(rules: Vec<KeywordRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[KeywordRule] {
        &self.rules
    }

    /// Code de la première règle correspondant au nom de couche
    pub fn code_for(&self, layer_name: &str) -> Option<i64> {
        self.rules
            .iter()
            .find(|r| r.matches(layer_name))
            .map(|r| r.code)
    }
}

/// Code = code de base + incrément selon la valeur d'un attribut
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEditRule {
    pub layer_name: String,
    pub base_use_code: i64,
    pub controlling_attribute: String,
    increments: HashMap<String, i64>,
}

impl AttributeEditRule {
    pub fn new(
        layer_name: impl Into<String>,
        base_use_code: i64,
        controlling_attribute: impl Into<String>,
        increments: impl IntoIterator<Item = (Value, i64)>,
    ) -> Self {
        Self {
            layer_name: layer_name.into(),
            base_use_code,
            controlling_attribute: controlling_attribute.into(),
            increments: increments
                .into_iter()
                .filter_map(|(k, v)| k.as_key().map(|k| (k, v)))
                .collect(),
        }
    }

    /// Incrément pour une valeur d'attribut (None si la valeur est inconnue)
    pub fn increment(&self, value: &Value) -> Option<i64> {
        value.as_key().and_then(|k| self.increments.get(&k).copied())
    }
}

/// Niveau de buffer: ensemble de valeurs d'attribut et distance associée
#[derive(Debug, Clone, PartialEq)]
pub struct BufferLevel {
    pub priority: Option<i64>,
    values: Vec<String>,
    pub distance: f64,
}

impl BufferLevel {
    pub fn new(priority: Option<i64>, values: impl IntoIterator<Item = Value>, distance: f64) -> Self {
        Self {
            priority,
            values: values.into_iter().filter_map(|v| v.as_key()).collect(),
            distance,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.iter().any(|v| v == key)
    }
}

/// Configuration de buffer d'une couche linéaire ou ponctuelle
#[derive(Debug, Clone, PartialEq)]
pub struct BufferRule {
    pub layer_name: String,
    /// Attribut de contrôle; None pour un buffer uniforme
    pub controlling_attribute: Option<String>,
    pub default_buffer: f64,
    pub levels: Vec<BufferLevel>,
}

impl BufferRule {
    /// Buffer uniforme à `default_buffer`
    pub fn uniform(layer_name: impl Into<String>, default_buffer: f64) -> Self {
        Self {
            layer_name: layer_name.into(),
            controlling_attribute: None,
            default_buffer,
            levels: Vec::new(),
        }
    }

    pub fn by_attribute(
        layer_name: impl Into<String>,
        controlling_attribute: impl Into<String>,
        default_buffer: f64,
        levels: Vec<BufferLevel>,
    ) -> Self {
        let attribute: String = controlling_attribute.into();
        // "", "None" et "NaN" signifient: pas d'attribut de contrôle
        let controlling_attribute = match attribute.trim() {
            "" | "None" | "NaN" => None,
            _ => Some(attribute),
        };
        Self {
            layer_name: layer_name.into(),
            controlling_attribute,
            default_buffer,
            levels,
        }
    }
}

/// Affecte `LandUse_code` à toutes les features selon le nom de la couche.
/// Le champ est toujours créé; sans règle correspondante les valeurs restent inchangées.
pub fn classify_by_keyword(layer: &mut Layer, rules: &ClassificationRules) -> Option<i64> {
    let idx = layer.add_field(fields::LAND_USE_CODE, FieldType::Integer);
    let code = rules.code_for(&layer.name)?;
    for feature in layer.features_mut() {
        feature.set(idx, code);
    }
    debug!(layer = %layer.name, code = code, "Layer classified by keyword");
    Some(code)
}

/// Applique `code = base + incrément(valeur)` à chaque feature.
///
/// # Errors
///
/// `CnError::Configuration` si l'attribut de contrôle est absent du schéma.
/// Une valeur manquante ou inconnue donne un incrément nul et un avertissement.
pub fn apply_increment(
    layer: &mut Layer,
    rule: &AttributeEditRule,
    ctx: &mut StageContext,
) -> Result<(), CnError> {
    let attr_idx = layer.schema().index_of(&rule.controlling_attribute).ok_or_else(|| {
        CnError::configuration(format!(
            "attribute '{}' not found in layer '{}'",
            rule.controlling_attribute, layer.name
        ))
    })?;
    let code_idx = layer.add_field(fields::LAND_USE_CODE, FieldType::Integer);
    let layer_name = layer.name.clone();

    let mut pending = Vec::new();
    for feature in layer.features_mut() {
        let value = feature.get(attr_idx);
        let increment = match rule.increment(value) {
            Some(inc) => inc,
            None => {
                let message = if value.is_null() {
                    format!("'{}' is null, increment 0", rule.controlling_attribute)
                } else {
                    format!(
                        "'{}' value '{}' has no increment, increment 0",
                        rule.controlling_attribute, value
                    )
                };
                pending.push((feature.id, message));
                0
            }
        };
        feature.set(code_idx, rule.base_use_code + increment);
    }

    for (id, message) in pending {
        ctx.warn(STAGE, &layer_name, Some(id), WarningKind::MissingAttribute, message);
    }
    debug!(
        layer = %layer_name,
        base_code = rule.base_use_code,
        attribute = %rule.controlling_attribute,
        "Land-use code edited from attribute"
    );
    Ok(())
}

/// Distance du premier niveau contenant la valeur, sinon la distance par défaut
pub fn select_buffer_distance(value: &Value, levels: &[BufferLevel], default_distance: f64) -> f64 {
    value
        .as_key()
        .and_then(|key| levels.iter().find(|level| level.contains(&key)))
        .map_or(default_distance, |level| level.distance)
}

/// Bufferise une couche de points ou de lignes selon sa règle.
/// Les features de type non supporté sont ignorées avec un avertissement.
///
/// # Errors
///
/// `CnError::Configuration` si l'attribut de contrôle est absent du schéma,
/// `CnError::Cancelled` si l'annulation est demandée.
pub fn buffer_layer(layer: &Layer, rule: &BufferRule, ctx: &mut StageContext) -> Result<Layer, CnError> {
    let attr_idx = match &rule.controlling_attribute {
        Some(attribute) => Some(layer.schema().index_of(attribute).ok_or_else(|| {
            CnError::configuration(format!(
                "attribute '{}' not found in layer '{}'",
                attribute, layer.name
            ))
        })?),
        None => None,
    };

    let mut output = layer.empty_like(layer.name.clone());
    for feature in layer.features() {
        ctx.checkpoint()?;
        let Some(geometry) = &feature.geometry else {
            continue;
        };
        let distance = match attr_idx {
            Some(idx) => select_buffer_distance(feature.get(idx), &rule.levels, rule.default_buffer),
            None => rule.default_buffer,
        };

        match buffer_geometry(geometry, distance) {
            Ok(Some(buffered)) => {
                output.push_feature_with_id(feature.id, Some(buffered), feature.attributes().to_vec())
            }
            Ok(None) => {}
            Err(e) => ctx.warn(
                STAGE,
                &layer.name,
                Some(feature.id),
                WarningKind::UnsupportedGeometry,
                e.to_string(),
            ),
        }
    }

    debug!(
        layer = %layer.name,
        input = layer.len(),
        output = output.len(),
        "Layer buffered"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, Geometry, LineString, Rect};

    fn line_layer(name: &str, values: &[&str]) -> Layer {
        let mut layer = Layer::new(name);
        layer.add_field("TYP", FieldType::Text);
        for (i, v) in values.iter().enumerate() {
            let y = i as f64 * 100.0;
            layer.push_feature(
                Some(Geometry::LineString(LineString::from(vec![(0.0, y), (10.0, y)]))),
                vec![Value::from(*v)],
            );
        }
        layer
    }

    #[test]
    fn test_keyword_classification() {
        let rules = ClassificationRules::new(vec![
            KeywordRule::new(["voda"], 60000),
            KeywordRule::new(["les"], 30000),
        ]);
        let mut layer = line_layer("Lesy_kategorizovane", &["a", "b"]);

        assert_eq!(classify_by_keyword(&mut layer, &rules), Some(30000));
        let idx = layer.field_index(fields::LAND_USE_CODE).unwrap();
        assert!(layer.features().iter().all(|f| f.get(idx) == &Value::Int(30000)));
    }

    #[test]
    fn test_keyword_no_match_leaves_layer() {
        let rules = ClassificationRules::new(vec![KeywordRule::new(["voda"], 60000)]);
        let mut layer = line_layer("Silnice", &["a"]);
        assert_eq!(classify_by_keyword(&mut layer, &rules), None);
        assert!(layer.features()[0].get(1).is_null());
    }

    #[test]
    fn test_apply_increment() {
        let mut layer = line_layer("LPIS_layer", &["2", "7", ""]);
        let rule = AttributeEditRule::new(
            "LPIS_layer",
            10000,
            "TYP",
            vec![(Value::Int(2), 100), (Value::Float(7.0), 700)],
        );
        let mut ctx = StageContext::default();
        apply_increment(&mut layer, &rule, &mut ctx).unwrap();

        let idx = layer.field_index(fields::LAND_USE_CODE).unwrap();
        let codes: Vec<_> = layer.features().iter().map(|f| f.get(idx).clone()).collect();
        assert_eq!(codes, vec![Value::Int(10100), Value::Int(10700), Value::Int(10000)]);
        assert_eq!(ctx.warnings().len(), 1);
    }

    #[test]
    fn test_apply_increment_missing_attribute() {
        let mut layer = line_layer("Silnice", &["a"]);
        let rule = AttributeEditRule::new("Silnice", 1, "KATEGORIE", Vec::new());
        let err = apply_increment(&mut layer, &rule, &mut StageContext::default()).unwrap_err();
        assert!(matches!(err, CnError::Configuration(_)));
    }

    #[test]
    fn test_select_buffer_distance() {
        let levels = vec![
            BufferLevel::new(Some(1), vec![Value::from("dálnice"), Value::from("silnice I. třídy")], 12.0),
            BufferLevel::new(Some(2), vec![Value::from("silnice II. třídy")], 6.0),
        ];
        assert_eq!(select_buffer_distance(&Value::from("silnice II. třídy"), &levels, 2.0), 6.0);
        assert_eq!(select_buffer_distance(&Value::from("dálnice"), &levels, 2.0), 12.0);
        assert_eq!(select_buffer_distance(&Value::from("polní cesta"), &levels, 2.0), 2.0);
        assert_eq!(select_buffer_distance(&Value::Null, &levels, 2.0), 2.0);
    }

    #[test]
    fn test_buffer_layer_by_attribute() {
        let layer = line_layer("Silnice", &["A", "B"]);
        let rule = BufferRule::by_attribute(
            "Silnice",
            "TYP",
            1.0,
            vec![BufferLevel::new(None, vec![Value::from("A")], 5.0)],
        );
        let buffered = buffer_layer(&layer, &rule, &mut StageContext::default()).unwrap();
        assert_eq!(buffered.len(), 2);

        let areas: Vec<f64> = buffered
            .features()
            .iter()
            .map(|f| f.geometry.as_ref().unwrap().unsigned_area())
            .collect();
        assert!((areas[0] - 100.0).abs() < 1e-6);
        assert!((areas[1] - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_buffer_skips_polygons() {
        let mut layer = line_layer("Silnice", &["A"]);
        layer.push_feature(
            Some(Geometry::Polygon(Rect::new((0.0, 0.0), (1.0, 1.0)).to_polygon())),
            vec![Value::from("A")],
        );
        let rule = BufferRule::by_attribute("Silnice", "None", 1.0, Vec::new());
        assert!(rule.controlling_attribute.is_none());

        let mut ctx = StageContext::default();
        let buffered = buffer_layer(&layer, &rule, &mut ctx).unwrap();
        assert_eq!(buffered.len(), 1);
        assert_eq!(ctx.warnings()[0].kind, WarningKind::UnsupportedGeometry);
    }
}
