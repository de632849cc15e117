//! Table CN et affectation des Curve Numbers (CN2, CN3)

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

use crate::cancel::StageContext;
use crate::error::WarningKind;
use crate::table::{self, parse_number, Table};
use crate::types::{fields, FieldType, Layer, Value};
use crate::CnError;

const STAGE: &str = "cn";

/// Nom de la couche produite
pub const CN_LAYER_NAME: &str = "CN_Layer";

/// CN conventionnel des plans d'eau (HSG 0)
pub const WATER_BODY_CN: f64 = 99.0;

/// Champs conservés par [`prune_cn_layer_fields`]
pub const DEFAULT_KEEP_FIELDS: &[&str] = &[
    "Shape_Area",
    "SHAPE_Area",
    "OBJECTID",
    "fid_zbg",
    "FID",
    "Shape_Length",
    fields::SOURCE,
    fields::LAND_USE_CODE,
    fields::HSG,
];

/// Table code d'occupation du sol -> CN pour les groupes hydrologiques 1 à 4
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CnTable {
    values: HashMap<i64, [f64; 4]>,
}

impl CnTable {
    pub fn new(values: HashMap<i64, [f64; 4]>) -> Self {
        Self { values }
    }

    /// Charge une table CN (5 colonnes: code, CN A, CN B, CN C, CN D)
    pub fn load(path: &Path) -> Result<Self, CnError> {
        let table = table::read_table(path)?;
        let cn = Self::from_table(table, &path.display().to_string())?;
        info!(file = %path.display(), codes = cn.len(), "CN table loaded");
        Ok(cn)
    }

    /// Parse le texte d'une table CN
    pub fn parse(text: &str, file: &str) -> Result<Self, CnError> {
        Self::from_table(table::parse_table(text), file)
    }

    fn from_table(table: Table, file: &str) -> Result<Self, CnError> {
        // La première ligne est un en-tête seulement si sa première cellule n'est pas un entier
        let first_row = table.header.as_ref().or_else(|| table.rows.first());
        let has_header = first_row
            .and_then(|row| row.first())
            .map_or(false, |cell| cell.trim().parse::<i64>().is_err());
        let table = table.with_header(has_header);
        let delimiter = table.delimiter;

        let mut values = HashMap::with_capacity(table.rows.len());
        for (i, row) in table.rows.iter().enumerate() {
            let line = i + 1 + usize::from(has_header);
            if row.len() < 5 {
                return Err(CnError::parse_error(
                    file,
                    format!("line {}: expected 5 columns, found {}", line, row.len()),
                ));
            }
            let code: i64 = row[0].trim().parse().map_err(|_| {
                CnError::parse_error(file, format!("line {}: invalid land-use code '{}'", line, row[0]))
            })?;

            let mut cn = [0.0; 4];
            for (slot, cell) in cn.iter_mut().zip(&row[1..5]) {
                *slot = parse_number(cell, delimiter).ok_or_else(|| {
                    CnError::parse_error(file, format!("line {}: invalid CN value '{}'", line, cell))
                })?;
            }
            values.insert(code, cn);
        }

        Ok(Self { values })
    }

    pub fn get(&self, code: i64) -> Option<&[f64; 4]> {
        self.values.get(&code)
    }

    pub fn contains(&self, code: i64) -> bool {
        self.values.contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// CN2 pour un couple (code, HSG). None si une valeur manque ou n'est pas résolue.
    pub fn cn2(&self, land_use: &Value, hsg: &Value) -> Option<f64> {
        if land_use.is_null() || hsg.is_null() {
            return None;
        }
        let code = land_use.as_i64()?;
        let hsg = hsg.as_i64()?;
        if hsg == 0 {
            return Some(WATER_BODY_CN);
        }
        if !(1..=4).contains(&hsg) {
            return None;
        }
        self.get(code).map(|cn| cn[(hsg - 1) as usize])
    }
}

/// CN pour une humidité antécédente III à partir du CN II
pub fn cn3_from_cn2(cn2: f64) -> f64 {
    23.0 * cn2 / (10.0 + 0.13 * cn2)
}

/// Construit la couche CN: mêmes géométries et champs que la source, plus `CN2` et `CN3`.
///
/// # Errors
///
/// `CnError::FieldNotFound` si `LandUse_code` ou `HSG` manque; `CnError::Cancelled`.
pub fn create_cn_layer(source: &Layer, table: &CnTable, ctx: &mut StageContext) -> Result<Layer, CnError> {
    let code_idx = source.field_index(fields::LAND_USE_CODE)?;
    let hsg_idx = source.field_index(fields::HSG)?;

    let mut output = source.empty_like(CN_LAYER_NAME);
    let cn2_idx = output.add_field(fields::CN2, FieldType::Double);
    let cn3_idx = output.add_field(fields::CN3, FieldType::Double);

    let mut unresolved = 0usize;
    for feature in source.features() {
        ctx.checkpoint()?;
        let land_use = feature.get(code_idx);
        let hsg = feature.get(hsg_idx);
        let cn2 = table.cn2(land_use, hsg);

        if cn2.is_none() {
            unresolved += 1;
            let (kind, message) = if land_use.is_null() || hsg.is_null() {
                (
                    WarningKind::MissingAttribute,
                    format!("LandUse_code={} HSG={}, CN left empty", land_use, hsg),
                )
            } else {
                (
                    WarningKind::UnresolvedLandUseCode,
                    format!("no CN for LandUse_code={} HSG={}", land_use, hsg),
                )
            };
            ctx.warn(STAGE, &source.name, Some(feature.id), kind, message);
        }

        let mut attrs = feature.attributes().to_vec();
        attrs.resize(output.schema().len(), Value::Null);
        attrs[cn2_idx] = Value::from(cn2);
        attrs[cn3_idx] = Value::from(cn2.map(cn3_from_cn2));
        output.push_feature_with_id(feature.id, feature.geometry.clone(), attrs);
    }

    info!(
        features = output.len(),
        unresolved = unresolved,
        "CN layer created"
    );
    Ok(output)
}

/// Supprime tous les champs hors de la liste [`DEFAULT_KEEP_FIELDS`]
pub fn prune_cn_layer_fields(layer: &mut Layer) {
    let before = layer.schema().len();
    layer.retain_fields(DEFAULT_KEEP_FIELDS);
    debug!(
        layer = %layer.name,
        removed = before - layer.schema().len(),
        "Fields pruned"
    );
}
