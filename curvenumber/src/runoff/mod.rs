//! Calcul du ruissellement SCS-CN par feature
//!
//! ```text
//! A  = 25.4 * (1000 / CN - 10)             rétention potentielle (mm)
//! Ia = alpha * A                           abstraction initiale (mm)
//! h  = (P - Ia)^2 / (P - Ia + A)           hauteur ruisselée (mm)
//! V  = h * aire(m²) * 1e6 / 1e9            volume (m³)
//! ```
//!
//! Deux modes: direct (hauteurs de pluie fournies) et pondéré (hauteurs et
//! probabilités de forme d'averse issues du modèle hydrologique distant,
//! voir [`weighted`]).

pub mod weighted;

use geo::Area;
use tracing::{debug, info};

use crate::cancel::StageContext;
use crate::error::WarningKind;
use crate::types::{fields, FieldType, Layer};
use crate::CnError;

pub use weighted::{
    HydroModelService, JobHandle, JobRequest, JobStatus, PollingPolicy, WeightedRunoff,
    WeightedStage, WeightedTable, SHAPE_TYPES,
};

const STAGE: &str = "runoff";

/// Nom de la couche produite
pub const RUNOFF_LAYER_NAME: &str = "Runoff_Layer";

/// Aire minimale d'une feature conservée (m²)
pub const MIN_SHAPE_AREA: f64 = 0.009;

/// Hauteur et volume ruisselés
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Runoff {
    pub height_mm: f64,
    pub volume_m3: f64,
}

/// Rétention potentielle maximale (mm)
pub fn potential_retention(cn: f64) -> f64 {
    25.4 * (1000.0 / cn - 10.0)
}

/// Hauteur ruisselée (mm) pour un CN, un coefficient d'abstraction et une pluie (mm)
pub fn runoff_height(cn: f64, abstraction_coefficient: f64, rainfall_mm: f64) -> f64 {
    let retention = potential_retention(cn);
    let excess = rainfall_mm - abstraction_coefficient * retention;
    excess * excess / (excess + retention)
}

/// Volume (m³) d'une hauteur ruisselée (mm) sur une aire (m²)
pub fn runoff_volume(height_mm: f64, area_m2: f64) -> f64 {
    let area_mm2 = area_m2 * 1_000_000.0;
    height_mm * area_mm2 / 1_000_000_000.0
}

/// Ruissellement pour CN2 et CN3 sur une même aire et une même pluie
pub fn calculate_runoff(
    cn2: f64,
    cn3: f64,
    area_m2: f64,
    rainfall_mm: f64,
    abstraction_coefficient: f64,
) -> (Runoff, Runoff) {
    let compute = |cn: f64| {
        let height_mm = runoff_height(cn, abstraction_coefficient, rainfall_mm);
        Runoff {
            height_mm,
            volume_m3: runoff_volume(height_mm, area_m2),
        }
    };
    (compute(cn2), compute(cn3))
}

/// Mode de calcul
#[derive(Debug, Clone, PartialEq)]
pub enum RunoffMode {
    /// Hauteurs de pluie fournies par l'utilisateur (mm)
    Direct { depths_mm: Vec<f64> },
    /// Périodes de retour (`N2`, `N5`...) évaluées par le modèle distant
    Weighted { return_periods: Vec<String> },
}

/// Paramètres du calcul de ruissellement
#[derive(Debug, Clone, PartialEq)]
pub struct RunoffParams {
    pub mode: RunoffMode,
    /// Coefficient d'abstraction initiale (recommandé 0.1 à 0.3)
    pub abstraction_coefficient: f64,
}

impl RunoffParams {
    pub fn direct(depths_mm: Vec<f64>, abstraction_coefficient: f64) -> Self {
        Self {
            mode: RunoffMode::Direct { depths_mm },
            abstraction_coefficient,
        }
    }

    pub fn weighted<S: Into<String>>(
        return_periods: impl IntoIterator<Item = S>,
        abstraction_coefficient: f64,
    ) -> Self {
        Self {
            mode: RunoffMode::Weighted {
                return_periods: return_periods.into_iter().map(Into::into).collect(),
            },
            abstraction_coefficient,
        }
    }

    pub fn validate(&self) -> Result<(), CnError> {
        if !(self.abstraction_coefficient > 0.0 && self.abstraction_coefficient.is_finite()) {
            return Err(CnError::configuration(format!(
                "abstraction coefficient must be > 0, got {}",
                self.abstraction_coefficient
            )));
        }
        match &self.mode {
            RunoffMode::Direct { depths_mm } => {
                if depths_mm.is_empty() {
                    return Err(CnError::configuration("no rainfall depth configured"));
                }
                if let Some(d) = depths_mm.iter().find(|d| !(**d > 0.0 && d.is_finite())) {
                    return Err(CnError::configuration(format!(
                        "rainfall depth must be > 0, got {}",
                        d
                    )));
                }
            }
            RunoffMode::Weighted { return_periods } => {
                if return_periods.iter().all(|p| p.trim().is_empty()) {
                    return Err(CnError::configuration("no return period configured"));
                }
            }
        }
        Ok(())
    }

    /// Colonnes de sortie, une entrée par hauteur ou période
    pub fn output_columns(&self) -> Vec<RunoffColumns> {
        match &self.mode {
            RunoffMode::Direct { depths_mm } => {
                let numbered = depths_mm.len() > 1;
                (1..=depths_mm.len())
                    .map(|i| RunoffColumns::new(numbered.then(|| i.to_string()).as_deref()))
                    .collect()
            }
            RunoffMode::Weighted { return_periods } => return_periods
                .iter()
                .map(|p| RunoffColumns::new(Some(p)))
                .collect(),
        }
    }
}

/// Noms des champs de hauteur et de volume pour une hauteur de pluie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunoffColumns {
    pub cn2_height: String,
    pub cn3_height: String,
    pub cn2_volume: String,
    pub cn3_volume: String,
}

impl RunoffColumns {
    /// `CN2_runoff_height_mm` sans libellé, `CN2_<label>_runoff_height_mm` sinon
    pub fn new(label: Option<&str>) -> Self {
        let name = |prefix: &str, suffix: &str| match label {
            Some(label) => format!("{}_{}_{}", prefix, label, suffix),
            None => format!("{}_{}", prefix, suffix),
        };
        Self {
            cn2_height: name("CN2", "runoff_height_mm"),
            cn3_height: name("CN3", "runoff_height_mm"),
            cn2_volume: name("CN2", "runoff_volume_m3"),
            cn3_volume: name("CN3", "runoff_volume_m3"),
        }
    }

    fn names(&self) -> [&str; 4] {
        [
            self.cn2_height.as_str(),
            self.cn3_height.as_str(),
            self.cn2_volume.as_str(),
            self.cn3_volume.as_str(),
        ]
    }
}

/// Recalcule `SHAPE_Area` depuis la géométrie. Les features sans géométrie reçoivent 0,
/// celles de moins de [`MIN_SHAPE_AREA`] m² sont supprimées. Retourne le nombre supprimé.
pub fn update_shape_area(layer: &mut Layer) -> usize {
    let idx = layer.add_field(fields::SHAPE_AREA, FieldType::Double);
    let before = layer.len();
    layer.retain_features(|f| {
        f.geometry
            .as_ref()
            .map_or(true, |g| g.unsigned_area() >= MIN_SHAPE_AREA)
    });
    for feature in layer.features_mut() {
        let area = feature.geometry.as_ref().map_or(0.0, |g| g.unsigned_area());
        feature.set(idx, area);
    }
    let removed = before - layer.len();
    if removed > 0 {
        debug!(layer = %layer.name, removed = removed, "Removed sliver features");
    }
    removed
}

/// Crée les champs de sortie (idempotent): colonnes CN2/CN3 puis `V_<période>_m3` en mode pondéré
pub fn create_runoff_fields(layer: &mut Layer, params: &RunoffParams) {
    if let RunoffMode::Weighted { return_periods } = &params.mode {
        for (period, columns) in return_periods.iter().zip(params.output_columns()) {
            layer.add_field(&weighted_volume_field(period), FieldType::Double);
            for name in columns.names() {
                layer.add_field(name, FieldType::Double);
            }
        }
        return;
    }
    for columns in params.output_columns() {
        for name in columns.names() {
            layer.add_field(name, FieldType::Double);
        }
    }
}

/// Nom du champ de volume pondéré d'une période de retour
pub fn weighted_volume_field(period: &str) -> String {
    format!("V_{}_m3", period)
}

/// Calcule hauteurs et volumes CN2/CN3 pour chaque hauteur de pluie.
/// Les features de CN absent ou négatif sont laissées intactes avec un avertissement.
///
/// # Errors
///
/// `CnError::FieldNotFound` si un champ requis manque; `CnError::Cancelled`.
pub fn calculate_base_runoff(
    layer: &mut Layer,
    depths: &[(RunoffColumns, f64)],
    abstraction_coefficient: f64,
    ctx: &mut StageContext,
) -> Result<(), CnError> {
    let cn2_idx = layer.field_index(fields::CN2)?;
    let cn3_idx = layer.field_index(fields::CN3)?;
    let area_idx = layer.field_index(fields::SHAPE_AREA)?;
    let targets: Vec<([usize; 4], f64)> = depths
        .iter()
        .map(|(columns, depth)| {
            Ok((
                [
                    layer.field_index(&columns.cn2_height)?,
                    layer.field_index(&columns.cn3_height)?,
                    layer.field_index(&columns.cn2_volume)?,
                    layer.field_index(&columns.cn3_volume)?,
                ],
                *depth,
            ))
        })
        .collect::<Result<_, CnError>>()?;

    let layer_name = layer.name.clone();
    let mut skipped = Vec::new();
    for feature in layer.features_mut() {
        ctx.checkpoint()?;
        let (cn2, cn3) = match (feature.get(cn2_idx).as_f64(), feature.get(cn3_idx).as_f64()) {
            (Some(cn2), Some(cn3)) if cn2 > 0.0 && cn3 > 0.0 => (cn2, cn3),
            (cn2, cn3) => {
                skipped.push((feature.id, cn2, cn3));
                continue;
            }
        };
        let area = feature.get(area_idx).as_f64().unwrap_or(0.0);

        for ([h2, h3, v2, v3], depth) in &targets {
            let (r2, r3) = calculate_runoff(cn2, cn3, area, *depth, abstraction_coefficient);
            feature.set(*h2, r2.height_mm);
            feature.set(*h3, r3.height_mm);
            feature.set(*v2, r2.volume_m3);
            feature.set(*v3, r3.volume_m3);
        }
    }

    for (id, cn2, cn3) in skipped {
        let (kind, message) = match (cn2, cn3) {
            (Some(cn2), Some(cn3)) => (
                WarningKind::InvalidCurveNumber,
                format!("invalid CN (CN2={}, CN3={}), runoff skipped", cn2, cn3),
            ),
            _ => (
                WarningKind::MissingAttribute,
                "CN2 or CN3 is empty, runoff skipped".to_string(),
            ),
        };
        ctx.warn(STAGE, &layer_name, Some(id), kind, message);
    }
    Ok(())
}

/// Calcul du ruissellement en mode direct: aire, champs, puis hauteurs et volumes
///
/// # Errors
///
/// `CnError::Configuration` si le mode n'est pas direct ou si les paramètres
/// sont invalides; erreurs de [`calculate_base_runoff`].
pub fn compute_direct_runoff(
    cn_layer: Layer,
    params: &RunoffParams,
    ctx: &mut StageContext,
) -> Result<Layer, CnError> {
    params.validate()?;
    let RunoffMode::Direct { depths_mm } = &params.mode else {
        return Err(CnError::configuration(
            "direct runoff requires rainfall depths",
        ));
    };

    let mut layer = cn_layer;
    layer.name = RUNOFF_LAYER_NAME.to_string();
    update_shape_area(&mut layer);
    create_runoff_fields(&mut layer, params);

    let depths: Vec<(RunoffColumns, f64)> = params
        .output_columns()
        .into_iter()
        .zip(depths_mm.iter().copied())
        .collect();
    calculate_base_runoff(&mut layer, &depths, params.abstraction_coefficient, ctx)?;

    info!(
        features = layer.len(),
        depths = depths_mm.len(),
        "Direct runoff computed"
    );
    Ok(layer)
}

/// Somme d'un champ numérique (les valeurs nulles sont ignorées)
pub fn total(layer: &Layer, field: &str) -> Result<f64, CnError> {
    let idx = layer.field_index(field)?;
    Ok(layer
        .features()
        .iter()
        .filter_map(|f| f.get(idx).as_f64())
        .sum())
}
