//! Empilement des couches d'occupation du sol en une couche composite sans recouvrement
//!
//! Étapes: marquage `source`, classification, buffer, édition des codes,
//! découpe à l'AOI, dissolution des couches bufferisées, puis empilement par
//! priorité décroissante contre l'union cumulée des couches déjà placées.

use std::collections::HashSet;

use geo::MultiPolygon;
use tracing::{debug, info, warn};

use crate::aoi::Aoi;
use crate::cancel::StageContext;
use crate::error::WarningKind;
use crate::geometry::{
    clip_to_area, difference_pair, dissolve, from_multi_polygon, merge, repair_multi_polygon,
    to_multi_polygon, union_pair, GeometryKind,
};
use crate::rules::{
    apply_increment, buffer_layer, classify_by_keyword, AttributeEditRule, BufferRule,
    ClassificationRules,
};
use crate::types::{fields, FieldType, Layer, Value};
use crate::CnError;

const STAGE: &str = "stack";

/// Nom de la couche traitée par la règle d'incrément dédiée plutôt que par mot-clé
pub const LPIS_LAYER_NAME: &str = "LPIS_layer";

/// Nom de la couche composite produite
pub const LANDUSE_LAYER_NAME: &str = "LandUse_Layer";

/// Ordre d'empilement: le premier nom est le plus prioritaire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackingOrder {
    names: Vec<String>,
}

impl StackingOrder {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn priority_of(&self, layer_name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == layer_name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Ensemble des règles d'un empilement, chargées une fois
#[derive(Debug, Clone, Default)]
pub struct StackingConfig {
    pub classification: ClassificationRules,
    /// Règle d'incrément de la couche `LPIS_layer`
    pub lpis: Option<AttributeEditRule>,
    /// Règles d'édition de code par couche (priment sur la classification)
    pub edits: Vec<AttributeEditRule>,
    pub buffers: Vec<BufferRule>,
    pub order: StackingOrder,
}

impl StackingConfig {
    fn edit_rule(&self, layer_name: &str) -> Option<&AttributeEditRule> {
        self.edits.iter().find(|r| r.layer_name == layer_name)
    }

    fn buffer_rule(&self, layer_name: &str) -> Option<&BufferRule> {
        self.buffers.iter().find(|r| r.layer_name == layer_name)
    }
}

/// Empileur: applique une configuration à un ensemble de couches sources pour une AOI
pub struct LandUseStacker<'a> {
    config: &'a StackingConfig,
    aoi: &'a Aoi,
}

impl<'a> LandUseStacker<'a> {
    pub fn new(config: &'a StackingConfig, aoi: &'a Aoi) -> Self {
        Self { config, aoi }
    }

    /// Exécute l'empilement complet. Les couches d'entrée sont consommées.
    ///
    /// # Errors
    ///
    /// `CnError::Configuration` si l'ordre d'empilement est vide ou si aucune
    /// couche ne peut être empilée; erreurs géométriques non récupérables;
    /// `CnError::Cancelled`.
    pub fn run(&self, layers: Vec<Layer>, ctx: &mut StageContext) -> Result<Layer, CnError> {
        if self.config.order.is_empty() {
            return Err(CnError::configuration("stacking order is empty"));
        }
        info!(layers = layers.len(), "Stacking land-use layers");

        let mut prepared = Vec::with_capacity(layers.len());
        let mut buffered: HashSet<String> = HashSet::new();

        for mut layer in layers {
            ctx.checkpoint()?;
            tag(&mut layer);
            self.classify(&mut layer, ctx)?;
            let (layer, was_buffered) = self.buffer(layer, ctx)?;
            if was_buffered {
                buffered.insert(layer.name.clone());
            }
            let layer = self.edit_code(layer, ctx)?;
            prepared.push(layer);
        }

        let aoi_area = self.aoi.to_multi_polygon();
        let mut clipped = Vec::with_capacity(prepared.len());
        for layer in prepared {
            ctx.checkpoint()?;
            let mut layer = match clip_to_area(&layer, &aoi_area) {
                Ok(c) => c,
                Err(e) => {
                    ctx.warn(
                        STAGE,
                        &layer.name,
                        None,
                        WarningKind::LayerKeptOriginal,
                        format!("clipping to AOI failed ({}), keeping original", e),
                    );
                    layer
                }
            };
            if buffered.contains(&layer.name) {
                layer = dissolve_or_keep(layer, ctx);
            }
            clipped.push(layer);
        }

        let composite = self.stack(clipped, ctx)?;
        info!(
            features = composite.len(),
            "Stacking completed"
        );
        Ok(composite)
    }

    fn classify(&self, layer: &mut Layer, ctx: &mut StageContext) -> Result<(), CnError> {
        if layer.name != LPIS_LAYER_NAME {
            if classify_by_keyword(layer, &self.config.classification).is_none() {
                debug!(layer = %layer.name, "No keyword rule matches layer");
            }
            return Ok(());
        }

        let Some(rule) = &self.config.lpis else {
            ctx.warn(
                STAGE,
                &layer.name,
                None,
                WarningKind::LayerKeptOriginal,
                "no LPIS attribute configuration, land-use code left empty",
            );
            return Ok(());
        };
        self.keep_on_failure(layer, ctx, |l, c| apply_increment(l, rule, c))
    }

    fn buffer(&self, layer: Layer, ctx: &mut StageContext) -> Result<(Layer, bool), CnError> {
        let Some(rule) = self.config.buffer_rule(&layer.name) else {
            return Ok((layer, false));
        };
        match buffer_layer(&layer, rule, ctx) {
            Ok(buffered) => {
                debug!(layer = %layer.name, "Successful buffering");
                Ok((buffered, true))
            }
            Err(CnError::Cancelled) => Err(CnError::Cancelled),
            Err(e) => {
                ctx.warn(
                    STAGE,
                    &layer.name,
                    None,
                    WarningKind::LayerKeptOriginal,
                    format!("buffering failed ({}), keeping original", e),
                );
                Ok((layer, false))
            }
        }
    }

    fn edit_code(&self, mut layer: Layer, ctx: &mut StageContext) -> Result<Layer, CnError> {
        if let Some(rule) = self.config.edit_rule(&layer.name) {
            self.keep_on_failure(&mut layer, ctx, |l, c| apply_increment(l, rule, c))?;
        }
        Ok(layer)
    }

    /// Applique une édition; en cas d'échec la couche reste intacte et un avertissement est émis
    fn keep_on_failure<F>(&self, layer: &mut Layer, ctx: &mut StageContext, edit: F) -> Result<(), CnError>
    where
        F: FnOnce(&mut Layer, &mut StageContext) -> Result<(), CnError>,
    {
        let backup = layer.clone();
        match edit(layer, ctx) {
            Ok(()) => Ok(()),
            Err(CnError::Cancelled) => Err(CnError::Cancelled),
            Err(e) => {
                *layer = backup;
                ctx.warn(
                    STAGE,
                    &layer.name,
                    None,
                    WarningKind::LayerKeptOriginal,
                    format!("attribute edit failed ({}), keeping original", e),
                );
                Ok(())
            }
        }
    }

    /// Empile les couches polygonales par priorité; chaque feature est privée de
    /// la surface déjà attribuée aux features plus prioritaires.
    fn stack(&self, layers: Vec<Layer>, ctx: &mut StageContext) -> Result<Layer, CnError> {
        let mut ordered: Vec<(usize, Layer)> = Vec::new();
        for layer in layers {
            if !is_polygon_layer(&layer) {
                ctx.warn(
                    STAGE,
                    &layer.name,
                    None,
                    WarningKind::UnsupportedGeometry,
                    "layer is not a polygon layer, not stacked",
                );
                continue;
            }
            match self.config.order.priority_of(&layer.name) {
                Some(priority) => ordered.push((priority, layer)),
                None => ctx.warn(
                    STAGE,
                    &layer.name,
                    None,
                    WarningKind::UnstackedLayer,
                    "layer not found in the stacking list",
                ),
            }
        }
        if ordered.is_empty() {
            return Err(CnError::configuration(
                "no input layer matches the stacking list",
            ));
        }
        ordered.sort_by_key(|(priority, _)| *priority);

        let mut claimed = MultiPolygon::new(Vec::new());
        let mut residuals = Vec::with_capacity(ordered.len());

        for (priority, layer) in ordered {
            let mut residual = layer.empty_like(layer.name.clone());
            for feature in layer.features() {
                ctx.checkpoint()?;
                let Some(mp) = feature.geometry.as_ref().and_then(to_multi_polygon) else {
                    continue;
                };
                let rest = difference_pair(&mp, &claimed)?;
                let Some(geometry) = from_multi_polygon(rest.clone()) else {
                    continue;
                };
                claimed = union_pair(&claimed, &rest)?;
                residual.push_feature_with_id(feature.id, Some(geometry), feature.attributes().to_vec());
            }
            claimed = repair_multi_polygon(&claimed);

            debug!(
                layer = %layer.name,
                priority = priority + 1,
                input = layer.len(),
                kept = residual.len(),
                "Layer stacked"
            );
            warn_if_emptied(&layer, &residual);
            residuals.push(residual);
        }

        let mut composite = merge(&residuals, LANDUSE_LAYER_NAME);
        composite.retain_features(|f| f.geometry.is_some());
        Ok(composite)
    }
}

/// Dissout une couche bufferisée par `source` et `LandUse_code`; en cas d'échec
/// la couche est conservée non dissoute avec un avertissement
fn dissolve_or_keep(layer: Layer, ctx: &mut StageContext) -> Layer {
    match dissolve(&layer, &[fields::SOURCE, fields::LAND_USE_CODE]) {
        Ok(dissolved) => dissolved,
        Err(e) => {
            ctx.warn(
                STAGE,
                &layer.name,
                None,
                WarningKind::LayerKeptOriginal,
                format!("dissolving buffered layer failed ({}), keeping it undissolved", e),
            );
            layer
        }
    }
}

/// Ajoute `source` (nom de la couche) et le champ `LandUse_code` vide
fn tag(layer: &mut Layer) {
    let source_idx = layer.add_field(fields::SOURCE, FieldType::Text);
    layer.add_field(fields::LAND_USE_CODE, FieldType::Integer);
    let source = Value::from(layer.name.as_str());
    for feature in layer.features_mut() {
        feature.set(source_idx, source.clone());
    }
}

fn is_polygon_layer(layer: &Layer) -> bool {
    layer
        .features()
        .iter()
        .filter_map(|f| f.geometry.as_ref())
        .all(|g| GeometryKind::of(g) == GeometryKind::Polygon)
}

fn warn_if_emptied(layer: &Layer, residual: &Layer) {
    if residual.is_empty() && !layer.is_empty() {
        warn!(layer = %layer.name, "Layer fully covered by higher priority layers");
    }
}
