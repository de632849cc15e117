//! Exécution d'un projet: empilement -> sol -> superposition -> CN -> ruissellement
//!
//! Chaque étape écrit sa couche en GeoJSON dans le répertoire de sortie. Une
//! erreur d'étape arrête l'exécution; le rapport est retourné avec le statut
//! `Failed` ou `Cancelled`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use curvenumber::cn::prune_cn_layer_fields;
use curvenumber::intersection::SOIL_LAYER_NAME;
use curvenumber::runoff::weighted::WeightedRunoff;
use curvenumber::runoff::RunoffMode;
use curvenumber::stacker::LandUseStacker;
use curvenumber::types::EPSG_SJTSK;
use curvenumber::{
    compute_direct_runoff, create_cn_layer, intersect, prepare_soil_layer, Aoi, CancellationToken,
    CnError, CnTable, Layer, StageContext,
};

use crate::config::{AoiConfig, ProjectConfig, ServiceConfig};
use crate::export::{layer_name, read_layer, write_layer};
use crate::report::RunReport;
use crate::service::PrecomputedTableService;

/// Exécute les étapes d'un projet et collecte le rapport
pub struct Pipeline<'a> {
    config: &'a ProjectConfig,
    ctx: StageContext,
    report: RunReport,
}

impl<'a> Pipeline<'a> {
    /// Exécute un projet complet.
    ///
    /// # Errors
    ///
    /// Erreurs de lecture de la configuration ou des couches d'entrée et
    /// d'écriture des sorties. Les erreurs d'étape sont reportées dans le rapport.
    pub fn run(config: &'a ProjectConfig, token: &CancellationToken) -> Result<RunReport> {
        let started = Instant::now();
        info!(project = %config.name, "Starting project");

        std::fs::create_dir_all(&config.output_dir).context(format!(
            "Failed to create output directory: {}",
            config.output_dir.display()
        ))?;

        let inputs = Inputs::load(config)?;
        let mut pipeline = Pipeline {
            config,
            ctx: StageContext::new(token.clone()),
            report: RunReport::new(&config.name),
        };
        pipeline.execute(inputs)?;

        let mut report = pipeline.report;
        report.set_duration(started.elapsed());
        report.finalize();
        info!(status = ?report.status, "{}", report.summary());
        Ok(report)
    }

    fn execute(&mut self, inputs: Inputs) -> Result<()> {
        let Inputs {
            aoi,
            land_use,
            soil,
            cn_table,
            service,
        } = inputs;
        let stacking = self.config.stacking_config()?;

        let Some(stacked) = self.stage("stack", |ctx| {
            LandUseStacker::new(&stacking, &aoi).run(land_use, ctx)
        })?
        else {
            return Ok(());
        };

        let Some(prepared_soil) = self.stage("soil", |ctx| {
            ctx.checkpoint()?;
            prepare_soil_layer(&soil, &aoi)
        })?
        else {
            return Ok(());
        };

        let prune = self.config.prune_fields;
        let Some(intersected) = self.stage("intersect", |ctx| {
            let mut combined = intersect(stacked, prepared_soil, ctx)?;
            if prune {
                prune_cn_layer_fields(&mut combined);
            }
            Ok(combined)
        })?
        else {
            return Ok(());
        };

        let Some(cn_layer) = self.stage("cn", |ctx| create_cn_layer(&intersected, &cn_table, ctx))? else {
            return Ok(());
        };

        let params = self.config.runoff.params();
        self.stage("runoff", |ctx| match (&params.mode, &service) {
            (RunoffMode::Weighted { .. }, Some(service)) => {
                WeightedRunoff::new(service).run(cn_layer, &params, ctx)
            }
            (RunoffMode::Weighted { .. }, None) => Err(CnError::configuration(
                "weighted runoff requires a result table",
            )),
            (RunoffMode::Direct { .. }, _) => compute_direct_runoff(cn_layer, &params, ctx),
        })?;
        Ok(())
    }

    /// Exécute une étape, écrit sa couche et l'enregistre dans le rapport.
    /// Retourne None si l'étape a échoué ou a été annulée.
    fn stage<F>(&mut self, name: &str, run: F) -> Result<Option<Layer>>
    where
        F: FnOnce(&mut StageContext) -> Result<Layer, CnError>,
    {
        let started = Instant::now();
        info!(stage = name, "Stage started");

        match run(&mut self.ctx) {
            Ok(layer) => {
                let output = self.output_path(&layer.name);
                write_layer(&layer, &output)?;
                info!(
                    stage = name,
                    features = layer.len(),
                    output = %output.display(),
                    "Stage completed"
                );
                self.report.record_success(
                    name,
                    started.elapsed(),
                    layer.len(),
                    layer.fingerprint(),
                    Some(&output),
                    self.ctx.take_warnings(),
                );
                Ok(Some(layer))
            }
            Err(e) => {
                error!(stage = name, error = %e, "Stage failed");
                self.report.record_failure(
                    name,
                    started.elapsed(),
                    e.is_cancelled(),
                    &e.to_string(),
                    self.ctx.take_warnings(),
                );
                Ok(None)
            }
        }
    }

    fn output_path(&self, layer_name: &str) -> PathBuf {
        self.config.output_dir.join(format!("{}.geojson", layer_name))
    }
}

/// Entrées d'un projet, lues avant la première étape
struct Inputs {
    aoi: Aoi,
    land_use: Vec<Layer>,
    soil: Layer,
    cn_table: CnTable,
    service: Option<PrecomputedTableService>,
}

impl Inputs {
    fn load(config: &ProjectConfig) -> Result<Self> {
        let aoi = match &config.aoi {
            AoiConfig::Extent { ymin, xmin, ymax, xmax } => Aoi::from_extent(*ymin, *xmin, *ymax, *xmax),
            AoiConfig::Layer { layer } => {
                let layer = read_input(layer, &layer_name(layer))?;
                Aoi::from_layer(&layer)?
            }
        };
        aoi.validate()?;

        let land_use = config
            .land_use_layers
            .iter()
            .map(|path| read_input(path, &layer_name(path)))
            .collect::<Result<Vec<_>>>()?;
        let soil = read_input(&config.soil_layer, SOIL_LAYER_NAME)?;

        let cn_table = CnTable::load(&config.cn_table)
            .context(format!("Failed to load CN table: {}", config.cn_table.display()))?;

        let params = config.runoff.params();
        params.validate()?;
        let service = match (&params.mode, &config.runoff.result_table) {
            (RunoffMode::Weighted { .. }, Some(table)) => {
                let mut service = PrecomputedTableService::new(table.clone());
                if let Some(path) = &config.runoff.service {
                    service = service.with_service(&ServiceConfig::load(path)?);
                }
                Some(service)
            }
            (RunoffMode::Weighted { .. }, None) => {
                bail!("weighted runoff requires 'runoff.result_table'")
            }
            (RunoffMode::Direct { .. }, _) => None,
        };

        info!(
            layers = land_use.len(),
            soil = soil.len(),
            cn_codes = cn_table.len(),
            "Inputs loaded"
        );
        Ok(Self {
            aoi,
            land_use,
            soil,
            cn_table,
            service,
        })
    }
}

fn read_input(path: &Path, name: &str) -> Result<Layer> {
    let layer = read_layer(path, name)?;
    if layer.epsg != EPSG_SJTSK {
        bail!(
            "{}: layer is in EPSG:{}, expected EPSG:{}",
            path.display(),
            layer.epsg,
            EPSG_SJTSK
        );
    }
    Ok(layer)
}
