//! Ruissellement pondéré par les probabilités de forme d'averse
//!
//! Le modèle hydrologique distant reçoit l'AOI dissoute et retourne, pour chaque
//! période de retour, la hauteur de pluie `H_<période>T360_mm`, la probabilité de
//! chaque forme d'averse `P_<période>tvar<forme>_%` et la probabilité de
//! condition CN2 `QAPI_tvar<forme>`. Le transport (WPS) est fourni par
//! l'implémentation de [`HydroModelService`].

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, error, info};

use super::{
    calculate_base_runoff, create_runoff_fields, update_shape_area, weighted_volume_field,
    RunoffColumns, RunoffMode, RunoffParams, RUNOFF_LAYER_NAME, STAGE,
};
use crate::aoi::dissolve_aoi;
use crate::cancel::StageContext;
use crate::error::WarningKind;
use crate::geometry::{buffer_polygons, from_multi_polygon, to_multi_polygon};
use crate::table::Table;
use crate::types::Layer;
use crate::CnError;

/// Formes d'averse évaluées par le modèle
pub const SHAPE_TYPES: [&str; 6] = ["A", "B", "C", "D", "E", "F"];

/// Buffer appliqué à l'AOI dissoute avant envoi (m)
pub const REMOTE_INPUT_BUFFER: f64 = 0.01;

/// Colonne clé de l'entrée du modèle
pub const KEY_COLUMN: &str = "ID";

/// Sortie tabulaire principale du modèle
pub const OUTPUT_TABLE: &str = "output";

/// Sortie des formes d'averse
pub const OUTPUT_SHAPES: &str = "output_shapes";

/// Étapes du calcul pondéré, dans l'ordre d'exécution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightedStage {
    DissolveAoi,
    ExportGeometry,
    SubmitRemoteJob,
    PollUntilComplete,
    DownloadResultTable,
    ComputeBaseRunoff,
    ComputeWeightedRunoff,
}

impl fmt::Display for WeightedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::DissolveAoi => "DISSOLVE_AOI",
            Self::ExportGeometry => "EXPORT_GEOMETRY",
            Self::SubmitRemoteJob => "SUBMIT_REMOTE_JOB",
            Self::PollUntilComplete => "POLL_UNTIL_COMPLETE",
            Self::DownloadResultTable => "DOWNLOAD_RESULT_TABLE",
            Self::ComputeBaseRunoff => "COMPUTE_BASE_RUNOFF",
            Self::ComputeWeightedRunoff => "COMPUTE_WEIGHTED_RUNOFF",
        };
        f.write_str(label)
    }
}

/// Requête envoyée au modèle hydrologique
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// AOI dissoute (une feature, `ID = 1`) et bufferisée
    pub input: Layer,
    pub return_periods: Vec<String>,
    pub shape_types: Vec<String>,
    pub key_column: String,
    pub area_reduction: bool,
    pub outputs: Vec<String>,
}

/// Identifiant d'un job soumis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
}

/// État d'un job distant
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Accepted,
    Running { message: String, percent: u8 },
    Succeeded,
    Failed(String),
}

/// Service hydrologique distant (soumission, suivi et résultats d'un job)
pub trait HydroModelService {
    fn submit(&self, request: &JobRequest) -> Result<JobHandle, CnError>;

    fn status(&self, job: &JobHandle) -> Result<JobStatus, CnError>;

    /// Télécharge une sortie tabulaire d'un job terminé
    fn fetch_table(&self, job: &JobHandle, output: &str) -> Result<Table, CnError>;
}

/// Intervalle de scrutation et délai maximal d'attente d'un job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Attend la fin d'un job en l'interrogeant à intervalle fixe.
///
/// # Errors
///
/// `CnError::RemoteService` si le job échoue, `CnError::Timeout` au-delà du
/// délai, `CnError::Cancelled` si l'annulation est demandée.
pub fn wait_for_completion<S: HydroModelService + ?Sized>(
    service: &S,
    job: &JobHandle,
    policy: &PollingPolicy,
    ctx: &StageContext,
) -> Result<(), CnError> {
    let started = Instant::now();
    loop {
        ctx.checkpoint()?;
        match service.status(job)? {
            JobStatus::Succeeded => {
                info!(job = %job.id, elapsed_ms = started.elapsed().as_millis() as u64, "Remote job completed");
                return Ok(());
            }
            JobStatus::Failed(reason) => {
                return Err(CnError::RemoteService(format!(
                    "job '{}' failed: {}",
                    job.id, reason
                )));
            }
            JobStatus::Accepted => debug!(job = %job.id, "Remote job accepted"),
            JobStatus::Running { message, percent } => {
                info!(job = %job.id, percent = percent, "{}", message)
            }
        }

        let waited = started.elapsed();
        if waited >= policy.timeout {
            return Err(CnError::Timeout {
                job: job.id.clone(),
                waited,
            });
        }
        std::thread::sleep(policy.interval);
    }
}

/// Valeurs de la première ligne de la table de résultats, indexées par période et forme
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightedTable {
    heights: HashMap<String, f64>,
    shape_probabilities: HashMap<(String, String), f64>,
    cn2_probabilities: HashMap<String, f64>,
}

struct ColumnPatterns {
    height: Regex,
    shape: Regex,
    qapi: Regex,
}

impl ColumnPatterns {
    fn new() -> Result<Self, CnError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| CnError::configuration(format!("invalid pattern: {}", e)))
        };
        Ok(Self {
            height: compile(r"^H_(?P<period>.+)T360_mm$")?,
            shape: compile(r"^P_(?P<period>.+)tvar(?P<shape>[A-F])_%$")?,
            qapi: compile(r"^QAPI_tvar(?P<shape>[A-F])$")?,
        })
    }
}

impl WeightedTable {
    /// Lit les colonnes utiles de la première ligne.
    ///
    /// # Errors
    ///
    /// `CnError::RemoteService` si la table est vide ou si une colonne requise
    /// pour une des périodes manque. Une hauteur non numérique donne 0 et un avertissement.
    pub fn from_table(table: &Table, periods: &[String], ctx: &mut StageContext) -> Result<Self, CnError> {
        let header = table
            .header
            .as_ref()
            .ok_or_else(|| CnError::RemoteService("result table has no header".to_string()))?;
        if table.rows.is_empty() {
            return Err(CnError::RemoteService("result table has no data row".to_string()));
        }

        let patterns = ColumnPatterns::new()?;
        let mut result = Self::default();
        let mut raw_heights: HashMap<String, usize> = HashMap::new();

        for (col, name) in header.iter().enumerate() {
            let name = name.trim();
            if let Some(caps) = patterns.height.captures(name) {
                raw_heights.insert(caps["period"].to_string(), col);
            } else if let Some(caps) = patterns.shape.captures(name) {
                let value = required_number(table, col, name)?;
                result
                    .shape_probabilities
                    .insert((caps["period"].to_string(), caps["shape"].to_string()), value);
            } else if let Some(caps) = patterns.qapi.captures(name) {
                let value = required_number(table, col, name)?;
                result.cn2_probabilities.insert(caps["shape"].to_string(), value);
            }
        }

        for period in periods {
            let column = format!("H_{}T360_mm", period);
            let col = *raw_heights.get(period.as_str()).ok_or_else(|| {
                CnError::RemoteService(format!("expected column '{}' not found in result table", column))
            })?;
            let height = match table.number(0, col) {
                Some(h) => h,
                None => {
                    ctx.warn(
                        STAGE,
                        OUTPUT_TABLE,
                        None,
                        WarningKind::InvalidTableValue,
                        format!("'{}' is not a number, rainfall depth set to 0", column),
                    );
                    0.0
                }
            };
            result.heights.insert(period.clone(), height);

            for shape in SHAPE_TYPES {
                if !result
                    .shape_probabilities
                    .contains_key(&(period.clone(), shape.to_string()))
                {
                    return Err(CnError::RemoteService(format!(
                        "expected column 'P_{}tvar{}_%' not found in result table",
                        period, shape
                    )));
                }
            }
        }
        for shape in SHAPE_TYPES {
            if !result.cn2_probabilities.contains_key(shape) {
                return Err(CnError::RemoteService(format!(
                    "expected column 'QAPI_tvar{}' not found in result table",
                    shape
                )));
            }
        }

        Ok(result)
    }

    /// Hauteur de pluie (mm) d'une période de retour
    pub fn height(&self, period: &str) -> Option<f64> {
        self.heights.get(period).copied()
    }

    /// Volume pondéré: Σ_forme [P_CN2 * P_forme * V2 + (1 - P_CN2) * P_forme * V3] / 100
    pub fn weighted_volume(&self, period: &str, cn2_volume: f64, cn3_volume: f64) -> Option<f64> {
        SHAPE_TYPES
            .iter()
            .map(|shape| {
                let p_shape = *self
                    .shape_probabilities
                    .get(&(period.to_string(), shape.to_string()))?;
                let p_cn2 = *self.cn2_probabilities.get(*shape)?;
                Some(p_cn2 * p_shape * cn2_volume + (1.0 - p_cn2) * p_shape * cn3_volume)
            })
            .sum::<Option<f64>>()
            .map(|v| v / 100.0)
    }
}

fn required_number(table: &Table, col: usize, name: &str) -> Result<f64, CnError> {
    table
        .number(0, col)
        .ok_or_else(|| CnError::RemoteService(format!("column '{}' is not a number", name)))
}

/// Écrit `V_<période>_m3` pour chaque feature à partir des volumes CN2/CN3.
/// Les features de volume absent ou négatif sont ignorées.
pub fn calculate_weighted_runoff(
    layer: &mut Layer,
    table: &WeightedTable,
    periods: &[String],
    ctx: &StageContext,
) -> Result<(), CnError> {
    for period in periods {
        let columns = RunoffColumns::new(Some(period.as_str()));
        let v2_idx = layer.field_index(&columns.cn2_volume)?;
        let v3_idx = layer.field_index(&columns.cn3_volume)?;
        let out_idx = layer.field_index(&weighted_volume_field(period))?;

        let mut skipped = 0usize;
        for feature in layer.features_mut() {
            ctx.checkpoint()?;
            let volumes = (feature.get(v2_idx).as_f64(), feature.get(v3_idx).as_f64());
            let (Some(v2), Some(v3)) = volumes else {
                skipped += 1;
                continue;
            };
            if v2 < 0.0 || v3 < 0.0 {
                skipped += 1;
                continue;
            }
            if let Some(volume) = table.weighted_volume(period, v2, v3) {
                feature.set(out_idx, volume);
            }
        }
        debug!(period = %period, skipped = skipped, "Weighted volume computed");
    }
    Ok(())
}

/// Enchaîne les étapes du calcul pondéré avec un service hydrologique
pub struct WeightedRunoff<'a, S: HydroModelService + ?Sized> {
    service: &'a S,
    policy: PollingPolicy,
}

impl<'a, S: HydroModelService + ?Sized> WeightedRunoff<'a, S> {
    pub fn new(service: &'a S) -> Self {
        Self {
            service,
            policy: PollingPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PollingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Calcule le ruissellement pondéré. Tout échec d'étape interrompt le calcul.
    pub fn run(&self, cn_layer: Layer, params: &RunoffParams, ctx: &mut StageContext) -> Result<Layer, CnError> {
        params.validate()?;
        let RunoffMode::Weighted { return_periods } = &params.mode else {
            return Err(CnError::configuration(
                "weighted runoff requires return periods",
            ));
        };

        let mut layer = cn_layer;
        layer.name = RUNOFF_LAYER_NAME.to_string();
        update_shape_area(&mut layer);
        create_runoff_fields(&mut layer, params);

        let mut stage = WeightedStage::DissolveAoi;
        let result = self.execute(&mut layer, return_periods, params, ctx, &mut stage);
        match result {
            Ok(()) => {
                info!(
                    features = layer.len(),
                    periods = return_periods.len(),
                    "Weighted runoff computed"
                );
                Ok(layer)
            }
            Err(e) => {
                error!(stage = %stage, error = %e, "Weighted runoff aborted");
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        layer: &mut Layer,
        periods: &[String],
        params: &RunoffParams,
        ctx: &mut StageContext,
        stage: &mut WeightedStage,
    ) -> Result<(), CnError> {
        *stage = WeightedStage::DissolveAoi;
        ctx.checkpoint()?;
        let dissolved = dissolve_aoi(layer)?;

        *stage = WeightedStage::ExportGeometry;
        let input = buffer_input(dissolved)?;
        let request = JobRequest {
            input,
            return_periods: periods.to_vec(),
            shape_types: SHAPE_TYPES.iter().map(|s| s.to_string()).collect(),
            key_column: KEY_COLUMN.to_string(),
            area_reduction: true,
            outputs: vec![OUTPUT_TABLE.to_string(), OUTPUT_SHAPES.to_string()],
        };

        *stage = WeightedStage::SubmitRemoteJob;
        ctx.checkpoint()?;
        let job = self.service.submit(&request)?;
        info!(job = %job.id, "Remote job submitted");

        *stage = WeightedStage::PollUntilComplete;
        wait_for_completion(self.service, &job, &self.policy, ctx)?;

        *stage = WeightedStage::DownloadResultTable;
        let raw = self.service.fetch_table(&job, OUTPUT_TABLE)?;
        let table = WeightedTable::from_table(&raw, periods, ctx)?;

        *stage = WeightedStage::ComputeBaseRunoff;
        let depths: Vec<(RunoffColumns, f64)> = periods
            .iter()
            .map(|p| (RunoffColumns::new(Some(p.as_str())), table.height(p).unwrap_or(0.0)))
            .collect();
        calculate_base_runoff(layer, &depths, params.abstraction_coefficient, ctx)?;

        *stage = WeightedStage::ComputeWeightedRunoff;
        calculate_weighted_runoff(layer, &table, periods, ctx)
    }
}

/// Buffer de l'AOI dissoute envoyée au modèle
fn buffer_input(mut dissolved: Layer) -> Result<Layer, CnError> {
    for feature in dissolved.features_mut() {
        let Some(mp) = feature.geometry.as_ref().and_then(to_multi_polygon) else {
            continue;
        };
        feature.geometry = from_multi_polygon(buffer_polygons(&mp, REMOTE_INPUT_BUFFER, 1)?);
    }
    Ok(dissolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::table::parse_table;
    use crate::types::{fields, FieldType, Value};
    use geo::{Geometry, Rect};
    use std::cell::Cell;

    const RESULT: &str = "ID,H_N2T360_mm,P_N2tvarA_%,P_N2tvarB_%,P_N2tvarC_%,P_N2tvarD_%,P_N2tvarE_%,P_N2tvarF_%,\
QAPI_tvarA,QAPI_tvarB,QAPI_tvarC,QAPI_tvarD,QAPI_tvarE,QAPI_tvarF\n\
1,10,50,10,10,10,10,10,1,1,1,0,0,0\n";

    struct FakeService {
        polls_before_success: Cell<u32>,
        fail: bool,
        table: &'static str,
    }

    impl FakeService {
        fn new(table: &'static str) -> Self {
            Self {
                polls_before_success: Cell::new(2),
                fail: false,
                table,
            }
        }
    }

    impl HydroModelService for FakeService {
        fn submit(&self, request: &JobRequest) -> Result<JobHandle, CnError> {
            assert_eq!(request.input.len(), 1);
            assert_eq!(request.key_column, "ID");
            Ok(JobHandle { id: "job-1".to_string() })
        }

        fn status(&self, _job: &JobHandle) -> Result<JobStatus, CnError> {
            if self.fail {
                return Ok(JobStatus::Failed("process error".to_string()));
            }
            let remaining = self.polls_before_success.get();
            if remaining == 0 {
                return Ok(JobStatus::Succeeded);
            }
            self.polls_before_success.set(remaining - 1);
            Ok(JobStatus::Running {
                message: "running".to_string(),
                percent: 50,
            })
        }

        fn fetch_table(&self, _job: &JobHandle, output: &str) -> Result<Table, CnError> {
            assert_eq!(output, OUTPUT_TABLE);
            Ok(parse_table(self.table))
        }
    }

    fn fast_policy() -> PollingPolicy {
        PollingPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    fn cn_layer() -> Layer {
        let mut layer = Layer::new("CN_Layer");
        layer.add_field(fields::CN2, FieldType::Double);
        layer.add_field(fields::CN3, FieldType::Double);
        layer.push_feature(
            Some(Geometry::Polygon(Rect::new((0.0, 0.0), (10.0, 10.0)).to_polygon())),
            vec![Value::Float(50.0), Value::Float(60.0)],
        );
        layer
    }

    #[test]
    fn test_weighted_volume_formula() {
        let table = WeightedTable::from_table(
            &parse_table(RESULT),
            &["N2".to_string()],
            &mut StageContext::default(),
        )
        .unwrap();
        assert_eq!(table.height("N2"), Some(10.0));
        // A, B, C: P_CN2 = 1 -> V2; D, E, F: P_CN2 = 0 -> V3
        let v = table.weighted_volume("N2", 2.0, 1.0).unwrap();
        let expected = (50.0 * 2.0 + 10.0 * 2.0 + 10.0 * 2.0 + 30.0 * 1.0) / 100.0;
        assert!((v - expected).abs() < 1e-12);
    }

    #[test]
    fn test_missing_height_column() {
        let err = WeightedTable::from_table(
            &parse_table(RESULT),
            &["N5".to_string()],
            &mut StageContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CnError::RemoteService(_)));
    }

    #[test]
    fn test_unparseable_height_is_zero() {
        let text = RESULT.replace("1,10,50", "1,abc,50");
        let mut ctx = StageContext::default();
        let table = WeightedTable::from_table(&parse_table(&text), &["N2".to_string()], &mut ctx).unwrap();
        assert_eq!(table.height("N2"), Some(0.0));
        assert_eq!(ctx.warnings()[0].kind, WarningKind::InvalidTableValue);
    }

    #[test]
    fn test_full_weighted_run() {
        let service = FakeService::new(RESULT);
        let params = RunoffParams::weighted(["N2"], 0.2);
        let mut ctx = StageContext::default();
        let layer = WeightedRunoff::new(&service)
            .with_policy(fast_policy())
            .run(cn_layer(), &params, &mut ctx)
            .unwrap();

        let v2 = layer.field_index("CN2_N2_runoff_volume_m3").unwrap();
        let v3 = layer.field_index("CN3_N2_runoff_volume_m3").unwrap();
        let v = layer.field_index("V_N2_m3").unwrap();
        let feature = &layer.features()[0];
        let (v2, v3) = (feature.get(v2).as_f64().unwrap(), feature.get(v3).as_f64().unwrap());
        let expected = (70.0 * v2 + 30.0 * v3) / 100.0;
        assert!((feature.get(v).as_f64().unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_single_period_columns_keep_period_label() {
        let service = FakeService::new(RESULT);
        let params = RunoffParams::weighted(["N2"], 0.2);
        let layer = WeightedRunoff::new(&service)
            .with_policy(fast_policy())
            .run(cn_layer(), &params, &mut StageContext::default())
            .unwrap();

        for name in [
            "CN2_N2_runoff_height_mm",
            "CN3_N2_runoff_height_mm",
            "CN2_N2_runoff_volume_m3",
            "CN3_N2_runoff_volume_m3",
            "V_N2_m3",
        ] {
            assert!(layer.field_index(name).is_ok(), "missing {}", name);
        }
        assert!(layer.field_index("CN2_runoff_volume_m3").is_err());
        assert!(layer.field_index("CN2_1_runoff_volume_m3").is_err());
    }

    #[test]
    fn test_failed_job_aborts() {
        let mut service = FakeService::new(RESULT);
        service.fail = true;
        let params = RunoffParams::weighted(["N2"], 0.2);
        let err = WeightedRunoff::new(&service)
            .with_policy(fast_policy())
            .run(cn_layer(), &params, &mut StageContext::default())
            .unwrap_err();
        assert!(matches!(err, CnError::RemoteService(_)));
    }

    #[test]
    fn test_polling_timeout() {
        let service = FakeService::new(RESULT);
        service.polls_before_success.set(u32::MAX);
        let policy = PollingPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(5),
        };
        let err = wait_for_completion(
            &service,
            &JobHandle { id: "job-1".to_string() },
            &policy,
            &StageContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CnError::Timeout { .. }));
    }

    #[test]
    fn test_polling_cancelled() {
        let service = FakeService::new(RESULT);
        let token = CancellationToken::new();
        token.cancel();
        let err = wait_for_completion(
            &service,
            &JobHandle { id: "job-1".to_string() },
            &fast_policy(),
            &StageContext::new(token),
        )
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(WeightedStage::PollUntilComplete.to_string(), "POLL_UNTIL_COMPLETE");
    }
}
