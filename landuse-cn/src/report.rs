//! Rapport d'exécution d'un projet
//!
//! Statut, durée et empreinte de sortie de chaque étape, et liste des
//! avertissements de qualité des données.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use curvenumber::DataQualityWarning;

/// Statut d'une étape ou de l'exécution complète
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageStatus {
    /// Étape terminée sans avertissement
    Success,
    /// Étape terminée avec des avertissements
    PartialSuccess,
    /// Annulation demandée pendant l'étape
    Cancelled,
    /// Erreur fatale
    Failed,
}

/// Compte rendu d'une étape
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub duration_secs: f64,
    /// Nombre de features de la couche produite
    pub features: usize,
    /// Empreinte blake3 de la couche produite
    pub fingerprint: Option<String>,
    /// Fichier GeoJSON écrit
    pub output: Option<String>,
    pub warnings: usize,
    pub error: Option<String>,
}

/// Avertissement sérialisable
#[derive(Debug, Clone, Serialize)]
pub struct WarningEntry {
    pub stage: String,
    pub layer: String,
    pub feature_id: Option<u64>,
    pub kind: String,
    pub message: String,
}

impl From<DataQualityWarning> for WarningEntry {
    fn from(w: DataQualityWarning) -> Self {
        Self {
            stage: w.stage.to_string(),
            layer: w.layer,
            feature_id: w.feature_id,
            kind: w.kind.to_string(),
            message: w.message,
        }
    }
}

/// Rapport complet d'une exécution
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub project: String,
    pub duration_secs: f64,
    pub status: StageStatus,
    pub stages: Vec<StageReport>,
    pub warnings: Vec<WarningEntry>,
}

impl RunReport {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            duration_secs: 0.0,
            status: StageStatus::Success,
            stages: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Enregistre une étape réussie et ses avertissements
    pub fn record_success(
        &mut self,
        name: &str,
        duration: Duration,
        features: usize,
        fingerprint: String,
        output: Option<&Path>,
        warnings: Vec<DataQualityWarning>,
    ) {
        let status = if warnings.is_empty() {
            StageStatus::Success
        } else {
            StageStatus::PartialSuccess
        };
        self.stages.push(StageReport {
            name: name.to_string(),
            status,
            duration_secs: duration.as_secs_f64(),
            features,
            fingerprint: Some(fingerprint),
            output: output.map(|p| p.display().to_string()),
            warnings: warnings.len(),
            error: None,
        });
        self.warnings.extend(warnings.into_iter().map(WarningEntry::from));
    }

    /// Enregistre une étape interrompue (échec ou annulation)
    pub fn record_failure(
        &mut self,
        name: &str,
        duration: Duration,
        cancelled: bool,
        error: &str,
        warnings: Vec<DataQualityWarning>,
    ) {
        self.stages.push(StageReport {
            name: name.to_string(),
            status: if cancelled {
                StageStatus::Cancelled
            } else {
                StageStatus::Failed
            },
            duration_secs: duration.as_secs_f64(),
            features: 0,
            fingerprint: None,
            output: None,
            warnings: warnings.len(),
            error: Some(error.to_string()),
        });
        self.warnings.extend(warnings.into_iter().map(WarningEntry::from));
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration_secs = duration.as_secs_f64();
    }

    /// Détermine le statut global à partir des étapes
    pub fn finalize(&mut self) {
        let has = |s: StageStatus| self.stages.iter().any(|stage| stage.status == s);
        self.status = if has(StageStatus::Failed) {
            StageStatus::Failed
        } else if has(StageStatus::Cancelled) {
            StageStatus::Cancelled
        } else if has(StageStatus::PartialSuccess) {
            StageStatus::PartialSuccess
        } else {
            StageStatus::Success
        };
    }

    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }

    /// Affiche le rapport sur la console
    pub fn display(&self) {
        println!("\n{}", "=".repeat(60));
        println!("RUN REPORT - {}", self.project);
        println!("{}", "=".repeat(60));

        println!("\nStatus: {:?}", self.status);
        println!("Duration: {:.2}s", self.duration_secs);

        println!("\n--- STAGES ---");
        for stage in &self.stages {
            println!(
                "  {:<10} {:?} {:.2}s, {} features, {} warnings",
                stage.name, stage.status, stage.duration_secs, stage.features, stage.warnings
            );
            if let Some(error) = &stage.error {
                println!("    error: {}", error);
            }
        }

        if !self.warnings.is_empty() {
            println!("\n--- WARNINGS ({}) ---", self.warnings.len());
            let mut by_kind: HashMap<&str, usize> = HashMap::new();
            for w in &self.warnings {
                *by_kind.entry(w.kind.as_str()).or_default() += 1;
            }
            let mut kinds: Vec<_> = by_kind.into_iter().collect();
            kinds.sort();
            for (kind, count) in kinds {
                println!("  {}: {}", kind, count);
            }
            for w in self.warnings.iter().take(10) {
                let location = match w.feature_id {
                    Some(id) => format!("[{}:{}]", w.layer, id),
                    None => format!("[{}]", w.layer),
                };
                println!("  {} {} {}", w.stage, location, w.message);
            }
            if self.warnings.len() > 10 {
                println!("  ... and {} more", self.warnings.len() - 10);
            }
        }

        println!("\n{}", "=".repeat(60));
    }

    /// Sauvegarde le rapport en JSON
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).context(format!("Failed to write report: {}", path.display()))?;
        Ok(())
    }

    /// Affichage compact pour le résumé
    pub fn summary(&self) -> String {
        let features = self.stages.last().map_or(0, |s| s.features);
        format!(
            "{}: {:?}, {} stages, {} output features, {} warnings",
            self.project,
            self.status,
            self.stages.len(),
            features,
            self.warnings.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curvenumber::WarningKind;

    fn warning() -> DataQualityWarning {
        DataQualityWarning {
            stage: "cn",
            layer: "Intersected_LandUse_HSG".to_string(),
            feature_id: Some(4),
            kind: WarningKind::UnresolvedLandUseCode,
            message: "no CN".to_string(),
        }
    }

    #[test]
    fn test_finalize_success() {
        let mut report = RunReport::new("demo");
        report.record_success("stack", Duration::from_millis(10), 3, "abc".into(), None, Vec::new());
        report.finalize();
        assert_eq!(report.status, StageStatus::Success);
    }

    #[test]
    fn test_finalize_partial_success() {
        let mut report = RunReport::new("demo");
        report.record_success("stack", Duration::ZERO, 3, "abc".into(), None, Vec::new());
        report.record_success("cn", Duration::ZERO, 3, "def".into(), None, vec![warning()]);
        report.finalize();
        assert_eq!(report.status, StageStatus::PartialSuccess);
        assert_eq!(report.warnings[0].kind, "unresolved_land_use_code");
    }

    #[test]
    fn test_finalize_failed_and_cancelled() {
        let mut report = RunReport::new("demo");
        report.record_failure("runoff", Duration::ZERO, true, "operation cancelled", Vec::new());
        report.finalize();
        assert_eq!(report.status, StageStatus::Cancelled);

        report.record_failure("runoff", Duration::ZERO, false, "timeout", Vec::new());
        report.finalize();
        assert_eq!(report.status, StageStatus::Failed);
        assert!(report.is_failed());
    }

    #[test]
    fn test_summary_and_save() {
        let mut report = RunReport::new("demo");
        report.record_success("runoff", Duration::ZERO, 7, "abc".into(), None, Vec::new());
        report.finalize();
        assert!(report.summary().contains("7 output features"));

        let path = std::env::temp_dir().join("landuse_cn_report.json");
        report.save_to_file(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(r#""status": "Success""#));
        std::fs::remove_file(path).ok();
    }
}
