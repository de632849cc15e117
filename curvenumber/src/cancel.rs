//! Annulation coopérative et contexte d'exécution des étapes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::error::{DataQualityWarning, WarningKind};
use crate::CnError;

/// Jeton d'annulation partagé entre l'appelant et l'étape en cours
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Retourne `CnError::Cancelled` si l'annulation a été demandée
    pub fn check(&self) -> Result<(), CnError> {
        if self.is_cancelled() {
            Err(CnError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Contexte passé à chaque étape: jeton d'annulation et avertissements collectés
#[derive(Debug, Default)]
pub struct StageContext {
    cancel: CancellationToken,
    warnings: Vec<DataQualityWarning>,
}

impl StageContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            warnings: Vec::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Point de contrôle entre deux features ou deux couches
    pub fn checkpoint(&self) -> Result<(), CnError> {
        self.cancel.check()
    }

    /// Enregistre et journalise un avertissement de qualité des données
    pub fn warn(
        &mut self,
        stage: &'static str,
        layer: &str,
        feature_id: Option<u64>,
        kind: WarningKind,
        message: impl Into<String>,
    ) {
        let warning = DataQualityWarning {
            stage,
            layer: layer.to_string(),
            feature_id,
            kind,
            message: message.into(),
        };
        warn!(
            stage = stage,
            layer = %warning.layer,
            feature_id = ?feature_id,
            kind = %kind,
            "{}",
            warning.message
        );
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[DataQualityWarning] {
        &self.warnings
    }

    /// Vide les avertissements accumulés (typiquement à la fin d'une étape)
    pub fn take_warnings(&mut self) -> Vec<DataQualityWarning> {
        std::mem::take(&mut self.warnings)
    }
}
