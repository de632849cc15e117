//! Types d'erreurs et d'avertissements pour le crate curvenumber

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Erreurs fatales pour une étape du pipeline
#[derive(Debug, Error)]
pub enum CnError {
    /// Erreur d'I/O lors de la lecture d'un fichier
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Erreur de parsing d'un fichier tabulaire ou de règles
    #[error("Parse error in {file}: {reason}")]
    Parse { file: String, reason: String },

    /// Configuration absente ou invalide (fichier de règles, ordre d'empilement...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Champ référencé absent du schéma de la couche
    #[error("Field '{field}' not found in layer '{layer}'")]
    FieldNotFound { layer: String, field: String },

    /// Opération géométrique en échec (géométrie invalide, auto-intersection)
    #[error("Geometry operation '{operation}' failed: {reason}")]
    Geometry { operation: String, reason: String },

    /// Échec du service hydrologique distant
    #[error("Remote service error: {0}")]
    RemoteService(String),

    /// Le job distant n'a pas terminé dans le délai imparti
    #[error("Remote job '{job}' did not complete within {waited:?}")]
    Timeout { job: String, waited: Duration },

    /// Étape annulée par l'appelant
    #[error("Operation cancelled")]
    Cancelled,
}

impl CnError {
    /// Crée une erreur de parsing avec contexte
    pub fn parse_error(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Crée une erreur de configuration
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Crée une erreur géométrique
    pub fn geometry(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Geometry {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Crée une erreur de champ manquant
    pub fn field_not_found(layer: impl Into<String>, field: impl Into<String>) -> Self {
        Self::FieldNotFound {
            layer: layer.into(),
            field: field.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Nature d'un avertissement de qualité des données
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarningKind {
    /// Valeur d'attribut manquante ou inconnue
    MissingAttribute,
    /// CN nul ou négatif
    InvalidCurveNumber,
    /// Code d'occupation du sol absent de la table CN
    UnresolvedLandUseCode,
    /// Type de géométrie non bufferisable
    UnsupportedGeometry,
    /// Couche absente de l'ordre d'empilement
    UnstackedLayer,
    /// Couche conservée telle quelle après un échec local
    LayerKeptOriginal,
    /// Valeur non numérique dans une table distante
    InvalidTableValue,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::MissingAttribute => "missing_attribute",
            Self::InvalidCurveNumber => "invalid_curve_number",
            Self::UnresolvedLandUseCode => "unresolved_land_use_code",
            Self::UnsupportedGeometry => "unsupported_geometry",
            Self::UnstackedLayer => "unstacked_layer",
            Self::LayerKeptOriginal => "layer_kept_original",
            Self::InvalidTableValue => "invalid_table_value",
        };
        f.write_str(label)
    }
}

/// Avertissement non fatal: la feature ou la couche est ignorée ou reçoit une valeur nulle
#[derive(Debug, Clone, PartialEq)]
pub struct DataQualityWarning {
    /// Étape ayant émis l'avertissement (stack, intersect, cn, runoff)
    pub stage: &'static str,
    /// Couche concernée
    pub layer: String,
    /// Feature concernée (absente pour un avertissement au niveau couche)
    pub feature_id: Option<u64>,
    pub kind: WarningKind,
    pub message: String,
}

impl fmt::Display for DataQualityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.feature_id {
            Some(id) => write!(
                f,
                "[{}] {}#{} {}: {}",
                self.stage, self.layer, id, self.kind, self.message
            ),
            None => write!(
                f,
                "[{}] {} {}: {}",
                self.stage, self.layer, self.kind, self.message
            ),
        }
    }
}
