//! # landuse-cn
//!
//! Construction d'un modèle Curve Number (occupation du sol + groupes
//! hydrologiques) et des volumes de ruissellement à partir de couches GeoJSON
//! en S-JTSK / Krovak (EPSG:5514).
//!
//! ## Features
//!
//! - Fichier projet et fichiers de règles YAML
//! - Lecture GeoJSON, écriture en streaming avec geozero
//! - Rapport d'exécution par étape (JSON)
//! - Mode pondéré à partir d'une table de résultats du modèle hydrologique
//!
//! ## Usage
//!
//! ```bash
//! # Exécuter un projet
//! LANDUSE_CN_PROJECT=./project.yaml landuse-cn
//!
//! # Plus de logs
//! LANDUSE_CN_PROJECT=./project.yaml LANDUSE_CN_VERBOSE=2 landuse-cn
//! ```

pub mod config;
pub mod export;
pub mod pipeline;
pub mod report;
pub mod service;

pub use config::ProjectConfig;
pub use pipeline::Pipeline;
pub use report::{RunReport, StageStatus};
pub use service::PrecomputedTableService;
