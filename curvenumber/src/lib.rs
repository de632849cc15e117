//! # curvenumber
//!
//! Modèle Curve Number (SCS-CN) d'occupation du sol et de sol, et calcul du
//! ruissellement d'averse, pour des couches vectorielles en S-JTSK / Krovak (EPSG:5514).
//!
//! ## Features
//!
//! - Empilement de couches d'occupation du sol par priorité, sans recouvrement
//! - Classification par mots-clés, incréments de code par attribut, buffers par niveau
//! - Superposition occupation du sol / groupes hydrologiques (HSG) façon union QGIS
//! - Affectation CN2/CN3 depuis une table CN
//! - Ruissellement direct ou pondéré par un modèle hydrologique distant
//! - Annulation coopérative et avertissements de qualité des données par étape
//!
//! ## Usage
//!
//! ```rust,ignore
//! use curvenumber::{Aoi, CancellationToken, StageContext};
//! use curvenumber::stacker::{LandUseStacker, StackingConfig};
//!
//! let aoi = Aoi::from_extent(-1_150_000.0, -750_000.0, -1_140_000.0, -740_000.0);
//! let mut ctx = StageContext::new(CancellationToken::new());
//! let land_use = LandUseStacker::new(&config, &aoi).run(layers, &mut ctx)?;
//! let soil = prepare_soil_layer(&soil, &aoi)?;
//! let intersected = intersect(land_use, soil, &mut ctx)?;
//! let cn = create_cn_layer(&intersected, &CnTable::load(path)?, &mut ctx)?;
//! let runoff = compute_direct_runoff(cn, &RunoffParams::direct(vec![32.0], 0.2), &mut ctx)?;
//! ```

pub mod aoi;
pub mod cancel;
pub mod cn;
pub mod error;
pub mod geometry;
pub mod intersection;
pub mod rules;
pub mod runoff;
pub mod stacker;
pub mod table;
pub mod types;

pub use aoi::Aoi;
pub use cancel::{CancellationToken, StageContext};
pub use cn::{create_cn_layer, CnTable};
pub use error::{CnError, DataQualityWarning, WarningKind};
pub use intersection::{intersect, prepare_soil_layer};
pub use runoff::{compute_direct_runoff, RunoffMode, RunoffParams};
pub use types::{Feature, Layer, Value};
