//! Configuration: fichier projet et fichiers de règles
//!
//! Tous les fichiers sont en YAML, sauf l'ordre d'empilement (un nom de couche
//! par ligne). Les chemins relatifs du fichier projet sont résolus par rapport
//! au répertoire de ce fichier.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use curvenumber::rules::{AttributeEditRule, BufferLevel, BufferRule, ClassificationRules, KeywordRule};
use curvenumber::runoff::RunoffParams;
use curvenumber::stacker::{StackingConfig, StackingOrder, LPIS_LAYER_NAME};
use curvenumber::Value;

/// Fichier projet
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_project_name")]
    pub name: String,

    /// Couches d'occupation du sol (GeoJSON); le nom de couche est le nom du fichier sans extension
    pub land_use_layers: Vec<PathBuf>,

    /// Couche des groupes hydrologiques (champ `HSG`)
    pub soil_layer: PathBuf,

    pub aoi: AoiConfig,

    pub rules: RuleFiles,

    /// Table CN (code, CN A, CN B, CN C, CN D)
    pub cn_table: PathBuf,

    pub output_dir: PathBuf,

    pub runoff: RunoffConfig,

    /// Réduire les champs de la couche combinée avant l'affectation des CN
    #[serde(default)]
    pub prune_fields: bool,
}

fn default_project_name() -> String {
    "project".to_string()
}

/// AOI: couche GeoJSON ou emprise `ymin, xmin, ymax, xmax`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AoiConfig {
    Layer { layer: PathBuf },
    Extent { ymin: f64, xmin: f64, ymax: f64, xmax: f64 },
}

/// Fichiers de règles d'empilement
#[derive(Debug, Clone, Deserialize)]
pub struct RuleFiles {
    /// Table mots-clés -> code (`land_use`)
    pub keywords: PathBuf,
    /// Règles d'édition et de buffer (`layers`, `buffer_layers`)
    #[serde(default)]
    pub attributes: Option<PathBuf>,
    /// Règle d'incrément de `LPIS_layer` (`layers`)
    #[serde(default)]
    pub lpis: Option<PathBuf>,
    /// Ordre d'empilement, un nom par ligne
    pub stacking_order: PathBuf,
}

/// Paramètres du ruissellement
#[derive(Debug, Clone, Deserialize)]
pub struct RunoffConfig {
    #[serde(default = "default_abstraction_coefficient")]
    pub abstraction_coefficient: f64,
    /// Mode direct: hauteurs de pluie (mm)
    #[serde(default)]
    pub depths_mm: Vec<f64>,
    /// Mode pondéré: périodes de retour (`N2`, `N5`, ...)
    #[serde(default)]
    pub return_periods: Vec<String>,
    /// Fichier du service hydrologique (`URL`, `process_identifier`)
    #[serde(default)]
    pub service: Option<PathBuf>,
    /// Table de résultats déjà téléchargée du service
    #[serde(default)]
    pub result_table: Option<PathBuf>,
}

fn default_abstraction_coefficient() -> f64 {
    0.2
}

impl RunoffConfig {
    /// Mode pondéré si des périodes de retour sont données, direct sinon
    pub fn params(&self) -> RunoffParams {
        if self.return_periods.is_empty() {
            RunoffParams::direct(self.depths_mm.clone(), self.abstraction_coefficient)
        } else {
            RunoffParams::weighted(self.return_periods.iter().cloned(), self.abstraction_coefficient)
        }
    }
}

impl ProjectConfig {
    /// Charge un fichier projet et résout ses chemins relatifs
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read project file: {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&content)
            .context(format!("Failed to parse project file: {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for layer in &mut self.land_use_layers {
            resolve(layer);
        }
        resolve(&mut self.soil_layer);
        if let AoiConfig::Layer { layer } = &mut self.aoi {
            resolve(layer);
        }
        resolve(&mut self.rules.keywords);
        if let Some(p) = &mut self.rules.attributes {
            resolve(p);
        }
        if let Some(p) = &mut self.rules.lpis {
            resolve(p);
        }
        resolve(&mut self.rules.stacking_order);
        resolve(&mut self.cn_table);
        resolve(&mut self.output_dir);
        if let Some(p) = &mut self.runoff.service {
            resolve(p);
        }
        if let Some(p) = &mut self.runoff.result_table {
            resolve(p);
        }
    }

    /// Assemble la configuration d'empilement depuis les fichiers de règles
    pub fn stacking_config(&self) -> Result<StackingConfig> {
        let classification = load_keyword_rules(&self.rules.keywords)?;
        let order = load_stacking_order(&self.rules.stacking_order)?;

        let (edits, buffers) = match &self.rules.attributes {
            Some(path) => load_attribute_rules(path)?,
            None => (Vec::new(), Vec::new()),
        };
        let lpis = match &self.rules.lpis {
            Some(path) => load_attribute_rules(path)?
                .0
                .into_iter()
                .find(|r| r.layer_name == LPIS_LAYER_NAME),
            None => None,
        };

        Ok(StackingConfig {
            classification,
            lpis,
            edits,
            buffers,
            order,
        })
    }
}

#[derive(Debug, Deserialize)]
struct KeywordFile {
    land_use: Vec<KeywordEntry>,
}

#[derive(Debug, Deserialize)]
struct KeywordEntry {
    keywords: Vec<String>,
    code: i64,
}

/// Charge la table mots-clés -> code
pub fn load_keyword_rules(path: &Path) -> Result<ClassificationRules> {
    let file: KeywordFile = read_yaml(path)?;
    let rules: Vec<KeywordRule> = file
        .land_use
        .into_iter()
        .map(|e| KeywordRule::new(e.keywords, e.code))
        .collect();
    debug!(file = %path.display(), rules = rules.len(), "Keyword rules loaded");
    Ok(ClassificationRules::new(rules))
}

#[derive(Debug, Default, Deserialize)]
struct AttributeFile {
    #[serde(default)]
    layers: Vec<LayerEntry>,
    #[serde(default)]
    buffer_layers: Vec<BufferEntry>,
}

#[derive(Debug, Deserialize)]
struct LayerEntry {
    name: String,
    base_use_code: i64,
    controlling_attribute: String,
    #[serde(default)]
    value_increments: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct BufferEntry {
    input_layer_name: String,
    #[serde(default)]
    controlling_atr_name: serde_yaml::Value,
    default_buffer: f64,
    #[serde(default)]
    buffer_levels: Vec<LevelEntry>,
}

#[derive(Debug, Deserialize)]
struct LevelEntry {
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    values: Vec<serde_yaml::Value>,
    distance: f64,
}

/// Charge les règles d'édition de code et de buffer
pub fn load_attribute_rules(path: &Path) -> Result<(Vec<AttributeEditRule>, Vec<BufferRule>)> {
    let file: AttributeFile = read_yaml(path)?;

    let mut edits = Vec::with_capacity(file.layers.len());
    for entry in file.layers {
        let mut increments = Vec::with_capacity(entry.value_increments.len());
        for (key, increment) in &entry.value_increments {
            let Some(increment) = yaml_to_value(increment).as_i64() else {
                bail!(
                    "{}: increment for '{}' in layer '{}' is not an integer",
                    path.display(),
                    yaml_to_value(key),
                    entry.name
                );
            };
            increments.push((yaml_to_value(key), increment));
        }
        edits.push(AttributeEditRule::new(
            entry.name,
            entry.base_use_code,
            entry.controlling_attribute,
            increments,
        ));
    }

    let buffers = file
        .buffer_layers
        .into_iter()
        .map(|entry| {
            let levels = entry
                .buffer_levels
                .into_iter()
                .map(|l| BufferLevel::new(l.priority, l.values.iter().map(yaml_to_value), l.distance))
                .collect();
            BufferRule::by_attribute(
                entry.input_layer_name,
                attribute_name(&entry.controlling_atr_name),
                entry.default_buffer,
                levels,
            )
        })
        .collect::<Vec<_>>();

    debug!(
        file = %path.display(),
        edits = edits.len(),
        buffers = buffers.len(),
        "Attribute rules loaded"
    );
    Ok((edits, buffers))
}

/// Nom d'attribut de contrôle; null et NaN deviennent "None"
fn attribute_name(value: &serde_yaml::Value) -> String {
    match yaml_to_value(value) {
        Value::Null => "None".to_string(),
        Value::Float(f) if f.is_nan() => "NaN".to_string(),
        other => other.to_string(),
    }
}

/// Charge l'ordre d'empilement: un nom par ligne, lignes vides ignorées,
/// colonnes après `,` ou `;` ignorées
pub fn load_stacking_order(path: &Path) -> Result<StackingOrder> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read stacking order: {}", path.display()))?;
    let names: Vec<String> = content
        .lines()
        .map(|line| line.trim_start_matches('\u{feff}'))
        .filter_map(|line| line.split([',', ';']).next())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    debug!(file = %path.display(), layers = names.len(), "Stacking order loaded");
    Ok(StackingOrder::new(names))
}

/// Fichier du service hydrologique
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "URL")]
    pub url: String,
    pub process_identifier: String,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        read_yaml(path)
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content).context(format!("Failed to parse YAML: {}", path.display()))
}

/// Convertit une valeur YAML scalaire en [`Value`]
pub fn yaml_to_value(value: &serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Text(b.to_string()),
        serde_yaml::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map_or(Value::Null, Value::Float),
        },
        serde_yaml::Value::String(s) => Value::Text(s.clone()),
        serde_yaml::Value::Tagged(tagged) => yaml_to_value(&tagged.value),
        serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) => Value::Null,
    }
}
