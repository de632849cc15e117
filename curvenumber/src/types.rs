//! Types de données: valeurs d'attributs, schéma, features et couches

use std::collections::HashMap;
use std::fmt;

use blake3::Hasher;
use geo::{Area, CoordsIter, Geometry};

use crate::CnError;

/// Système de coordonnées unique du pipeline (S-JTSK / Krovak East North)
pub const EPSG_SJTSK: u32 = 5514;

/// Noms des champs manipulés par le pipeline
pub mod fields {
    pub const LAND_USE_CODE: &str = "LandUse_code";
    pub const HSG: &str = "HSG";
    pub const CN2: &str = "CN2";
    pub const CN3: &str = "CN3";
    pub const SHAPE_AREA: &str = "SHAPE_Area";
    pub const SOURCE: &str = "source";
    pub const ID: &str = "ID";
}

/// Valeur d'attribut typée
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.is_empty() || s == "NULL",
            _ => false,
        }
    }

    /// Valeur numérique flottante (les textes numériques sont acceptés)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f).filter(|f| !f.is_nan()),
            Value::Text(s) => fast_float::parse::<f64, _>(s.trim())
                .ok()
                .filter(|f| !f.is_nan()),
        }
    }

    /// Valeur entière; un flottant est tronqué, un texte doit être un entier
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Null => None,
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Value::Float(_) => None,
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Clé canonique pour comparer des valeurs de règles:
    /// `3`, `3.0` et `"3"` donnent tous `"3"`.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(float_key(*f)),
            Value::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed == "NULL" {
                    return None;
                }
                match trimmed.parse::<i64>() {
                    Ok(i) => Some(i.to_string()),
                    Err(_) => match fast_float::parse::<f64, _>(trimmed) {
                        Ok(f) if f.is_finite() => Some(float_key(f)),
                        _ => Some(trimmed.to_string()),
                    },
                }
            }
        }
    }
}

fn float_key(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Type d'un champ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Double,
    Text,
}

/// Définition d'un champ
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Schéma ordonné d'une couche, indexé par nom
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        let mut schema = Self::default();
        for field in fields {
            schema.push(field);
        }
        schema
    }

    /// Ajoute un champ; un champ de même nom existant est conservé
    pub fn push(&mut self, field: Field) -> usize {
        if let Some(&idx) = self.index.get(&field.name) {
            return idx;
        }
        let idx = self.fields.len();
        self.index.insert(field.name.clone(), idx);
        self.fields.push(field);
        idx
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Une feature: géométrie optionnelle et attributs alignés sur le schéma de sa couche
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: u64,
    pub geometry: Option<Geometry>,
    attributes: Vec<Value>,
}

impl Feature {
    pub fn attributes(&self) -> &[Value] {
        &self.attributes
    }

    /// Valeur à l'index de champ donné (Null si hors schéma)
    pub fn get(&self, idx: usize) -> &Value {
        self.attributes.get(idx).unwrap_or(&Value::Null)
    }

    pub fn set(&mut self, idx: usize, value: impl Into<Value>) {
        if idx >= self.attributes.len() {
            self.attributes.resize(idx + 1, Value::Null);
        }
        self.attributes[idx] = value.into();
    }
}

/// Collection de features partageant un schéma et un SRID ("couche")
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub epsg: u32,
    schema: Schema,
    features: Vec<Feature>,
    next_id: u64,
}

impl Layer {
    /// Crée une couche vide en S-JTSK
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_schema(name, Schema::default())
    }

    pub fn with_schema(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            epsg: EPSG_SJTSK,
            schema,
            features: Vec::new(),
            next_id: 1,
        }
    }

    /// Couche vide de même nom, SRID et schéma
    pub fn empty_like(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            epsg: self.epsg,
            schema: self.schema.clone(),
            features: Vec::new(),
            next_id: 1,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn features_mut(&mut self) -> &mut [Feature] {
        &mut self.features
    }

    pub fn into_features(self) -> Vec<Feature> {
        self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Ajoute un champ au schéma et une valeur nulle à chaque feature existante.
    /// Idempotent: retourne l'index du champ existant s'il est déjà présent.
    pub fn add_field(&mut self, name: &str, field_type: FieldType) -> usize {
        if let Some(idx) = self.schema.index_of(name) {
            return idx;
        }
        let idx = self.schema.push(Field::new(name, field_type));
        for feature in &mut self.features {
            feature.attributes.resize(self.schema.len(), Value::Null);
        }
        idx
    }

    /// Index d'un champ, ou `FieldNotFound`
    pub fn field_index(&self, name: &str) -> Result<usize, CnError> {
        self.schema
            .index_of(name)
            .ok_or_else(|| CnError::field_not_found(&self.name, name))
    }

    /// Valeur d'un champ nommé pour une feature de cette couche
    pub fn value<'a>(&self, feature: &'a Feature, name: &str) -> Result<&'a Value, CnError> {
        Ok(feature.get(self.field_index(name)?))
    }

    /// Ajoute une feature avec un nouvel identifiant; les attributs sont complétés
    /// par des valeurs nulles jusqu'à la taille du schéma.
    pub fn push_feature(&mut self, geometry: Option<Geometry>, attributes: Vec<Value>) -> u64 {
        let id = self.next_id;
        self.push_feature_with_id(id, geometry, attributes);
        id
    }

    /// Ajoute une feature en conservant un identifiant existant
    pub fn push_feature_with_id(
        &mut self,
        id: u64,
        geometry: Option<Geometry>,
        mut attributes: Vec<Value>,
    ) {
        debug_assert!(
            attributes.len() <= self.schema.len(),
            "feature has more attributes than the schema"
        );
        attributes.resize(self.schema.len(), Value::Null);
        self.next_id = self.next_id.max(id + 1);
        self.features.push(Feature {
            id,
            geometry,
            attributes,
        });
    }

    /// Conserve les features satisfaisant le prédicat
    pub fn retain_features(&mut self, keep: impl FnMut(&Feature) -> bool) {
        self.features.retain(keep);
    }

    /// Réduit le schéma aux champs listés (l'ordre d'origine est conservé)
    pub fn retain_fields(&mut self, keep: &[&str]) {
        let kept: Vec<usize> = self
            .schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| keep.contains(&f.name.as_str()))
            .map(|(i, _)| i)
            .collect();

        let schema = Schema::new(
            kept.iter()
                .map(|&i| self.schema.fields()[i].clone())
                .collect(),
        );
        for feature in &mut self.features {
            feature.attributes = kept
                .iter()
                .map(|&i| feature.attributes.get(i).cloned().unwrap_or_default())
                .collect();
        }
        self.schema = schema;
    }

    /// Attributs d'une feature réordonnés selon un autre schéma (Null pour les champs absents)
    pub fn project_attributes(&self, feature: &Feature, target: &Schema) -> Vec<Value> {
        target
            .names()
            .map(|name| {
                self.schema
                    .index_of(name)
                    .map(|i| feature.get(i).clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Empreinte blake3 (hexadécimal) de la couche, calculée feature par feature.
    ///
    /// Une feature contribue son identifiant, ses attributs, son type de géométrie,
    /// son aire au mm² près et l'ensemble trié de ses sommets arrondis au
    /// millimètre. Le sommet de départ et le sens des anneaux n'ont pas d'effet.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Hasher::new();
        hasher.update(&self.epsg.to_le_bytes());
        for name in self.schema.names() {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
        }

        let mut vertices: Vec<(i64, i64)> = Vec::new();
        for feature in &self.features {
            hasher.update(&feature.id.to_le_bytes());
            for value in &feature.attributes {
                hash_value(&mut hasher, value);
            }

            let Some(geometry) = &feature.geometry else {
                hasher.update(&[0]);
                continue;
            };
            hasher.update(&[geometry_tag(geometry)]);
            hasher.update(&millimetres(geometry.unsigned_area() * 1_000.0).to_le_bytes());

            vertices.clear();
            vertices.extend(
                geometry
                    .coords_iter()
                    .map(|c| (millimetres(c.x), millimetres(c.y))),
            );
            vertices.sort_unstable();
            vertices.dedup();
            hasher.update(&(vertices.len() as u64).to_le_bytes());
            for (x, y) in &vertices {
                hasher.update(&x.to_le_bytes());
                hasher.update(&y.to_le_bytes());
            }
        }
        hex::encode(hasher.finalize().as_bytes())
    }
}

fn millimetres(metres: f64) -> i64 {
    (metres * 1_000.0).round() as i64
}

fn geometry_tag(geometry: &Geometry) -> u8 {
    match geometry {
        Geometry::Point(_) => 1,
        Geometry::MultiPoint(_) => 2,
        Geometry::Line(_) | Geometry::LineString(_) => 3,
        Geometry::MultiLineString(_) => 4,
        Geometry::Polygon(_) | Geometry::Rect(_) | Geometry::Triangle(_) => 5,
        Geometry::MultiPolygon(_) => 6,
        Geometry::GeometryCollection(_) => 7,
    }
}

fn hash_value(hasher: &mut Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(b"N");
        }
        Value::Int(i) => {
            hasher.update(b"I");
            hasher.update(&i.to_le_bytes());
        }
        Value::Float(f) => {
            hasher.update(b"F");
            hasher.update(&((f * 1e9).round() as i64).to_le_bytes());
        }
        Value::Text(s) => {
            hasher.update(b"T");
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
    }
}
