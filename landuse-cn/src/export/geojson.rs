//! Lecture GeoJSON (geojson) et écriture en streaming (geozero)

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use geojson::{GeoJson, JsonObject, JsonValue};
use geozero::geojson::GeoJsonWriter;
use geozero::GeozeroGeometry;
use tracing::debug;

use curvenumber::types::{Field, FieldType, Schema, EPSG_SJTSK};
use curvenumber::{Feature, Layer, Value};

/// Lit une FeatureCollection GeoJSON en couche.
///
/// Les types de champs sont déduits des valeurs (entier, réel, texte). Le SRID est
/// lu dans le membre `crs` s'il existe, EPSG:5514 sinon.
pub fn read_layer(path: &Path, name: &str) -> Result<Layer> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read GeoJSON file: {}", path.display()))?;
    let geojson: GeoJson = content
        .parse()
        .context(format!("Failed to parse GeoJSON file: {}", path.display()))?;

    let GeoJson::FeatureCollection(collection) = geojson else {
        bail!("{}: expected a FeatureCollection", path.display());
    };

    let epsg = collection
        .foreign_members
        .as_ref()
        .and_then(crs_epsg)
        .unwrap_or(EPSG_SJTSK);

    let schema = infer_schema(collection.features.iter().filter_map(|f| f.properties.as_ref()));
    let mut layer = Layer::with_schema(name, schema);
    layer.epsg = epsg;

    for feature in collection.features {
        let geometry = match feature.geometry {
            Some(g) => Some(
                geo::Geometry::<f64>::try_from(g)
                    .context(format!("Invalid geometry in {}", path.display()))?,
            ),
            None => None,
        };
        let attributes = layer
            .schema()
            .names()
            .map(|field| {
                feature
                    .properties
                    .as_ref()
                    .and_then(|p| p.get(field))
                    .map_or(Value::Null, json_to_value)
            })
            .collect();
        layer.push_feature(geometry, attributes);
    }

    debug!(file = %path.display(), layer = %name, features = layer.len(), epsg = epsg, "GeoJSON layer read");
    Ok(layer)
}

/// Nom de couche d'un fichier: son nom sans extension
pub fn layer_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn crs_epsg(members: &JsonObject) -> Option<u32> {
    let name = members
        .get("crs")?
        .get("properties")?
        .get("name")?
        .as_str()?;
    // urn:ogc:def:crs:EPSG::5514 ou EPSG:5514
    name.rsplit(':').next()?.trim().parse().ok()
}

fn infer_schema<'a>(properties: impl Iterator<Item = &'a JsonObject>) -> Schema {
    let mut fields: Vec<(String, Option<FieldType>)> = Vec::new();
    for props in properties {
        for (key, value) in props {
            let observed = match value {
                JsonValue::Null => None,
                JsonValue::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Integer),
                JsonValue::Number(_) => Some(FieldType::Double),
                _ => Some(FieldType::Text),
            };
            match fields.iter_mut().find(|(name, _)| name == key) {
                Some((_, current)) => *current = widen(*current, observed),
                None => fields.push((key.clone(), observed)),
            }
        }
    }
    Schema::new(
        fields
            .into_iter()
            .map(|(name, t)| Field::new(name, t.unwrap_or(FieldType::Text)))
            .collect(),
    )
}

fn widen(current: Option<FieldType>, observed: Option<FieldType>) -> Option<FieldType> {
    match (current, observed) {
        (None, t) | (t, None) => t,
        (Some(a), Some(b)) if a == b => Some(a),
        (Some(FieldType::Integer), Some(FieldType::Double))
        | (Some(FieldType::Double), Some(FieldType::Integer)) => Some(FieldType::Double),
        _ => Some(FieldType::Text),
    }
}

fn json_to_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map_or(Value::Null, Value::Float),
        },
        JsonValue::String(s) => Value::Text(s.clone()),
        JsonValue::Bool(b) => Value::Text(b.to_string()),
        other => Value::Text(other.to_string()),
    }
}

fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Int(i) => JsonValue::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number),
        Value::Text(s) => JsonValue::String(s.clone()),
    }
}

/// Écrit une couche en FeatureCollection GeoJSON avec membre `crs`
pub fn write_layer(layer: &Layer, output_path: &Path) -> Result<()> {
    let file = File::create(output_path)
        .context(format!("Failed to create file: {}", output_path.display()))?;
    let mut writer = BufWriter::new(file);

    write!(
        writer,
        r#"{{"type":"FeatureCollection","name":{},"crs":{{"type":"name","properties":{{"name":"urn:ogc:def:crs:EPSG::{}"}}}},"features":["#,
        JsonValue::String(layer.name.clone()),
        layer.epsg
    )?;

    for (i, feature) in layer.features().iter().enumerate() {
        if i > 0 {
            write!(writer, ",")?;
        }
        write_feature(&mut writer, layer.schema(), feature)?;
    }

    write!(writer, "]}}")?;
    writer.flush()?;

    debug!(file = %output_path.display(), features = layer.len(), "GeoJSON layer written");
    Ok(())
}

fn write_feature<W: Write>(writer: &mut W, schema: &Schema, feature: &Feature) -> Result<()> {
    write!(writer, r#"{{"type":"Feature","id":{},"geometry":"#, feature.id)?;

    match &feature.geometry {
        Some(geometry) => {
            let mut geom_buf = Vec::new();
            let mut geom_writer = GeoJsonWriter::new(&mut geom_buf);
            geometry.process_geom(&mut geom_writer)?;
            writer.write_all(&geom_buf)?;
        }
        None => write!(writer, "null")?,
    }

    let properties: JsonObject = schema
        .names()
        .zip(feature.attributes())
        .map(|(name, value)| (name.to_string(), value_to_json(value)))
        .collect();
    write!(writer, r#","properties":"#)?;
    serde_json::to_writer(&mut *writer, &properties)?;
    write!(writer, "}}")?;

    Ok(())
}
