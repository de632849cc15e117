//! Import et export des couches (GeoJSON)

pub mod geojson;

pub use self::geojson::{layer_name, read_layer, write_layer};
