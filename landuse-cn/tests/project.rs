//! Tests d'intégration: exécution complète d'un projet sur des fichiers temporaires

use std::path::{Path, PathBuf};

use curvenumber::CancellationToken;
use landuse_cn::export::read_layer;
use landuse_cn::{Pipeline, ProjectConfig, StageStatus};

const X0: f64 = -700_000.0;
const Y0: f64 = -1_100_000.0;

fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> String {
    let (x0, y0, x1, y1) = (X0 + x0, Y0 + y0, X0 + x1, Y0 + y1);
    format!(
        r#"{{"type":"Polygon","coordinates":[[[{x0},{y0}],[{x1},{y0}],[{x1},{y1}],[{x0},{y1}],[{x0},{y0}]]]}}"#
    )
}

fn collection(features: &[(String, &str)]) -> String {
    let features: Vec<String> = features
        .iter()
        .map(|(geometry, properties)| {
            format!(r#"{{"type":"Feature","geometry":{},"properties":{}}}"#, geometry, properties)
        })
        .collect();
    format!(
        r#"{{"type":"FeatureCollection","crs":{{"type":"name","properties":{{"name":"urn:ogc:def:crs:EPSG::5514"}}}},"features":[{}]}}"#,
        features.join(",")
    )
}

/// Crée un projet complet dans un répertoire temporaire et retourne le fichier projet
fn write_project(name: &str, runoff: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("landuse_cn_it_{}", name));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(dir.join("layers")).unwrap();

    let write = |file: &str, content: &str| std::fs::write(dir.join(file), content).unwrap();

    write(
        "layers/Orna_puda.geojson",
        &collection(&[(square(0.0, 0.0, 100.0, 100.0), r#"{"KOD":1}"#)]),
    );
    write(
        "layers/Lesy_kategorizovane.geojson",
        &collection(&[(square(0.0, 0.0, 50.0, 100.0), r#"{"KOD":null}"#)]),
    );
    write(
        "soil.geojson",
        &collection(&[(square(0.0, 0.0, 100.0, 60.0), r#"{"HSG":2}"#)]),
    );
    write(
        "keywords.yaml",
        "land_use:\n  - keywords: [les]\n    code: 30000\n  - keywords: [orna]\n    code: 10000\n",
    );
    write("order.csv", "Lesy_kategorizovane\nOrna_puda\n");
    write("cn.csv", "LandUse_code;A;B;C;D\n10000;67;78;85;89\n30000;30;55;70;77\n");
    write(
        "result.csv",
        "ID;H_N2T360_mm;P_N2tvarA_%;P_N2tvarB_%;P_N2tvarC_%;P_N2tvarD_%;P_N2tvarE_%;P_N2tvarF_%;\
QAPI_tvarA;QAPI_tvarB;QAPI_tvarC;QAPI_tvarD;QAPI_tvarE;QAPI_tvarF\n\
1;32,5;40;20;10;10;10;10;0,6;0,6;0,5;0,5;0,4;0,4\n",
    );
    write("service.yaml", "URL: https://hydro.example.org/wps\nprocess_identifier: d-rain-shape\n");

    let project = format!(
        r#"
name: {name}
land_use_layers:
  - layers/Orna_puda.geojson
  - layers/Lesy_kategorizovane.geojson
soil_layer: soil.geojson
aoi: {{ ymin: {ymin}, xmin: {xmin}, ymax: {ymax}, xmax: {xmax} }}
rules:
  keywords: keywords.yaml
  stacking_order: order.csv
cn_table: cn.csv
output_dir: out
runoff:
{runoff}
"#,
        name = name,
        ymin = Y0,
        xmin = X0,
        ymax = Y0 + 100.0,
        xmax = X0 + 100.0,
        runoff = runoff,
    );
    let path = dir.join("project.yaml");
    std::fs::write(&path, project).unwrap();
    path
}

fn total(path: &Path, field: &str) -> f64 {
    let layer = read_layer(path, "out").unwrap();
    let idx = layer.field_index(field).unwrap();
    layer
        .features()
        .iter()
        .filter_map(|f| f.get(idx).as_f64())
        .sum()
}

#[test]
fn test_direct_project() {
    let path = write_project("direct", "  depths_mm: [40.0]\n  abstraction_coefficient: 0.2");
    let config = ProjectConfig::load(&path).unwrap();
    let report = Pipeline::run(&config, &CancellationToken::new()).unwrap();

    assert!(
        matches!(report.status, StageStatus::Success | StageStatus::PartialSuccess),
        "unexpected status {:?}",
        report.status
    );
    let stages: Vec<_> = report.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(stages, vec!["stack", "soil", "intersect", "cn", "runoff"]);

    let out = config.output_dir.clone();
    for file in [
        "LandUse_Layer.geojson",
        "Soil_Layer_HSG.geojson",
        "Intersected_LandUse_HSG.geojson",
        "CN_Layer.geojson",
        "Runoff_Layer.geojson",
    ] {
        assert!(out.join(file).exists(), "{} not written", file);
    }

    let runoff = out.join("Runoff_Layer.geojson");
    assert!(total(&runoff, "SHAPE_Area") > 9_999.0);
    assert!(total(&runoff, "CN2_runoff_volume_m3") > 0.0);

    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn test_weighted_project() {
    let path = write_project(
        "weighted",
        "  return_periods: [N2]\n  result_table: result.csv\n  service: service.yaml",
    );
    let config = ProjectConfig::load(&path).unwrap();
    let report = Pipeline::run(&config, &CancellationToken::new()).unwrap();
    assert!(!report.is_failed(), "{}", report.summary());

    let runoff = config.output_dir.join("Runoff_Layer.geojson");
    let v2 = total(&runoff, "CN2_N2_runoff_volume_m3");
    let v3 = total(&runoff, "CN3_N2_runoff_volume_m3");
    let weighted = total(&runoff, "V_N2_m3");
    assert!(weighted > 0.0);
    assert!(weighted >= v2.min(v3) - 1e-9 && weighted <= v2.max(v3) + 1e-9);

    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn test_cancelled_project() {
    let path = write_project("cancelled", "  depths_mm: [40.0]");
    let config = ProjectConfig::load(&path).unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let report = Pipeline::run(&config, &token).unwrap();
    assert_eq!(report.status, StageStatus::Cancelled);
    assert_eq!(report.stages.len(), 1);
    assert!(!config.output_dir.join("LandUse_Layer.geojson").exists());

    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn test_layer_outside_sjtsk_is_rejected() {
    let path = write_project("wrong_crs", "  depths_mm: [40.0]");
    let dir = path.parent().unwrap();
    let content = std::fs::read_to_string(dir.join("soil.geojson"))
        .unwrap()
        .replace("EPSG::5514", "EPSG::4326");
    std::fs::write(dir.join("soil.geojson"), content).unwrap();

    let config = ProjectConfig::load(&path).unwrap();
    assert!(Pipeline::run(&config, &CancellationToken::new()).is_err());

    std::fs::remove_dir_all(dir).ok();
}
