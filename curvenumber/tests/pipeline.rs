//! Tests d'intégration: empilement, superposition avec le sol, CN et ruissellement

use curvenumber::cn::{create_cn_layer, CnTable, WATER_BODY_CN};
use curvenumber::intersection::{intersect, prepare_soil_layer};
use curvenumber::rules::{BufferRule, ClassificationRules, KeywordRule};
use curvenumber::runoff::{calculate_runoff, compute_direct_runoff, total, RunoffParams};
use curvenumber::stacker::{LandUseStacker, StackingConfig, StackingOrder};
use curvenumber::types::{fields, FieldType};
use curvenumber::{Aoi, Layer, StageContext, Value};
use geo::{Area, Geometry, Intersects, LineString, Rect};

const CN_TABLE: &str = "LandUse_code;A;B;C;D\n\
10000;67;78;85;89\n\
30000;30;55;70;77\n\
50000;98;98;98;98\n";

fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Option<Geometry> {
    Some(Geometry::Polygon(Rect::new((x0, y0), (x1, y1)).to_polygon()))
}

fn polygon_layer(name: &str, geometry: Option<Geometry>) -> Layer {
    let mut layer = Layer::new(name);
    layer.push_feature(geometry, Vec::new());
    layer
}

fn aoi() -> Aoi {
    Aoi::Extent(Rect::new((0.0, 0.0), (100.0, 100.0)))
}

fn stacking_config() -> StackingConfig {
    StackingConfig {
        classification: ClassificationRules::new(vec![
            KeywordRule::new(["les"], 30000),
            KeywordRule::new(["orna"], 10000),
            KeywordRule::new(["silnic"], 50000),
        ]),
        buffers: vec![BufferRule::uniform("Silnice", 5.0)],
        order: StackingOrder::new(["Silnice", "Lesy_kategorizovane", "Orna_puda"]),
        ..Default::default()
    }
}

fn source_layers() -> Vec<Layer> {
    let mut roads = Layer::new("Silnice");
    roads.push_feature(
        Some(Geometry::LineString(LineString::from(vec![(0.0, 50.0), (100.0, 50.0)]))),
        Vec::new(),
    );
    vec![
        polygon_layer("Orna_puda", rect(0.0, 0.0, 100.0, 100.0)),
        polygon_layer("Lesy_kategorizovane", rect(0.0, 0.0, 50.0, 100.0)),
        roads,
    ]
}

fn soil_layer() -> Layer {
    let mut soil = Layer::new("HPJ_HSG");
    soil.add_field(fields::HSG, FieldType::Integer);
    soil.push_feature(rect(0.0, 0.0, 100.0, 60.0), vec![Value::Int(2)]);
    soil
}

fn area_by_source(layer: &Layer, source: &str) -> f64 {
    let idx = layer.field_index(fields::SOURCE).unwrap();
    layer
        .features()
        .iter()
        .filter(|f| f.get(idx).as_str() == Some(source))
        .map(|f| f.geometry.as_ref().unwrap().unsigned_area())
        .sum()
}

#[test]
fn test_stacked_layer_has_no_overlap() {
    let config = stacking_config();
    let aoi = aoi();
    let mut ctx = StageContext::default();
    let composite = LandUseStacker::new(&config, &aoi)
        .run(source_layers(), &mut ctx)
        .unwrap();

    assert!((area_by_source(&composite, "Silnice") - 1000.0).abs() < 1e-3);
    assert!((area_by_source(&composite, "Lesy_kategorizovane") - 4500.0).abs() < 1e-3);
    assert!((area_by_source(&composite, "Orna_puda") - 4500.0).abs() < 1e-3);

    let features = composite.features();
    for (i, a) in features.iter().enumerate() {
        for b in &features[i + 1..] {
            let (ga, gb) = (a.geometry.as_ref().unwrap(), b.geometry.as_ref().unwrap());
            if ga.intersects(gb) {
                let shared = curvenumber::geometry::intersection_pair(
                    &curvenumber::geometry::to_multi_polygon(ga).unwrap(),
                    &curvenumber::geometry::to_multi_polygon(gb).unwrap(),
                )
                .unwrap();
                assert!(shared.unsigned_area() < 1e-6);
            }
        }
    }
}

#[test]
fn test_stacked_codes_follow_keywords() {
    let config = stacking_config();
    let aoi = aoi();
    let composite = LandUseStacker::new(&config, &aoi)
        .run(source_layers(), &mut StageContext::default())
        .unwrap();

    let source = composite.field_index(fields::SOURCE).unwrap();
    let code = composite.field_index(fields::LAND_USE_CODE).unwrap();
    for feature in composite.features() {
        let expected = match feature.get(source).as_str() {
            Some("Lesy_kategorizovane") => 30000,
            Some("Orna_puda") => 10000,
            Some("Silnice") => 50000,
            other => panic!("unexpected source {:?}", other),
        };
        assert_eq!(feature.get(code), &Value::Int(expected));
    }
}

#[test]
fn test_full_direct_pipeline() {
    let config = stacking_config();
    let aoi = aoi();
    let mut ctx = StageContext::default();

    let land_use = LandUseStacker::new(&config, &aoi)
        .run(source_layers(), &mut ctx)
        .unwrap();
    let soil = prepare_soil_layer(&soil_layer(), &aoi).unwrap();
    let intersected = intersect(land_use, soil, &mut ctx).unwrap();

    let total_area: f64 = intersected
        .features()
        .iter()
        .map(|f| f.geometry.as_ref().unwrap().unsigned_area())
        .sum();
    assert!((total_area - 10_000.0).abs() < 1e-3);

    let table = CnTable::parse(CN_TABLE, "cn.csv").unwrap();
    let cn_layer = create_cn_layer(&intersected, &table, &mut ctx).unwrap();
    let cn2 = cn_layer.field_index(fields::CN2).unwrap();
    assert!(cn_layer.features().iter().all(|f| !f.get(cn2).is_null()));

    let water: f64 = cn_layer
        .features()
        .iter()
        .filter(|f| f.get(cn2).as_f64() == Some(WATER_BODY_CN))
        .map(|f| f.geometry.as_ref().unwrap().unsigned_area())
        .sum();
    assert!((water - 4000.0).abs() < 1e-3);

    let params = RunoffParams::direct(vec![40.0], 0.2);
    let runoff = compute_direct_runoff(cn_layer, &params, &mut ctx).unwrap();
    let v2 = total(&runoff, "CN2_runoff_volume_m3").unwrap();
    let v3 = total(&runoff, "CN3_runoff_volume_m3").unwrap();
    assert!(v2 > 0.0);
    assert!(v3 > v2);
    assert!(ctx.warnings().is_empty());
}

#[test]
fn test_cn_assignment_is_deterministic() {
    let config = stacking_config();
    let aoi = aoi();
    let mut ctx = StageContext::default();
    let land_use = LandUseStacker::new(&config, &aoi)
        .run(source_layers(), &mut ctx)
        .unwrap();
    let soil = prepare_soil_layer(&soil_layer(), &aoi).unwrap();
    let intersected = intersect(land_use, soil, &mut ctx).unwrap();

    let table = CnTable::parse(CN_TABLE, "cn.csv").unwrap();
    let first = create_cn_layer(&intersected, &table, &mut ctx).unwrap();
    let second = create_cn_layer(&intersected, &table, &mut ctx).unwrap();
    assert_eq!(first.fingerprint(), second.fingerprint());
}

#[test]
fn test_reference_runoff_values() {
    let (r2, r3) = calculate_runoff(50.0, 60.0, 100.0, 10.0, 0.2);
    assert!((r2.height_mm - 7.806).abs() < 5e-3);
    assert!((r2.volume_m3 - 0.7806).abs() < 5e-4);
    assert!((r3.height_mm - 3.916).abs() < 5e-3);
    assert!((r3.volume_m3 - 0.3916).abs() < 5e-4);
}
