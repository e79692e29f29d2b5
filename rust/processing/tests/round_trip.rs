// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Import a small city model into the in-memory store and read it back.

use std::sync::Arc;

use citydb_lite_core::{
    EngineConfig, FailurePolicy, Feature, FeatureType, Geometry, GeometryKind, GeometryMember, Lod,
    Polygon, QueryDescriptor, Representation, SchemaMapping, XLinkOutput,
};
use citydb_lite_processing::{export, import, CancelToken, ExportedFeature, MemoryStore, RunStatus};
use tokio::sync::mpsc;

fn panel(x: f64) -> Polygon {
    Polygon::new(vec![
        [x, 0.0, 0.0],
        [x + 1.0, 0.0, 0.0],
        [x + 1.0, 1.0, 2.0],
        [x, 1.0, 2.0],
        [x, 0.0, 0.0],
    ])
}

fn multi_surface(members: Vec<GeometryMember>) -> Geometry {
    Geometry::new(GeometryKind::MultiSurface(members))
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_workers(1, 1)
        .with_queue_capacity(8)
        .with_failure_policy(FailurePolicy::FailFast)
        .with_id_block_size(4)
        .with_write_batch_size(2)
        .with_max_reference_chain(16)
}

fn town_hall() -> Feature {
    let roof_a = Feature::new(FeatureType::RoofSurface)
        .with_gml_id("roof-a")
        .with_name("north")
        .with_geometry(
            Lod::Lod2,
            Representation::MultiSurface,
            multi_surface(vec![Geometry::polygon(panel(0.0)).with_gml_id("panel-a").into()]),
        );
    let roof_b = Feature::new(FeatureType::RoofSurface)
        .with_gml_id("roof-b")
        .with_geometry(
            Lod::Lod2,
            Representation::MultiSurface,
            multi_surface(vec![
                Geometry::polygon(panel(1.0)).into(),
                GeometryMember::XLink("panel-a".into()),
            ]),
        );
    let part = Feature::new(FeatureType::BuildingPart)
        .with_gml_id("part-1")
        .with_attribute("roofType", "flat")
        .with_geometry(
            Lod::Lod1,
            Representation::Solid,
            Geometry::new(GeometryKind::Solid(vec![Geometry::new(GeometryKind::CompositeSurface(
                vec![Geometry::polygon(panel(4.0)).into(), Geometry::polygon(panel(5.0)).into()],
            ))
            .into()])),
        );
    Feature::new(FeatureType::Building)
        .with_gml_id("bldg-1")
        .with_name("Town hall")
        .with_description("civic centre")
        .with_attribute("class", "civic")
        .with_attribute("measuredHeight", 12.5)
        .with_attribute("storeysAboveGround", 3i64)
        .with_geometry(
            Lod::Lod1,
            Representation::MultiSurface,
            multi_surface(vec![Geometry::polygon(panel(8.0)).into()]),
        )
        .with_child("consistsOfBuildingPart", part)
        .with_child("boundedBy", roof_a)
        .with_child("boundedBy", roof_b)
}

fn sculptures() -> Vec<Feature> {
    let original = Feature::new(FeatureType::GenericCityObject)
        .with_gml_id("gen-a")
        .with_attribute("function", "sculpture")
        .with_geometry(
            Lod::Lod1,
            Representation::Geometry,
            multi_surface(vec![Geometry::polygon(panel(20.0)).into()]).with_gml_id("ms-shared"),
        );
    let replica = Feature::new(FeatureType::GenericCityObject)
        .with_gml_id("gen-b")
        .with_geometry(
            Lod::Lod1,
            Representation::Geometry,
            GeometryMember::XLink("ms-shared".into()),
        );
    vec![original, replica]
}

async fn load(features: Vec<Feature>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::default());
    let schema = Arc::new(SchemaMapping::citydb());
    let report = import(
        store.clone(),
        schema,
        config(),
        CancelToken::new(),
        futures::stream::iter(features),
    )
    .await
    .expect("import");
    assert_eq!(report.status, RunStatus::Completed);
    store
}

async fn read_back(store: &Arc<MemoryStore>, descriptor: QueryDescriptor) -> Vec<ExportedFeature> {
    let (tx, mut rx) = mpsc::channel(64);
    let report = export(store.clone(), descriptor, &config(), CancelToken::new(), tx)
        .await
        .expect("export");
    assert_eq!(report.status, RunStatus::Completed);
    let mut out = Vec::new();
    while let Ok(feature) = rx.try_recv() {
        out.push(feature);
    }
    out.sort_by_key(|f| f.sequence);
    out
}

fn descriptor() -> QueryDescriptor {
    QueryDescriptor::new(Arc::new(SchemaMapping::citydb()))
}

#[tokio::test]
async fn export_reproduces_imported_features() {
    let mut input = vec![town_hall()];
    input.extend(sculptures());
    let store = load(input.clone()).await;
    assert_eq!(store.feature_count(), 6);

    let exported = read_back(&store, descriptor()).await;
    let features: Vec<Feature> = exported.iter().map(|e| e.feature.clone()).collect();
    assert_eq!(features, input);
    assert!(exported[0].envelope.is_some());
}

#[tokio::test]
async fn resolved_xlinks_are_marked_in_storage() {
    let store = load(sculptures()).await;
    let rows = store.geometry_rows_all();
    // two rows for the source tree, two for its copy
    assert_eq!(rows.len(), 4);
    let shared: Vec<_> = rows
        .iter()
        .filter(|r| r.gml_id.as_deref() == Some("ms-shared"))
        .collect();
    assert_eq!(shared.len(), 2);
    assert!(shared.iter().all(|r| r.xlink.code() == 2));

    let replica = store.feature_id("gen-b").unwrap();
    assert_eq!(rows.iter().filter(|r| r.feature_id == replica).count(), 2);
}

#[tokio::test]
async fn duplicate_output_materializes_every_occurrence() {
    let store = load(vec![town_hall()]).await;
    let exported = read_back(&store, descriptor().with_xlinks(XLinkOutput::Duplicate)).await;
    let building = &exported[0].feature;

    let roof_b = building
        .descendants()
        .into_iter()
        .find(|f| f.gml_id.as_deref() == Some("roof-b"))
        .cloned()
        .unwrap();
    let geometry = roof_b.geometries[0].geometry.as_inline().unwrap();
    let copy = geometry.members()[1].as_inline().unwrap();
    assert!(copy.gml_id.as_deref().unwrap().starts_with("ID_"));
    assert_eq!(copy.kind, GeometryKind::Polygon(panel(0.0)));
}
