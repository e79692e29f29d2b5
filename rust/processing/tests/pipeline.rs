// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run policies, group deferral, filtering and batching against the
//! in-memory store.

use std::sync::Arc;

use citydb_lite_core::{
    BatchSizes, CompareOp, EngineConfig, FailurePolicy, Feature, FeatureProperty, FeatureRef,
    FeatureType, Geometry, GeometryKind, GeometryMember, Lod, LodFilter, LodMode, Polygon,
    Predicate, Projection, QueryDescriptor, Representation, SchemaMapping,
};
use citydb_lite_processing::{
    export, import, CancelToken, Error, ExportedFeature, FeatureInsert, MemberInsert, MemoryStore,
    RunReport, RunStatus, Storage, WriteBatch,
};
use tokio::sync::mpsc;

fn square(x: f64, z: f64) -> Polygon {
    Polygon::new(vec![
        [x, 0.0, z],
        [x + 1.0, 0.0, z],
        [x + 1.0, 1.0, z],
        [x, 1.0, z],
        [x, 0.0, z],
    ])
}

fn surfaces(x: f64, z: f64) -> Geometry {
    Geometry::new(GeometryKind::MultiSurface(vec![Geometry::polygon(square(x, z)).into()]))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(policy: FailurePolicy) -> EngineConfig {
    init_tracing();
    EngineConfig::default()
        .with_workers(1, 1)
        .with_queue_capacity(8)
        .with_failure_policy(policy)
        .with_id_block_size(8)
        .with_write_batch_size(4)
        .with_max_reference_chain(16)
}

fn schema() -> Arc<SchemaMapping> {
    Arc::new(SchemaMapping::citydb())
}

fn generic(gml_id: &str, x: f64) -> Feature {
    Feature::new(FeatureType::GenericCityObject)
        .with_gml_id(gml_id)
        .with_geometry(Lod::Lod1, Representation::Geometry, surfaces(x, 0.0))
}

async fn load(
    store: &Arc<MemoryStore>,
    features: Vec<Feature>,
    policy: FailurePolicy,
) -> citydb_lite_processing::Result<RunReport> {
    import(
        store.clone(),
        schema(),
        config(policy),
        CancelToken::new(),
        futures::stream::iter(features),
    )
    .await
}

async fn run_export(
    store: &Arc<MemoryStore>,
    descriptor: QueryDescriptor,
    policy: FailurePolicy,
) -> citydb_lite_processing::Result<(RunReport, Vec<ExportedFeature>)> {
    let (tx, mut rx) = mpsc::channel(256);
    let report = export(store.clone(), descriptor, &config(policy), CancelToken::new(), tx).await?;
    let mut out = Vec::new();
    while let Ok(feature) = rx.try_recv() {
        out.push(feature);
    }
    out.sort_by_key(|f| f.sequence);
    Ok((report, out))
}

#[tokio::test]
async fn forward_member_references_are_parked_until_seen() {
    let store = Arc::new(MemoryStore::default());
    let group = Feature::new(FeatureType::CityObjectGroup)
        .with_gml_id("grp-1")
        .with_child("groupMember", generic("gen-1", 0.0))
        .with_reference("groupMember", "#bldg-2", Some("landmark"));
    let building = Feature::new(FeatureType::Building).with_gml_id("bldg-2");

    let report = load(&store, vec![group, building], FailurePolicy::FailFast)
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.summary.unresolved(), 0);
    assert_eq!(store.member_count(), 2);
    assert_eq!(store.feature_count(), 3);
}

#[tokio::test]
async fn groups_export_last_and_reference_known_members() {
    let store = Arc::new(MemoryStore::default());
    let group = Feature::new(FeatureType::CityObjectGroup)
        .with_gml_id("grp-1")
        .with_name("landmarks")
        .with_child("groupMember", generic("gen-1", 0.0))
        .with_reference("groupMember", "bldg-2", Some("landmark"));
    let building = Feature::new(FeatureType::Building).with_gml_id("bldg-2");
    load(&store, vec![group, building], FailurePolicy::FailFast)
        .await
        .unwrap();

    let (report, exported) = run_export(&store, QueryDescriptor::new(schema()), FailurePolicy::FailFast)
        .await
        .unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.submitted, 3);
    assert_eq!(exported.len(), 3);

    let group = exported
        .iter()
        .map(|e| &e.feature)
        .find(|f| f.feature_type == FeatureType::CityObjectGroup)
        .unwrap();
    assert_eq!(
        group.children,
        vec![
            FeatureProperty {
                name: "groupMember".into(),
                role: None,
                target: FeatureRef::Reference("gen-1".into()),
            },
            FeatureProperty {
                name: "groupMember".into(),
                role: Some("landmark".into()),
                target: FeatureRef::Reference("bldg-2".into()),
            },
        ]
    );
    assert_eq!(report.summary.counts("CityObjectGroup").processed, 1);
}

#[tokio::test]
async fn unresolved_member_follows_failure_policy() {
    let group = || {
        Feature::new(FeatureType::CityObjectGroup)
            .with_gml_id("grp-9")
            .with_reference("groupMember", "#nowhere", None)
    };

    let store = Arc::new(MemoryStore::default());
    let err = load(&store, vec![group()], FailurePolicy::FailFast)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnresolvedMember { ref href, .. } if href == "nowhere"));

    let store = Arc::new(MemoryStore::default());
    let report = load(&store, vec![group()], FailurePolicy::BestEffort)
        .await
        .unwrap();
    assert_eq!(report.summary.unresolved(), 1);
    assert_eq!(report.summary.counts("CityObjectGroup").unresolved, 1);
    assert_eq!(store.member_count(), 0);
}

#[tokio::test]
async fn circular_geometry_links_are_reported_not_fatal() {
    let looped = |gml_id: &str, own: &str, other: &str| {
        Feature::new(FeatureType::GenericCityObject)
            .with_gml_id(gml_id)
            .with_geometry(
                Lod::Lod1,
                Representation::Geometry,
                Geometry::new(GeometryKind::MultiSurface(vec![
                    Geometry::polygon(square(0.0, 0.0)).into(),
                    GeometryMember::XLink(other.to_string()),
                ]))
                .with_gml_id(own),
            )
    };
    let store = Arc::new(MemoryStore::default());
    let report = load(
        &store,
        vec![looped("gen-a", "ms-a", "ms-b"), looped("gen-b", "ms-b", "ms-a")],
        FailurePolicy::FailFast,
    )
    .await
    .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.summary.skipped_count(), 2);
    assert_eq!(report.summary.counts("GenericCityObject").processed, 2);
    // nothing was copied
    assert_eq!(store.geometry_count(), 4);
}

fn raw_feature(id: i64, feature_type: FeatureType, gml_id: &str, table: &str) -> FeatureInsert {
    FeatureInsert {
        id,
        type_code: feature_type.code(),
        parent_id: None,
        gml_id: gml_id.into(),
        name: None,
        description: None,
        envelope: None,
        table: table.into(),
        values: Vec::new(),
        geometry: Vec::new(),
    }
}

#[tokio::test]
async fn missing_geometry_keeps_the_feature() {
    let store = Arc::new(MemoryStore::default());
    load(&store, vec![generic("gen-1", 0.0), generic("gen-2", 2.0)], FailurePolicy::FailFast)
        .await
        .unwrap();
    // geometry column pointing at a tree that does not exist
    let mut broken = raw_feature(900, FeatureType::GenericCityObject, "broken", "generic_cityobject");
    broken.geometry = vec![("lod1_geometry_id".into(), 999)];
    store
        .write(WriteBatch {
            features: vec![broken],
            ..WriteBatch::default()
        })
        .await
        .unwrap();

    for policy in [FailurePolicy::BestEffort, FailurePolicy::FailFast] {
        let (report, exported) = run_export(&store, QueryDescriptor::new(schema()), policy)
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(exported.len(), 3);
        let broken = exported
            .iter()
            .find(|e| e.feature.gml_id.as_deref() == Some("broken"))
            .unwrap();
        assert!(broken.feature.geometries.is_empty());
        assert_eq!(report.summary.skipped_count(), 0);
        assert_eq!(report.summary.missing_geometry(), 1);
        assert_eq!(report.summary.counts("GenericCityObject").missing_geometry, 1);
        assert_eq!(report.summary.counts("GenericCityObject").processed, 3);
    }
}

#[tokio::test]
async fn dangling_group_member_skips_or_aborts() {
    let store = Arc::new(MemoryStore::default());
    load(&store, vec![generic("gen-1", 0.0)], FailurePolicy::FailFast)
        .await
        .unwrap();
    // membership row whose member was never written
    store
        .write(WriteBatch {
            features: vec![raw_feature(800, FeatureType::CityObjectGroup, "grp-x", "cityobjectgroup")],
            members: vec![MemberInsert {
                group_id: 800,
                member_id: 12345,
                role: None,
            }],
            ..WriteBatch::default()
        })
        .await
        .unwrap();

    let (report, exported) = run_export(&store, QueryDescriptor::new(schema()), FailurePolicy::BestEffort)
        .await
        .unwrap();
    assert_eq!(exported.len(), 1);
    assert_eq!(report.summary.skipped_count(), 1);
    assert_eq!(report.summary.counts("CityObjectGroup").skipped, 1);

    let err = run_export(&store, QueryDescriptor::new(schema()), FailurePolicy::FailFast)
        .await
        .unwrap_err();
    assert!(err.is_recoverable());
    assert!(matches!(err, Error::UnresolvedMember { group_id: 800, ref href } if href == "12345"));
}

#[tokio::test]
async fn shared_members_are_inlined_once() {
    let store = Arc::new(MemoryStore::default());
    let group = |gml_id: &str| {
        Feature::new(FeatureType::CityObjectGroup)
            .with_gml_id(gml_id)
            .with_reference("groupMember", "bldg-1", None)
    };
    let building = Feature::new(FeatureType::Building).with_gml_id("bldg-1");
    load(&store, vec![building, group("g1"), group("g2")], FailurePolicy::FailFast)
        .await
        .unwrap();

    let descriptor = QueryDescriptor::new(schema()).with_types(&[FeatureType::CityObjectGroup]);
    let (report, exported) = run_export(&store, descriptor, FailurePolicy::FailFast)
        .await
        .unwrap();
    assert_eq!(exported.len(), 2);
    assert_eq!(report.summary.processed(), 2);

    let targets: Vec<&FeatureRef> = exported
        .iter()
        .flat_map(|e| e.feature.children.iter())
        .map(|p| &p.target)
        .collect();
    assert_eq!(targets.len(), 2);
    let inline: Vec<_> = targets
        .iter()
        .filter_map(|t| match t {
            FeatureRef::Inline(f) => Some(f),
            FeatureRef::Reference(_) => None,
        })
        .collect();
    assert_eq!(inline.len(), 1);
    assert_eq!(inline[0].gml_id.as_deref(), Some("bldg-1"));
    assert!(targets
        .iter()
        .any(|t| matches!(t, FeatureRef::Reference(href) if href == "bldg-1")));
}

#[tokio::test]
async fn filter_projection_and_lod_selection() {
    let store = Arc::new(MemoryStore::default());
    let tall = Feature::new(FeatureType::Building)
        .with_gml_id("tall")
        .with_attribute("measuredHeight", 40.0)
        .with_attribute("class", "office")
        .with_geometry(Lod::Lod1, Representation::MultiSurface, surfaces(0.0, 1.0))
        .with_geometry(Lod::Lod2, Representation::MultiSurface, surfaces(0.0, 2.0))
        .with_child(
            "boundedBy",
            Feature::new(FeatureType::WallSurface).with_gml_id("wall"),
        );
    let short = Feature::new(FeatureType::Building)
        .with_gml_id("short")
        .with_attribute("measuredHeight", 6.0)
        .with_geometry(Lod::Lod1, Representation::MultiSurface, surfaces(5.0, 1.0));
    let low_detail = Feature::new(FeatureType::Building)
        .with_gml_id("low-detail")
        .with_attribute("measuredHeight", 25.0)
        .with_geometry(Lod::Lod1, Representation::MultiSurface, surfaces(9.0, 1.0));
    load(&store, vec![tall, short, low_detail], FailurePolicy::FailFast)
        .await
        .unwrap();

    let descriptor = QueryDescriptor::new(schema())
        .with_types(&[FeatureType::Building])
        .with_filter(Predicate::compare("measuredHeight", CompareOp::Gt, 20i64))
        .with_projection(Projection::All.only(FeatureType::Building, &["measuredHeight", "lod1MultiSurface", "lod2MultiSurface"]))
        .with_lods(LodFilter::new(&[Lod::Lod1, Lod::Lod2], LodMode::Highest));
    let (_, exported) = run_export(&store, descriptor, FailurePolicy::FailFast)
        .await
        .unwrap();

    let ids: Vec<_> = exported.iter().map(|e| e.feature.gml_id.as_deref().unwrap()).collect();
    assert_eq!(ids, vec!["tall", "low-detail"]);

    let tall = &exported[0].feature;
    assert!(tall.children.is_empty());
    assert!(!tall.attributes.contains_key("class"));
    let lods: Vec<_> = tall.geometries.iter().map(|g| g.lod).collect();
    assert_eq!(lods, vec![Lod::Lod2]);
    // only tier present falls back
    assert_eq!(exported[1].feature.geometries[0].lod, Lod::Lod1);
}

#[tokio::test]
async fn affine_transform_moves_geometry_and_envelope() {
    let store = Arc::new(MemoryStore::default());
    load(&store, vec![generic("gen-1", 0.0)], FailurePolicy::FailFast)
        .await
        .unwrap();

    let shift = [[1.0, 0.0, 0.0, 100.0], [0.0, 1.0, 0.0, -50.0], [0.0, 0.0, 1.0, 0.0]];
    let (_, exported) = run_export(
        &store,
        QueryDescriptor::new(schema()).with_transform(shift),
        FailurePolicy::FailFast,
    )
    .await
    .unwrap();

    let envelope = exported[0].envelope.unwrap();
    assert_eq!(envelope.min, [100.0, -50.0, 0.0]);
    assert_eq!(envelope.max, [101.0, -49.0, 0.0]);
    let geometry = exported[0].feature.geometries[0].geometry.as_inline().unwrap();
    match &geometry.members()[0].as_inline().unwrap().kind {
        GeometryKind::Polygon(p) => assert_eq!(p.exterior[0], [100.0, -50.0, 0.0]),
        other => panic!("expected polygon, got {:?}", other),
    }
}

#[tokio::test]
async fn reads_are_coalesced_per_batch() {
    let store = Arc::new(MemoryStore::default());
    let features: Vec<Feature> = (0..10).map(|i| generic(&format!("gen-{i}"), i as f64)).collect();
    load(&store, features, FailurePolicy::FailFast).await.unwrap();
    // write batch of four features: 4 + 4 + 2
    assert_eq!(store.round_trips().write, 3);

    store.reset_round_trips();
    let descriptor = QueryDescriptor::new(schema()).with_batch(BatchSizes::uniform(4));
    let (report, exported) = run_export(&store, descriptor, FailurePolicy::FailFast)
        .await
        .unwrap();
    assert_eq!(exported.len(), 10);
    assert_eq!(report.summary.processed(), 10);
    let trips = store.round_trips();
    assert_eq!(trips.features, 3);
    assert_eq!(trips.geometry, 3);
    assert_eq!(trips.top_level, 1);
    assert_eq!(trips.point, 0);

    // batching off: one keyed statement per feature row and per geometry tree
    store.reset_round_trips();
    let descriptor = QueryDescriptor::new(schema()).with_batch(BatchSizes::uniform(1));
    let (_, exported) = run_export(&store, descriptor, FailurePolicy::FailFast)
        .await
        .unwrap();
    assert_eq!(exported.len(), 10);
    let trips = store.round_trips();
    assert_eq!((trips.features, trips.geometry), (0, 0));
    assert_eq!(trips.point, 20);
}

#[tokio::test]
async fn cancelled_runs_stop_before_dispatch() {
    let store = Arc::new(MemoryStore::default());
    let cancel = CancelToken::new();
    cancel.cancel();
    let report = import(
        store.clone(),
        schema(),
        config(FailurePolicy::FailFast),
        cancel.clone(),
        futures::stream::iter(vec![generic("gen-1", 0.0)]),
    )
    .await
    .unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.submitted, 0);
    assert_eq!(store.feature_count(), 0);

    load(&store, vec![generic("gen-2", 0.0)], FailurePolicy::FailFast)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    let report = export(
        store.clone(),
        QueryDescriptor::new(schema()),
        &config(FailurePolicy::FailFast),
        cancel,
        tx,
    )
    .await
    .unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.summary.processed(), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn consumer_cancels_midway() {
    let store = Arc::new(MemoryStore::default());
    let features: Vec<Feature> = (0..40).map(|i| generic(&format!("gen-{i}"), i as f64)).collect();
    load(&store, features, FailurePolicy::FailFast).await.unwrap();

    let cancel = CancelToken::new();
    let (tx, mut rx) = mpsc::channel(1);
    let config = config(FailurePolicy::FailFast).with_queue_capacity(1);
    let descriptor = QueryDescriptor::new(schema()).with_batch(BatchSizes::uniform(1));
    let run = tokio::spawn({
        let store = store.clone();
        let cancel = cancel.clone();
        async move { export(store, descriptor, &config, cancel, tx).await }
    });

    let mut before = 0;
    while before < 5 {
        rx.recv().await.unwrap();
        before += 1;
    }
    cancel.cancel();
    let mut after = 0;
    while rx.recv().await.is_some() {
        after += 1;
    }

    let report = tokio::time::timeout(std::time::Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(report.summary.processed() >= 5);
    assert_eq!(report.summary.processed(), before + after);
    assert!(report.submitted < 40);
    // channel slot, the unit in hand and the one queued behind it
    assert!(after <= 4, "{after} features arrived after cancelling");
}
