// Shared geometry: decompose with a by-reference member, resolve the link by
// copying the target subtree, then rebuild with and without by-reference output.
use citydb_lite_core::{
    DuplicateIdPolicy, Geometry, GeometryKind, GeometryMember, Polygon, ReferenceCache,
    XLinkOutput,
};
use citydb_lite_geometry::{
    copy_subtree, decompose, CopyTarget, DuplicateIds, GeometryForest, IdBlock, XLinkContext,
    XLinkKind,
};

fn wall(x: f64) -> Polygon {
    Polygon::new(vec![
        [x, 0.0, 0.0],
        [x, 5.0, 0.0],
        [x, 5.0, 3.0],
        [x, 0.0, 3.0],
        [x, 0.0, 0.0],
    ])
}

fn resolved_forest() -> (GeometryForest, i64) {
    let property: GeometryMember = Geometry::new(GeometryKind::MultiSurface(vec![
        Geometry::polygon(wall(0.0)).with_gml_id("wall-a").into(),
        GeometryMember::XLink("#wall-a".into()),
    ]))
    .into();

    let mut ids = IdBlock::new((1..100).collect());
    let mut d = decompose(&property, 500, &mut ids).expect("decompose");
    let root = d.root_id.expect("root row");
    assert_eq!(d.links.len(), 1);
    let link = d.links.remove(0);
    assert_eq!(link.href, "wall-a");

    // Source row is marked and a copy is attached under the link's parent.
    let source = d.rows.iter().position(|r| r.gml_id.as_deref() == Some("wall-a")).unwrap();
    d.rows[source].xlink = XLinkKind::Local;
    let source_id = d.rows[source].id;
    let forest = GeometryForest::from_rows(d.rows.clone());
    let copy = copy_subtree(
        &forest,
        source_id,
        CopyTarget {
            parent_id: link.parent_id,
            root_id: link.root_id,
            reversed: link.reversed,
            xlink: XLinkKind::Local,
            feature_id: 500,
        },
        &mut ids,
    )
    .expect("copy");

    let forest = GeometryForest::from_rows(d.rows.into_iter().chain(copy));
    (forest, root)
}

#[test]
fn copy_rebuilds_as_reference() {
    let (forest, root) = resolved_forest();
    assert_eq!(forest.leaf_count(root), 2);

    let cache = ReferenceCache::new(16);
    let ids = DuplicateIds::default();
    let ctx = XLinkContext {
        cache: &cache,
        output: XLinkOutput::ByReference,
        ids: &ids,
    };
    let rebuilt = forest.reconstruct(root, Some(&ctx)).expect("root");
    let members = rebuilt.as_inline().unwrap().members().to_vec();
    assert_eq!(members.len(), 2);
    assert_eq!(members[1], GeometryMember::XLink("wall-a".into()));
}

#[test]
fn copy_rebuilds_as_duplicate() {
    let (forest, root) = resolved_forest();
    let cache = ReferenceCache::new(16);
    let ids = DuplicateIds::new(DuplicateIdPolicy::Random {
        prefix: "UUID_".into(),
    });
    let ctx = XLinkContext {
        cache: &cache,
        output: XLinkOutput::Duplicate,
        ids: &ids,
    };
    let rebuilt = forest.reconstruct(root, Some(&ctx)).expect("root");
    let geometry = rebuilt.as_inline().unwrap();
    assert_eq!(geometry.leaf_count(), 2);
    let copy_id = geometry.members()[1].as_inline().unwrap().gml_id.clone().unwrap();
    assert!(copy_id.starts_with("UUID_"));
}

#[test]
fn without_cache_everything_is_embedded() {
    let (forest, root) = resolved_forest();
    let rebuilt = forest.reconstruct(root, None).expect("root");
    let geometry = rebuilt.as_inline().unwrap();
    assert_eq!(geometry.leaf_count(), 2);
    assert_eq!(
        geometry.members()[1].as_inline().unwrap().gml_id.as_deref(),
        Some("wall-a")
    );
}
