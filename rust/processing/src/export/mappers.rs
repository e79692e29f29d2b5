// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Export content mappers
//!
//! One mapper per feature type. Mappers never read directly: they queue keyed
//! requests on their batch coordinators and finish the work in the callback,
//! where nested children, members and geometry are queued in turn.

use std::sync::{Arc, Weak};

use citydb_lite_core::{
    CacheEntry, Feature, FeatureType, LodGeometry, QueryDescriptor, RelationKind, Representation,
    TypeMapping,
};
use citydb_lite_geometry::{GeometryForest, GeometryRow, XLinkContext};

use crate::batch::{BatchCoordinator, Callback, Flush, KeyMode};
use crate::error::{Error, Result};
use crate::export::assembly::Assembly;
use crate::export::SessionInner;
use crate::storage::{FeatureFetch, FeatureQuery, FeatureRow, KeyColumn, MemberFetch, MemberRow, Storage};

/// Export side of a content mapper
pub(crate) trait ExportMapper: Send + Sync {
    fn feature_type(&self) -> FeatureType;

    /// Queues the read of feature `id` into arena node `node`.
    fn add_to_batch(&self, session: &Arc<SessionInner>, assembly: &Arc<Assembly>, node: usize, id: i64);

    /// Queues the read of this type's children of `parent_id`.
    fn add_children_to_batch(
        &self,
        session: &Arc<SessionInner>,
        assembly: &Arc<Assembly>,
        parent_node: usize,
        parent_id: i64,
        property: &str,
        rank: usize,
    );

    fn batches(&self) -> Vec<&dyn Flush>;
}

/// Projection-limited column set of one type
pub(crate) fn feature_query(mapping: &TypeMapping, descriptor: &QueryDescriptor) -> FeatureQuery {
    let ft = mapping.feature_type;
    FeatureQuery {
        feature_type: ft,
        table: mapping.table.clone(),
        columns: mapping
            .attributes
            .iter()
            .filter(|a| descriptor.projection.requests(ft, &a.property))
            .cloned()
            .collect(),
        geometry_columns: mapping
            .geometry
            .iter()
            .filter(|g| descriptor.lods.is_enabled(g.lod))
            .filter(|g| descriptor.projection.requests(ft, &g.property_name()))
            .map(|g| g.column.clone())
            .collect(),
        key: KeyColumn::Id,
    }
}

pub(crate) struct FeatureMapper {
    mapping: TypeMapping,
    query: FeatureQuery,
    by_id: BatchCoordinator<FeatureRow>,
    by_parent: BatchCoordinator<FeatureRow>,
    members: Option<BatchCoordinator<MemberRow>>,
}

impl FeatureMapper {
    pub fn new(mapping: &TypeMapping, descriptor: &QueryDescriptor, storage: &Arc<dyn Storage>) -> Self {
        let ft = mapping.feature_type;
        let query = feature_query(mapping, descriptor);
        let size = descriptor.batch.features;
        let by_id = BatchCoordinator::new(
            format!("{}:id", ft.name()),
            size,
            KeyMode::Required,
            Arc::new(FeatureFetch::new(storage.clone(), query.keyed_by(KeyColumn::Id))),
        );
        let by_parent = BatchCoordinator::new(
            format!("{}:parent", ft.name()),
            size,
            KeyMode::Optional,
            Arc::new(FeatureFetch::new(storage.clone(), query.keyed_by(KeyColumn::Parent))),
        );
        let members = mapping
            .membership()
            .filter(|rel| descriptor.projection.requests(ft, &rel.property))
            .map(|_| {
                BatchCoordinator::new(
                    format!("{}:members", ft.name()),
                    descriptor.batch.members,
                    KeyMode::Optional,
                    Arc::new(MemberFetch::new(storage.clone())),
                )
            });
        Self {
            mapping: mapping.clone(),
            query,
            by_id,
            by_parent,
            members,
        }
    }

    /// Fills `node` from its row and queues everything below it.
    fn build(&self, session: &Arc<SessionInner>, assembly: &Arc<Assembly>, node: usize, row: FeatureRow) -> Result<()> {
        let ft = self.mapping.feature_type;
        let mut feature = Feature::new(ft);
        feature.name = row.name.clone();
        feature.description = row.description.clone();
        if let Some(gml_id) = &row.gml_id {
            session
                .cache
                .register_or_lookup(gml_id, CacheEntry::feature(row.id, ft.code(), assembly.item.id));
            feature.gml_id = Some(gml_id.clone());
        }
        for column in &self.query.columns {
            if let Some(value) = row.values.get(&column.column) {
                feature.attributes.insert(column.property.clone(), value.clone());
            }
        }
        assembly.fill(node, feature);

        self.queue_geometry(session, assembly, node, &row);

        for (rank, relation) in self.mapping.children.iter().enumerate() {
            if !session.descriptor.projection.requests(ft, &relation.property) {
                continue;
            }
            match relation.kind {
                RelationKind::Nested => {
                    for child in &relation.types {
                        if let Some(mapper) = session.mappers.get(child) {
                            mapper.add_children_to_batch(session, assembly, node, row.id, &relation.property, rank);
                        }
                    }
                }
                RelationKind::Membership => {
                    if let Some(members) = &self.members {
                        assembly.begin();
                        let callback = member_callback(session, assembly, node, &relation.property, rank);
                        members.defer(row.id, callback);
                    }
                }
            }
        }
        Ok(())
    }

    /// Queues one geometry read per representation and selected tier.
    fn queue_geometry(&self, session: &Arc<SessionInner>, assembly: &Arc<Assembly>, node: usize, row: &FeatureRow) {
        let mut representations: Vec<Representation> =
            self.mapping.geometry.iter().map(|g| g.representation).collect();
        representations.sort();
        representations.dedup();

        for representation in representations {
            let column_at = |lod| {
                self.mapping
                    .geometry_column(lod, representation)
                    .filter(|g| self.query.geometry_columns.contains(&g.column))
                    .and_then(|g| row.geometry.get(&g.column).copied())
            };
            for lod in session.descriptor.lods.select(|lod| column_at(lod).is_some()) {
                let Some(root) = column_at(lod) else {
                    continue;
                };
                assembly.begin();
                let weak = Arc::downgrade(session);
                let assembly = assembly.clone();
                let feature_id = row.id;
                let feature_type = self.mapping.feature_type.name();
                let callback: Callback<GeometryRow> = Box::new(move |result: Result<Vec<GeometryRow>>| {
                    with_session(&weak, &assembly, |session| {
                        let forest = GeometryForest::from_rows(result?);
                        if forest.row(root).is_none() {
                            // The feature is still exported, without this property.
                            let reason = Error::MissingGeometry(root).to_string();
                            session.summary.missing_geometry(feature_id, feature_type, &reason);
                            return Ok(());
                        }
                        let xlinks = XLinkContext {
                            cache: &session.cache,
                            output: session.descriptor.xlinks,
                            ids: &session.duplicate_ids,
                        };
                        match forest.reconstruct(root, Some(&xlinks)) {
                            Some(geometry) => assembly.add_geometry(
                                node,
                                LodGeometry {
                                    lod,
                                    representation,
                                    geometry,
                                },
                            ),
                            None => tracing::debug!(root, "Geometry property has nothing to materialize"),
                        }
                        Ok(())
                    })
                });
                session.geometry.defer(root, callback);
            }
        }
    }
}

impl ExportMapper for FeatureMapper {
    fn feature_type(&self) -> FeatureType {
        self.mapping.feature_type
    }

    fn add_to_batch(&self, session: &Arc<SessionInner>, assembly: &Arc<Assembly>, node: usize, id: i64) {
        assembly.begin();
        let weak = Arc::downgrade(session);
        let assembly = assembly.clone();
        let ft = self.mapping.feature_type;
        let callback: Callback<FeatureRow> = Box::new(move |result: Result<Vec<FeatureRow>>| {
            with_session(&weak, &assembly, |session| {
                let mapper = session.mapper(ft)?;
                for row in result? {
                    mapper.build(session, &assembly, node, row)?;
                }
                Ok(())
            })
        });
        self.by_id.defer(id, callback);
    }

    fn add_children_to_batch(
        &self,
        session: &Arc<SessionInner>,
        assembly: &Arc<Assembly>,
        parent_node: usize,
        parent_id: i64,
        property: &str,
        rank: usize,
    ) {
        assembly.begin();
        let weak = Arc::downgrade(session);
        let assembly = assembly.clone();
        let property = property.to_string();
        let ft = self.mapping.feature_type;
        let callback: Callback<FeatureRow> = Box::new(move |result: Result<Vec<FeatureRow>>| {
            with_session(&weak, &assembly, |session| {
                let mapper = session.mapper(ft)?;
                for row in result? {
                    if !assembly.visit(row.id) {
                        continue;
                    }
                    let node = assembly.add_child(parent_node, &property, None, rank, row.id);
                    mapper.build(session, &assembly, node, row)?;
                }
                Ok(())
            })
        });
        self.by_parent.defer(parent_id, callback);
    }

    fn batches(&self) -> Vec<&dyn Flush> {
        let mut out: Vec<&dyn Flush> = vec![&self.by_id, &self.by_parent];
        if let Some(members) = &self.members {
            out.push(members);
        }
        out
    }
}

/// Group members: known features become references, the rest are read inline.
fn member_callback(
    session: &Arc<SessionInner>,
    assembly: &Arc<Assembly>,
    node: usize,
    property: &str,
    rank: usize,
) -> Callback<MemberRow> {
    let weak = Arc::downgrade(session);
    let assembly = assembly.clone();
    let property = property.to_string();
    Box::new(move |result: Result<Vec<MemberRow>>| {
        with_session(&weak, &assembly, |session| {
            let mut members = result?;
            members.sort_by_key(|m| m.member_id);
            for member in members {
                let Some(type_code) = member.type_code else {
                    return Err(Error::UnresolvedMember {
                        group_id: member.group_id,
                        href: member.gml_id.unwrap_or_else(|| member.member_id.to_string()),
                    });
                };
                let mapper = FeatureType::from_code(type_code)
                    .and_then(|ft| session.mappers.get(&ft))
                    .ok_or(Error::UnknownType {
                        feature_id: member.member_id,
                        type_code,
                    })?;
                let gml_id = member.gml_id.unwrap_or_else(|| member.member_id.to_string());
                // Whoever registers the id first inlines the member.
                let (_, first) = session.cache.register_or_lookup(
                    &gml_id,
                    CacheEntry::feature(member.member_id, type_code, assembly.item.id),
                );
                if !first || !assembly.visit(member.member_id) {
                    assembly.add_reference(node, &property, member.role, rank, member.member_id, gml_id);
                } else {
                    let child = assembly.add_child(node, &property, member.role, rank, member.member_id);
                    mapper.add_to_batch(session, &assembly, child, member.member_id);
                }
            }
            Ok(())
        })
    })
}

/// Runs a callback body against the live session and settles the request.
fn with_session<F>(weak: &Weak<SessionInner>, assembly: &Arc<Assembly>, body: F) -> Result<()>
where
    F: FnOnce(&Arc<SessionInner>) -> Result<()>,
{
    let Some(session) = weak.upgrade() else {
        return Ok(());
    };
    if let Err(e) = body(&session) {
        assembly.fail(e);
    }
    session.settle_request(assembly);
    Ok(())
}
