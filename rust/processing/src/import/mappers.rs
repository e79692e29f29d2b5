// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Import content mappers
//!
//! Turn one feature tree into rows using ids reserved up front. Nothing is
//! written here: the prepared rows, identifier registrations and unresolved
//! references go to the serialized writer as one unit, so a feature that
//! fails halfway leaves no trace.

use std::sync::Arc;

use citydb_lite_core::{
    CacheEntry, ColumnTarget, Feature, FeatureRef, FeatureType, GeometryLink, RelationKind,
    SchemaMapping, TypeMapping,
};
use citydb_lite_geometry::{decompose, IdBlock};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{FeatureInsert, MemberInsert, WriteBatch};

/// Membership by reference, resolved by the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingMember {
    pub group_id: i64,
    pub href: String,
    pub role: Option<String>,
    pub owner_type: &'static str,
}

/// Geometry xlink, resolved after every feature is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PreparedLink {
    pub href: String,
    pub link: GeometryLink,
    pub owner_type: &'static str,
}

/// Everything one top-level feature contributes to the run
#[derive(Debug, Default)]
pub(crate) struct PreparedFeature {
    /// Internal id of the top-level feature
    pub root_id: i64,
    pub feature_type: Option<FeatureType>,
    pub batch: WriteBatch,
    pub features: Vec<(String, CacheEntry)>,
    /// Geometry `gml:id`s as (id, row id, geometry root)
    pub geometry: Vec<(String, i64, i64)>,
    pub members: Vec<PendingMember>,
    pub links: Vec<PreparedLink>,
}

pub(crate) struct PersistContext<'a> {
    pub mappers: &'a ImportMappers,
    pub feature_ids: IdBlock,
    pub geometry_ids: IdBlock,
    pub out: PreparedFeature,
}

impl<'a> PersistContext<'a> {
    pub fn new(mappers: &'a ImportMappers, feature_ids: IdBlock, geometry_ids: IdBlock) -> Self {
        Self {
            mappers,
            feature_ids,
            geometry_ids,
            out: PreparedFeature::default(),
        }
    }
}

/// Import side of a content mapper
pub(crate) trait ImportMapper: Send + Sync {
    fn feature_type(&self) -> FeatureType;

    /// Prepares the rows of `feature` and its inline children.
    fn persist(&self, ctx: &mut PersistContext<'_>, feature: &Feature, parent: Option<i64>) -> Result<i64>;
}

/// Mapper driven entirely by a [`TypeMapping`]
pub(crate) struct TableMapper {
    mapping: TypeMapping,
}

impl ImportMapper for TableMapper {
    fn feature_type(&self) -> FeatureType {
        self.mapping.feature_type
    }

    fn persist(&self, ctx: &mut PersistContext<'_>, feature: &Feature, parent: Option<i64>) -> Result<i64> {
        let ft = self.mapping.feature_type;
        let id = ctx.feature_ids.take()?;
        if ctx.out.root_id == 0 {
            ctx.out.root_id = id;
            ctx.out.feature_type = Some(ft);
        }
        let gml_id = feature
            .gml_id
            .clone()
            .unwrap_or_else(|| format!("UUID_{}", Uuid::new_v4()));
        ctx.out
            .features
            .push((gml_id.clone(), CacheEntry::feature(id, ft.code(), ctx.out.root_id)));

        let mut values = Vec::with_capacity(feature.attributes.len());
        for (property, value) in &feature.attributes {
            let Some(column) = self.mapping.attribute_column(property) else {
                tracing::warn!(gml_id = %gml_id, property = %property, "No column for attribute, dropping");
                continue;
            };
            match column.kind.coerce(value) {
                Some(v) => values.push((column.column.clone(), v)),
                None => {
                    tracing::warn!(gml_id = %gml_id, property = %property, value = %value, "Attribute value does not fit its column, dropping")
                }
            }
        }

        let mut geometry = Vec::new();
        for g in &feature.geometries {
            let Some(column) = self.mapping.geometry_column(g.lod, g.representation) else {
                tracing::warn!(gml_id = %gml_id, property = %g.property_name(), "No column for geometry, dropping");
                continue;
            };
            let d = decompose(&g.geometry, id, &mut ctx.geometry_ids)?;
            for row in &d.rows {
                if let Some(external) = &row.gml_id {
                    ctx.out.geometry.push((external.clone(), row.id, row.root_id));
                }
            }
            if let Some(root) = d.root_id {
                geometry.push((column.column.clone(), root));
            }
            for link in d.links {
                let column = link.parent_id.is_none().then(|| ColumnTarget {
                    table: self.mapping.table.clone(),
                    column: column.column.clone(),
                    feature_id: id,
                });
                ctx.out.links.push(PreparedLink {
                    href: link.href,
                    link: GeometryLink {
                        owner_feature: id,
                        parent_id: link.parent_id,
                        root_id: link.root_id,
                        reversed: link.reversed,
                        column,
                    },
                    owner_type: ft.name(),
                });
            }
            ctx.out.batch.geometry.extend(d.rows);
        }

        ctx.out.batch.features.push(FeatureInsert {
            id,
            type_code: ft.code(),
            parent_id: parent,
            gml_id: gml_id.clone(),
            name: feature.name.clone(),
            description: feature.description.clone(),
            envelope: feature.envelope(),
            table: self.mapping.table.clone(),
            values,
            geometry,
        });

        let mappers = ctx.mappers;
        for child in &feature.children {
            let Some(relation) = self.mapping.child_relation(&child.name) else {
                tracing::warn!(gml_id = %gml_id, property = %child.name, "Unknown child property, dropping");
                continue;
            };
            match (&child.target, relation.kind) {
                (FeatureRef::Inline(c), kind) if relation.accepts(c.feature_type) => {
                    let mapper = mappers.get(c.feature_type)?;
                    if kind == RelationKind::Nested {
                        mapper.persist(ctx, c, Some(id))?;
                    } else {
                        let member_id = mapper.persist(ctx, c, None)?;
                        ctx.out.batch.members.push(MemberInsert {
                            group_id: id,
                            member_id,
                            role: child.role.clone(),
                        });
                    }
                }
                (FeatureRef::Reference(href), RelationKind::Membership) => {
                    ctx.out.members.push(PendingMember {
                        group_id: id,
                        href: href.clone(),
                        role: child.role.clone(),
                        owner_type: ft.name(),
                    });
                }
                _ => {
                    tracing::warn!(gml_id = %gml_id, property = %child.name, "Child not allowed by relation, dropping");
                }
            }
        }
        Ok(id)
    }
}

/// Import mappers of every type in a schema
pub(crate) struct ImportMappers {
    mappers: FxHashMap<FeatureType, Box<dyn ImportMapper>>,
}

impl ImportMappers {
    pub fn from_schema(schema: &Arc<SchemaMapping>) -> Self {
        let mut mappers: FxHashMap<FeatureType, Box<dyn ImportMapper>> = FxHashMap::default();
        for ft in schema.feature_types() {
            if let Some(mapping) = schema.type_mapping(ft) {
                let mapper = TableMapper {
                    mapping: mapping.clone(),
                };
                mappers.insert(mapper.feature_type(), Box::new(mapper));
            }
        }
        Self { mappers }
    }

    pub fn get(&self, feature_type: FeatureType) -> Result<&dyn ImportMapper> {
        self.mappers
            .get(&feature_type)
            .map(|m| m.as_ref())
            .ok_or(Error::UnknownType {
                feature_id: 0,
                type_code: feature_type.code(),
            })
    }
}
