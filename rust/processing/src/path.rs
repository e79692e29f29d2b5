// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property path resolution
//!
//! Paths have the form `[Type/](relation[/Type]/)*property`. Namespace
//! prefixes are ignored. The result names the relation hops to follow and the
//! columns the final property lives in; both the SQL translator and the
//! in-memory store evaluate the same [`ResolvedPath`].

use citydb_lite_core::{ColumnKind, Error as CoreError, FeatureType, RelationKind, SchemaMapping};

use crate::error::Result;

/// Column of the shared base table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseColumn {
    GmlId,
    Name,
    Description,
}

impl BaseColumn {
    pub fn column(&self) -> &'static str {
        match self {
            BaseColumn::GmlId => "gmlid",
            BaseColumn::Name => "name",
            BaseColumn::Description => "description",
        }
    }

    fn from_step(step: &str) -> Option<Self> {
        match step {
            "id" | "gmlid" => Some(BaseColumn::GmlId),
            "name" => Some(BaseColumn::Name),
            "description" => Some(BaseColumn::Description),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeTarget {
    pub feature_type: FeatureType,
    pub table: String,
    pub column: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTarget {
    Base(BaseColumn),
    /// One entry per type in scope that maps the property
    Attribute(Vec<AttributeTarget>),
}

impl PathTarget {
    /// Attribute targets with one entry per distinct table column
    pub fn distinct_columns(&self) -> Vec<&AttributeTarget> {
        let mut out: Vec<&AttributeTarget> = Vec::new();
        if let PathTarget::Attribute(targets) = self {
            for t in targets {
                if !out.iter().any(|o| o.table == t.table && o.column == t.column) {
                    out.push(t);
                }
            }
        }
        out
    }
}

/// Relation followed from the current rows to their children or members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub property: String,
    pub kind: RelationKind,
    pub types: Vec<FeatureType>,
}

impl Hop {
    pub fn type_codes(&self) -> Vec<i32> {
        self.types.iter().map(FeatureType::code).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Types of the rows the path starts from
    pub scope: Vec<FeatureType>,
    pub hops: Vec<Hop>,
    pub target: PathTarget,
}

fn local_name(step: &str) -> &str {
    step.rsplit(':').next().unwrap_or(step)
}

/// Resolves `path` against the feature types in `scope`.
pub fn resolve(schema: &SchemaMapping, scope: &[FeatureType], path: &str) -> Result<ResolvedPath> {
    let unknown = || CoreError::UnknownProperty(path.to_string());
    let steps: Vec<&str> = path
        .split('/')
        .map(|s| local_name(s.trim()))
        .filter(|s| !s.is_empty())
        .collect();
    let Some((last, mut inner)) = steps.split_last() else {
        return Err(unknown().into());
    };

    let mut current: Vec<FeatureType> = scope.to_vec();
    if let Some(ft) = inner.first().and_then(|s| FeatureType::from_name(s)) {
        if !current.contains(&ft) {
            return Err(unknown().into());
        }
        current = vec![ft];
        inner = &inner[1..];
    }

    let mut hops = Vec::new();
    while let Some((step, rest)) = inner.split_first() {
        let mut types: Vec<FeatureType> = Vec::new();
        let mut kind = None;
        for ft in &current {
            if let Some(rel) = schema
                .type_mapping(*ft)
                .and_then(|m| m.child_relation(step))
            {
                kind.get_or_insert(rel.kind);
                for t in &rel.types {
                    if !types.contains(t) {
                        types.push(*t);
                    }
                }
            }
        }
        let Some(kind) = kind else {
            return Err(unknown().into());
        };
        inner = rest;

        // Optional type filter after a relation
        if let Some(ft) = inner.first().and_then(|s| FeatureType::from_name(s)) {
            if !types.contains(&ft) {
                return Err(unknown().into());
            }
            types = vec![ft];
            inner = &inner[1..];
        }
        types.sort();
        hops.push(Hop {
            property: step.to_string(),
            kind,
            types: types.clone(),
        });
        current = types;
    }

    let target = match BaseColumn::from_step(last) {
        Some(base) => PathTarget::Base(base),
        None => {
            let targets: Vec<AttributeTarget> = current
                .iter()
                .filter_map(|ft| {
                    let mapping = schema.type_mapping(*ft)?;
                    let column = mapping.attribute_column(last)?;
                    Some(AttributeTarget {
                        feature_type: *ft,
                        table: mapping.table.clone(),
                        column: column.column.clone(),
                        kind: column.kind,
                    })
                })
                .collect();
            if targets.is_empty() {
                return Err(unknown().into());
            }
            PathTarget::Attribute(targets)
        }
    };

    Ok(ResolvedPath {
        scope: scope.to_vec(),
        hops,
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn schema() -> SchemaMapping {
        SchemaMapping::citydb()
    }

    #[test]
    fn base_and_attribute_columns() {
        let s = schema();
        let p = resolve(&s, &[FeatureType::Building], "gml:id").unwrap();
        assert!(p.hops.is_empty());
        assert_eq!(p.target, PathTarget::Base(BaseColumn::GmlId));

        let p = resolve(&s, &[FeatureType::Building], "bldg:Building/bldg:measuredHeight").unwrap();
        assert_eq!(
            p.target,
            PathTarget::Attribute(vec![AttributeTarget {
                feature_type: FeatureType::Building,
                table: "building".into(),
                column: "measured_height".into(),
                kind: ColumnKind::Double,
            }])
        );
    }

    #[test]
    fn shared_property_spans_tables() {
        let s = schema();
        let scope = [FeatureType::GenericCityObject, FeatureType::Building];
        let p = resolve(&s, &scope, "function").unwrap();
        let tables: Vec<_> = p.target.distinct_columns().iter().map(|t| t.table.as_str()).collect();
        assert_eq!(tables, vec!["generic_cityobject", "building"]);
    }

    #[test]
    fn relation_hops_with_type_filter() {
        let s = schema();
        let p = resolve(
            &s,
            &[FeatureType::Building],
            "bldg:consistsOfBuildingPart/bldg:BuildingPart/bldg:roofType",
        )
        .unwrap();
        assert_eq!(p.hops.len(), 1);
        assert_eq!(p.hops[0].kind, RelationKind::Nested);
        assert_eq!(p.hops[0].types, vec![FeatureType::BuildingPart]);

        let p = resolve(&s, &[FeatureType::Building], "boundedBy/RoofSurface/name").unwrap();
        assert_eq!(p.hops[0].types, vec![FeatureType::RoofSurface]);

        let p = resolve(&s, &[FeatureType::CityObjectGroup], "groupMember/id").unwrap();
        assert_eq!(p.hops[0].kind, RelationKind::Membership);
        assert_eq!(p.hops[0].types.len(), 4);
    }

    #[test]
    fn unknown_steps_are_rejected() {
        let s = schema();
        for bad in ["", "height", "boundedBy/height", "Building/bogus/name", "groupMember/Building/x"] {
            let err = resolve(&s, &[FeatureType::Building], bad).unwrap_err();
            assert!(matches!(err, Error::Core(CoreError::UnknownProperty(_))), "{bad}");
        }
        // Building is not in scope for groups
        assert!(resolve(&s, &[FeatureType::CityObjectGroup], "Building/name").is_err());
    }
}
