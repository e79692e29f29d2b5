// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Feature-type to table mapping
//!
//! Every feature type owns one attribute table keyed by the shared base table
//! id. Geometry properties are columns holding the root id of a tree in the
//! shared adjacency-list geometry table. Nested children point at their parent
//! through the base table; group memberships live in a member table.

use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

use crate::feature::{FeatureType, Lod, Representation, Value};

/// Storage type of an attribute column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Text,
    Integer,
    Double,
    Bool,
}

impl ColumnKind {
    /// PostgreSQL type name, used for array casts
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Text => "text",
            ColumnKind::Integer => "bigint",
            ColumnKind::Double => "double precision",
            ColumnKind::Bool => "boolean",
        }
    }

    /// Converts a value into this column's type when the conversion is lossless.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ColumnKind::Text, Value::Text(_))
            | (ColumnKind::Integer, Value::Integer(_))
            | (ColumnKind::Double, Value::Double(_))
            | (ColumnKind::Bool, Value::Bool(_)) => Some(value.clone()),
            (ColumnKind::Double, Value::Integer(i)) => Some(Value::Double(*i as f64)),
            (ColumnKind::Integer, Value::Double(d)) if d.fract() == 0.0 => {
                Some(Value::Integer(*d as i64))
            }
            (ColumnKind::Text, other) => Some(Value::Text(other.to_string())),
            (ColumnKind::Integer, Value::Text(s)) => s.trim().parse().ok().map(Value::Integer),
            (ColumnKind::Double, Value::Text(s)) => s.trim().parse().ok().map(Value::Double),
            (ColumnKind::Bool, Value::Text(s)) => match s.trim() {
                "true" | "1" => Some(Value::Bool(true)),
                "false" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeColumn {
    /// Property name in the feature graph
    pub property: String,
    pub column: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeometryColumn {
    pub lod: Lod,
    pub representation: Representation,
    pub column: String,
}

impl GeometryColumn {
    pub fn property_name(&self) -> String {
        format!("lod{}{}", self.lod.level(), self.representation.suffix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Child rows reference the parent through the base table
    Nested,
    /// Rows in the member table, targets may be anywhere
    Membership,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildRelation {
    pub property: String,
    pub types: SmallVec<[FeatureType; 4]>,
    pub kind: RelationKind,
}

impl ChildRelation {
    pub fn accepts(&self, feature_type: FeatureType) -> bool {
        self.types.contains(&feature_type)
    }
}

/// Storage layout of one feature type
#[derive(Debug, Clone, PartialEq)]
pub struct TypeMapping {
    pub feature_type: FeatureType,
    pub table: String,
    pub attributes: Vec<AttributeColumn>,
    pub geometry: Vec<GeometryColumn>,
    /// Relations in output order
    pub children: Vec<ChildRelation>,
}

impl TypeMapping {
    pub fn new(feature_type: FeatureType, table: impl Into<String>) -> Self {
        Self {
            feature_type,
            table: table.into(),
            attributes: Vec::new(),
            geometry: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attribute(mut self, property: &str, column: &str, kind: ColumnKind) -> Self {
        self.attributes.push(AttributeColumn {
            property: property.to_string(),
            column: column.to_string(),
            kind,
        });
        self
    }

    pub fn geometry(mut self, lod: Lod, representation: Representation, column: &str) -> Self {
        self.geometry.push(GeometryColumn {
            lod,
            representation,
            column: column.to_string(),
        });
        self
    }

    pub fn relation(mut self, property: &str, types: &[FeatureType], kind: RelationKind) -> Self {
        self.children.push(ChildRelation {
            property: property.to_string(),
            types: types.iter().copied().collect(),
            kind,
        });
        self
    }

    pub fn attribute_column(&self, property: &str) -> Option<&AttributeColumn> {
        self.attributes.iter().find(|a| a.property == property)
    }

    pub fn geometry_column(&self, lod: Lod, representation: Representation) -> Option<&GeometryColumn> {
        self.geometry
            .iter()
            .find(|g| g.lod == lod && g.representation == representation)
    }

    pub fn child_relation(&self, property: &str) -> Option<&ChildRelation> {
        self.children.iter().find(|c| c.property == property)
    }

    /// Output rank of a relation, unknown relations sort last
    pub fn relation_rank(&self, property: &str) -> usize {
        self.children
            .iter()
            .position(|c| c.property == property)
            .unwrap_or(self.children.len())
    }

    /// Nested relation accepting `child`, used to name an inline child property
    pub fn nested_relation_for(&self, child: FeatureType) -> Option<&ChildRelation> {
        self.children
            .iter()
            .find(|c| c.kind == RelationKind::Nested && c.accepts(child))
    }

    pub fn membership(&self) -> Option<&ChildRelation> {
        self.children
            .iter()
            .find(|c| c.kind == RelationKind::Membership)
    }
}

/// Physical schema description
#[derive(Debug, Clone)]
pub struct SchemaMapping {
    pub srid: i32,
    pub base_table: String,
    pub geometry_table: String,
    pub member_table: String,
    types: FxHashMap<FeatureType, TypeMapping>,
}

impl SchemaMapping {
    pub fn new(srid: i32) -> Self {
        Self {
            srid,
            base_table: "cityobject".to_string(),
            geometry_table: "surface_geometry".to_string(),
            member_table: "group_to_cityobject".to_string(),
            types: FxHashMap::default(),
        }
    }

    pub fn with_type(mut self, mapping: TypeMapping) -> Self {
        self.types.insert(mapping.feature_type, mapping);
        self
    }

    pub fn type_mapping(&self, feature_type: FeatureType) -> Option<&TypeMapping> {
        self.types.get(&feature_type)
    }

    /// Registered types in object class order
    pub fn feature_types(&self) -> Vec<FeatureType> {
        let mut types: Vec<_> = self.types.keys().copied().collect();
        types.sort();
        types
    }

    /// The default 3D city database layout.
    pub fn citydb() -> Self {
        use FeatureType::*;
        use Representation::{Geometry as Geom, MultiSurface, Solid};

        let surfaces: SmallVec<[FeatureType; 4]> = smallvec![RoofSurface, WallSurface, GroundSurface];
        let building = |ft: FeatureType| {
            TypeMapping::new(ft, "building")
                .attribute("class", "class", ColumnKind::Text)
                .attribute("function", "function", ColumnKind::Text)
                .attribute("usage", "usage", ColumnKind::Text)
                .attribute("yearOfConstruction", "year_of_construction", ColumnKind::Integer)
                .attribute("roofType", "roof_type", ColumnKind::Text)
                .attribute("measuredHeight", "measured_height", ColumnKind::Double)
                .attribute("storeysAboveGround", "storeys_above_ground", ColumnKind::Integer)
                .geometry(Lod::Lod1, Solid, "lod1_solid_id")
                .geometry(Lod::Lod2, Solid, "lod2_solid_id")
                .geometry(Lod::Lod3, Solid, "lod3_solid_id")
                .geometry(Lod::Lod1, MultiSurface, "lod1_multi_surface_id")
                .geometry(Lod::Lod2, MultiSurface, "lod2_multi_surface_id")
                .geometry(Lod::Lod3, MultiSurface, "lod3_multi_surface_id")
                .relation("consistsOfBuildingPart", &[BuildingPart], RelationKind::Nested)
                .relation("boundedBy", &surfaces, RelationKind::Nested)
        };
        let surface = |ft: FeatureType| {
            TypeMapping::new(ft, "thematic_surface")
                .geometry(Lod::Lod2, MultiSurface, "lod2_multi_surface_id")
                .geometry(Lod::Lod3, MultiSurface, "lod3_multi_surface_id")
                .geometry(Lod::Lod4, MultiSurface, "lod4_multi_surface_id")
        };

        Self::new(0)
            .with_type(building(Building))
            .with_type(building(BuildingPart))
            .with_type(surface(RoofSurface))
            .with_type(surface(WallSurface))
            .with_type(surface(GroundSurface))
            .with_type(
                TypeMapping::new(CityObjectGroup, "cityobjectgroup")
                    .attribute("class", "class", ColumnKind::Text)
                    .attribute("function", "function", ColumnKind::Text)
                    .attribute("usage", "usage", ColumnKind::Text)
                    .relation(
                        "groupMember",
                        &[GenericCityObject, Building, BuildingPart, CityObjectGroup],
                        RelationKind::Membership,
                    ),
            )
            .with_type(
                TypeMapping::new(GenericCityObject, "generic_cityobject")
                    .attribute("class", "class", ColumnKind::Text)
                    .attribute("function", "function", ColumnKind::Text)
                    .attribute("usage", "usage", ColumnKind::Text)
                    .geometry(Lod::Lod1, Geom, "lod1_geometry_id")
                    .geometry(Lod::Lod2, Geom, "lod2_geometry_id")
                    .geometry(Lod::Lod3, Geom, "lod3_geometry_id")
                    .geometry(Lod::Lod4, Geom, "lod4_geometry_id"),
            )
    }
}

impl Default for SchemaMapping {
    fn default() -> Self {
        Self::citydb()
    }
}
