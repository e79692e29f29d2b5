// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Feature graph
//!
//! The traversable city-model graph handed to import and produced by export.
//! Nested children are owned inline; cross-document references carry the
//! target's `gml:id` only.

use std::collections::BTreeMap;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::geometry::{Envelope, GeometryMember};

/// Feature types known to the engine, with their object class codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FeatureType {
    GenericCityObject,
    CityObjectGroup,
    BuildingPart,
    Building,
    RoofSurface,
    WallSurface,
    GroundSurface,
}

impl FeatureType {
    pub const ALL: [FeatureType; 7] = [
        FeatureType::GenericCityObject,
        FeatureType::CityObjectGroup,
        FeatureType::BuildingPart,
        FeatureType::Building,
        FeatureType::RoofSurface,
        FeatureType::WallSurface,
        FeatureType::GroundSurface,
    ];

    /// Object class code stored in the base table
    pub fn code(&self) -> i32 {
        match self {
            FeatureType::GenericCityObject => 5,
            FeatureType::CityObjectGroup => 23,
            FeatureType::BuildingPart => 25,
            FeatureType::Building => 26,
            FeatureType::RoofSurface => 33,
            FeatureType::WallSurface => 34,
            FeatureType::GroundSurface => 35,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FeatureType::GenericCityObject => "GenericCityObject",
            FeatureType::CityObjectGroup => "CityObjectGroup",
            FeatureType::BuildingPart => "BuildingPart",
            FeatureType::Building => "Building",
            FeatureType::RoofSurface => "RoofSurface",
            FeatureType::WallSurface => "WallSurface",
            FeatureType::GroundSurface => "GroundSurface",
        }
    }

    /// Resolve a type name, ignoring any namespace prefix (`bldg:Building`)
    pub fn from_name(name: &str) -> Option<Self> {
        let local = name.rsplit(':').next().unwrap_or(name);
        Self::ALL.into_iter().find(|t| t.name() == local)
    }

    /// Groups are dispatched in the deferred second phase
    pub fn is_group(&self) -> bool {
        matches!(self, FeatureType::CityObjectGroup)
    }

    /// Types that may appear as top-level work items
    pub fn is_top_level(&self) -> bool {
        matches!(
            self,
            FeatureType::GenericCityObject | FeatureType::CityObjectGroup | FeatureType::Building
        )
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attribute value
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Value {
    Text(String),
    Integer(i64),
    Double(f64),
    Bool(bool),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Level of detail tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Lod {
    Lod0,
    Lod1,
    Lod2,
    Lod3,
    Lod4,
}

impl Lod {
    pub const ALL: [Lod; 5] = [Lod::Lod0, Lod::Lod1, Lod::Lod2, Lod::Lod3, Lod::Lod4];

    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        Self::ALL.get(level as usize).copied()
    }
}

/// Geometry property kind at a given tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Representation {
    Solid,
    MultiSurface,
    Geometry,
}

impl Representation {
    pub fn suffix(&self) -> &'static str {
        match self {
            Representation::Solid => "Solid",
            Representation::MultiSurface => "MultiSurface",
            Representation::Geometry => "Geometry",
        }
    }
}

/// Geometry property value of a feature
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LodGeometry {
    pub lod: Lod,
    pub representation: Representation,
    pub geometry: GeometryMember,
}

impl LodGeometry {
    /// Property name such as `lod2Solid`
    pub fn property_name(&self) -> String {
        format!("lod{}{}", self.lod.level(), self.representation.suffix())
    }
}

/// Target of a child feature property
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FeatureRef {
    Inline(Box<Feature>),
    /// `gml:id` of the referenced feature, stored without the leading `#`
    Reference(String),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeatureProperty {
    pub name: String,
    /// Member role, only meaningful for group memberships
    pub role: Option<String>,
    pub target: FeatureRef,
}

/// City-model feature
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Feature {
    pub feature_type: FeatureType,
    pub gml_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub attributes: BTreeMap<String, Value>,
    pub geometries: Vec<LodGeometry>,
    pub children: Vec<FeatureProperty>,
}

impl Feature {
    pub fn new(feature_type: FeatureType) -> Self {
        Self {
            feature_type,
            gml_id: None,
            name: None,
            description: None,
            attributes: BTreeMap::new(),
            geometries: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_gml_id(mut self, id: impl Into<String>) -> Self {
        self.gml_id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_geometry(
        mut self,
        lod: Lod,
        representation: Representation,
        geometry: impl Into<GeometryMember>,
    ) -> Self {
        self.geometries.push(LodGeometry {
            lod,
            representation,
            geometry: geometry.into(),
        });
        self
    }

    pub fn with_child(mut self, property: impl Into<String>, child: Feature) -> Self {
        self.children.push(FeatureProperty {
            name: property.into(),
            role: None,
            target: FeatureRef::Inline(Box::new(child)),
        });
        self
    }

    /// Adds a by-reference child. A leading `#` on the target id is dropped.
    pub fn with_reference(
        mut self,
        property: impl Into<String>,
        target: &str,
        role: Option<&str>,
    ) -> Self {
        self.children.push(FeatureProperty {
            name: property.into(),
            role: role.map(str::to_string),
            target: FeatureRef::Reference(target.trim_start_matches('#').to_string()),
        });
        self
    }

    pub fn geometry(&self, lod: Lod, representation: Representation) -> Option<&GeometryMember> {
        self.geometries
            .iter()
            .find(|g| g.lod == lod && g.representation == representation)
            .map(|g| &g.geometry)
    }

    /// Inline child features, depth first
    pub fn descendants(&self) -> Vec<&Feature> {
        let mut out = Vec::new();
        let mut stack: Vec<&Feature> = vec![self];
        while let Some(f) = stack.pop() {
            for child in f.children.iter().rev() {
                if let FeatureRef::Inline(c) = &child.target {
                    out.push(c.as_ref());
                    stack.push(c.as_ref());
                }
            }
        }
        out
    }

    /// Bounding box of all inline geometry of this feature and its inline children
    pub fn envelope(&self) -> Option<Envelope> {
        let mut envelope: Option<Envelope> = None;
        let mut include = |e: Envelope| match envelope.as_mut() {
            Some(acc) => acc.union(&e),
            None => envelope = Some(e),
        };
        for g in &self.geometries {
            if let GeometryMember::Inline(geometry) = &g.geometry {
                let mut local: Option<Envelope> = None;
                geometry.for_each_polygon(&mut |p| {
                    if let Some(e) = Envelope::of_points(p.points()) {
                        match local.as_mut() {
                            Some(acc) => acc.union(&e),
                            None => local = Some(e),
                        }
                    }
                });
                if let Some(e) = local {
                    include(e);
                }
            }
        }
        for child in &self.children {
            if let FeatureRef::Inline(c) = &child.target {
                if let Some(e) = c.envelope() {
                    include(e);
                }
            }
        }
        envelope
    }
}
