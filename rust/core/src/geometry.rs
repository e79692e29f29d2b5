// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory geometry model shared by import and export.
//!
//! Aggregates hold [`GeometryMember`]s, which are either embedded geometry or a
//! by-reference link to a geometry identified by its `gml:id`. Orientation
//! reversal is an explicit [`GeometryKind::Reversed`] adapter around the
//! reversed geometry.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A 3D coordinate `[x, y, z]`.
pub type Point = [f64; 3];

/// A closed ring of points. The first point is repeated at the end.
pub type Ring = Vec<Point>;

/// Planar polygon with one exterior ring and optional holes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Polygon {
    pub exterior: Ring,
    pub interiors: Vec<Ring>,
}

impl Polygon {
    pub fn new(exterior: Ring) -> Self {
        Self {
            exterior,
            interiors: Vec::new(),
        }
    }

    pub fn with_interior(mut self, ring: Ring) -> Self {
        self.interiors.push(ring);
        self
    }

    /// Copy of this polygon with every ring in opposite winding order.
    pub fn reversed(&self) -> Self {
        let flip = |ring: &Ring| ring.iter().rev().copied().collect::<Ring>();
        Self {
            exterior: flip(&self.exterior),
            interiors: self.interiors.iter().map(flip).collect(),
        }
    }

    /// Iterates all points of all rings.
    pub fn points(&self) -> impl Iterator<Item = &Point> {
        self.exterior
            .iter()
            .chain(self.interiors.iter().flat_map(|r| r.iter()))
    }

    pub fn points_mut(&mut self) -> impl Iterator<Item = &mut Point> {
        self.exterior
            .iter_mut()
            .chain(self.interiors.iter_mut().flat_map(|r| r.iter_mut()))
    }
}

/// Discriminant of [`GeometryKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GeometryTag {
    Polygon,
    TriangulatedSurface,
    CompositeSurface,
    MultiSurface,
    Solid,
    CompositeSolid,
    MultiSolid,
    Reversed,
}

impl GeometryTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryTag::Polygon => "Polygon",
            GeometryTag::TriangulatedSurface => "TriangulatedSurface",
            GeometryTag::CompositeSurface => "CompositeSurface",
            GeometryTag::MultiSurface => "MultiSurface",
            GeometryTag::Solid => "Solid",
            GeometryTag::CompositeSolid => "CompositeSolid",
            GeometryTag::MultiSolid => "MultiSolid",
            GeometryTag::Reversed => "OrientableSurface",
        }
    }

    /// Solid-typed tags, used to tell a MultiSolid from a MultiSurface.
    pub fn is_solid(&self) -> bool {
        matches!(self, GeometryTag::Solid | GeometryTag::CompositeSolid)
    }
}

/// Geometry variants supported by the adjacency-list storage.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GeometryKind {
    Polygon(Polygon),
    TriangulatedSurface(Vec<GeometryMember>),
    CompositeSurface(Vec<GeometryMember>),
    MultiSurface(Vec<GeometryMember>),
    /// Solid bounded by its exterior surface members
    Solid(Vec<GeometryMember>),
    CompositeSolid(Vec<GeometryMember>),
    MultiSolid(Vec<GeometryMember>),
    /// Orientation adapter: the wrapped geometry with reversed orientation
    Reversed(Box<Geometry>),
}

/// A geometry node with an optional external identifier.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Geometry {
    pub gml_id: Option<String>,
    pub kind: GeometryKind,
}

/// Member of an aggregate or value of a geometry property.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GeometryMember {
    Inline(Geometry),
    /// Reference to the geometry carrying this `gml:id`
    XLink(String),
}

impl Geometry {
    pub fn new(kind: GeometryKind) -> Self {
        Self { gml_id: None, kind }
    }

    pub fn polygon(polygon: Polygon) -> Self {
        Self::new(GeometryKind::Polygon(polygon))
    }

    pub fn reversed(geometry: Geometry) -> Self {
        Self::new(GeometryKind::Reversed(Box::new(geometry)))
    }

    pub fn with_gml_id(mut self, id: impl Into<String>) -> Self {
        self.gml_id = Some(id.into());
        self
    }

    pub fn tag(&self) -> GeometryTag {
        match &self.kind {
            GeometryKind::Polygon(_) => GeometryTag::Polygon,
            GeometryKind::TriangulatedSurface(_) => GeometryTag::TriangulatedSurface,
            GeometryKind::CompositeSurface(_) => GeometryTag::CompositeSurface,
            GeometryKind::MultiSurface(_) => GeometryTag::MultiSurface,
            GeometryKind::Solid(_) => GeometryTag::Solid,
            GeometryKind::CompositeSolid(_) => GeometryTag::CompositeSolid,
            GeometryKind::MultiSolid(_) => GeometryTag::MultiSolid,
            GeometryKind::Reversed(_) => GeometryTag::Reversed,
        }
    }

    /// Aggregate members, empty for polygons and orientation adapters.
    pub fn members(&self) -> &[GeometryMember] {
        match &self.kind {
            GeometryKind::TriangulatedSurface(m)
            | GeometryKind::CompositeSurface(m)
            | GeometryKind::MultiSurface(m)
            | GeometryKind::Solid(m)
            | GeometryKind::CompositeSolid(m)
            | GeometryKind::MultiSolid(m) => m,
            GeometryKind::Polygon(_) | GeometryKind::Reversed(_) => &[],
        }
    }

    /// Number of embedded polygons. By-reference members count zero.
    pub fn leaf_count(&self) -> usize {
        match &self.kind {
            GeometryKind::Polygon(_) => 1,
            GeometryKind::Reversed(inner) => inner.leaf_count(),
            _ => self.members().iter().map(GeometryMember::leaf_count).sum(),
        }
    }

    /// Calls `f` for every embedded polygon.
    pub fn for_each_polygon<'a>(&'a self, f: &mut dyn FnMut(&'a Polygon)) {
        match &self.kind {
            GeometryKind::Polygon(p) => f(p),
            GeometryKind::Reversed(inner) => inner.for_each_polygon(f),
            _ => {
                for member in self.members() {
                    if let GeometryMember::Inline(g) = member {
                        g.for_each_polygon(f);
                    }
                }
            }
        }
    }

    /// Calls `f` for every embedded polygon, mutably.
    pub fn for_each_polygon_mut(&mut self, f: &mut dyn FnMut(&mut Polygon)) {
        match &mut self.kind {
            GeometryKind::Polygon(p) => f(p),
            GeometryKind::Reversed(inner) => inner.for_each_polygon_mut(f),
            GeometryKind::TriangulatedSurface(m)
            | GeometryKind::CompositeSurface(m)
            | GeometryKind::MultiSurface(m)
            | GeometryKind::Solid(m)
            | GeometryKind::CompositeSolid(m)
            | GeometryKind::MultiSolid(m) => {
                for member in m.iter_mut() {
                    if let GeometryMember::Inline(g) = member {
                        g.for_each_polygon_mut(f);
                    }
                }
            }
        }
    }
}

impl GeometryMember {
    pub fn leaf_count(&self) -> usize {
        match self {
            GeometryMember::Inline(g) => g.leaf_count(),
            GeometryMember::XLink(_) => 0,
        }
    }

    pub fn as_inline(&self) -> Option<&Geometry> {
        match self {
            GeometryMember::Inline(g) => Some(g),
            GeometryMember::XLink(_) => None,
        }
    }
}

impl From<Geometry> for GeometryMember {
    fn from(geometry: Geometry) -> Self {
        GeometryMember::Inline(geometry)
    }
}

/// Axis-aligned 3D bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Envelope {
    pub min: Point,
    pub max: Point,
}

impl Envelope {
    pub fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    /// Degenerate envelope around a single point.
    pub fn from_point(p: Point) -> Self {
        Self { min: p, max: p }
    }

    /// Envelope of a point set, `None` when the set is empty.
    pub fn of_points<'a>(points: impl IntoIterator<Item = &'a Point>) -> Option<Self> {
        let mut envelope: Option<Envelope> = None;
        for p in points {
            match envelope.as_mut() {
                Some(e) => e.include(p),
                None => envelope = Some(Envelope::from_point(*p)),
            }
        }
        envelope
    }

    pub fn include(&mut self, p: &Point) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(p[axis]);
            self.max[axis] = self.max[axis].max(p[axis]);
        }
    }

    pub fn union(&mut self, other: &Envelope) {
        self.include(&other.min);
        self.include(&other.max);
    }

    /// Planar (x/y) intersection test, the semantics of a BBOX filter.
    pub fn intersects_2d(&self, other: &Envelope) -> bool {
        self.min[0] <= other.max[0]
            && self.max[0] >= other.min[0]
            && self.min[1] <= other.max[1]
            && self.max[1] >= other.min[1]
    }

    /// The eight corner points.
    pub fn corners(&self) -> [Point; 8] {
        let (a, b) = (self.min, self.max);
        [
            [a[0], a[1], a[2]],
            [b[0], a[1], a[2]],
            [b[0], b[1], a[2]],
            [a[0], b[1], a[2]],
            [a[0], a[1], b[2]],
            [b[0], a[1], b[2]],
            [b[0], b[1], b[2]],
            [a[0], b[1], b[2]],
        ]
    }

    /// Polygon footprint spanning min to max, the stored form of an envelope.
    pub fn to_polygon(&self) -> Polygon {
        let (a, b) = (self.min, self.max);
        Polygon::new(vec![
            [a[0], a[1], a[2]],
            [b[0], a[1], a[2]],
            [b[0], b[1], b[2]],
            [a[0], b[1], b[2]],
            [a[0], a[1], a[2]],
        ])
    }
}
