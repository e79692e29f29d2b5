// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometry decomposition for import
//!
//! Flattens a geometry property into adjacency rows using pre-reserved ids.
//! Orientation adapters do not get a row of their own: they toggle the
//! reversal state, which marks every row below and reverses leaf rings.
//! By-reference members become pending links resolved after all features are
//! written, by copying the target subtree (see [`copy_subtree`]).

use citydb_lite_core::{reference::normalize, Geometry, GeometryKind, GeometryMember};

use crate::error::{Error, Result};
use crate::forest::GeometryForest;
use crate::ids::IdBlock;
use crate::row::{GeometryFlags, GeometryRow, XLinkKind};

/// By-reference member awaiting its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLink {
    pub href: String,
    /// `None` when the whole property is a reference
    pub parent_id: Option<i64>,
    pub root_id: i64,
    pub reversed: bool,
}

/// Rows and links produced for one geometry property
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decomposition {
    /// Root row id, `None` when the property is a bare reference
    pub root_id: Option<i64>,
    pub rows: Vec<GeometryRow>,
    pub links: Vec<PendingLink>,
}

/// Rows needed to store `member`
pub fn row_count(member: &GeometryMember) -> usize {
    match member {
        GeometryMember::XLink(_) => 0,
        GeometryMember::Inline(g) => geometry_rows(g),
    }
}

fn geometry_rows(geometry: &Geometry) -> usize {
    match &geometry.kind {
        GeometryKind::Reversed(inner) => geometry_rows(inner),
        GeometryKind::Polygon(_) => 1,
        _ => 1 + geometry.members().iter().map(row_count).sum::<usize>(),
    }
}

fn flags(kind: &GeometryKind) -> GeometryFlags {
    match kind {
        GeometryKind::TriangulatedSurface(_) => GeometryFlags::triangulated(),
        GeometryKind::CompositeSurface(_) => GeometryFlags::composite(),
        GeometryKind::Solid(_) => GeometryFlags::solid(),
        GeometryKind::CompositeSolid(_) => GeometryFlags::composite_solid(),
        _ => GeometryFlags::NONE,
    }
}

/// Decomposes one geometry property of `feature_id`.
pub fn decompose(member: &GeometryMember, feature_id: i64, ids: &mut IdBlock) -> Result<Decomposition> {
    let mut out = Decomposition::default();
    match member {
        GeometryMember::XLink(href) => out.links.push(PendingLink {
            href: normalize(href).to_string(),
            parent_id: None,
            root_id: 0,
            reversed: false,
        }),
        GeometryMember::Inline(geometry) => {
            let mut walker = Walker {
                ids,
                feature_id,
                out: &mut out,
            };
            let root = walker.walk(geometry, None, None, false)?;
            out.root_id = Some(root);
        }
    }
    Ok(out)
}

struct Walker<'a> {
    ids: &'a mut IdBlock,
    feature_id: i64,
    out: &'a mut Decomposition,
}

impl Walker<'_> {
    fn walk(
        &mut self,
        geometry: &Geometry,
        parent: Option<i64>,
        root: Option<i64>,
        reversed: bool,
    ) -> Result<i64> {
        if let GeometryKind::Reversed(inner) = &geometry.kind {
            return self.walk(inner, parent, root, !reversed);
        }

        let id = self.ids.take()?;
        let root_id = root.unwrap_or(id);
        let payload = match &geometry.kind {
            GeometryKind::Polygon(p) if reversed => Some(p.reversed()),
            GeometryKind::Polygon(p) => Some(p.clone()),
            _ => None,
        };
        self.out.rows.push(GeometryRow {
            id,
            parent_id: parent,
            root_id,
            flags: flags(&geometry.kind),
            xlink: XLinkKind::None,
            is_reversed: reversed,
            gml_id: geometry.gml_id.clone(),
            payload,
            feature_id: self.feature_id,
        });

        if matches!(geometry.kind, GeometryKind::Polygon(_)) {
            return Ok(id);
        }
        let members = geometry.members();
        if members.is_empty() {
            return Err(Error::EmptyAggregate(
                geometry
                    .gml_id
                    .clone()
                    .unwrap_or_else(|| geometry.tag().as_str().to_string()),
            ));
        }
        for member in members {
            match member {
                GeometryMember::Inline(child) => {
                    self.walk(child, Some(id), Some(root_id), reversed)?;
                }
                GeometryMember::XLink(href) => self.out.links.push(PendingLink {
                    href: normalize(href).to_string(),
                    parent_id: Some(id),
                    root_id,
                    reversed,
                }),
            }
        }
        Ok(id)
    }
}

/// Insertion point of a copied subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyTarget {
    /// `None` to make the copy a new root
    pub parent_id: Option<i64>,
    pub root_id: i64,
    pub reversed: bool,
    pub xlink: XLinkKind,
    pub feature_id: i64,
}

/// Copies the stored subtree rooted at `source` under `target` with fresh ids.
///
/// Copies keep flags and `gml:id`s and carry the target's xlink kind. A copy
/// inside a reversed branch toggles the reversal of every copied row.
pub fn copy_subtree(
    forest: &GeometryForest,
    source: i64,
    target: CopyTarget,
    ids: &mut IdBlock,
) -> Result<Vec<GeometryRow>> {
    let rows = forest.subtree(source);
    if rows.first().map(|r| r.id) != Some(source) {
        return Err(Error::MissingRow(source));
    }

    let mut mapping = rustc_hash::FxHashMap::default();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let id = ids.take()?;
        mapping.insert(row.id, id);
        let (parent_id, root_id) = if row.id == source {
            match target.parent_id {
                Some(parent) => (Some(parent), target.root_id),
                None => (None, id),
            }
        } else {
            let parent = row
                .parent_id
                .and_then(|p| mapping.get(&p).copied())
                .ok_or(Error::MissingRow(row.parent_id.unwrap_or_default()))?;
            let root = out
                .first()
                .map(|r: &GeometryRow| r.root_id)
                .unwrap_or(id);
            (Some(parent), root)
        };
        out.push(GeometryRow {
            id,
            parent_id,
            root_id,
            flags: row.flags,
            xlink: target.xlink,
            is_reversed: row.is_reversed ^ target.reversed,
            gml_id: row.gml_id.clone(),
            payload: match &row.payload {
                Some(p) if target.reversed => Some(p.reversed()),
                other => other.clone(),
            },
            feature_id: target.feature_id,
        });
    }
    Ok(out)
}
