// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometry forest builder
//!
//! Rows of one or more stored trees arrive in any order. Each row is merged
//! into an id-keyed map; a parent that has not arrived yet is represented by an
//! empty placeholder node that is filled in when its own row shows up. Children
//! keep their attach order.
//!
//! Reconstruction turns a root into a [`GeometryMember`]:
//!
//! - node kinds are a pure function of the row flags and the children
//! - reversal is threaded through the recursion so a branch gets at most one
//!   [`GeometryKind::Reversed`] adapter
//! - shared geometry (rows carrying an xlink kind and a `gml:id`) is registered
//!   in the reference cache on first sight; later sightings become by-reference
//!   links or re-materialized duplicates under a regenerated id

use citydb_lite_core::{
    CacheEntry, Geometry, GeometryKind, GeometryMember, GeometryTag, ReferenceCache, XLinkOutput,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ids::DuplicateIds;
use crate::row::{GeometryRow, XLinkKind};

#[derive(Debug, Default)]
struct Node {
    /// `None` while the node is a placeholder
    row: Option<GeometryRow>,
    children: SmallVec<[i64; 4]>,
}

/// Shared-geometry handling for one reconstruction
pub struct XLinkContext<'a> {
    pub cache: &'a ReferenceCache,
    pub output: XLinkOutput,
    pub ids: &'a DuplicateIds,
}

/// Id-keyed forest of geometry rows
#[derive(Debug, Default)]
pub struct GeometryForest {
    nodes: FxHashMap<i64, Node>,
}

impl GeometryForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = GeometryRow>) -> Self {
        let mut forest = Self::new();
        for row in rows {
            forest.insert(row);
        }
        forest
    }

    /// Merges a row. A row id seen twice keeps its first row.
    pub fn insert(&mut self, row: GeometryRow) {
        let id = row.id;
        let parent = row.parent_id;
        let node = self.nodes.entry(id).or_default();
        if node.row.is_some() {
            return;
        }
        node.row = Some(row);
        if let Some(parent) = parent {
            self.nodes.entry(parent).or_default().children.push(id);
        }
    }

    /// Number of nodes, placeholders included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn row(&self, id: i64) -> Option<&GeometryRow> {
        self.nodes.get(&id).and_then(|n| n.row.as_ref())
    }

    pub fn children(&self, id: i64) -> &[i64] {
        self.nodes.get(&id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Ids of filled root rows, ascending
    pub fn roots(&self) -> Vec<i64> {
        let mut roots: Vec<i64> = self
            .nodes
            .values()
            .filter_map(|n| n.row.as_ref())
            .filter(|r| r.is_root())
            .map(|r| r.id)
            .collect();
        roots.sort_unstable();
        roots
    }

    /// Ids of nodes whose row never arrived
    pub fn placeholders(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.row.is_none())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Rows of the subtree below and including `root`, parents before children.
    pub fn subtree(&self, root: i64) -> Vec<&GeometryRow> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if let Some(row) = &node.row {
                out.push(row);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Payload-bearing rows below and including `root`
    pub fn leaf_count(&self, root: i64) -> usize {
        self.subtree(root).iter().filter(|r| r.is_leaf()).count()
    }

    /// Node kind from the row flags and whether every child is solid.
    pub fn classify(row: &GeometryRow, children_solid: bool) -> GeometryTag {
        let f = row.flags;
        if row.payload.is_some() {
            GeometryTag::Polygon
        } else if f.is_solid && f.is_composite {
            GeometryTag::CompositeSolid
        } else if f.is_solid {
            GeometryTag::Solid
        } else if f.is_composite {
            GeometryTag::CompositeSurface
        } else if f.is_triangulated {
            GeometryTag::TriangulatedSurface
        } else if children_solid {
            GeometryTag::MultiSolid
        } else {
            GeometryTag::MultiSurface
        }
    }

    fn children_solid(&self, node: &Node) -> bool {
        !node.children.is_empty()
            && node
                .children
                .iter()
                .all(|c| self.row(*c).map(|r| r.flags.is_solid).unwrap_or(false))
    }

    /// Rebuilds the tree rooted at `root`.
    ///
    /// Returns `None` when the root row is absent or nothing below it can be
    /// materialized. Without an [`XLinkContext`] shared geometry is always
    /// embedded.
    pub fn reconstruct(&self, root: i64, xlinks: Option<&XLinkContext<'_>>) -> Option<GeometryMember> {
        let mut state = Rebuild {
            xlinks,
            root,
            copies: 0,
        };
        self.build(root, false, &mut state)
    }

    fn build(&self, id: i64, in_reversed: bool, state: &mut Rebuild<'_, '_>) -> Option<GeometryMember> {
        let node = self.nodes.get(&id)?;
        let Some(row) = node.row.as_ref() else {
            tracing::warn!(geometry_id = id, "Geometry row missing, skipping member");
            return None;
        };

        let mut gml_id = row.gml_id.clone();
        if let (Some(ctx), Some(external), true) =
            (state.xlinks, row.gml_id.as_deref(), row.xlink != XLinkKind::None)
        {
            let (_, first) = ctx
                .cache
                .register_or_lookup(external, CacheEntry::geometry(row.id, row.root_id));
            if !first {
                match ctx.output {
                    XLinkOutput::ByReference => {
                        return Some(GeometryMember::XLink(external.to_string()));
                    }
                    XLinkOutput::Duplicate => {
                        state.copies += 1;
                        let salt = ((state.root as u64) << 20) ^ state.copies;
                        gml_id = Some(ctx.ids.regenerate(external, row.id, salt));
                    }
                }
            }
        }

        if row.is_reversed && !in_reversed {
            let inner = self.materialize(row, node, gml_id, true, state)?;
            return Some(GeometryMember::Inline(Geometry::reversed(inner)));
        }
        self.materialize(row, node, gml_id, in_reversed, state)
            .map(GeometryMember::Inline)
    }

    fn materialize(
        &self,
        row: &GeometryRow,
        node: &Node,
        gml_id: Option<String>,
        in_reversed: bool,
        state: &mut Rebuild<'_, '_>,
    ) -> Option<Geometry> {
        if let Some(polygon) = &row.payload {
            let polygon = if in_reversed {
                polygon.reversed()
            } else {
                polygon.clone()
            };
            return Some(Geometry {
                gml_id,
                kind: GeometryKind::Polygon(polygon),
            });
        }

        let members: Vec<GeometryMember> = node
            .children
            .iter()
            .filter_map(|c| self.build(*c, in_reversed, state))
            .collect();
        if members.is_empty() {
            tracing::warn!(geometry_id = row.id, "Geometry aggregate has no members, skipping");
            return None;
        }

        let kind = match Self::classify(row, self.children_solid(node)) {
            GeometryTag::CompositeSolid => GeometryKind::CompositeSolid(members),
            GeometryTag::Solid => GeometryKind::Solid(members),
            GeometryTag::CompositeSurface => GeometryKind::CompositeSurface(members),
            GeometryTag::TriangulatedSurface => GeometryKind::TriangulatedSurface(members),
            GeometryTag::MultiSolid => GeometryKind::MultiSolid(members),
            _ => GeometryKind::MultiSurface(members),
        };
        Some(Geometry { gml_id, kind })
    }
}

struct Rebuild<'a, 'b> {
    xlinks: Option<&'b XLinkContext<'a>>,
    root: i64,
    copies: u64,
}
