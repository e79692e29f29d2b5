// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometry xlink resolution
//!
//! Runs once every feature is written. Each parked link is replaced by a copy
//! of its target subtree inserted at the link's position; the source rows are
//! marked with the same xlink kind. A target that itself contains links is
//! completed first, in the order given by the reference cache's bounded walk.

use std::sync::Arc;

use citydb_lite_core::{reference::normalize, GeometryLink, ReferenceCache};
use citydb_lite_geometry::{copy_subtree, CopyTarget, GeometryForest, IdBlock, XLinkKind};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{info, warn};

use crate::error::Result;
use crate::import::IdAllocator;
use crate::storage::{GeometryAssignment, Sequence, Storage, WriteBatch, XLinkMark};
use crate::summary::RunSummary;

/// Outcome counts of one resolution pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LinkStats {
    pub resolved: usize,
    pub unresolved: usize,
    pub circular: usize,
}

struct Link {
    href: String,
    link: GeometryLink,
    done: bool,
}

pub(crate) struct LinkResolver<'a> {
    pub storage: &'a Arc<dyn Storage>,
    pub cache: &'a ReferenceCache,
    pub ids: &'a IdAllocator,
    pub summary: &'a RunSummary,
    pub owners: &'a FxHashMap<i64, &'static str>,
}

impl LinkResolver<'_> {
    fn owner_type(&self, link: &GeometryLink) -> &'static str {
        self.owners.get(&link.owner_feature).copied().unwrap_or("Unknown")
    }

    /// Geometry row id a link points at
    fn target(&self, href: &str) -> Option<i64> {
        self.cache
            .lookup(href)
            .filter(|e| e.is_geometry())
            .map(|e| e.internal_id)
    }

    pub async fn resolve(&self, parked: Vec<(String, GeometryLink)>) -> Result<LinkStats> {
        let mut stats = LinkStats::default();
        let mut links = Vec::with_capacity(parked.len());
        let mut roots = FxHashSet::default();
        for (href, link) in parked {
            match self.cache.lookup(&href).filter(|e| e.is_geometry()) {
                Some(entry) => {
                    roots.insert(entry.root_id);
                    links.push(Link {
                        href: normalize(&href).to_string(),
                        link,
                        done: false,
                    });
                }
                None => {
                    warn!(href = %href, feature_id = link.owner_feature, "Geometry xlink target not found");
                    self.summary.unresolved(self.owner_type(&link));
                    stats.unresolved += 1;
                }
            }
        }
        if links.is_empty() {
            return Ok(stats);
        }

        let mut roots: Vec<i64> = roots.into_iter().collect();
        roots.sort_unstable();
        let mut forest = GeometryForest::from_rows(self.storage.geometry_rows(&roots).await?);

        // Links by the row they are inserted under
        let mut by_parent: FxHashMap<i64, Vec<usize>> = FxHashMap::default();
        for (i, l) in links.iter().enumerate() {
            if let Some(parent) = l.link.parent_id {
                by_parent.entry(parent).or_default().push(i);
            }
        }

        let mut out = WriteBatch::default();
        let mut marks: FxHashMap<i64, XLinkKind> = FxHashMap::default();

        for index in 0..links.len() {
            if links[index].done {
                continue;
            }
            let order = {
                let deps = |href: &str| -> Vec<String> {
                    let Some(target) = self.target(href) else {
                        return Vec::new();
                    };
                    forest
                        .subtree(target)
                        .iter()
                        .flat_map(|row| by_parent.get(&row.id).into_iter().flatten())
                        .map(|i| links[*i].href.clone())
                        .collect()
                };
                self.cache.resolution_order(&links[index].href, deps)
            };
            let order = match order {
                Ok(order) => order,
                Err(e) => {
                    let link = &links[index].link;
                    self.summary
                        .skipped(link.owner_feature, self.owner_type(link), &e.to_string());
                    links[index].done = true;
                    stats.circular += 1;
                    continue;
                }
            };

            // Complete every target on the way, innermost first
            for href in &order {
                let Some(target) = self.target(href) else {
                    continue;
                };
                let inside: Vec<usize> = forest
                    .subtree(target)
                    .iter()
                    .flat_map(|row| by_parent.get(&row.id).into_iter().flatten().copied())
                    .filter(|i| !links[*i].done)
                    .collect();
                for i in inside {
                    self.copy(&mut forest, &links[i], &mut out, &mut marks).await?;
                    links[i].done = true;
                    stats.resolved += 1;
                }
            }
            if !links[index].done {
                self.copy(&mut forest, &links[index], &mut out, &mut marks).await?;
                links[index].done = true;
                stats.resolved += 1;
            }
        }

        let mut marks: Vec<XLinkMark> = marks
            .into_iter()
            .map(|(geometry_id, kind)| XLinkMark { geometry_id, kind })
            .collect();
        marks.sort_by_key(|m| m.geometry_id);
        out.xlink_marks = marks;
        if !out.is_empty() {
            self.storage.write(out).await?;
        }
        info!(
            resolved = stats.resolved,
            unresolved = stats.unresolved,
            circular = stats.circular,
            "Geometry xlinks resolved"
        );
        Ok(stats)
    }

    async fn copy(
        &self,
        forest: &mut GeometryForest,
        link: &Link,
        out: &mut WriteBatch,
        marks: &mut FxHashMap<i64, XLinkKind>,
    ) -> Result<()> {
        let Some(source) = self.target(&link.href) else {
            return Ok(());
        };
        let (size, kind) = {
            let rows = forest.subtree(source);
            let local = rows
                .first()
                .is_some_and(|r| r.feature_id == link.link.owner_feature);
            (rows.len(), if local { XLinkKind::Local } else { XLinkKind::Global })
        };
        let mut ids = IdBlock::new(self.ids.reserve(Sequence::Geometry, size).await?);
        let target = CopyTarget {
            parent_id: link.link.parent_id,
            root_id: link.link.root_id,
            reversed: link.link.reversed,
            xlink: kind,
            feature_id: link.link.owner_feature,
        };
        let copies = copy_subtree(forest, source, target, &mut ids)?;

        for row in forest.subtree(source) {
            let mark = marks.entry(row.id).or_insert(kind);
            if kind == XLinkKind::Global {
                *mark = XLinkKind::Global;
            }
        }
        if let (Some(column), Some(first)) = (&link.link.column, copies.first()) {
            out.assignments.push(GeometryAssignment {
                table: column.table.clone(),
                column: column.column.clone(),
                feature_id: column.feature_id,
                root_id: first.id,
            });
        }
        for row in &copies {
            forest.insert(row.clone());
        }
        out.geometry.extend(copies);
        Ok(())
    }
}
