// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reference cache
//!
//! One authoritative `gml:id` → internal id map per run, shared by every
//! worker. Besides correlation it parks forward references seen during import
//! until their target registers, and orders dependent references with a
//! bounded walk that rejects circular chains.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{Error, Result};

/// Type code used for geometry entries
pub const GEOMETRY_TYPE: i32 = 0;

/// Correlation record for one external identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub internal_id: i64,
    /// Object class code, [`GEOMETRY_TYPE`] for geometry
    pub type_code: i32,
    /// Registered by this run rather than found in storage
    pub is_local: bool,
    /// Geometry root (geometry) or top-level feature (features)
    pub root_id: i64,
}

impl CacheEntry {
    pub fn feature(internal_id: i64, type_code: i32, root_id: i64) -> Self {
        Self {
            internal_id,
            type_code,
            is_local: true,
            root_id,
        }
    }

    pub fn geometry(internal_id: i64, root_id: i64) -> Self {
        Self {
            internal_id,
            type_code: GEOMETRY_TYPE,
            is_local: true,
            root_id,
        }
    }

    pub fn is_geometry(&self) -> bool {
        self.type_code == GEOMETRY_TYPE
    }
}

/// Where a resolved geometry link must be recorded as a property root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnTarget {
    pub table: String,
    pub column: String,
    pub feature_id: i64,
}

/// Geometry xlink awaiting its target subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryLink {
    /// Feature whose geometry contains the link
    pub owner_feature: i64,
    /// Insertion point, `None` when the link is a property value itself
    pub parent_id: Option<i64>,
    /// Root of the tree the copy joins, ignored when `parent_id` is `None`
    pub root_id: i64,
    pub reversed: bool,
    pub column: Option<ColumnTarget>,
}

/// Work parked on an unregistered target id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReference {
    GroupMember { group_id: i64, role: Option<String> },
    GeometryCopy(GeometryLink),
}

/// Strips the fragment marker of an href (`#B1` → `B1`).
pub fn normalize(href: &str) -> &str {
    href.trim_start_matches('#')
}

/// Run-scoped identifier cache
pub struct ReferenceCache {
    entries: Mutex<FxHashMap<String, CacheEntry>>,
    parked: Mutex<FxHashMap<String, Vec<PendingReference>>>,
    max_chain: usize,
}

impl ReferenceCache {
    pub fn new(max_chain: usize) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            parked: Mutex::new(FxHashMap::default()),
            max_chain: max_chain.max(1),
        }
    }

    /// Registers `external_id` unless already known.
    ///
    /// Returns the authoritative internal id and whether this call registered
    /// it. Later registrations never replace the first one.
    pub fn register_or_lookup(&self, external_id: &str, entry: CacheEntry) -> (i64, bool) {
        let mut entries = self.entries.lock();
        match entries.get(normalize(external_id)) {
            Some(existing) => (existing.internal_id, false),
            None => {
                entries.insert(normalize(external_id).to_string(), entry);
                (entry.internal_id, true)
            }
        }
    }

    pub fn lookup(&self, external_id: &str) -> Option<CacheEntry> {
        self.entries.lock().get(normalize(external_id)).copied()
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.entries.lock().contains_key(normalize(external_id))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Parks work until `target` registers.
    pub fn park(&self, target: &str, pending: PendingReference) {
        self.parked
            .lock()
            .entry(normalize(target).to_string())
            .or_default()
            .push(pending);
    }

    /// Takes everything parked on `target`.
    pub fn take_parked(&self, target: &str) -> Vec<PendingReference> {
        self.parked
            .lock()
            .remove(normalize(target))
            .unwrap_or_default()
    }

    /// Takes everything still parked, ordered by target id.
    pub fn drain_parked(&self) -> Vec<(String, PendingReference)> {
        let mut parked: Vec<_> = self.parked.lock().drain().collect();
        parked.sort_by(|a, b| a.0.cmp(&b.0));
        parked
            .into_iter()
            .flat_map(|(target, list)| list.into_iter().map(move |p| (target.clone(), p)))
            .collect()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.lock().values().map(Vec::len).sum()
    }

    /// Orders `start` and everything it transitively depends on so that
    /// dependencies come first.
    ///
    /// `deps` yields the ids a given id depends on. A chain that returns to an
    /// id on the current path fails with [`Error::CircularReference`]; one
    /// longer than the configured limit fails with
    /// [`Error::ReferenceChainTooLong`].
    pub fn resolution_order<F>(&self, start: &str, mut deps: F) -> Result<Vec<String>>
    where
        F: FnMut(&str) -> Vec<String>,
    {
        let mut walk = Walk {
            limit: self.max_chain,
            path: Vec::new(),
            done: FxHashSet::default(),
            order: Vec::new(),
        };
        walk.visit(normalize(start), &mut deps)?;
        Ok(walk.order)
    }
}

struct Walk {
    limit: usize,
    path: Vec<String>,
    done: FxHashSet<String>,
    order: Vec<String>,
}

impl Walk {
    fn visit<F>(&mut self, id: &str, deps: &mut F) -> Result<()>
    where
        F: FnMut(&str) -> Vec<String>,
    {
        if self.done.contains(id) {
            return Ok(());
        }
        if let Some(pos) = self.path.iter().position(|p| p == id) {
            let mut chain = self.path[pos..].to_vec();
            chain.push(id.to_string());
            return Err(Error::CircularReference { chain });
        }
        if self.path.len() >= self.limit {
            return Err(Error::ReferenceChainTooLong {
                href: self.path.first().cloned().unwrap_or_else(|| id.to_string()),
                limit: self.limit,
            });
        }

        self.path.push(id.to_string());
        for dep in deps(id) {
            self.visit(normalize(&dep), deps)?;
        }
        self.path.pop();

        self.done.insert(id.to_string());
        self.order.push(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregistering_returns_first_id() {
        let cache = ReferenceCache::new(16);
        assert_eq!(cache.register_or_lookup("B1", CacheEntry::feature(10, 26, 10)), (10, true));
        assert_eq!(cache.register_or_lookup("#B1", CacheEntry::feature(99, 26, 99)), (10, false));
        assert_eq!(cache.lookup("B1").unwrap().internal_id, 10);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn parked_references_are_taken_once() {
        let cache = ReferenceCache::new(16);
        cache.park(
            "#A",
            PendingReference::GroupMember {
                group_id: 7,
                role: None,
            },
        );
        cache.park(
            "B",
            PendingReference::GroupMember {
                group_id: 8,
                role: Some("r".into()),
            },
        );
        assert_eq!(cache.parked_count(), 2);
        assert_eq!(cache.take_parked("A").len(), 1);
        assert!(cache.take_parked("A").is_empty());
        let rest = cache.drain_parked();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0, "B");
        assert_eq!(cache.parked_count(), 0);
    }

    #[test]
    fn resolution_order_puts_dependencies_first() {
        let cache = ReferenceCache::new(16);
        let graph: FxHashMap<&str, Vec<String>> = [
            ("a", vec!["b".to_string(), "c".to_string()]),
            ("b", vec!["#c".to_string()]),
            ("c", vec![]),
        ]
        .into_iter()
        .collect();
        let order = cache
            .resolution_order("a", |id| graph.get(id).cloned().unwrap_or_default())
            .unwrap();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn circular_chain_is_reported() {
        let cache = ReferenceCache::new(16);
        let err = cache
            .resolution_order("x", |id| match id {
                "x" => vec!["y".to_string()],
                "y" => vec!["x".to_string()],
                _ => vec![],
            })
            .unwrap_err();
        assert_eq!(
            err,
            Error::CircularReference {
                chain: vec!["x".into(), "y".into(), "x".into()]
            }
        );
        assert!(err.is_per_feature());
    }

    #[test]
    fn long_chain_hits_limit() {
        let cache = ReferenceCache::new(3);
        let err = cache
            .resolution_order("n0", |id| {
                let n: usize = id[1..].parse().unwrap();
                vec![format!("n{}", n + 1)]
            })
            .unwrap_err();
        assert!(matches!(err, Error::ReferenceChainTooLong { limit: 3, .. }));
    }
}
