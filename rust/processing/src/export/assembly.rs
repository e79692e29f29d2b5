// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-unit feature assembly
//!
//! Batched callbacks arrive in any order, so a unit's features are collected
//! in an index-keyed arena: a node is created as a placeholder when its read
//! is requested and filled when the row arrives. A counter tracks requests in
//! flight; when it drops to zero the arena is folded into one nested
//! [`Feature`].

use std::sync::atomic::{AtomicUsize, Ordering};

use citydb_lite_core::{Feature, FeatureProperty, FeatureRef, LodGeometry};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::dispatcher::WorkItem;
use crate::error::{Error, Result};

#[derive(Debug)]
enum NodeState {
    Pending,
    Feature(Feature),
    Reference(String),
}

#[derive(Debug)]
struct Node {
    id: i64,
    state: NodeState,
    parent: Option<usize>,
    property: String,
    role: Option<String>,
    /// Relation rank, then internal id
    order: (usize, i64),
    geometries: Vec<LodGeometry>,
}

#[derive(Debug, Default)]
struct Arena {
    nodes: Vec<Node>,
    /// Internal ids already placed in this unit
    seen: FxHashSet<i64>,
}

#[derive(Debug)]
pub(crate) struct Assembly {
    pub item: WorkItem,
    arena: Mutex<Arena>,
    pending: AtomicUsize,
    failure: Mutex<Option<Error>>,
}

impl Assembly {
    pub fn new(item: WorkItem) -> Self {
        Self {
            item,
            arena: Mutex::new(Arena::default()),
            pending: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    fn push(&self, node: Node) -> usize {
        let mut arena = self.arena.lock();
        arena.seen.insert(node.id);
        arena.nodes.push(node);
        arena.nodes.len() - 1
    }

    pub fn add_root(&self, id: i64) -> usize {
        self.push(Node {
            id,
            state: NodeState::Pending,
            parent: None,
            property: String::new(),
            role: None,
            order: (0, id),
            geometries: Vec::new(),
        })
    }

    pub fn add_child(
        &self,
        parent: usize,
        property: &str,
        role: Option<String>,
        rank: usize,
        id: i64,
    ) -> usize {
        self.push(Node {
            id,
            state: NodeState::Pending,
            parent: Some(parent),
            property: property.to_string(),
            role,
            order: (rank, id),
            geometries: Vec::new(),
        })
    }

    pub fn add_reference(
        &self,
        parent: usize,
        property: &str,
        role: Option<String>,
        rank: usize,
        id: i64,
        href: String,
    ) {
        let mut arena = self.arena.lock();
        arena.nodes.push(Node {
            id,
            state: NodeState::Reference(href),
            parent: Some(parent),
            property: property.to_string(),
            role,
            order: (rank, id),
            geometries: Vec::new(),
        });
    }

    pub fn fill(&self, node: usize, feature: Feature) {
        if let Some(n) = self.arena.lock().nodes.get_mut(node) {
            n.state = NodeState::Feature(feature);
        }
    }

    pub fn add_geometry(&self, node: usize, geometry: LodGeometry) {
        if let Some(n) = self.arena.lock().nodes.get_mut(node) {
            n.geometries.push(geometry);
        }
    }

    /// False when `id` is already part of this unit.
    pub fn visit(&self, id: i64) -> bool {
        !self.arena.lock().seen.contains(&id)
    }

    pub fn begin(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks one request done. True when it was the last one.
    pub fn end(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn fail(&self, error: Error) {
        self.failure.lock().get_or_insert(error);
    }

    /// Folds the arena into the unit's feature tree.
    pub fn finish(&self) -> Result<Feature> {
        if let Some(e) = self.failure.lock().take() {
            return Err(e);
        }
        let nodes = std::mem::take(&mut self.arena.lock().nodes);
        if nodes.is_empty() {
            return Err(Error::MissingRoot {
                batch: "features".to_string(),
                key: self.item.id,
            });
        }

        let mut children: Vec<Vec<((usize, i64), FeatureProperty)>> =
            (0..nodes.len()).map(|_| Vec::new()).collect();
        let mut root = None;
        // Children always have higher indexes than their parent.
        for (index, node) in nodes.into_iter().enumerate().rev() {
            let target = match node.state {
                NodeState::Pending => {
                    return Err(Error::MissingRoot {
                        batch: "features".to_string(),
                        key: node.id,
                    })
                }
                NodeState::Reference(href) => FeatureRef::Reference(href),
                NodeState::Feature(mut feature) => {
                    let mut own = std::mem::take(&mut children[index]);
                    own.sort_by_key(|(order, _)| *order);
                    feature.children = own.into_iter().map(|(_, p)| p).collect();
                    let mut geometries = node.geometries;
                    geometries.sort_by_key(|g| (g.lod, g.representation));
                    feature.geometries = geometries;
                    match node.parent {
                        None => {
                            root = Some(feature);
                            continue;
                        }
                        Some(_) => FeatureRef::Inline(Box::new(feature)),
                    }
                }
            };
            if let Some(parent) = node.parent {
                children[parent].push((
                    node.order,
                    FeatureProperty {
                        name: node.property,
                        role: node.role,
                        target,
                    },
                ));
            }
        }
        root.ok_or(Error::MissingRoot {
            batch: "features".to_string(),
            key: self.item.id,
        })
    }
}
