// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serialized import writer
//!
//! The only task that touches the reference cache's registrations and the
//! storage write path during import. Prepared features arrive over a bounded
//! channel; their identifiers are registered, memberships resolved or parked,
//! and rows buffered until the write batch size is reached.

use std::sync::Arc;

use citydb_lite_core::{CacheEntry, PendingReference, ReferenceCache};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::import::mappers::PreparedFeature;
use crate::storage::{MemberInsert, Storage, WriteBatch};
use crate::summary::RunSummary;

/// What the writer leaves for the post phase
#[derive(Debug, Default)]
pub(crate) struct WriterOutcome {
    /// Type name of every feature owning a parked reference
    pub owners: FxHashMap<i64, &'static str>,
    pub features: usize,
    pub flushes: usize,
}

pub(crate) struct Writer {
    storage: Arc<dyn Storage>,
    cache: Arc<ReferenceCache>,
    summary: Arc<RunSummary>,
    batch_size: usize,
    buffer: WriteBatch,
    outcome: WriterOutcome,
}

impl Writer {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<ReferenceCache>,
        summary: Arc<RunSummary>,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            cache,
            summary,
            batch_size: batch_size.max(1),
            buffer: WriteBatch::default(),
            outcome: WriterOutcome::default(),
        }
    }

    /// Consumes prepared features until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<PreparedFeature>) -> Result<WriterOutcome> {
        while let Some(prepared) = rx.recv().await {
            self.accept(prepared);
            if self.buffer.features.len() >= self.batch_size {
                self.flush().await?;
            }
        }
        self.flush().await?;
        info!(
            features = self.outcome.features,
            flushes = self.outcome.flushes,
            parked = self.cache.parked_count(),
            "Import writer finished"
        );
        Ok(self.outcome)
    }

    fn accept(&mut self, prepared: PreparedFeature) {
        let PreparedFeature {
            root_id,
            feature_type,
            batch,
            features,
            geometry,
            members,
            links,
            ..
        } = prepared;
        self.buffer.append(batch);

        for (gml_id, entry) in features {
            let (id, first) = self.cache.register_or_lookup(&gml_id, entry);
            if !first {
                warn!(gml_id = %gml_id, feature_id = entry.internal_id, kept = id, "Duplicate gml:id, keeping first registration");
            }
            for pending in self.cache.take_parked(&gml_id) {
                match pending {
                    PendingReference::GroupMember { group_id, role } => {
                        self.buffer.members.push(MemberInsert {
                            group_id,
                            member_id: id,
                            role,
                        });
                    }
                    other => self.cache.park(&gml_id, other),
                }
            }
        }

        for (gml_id, id, root) in geometry {
            let (kept, first) = self.cache.register_or_lookup(&gml_id, CacheEntry::geometry(id, root));
            if !first {
                warn!(gml_id = %gml_id, geometry_id = id, kept, "Duplicate geometry gml:id, keeping first registration");
            }
        }

        for member in members {
            match self.cache.lookup(&member.href).filter(|e| !e.is_geometry()) {
                Some(target) => self.buffer.members.push(MemberInsert {
                    group_id: member.group_id,
                    member_id: target.internal_id,
                    role: member.role,
                }),
                None => {
                    debug!(group_id = member.group_id, href = %member.href, "Parking forward member reference");
                    self.outcome.owners.insert(member.group_id, member.owner_type);
                    self.cache.park(
                        &member.href,
                        PendingReference::GroupMember {
                            group_id: member.group_id,
                            role: member.role,
                        },
                    );
                }
            }
        }

        for link in links {
            self.outcome.owners.insert(link.link.owner_feature, link.owner_type);
            self.cache.park(&link.href, PendingReference::GeometryCopy(link.link));
        }

        self.outcome.features += 1;
        if let Some(ft) = feature_type {
            self.summary.processed(ft.name());
        }
        debug!(feature_id = root_id, "Feature prepared for write");
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        debug!(
            features = batch.features.len(),
            geometry = batch.geometry.len(),
            members = batch.members.len(),
            "Flushing write batch"
        );
        self.storage.write(batch).await?;
        self.outcome.flushes += 1;
        Ok(())
    }
}
