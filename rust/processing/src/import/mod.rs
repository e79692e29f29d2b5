// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Import pipeline
//!
//! Workers turn top-level features into prepared rows in parallel; a single
//! writer task registers identifiers and writes in foreign-key order. Once
//! the input is exhausted, parked geometry xlinks are resolved and group
//! members that never appeared are reported.

mod links;
mod mappers;
mod writer;

use std::sync::Arc;

use async_trait::async_trait;
use citydb_lite_core::{
    EngineConfig, FailurePolicy, Feature, GeometryLink, PendingReference, ReferenceCache,
    SchemaMapping,
};
use citydb_lite_geometry::{row_count, IdBlock};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::dispatcher::{RunReport, RunStatus};
use crate::error::{Error, Result};
use crate::pool::{PoolConfig, WorkHandler, WorkerPool};
use crate::storage::{Sequence, Storage};
use crate::summary::RunSummary;

use links::LinkResolver;
use mappers::{ImportMappers, PersistContext, PreparedFeature};
use writer::Writer;

/// One top-level feature to import
#[derive(Debug, Clone, PartialEq)]
pub struct ImportJob {
    pub sequence: u64,
    pub feature: Feature,
}

/// Hands out ids from blocks reserved on the storage sequences.
pub struct IdAllocator {
    storage: Arc<dyn Storage>,
    block_size: usize,
    features: AsyncMutex<IdBlock>,
    geometry: AsyncMutex<IdBlock>,
}

impl IdAllocator {
    pub fn new(storage: Arc<dyn Storage>, block_size: usize) -> Self {
        Self {
            storage,
            block_size: block_size.max(1),
            features: AsyncMutex::new(IdBlock::new(Vec::new())),
            geometry: AsyncMutex::new(IdBlock::new(Vec::new())),
        }
    }

    /// Takes `count` ids in increasing order.
    pub async fn reserve(&self, sequence: Sequence, count: usize) -> Result<Vec<i64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut block = match sequence {
            Sequence::Feature => self.features.lock().await,
            Sequence::Geometry => self.geometry.lock().await,
        };
        if block.remaining() < count {
            let need = (count - block.remaining()).max(self.block_size);
            let ids = self.storage.reserve_ids(sequence, need).await?;
            block.extend(ids);
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(block.take()?);
        }
        Ok(out)
    }
}

struct ImportWorker {
    mappers: ImportMappers,
    ids: Arc<IdAllocator>,
    tx: mpsc::Sender<PreparedFeature>,
    policy: FailurePolicy,
    summary: Arc<RunSummary>,
}

impl ImportWorker {
    fn prepare(&self, job: &ImportJob, feature_ids: Vec<i64>, geometry_ids: Vec<i64>) -> Result<PreparedFeature> {
        let mapper = self.mappers.get(job.feature.feature_type)?;
        let mut ctx = PersistContext::new(&self.mappers, IdBlock::new(feature_ids), IdBlock::new(geometry_ids));
        mapper.persist(&mut ctx, &job.feature, None)?;
        Ok(ctx.out)
    }
}

#[async_trait]
impl WorkHandler<ImportJob> for ImportWorker {
    async fn handle(&self, job: ImportJob) -> Result<()> {
        let descendants = job.feature.descendants();
        let geometry_rows: usize = std::iter::once(&job.feature)
            .chain(descendants.iter().copied())
            .flat_map(|f| f.geometries.iter())
            .map(|g| row_count(&g.geometry))
            .sum();
        let feature_ids = self.ids.reserve(Sequence::Feature, 1 + descendants.len()).await?;
        let geometry_ids = self.ids.reserve(Sequence::Geometry, geometry_rows).await?;
        let first_id = feature_ids.first().copied().unwrap_or_default();
        debug!(sequence = job.sequence, feature_id = first_id, "Preparing feature");

        match self.prepare(&job, feature_ids, geometry_ids) {
            Ok(prepared) => self.tx.send(prepared).await.map_err(|_| Error::SinkClosed),
            Err(e) if self.policy == FailurePolicy::BestEffort && e.is_recoverable() => {
                self.summary
                    .skipped(first_id, job.feature.feature_type.name(), &e.to_string());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Loads feature graphs into storage
pub struct Importer {
    storage: Arc<dyn Storage>,
    schema: Arc<SchemaMapping>,
    config: EngineConfig,
    cancel: CancelToken,
    cache: Arc<ReferenceCache>,
    summary: Arc<RunSummary>,
}

impl Importer {
    pub fn new(storage: Arc<dyn Storage>, schema: Arc<SchemaMapping>, config: EngineConfig) -> Self {
        let cache = Arc::new(ReferenceCache::new(config.max_reference_chain));
        Self {
            storage,
            schema,
            config,
            cancel: CancelToken::new(),
            cache,
            summary: Arc::new(RunSummary::new()),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The run's identifier cache, populated as features are written
    pub fn cache(&self) -> Arc<ReferenceCache> {
        self.cache.clone()
    }

    /// Imports every feature of `features`, then resolves parked references.
    pub async fn run<S>(&self, features: S) -> Result<RunReport>
    where
        S: Stream<Item = Feature> + Send,
    {
        info!(
            workers = self.config.max_workers,
            write_batch = self.config.write_batch_size,
            "Starting import"
        );
        let ids = Arc::new(IdAllocator::new(self.storage.clone(), self.config.id_block_size));
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let writer = Writer::new(
            self.storage.clone(),
            self.cache.clone(),
            self.summary.clone(),
            self.config.write_batch_size,
        );
        let writer_task = tokio::spawn(writer.run(rx));

        let worker = Arc::new(ImportWorker {
            mappers: ImportMappers::from_schema(&self.schema),
            ids: ids.clone(),
            tx,
            policy: self.config.failure_policy,
            summary: self.summary.clone(),
        });
        // Failing units abort through a child token; the caller's stays untouched.
        let abort = self.cancel.child();
        let mut pool = WorkerPool::new(worker, PoolConfig::from(&self.config), abort.clone());

        let submitted = self.submit_all(&mut pool, &abort, features).await;
        let shutdown = if submitted.is_ok() {
            pool.shutdown().await
        } else {
            pool.shutdown_now().await
        };
        // The pool held the last sender; the writer ends once the queue is empty.
        let outcome = writer_task.await??;
        let submitted = submitted?;
        shutdown?;

        let mut links: Vec<(String, GeometryLink)> = Vec::new();
        let mut members = Vec::new();
        for (href, pending) in self.cache.drain_parked() {
            match pending {
                PendingReference::GeometryCopy(link) => links.push((href, link)),
                PendingReference::GroupMember { group_id, .. } => members.push((href, group_id)),
            }
        }

        let resolver = LinkResolver {
            storage: &self.storage,
            cache: &self.cache,
            ids: &ids,
            summary: &self.summary,
            owners: &outcome.owners,
        };
        resolver.resolve(links).await?;

        let cancelled = self.cancel.is_cancelled();
        for (href, group_id) in members {
            if self.config.failure_policy == FailurePolicy::FailFast && !cancelled {
                return Err(Error::UnresolvedMember { group_id, href });
            }
            warn!(group_id, href = %href, "Group member never resolved");
            let owner = outcome.owners.get(&group_id).copied().unwrap_or("Unknown");
            self.summary.unresolved(owner);
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        let summary = self.summary.snapshot();
        info!(
            status = ?status,
            submitted,
            written = outcome.features,
            processed = summary.processed(),
            skipped = summary.skipped_count(),
            unresolved = summary.unresolved(),
            "Import finished"
        );
        Ok(RunReport {
            status,
            submitted,
            deferred: 0,
            summary,
        })
    }

    async fn submit_all<S>(
        &self,
        pool: &mut WorkerPool<ImportJob>,
        abort: &CancelToken,
        features: S,
    ) -> Result<usize>
    where
        S: Stream<Item = Feature> + Send,
    {
        let features = features.fuse();
        futures::pin_mut!(features);
        let mut sequence = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                feature = features.next() => feature,
            };
            let Some(feature) = next else {
                break;
            };
            let job = ImportJob { sequence, feature };
            let outcome = tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                res = pool.submit(job) => Some(res),
            };
            match outcome {
                Some(res) => res?,
                None => break,
            }
            sequence += 1;
        }
        pool.join().await;
        Ok(sequence as usize)
    }
}

/// Imports `features` with a fresh reference cache.
pub async fn import<S>(
    storage: Arc<dyn Storage>,
    schema: Arc<SchemaMapping>,
    config: EngineConfig,
    cancel: CancelToken,
    features: S,
) -> Result<RunReport>
where
    S: Stream<Item = Feature> + Send,
{
    Importer::new(storage, schema, config)
        .with_cancel(cancel)
        .run(features)
        .await
}
