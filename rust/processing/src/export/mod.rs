// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Export pipeline
//!
//! An [`ExportSession`] owns the run's reference cache, the mappers and their
//! batch coordinators, and serves as the dispatcher's work handler. Workers
//! queue a unit's root read and flush every full coordinator; the drain step
//! between dispatch phases flushes the rest. Completed units are sent, in
//! completion order, to a bounded output channel.

mod assembly;
mod mappers;

use std::sync::Arc;

use async_trait::async_trait;
use citydb_lite_core::{
    EngineConfig, Envelope, FailurePolicy, Feature, FeatureType, QueryDescriptor, ReferenceCache,
};
use citydb_lite_geometry::{AffineTransform, DuplicateIds, GeometryRow};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::batch::{BatchCoordinator, Flush, KeyMode};
use crate::cancel::CancelToken;
use crate::dispatcher::{Dispatcher, RunReport, WorkItem};
use crate::error::{Error, Result};
use crate::pool::{PoolConfig, WorkHandler};
use crate::storage::{FeatureFilter, GeometryFetch, Storage};
use crate::summary::RunSummary;

use assembly::Assembly;
use mappers::{ExportMapper, FeatureMapper};

/// One reconstructed top-level feature
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedFeature {
    pub sequence: u64,
    pub envelope: Option<Envelope>,
    pub feature: Feature,
}

pub(crate) struct SessionInner {
    pub descriptor: QueryDescriptor,
    pub cache: Arc<ReferenceCache>,
    pub duplicate_ids: DuplicateIds,
    pub mappers: FxHashMap<FeatureType, FeatureMapper>,
    pub geometry: BatchCoordinator<GeometryRow>,
    transform: Option<AffineTransform>,
    policy: FailurePolicy,
    pub summary: Arc<RunSummary>,
    completed: Mutex<Vec<Arc<Assembly>>>,
    sink: mpsc::Sender<ExportedFeature>,
}

impl SessionInner {
    pub fn mapper(&self, feature_type: FeatureType) -> Result<&FeatureMapper> {
        self.mappers.get(&feature_type).ok_or(Error::UnknownType {
            feature_id: 0,
            type_code: feature_type.code(),
        })
    }

    /// Ends one request of `assembly`, queueing it for output when it was the last.
    pub fn settle_request(&self, assembly: &Arc<Assembly>) {
        if assembly.end() {
            self.completed.lock().push(assembly.clone());
        }
    }

    fn batches(&self) -> Vec<&dyn Flush> {
        let mut out: Vec<&dyn Flush> = vec![&self.geometry];
        let mut types: Vec<&FeatureType> = self.mappers.keys().collect();
        types.sort();
        for ft in types {
            out.extend(self.mappers[ft].batches());
        }
        out
    }

    /// Flushes full coordinators until none is full, then emits finished units.
    async fn pump(&self) -> Result<()> {
        loop {
            let full: Vec<&dyn Flush> = self.batches().into_iter().filter(|b| b.is_full()).collect();
            if full.is_empty() {
                break;
            }
            for batch in full {
                batch.flush().await?;
            }
        }
        self.emit().await
    }

    /// Flushes every coordinator until nothing is queued.
    async fn drain(&self) -> Result<()> {
        loop {
            let queued: Vec<&dyn Flush> = self.batches().into_iter().filter(|b| b.pending() > 0).collect();
            if queued.is_empty() {
                break;
            }
            for batch in queued {
                batch.flush().await?;
            }
        }
        self.emit().await
    }

    async fn emit(&self) -> Result<()> {
        let done = std::mem::take(&mut *self.completed.lock());
        let mut first_error = None;
        for assembly in done {
            if let Err(e) = self.settle(&assembly).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn settle(&self, assembly: &Assembly) -> Result<()> {
        let item = &assembly.item;
        let type_name = type_name(item);
        match assembly.finish() {
            Ok(mut feature) => {
                let mut envelope = item.envelope;
                if let Some(transform) = &self.transform {
                    transform.apply_feature(&mut feature);
                    envelope = envelope.map(|e| transform.apply_envelope(&e));
                }
                self.sink
                    .send(ExportedFeature {
                        sequence: item.sequence,
                        envelope,
                        feature,
                    })
                    .await
                    .map_err(|_| Error::SinkClosed)?;
                self.summary.processed(type_name);
                Ok(())
            }
            Err(e) => self.skip_or_fail(item.id, type_name, e),
        }
    }

    fn skip_or_fail(&self, feature_id: i64, feature_type: &str, error: Error) -> Result<()> {
        if self.policy == FailurePolicy::BestEffort && error.is_recoverable() {
            self.summary.skipped(feature_id, feature_type, &error.to_string());
            Ok(())
        } else {
            Err(error)
        }
    }
}

fn type_name(item: &WorkItem) -> &'static str {
    item.feature_type().map(|ft| ft.name()).unwrap_or("Unknown")
}

/// Export run state shared by all workers
pub struct ExportSession {
    inner: Arc<SessionInner>,
}

impl ExportSession {
    pub fn new(
        storage: Arc<dyn Storage>,
        descriptor: QueryDescriptor,
        config: &EngineConfig,
        summary: Arc<RunSummary>,
        sink: mpsc::Sender<ExportedFeature>,
    ) -> Self {
        let mut mappers = FxHashMap::default();
        for ft in descriptor.schema.feature_types() {
            if let Some(mapping) = descriptor.schema.type_mapping(ft) {
                let mapper = FeatureMapper::new(mapping, &descriptor, &storage);
                mappers.insert(mapper.feature_type(), mapper);
            }
        }
        let geometry = BatchCoordinator::new(
            "geometry",
            descriptor.batch.geometry,
            KeyMode::Optional,
            Arc::new(GeometryFetch::new(storage)),
        );
        let inner = SessionInner {
            cache: Arc::new(ReferenceCache::new(config.max_reference_chain)),
            duplicate_ids: DuplicateIds::new(descriptor.duplicate_ids.clone()),
            transform: descriptor.transform.as_ref().map(AffineTransform::from_rows),
            policy: config.failure_policy,
            descriptor,
            mappers,
            geometry,
            summary,
            completed: Mutex::new(Vec::new()),
            sink,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The run's identifier cache
    pub fn cache(&self) -> Arc<ReferenceCache> {
        self.inner.cache.clone()
    }

    /// Bulk round-trips issued so far, by coordinator name
    pub fn round_trips(&self) -> Vec<(String, usize)> {
        self.inner
            .batches()
            .into_iter()
            .map(|b| (b.name().to_string(), b.round_trips()))
            .collect()
    }
}

#[async_trait]
impl WorkHandler<WorkItem> for ExportSession {
    async fn handle(&self, item: WorkItem) -> Result<()> {
        let inner = &self.inner;
        let Some(mapper) = item.feature_type().and_then(|ft| inner.mappers.get(&ft)) else {
            let error = Error::UnknownType {
                feature_id: item.id,
                type_code: item.type_code,
            };
            return inner.skip_or_fail(item.id, type_name(&item), error);
        };
        let id = item.id;
        let assembly = Arc::new(Assembly::new(item));
        let root = assembly.add_root(id);
        mapper.add_to_batch(inner, &assembly, root, id);
        inner.pump().await
    }

    async fn drain(&self) -> Result<()> {
        self.inner.drain().await
    }
}

/// Exports every feature matching `descriptor` into `sink`.
///
/// Returns once all output has been sent; the sink closes when the session
/// is dropped at the end of the run.
pub async fn export(
    storage: Arc<dyn Storage>,
    descriptor: QueryDescriptor,
    config: &EngineConfig,
    cancel: CancelToken,
    sink: mpsc::Sender<ExportedFeature>,
) -> Result<RunReport> {
    let filter = FeatureFilter::from_descriptor(&descriptor)?;
    let summary = Arc::new(RunSummary::new());
    tracing::info!(
        types = filter.types.len(),
        filtered = filter.predicate.is_some(),
        workers = config.max_workers,
        "Starting export"
    );
    let session = Arc::new(ExportSession::new(storage.clone(), descriptor, config, summary.clone(), sink));
    let mut dispatcher = Dispatcher::new(storage, filter, session, PoolConfig::from(config), cancel, summary);
    let report = dispatcher.run().await?;
    tracing::info!(
        processed = report.summary.processed(),
        skipped = report.summary.skipped_count(),
        "Export finished"
    );
    Ok(report)
}
