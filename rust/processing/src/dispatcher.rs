// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Work dispatcher
//!
//! Runs the matching top-level query once and turns every row into a
//! [`WorkItem`] for the worker pool. Group features are held back and only
//! dispatched after every other unit has finished and its batches have been
//! drained, so that their members are already known to the reference cache.

use std::sync::Arc;

use citydb_lite_core::{Envelope, FeatureType};
use futures::StreamExt;
use tracing::info;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::pool::{PoolConfig, WorkHandler, WorkerPool};
use crate::storage::{FeatureFilter, Storage, TopLevelRow};
use crate::summary::{RunSummary, SummarySnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Running,
    /// Cancelled; submitted units are finishing
    Draining,
    Completed,
    Closed,
}

/// One top-level feature to process
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: i64,
    pub type_code: i32,
    pub envelope: Option<Envelope>,
    /// Dispatch order, used to correlate output only
    pub sequence: u64,
}

impl WorkItem {
    pub fn feature_type(&self) -> Option<FeatureType> {
        FeatureType::from_code(self.type_code)
    }

    fn from_row(row: TopLevelRow, sequence: u64) -> Self {
        Self {
            id: row.id,
            type_code: row.type_code,
            envelope: row.envelope,
            sequence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Stopped early; everything reported was fully processed
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub status: RunStatus,
    /// Units handed to the pool, groups included
    pub submitted: usize,
    /// Group units held for the second phase
    pub deferred: usize,
    pub summary: SummarySnapshot,
}

pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    filter: FeatureFilter,
    handler: Arc<dyn WorkHandler<WorkItem>>,
    config: PoolConfig,
    /// User cancellation
    cancel: CancelToken,
    /// Child of `cancel`, also tripped by a failing unit
    abort: CancelToken,
    summary: Arc<RunSummary>,
    state: DispatcherState,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        filter: FeatureFilter,
        handler: Arc<dyn WorkHandler<WorkItem>>,
        config: PoolConfig,
        cancel: CancelToken,
        summary: Arc<RunSummary>,
    ) -> Self {
        Self {
            storage,
            filter,
            handler,
            config,
            abort: cancel.child(),
            cancel,
            summary,
            state: DispatcherState::Idle,
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// Dispatches every matching feature and waits for the pool to finish.
    ///
    /// Cancellation is not an error: the report carries
    /// [`RunStatus::Cancelled`] and counts only completed work.
    pub async fn run(&mut self) -> Result<RunReport> {
        self.abort = self.cancel.child();
        let mut pool = WorkerPool::new(self.handler.clone(), self.config.clone(), self.abort.clone());
        let outcome = self.dispatch(&mut pool).await;
        let shutdown = if outcome.is_ok() {
            pool.shutdown().await
        } else {
            pool.shutdown_now().await
        };
        self.state = DispatcherState::Closed;

        let (submitted, deferred) = outcome?;
        shutdown?;

        let status = if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        let summary = self.summary.snapshot();
        info!(
            status = ?status,
            submitted,
            deferred,
            processed = summary.processed(),
            skipped = summary.skipped_count(),
            "Dispatch finished"
        );
        Ok(RunReport {
            status,
            submitted,
            deferred,
            summary,
        })
    }

    async fn dispatch(&mut self, pool: &mut WorkerPool<WorkItem>) -> Result<(usize, usize)> {
        self.state = DispatcherState::Running;
        info!(types = ?self.filter.type_codes(), workers = self.config.max_workers, "Dispatching top-level features");

        let storage = self.storage.clone();
        let mut groups = Vec::new();
        let mut submitted = 0;
        let mut sequence = 0u64;
        {
            let mut rows = storage.top_level(&self.filter);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.abort.cancelled() => None,
                    row = rows.next() => row,
                };
                let Some(row) = next else {
                    break;
                };
                let item = WorkItem::from_row(row?, sequence);
                sequence += 1;

                if item.feature_type().is_some_and(|ft| ft.is_group()) {
                    groups.push(item);
                    continue;
                }
                if !self.submit(pool, item).await? {
                    break;
                }
                submitted += 1;
            }
        }

        pool.join().await;
        self.handler.drain().await?;
        let deferred = groups.len();

        if !groups.is_empty() && !self.abort.is_cancelled() {
            info!(submitted, groups = deferred, "Dispatching deferred group features");
            for item in groups {
                if !self.submit(pool, item).await? {
                    break;
                }
                submitted += 1;
            }
            pool.join().await;
            self.handler.drain().await?;
        }

        self.state = if self.abort.is_cancelled() {
            info!(submitted, "Dispatch cancelled, submitted units finished");
            DispatcherState::Draining
        } else {
            DispatcherState::Completed
        };
        Ok((submitted, deferred))
    }

    /// Submits one unit unless the run is cancelled first.
    async fn submit(&self, pool: &mut WorkerPool<WorkItem>, item: WorkItem) -> Result<bool> {
        if self.abort.is_cancelled() {
            return Ok(false);
        }
        let outcome = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            res = pool.submit(item) => Some(res),
        };
        match outcome {
            Some(res) => res.map(|_| true),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memory::MemoryStore;
    use crate::storage::{FeatureInsert, WriteBatch};
    use async_trait::async_trait;
    use citydb_lite_core::{QueryDescriptor, SchemaMapping};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn insert(id: i64, ft: FeatureType) -> FeatureInsert {
        let schema = SchemaMapping::citydb();
        FeatureInsert {
            id,
            type_code: ft.code(),
            parent_id: None,
            gml_id: format!("F{id}"),
            name: None,
            description: None,
            envelope: None,
            table: schema.type_mapping(ft).map(|m| m.table.clone()).unwrap_or_default(),
            values: Vec::new(),
            geometry: Vec::new(),
        }
    }

    async fn store(features: Vec<FeatureInsert>) -> Arc<MemoryStore> {
        let store = MemoryStore::default();
        store
            .write(WriteBatch {
                features,
                ..WriteBatch::default()
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    fn filter() -> FeatureFilter {
        FeatureFilter::from_descriptor(&QueryDescriptor::new(Arc::new(SchemaMapping::citydb()))).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<i32>>,
        drains: Mutex<Vec<usize>>,
        cancel_after: Option<(usize, CancelToken)>,
        fail_on: Option<i64>,
    }

    #[async_trait]
    impl WorkHandler<WorkItem> for Recorder {
        async fn handle(&self, item: WorkItem) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if self.fail_on == Some(item.id) {
                return Err(Error::Storage("connection reset".into()));
            }
            let n = {
                let mut seen = self.seen.lock();
                seen.push(item.type_code);
                seen.len()
            };
            if let Some((limit, token)) = &self.cancel_after {
                if n >= *limit {
                    token.cancel();
                }
            }
            Ok(())
        }

        async fn drain(&self) -> Result<()> {
            let n = self.seen.lock().len();
            self.drains.lock().push(n);
            Ok(())
        }
    }

    #[tokio::test]
    async fn groups_run_in_second_phase() {
        let store = store(vec![
            insert(1, FeatureType::CityObjectGroup),
            insert(2, FeatureType::Building),
            insert(3, FeatureType::GenericCityObject),
            insert(4, FeatureType::CityObjectGroup),
            insert(5, FeatureType::Building),
        ])
        .await;
        let handler = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new(
            store,
            filter(),
            handler.clone(),
            PoolConfig::new(2, 4),
            CancelToken::new(),
            Arc::new(RunSummary::new()),
        );
        assert_eq!(dispatcher.state(), DispatcherState::Idle);
        let report = dispatcher.run().await.unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Closed);
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!((report.submitted, report.deferred), (5, 2));

        let seen = handler.seen.lock().clone();
        let group = FeatureType::CityObjectGroup.code();
        let first_group = seen.iter().position(|c| *c == group).unwrap();
        assert_eq!(first_group, 3);
        assert!(seen[first_group..].iter().all(|c| *c == group));
        assert_eq!(handler.drains.lock().clone(), vec![3, 5]);
    }

    #[tokio::test]
    async fn cancel_after_n_finishes_submitted_units() {
        let total = 40;
        let store = store((1..=total).map(|i| insert(i, FeatureType::Building)).collect()).await;
        let token = CancelToken::new();
        let handler = Arc::new(Recorder {
            cancel_after: Some((5, token.clone())),
            ..Recorder::default()
        });
        let config = PoolConfig::new(1, 1).with_queue_capacity(1);
        let mut dispatcher = Dispatcher::new(
            store,
            filter(),
            handler.clone(),
            config,
            token,
            Arc::new(RunSummary::new()),
        );
        let report = tokio::time::timeout(Duration::from_secs(5), dispatcher.run())
            .await
            .expect("run must not hang after cancel")
            .unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        let handled = handler.seen.lock().len();
        assert!(handled >= 5);
        assert_eq!(handled, report.submitted);
        assert!(report.submitted < total as usize);
    }

    #[tokio::test]
    async fn unit_failure_aborts_the_run() {
        let store = store((1..=6).map(|i| insert(i, FeatureType::Building)).collect()).await;
        let handler = Arc::new(Recorder {
            fail_on: Some(2),
            ..Recorder::default()
        });
        let cancel = CancelToken::new();
        let mut dispatcher = Dispatcher::new(
            store,
            filter(),
            handler.clone(),
            PoolConfig::new(1, 1).with_queue_capacity(1),
            cancel.clone(),
            Arc::new(RunSummary::new()),
        );
        assert!(matches!(dispatcher.run().await, Err(Error::Storage(_))));
        // the abort stays inside the run
        assert!(!cancel.is_cancelled());
        assert!(handler.seen.lock().len() < 6);
    }
}
