// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker pool
//!
//! Generic bounded executor. Items go through a bounded channel, so
//! [`WorkerPool::submit`] waits while the queue is full. Workers are added
//! while queued items outnumber idle workers, up to the maximum, and surplus
//! workers exit after the keep-alive period.
//!
//! The first failing unit is recorded and cancels the token the pool was
//! started with; units that are already queued still run unless the pool is
//! stopped with [`WorkerPool::shutdown_now`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use citydb_lite_core::EngineConfig;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Processes items taken from the pool's queue
#[async_trait]
pub trait WorkHandler<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, item: T) -> Result<()>;

    /// Completes deferred work once the pool is quiescent.
    async fn drain(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub keep_alive: Duration,
}

impl PoolConfig {
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            min_workers: min_workers.clamp(1, max_workers),
            max_workers,
            queue_capacity: 256,
            keep_alive: Duration::from_secs(5),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

impl From<&EngineConfig> for PoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self::new(config.min_workers, config.max_workers)
            .with_queue_capacity(config.queue_capacity)
            .with_keep_alive(config.keep_alive())
    }
}

struct Shared<T: Send + 'static> {
    rx: AsyncMutex<mpsc::Receiver<T>>,
    handler: Arc<dyn WorkHandler<T>>,
    config: PoolConfig,
    cancel: CancelToken,
    /// Submitted and not yet finished
    outstanding: AtomicUsize,
    idle: Notify,
    workers: AtomicUsize,
    busy: AtomicUsize,
    completed: AtomicUsize,
    stop: AtomicBool,
    error: parking_lot::Mutex<Option<Error>>,
}

impl<T: Send + 'static> Shared<T> {
    fn fail(&self, error: Error) {
        tracing::error!(error = %error, "Work unit failed");
        self.error.lock().get_or_insert(error);
        self.cancel.cancel();
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Gives up a worker slot unless only the minimum remains.
    fn try_retire(&self) -> bool {
        let mut current = self.workers.load(Ordering::SeqCst);
        while current > self.config.min_workers {
            match self.workers.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }
}

pub struct WorkerPool<T: Send + 'static> {
    tx: Option<mpsc::Sender<T>>,
    shared: Arc<Shared<T>>,
    tasks: JoinSet<()>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Starts the minimum number of workers. Must be called within a runtime.
    pub fn new(handler: Arc<dyn WorkHandler<T>>, config: PoolConfig, cancel: CancelToken) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let min = config.min_workers;
        let shared = Arc::new(Shared {
            rx: AsyncMutex::new(rx),
            handler,
            config,
            cancel,
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            workers: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            error: parking_lot::Mutex::new(None),
        });
        let mut pool = Self {
            tx: Some(tx),
            shared,
            tasks: JoinSet::new(),
        };
        for _ in 0..min {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(&mut self) {
        self.shared.workers.fetch_add(1, Ordering::SeqCst);
        self.tasks.spawn(worker_loop(self.shared.clone()));
    }

    /// Queues one item, waiting while the queue is full.
    pub async fn submit(&mut self, item: T) -> Result<()> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        let tx = self.tx.as_ref().ok_or(Error::PoolClosed)?;
        let permit = tx.reserve().await.map_err(|_| Error::PoolClosed)?;
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        permit.send(item);
        self.grow();
        Ok(())
    }

    fn grow(&mut self) {
        while let Some(finished) = self.tasks.try_join_next() {
            if let Err(e) = finished {
                self.shared.fail(e.into());
            }
        }
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        let queued = tx.max_capacity() - tx.capacity();
        let workers = self.shared.workers.load(Ordering::SeqCst);
        let idle = workers.saturating_sub(self.shared.busy.load(Ordering::SeqCst));
        if queued > idle && workers < self.shared.config.max_workers {
            tracing::debug!(workers = workers + 1, queued, "Adding worker");
            self.spawn_worker();
        }
    }

    /// Waits until every submitted item has finished.
    pub async fn join(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Closes the queue and waits for queued items to finish.
    ///
    /// Returns the first unit failure, if any.
    pub async fn shutdown(mut self) -> Result<()> {
        self.tx.take();
        while let Some(finished) = self.tasks.join_next().await {
            if let Err(e) = finished {
                self.shared.fail(e.into());
            }
        }
        match self.shared.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Discards queued items and waits only for running ones.
    pub async fn shutdown_now(self) -> Result<()> {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shutdown().await
    }

    pub fn workers(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.shared.error.lock().is_some()
    }
}

async fn worker_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
    loop {
        let next = tokio::time::timeout(shared.config.keep_alive, async {
            shared.rx.lock().await.recv().await
        })
        .await;
        let item = match next {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => {
                if shared.try_retire() {
                    tracing::debug!("Idle worker retiring");
                    return;
                }
                continue;
            }
        };

        shared.busy.fetch_add(1, Ordering::SeqCst);
        if !shared.stop.load(Ordering::SeqCst) {
            let outcome = AssertUnwindSafe(shared.handler.handle(item))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {
                    shared.completed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Err(e)) => shared.fail(e),
                Err(panic) => shared.fail(Error::Join(panic_message(panic))),
            }
        }
        shared.busy.fetch_sub(1, Ordering::SeqCst);
        shared.finish_one();
    }
    shared.workers.fetch_sub(1, Ordering::SeqCst);
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        seen: parking_lot::Mutex<Vec<u32>>,
        delay: Duration,
    }

    #[async_trait]
    impl WorkHandler<u32> for Counter {
        async fn handle(&self, item: u32) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            match item {
                13 => Err(Error::Storage("unlucky".into())),
                99 => panic!("boom"),
                _ => {
                    self.seen.lock().push(item);
                    Ok(())
                }
            }
        }
    }

    fn counter(ms: u64) -> Arc<Counter> {
        Arc::new(Counter {
            seen: parking_lot::Mutex::new(Vec::new()),
            delay: Duration::from_millis(ms),
        })
    }

    #[tokio::test]
    async fn join_waits_for_every_item() {
        let handler = counter(2);
        let config = PoolConfig::new(1, 4).with_queue_capacity(2);
        let mut pool = WorkerPool::new(handler.clone(), config, CancelToken::new());
        for i in 0..20 {
            pool.submit(i).await.unwrap();
        }
        pool.join().await;
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.completed(), 20);
        assert!(pool.workers() <= 4);
        pool.shutdown().await.unwrap();

        let mut seen = handler.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn first_failure_cancels_and_surfaces() {
        let cancel = CancelToken::new();
        let mut pool = WorkerPool::new(counter(0), PoolConfig::new(1, 1), cancel.clone());
        for i in [1, 13, 2] {
            pool.submit(i).await.unwrap();
        }
        pool.join().await;
        assert!(cancel.is_cancelled());
        assert!(pool.has_failed());
        assert!(matches!(pool.shutdown().await, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let mut pool = WorkerPool::new(counter(0), PoolConfig::new(1, 2), CancelToken::new());
        pool.submit(99).await.unwrap();
        pool.submit(5).await.unwrap();
        pool.join().await;
        assert!(matches!(pool.shutdown().await, Err(Error::Join(msg)) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn surplus_workers_retire() {
        let config = PoolConfig::new(1, 4)
            .with_queue_capacity(8)
            .with_keep_alive(Duration::from_millis(20));
        let mut pool = WorkerPool::new(counter(5), config, CancelToken::new());
        for i in 0..8 {
            pool.submit(i).await.unwrap();
        }
        assert!(pool.workers() > 1);
        pool.join().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.workers(), 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_now_discards_queue() {
        let handler = counter(20);
        let mut pool = WorkerPool::new(handler.clone(), PoolConfig::new(1, 1), CancelToken::new());
        for i in 0..5 {
            pool.submit(i).await.unwrap();
        }
        pool.shutdown_now().await.unwrap();
        assert!(handler.seen.lock().len() < 5);
    }
}
