// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batch coordinator
//!
//! Coalesces per-key lookups into bulk round-trips. Requests queue until the
//! configured size is reached or [`BatchCoordinator::flush`] is called; one
//! fetch then serves the whole chunk and each callback receives only the rows
//! of its own key. Callbacks may queue further requests, which the same flush
//! picks up before returning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

/// Completion of one queued request
pub type Callback<R> = Box<dyn FnOnce(Result<Vec<R>>) -> Result<()> + Send>;

/// Bulk read keyed by integer ids
#[async_trait]
pub trait BulkFetch<R: Send + 'static>: Send + Sync {
    async fn fetch(&self, keys: &[i64]) -> Result<Vec<R>>;

    /// Point lookup used when batching is disabled.
    async fn fetch_one(&self, key: i64) -> Result<Vec<R>> {
        let keys = [key];
        self.fetch(&keys).await
    }

    /// Key a returned row belongs to
    fn key_of(&self, row: &R) -> i64;
}

/// Whether a key with no rows is an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Every requested key must come back (roots)
    Required,
    /// A key may legitimately have no rows (children, members)
    Optional,
}

pub struct BatchCoordinator<R: Send + 'static> {
    name: String,
    batch_size: usize,
    mode: KeyMode,
    fetch: Arc<dyn BulkFetch<R>>,
    pending: Mutex<Vec<(i64, Callback<R>)>>,
    round_trips: AtomicUsize,
}

impl<R: Clone + Send + 'static> BatchCoordinator<R> {
    pub fn new(
        name: impl Into<String>,
        batch_size: usize,
        mode: KeyMode,
        fetch: Arc<dyn BulkFetch<R>>,
    ) -> Self {
        Self {
            name: name.into(),
            batch_size: batch_size.max(1),
            mode,
            fetch,
            pending: Mutex::new(Vec::new()),
            round_trips: AtomicUsize::new(0),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Queues a request without flushing. Returns true once the batch is full.
    pub fn defer(&self, key: i64, callback: Callback<R>) -> bool {
        let mut pending = self.pending.lock();
        pending.push((key, callback));
        pending.len() >= self.batch_size
    }

    /// Queues a request and flushes when the batch is full.
    pub async fn request(&self, key: i64, callback: Callback<R>) -> Result<()> {
        if self.defer(key, callback) {
            self.flush().await
        } else {
            Ok(())
        }
    }

    /// Issues bulk fetches until nothing is queued.
    ///
    /// Every callback runs, even after an earlier one failed; the first error
    /// is returned.
    pub async fn flush(&self) -> Result<()> {
        let mut first_error = None;
        loop {
            let chunk: Vec<(i64, Callback<R>)> = {
                let mut pending = self.pending.lock();
                let n = pending.len().min(self.batch_size);
                pending.drain(..n).collect()
            };
            if chunk.is_empty() {
                break;
            }
            if let Err(e) = self.run(chunk).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run(&self, chunk: Vec<(i64, Callback<R>)>) -> Result<()> {
        let mut keys: Vec<i64> = chunk.iter().map(|(k, _)| *k).collect();
        keys.sort_unstable();
        keys.dedup();

        self.round_trips.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(batch = %self.name, keys = keys.len(), "Bulk fetch");
        let fetched = if self.batch_size == 1 && keys.len() == 1 {
            self.fetch.fetch_one(keys[0]).await
        } else {
            self.fetch.fetch(&keys).await
        };

        let rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                let message = e.to_string();
                for (_, callback) in chunk {
                    let _ = callback(Err(Error::Storage(message.clone())));
                }
                return Err(e);
            }
        };

        let mut grouped: FxHashMap<i64, Vec<R>> = FxHashMap::default();
        for row in rows {
            grouped.entry(self.fetch.key_of(&row)).or_default().push(row);
        }

        let mut first_error = None;
        for (key, callback) in chunk {
            let result = match grouped.get(&key) {
                Some(rows) => Ok(rows.clone()),
                None if self.mode == KeyMode::Required => Err(Error::MissingRoot {
                    batch: self.name.clone(),
                    key,
                }),
                None => Ok(Vec::new()),
            };
            if let Err(e) = callback(result) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<R: Send + 'static> Drop for BatchCoordinator<R> {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().len();
        if pending > 0 {
            tracing::warn!(batch = %self.name, pending, "Batch dropped with unflushed requests");
        }
    }
}

/// Type-erased view of a coordinator used to flush heterogeneous batches
#[async_trait]
pub trait Flush: Send + Sync {
    fn name(&self) -> &str;
    fn pending(&self) -> usize;
    fn is_full(&self) -> bool;
    async fn flush(&self) -> Result<()>;
    fn round_trips(&self) -> usize;
}

#[async_trait]
impl<R: Clone + Send + 'static> Flush for BatchCoordinator<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn is_full(&self) -> bool {
        self.pending.lock().len() >= self.batch_size
    }

    async fn flush(&self) -> Result<()> {
        BatchCoordinator::flush(self).await
    }

    fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Returns `(key, n)` rows for keys below 100, twice for even keys
    struct Rows {
        calls: AtomicUsize,
        point: AtomicUsize,
    }

    #[async_trait]
    impl BulkFetch<(i64, u8)> for Rows {
        async fn fetch(&self, keys: &[i64]) -> Result<Vec<(i64, u8)>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if keys.contains(&666) {
                return Err(Error::Storage("connection lost".into()));
            }
            let mut out = Vec::new();
            for k in keys.iter().filter(|k| **k < 100) {
                out.push((*k, 0));
                if k % 2 == 0 {
                    out.push((*k, 1));
                }
            }
            Ok(out)
        }

        async fn fetch_one(&self, key: i64) -> Result<Vec<(i64, u8)>> {
            self.point.fetch_add(1, Ordering::SeqCst);
            self.fetch(&[key]).await
        }

        fn key_of(&self, row: &(i64, u8)) -> i64 {
            row.0
        }
    }

    fn rows() -> Arc<Rows> {
        Arc::new(Rows {
            calls: AtomicUsize::new(0),
            point: AtomicUsize::new(0),
        })
    }

    fn collect(key: i64, seen: &Arc<Mutex<Vec<(i64, usize)>>>) -> Callback<(i64, u8)> {
        let seen = seen.clone();
        Box::new(move |result: Result<Vec<(i64, u8)>>| {
            let rows = result?;
            assert!(rows.iter().all(|r| r.0 == key));
            seen.lock().push((key, rows.len()));
            Ok(())
        })
    }

    #[tokio::test]
    async fn k_keys_take_ceil_k_over_n_round_trips() {
        let fetch = rows();
        let batch = BatchCoordinator::new("roots", 3, KeyMode::Required, fetch.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for key in 1..=7 {
            batch.request(key, collect(key, &seen)).await.unwrap();
        }
        assert_eq!(Flush::round_trips(&batch), 2);
        batch.flush().await.unwrap();
        assert_eq!(Flush::round_trips(&batch), 3);
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 3);

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![(1, 1), (2, 2), (3, 1), (4, 2), (5, 1), (6, 2), (7, 1)]);
    }

    #[tokio::test]
    async fn missing_required_key() {
        let batch = BatchCoordinator::new("roots", 8, KeyMode::Required, rows());
        let errors = Arc::new(Mutex::new(Vec::new()));
        for key in [5, 150] {
            let errors = errors.clone();
            batch.defer(
                key,
                Box::new(move |result: Result<Vec<(i64, u8)>>| {
                    if let Err(e) = result {
                        errors.lock().push(e.to_string());
                    }
                    Ok(())
                }),
            );
        }
        batch.flush().await.unwrap();
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("150"));

        let optional = BatchCoordinator::new("children", 8, KeyMode::Optional, rows());
        let seen = Arc::new(Mutex::new(Vec::new()));
        optional.defer(150, collect(150, &seen));
        optional.flush().await.unwrap();
        assert_eq!(seen.lock().clone(), vec![(150, 0)]);
    }

    #[tokio::test]
    async fn fetch_error_reaches_every_callback() {
        let batch = BatchCoordinator::new("roots", 4, KeyMode::Required, rows());
        let failures = Arc::new(AtomicUsize::new(0));
        for key in [1, 666] {
            let failures = failures.clone();
            batch.defer(
                key,
                Box::new(move |result: Result<Vec<(i64, u8)>>| {
                    if matches!(result, Err(Error::Storage(_))) {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }),
            );
        }
        assert!(matches!(batch.flush().await, Err(Error::Storage(_))));
        assert_eq!(failures.load(Ordering::SeqCst), 2);
        assert_eq!(Flush::pending(&batch), 0);
    }

    #[tokio::test]
    async fn callbacks_can_queue_more_work() {
        let fetch = rows();
        let batch = Arc::new(BatchCoordinator::new("tree", 2, KeyMode::Optional, fetch.clone()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = batch.clone();
        let seen_inner = seen.clone();
        batch.defer(
            1,
            Box::new(move |result: Result<Vec<(i64, u8)>>| {
                result?;
                inner.defer(2, collect(2, &seen_inner));
                inner.defer(3, collect(3, &seen_inner));
                Ok(())
            }),
        );
        batch.flush().await.unwrap();
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn size_one_uses_point_lookup() {
        let fetch = rows();
        let batch = BatchCoordinator::new("roots", 1, KeyMode::Required, fetch.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for key in [4, 9] {
            batch.request(key, collect(key, &seen)).await.unwrap();
        }
        assert_eq!(fetch.point.load(Ordering::SeqCst), 2);
        assert!(!Flush::is_full(&batch));
    }
}
