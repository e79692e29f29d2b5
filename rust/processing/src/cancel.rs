// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative cancellation
//!
//! A broadcast stop signal observed between units of work. Clones share the
//! same signal; cancelling is idempotent and never interrupts a unit that is
//! already running.

use std::sync::Arc;

use futures::future::{self, BoxFuture};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    /// Own signal first, then every ancestor's
    signals: Vec<watch::Receiver<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            signals: vec![rx],
        }
    }

    /// A token that stops with this one but can also be cancelled on its own
    /// without affecting it.
    pub fn child(&self) -> Self {
        let (tx, rx) = watch::channel(false);
        let mut signals = vec![rx];
        signals.extend(self.signals.iter().cloned());
        Self {
            tx: Arc::new(tx),
            signals,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once this token or an ancestor is cancelled.
    pub async fn cancelled(&self) {
        let waits: Vec<BoxFuture<'static, ()>> = self
            .signals
            .iter()
            .map(|rx| {
                let mut rx = rx.clone();
                let wait: BoxFuture<'static, ()> = Box::pin(async move {
                    // A dropped ancestor can no longer cancel.
                    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                        future::pending::<()>().await;
                    }
                });
                wait
            })
            .collect();
        future::select_all(waits).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clones_share_the_signal() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());

        let waiter = tokio::spawn(async move { other.cancelled().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
        token.cancel();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn children_follow_parents_but_not_back() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        let waiter = tokio::spawn(async move { other.cancelled().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("child should observe its parent")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_parent_does_not_cancel() {
        let parent = CancelToken::new();
        let child = parent.child();
        drop(parent);
        assert!(!child.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_millis(20), child.cancelled()).await;
        assert!(waited.is_err());
    }
}
