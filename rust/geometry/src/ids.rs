// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identifier helpers: reserved id blocks and regenerated external ids.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use citydb_lite_core::DuplicateIdPolicy;
use rustc_hash::FxHasher;

use crate::error::{Error, Result};

/// Pre-reserved internal ids, handed out in order
#[derive(Debug, Clone, Default)]
pub struct IdBlock {
    ids: VecDeque<i64>,
}

impl IdBlock {
    pub fn new(ids: Vec<i64>) -> Self {
        Self { ids: ids.into() }
    }

    pub fn take(&mut self) -> Result<i64> {
        self.ids.pop_front().ok_or(Error::IdsExhausted(1))
    }

    pub fn remaining(&self) -> usize {
        self.ids.len()
    }

    pub fn extend(&mut self, ids: impl IntoIterator<Item = i64>) {
        self.ids.extend(ids);
    }
}

/// Generates fresh external ids for geometry written as a duplicate
#[derive(Debug, Clone)]
pub struct DuplicateIds {
    policy: DuplicateIdPolicy,
}

impl DuplicateIds {
    pub fn new(policy: DuplicateIdPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DuplicateIdPolicy {
        &self.policy
    }

    /// New id for a copy of `original` stored as row `internal_id`.
    ///
    /// `salt` separates several copies of the same row in one output.
    pub fn regenerate(&self, original: &str, internal_id: i64, salt: u64) -> String {
        match &self.policy {
            DuplicateIdPolicy::Deterministic { prefix } => {
                let mut hasher = FxHasher::default();
                original.hash(&mut hasher);
                internal_id.hash(&mut hasher);
                salt.hash(&mut hasher);
                format!("{}{:016x}", prefix, hasher.finish())
            }
            DuplicateIdPolicy::Random { prefix } => {
                format!("{}{}", prefix, uuid::Uuid::new_v4())
            }
        }
    }
}

impl Default for DuplicateIds {
    fn default() -> Self {
        Self::new(DuplicateIdPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_hands_out_in_order() {
        let mut block = IdBlock::new(vec![5, 6]);
        assert_eq!(block.take().unwrap(), 5);
        assert_eq!(block.take().unwrap(), 6);
        assert_eq!(block.take(), Err(Error::IdsExhausted(1)));
        block.extend([9]);
        assert_eq!(block.remaining(), 1);
    }

    #[test]
    fn deterministic_ids_are_stable() {
        let ids = DuplicateIds::default();
        let a = ids.regenerate("poly1", 42, 0);
        assert_eq!(a, ids.regenerate("poly1", 42, 0));
        assert_ne!(a, ids.regenerate("poly1", 42, 1));
        assert!(a.starts_with("ID_"));
        assert_eq!(a.len(), 3 + 16);
    }

    #[test]
    fn random_ids_differ() {
        let ids = DuplicateIds::new(DuplicateIdPolicy::Random {
            prefix: "UUID_".into(),
        });
        assert_ne!(ids.regenerate("p", 1, 0), ids.regenerate("p", 1, 0));
    }
}
