// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-run counters: processed, skipped and unresolved features per type.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounts {
    pub processed: usize,
    pub skipped: usize,
    pub unresolved: usize,
    /// Geometry properties dropped because their tree was not found
    pub missing_geometry: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFeature {
    pub feature_id: i64,
    pub feature_type: String,
    pub reason: String,
}

/// Point-in-time copy of a [`RunSummary`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SummarySnapshot {
    pub per_type: BTreeMap<String, TypeCounts>,
    pub skipped: Vec<SkippedFeature>,
}

impl SummarySnapshot {
    pub fn processed(&self) -> usize {
        self.per_type.values().map(|c| c.processed).sum()
    }

    pub fn skipped_count(&self) -> usize {
        self.per_type.values().map(|c| c.skipped).sum()
    }

    pub fn unresolved(&self) -> usize {
        self.per_type.values().map(|c| c.unresolved).sum()
    }

    pub fn missing_geometry(&self) -> usize {
        self.per_type.values().map(|c| c.missing_geometry).sum()
    }

    pub fn counts(&self, feature_type: &str) -> TypeCounts {
        self.per_type.get(feature_type).copied().unwrap_or_default()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Shared run summary
#[derive(Debug, Default)]
pub struct RunSummary {
    inner: Mutex<SummarySnapshot>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self, feature_type: &str) {
        self.inner
            .lock()
            .per_type
            .entry(feature_type.to_string())
            .or_default()
            .processed += 1;
    }

    /// Records a skipped feature and emits its diagnostic line.
    pub fn skipped(&self, feature_id: i64, feature_type: &str, reason: &str) {
        tracing::warn!(feature_id, feature_type, reason, "Skipping feature");
        let mut inner = self.inner.lock();
        inner
            .per_type
            .entry(feature_type.to_string())
            .or_default()
            .skipped += 1;
        inner.skipped.push(SkippedFeature {
            feature_id,
            feature_type: feature_type.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn unresolved(&self, feature_type: &str) {
        self.inner
            .lock()
            .per_type
            .entry(feature_type.to_string())
            .or_default()
            .unresolved += 1;
    }

    /// Records a geometry property exported without its tree.
    pub fn missing_geometry(&self, feature_id: i64, feature_type: &str, reason: &str) {
        tracing::warn!(feature_id, feature_type, reason, "Dropping geometry property");
        self.inner
            .lock()
            .per_type
            .entry(feature_type.to_string())
            .or_default()
            .missing_geometry += 1;
    }

    pub fn snapshot(&self) -> SummarySnapshot {
        self.inner.lock().clone()
    }
}
