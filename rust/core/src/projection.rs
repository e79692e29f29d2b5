// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Projection and level-of-detail filters applied by export mappers.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::feature::{FeatureType, Lod};

/// Properties read per feature type.
///
/// Types without an explicit entry get every property; `gml:id` is always
/// read.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Projection {
    #[default]
    All,
    Only(FxHashMap<FeatureType, FxHashSet<String>>),
}

impl Projection {
    /// Restricts `feature_type` to `properties`.
    pub fn only(self, feature_type: FeatureType, properties: &[&str]) -> Self {
        let mut map = match self {
            Projection::All => FxHashMap::default(),
            Projection::Only(map) => map,
        };
        map.entry(feature_type)
            .or_insert_with(FxHashSet::default)
            .extend(properties.iter().map(|p| local_name(p).to_string()));
        Projection::Only(map)
    }

    pub fn requests(&self, feature_type: FeatureType, property: &str) -> bool {
        match self {
            Projection::All => true,
            Projection::Only(map) => match map.get(&feature_type) {
                Some(props) => props.contains(local_name(property)),
                None => true,
            },
        }
    }
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// Which enabled tier(s) to read when several are present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LodMode {
    #[default]
    All,
    Highest,
    Lowest,
}

/// Enabled precision tiers
#[derive(Debug, Clone, PartialEq)]
pub struct LodFilter {
    tiers: SmallVec<[Lod; 5]>,
    pub mode: LodMode,
}

impl Default for LodFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl LodFilter {
    pub fn all() -> Self {
        Self {
            tiers: Lod::ALL.iter().copied().collect(),
            mode: LodMode::All,
        }
    }

    pub fn new(tiers: &[Lod], mode: LodMode) -> Self {
        let mut tiers: SmallVec<[Lod; 5]> = tiers.iter().copied().collect();
        tiers.sort();
        tiers.dedup();
        Self { tiers, mode }
    }

    pub fn tiers(&self) -> &[Lod] {
        &self.tiers
    }

    pub fn is_enabled(&self, lod: Lod) -> bool {
        self.tiers.contains(&lod)
    }

    /// Enabled tiers to read for one representation.
    ///
    /// `present` tells whether the representation exists at a tier at all. An
    /// existing but empty representation counts as present, so a lower tier is
    /// only used when a higher one is wholly absent.
    pub fn select<F>(&self, present: F) -> SmallVec<[Lod; 5]>
    where
        F: Fn(Lod) -> bool,
    {
        match self.mode {
            LodMode::All => self.tiers.iter().copied().filter(|l| present(*l)).collect(),
            LodMode::Highest => self
                .tiers
                .iter()
                .rev()
                .copied()
                .find(|l| present(*l))
                .into_iter()
                .collect(),
            LodMode::Lowest => self
                .tiers
                .iter()
                .copied()
                .find(|l| present(*l))
                .into_iter()
                .collect(),
        }
    }
}
