// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage abstraction
//!
//! Every round-trip the pipeline makes goes through [`Storage`]. Reads are
//! bulk and keyed by id sets so the batch coordinators can coalesce them;
//! writes arrive as one [`WriteBatch`] applied in foreign-key order.

use std::sync::Arc;

use async_trait::async_trait;
use citydb_lite_core::{
    AttributeColumn, Envelope, FeatureType, Predicate, QueryDescriptor, SchemaMapping, Value,
};
use citydb_lite_geometry::{GeometryRow, XLinkKind};
use futures::stream::BoxStream;
use rustc_hash::FxHashMap;

use crate::batch::BulkFetch;
use crate::error::Result;
use crate::path;

/// Row of the "matching top-level features" query
#[derive(Debug, Clone, PartialEq)]
pub struct TopLevelRow {
    pub id: i64,
    pub type_code: i32,
    pub envelope: Option<Envelope>,
}

/// Resolved filter over top-level features
#[derive(Debug, Clone)]
pub struct FeatureFilter {
    pub types: Vec<FeatureType>,
    pub predicate: Option<Predicate>,
    pub schema: Arc<SchemaMapping>,
}

impl FeatureFilter {
    /// Validates the descriptor's types and every property path of its filter.
    pub fn from_descriptor(descriptor: &QueryDescriptor) -> Result<Self> {
        let types = descriptor.top_level_types()?;
        if let Some(predicate) = &descriptor.filter {
            for p in predicate.paths() {
                path::resolve(&descriptor.schema, &types, p)?;
            }
        }
        Ok(Self {
            types,
            predicate: descriptor.filter.clone(),
            schema: descriptor.schema.clone(),
        })
    }

    pub fn type_codes(&self) -> Vec<i32> {
        self.types.iter().map(FeatureType::code).collect()
    }
}

/// Which base column a feature query is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyColumn {
    Id,
    Parent,
}

/// Projection-limited read of one feature type
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureQuery {
    pub feature_type: FeatureType,
    pub table: String,
    pub columns: Vec<AttributeColumn>,
    pub geometry_columns: Vec<String>,
    pub key: KeyColumn,
}

impl FeatureQuery {
    pub fn keyed_by(&self, key: KeyColumn) -> Self {
        Self {
            key,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub id: i64,
    pub type_code: i32,
    pub parent_id: Option<i64>,
    pub gml_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub envelope: Option<Envelope>,
    /// Non-null attribute values by column
    pub values: FxHashMap<String, Value>,
    /// Non-null geometry roots by column
    pub geometry: FxHashMap<String, i64>,
}

/// Group membership joined with the member's base row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRow {
    pub group_id: i64,
    pub member_id: i64,
    /// `None` when the member feature does not exist
    pub type_code: Option<i32>,
    pub gml_id: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sequence {
    Feature,
    Geometry,
}

/// Base and type-table row of one feature
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureInsert {
    pub id: i64,
    pub type_code: i32,
    pub parent_id: Option<i64>,
    pub gml_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub envelope: Option<Envelope>,
    pub table: String,
    pub values: Vec<(String, Value)>,
    pub geometry: Vec<(String, i64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInsert {
    pub group_id: i64,
    pub member_id: i64,
    pub role: Option<String>,
}

/// Late assignment of a geometry root to a feature's geometry column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryAssignment {
    pub table: String,
    pub column: String,
    pub feature_id: i64,
    pub root_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLinkMark {
    pub geometry_id: i64,
    pub kind: XLinkKind,
}

/// Rows written in one transaction.
///
/// Applied as base rows, geometry rows, type rows, memberships, geometry
/// column assignments, then xlink marks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub features: Vec<FeatureInsert>,
    pub geometry: Vec<GeometryRow>,
    pub members: Vec<MemberInsert>,
    pub assignments: Vec<GeometryAssignment>,
    pub xlink_marks: Vec<XLinkMark>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
            && self.geometry.is_empty()
            && self.members.is_empty()
            && self.assignments.is_empty()
            && self.xlink_marks.is_empty()
    }

    pub fn append(&mut self, other: WriteBatch) {
        self.features.extend(other.features);
        self.geometry.extend(other.geometry);
        self.members.extend(other.members);
        self.assignments.extend(other.assignments);
        self.xlink_marks.extend(other.xlink_marks);
    }
}

/// Relational storage used by import and export
#[async_trait]
pub trait Storage: Send + Sync {
    /// Streams matching top-level features in id order.
    fn top_level<'a>(&'a self, filter: &'a FeatureFilter) -> BoxStream<'a, Result<TopLevelRow>>;

    /// Rows of `query.feature_type` whose key column is in `keys`.
    async fn feature_rows(&self, query: &FeatureQuery, keys: &[i64]) -> Result<Vec<FeatureRow>>;

    /// Geometry rows of the given trees, ordered by id.
    async fn geometry_rows(&self, roots: &[i64]) -> Result<Vec<GeometryRow>>;

    async fn group_members(&self, groups: &[i64]) -> Result<Vec<MemberRow>>;

    /// Point form of [`Storage::feature_rows`] for a single key.
    async fn feature_rows_of(&self, query: &FeatureQuery, key: i64) -> Result<Vec<FeatureRow>>;

    /// Rows of one geometry tree, ordered by id.
    async fn geometry_tree(&self, root: i64) -> Result<Vec<GeometryRow>>;

    async fn members_of(&self, group: i64) -> Result<Vec<MemberRow>>;

    async fn reserve_ids(&self, sequence: Sequence, count: usize) -> Result<Vec<i64>>;

    async fn write(&self, batch: WriteBatch) -> Result<()>;
}

// ─── Bulk fetchers used by the batch coordinators ───────────────────────────

pub struct FeatureFetch {
    storage: Arc<dyn Storage>,
    query: FeatureQuery,
}

impl FeatureFetch {
    pub fn new(storage: Arc<dyn Storage>, query: FeatureQuery) -> Self {
        Self { storage, query }
    }
}

#[async_trait]
impl BulkFetch<FeatureRow> for FeatureFetch {
    async fn fetch(&self, keys: &[i64]) -> Result<Vec<FeatureRow>> {
        self.storage.feature_rows(&self.query, keys).await
    }

    async fn fetch_one(&self, key: i64) -> Result<Vec<FeatureRow>> {
        self.storage.feature_rows_of(&self.query, key).await
    }

    fn key_of(&self, row: &FeatureRow) -> i64 {
        match self.query.key {
            KeyColumn::Id => row.id,
            KeyColumn::Parent => row.parent_id.unwrap_or_default(),
        }
    }
}

pub struct GeometryFetch {
    storage: Arc<dyn Storage>,
}

impl GeometryFetch {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl BulkFetch<GeometryRow> for GeometryFetch {
    async fn fetch(&self, keys: &[i64]) -> Result<Vec<GeometryRow>> {
        self.storage.geometry_rows(keys).await
    }

    async fn fetch_one(&self, key: i64) -> Result<Vec<GeometryRow>> {
        self.storage.geometry_tree(key).await
    }

    fn key_of(&self, row: &GeometryRow) -> i64 {
        row.root_id
    }
}

pub struct MemberFetch {
    storage: Arc<dyn Storage>,
}

impl MemberFetch {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl BulkFetch<MemberRow> for MemberFetch {
    async fn fetch(&self, keys: &[i64]) -> Result<Vec<MemberRow>> {
        self.storage.group_members(keys).await
    }

    async fn fetch_one(&self, key: i64) -> Result<Vec<MemberRow>> {
        self.storage.members_of(key).await
    }

    fn key_of(&self, row: &MemberRow) -> i64 {
        row.group_id
    }
}
