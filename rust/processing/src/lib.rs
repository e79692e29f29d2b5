// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # CityDB-Lite Processing
//!
//! Concurrent import and export between city-model feature graphs and the
//! relational adjacency-list schema.
//!
//! ## Overview
//!
//! - **Dispatcher**: streams matching top-level features into a worker pool,
//!   deferring group features to a second phase
//! - **Worker pool**: bounded queue, elastic workers, first-failure abort
//! - **Batch coordinators**: coalesce per-feature reads into bulk round-trips
//! - **Content mappers**: per-type reconstruction and row preparation
//! - **Import writer**: the single task that registers identifiers and writes
//! - **SQL translation**: predicates and property paths to PostGIS statements
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use citydb_lite_core::{EngineConfig, FeatureType, QueryDescriptor, SchemaMapping};
//! use citydb_lite_processing::{export, CancelToken, MemoryStore};
//!
//! let schema = Arc::new(SchemaMapping::citydb());
//! let store = Arc::new(MemoryStore::new((*schema).clone()));
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! let descriptor = QueryDescriptor::new(schema).with_types(&[FeatureType::Building]);
//! let run = export(store, descriptor, &EngineConfig::default(), CancelToken::new(), tx);
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` (default): [`PgStore`] on top of `sqlx`

pub mod batch;
pub mod cancel;
pub mod dispatcher;
pub mod error;
pub mod export;
pub mod import;
pub mod memory;
pub mod path;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sql;
pub mod storage;
pub mod summary;

pub use batch::{BatchCoordinator, BulkFetch, Callback, Flush, KeyMode};
pub use cancel::CancelToken;
pub use dispatcher::{Dispatcher, DispatcherState, RunReport, RunStatus, WorkItem};
pub use error::{Error, Result};
pub use export::{export, ExportSession, ExportedFeature};
pub use import::{import, IdAllocator, ImportJob, Importer};
pub use memory::{MemoryStore, RoundTrips};
pub use pool::{PoolConfig, WorkHandler, WorkerPool};
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use storage::{FeatureFilter, FeatureInsert, MemberInsert, Storage, WriteBatch};
pub use summary::{RunSummary, SummarySnapshot};
