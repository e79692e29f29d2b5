// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # CityDB-Lite Core
//!
//! Shared model of the CityDB-Lite mapping engine, which loads nested 3D city
//! models into a relational adjacency-list schema and reads them back.
//!
//! ## Overview
//!
//! - **Feature graph**: [`Feature`] trees with attributes, LOD geometry and
//!   inline or by-reference children
//! - **Geometry model**: aggregates, solids and polygons as a tagged
//!   [`GeometryKind`], with explicit orientation reversal
//! - **Reference cache**: the run's single `gml:id` correlation map, with
//!   forward-reference parking and cycle-checked resolution ordering
//! - **Schema mapping**: feature type to table and tier to column layout
//! - **Query descriptor**: predicates, projection, LOD filter and output options
//! - **WKT codec**: polygon payloads exchanged with the spatial database
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use citydb_lite_core::{CacheEntry, ReferenceCache};
//!
//! let cache = ReferenceCache::new(64);
//! let (id, first) = cache.register_or_lookup("B1", CacheEntry::feature(10, 26, 10));
//! assert!(first);
//! let (again, first) = cache.register_or_lookup("#B1", CacheEntry::feature(11, 26, 11));
//! assert_eq!((again, first), (id, false));
//! ```
//!
//! ## Feature Flags
//!
//! - `serde`: serialization of the feature graph and geometry model

pub mod config;
pub mod error;
pub mod feature;
pub mod geometry;
pub mod projection;
pub mod query;
pub mod reference;
pub mod schema;
pub mod wkt;

pub use config::{EngineConfig, FailurePolicy};
pub use error::{Error, Result};
pub use feature::{
    Feature, FeatureProperty, FeatureRef, FeatureType, Lod, LodGeometry, Representation, Value,
};
pub use geometry::{Envelope, Geometry, GeometryKind, GeometryMember, GeometryTag, Point, Polygon, Ring};
pub use projection::{LodFilter, LodMode, Projection};
pub use query::{
    AffineMatrix, BatchSizes, CompareOp, DuplicateIdPolicy, LikePattern, LikeToken, Predicate,
    QueryDescriptor, XLinkOutput,
};
pub use reference::{
    CacheEntry, ColumnTarget, GeometryLink, PendingReference, ReferenceCache, GEOMETRY_TYPE,
};
pub use schema::{
    AttributeColumn, ChildRelation, ColumnKind, GeometryColumn, RelationKind, SchemaMapping,
    TypeMapping,
};
