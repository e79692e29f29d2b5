// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by storage, batching, mappers and the worker pipeline
#[derive(Error, Debug)]
pub enum Error {
    #[error("Root {key} requested by batch '{batch}' is missing from the bulk result")]
    MissingRoot { batch: String, key: i64 },

    #[error("Feature {feature_id} has type code {type_code} with no registered mapper")]
    UnknownType { feature_id: i64, type_code: i32 },

    #[error("Group {group_id} member '{href}' never resolved")]
    UnresolvedMember { group_id: i64, href: String },

    #[error("Geometry root {0} not found")]
    MissingGeometry(i64),

    #[error("Core error: {0}")]
    Core(#[from] citydb_lite_core::Error),

    #[error("Geometry error: {0}")]
    Geometry(#[from] citydb_lite_geometry::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Output channel closed")]
    SinkClosed,

    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("Worker task failed: {0}")]
    Join(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl Error {
    /// Data-integrity failures that the run policy may turn into a skip.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::MissingRoot { .. }
            | Error::UnknownType { .. }
            | Error::UnresolvedMember { .. }
            | Error::MissingGeometry(_) => true,
            Error::Core(e) => e.is_per_feature(),
            Error::Geometry(citydb_lite_geometry::Error::CoreError(e)) => e.is_per_feature(),
            Error::Geometry(citydb_lite_geometry::Error::EmptyAggregate(_))
            | Error::Geometry(citydb_lite_geometry::Error::MissingRow(_)) => true,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Join(e.to_string())
    }
}
