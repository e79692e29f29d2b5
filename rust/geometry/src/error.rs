// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Result type for geometry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decomposing or copying geometry
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Id block exhausted: {0} more ids needed")]
    IdsExhausted(usize),

    #[error("Geometry row {0} not found")]
    MissingRow(i64),

    #[error("Empty aggregate: {0}")]
    EmptyAggregate(String),

    #[error("Core error: {0}")]
    CoreError(#[from] citydb_lite_core::Error),
}
