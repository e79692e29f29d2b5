// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the feature model, descriptor resolution and reference cache
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid WKT: {0}")]
    Wkt(String),

    #[error("Unknown property path '{0}'")]
    UnknownProperty(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Circular reference chain: {}", chain.join(" -> "))]
    CircularReference { chain: Vec<String> },

    #[error("Reference chain starting at '{href}' exceeds {limit} hops")]
    ReferenceChainTooLong { href: String, limit: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for failures that concern a single feature rather than the run.
    pub fn is_per_feature(&self) -> bool {
        matches!(
            self,
            Error::CircularReference { .. } | Error::ReferenceChainTooLong { .. }
        )
    }
}
