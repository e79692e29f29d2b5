// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CityDB-Lite Geometry
//!
//! Conversion between nested geometry aggregates and rows of the shared
//! adjacency-list geometry table, plus nalgebra-based affine transforms for
//! export.

pub mod decompose;
pub mod error;
pub mod forest;
pub mod ids;
pub mod row;
pub mod transform;

// Re-export nalgebra types for convenience
pub use nalgebra::{Matrix4, Point3};

pub use decompose::{copy_subtree, decompose, row_count, CopyTarget, Decomposition, PendingLink};
pub use error::{Error, Result};
pub use forest::{GeometryForest, XLinkContext};
pub use ids::{DuplicateIds, IdBlock};
pub use row::{GeometryFlags, GeometryRow, XLinkKind};
pub use transform::AffineTransform;
