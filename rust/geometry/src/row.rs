// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rows of the shared adjacency-list geometry table.

use citydb_lite_core::Polygon;

/// Structural flags stored per row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GeometryFlags {
    pub is_solid: bool,
    pub is_composite: bool,
    pub is_triangulated: bool,
}

impl GeometryFlags {
    pub const NONE: GeometryFlags = GeometryFlags {
        is_solid: false,
        is_composite: false,
        is_triangulated: false,
    };

    pub fn solid() -> Self {
        Self {
            is_solid: true,
            ..Self::NONE
        }
    }

    pub fn composite() -> Self {
        Self {
            is_composite: true,
            ..Self::NONE
        }
    }

    pub fn composite_solid() -> Self {
        Self {
            is_solid: true,
            is_composite: true,
            ..Self::NONE
        }
    }

    pub fn triangulated() -> Self {
        Self {
            is_triangulated: true,
            ..Self::NONE
        }
    }
}

/// How a row came to exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum XLinkKind {
    #[default]
    None,
    /// Referenced or copied within the same top-level feature
    Local,
    /// Referenced or copied across top-level features
    Global,
}

impl XLinkKind {
    pub fn code(&self) -> i32 {
        match self {
            XLinkKind::None => 0,
            XLinkKind::Local => 1,
            XLinkKind::Global => 2,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => XLinkKind::Local,
            2 => XLinkKind::Global,
            _ => XLinkKind::None,
        }
    }
}

/// One node of a stored geometry tree
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryRow {
    pub id: i64,
    /// `None` for roots
    pub parent_id: Option<i64>,
    pub root_id: i64,
    pub flags: GeometryFlags,
    pub xlink: XLinkKind,
    pub is_reversed: bool,
    pub gml_id: Option<String>,
    /// Leaf polygon; only leaves carry one
    pub payload: Option<Polygon>,
    /// Owning feature
    pub feature_id: i64,
}

impl GeometryRow {
    /// Interior row. A parent id of `0` is read as "no parent".
    pub fn interior(id: i64, parent_id: i64, root_id: i64, flags: GeometryFlags) -> Self {
        Self {
            id,
            parent_id: (parent_id != 0).then_some(parent_id),
            root_id,
            flags,
            xlink: XLinkKind::None,
            is_reversed: false,
            gml_id: None,
            payload: None,
            feature_id: 0,
        }
    }

    pub fn leaf(id: i64, parent_id: i64, root_id: i64, polygon: Polygon) -> Self {
        Self {
            payload: Some(polygon),
            ..Self::interior(id, parent_id, root_id, GeometryFlags::NONE)
        }
    }

    pub fn with_gml_id(mut self, id: impl Into<String>) -> Self {
        self.gml_id = Some(id.into());
        self
    }

    pub fn with_xlink(mut self, kind: XLinkKind) -> Self {
        self.xlink = kind;
        self
    }

    pub fn reversed(mut self) -> Self {
        self.is_reversed = true;
        self
    }

    pub fn with_feature(mut self, feature_id: i64) -> Self {
        self.feature_id = feature_id;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.payload.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_parent_is_root() {
        let row = GeometryRow::interior(1, 0, 1, GeometryFlags::solid());
        assert!(row.is_root());
        assert!(!row.is_leaf());
        assert!(GeometryRow::interior(2, 1, 1, GeometryFlags::NONE).parent_id == Some(1));
    }

    #[test]
    fn xlink_codes() {
        for kind in [XLinkKind::None, XLinkKind::Local, XLinkKind::Global] {
            assert_eq!(XLinkKind::from_code(kind.code()), kind);
        }
    }
}
