// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolved query descriptor
//!
//! The configuration layer hands the engine one [`QueryDescriptor`]: which
//! top-level types to read, an optional predicate tree, projection and LOD
//! filters, output options and the schema mapping.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::feature::{FeatureType, Value};
use crate::geometry::Envelope;
use crate::projection::{LodFilter, Projection};
use crate::schema::SchemaMapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    pub fn holds(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Lt => ordering == Less,
            CompareOp::Le => ordering != Greater,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Ge => ordering != Less,
        }
    }
}

/// Element of a parsed LIKE pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeToken {
    Literal(char),
    /// Any run of characters
    Any,
    /// Exactly one character
    One,
}

/// LIKE pattern with configurable wildcard, single-char and escape characters
#[derive(Debug, Clone, PartialEq)]
pub struct LikePattern {
    pub pattern: String,
    pub wildcard: char,
    pub single: char,
    pub escape: char,
    pub match_case: bool,
}

impl LikePattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            wildcard: '*',
            single: '.',
            escape: '\\',
            match_case: true,
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.match_case = false;
        self
    }

    pub fn tokens(&self) -> Vec<LikeToken> {
        let mut out = Vec::with_capacity(self.pattern.len());
        let mut chars = self.pattern.chars();
        while let Some(c) = chars.next() {
            if c == self.escape {
                if let Some(next) = chars.next() {
                    out.push(LikeToken::Literal(next));
                } else {
                    out.push(LikeToken::Literal(c));
                }
            } else if c == self.wildcard {
                out.push(LikeToken::Any);
            } else if c == self.single {
                out.push(LikeToken::One);
            } else {
                out.push(LikeToken::Literal(c));
            }
        }
        out
    }

    /// SQL LIKE pattern using `%`, `_` and `\` as escape.
    pub fn to_sql(&self) -> String {
        let mut out = String::with_capacity(self.pattern.len() + 4);
        for token in self.tokens() {
            match token {
                LikeToken::Any => out.push('%'),
                LikeToken::One => out.push('_'),
                LikeToken::Literal(c) => {
                    if matches!(c, '%' | '_' | '\\') {
                        out.push('\\');
                    }
                    out.push(c);
                }
            }
        }
        out
    }
}

/// Filter over top-level features
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    Like {
        path: String,
        pattern: LikePattern,
    },
    Between {
        path: String,
        low: Value,
        high: Value,
    },
    In {
        path: String,
        values: Vec<Value>,
    },
    IsNull {
        path: String,
    },
    /// `gml:id` in the given list
    ResourceId(Vec<String>),
    /// Envelope intersects (x/y)
    BBox(Envelope),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(path: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            path: path.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Eq, value)
    }

    pub fn like(path: &str, pattern: LikePattern) -> Self {
        Predicate::Like {
            path: path.to_string(),
            pattern,
        }
    }

    pub fn between(path: &str, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Predicate::Between {
            path: path.to_string(),
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn is_in(path: &str, values: Vec<Value>) -> Self {
        Predicate::In {
            path: path.to_string(),
            values,
        }
    }

    pub fn is_null(path: &str) -> Self {
        Predicate::IsNull {
            path: path.to_string(),
        }
    }

    pub fn resource_ids<S: AsRef<str>>(ids: &[S]) -> Self {
        Predicate::ResourceId(
            ids.iter()
                .map(|s| s.as_ref().trim_start_matches('#').to_string())
                .collect(),
        )
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Property paths referenced anywhere in the tree
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Compare { path, .. }
            | Predicate::Like { path, .. }
            | Predicate::Between { path, .. }
            | Predicate::In { path, .. }
            | Predicate::IsNull { path } => out.push(path),
            Predicate::ResourceId(_) | Predicate::BBox(_) => {}
            Predicate::And(list) | Predicate::Or(list) => {
                list.iter().for_each(|p| p.collect_paths(out))
            }
            Predicate::Not(inner) => inner.collect_paths(out),
        }
    }
}

/// How repeated geometry is written on export
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum XLinkOutput {
    /// Second and later occurrences become references
    #[default]
    ByReference,
    /// Every occurrence is materialized under a regenerated id
    Duplicate,
}

/// Identifier regeneration for duplicated geometry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateIdPolicy {
    /// Hash of the original id and the row id; stable across runs
    Deterministic { prefix: String },
    /// Random UUID per duplicate
    Random { prefix: String },
}

impl Default for DuplicateIdPolicy {
    fn default() -> Self {
        DuplicateIdPolicy::Deterministic {
            prefix: "ID_".to_string(),
        }
    }
}

/// Keys per bulk round-trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizes {
    pub features: usize,
    pub geometry: usize,
    pub members: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            features: 32,
            geometry: 32,
            members: 32,
        }
    }
}

impl BatchSizes {
    pub fn uniform(size: usize) -> Self {
        let size = size.max(1);
        Self {
            features: size,
            geometry: size,
            members: size,
        }
    }
}

/// Row-major 3x4 affine matrix
pub type AffineMatrix = [[f64; 4]; 3];

#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    /// Requested top-level types, empty for every top-level type
    pub feature_types: Vec<FeatureType>,
    pub filter: Option<Predicate>,
    pub projection: Projection,
    pub lods: LodFilter,
    pub transform: Option<AffineMatrix>,
    pub xlinks: XLinkOutput,
    pub duplicate_ids: DuplicateIdPolicy,
    pub batch: BatchSizes,
    pub schema: Arc<SchemaMapping>,
}

impl QueryDescriptor {
    pub fn new(schema: Arc<SchemaMapping>) -> Self {
        Self {
            feature_types: Vec::new(),
            filter: None,
            projection: Projection::All,
            lods: LodFilter::all(),
            transform: None,
            xlinks: XLinkOutput::ByReference,
            duplicate_ids: DuplicateIdPolicy::default(),
            batch: BatchSizes::default(),
            schema,
        }
    }

    pub fn with_types(mut self, types: &[FeatureType]) -> Self {
        self.feature_types = types.to_vec();
        self
    }

    pub fn with_filter(mut self, filter: Predicate) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_lods(mut self, lods: LodFilter) -> Self {
        self.lods = lods;
        self
    }

    pub fn with_transform(mut self, matrix: AffineMatrix) -> Self {
        self.transform = Some(matrix);
        self
    }

    pub fn with_xlinks(mut self, xlinks: XLinkOutput) -> Self {
        self.xlinks = xlinks;
        self
    }

    pub fn with_duplicate_ids(mut self, policy: DuplicateIdPolicy) -> Self {
        self.duplicate_ids = policy;
        self
    }

    pub fn with_batch(mut self, batch: BatchSizes) -> Self {
        self.batch = batch;
        self
    }

    /// Top-level types to query, validated against the schema mapping.
    pub fn top_level_types(&self) -> Result<Vec<FeatureType>> {
        if self.feature_types.is_empty() {
            return Ok(self
                .schema
                .feature_types()
                .into_iter()
                .filter(FeatureType::is_top_level)
                .collect());
        }
        let mut out = Vec::with_capacity(self.feature_types.len());
        for ft in &self.feature_types {
            if !ft.is_top_level() {
                return Err(Error::InvalidFilter(format!("{} is not a top-level type", ft)));
            }
            if self.schema.type_mapping(*ft).is_none() {
                return Err(Error::InvalidFilter(format!("{} has no table mapping", ft)));
            }
            if !out.contains(ft) {
                out.push(*ft);
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_tokens_honor_escape() {
        let p = LikePattern::new(r"a*b.c\*d%");
        assert_eq!(
            p.tokens(),
            vec![
                LikeToken::Literal('a'),
                LikeToken::Any,
                LikeToken::Literal('b'),
                LikeToken::One,
                LikeToken::Literal('c'),
                LikeToken::Literal('*'),
                LikeToken::Literal('d'),
                LikeToken::Literal('%'),
            ]
        );
        assert_eq!(p.to_sql(), r"a%b_c*d\%");
    }

    #[test]
    fn compare_ops() {
        use std::cmp::Ordering;
        assert!(CompareOp::Le.holds(Ordering::Equal));
        assert!(!CompareOp::Lt.holds(Ordering::Equal));
        assert!(CompareOp::Ne.holds(Ordering::Greater));
    }

    #[test]
    fn paths_are_collected() {
        let p = Predicate::And(vec![
            Predicate::eq("bldg:function", "1000"),
            Predicate::is_null("name").negate(),
            Predicate::resource_ids(&["#B1"]),
        ]);
        assert_eq!(p.paths(), vec!["bldg:function", "name"]);
    }

    #[test]
    fn default_top_level_types() {
        let q = QueryDescriptor::new(Arc::new(SchemaMapping::citydb()));
        assert_eq!(
            q.top_level_types().unwrap(),
            vec![
                FeatureType::GenericCityObject,
                FeatureType::CityObjectGroup,
                FeatureType::Building
            ]
        );
        let bad = q.clone().with_types(&[FeatureType::RoofSurface]);
        assert!(matches!(bad.top_level_types(), Err(Error::InvalidFilter(_))));
    }
}
