// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory storage
//!
//! A complete [`Storage`] over ordered maps. Filters are evaluated on the
//! same resolved paths the SQL translator uses, and every operation counts its
//! round-trips so batching behavior can be observed.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use citydb_lite_core::{
    ColumnKind, Envelope, FeatureType, LikePattern, LikeToken, Predicate, SchemaMapping, Value,
};
use citydb_lite_geometry::GeometryRow;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::path::{self, Hop, PathTarget};
use crate::storage::{
    FeatureFilter, FeatureQuery, FeatureRow, KeyColumn, MemberRow, Sequence, Storage,
    TopLevelRow, WriteBatch,
};

#[derive(Debug, Clone, PartialEq)]
struct StoredFeature {
    id: i64,
    type_code: i32,
    parent_id: Option<i64>,
    gml_id: String,
    name: Option<String>,
    description: Option<String>,
    envelope: Option<Envelope>,
    table: String,
    values: BTreeMap<String, Value>,
    geometry: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
struct State {
    features: BTreeMap<i64, StoredFeature>,
    children: FxHashMap<i64, Vec<i64>>,
    geometry: BTreeMap<i64, GeometryRow>,
    members: BTreeMap<(i64, i64), Option<String>>,
}

/// Round-trips issued per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundTrips {
    pub top_level: usize,
    pub features: usize,
    pub geometry: usize,
    pub members: usize,
    /// Single-key reads issued when batching is off
    pub point: usize,
    pub reserve: usize,
    pub write: usize,
}

impl RoundTrips {
    pub fn reads(&self) -> usize {
        self.features + self.geometry + self.members + self.point
    }
}

#[derive(Debug, Default)]
struct Counters {
    top_level: AtomicUsize,
    features: AtomicUsize,
    geometry: AtomicUsize,
    members: AtomicUsize,
    point: AtomicUsize,
    reserve: AtomicUsize,
    write: AtomicUsize,
}

/// Storage held entirely in memory
#[derive(Debug)]
pub struct MemoryStore {
    schema: SchemaMapping,
    state: RwLock<State>,
    feature_seq: AtomicI64,
    geometry_seq: AtomicI64,
    counters: Counters,
}

impl MemoryStore {
    pub fn new(schema: SchemaMapping) -> Self {
        Self {
            schema,
            state: RwLock::new(State::default()),
            feature_seq: AtomicI64::new(1),
            geometry_seq: AtomicI64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn round_trips(&self) -> RoundTrips {
        let c = &self.counters;
        RoundTrips {
            top_level: c.top_level.load(Ordering::Relaxed),
            features: c.features.load(Ordering::Relaxed),
            geometry: c.geometry.load(Ordering::Relaxed),
            members: c.members.load(Ordering::Relaxed),
            point: c.point.load(Ordering::Relaxed),
            reserve: c.reserve.load(Ordering::Relaxed),
            write: c.write.load(Ordering::Relaxed),
        }
    }

    pub fn reset_round_trips(&self) {
        let c = &self.counters;
        for counter in [
            &c.top_level,
            &c.features,
            &c.geometry,
            &c.members,
            &c.point,
            &c.reserve,
            &c.write,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn feature_count(&self) -> usize {
        self.state.read().features.len()
    }

    pub fn geometry_count(&self) -> usize {
        self.state.read().geometry.len()
    }

    pub fn member_count(&self) -> usize {
        self.state.read().members.len()
    }

    /// Internal id of the feature stored under `gml_id`
    pub fn feature_id(&self, gml_id: &str) -> Option<i64> {
        self.state
            .read()
            .features
            .values()
            .find(|f| f.gml_id == gml_id)
            .map(|f| f.id)
    }

    pub fn geometry_row(&self, id: i64) -> Option<GeometryRow> {
        self.state.read().geometry.get(&id).cloned()
    }

    /// Every geometry row, ordered by id
    pub fn geometry_rows_all(&self) -> Vec<GeometryRow> {
        self.state.read().geometry.values().cloned().collect()
    }

    fn read_features(&self, query: &FeatureQuery, keys: &[i64]) -> Vec<FeatureRow> {
        let code = query.feature_type.code();
        let state = self.state.read();
        let candidates: Vec<&StoredFeature> = match query.key {
            KeyColumn::Id => keys.iter().filter_map(|k| state.features.get(k)).collect(),
            KeyColumn::Parent => keys
                .iter()
                .flat_map(|k| state.children.get(k).into_iter().flatten())
                .filter_map(|id| state.features.get(id))
                .collect(),
        };
        let mut rows: Vec<FeatureRow> = candidates
            .into_iter()
            .filter(|f| f.type_code == code && f.table == query.table)
            .map(|f| FeatureRow {
                id: f.id,
                type_code: f.type_code,
                parent_id: f.parent_id,
                gml_id: Some(f.gml_id.clone()),
                name: f.name.clone(),
                description: f.description.clone(),
                envelope: f.envelope,
                values: query
                    .columns
                    .iter()
                    .filter_map(|c| Some((c.column.clone(), f.values.get(&c.column)?.clone())))
                    .collect(),
                geometry: query
                    .geometry_columns
                    .iter()
                    .filter_map(|c| Some((c.clone(), *f.geometry.get(c)?)))
                    .collect(),
            })
            .collect();
        rows.sort_by_key(|r| r.id);
        rows.dedup_by_key(|r| r.id);
        rows
    }

    fn read_geometry(&self, roots: &[i64]) -> Vec<GeometryRow> {
        let state = self.state.read();
        state
            .geometry
            .values()
            .filter(|r| roots.contains(&r.root_id))
            .cloned()
            .collect()
    }

    fn read_members(&self, groups: &[i64]) -> Vec<MemberRow> {
        let state = self.state.read();
        state
            .members
            .iter()
            .filter(|((group, _), _)| groups.contains(group))
            .map(|((group_id, member_id), role)| {
                let member = state.features.get(member_id);
                MemberRow {
                    group_id: *group_id,
                    member_id: *member_id,
                    type_code: member.map(|m| m.type_code),
                    gml_id: member.map(|m| m.gml_id.clone()),
                    role: role.clone(),
                }
            })
            .collect()
    }

    fn matching(&self, filter: &FeatureFilter) -> Result<Vec<TopLevelRow>> {
        let codes = filter.type_codes();
        let state = self.state.read();
        let mut eval = Evaluator {
            schema: &self.schema,
            state: &state,
            patterns: FxHashMap::default(),
        };
        let mut out = Vec::new();
        for f in state.features.values() {
            if f.parent_id.is_some() || !codes.contains(&f.type_code) {
                continue;
            }
            let matched = match &filter.predicate {
                Some(p) => eval.predicate(p, f, &filter.types)?,
                None => true,
            };
            if matched {
                out.push(TopLevelRow {
                    id: f.id,
                    type_code: f.type_code,
                    envelope: f.envelope,
                });
            }
        }
        Ok(out)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(SchemaMapping::citydb())
    }
}

#[async_trait]
impl Storage for MemoryStore {
    fn top_level<'a>(&'a self, filter: &'a FeatureFilter) -> BoxStream<'a, Result<TopLevelRow>> {
        self.counters.top_level.fetch_add(1, Ordering::Relaxed);
        match self.matching(filter) {
            Ok(rows) => stream::iter(rows.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn feature_rows(&self, query: &FeatureQuery, keys: &[i64]) -> Result<Vec<FeatureRow>> {
        self.counters.features.fetch_add(1, Ordering::Relaxed);
        Ok(self.read_features(query, keys))
    }

    async fn geometry_rows(&self, roots: &[i64]) -> Result<Vec<GeometryRow>> {
        self.counters.geometry.fetch_add(1, Ordering::Relaxed);
        Ok(self.read_geometry(roots))
    }

    async fn group_members(&self, groups: &[i64]) -> Result<Vec<MemberRow>> {
        self.counters.members.fetch_add(1, Ordering::Relaxed);
        Ok(self.read_members(groups))
    }

    async fn feature_rows_of(&self, query: &FeatureQuery, key: i64) -> Result<Vec<FeatureRow>> {
        self.counters.point.fetch_add(1, Ordering::Relaxed);
        Ok(self.read_features(query, &[key]))
    }

    async fn geometry_tree(&self, root: i64) -> Result<Vec<GeometryRow>> {
        self.counters.point.fetch_add(1, Ordering::Relaxed);
        Ok(self.read_geometry(&[root]))
    }

    async fn members_of(&self, group: i64) -> Result<Vec<MemberRow>> {
        self.counters.point.fetch_add(1, Ordering::Relaxed);
        Ok(self.read_members(&[group]))
    }

    async fn reserve_ids(&self, sequence: Sequence, count: usize) -> Result<Vec<i64>> {
        self.counters.reserve.fetch_add(1, Ordering::Relaxed);
        let seq = match sequence {
            Sequence::Feature => &self.feature_seq,
            Sequence::Geometry => &self.geometry_seq,
        };
        let start = seq.fetch_add(count as i64, Ordering::SeqCst);
        Ok((start..start + count as i64).collect())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        self.counters.write.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write();
        for f in batch.features {
            if let Some(parent) = f.parent_id {
                state.children.entry(parent).or_default().push(f.id);
            }
            state.features.insert(
                f.id,
                StoredFeature {
                    id: f.id,
                    type_code: f.type_code,
                    parent_id: f.parent_id,
                    gml_id: f.gml_id,
                    name: f.name,
                    description: f.description,
                    envelope: f.envelope,
                    table: f.table,
                    values: f.values.into_iter().collect(),
                    geometry: f.geometry.into_iter().collect(),
                },
            );
        }
        for row in batch.geometry {
            state.geometry.insert(row.id, row);
        }
        for m in batch.members {
            state.members.insert((m.group_id, m.member_id), m.role);
        }
        for a in batch.assignments {
            let feature = state
                .features
                .get_mut(&a.feature_id)
                .filter(|f| f.table == a.table)
                .ok_or_else(|| {
                    Error::Storage(format!("no {} row with id {}", a.table, a.feature_id))
                })?;
            feature.geometry.insert(a.column, a.root_id);
        }
        for mark in batch.xlink_marks {
            let row = state.geometry.get_mut(&mark.geometry_id).ok_or_else(|| {
                Error::Storage(format!("no geometry row with id {}", mark.geometry_id))
            })?;
            row.xlink = mark.kind;
        }
        Ok(())
    }
}

/// Filter evaluation over the stored rows
struct Evaluator<'a> {
    schema: &'a SchemaMapping,
    state: &'a State,
    patterns: FxHashMap<String, Regex>,
}

/// Leaf condition on a single value
enum Leaf<'p> {
    Compare(citydb_lite_core::CompareOp, &'p Value),
    Like(&'p LikePattern),
    Between(&'p Value, &'p Value),
    In(&'p [Value]),
    IsNull,
}

impl<'a> Evaluator<'a> {
    fn predicate(&mut self, p: &Predicate, f: &StoredFeature, scope: &[FeatureType]) -> Result<bool> {
        Ok(match p {
            Predicate::Compare { path, op, value } => {
                self.path(path, f, scope, &Leaf::Compare(*op, value))?
            }
            Predicate::Like { path, pattern } => self.path(path, f, scope, &Leaf::Like(pattern))?,
            Predicate::Between { path, low, high } => {
                self.path(path, f, scope, &Leaf::Between(low, high))?
            }
            Predicate::In { path, values } => self.path(path, f, scope, &Leaf::In(values))?,
            Predicate::IsNull { path } => self.path(path, f, scope, &Leaf::IsNull)?,
            Predicate::ResourceId(ids) => ids.iter().any(|id| *id == f.gml_id),
            Predicate::BBox(envelope) => f
                .envelope
                .map(|e| e.intersects_2d(envelope))
                .unwrap_or(false),
            Predicate::And(list) => {
                for p in list {
                    if !self.predicate(p, f, scope)? {
                        return Ok(false);
                    }
                }
                true
            }
            Predicate::Or(list) => {
                for p in list {
                    if self.predicate(p, f, scope)? {
                        return Ok(true);
                    }
                }
                false
            }
            Predicate::Not(inner) => !self.predicate(inner, f, scope)?,
        })
    }

    fn path(&mut self, path: &str, f: &StoredFeature, scope: &[FeatureType], leaf: &Leaf<'_>) -> Result<bool> {
        let resolved = path::resolve(self.schema, scope, path)?;
        self.hops(&resolved.hops, &resolved.target, f, leaf)
    }

    fn hops(&mut self, hops: &[Hop], target: &PathTarget, f: &StoredFeature, leaf: &Leaf<'_>) -> Result<bool> {
        let Some((hop, rest)) = hops.split_first() else {
            return self.target(target, f, leaf);
        };
        let codes = hop.type_codes();
        let state = self.state;
        let related: Vec<&StoredFeature> = match hop.kind {
            citydb_lite_core::RelationKind::Nested => state
                .children
                .get(&f.id)
                .into_iter()
                .flatten()
                .filter_map(|id| state.features.get(id))
                .collect(),
            citydb_lite_core::RelationKind::Membership => state
                .members
                .range((f.id, i64::MIN)..=(f.id, i64::MAX))
                .filter_map(|((_, member), _)| state.features.get(member))
                .collect(),
        };
        for r in related {
            if codes.contains(&r.type_code) && self.hops(rest, target, r, leaf)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn target(&mut self, target: &PathTarget, f: &StoredFeature, leaf: &Leaf<'_>) -> Result<bool> {
        match target {
            PathTarget::Base(column) => {
                let value = match column {
                    path::BaseColumn::GmlId => Some(Value::Text(f.gml_id.clone())),
                    path::BaseColumn::Name => f.name.clone().map(Value::Text),
                    path::BaseColumn::Description => f.description.clone().map(Value::Text),
                };
                self.leaf(value.as_ref(), ColumnKind::Text, leaf)
            }
            PathTarget::Attribute(_) => {
                for t in target.distinct_columns() {
                    if t.table != f.table {
                        continue;
                    }
                    if self.leaf(f.values.get(&t.column), t.kind, leaf)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn leaf(&mut self, value: Option<&Value>, kind: ColumnKind, leaf: &Leaf<'_>) -> Result<bool> {
        Ok(match leaf {
            Leaf::IsNull => value.is_none(),
            Leaf::Compare(op, literal) => match (value, kind.coerce(literal)) {
                (Some(v), Some(lit)) => compare(v, &lit).map(|o| op.holds(o)).unwrap_or(false),
                _ => false,
            },
            Leaf::Between(low, high) => match (value, kind.coerce(low), kind.coerce(high)) {
                (Some(v), Some(lo), Some(hi)) => {
                    matches!(compare(v, &lo), Some(CmpOrdering::Greater | CmpOrdering::Equal))
                        && matches!(compare(v, &hi), Some(CmpOrdering::Less | CmpOrdering::Equal))
                }
                _ => false,
            },
            Leaf::In(values) => match value {
                Some(v) => values
                    .iter()
                    .filter_map(|lit| kind.coerce(lit))
                    .any(|lit| compare(v, &lit) == Some(CmpOrdering::Equal)),
                None => false,
            },
            Leaf::Like(pattern) => match value {
                Some(v) => self.regex(pattern)?.is_match(&v.to_string()),
                None => false,
            },
        })
    }

    fn regex(&mut self, pattern: &LikePattern) -> Result<&Regex> {
        let key = format!("{}\u{0}{}", pattern.match_case, pattern.pattern);
        if !self.patterns.contains_key(&key) {
            let mut source = String::from(if pattern.match_case { "(?s)^" } else { "(?si)^" });
            for token in pattern.tokens() {
                match token {
                    LikeToken::Literal(c) => source.push_str(&regex::escape(&c.to_string())),
                    LikeToken::Any => source.push_str(".*"),
                    LikeToken::One => source.push('.'),
                }
            }
            source.push('$');
            let re = Regex::new(&source)
                .map_err(|e| Error::Storage(format!("invalid LIKE pattern: {}", e)))?;
            self.patterns.insert(key.clone(), re);
        }
        self.patterns
            .get(&key)
            .ok_or_else(|| Error::Storage("LIKE pattern cache".into()))
    }
}

fn compare(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FeatureInsert, MemberInsert};
    use citydb_lite_core::{CompareOp, QueryDescriptor};
    use futures::TryStreamExt;
    use std::sync::Arc;

    fn insert(id: i64, ft: FeatureType, parent: Option<i64>, gml: &str) -> FeatureInsert {
        let table = SchemaMapping::citydb()
            .type_mapping(ft)
            .map(|m| m.table.clone())
            .unwrap_or_default();
        FeatureInsert {
            id,
            type_code: ft.code(),
            parent_id: parent,
            gml_id: gml.into(),
            name: None,
            description: None,
            envelope: None,
            table,
            values: vec![],
            geometry: vec![],
        }
    }

    async fn store() -> MemoryStore {
        let store = MemoryStore::default();
        let mut b1 = insert(1, FeatureType::Building, None, "B1");
        b1.values = vec![
            ("measured_height".into(), Value::Double(12.5)),
            ("function".into(), Value::Text("residential".into())),
        ];
        b1.envelope = Some(Envelope::new([0.0, 0.0, 0.0], [10.0, 10.0, 12.5]));
        let mut roof = insert(2, FeatureType::RoofSurface, Some(1), "R1");
        roof.name = Some("Main Roof".into());
        let mut b2 = insert(3, FeatureType::Building, None, "B2");
        b2.values = vec![("measured_height".into(), Value::Double(4.0))];
        b2.envelope = Some(Envelope::new([100.0, 100.0, 0.0], [110.0, 110.0, 4.0]));
        let group = insert(4, FeatureType::CityObjectGroup, None, "G1");
        store
            .write(WriteBatch {
                features: vec![b1, roof, b2, group],
                members: vec![MemberInsert {
                    group_id: 4,
                    member_id: 3,
                    role: None,
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        store
    }

    async fn ids(store: &MemoryStore, types: &[FeatureType], predicate: Predicate) -> Vec<i64> {
        let descriptor = QueryDescriptor::new(Arc::new(SchemaMapping::citydb()))
            .with_types(types)
            .with_filter(predicate);
        let filter = FeatureFilter::from_descriptor(&descriptor).unwrap();
        let rows: Vec<TopLevelRow> = store.top_level(&filter).try_collect().await.unwrap();
        rows.into_iter().map(|r| r.id).collect()
    }

    #[tokio::test]
    async fn evaluates_predicates() {
        let s = store().await;
        let b = [FeatureType::Building];
        assert_eq!(ids(&s, &b, Predicate::compare("measuredHeight", CompareOp::Ge, 10i64)).await, vec![1]);
        assert_eq!(ids(&s, &b, Predicate::between("measuredHeight", 1.0, "5")).await, vec![3]);
        assert_eq!(ids(&s, &b, Predicate::is_null("function")).await, vec![3]);
        assert_eq!(ids(&s, &b, Predicate::resource_ids(&["#B2"])).await, vec![3]);
        assert_eq!(
            ids(&s, &b, Predicate::BBox(Envelope::new([5.0, 5.0, 0.0], [6.0, 6.0, 0.0]))).await,
            vec![1]
        );
        assert_eq!(
            ids(&s, &b, Predicate::like("boundedBy/RoofSurface/name", LikePattern::new("main*").case_insensitive())).await,
            vec![1]
        );
        assert!(ids(&s, &b, Predicate::like("boundedBy/name", LikePattern::new("main*"))).await.is_empty());
        assert_eq!(
            ids(&s, &b, Predicate::Or(vec![Predicate::eq("gml:id", "B1"), Predicate::eq("id", "B2")]).negate()).await,
            Vec::<i64>::new()
        );
        assert_eq!(
            ids(&s, &[FeatureType::CityObjectGroup], Predicate::eq("groupMember/Building/id", "B2")).await,
            vec![4]
        );
        assert_eq!(s.round_trips().top_level, 9);
    }

    #[tokio::test]
    async fn keyed_reads_and_sequences() {
        let s = store().await;
        let schema = SchemaMapping::citydb();
        let mapping = schema.type_mapping(FeatureType::RoofSurface).unwrap();
        let query = FeatureQuery {
            feature_type: FeatureType::RoofSurface,
            table: mapping.table.clone(),
            columns: vec![],
            geometry_columns: vec![],
            key: KeyColumn::Parent,
        };
        let rows = s.feature_rows(&query, &[1, 3]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].parent_id, Some(1));

        let members = s.group_members(&[4]).await.unwrap();
        assert_eq!(members[0].gml_id.as_deref(), Some("B2"));

        let a = s.reserve_ids(Sequence::Geometry, 3).await.unwrap();
        let b = s.reserve_ids(Sequence::Geometry, 2).await.unwrap();
        assert_eq!(a, vec![1, 2, 3]);
        assert_eq!(b, vec![4, 5]);
        assert_eq!(s.round_trips().reserve, 2);
    }
}
