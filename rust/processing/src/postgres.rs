// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PostgreSQL/PostGIS storage
//!
//! Reads run the statements built by [`Translator`]; writes bind one array
//! per column and insert with `UNNEST`, all inside a single transaction.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use citydb_lite_core::{wkt, ColumnKind, Envelope, SchemaMapping, Value};
use citydb_lite_geometry::{GeometryFlags, GeometryRow, XLinkKind};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use rustc_hash::FxHashMap;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use tracing::{debug, info};

use crate::error::Result;
use crate::sql::{self, SqlValue, Translator};
use crate::storage::{
    FeatureFilter, FeatureInsert, FeatureQuery, FeatureRow, MemberRow, Sequence, Storage,
    TopLevelRow, WriteBatch,
};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

fn bind_all(mut query: PgQuery<'_>, binds: Vec<SqlValue>) -> PgQuery<'_> {
    for value in binds {
        query = match value {
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Integer(v) => query.bind(v),
            SqlValue::Double(v) => query.bind(v),
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::TextArray(v) => query.bind(v),
            SqlValue::IntArray(v) => query.bind(v),
            SqlValue::BigIntArray(v) => query.bind(v),
        };
    }
    query
}

/// Reads six envelope columns starting at `first`; `None` when any is null.
fn envelope(row: &PgRow, first: usize) -> Result<Option<Envelope>> {
    let mut c = [0.0f64; 6];
    for (i, slot) in c.iter_mut().enumerate() {
        match row.try_get::<Option<f64>, _>(first + i)? {
            Some(v) => *slot = v,
            None => return Ok(None),
        }
    }
    Ok(Some(Envelope::new([c[0], c[1], c[2]], [c[3], c[4], c[5]])))
}

fn value(row: &PgRow, index: usize, kind: ColumnKind) -> Result<Option<Value>> {
    Ok(match kind {
        ColumnKind::Text => row.try_get::<Option<String>, _>(index)?.map(Value::Text),
        ColumnKind::Integer => row.try_get::<Option<i64>, _>(index)?.map(Value::Integer),
        ColumnKind::Double => row.try_get::<Option<f64>, _>(index)?.map(Value::Double),
        ColumnKind::Bool => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
    })
}

fn geometry_row(row: &PgRow) -> Result<GeometryRow> {
    let payload = match row.try_get::<Option<String>, _>(9)? {
        Some(text) => Some(wkt::parse_polygon(&text)?),
        None => None,
    };
    Ok(GeometryRow {
        id: row.try_get(0)?,
        parent_id: row.try_get(1)?,
        root_id: row.try_get(2)?,
        flags: GeometryFlags {
            is_solid: row.try_get(3)?,
            is_composite: row.try_get(4)?,
            is_triangulated: row.try_get(5)?,
        },
        xlink: XLinkKind::from_code(row.try_get(6)?),
        is_reversed: row.try_get(7)?,
        gml_id: row.try_get(8)?,
        payload,
        feature_id: row.try_get::<Option<i64>, _>(10)?.unwrap_or_default(),
    })
}

/// One typed array per type-table column
enum ColumnArray {
    Text(Vec<Option<String>>),
    Integer(Vec<Option<i64>>),
    Double(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
}

impl ColumnArray {
    fn new(kind: ColumnKind, len: usize) -> Self {
        match kind {
            ColumnKind::Text => ColumnArray::Text(vec![None; len]),
            ColumnKind::Integer => ColumnArray::Integer(vec![None; len]),
            ColumnKind::Double => ColumnArray::Double(vec![None; len]),
            ColumnKind::Bool => ColumnArray::Bool(vec![None; len]),
        }
    }

    fn set(&mut self, index: usize, value: &Value) {
        match (self, value) {
            (ColumnArray::Text(a), v) => a[index] = Some(v.to_string()),
            (ColumnArray::Integer(a), Value::Integer(v)) => a[index] = Some(*v),
            (ColumnArray::Double(a), Value::Double(v)) => a[index] = Some(*v),
            (ColumnArray::Double(a), Value::Integer(v)) => a[index] = Some(*v as f64),
            (ColumnArray::Bool(a), Value::Bool(v)) => a[index] = Some(*v),
            _ => {}
        }
    }

    fn bind(self, query: PgQuery<'_>) -> PgQuery<'_> {
        match self {
            ColumnArray::Text(a) => query.bind(a),
            ColumnArray::Integer(a) => query.bind(a),
            ColumnArray::Double(a) => query.bind(a),
            ColumnArray::Bool(a) => query.bind(a),
        }
    }
}

/// Storage backed by a PostGIS database laid out per a [`SchemaMapping`]
pub struct PgStore {
    pool: PgPool,
    schema: Arc<SchemaMapping>,
}

impl PgStore {
    pub fn new(pool: PgPool, schema: Arc<SchemaMapping>) -> Self {
        Self { pool, schema }
    }

    /// Connects with up to `max_connections` pooled connections.
    pub async fn connect(url: &str, max_connections: u32, schema: Arc<SchemaMapping>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!(max_connections, "Connected to database");
        Ok(Self::new(pool, schema))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the sequences and tables the mapping refers to, when absent.
    pub async fn create_schema(&self) -> Result<()> {
        let statements = sql::create_schema(&self.schema);
        let mut tx = self.pool.begin().await?;
        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(statements = statements.len(), "Schema created");
        Ok(())
    }

    /// Column layout of a type table across every type stored in it
    fn table_columns(&self, table: &str) -> Vec<(String, ColumnKind)> {
        let mut columns: Vec<(String, ColumnKind)> = Vec::new();
        for ft in self.schema.feature_types() {
            let Some(mapping) = self.schema.type_mapping(ft).filter(|m| m.table == table) else {
                continue;
            };
            let attributes = mapping.attributes.iter().map(|a| (a.column.clone(), a.kind));
            let geometry = mapping.geometry.iter().map(|g| (g.column.clone(), ColumnKind::Integer));
            for (name, kind) in attributes.chain(geometry) {
                if !columns.iter().any(|(c, _)| *c == name) {
                    columns.push((name, kind));
                }
            }
        }
        columns
    }

    async fn insert_base_rows(&self, conn: &mut sqlx::PgConnection, features: &[FeatureInsert]) -> Result<()> {
        let n = features.len();
        let mut ids = Vec::with_capacity(n);
        let mut codes = Vec::with_capacity(n);
        let mut parents = Vec::with_capacity(n);
        let mut gml_ids = Vec::with_capacity(n);
        let mut names = Vec::with_capacity(n);
        let mut descriptions = Vec::with_capacity(n);
        let mut bounds: [Vec<Option<f64>>; 6] = Default::default();
        for f in features {
            ids.push(f.id);
            codes.push(f.type_code);
            parents.push(f.parent_id);
            gml_ids.push(f.gml_id.clone());
            names.push(f.name.clone());
            descriptions.push(f.description.clone());
            for (i, b) in bounds.iter_mut().enumerate() {
                b.push(f.envelope.map(|e| if i < 3 { e.min[i] } else { e.max[i - 3] }));
            }
        }
        let statement = sql::insert_base_rows(&self.schema);
        let mut query = sqlx::query(&statement)
            .bind(ids)
            .bind(codes)
            .bind(parents)
            .bind(gml_ids)
            .bind(names)
            .bind(descriptions);
        for b in bounds {
            query = query.bind(b);
        }
        query.execute(conn).await?;
        Ok(())
    }

    async fn insert_geometry_rows(&self, conn: &mut sqlx::PgConnection, rows: &[GeometryRow]) -> Result<()> {
        let n = rows.len();
        let mut ids = Vec::with_capacity(n);
        let mut parents = Vec::with_capacity(n);
        let mut roots = Vec::with_capacity(n);
        let mut solid = Vec::with_capacity(n);
        let mut composite = Vec::with_capacity(n);
        let mut triangulated = Vec::with_capacity(n);
        let mut xlink = Vec::with_capacity(n);
        let mut reversed = Vec::with_capacity(n);
        let mut gml_ids = Vec::with_capacity(n);
        let mut wkts = Vec::with_capacity(n);
        let mut features = Vec::with_capacity(n);
        for r in rows {
            ids.push(r.id);
            parents.push(r.parent_id);
            roots.push(r.root_id);
            solid.push(r.flags.is_solid);
            composite.push(r.flags.is_composite);
            triangulated.push(r.flags.is_triangulated);
            xlink.push(r.xlink.code());
            reversed.push(r.is_reversed);
            gml_ids.push(r.gml_id.clone());
            wkts.push(r.payload.as_ref().map(wkt::format_polygon));
            features.push((r.feature_id != 0).then_some(r.feature_id));
        }
        let statement = sql::insert_geometry_rows(&self.schema);
        sqlx::query(&statement)
            .bind(ids)
            .bind(parents)
            .bind(roots)
            .bind(solid)
            .bind(composite)
            .bind(triangulated)
            .bind(xlink)
            .bind(reversed)
            .bind(gml_ids)
            .bind(wkts)
            .bind(features)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn insert_type_rows(&self, conn: &mut sqlx::PgConnection, features: &[FeatureInsert]) -> Result<()> {
        let mut by_table: FxHashMap<&str, Vec<&FeatureInsert>> = FxHashMap::default();
        for f in features {
            by_table.entry(f.table.as_str()).or_default().push(f);
        }
        let mut tables: Vec<&str> = by_table.keys().copied().collect();
        tables.sort_unstable();

        for table in tables {
            let rows = &by_table[table];
            let columns = self.table_columns(table);
            let mut arrays: Vec<ColumnArray> = columns
                .iter()
                .map(|(_, kind)| ColumnArray::new(*kind, rows.len()))
                .collect();
            let index: FxHashMap<&str, usize> = columns
                .iter()
                .enumerate()
                .map(|(i, (name, _))| (name.as_str(), i))
                .collect();
            for (row, f) in rows.iter().enumerate() {
                for (column, v) in &f.values {
                    if let Some(&i) = index.get(column.as_str()) {
                        arrays[i].set(row, v);
                    }
                }
                for (column, root) in &f.geometry {
                    if let Some(&i) = index.get(column.as_str()) {
                        arrays[i].set(row, &Value::Integer(*root));
                    }
                }
            }

            let layout: Vec<(&str, ColumnKind)> =
                columns.iter().map(|(name, kind)| (name.as_str(), *kind)).collect();
            let statement = sql::insert_type_rows(table, &layout);
            let ids: Vec<i64> = rows.iter().map(|f| f.id).collect();
            let mut query = sqlx::query(&statement).bind(ids);
            for array in arrays {
                query = array.bind(query);
            }
            query.execute(&mut *conn).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStore {
    fn top_level<'a>(&'a self, filter: &'a FeatureFilter) -> BoxStream<'a, Result<TopLevelRow>> {
        Box::pin(try_stream! {
            let statement = Translator::new(&self.schema).top_level(filter)?;
            debug!(sql = %statement.sql, "Top-level query");
            let mut rows = bind_all(sqlx::query(&statement.sql), statement.binds).fetch(&self.pool);
            while let Some(row) = rows.try_next().await? {
                yield TopLevelRow {
                    id: row.try_get(0)?,
                    type_code: row.try_get(1)?,
                    envelope: envelope(&row, 2)?,
                };
            }
        })
    }

    async fn feature_rows(&self, query: &FeatureQuery, keys: &[i64]) -> Result<Vec<FeatureRow>> {
        let statement = Translator::new(&self.schema).feature_rows(query, keys);
        let rows = bind_all(sqlx::query(&statement.sql), statement.binds)
            .fetch_all(&self.pool)
            .await?;
        let geometry_start = 12 + query.columns.len();
        rows.iter()
            .map(|row| {
                let mut values = FxHashMap::default();
                for (i, column) in query.columns.iter().enumerate() {
                    if let Some(v) = value(row, 12 + i, column.kind)? {
                        values.insert(column.column.clone(), v);
                    }
                }
                let mut geometry = FxHashMap::default();
                for (i, column) in query.geometry_columns.iter().enumerate() {
                    if let Some(root) = row.try_get::<Option<i64>, _>(geometry_start + i)? {
                        geometry.insert(column.clone(), root);
                    }
                }
                Ok(FeatureRow {
                    id: row.try_get(0)?,
                    type_code: row.try_get(1)?,
                    parent_id: row.try_get(2)?,
                    gml_id: row.try_get(3)?,
                    name: row.try_get(4)?,
                    description: row.try_get(5)?,
                    envelope: envelope(row, 6)?,
                    values,
                    geometry,
                })
            })
            .collect()
    }

    async fn geometry_rows(&self, roots: &[i64]) -> Result<Vec<GeometryRow>> {
        let statement = Translator::new(&self.schema).geometry_rows(roots);
        let rows = bind_all(sqlx::query(&statement.sql), statement.binds)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(geometry_row).collect()
    }

    async fn group_members(&self, groups: &[i64]) -> Result<Vec<MemberRow>> {
        let statement = Translator::new(&self.schema).group_members(groups);
        let rows = bind_all(sqlx::query(&statement.sql), statement.binds)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(MemberRow {
                    group_id: row.try_get(0)?,
                    member_id: row.try_get(1)?,
                    type_code: row.try_get(2)?,
                    gml_id: row.try_get(3)?,
                    role: row.try_get(4)?,
                })
            })
            .collect()
    }

    // One-element key lists translate to `= $1` point statements.
    async fn feature_rows_of(&self, query: &FeatureQuery, key: i64) -> Result<Vec<FeatureRow>> {
        self.feature_rows(query, &[key]).await
    }

    async fn geometry_tree(&self, root: i64) -> Result<Vec<GeometryRow>> {
        self.geometry_rows(&[root]).await
    }

    async fn members_of(&self, group: i64) -> Result<Vec<MemberRow>> {
        self.group_members(&[group]).await
    }

    async fn reserve_ids(&self, sequence: Sequence, count: usize) -> Result<Vec<i64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let statement = Translator::new(&self.schema).reserve_ids(sequence, count);
        let rows = bind_all(sqlx::query(&statement.sql), statement.binds)
            .fetch_all(&self.pool)
            .await?;
        let mut ids = rows
            .iter()
            .map(|row| row.try_get::<i64, _>(0))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        if !batch.features.is_empty() {
            self.insert_base_rows(&mut *tx, &batch.features).await?;
        }
        if !batch.geometry.is_empty() {
            self.insert_geometry_rows(&mut *tx, &batch.geometry).await?;
        }
        if !batch.features.is_empty() {
            self.insert_type_rows(&mut *tx, &batch.features).await?;
        }

        if !batch.members.is_empty() {
            let groups: Vec<i64> = batch.members.iter().map(|m| m.group_id).collect();
            let members: Vec<i64> = batch.members.iter().map(|m| m.member_id).collect();
            let roles: Vec<Option<String>> = batch.members.iter().map(|m| m.role.clone()).collect();
            sqlx::query(&sql::insert_members(&self.schema))
                .bind(groups)
                .bind(members)
                .bind(roles)
                .execute(&mut *tx)
                .await?;
        }

        let mut assignments: FxHashMap<(&str, &str), (Vec<i64>, Vec<i64>)> = FxHashMap::default();
        for a in &batch.assignments {
            let entry = assignments.entry((a.table.as_str(), a.column.as_str())).or_default();
            entry.0.push(a.feature_id);
            entry.1.push(a.root_id);
        }
        for ((table, column), (ids, roots)) in assignments {
            sqlx::query(&sql::assign_geometry(table, column))
                .bind(ids)
                .bind(roots)
                .execute(&mut *tx)
                .await?;
        }

        if !batch.xlink_marks.is_empty() {
            let ids: Vec<i64> = batch.xlink_marks.iter().map(|m| m.geometry_id).collect();
            let kinds: Vec<i32> = batch.xlink_marks.iter().map(|m| m.kind.code()).collect();
            sqlx::query(&sql::mark_xlinks(&self.schema))
                .bind(ids)
                .bind(kinds)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(
            features = batch.features.len(),
            geometry = batch.geometry.len(),
            members = batch.members.len(),
            assignments = batch.assignments.len(),
            xlinks = batch.xlink_marks.len(),
            "Write batch committed"
        );
        Ok(())
    }
}
