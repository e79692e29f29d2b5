// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Predicate and path translation to PostgreSQL/PostGIS statements
//!
//! Statements carry `$n` placeholders and an ordered bind list. Relation hops
//! become correlated `EXISTS` subqueries over child rows; a property mapped by
//! several tables becomes an `OR` of per-table conditions.

use citydb_lite_core::{
    ColumnKind, CompareOp, Envelope, LikePattern, Predicate, RelationKind, SchemaMapping, Value,
};

use crate::error::Result;
use crate::path::{self, Hop, PathTarget};
use crate::storage::{FeatureFilter, FeatureQuery, KeyColumn, Sequence};

/// Bound parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Double(f64),
    Bool(bool),
    TextArray(Vec<String>),
    IntArray(Vec<i32>),
    BigIntArray(Vec<i64>),
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Text(s) => SqlValue::Text(s),
            Value::Integer(i) => SqlValue::Integer(i),
            Value::Double(d) => SqlValue::Double(d),
            Value::Bool(b) => SqlValue::Bool(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub binds: Vec<SqlValue>,
}

const ENVELOPE_COLUMNS: &str = "ST_XMin(co.envelope), ST_YMin(co.envelope), ST_ZMin(co.envelope), \
     ST_XMax(co.envelope), ST_YMax(co.envelope), ST_ZMax(co.envelope)";

/// Leaf condition applied to one column
enum Leaf<'a> {
    Compare(CompareOp, &'a Value),
    Like(&'a LikePattern),
    Between(&'a Value, &'a Value),
    In(&'a [Value]),
    IsNull,
}

/// Builds statements against one schema mapping
pub struct Translator<'s> {
    schema: &'s SchemaMapping,
    binds: Vec<SqlValue>,
    aliases: usize,
}

impl<'s> Translator<'s> {
    pub fn new(schema: &'s SchemaMapping) -> Self {
        Self {
            schema,
            binds: Vec::new(),
            aliases: 0,
        }
    }

    fn bind(&mut self, value: SqlValue) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }

    fn alias(&mut self, prefix: &str) -> String {
        self.aliases += 1;
        format!("{}{}", prefix, self.aliases)
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            binds: self.binds,
        }
    }

    /// Matching top-level ids with their envelope, in id order.
    pub fn top_level(mut self, filter: &FeatureFilter) -> Result<Statement> {
        let codes = self.bind(SqlValue::IntArray(filter.type_codes()));
        let mut sql = format!(
            "SELECT co.id, co.objectclass_id, {} FROM {} co \
             WHERE co.parent_id IS NULL AND co.objectclass_id = ANY({})",
            ENVELOPE_COLUMNS, self.schema.base_table, codes
        );
        if let Some(predicate) = &filter.predicate {
            let condition = self.predicate(predicate, "co", &filter.types)?;
            sql.push_str(" AND ");
            sql.push_str(&condition);
        }
        sql.push_str(" ORDER BY co.id");
        Ok(self.finish(sql))
    }

    /// Translates a predicate evaluated against rows aliased `alias`.
    pub fn predicate(
        &mut self,
        predicate: &Predicate,
        alias: &str,
        scope: &[citydb_lite_core::FeatureType],
    ) -> Result<String> {
        Ok(match predicate {
            Predicate::Compare { path, op, value } => {
                self.path(path, alias, scope, &Leaf::Compare(*op, value))?
            }
            Predicate::Like { path, pattern } => self.path(path, alias, scope, &Leaf::Like(pattern))?,
            Predicate::Between { path, low, high } => {
                self.path(path, alias, scope, &Leaf::Between(low, high))?
            }
            Predicate::In { path, values } => self.path(path, alias, scope, &Leaf::In(values))?,
            Predicate::IsNull { path } => self.path(path, alias, scope, &Leaf::IsNull)?,
            Predicate::ResourceId(ids) if ids.is_empty() => "FALSE".to_string(),
            Predicate::ResourceId(ids) => {
                let p = self.bind(SqlValue::TextArray(ids.clone()));
                format!("{}.gmlid = ANY({})", alias, p)
            }
            Predicate::BBox(envelope) => self.bbox(alias, envelope),
            Predicate::And(list) if list.is_empty() => "TRUE".to_string(),
            Predicate::Or(list) if list.is_empty() => "FALSE".to_string(),
            Predicate::And(list) => self.junction(list, " AND ", alias, scope)?,
            Predicate::Or(list) => self.junction(list, " OR ", alias, scope)?,
            Predicate::Not(inner) => format!("NOT ({})", self.predicate(inner, alias, scope)?),
        })
    }

    fn junction(
        &mut self,
        list: &[Predicate],
        op: &str,
        alias: &str,
        scope: &[citydb_lite_core::FeatureType],
    ) -> Result<String> {
        let parts = list
            .iter()
            .map(|p| self.predicate(p, alias, scope))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", parts.join(op)))
    }

    fn bbox(&mut self, alias: &str, envelope: &Envelope) -> String {
        let xmin = self.bind(SqlValue::Double(envelope.min[0]));
        let ymin = self.bind(SqlValue::Double(envelope.min[1]));
        let xmax = self.bind(SqlValue::Double(envelope.max[0]));
        let ymax = self.bind(SqlValue::Double(envelope.max[1]));
        format!(
            "{}.envelope && ST_MakeEnvelope({}, {}, {}, {}, {})",
            alias, xmin, ymin, xmax, ymax, self.schema.srid
        )
    }

    fn path(
        &mut self,
        path: &str,
        alias: &str,
        scope: &[citydb_lite_core::FeatureType],
        leaf: &Leaf<'_>,
    ) -> Result<String> {
        let resolved = path::resolve(self.schema, scope, path)?;
        Ok(self.hops(&resolved.hops, &resolved.target, alias, leaf))
    }

    fn hops(&mut self, hops: &[Hop], target: &PathTarget, alias: &str, leaf: &Leaf<'_>) -> String {
        let Some((hop, rest)) = hops.split_first() else {
            return self.target(target, alias, leaf);
        };
        let codes = hop
            .type_codes()
            .iter()
            .map(i32::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let base = self.schema.base_table.clone();
        match hop.kind {
            RelationKind::Nested => {
                let child = self.alias("c");
                let inner = self.hops(rest, target, &child, leaf);
                format!(
                    "EXISTS (SELECT 1 FROM {base} {child} WHERE {child}.parent_id = {alias}.id \
                     AND {child}.objectclass_id IN ({codes}) AND {inner})"
                )
            }
            RelationKind::Membership => {
                let link = self.alias("g");
                let member = self.alias("c");
                let inner = self.hops(rest, target, &member, leaf);
                format!(
                    "EXISTS (SELECT 1 FROM {table} {link} JOIN {base} {member} \
                     ON {member}.id = {link}.cityobject_id WHERE {link}.cityobjectgroup_id = {alias}.id \
                     AND {member}.objectclass_id IN ({codes}) AND {inner})",
                    table = self.schema.member_table
                )
            }
        }
    }

    fn target(&mut self, target: &PathTarget, alias: &str, leaf: &Leaf<'_>) -> String {
        match target {
            PathTarget::Base(column) => {
                self.leaf(&format!("{}.{}", alias, column.column()), ColumnKind::Text, leaf)
            }
            PathTarget::Attribute(_) => {
                let columns: Vec<(String, String, ColumnKind)> = target
                    .distinct_columns()
                    .into_iter()
                    .map(|t| (t.table.clone(), t.column.clone(), t.kind))
                    .collect();
                let parts: Vec<String> = columns
                    .into_iter()
                    .map(|(table, column, kind)| {
                        let t = self.alias("t");
                        let condition = self.leaf(&format!("{}.{}", t, column), kind, leaf);
                        format!(
                            "EXISTS (SELECT 1 FROM {table} {t} WHERE {t}.id = {alias}.id AND {condition})"
                        )
                    })
                    .collect();
                if parts.len() == 1 {
                    parts.into_iter().next().unwrap_or_default()
                } else {
                    format!("({})", parts.join(" OR "))
                }
            }
        }
    }

    fn literal(&mut self, kind: ColumnKind, value: &Value) -> Option<String> {
        kind.coerce(value).map(|v| self.bind(v.into()))
    }

    fn leaf(&mut self, column: &str, kind: ColumnKind, leaf: &Leaf<'_>) -> String {
        match leaf {
            Leaf::Compare(op, value) => match self.literal(kind, value) {
                Some(p) => format!("{} {} {}", column, op.sql(), p),
                None => "FALSE".to_string(),
            },
            Leaf::Like(pattern) => {
                let p = self.bind(SqlValue::Text(pattern.to_sql()));
                let op = if pattern.match_case { "LIKE" } else { "ILIKE" };
                let column = match kind {
                    ColumnKind::Text => column.to_string(),
                    _ => format!("CAST({} AS text)", column),
                };
                format!("{} {} {} ESCAPE '\\'", column, op, p)
            }
            Leaf::Between(low, high) => match (kind.coerce(low), kind.coerce(high)) {
                (Some(lo), Some(hi)) => {
                    let lo = self.bind(lo.into());
                    let hi = self.bind(hi.into());
                    format!("{} BETWEEN {} AND {}", column, lo, hi)
                }
                _ => "FALSE".to_string(),
            },
            Leaf::In(values) => {
                let placeholders: Vec<String> =
                    values.iter().filter_map(|v| self.literal(kind, v)).collect();
                if placeholders.is_empty() {
                    "FALSE".to_string()
                } else {
                    format!("{} IN ({})", column, placeholders.join(", "))
                }
            }
            Leaf::IsNull => format!("{} IS NULL", column),
        }
    }

    /// `column = $n` for a single key, `column = ANY($n)` otherwise.
    fn keyed(&mut self, column: &str, keys: &[i64]) -> String {
        match keys {
            [key] => {
                let p = self.bind(SqlValue::Integer(*key));
                format!("{} = {}", column, p)
            }
            _ => {
                let p = self.bind(SqlValue::BigIntArray(keys.to_vec()));
                format!("{} = ANY({})", column, p)
            }
        }
    }

    /// Base and type-table rows keyed by id or parent id.
    pub fn feature_rows(mut self, query: &FeatureQuery, keys: &[i64]) -> Statement {
        let key = match query.key {
            KeyColumn::Id => "co.id",
            KeyColumn::Parent => "co.parent_id",
        };
        let keyed = self.keyed(key, keys);
        let code = self.bind(SqlValue::Integer(query.feature_type.code() as i64));
        let mut columns = format!(
            "co.id, co.objectclass_id, co.parent_id, co.gmlid, co.name, co.description, {}",
            ENVELOPE_COLUMNS
        );
        for c in &query.columns {
            columns.push_str(&format!(", t.{}", c.column));
        }
        for c in &query.geometry_columns {
            columns.push_str(&format!(", t.{}", c));
        }
        let sql = format!(
            "SELECT {} FROM {} co JOIN {} t ON t.id = co.id \
             WHERE {} AND co.objectclass_id = {} ORDER BY co.id",
            columns, self.schema.base_table, query.table, keyed, code
        );
        self.finish(sql)
    }

    pub fn geometry_rows(mut self, roots: &[i64]) -> Statement {
        let keyed = self.keyed("root_id", roots);
        let sql = format!(
            "SELECT id, parent_id, root_id, is_solid, is_composite, is_triangulated, is_xlink, \
             is_reverse, gmlid, ST_AsText(geometry), cityobject_id FROM {} \
             WHERE {} ORDER BY id",
            self.schema.geometry_table, keyed
        );
        self.finish(sql)
    }

    pub fn group_members(mut self, groups: &[i64]) -> Statement {
        let keyed = self.keyed("m.cityobjectgroup_id", groups);
        let sql = format!(
            "SELECT m.cityobjectgroup_id, m.cityobject_id, co.objectclass_id, co.gmlid, m.role \
             FROM {} m LEFT JOIN {} co ON co.id = m.cityobject_id \
             WHERE {} ORDER BY m.cityobjectgroup_id, m.cityobject_id",
            self.schema.member_table, self.schema.base_table, keyed
        );
        self.finish(sql)
    }

    pub fn reserve_ids(mut self, sequence: Sequence, count: usize) -> Statement {
        let count = self.bind(SqlValue::Integer(count as i64));
        let sql = format!(
            "SELECT nextval('{}') FROM generate_series(1, {})",
            sequence_name(self.schema, sequence),
            count
        );
        self.finish(sql)
    }
}

pub fn sequence_name(schema: &SchemaMapping, sequence: Sequence) -> String {
    match sequence {
        Sequence::Feature => format!("{}_seq", schema.base_table),
        Sequence::Geometry => format!("{}_seq", schema.geometry_table),
    }
}

// ─── Bulk write statements (UNNEST) ─────────────────────────────────────────

pub fn insert_base_rows(schema: &SchemaMapping) -> String {
    format!(
        "INSERT INTO {} (id, objectclass_id, parent_id, gmlid, name, description, envelope) \
         SELECT u.id, u.oc, u.parent_id, u.gmlid, u.name, u.description, \
         ST_SetSRID(ST_3DMakeBox(ST_MakePoint(u.x0, u.y0, u.z0), ST_MakePoint(u.x1, u.y1, u.z1))::geometry, {}) \
         FROM UNNEST($1::BIGINT[], $2::INT[], $3::BIGINT[], $4::TEXT[], $5::TEXT[], $6::TEXT[], \
         $7::FLOAT8[], $8::FLOAT8[], $9::FLOAT8[], $10::FLOAT8[], $11::FLOAT8[], $12::FLOAT8[]) \
         AS u(id, oc, parent_id, gmlid, name, description, x0, y0, z0, x1, y1, z1)",
        schema.base_table, schema.srid
    )
}

pub fn insert_geometry_rows(schema: &SchemaMapping) -> String {
    format!(
        "INSERT INTO {} (id, parent_id, root_id, is_solid, is_composite, is_triangulated, is_xlink, \
         is_reverse, gmlid, geometry, cityobject_id) \
         SELECT u.id, u.parent_id, u.root_id, u.is_solid, u.is_composite, u.is_triangulated, \
         u.is_xlink, u.is_reverse, u.gmlid, ST_GeomFromText(u.wkt, {}), u.cityobject_id \
         FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::BIGINT[], $4::BOOL[], $5::BOOL[], $6::BOOL[], \
         $7::INT[], $8::BOOL[], $9::TEXT[], $10::TEXT[], $11::BIGINT[]) \
         AS u(id, parent_id, root_id, is_solid, is_composite, is_triangulated, is_xlink, is_reverse, \
         gmlid, wkt, cityobject_id)",
        schema.geometry_table, schema.srid
    )
}

/// Type-table insert; `columns` lists column name and kind after `id`.
pub fn insert_type_rows(table: &str, columns: &[(&str, ColumnKind)]) -> String {
    let mut names = vec!["id".to_string()];
    let mut arrays = vec!["$1::BIGINT[]".to_string()];
    for (i, (name, kind)) in columns.iter().enumerate() {
        names.push(name.to_string());
        arrays.push(format!("${}::{}[]", i + 2, kind.sql_type()));
    }
    format!(
        "INSERT INTO {} ({}) SELECT * FROM UNNEST({})",
        table,
        names.join(", "),
        arrays.join(", ")
    )
}

pub fn insert_members(schema: &SchemaMapping) -> String {
    format!(
        "INSERT INTO {} (cityobjectgroup_id, cityobject_id, role) \
         SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::TEXT[])",
        schema.member_table
    )
}

pub fn assign_geometry(table: &str, column: &str) -> String {
    format!(
        "UPDATE {table} t SET {column} = u.root_id \
         FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS u(id, root_id) WHERE t.id = u.id"
    )
}

pub fn mark_xlinks(schema: &SchemaMapping) -> String {
    format!(
        "UPDATE {} g SET is_xlink = u.kind \
         FROM UNNEST($1::BIGINT[], $2::INT[]) AS u(id, kind) WHERE g.id = u.id",
        schema.geometry_table
    )
}

/// DDL for the tables and sequences the mapping refers to.
pub fn create_schema(schema: &SchemaMapping) -> Vec<String> {
    let mut out = vec![
        format!("CREATE SEQUENCE IF NOT EXISTS {}", sequence_name(schema, Sequence::Feature)),
        format!("CREATE SEQUENCE IF NOT EXISTS {}", sequence_name(schema, Sequence::Geometry)),
        format!(
            "CREATE TABLE IF NOT EXISTS {base} (id BIGINT PRIMARY KEY, objectclass_id INT NOT NULL, \
             parent_id BIGINT REFERENCES {base}(id), gmlid TEXT, name TEXT, description TEXT, \
             envelope geometry(GeometryZ, {srid}))",
            base = schema.base_table,
            srid = schema.srid
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {base}_parent_idx ON {base} (parent_id)",
            base = schema.base_table
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {geom} (id BIGINT PRIMARY KEY, parent_id BIGINT REFERENCES {geom}(id), \
             root_id BIGINT NOT NULL, is_solid BOOL NOT NULL DEFAULT FALSE, \
             is_composite BOOL NOT NULL DEFAULT FALSE, is_triangulated BOOL NOT NULL DEFAULT FALSE, \
             is_xlink INT NOT NULL DEFAULT 0, is_reverse BOOL NOT NULL DEFAULT FALSE, gmlid TEXT, \
             geometry geometry(PolygonZ, {srid}), cityobject_id BIGINT REFERENCES {base}(id))",
            geom = schema.geometry_table,
            base = schema.base_table,
            srid = schema.srid
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {geom}_root_idx ON {geom} (root_id)",
            geom = schema.geometry_table
        ),
    ];

    let mut tables: Vec<&citydb_lite_core::TypeMapping> = Vec::new();
    for ft in schema.feature_types() {
        if let Some(m) = schema.type_mapping(ft) {
            if !tables.iter().any(|t| t.table == m.table) {
                tables.push(m);
            }
        }
    }
    for m in tables {
        let mut columns = vec![format!(
            "id BIGINT PRIMARY KEY REFERENCES {}(id)",
            schema.base_table
        )];
        for a in &m.attributes {
            columns.push(format!("{} {}", a.column, a.kind.sql_type()));
        }
        for g in &m.geometry {
            columns.push(format!(
                "{} BIGINT REFERENCES {}(id)",
                g.column, schema.geometry_table
            ));
        }
        out.push(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            m.table,
            columns.join(", ")
        ));
    }

    out.push(format!(
        "CREATE TABLE IF NOT EXISTS {} (cityobjectgroup_id BIGINT NOT NULL REFERENCES {base}(id), \
         cityobject_id BIGINT NOT NULL REFERENCES {base}(id), role TEXT, \
         PRIMARY KEY (cityobjectgroup_id, cityobject_id))",
        schema.member_table,
        base = schema.base_table
    ));
    out
}
