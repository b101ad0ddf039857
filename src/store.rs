use std::collections::HashMap;

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, ToSql};
use serde_json::{Map, Value};
use thiserror::Error as ThisError;

use crate::coerce::FieldValue;
use crate::entities::{EntitySpec, ReferenceSpec};
use crate::reconcile::{compose_key, NormalizedRecord};

#[derive(Debug, Clone, PartialEq, ThisError)]
#[error("{message}")]
pub struct StoreError {
    pub code: &'static str,
    pub message: String,
}

impl StoreError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        let code = match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => "constraint",
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => "busy",
            _ => "db_error",
        };
        Self::new(code, e.to_string())
    }
}

/// Rows of one `insert_many` call that were rejected individually, by index
/// into the submitted slice. Everything not listed was written.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InsertReport {
    pub failed: Vec<(usize, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedReference {
    pub id: i64,
    /// Values of `ReferenceSpec::copy`, in the same order.
    pub copied: Vec<FieldValue>,
}

/// Persistence capability used by the reconciler.
pub trait RecordStore {
    fn ensure_ready(&mut self, entity: &EntitySpec) -> Result<(), StoreError>;

    /// Looks up persisted rows by natural key. The returned map is keyed by
    /// `compose_key` of the stored key columns.
    fn find_existing(
        &mut self,
        entity: &EntitySpec,
        keys: &[Vec<FieldValue>],
    ) -> Result<HashMap<String, i64>, StoreError>;

    fn resolve_references(
        &mut self,
        reference: &ReferenceSpec,
        codes: &[String],
    ) -> Result<HashMap<String, ResolvedReference>, StoreError>;

    fn insert_many(
        &mut self,
        entity: &EntitySpec,
        records: &[NormalizedRecord],
    ) -> Result<InsertReport, StoreError>;

    fn update_one(
        &mut self,
        entity: &EntitySpec,
        id: i64,
        record: &NormalizedRecord,
    ) -> Result<(), StoreError>;
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(SqlValue::Null),
            FieldValue::Int(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            FieldValue::Float(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            FieldValue::IdList(ids) => ToSqlOutput::Owned(SqlValue::Text(
                serde_json::to_string(ids)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            )),
        })
    }
}

fn field_value(v: SqlValue) -> FieldValue {
    match v {
        SqlValue::Integer(i) => FieldValue::Int(i),
        SqlValue::Real(f) => FieldValue::Float(f),
        SqlValue::Text(s) => FieldValue::Text(s),
        SqlValue::Null | SqlValue::Blob(_) => FieldValue::Null,
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn row_json(
        entity: &EntitySpec,
        columns: &[String],
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Value> {
        let mut obj = Map::new();
        for (i, name) in columns.iter().enumerate() {
            let value = match row.get::<_, SqlValue>(i)? {
                SqlValue::Text(s) if entity.is_id_list(name) => {
                    serde_json::from_str(&s).unwrap_or(Value::String(s))
                }
                other => field_value(other).to_json(),
            };
            obj.insert(name.clone(), value);
        }
        Ok(Value::Object(obj))
    }

    pub fn list(
        &self,
        entity: &EntitySpec,
        limit: i64,
        offset: i64,
    ) -> Result<(i64, Vec<Value>), StoreError> {
        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", entity.table),
            [],
            |r| r.get(0),
        )?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT * FROM {} ORDER BY {} LIMIT ? OFFSET ?",
            entity.table, entity.order_by
        ))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let rows = stmt
            .query_map((limit, offset), |r| Self::row_json(entity, &columns, r))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((total, rows))
    }

    pub fn get(&self, entity: &EntitySpec, id: i64) -> Result<Option<Value>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {} WHERE id = ?", entity.table))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(r) => Ok(Some(Self::row_json(entity, &columns, r)?)),
            None => Ok(None),
        }
    }

    pub fn delete_many(&self, entity: &EntitySpec, ids: &[i64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        let mut deleted = 0;
        for chunk in ids.chunks(500) {
            deleted += tx.execute(
                &format!(
                    "DELETE FROM {} WHERE id IN ({})",
                    entity.table,
                    placeholders(chunk.len())
                ),
                params_from_iter(chunk.iter()),
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }
}

impl RecordStore for SqliteStore<'_> {
    fn ensure_ready(&mut self, entity: &EntitySpec) -> Result<(), StoreError> {
        self.conn
            .prepare(&format!("SELECT id FROM {} LIMIT 1", entity.table))
            .map(|_| ())
            .map_err(|e| StoreError::new("store_unavailable", e.to_string()))
    }

    fn find_existing(
        &mut self,
        entity: &EntitySpec,
        keys: &[Vec<FieldValue>],
    ) -> Result<HashMap<String, i64>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let width = entity.natural_key.len();
        let columns = entity.natural_key.join(", ");
        let filter = if width == 1 {
            format!("{} IN ({})", columns, placeholders(keys.len()))
        } else {
            let tuple = format!("({})", placeholders(width));
            format!(
                "({}) IN (VALUES {})",
                columns,
                vec![tuple.as_str(); keys.len()].join(", ")
            )
        };
        let sql = format!(
            "SELECT id, {} FROM {} WHERE {}",
            columns, entity.table, filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(keys.iter().flatten()), |r| {
            let id: i64 = r.get(0)?;
            let mut parts = Vec::with_capacity(width);
            for i in 0..width {
                parts.push(field_value(r.get::<_, SqlValue>(i + 1)?));
            }
            Ok((compose_key(&parts), id))
        })?;
        let mut found = HashMap::new();
        for row in rows {
            let (key, id) = row?;
            found.insert(key, id);
        }
        Ok(found)
    }

    fn resolve_references(
        &mut self,
        reference: &ReferenceSpec,
        codes: &[String],
    ) -> Result<HashMap<String, ResolvedReference>, StoreError> {
        if codes.is_empty() {
            return Ok(HashMap::new());
        }
        let mut select = vec!["id", reference.code_column];
        select.extend(reference.copy.iter().map(|(column, _)| *column));
        let sql = format!(
            "SELECT {} FROM {} WHERE {} IN ({})",
            select.join(", "),
            reference.table,
            reference.code_column,
            placeholders(codes.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(codes.iter()), |r| {
            let id: i64 = r.get(0)?;
            let code = field_value(r.get::<_, SqlValue>(1)?).key_part();
            let mut copied = Vec::with_capacity(reference.copy.len());
            for i in 0..reference.copy.len() {
                copied.push(field_value(r.get::<_, SqlValue>(i + 2)?));
            }
            Ok((code, ResolvedReference { id, copied }))
        })?;
        let mut resolved = HashMap::new();
        for row in rows {
            let (code, target) = row?;
            resolved.insert(code, target);
        }
        Ok(resolved)
    }

    fn insert_many(
        &mut self,
        entity: &EntitySpec,
        records: &[NormalizedRecord],
    ) -> Result<InsertReport, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut report = InsertReport::default();
        for (i, record) in records.iter().enumerate() {
            let columns: Vec<&str> = record.keys().map(|k| k.as_str()).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                entity.table,
                columns.join(", "),
                placeholders(columns.len())
            );
            // A rejected row must not take the rest of the sub-batch down.
            tx.execute_batch("SAVEPOINT import_row")?;
            match tx.execute(&sql, params_from_iter(record.values())) {
                Ok(_) => tx.execute_batch("RELEASE import_row")?,
                Err(e) => {
                    tx.execute_batch("ROLLBACK TO import_row; RELEASE import_row")?;
                    report.failed.push((i, e.to_string()));
                }
            }
        }
        tx.commit()?;
        Ok(report)
    }

    fn update_one(
        &mut self,
        entity: &EntitySpec,
        id: i64,
        record: &NormalizedRecord,
    ) -> Result<(), StoreError> {
        let assignments = record
            .keys()
            .map(|k| format!("{} = ?", k))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            entity.table, assignments
        );
        let id_param = FieldValue::Int(id);
        let changed = self.conn.execute(
            &sql,
            params_from_iter(record.values().chain(std::iter::once(&id_param))),
        )?;
        if changed == 0 {
            return Err(StoreError::new("not_found", "Không tìm thấy bản ghi"));
        }
        Ok(())
    }
}

/// Snapshot of a record as JSON, used by previews.
pub fn record_json(record: &NormalizedRecord) -> Value {
    let obj: Map<String, Value> = record
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    Value::Object(obj)
}
