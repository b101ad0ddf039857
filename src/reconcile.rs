//! Batch upsert of spreadsheet rows against a `RecordStore`.
//!
//! Rows are processed in sub-batches. Each sub-batch normalizes its rows,
//! resolves references and looks up existing records with one query each,
//! then writes inserts in bulk and updates one at a time. Failures are
//! collected per row; nothing already written is rolled back. Optional
//! references that did not resolve are retried once the whole import is
//! written, so a child listed before its parent still gets linked.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{SecondsFormat, Utc};
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

use crate::coerce::{self, FieldValue, RawValue};
use crate::entities::{EntitySpec, FieldKind, FieldSpec, ReferenceSpec};
use crate::store::{RecordStore, ResolvedReference, StoreError};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Joins natural-key parts. Values containing it are rejected during
/// normalization so distinct tuples never compose to the same string.
pub const KEY_SEPARATOR: char = '\u{1f}';

pub type CandidateRecord = BTreeMap<String, RawValue>;
pub type NormalizedRecord = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    /// 0-based position in the submitted rows.
    pub row: usize,
    pub message: String,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchResult {
    pub inserted: usize,
    pub updated: usize,
    pub errors: Vec<RowError>,
    /// Rows that were written but left an optional reference empty.
    pub warnings: Vec<RowError>,
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertOptions {
    pub chunk_size: usize,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum ReconcileError {
    #[error("Không tìm thấy thông tin nhân viên khi nhập {entity}. Vui lòng đăng nhập lại.")]
    MissingActor { entity: &'static str },

    #[error("Không thể kết nối cơ sở dữ liệu: {0}")]
    StoreUnavailable(StoreError),
}

pub fn compose_key(parts: &[FieldValue]) -> String {
    parts
        .iter()
        .map(FieldValue::key_part)
        .collect::<Vec<_>>()
        .join(&KEY_SEPARATOR.to_string())
}

enum Coerced {
    Value(FieldValue),
    Absent,
    Invalid,
}

fn coerce_field(kind: FieldKind, raw: Option<&RawValue>) -> Coerced {
    let raw = match raw {
        Some(raw) if !coerce::is_blank(Some(raw)) => raw,
        _ => return Coerced::Absent,
    };
    let value = match kind {
        FieldKind::Text => coerce::text(raw).map(FieldValue::Text),
        FieldKind::Date => coerce::date(raw).map(FieldValue::Text),
        FieldKind::Integer { min, max } => coerce::integer(raw, min, max).map(FieldValue::Int),
        FieldKind::Decimal => coerce::decimal(raw).map(FieldValue::Float),
        FieldKind::Choice(aliases) => coerce::choice(raw, aliases).map(FieldValue::Text),
        FieldKind::IdList => {
            let ids = coerce::id_list(raw);
            if ids.is_empty() {
                return Coerced::Absent;
            }
            Some(FieldValue::IdList(ids))
        }
    };
    match value {
        Some(v) => Coerced::Value(v),
        None => Coerced::Invalid,
    }
}

fn invalid_message(field: &FieldSpec) -> String {
    if field.invalid.is_empty() {
        format!("{} không hợp lệ", field.label)
    } else {
        field.invalid.to_string()
    }
}

struct Normalized {
    key: String,
    key_parts: Vec<FieldValue>,
    record: NormalizedRecord,
}

fn key_parts(entity: &EntitySpec, record: &NormalizedRecord) -> Result<Vec<FieldValue>, String> {
    let mut parts = Vec::with_capacity(entity.natural_key.len());
    for name in entity.natural_key {
        let value = record.get(*name).cloned().unwrap_or(FieldValue::Null);
        let label = entity.field(name).map_or(*name, |f| f.label);
        if value.is_null() {
            return Err(format!("{} là bắt buộc", label));
        }
        if value.key_part().contains(KEY_SEPARATOR) {
            return Err(format!("{} chứa ký tự không hợp lệ", label));
        }
        parts.push(value);
    }
    Ok(parts)
}

fn normalize(entity: &EntitySpec, row: &CandidateRecord) -> Result<Normalized, String> {
    for field in entity.fields {
        if let Some(message) = field.required {
            if coerce::is_blank(row.get(field.name)) {
                return Err(message.to_string());
            }
        }
    }

    let mut record = NormalizedRecord::new();
    for field in entity.fields {
        let value = match coerce_field(field.kind, row.get(field.name)) {
            Coerced::Value(v) => v,
            Coerced::Absent => match (field.default, field.required) {
                (Some(d), _) => d.to_field_value(),
                (None, Some(message)) => return Err(message.to_string()),
                (None, None) => FieldValue::Null,
            },
            Coerced::Invalid => match field.default {
                Some(d) => d.to_field_value(),
                None => return Err(invalid_message(field)),
            },
        };
        record.insert(field.name.to_string(), value);
    }

    let key_parts = key_parts(entity, &record)?;
    Ok(Normalized {
        key: compose_key(&key_parts),
        key_parts,
        record,
    })
}

fn apply_reference(
    reference: &ReferenceSpec,
    record: &mut NormalizedRecord,
    resolved: &HashMap<String, ResolvedReference>,
) -> Result<(), String> {
    let code = record
        .get(reference.code_field)
        .filter(|v| !v.is_null())
        .map(FieldValue::key_part);
    match code.as_ref().map(|c| (c, resolved.get(c))) {
        Some((_, Some(target))) => {
            record.insert(reference.id_field.to_string(), FieldValue::Int(target.id));
            for ((_, field), value) in reference.copy.iter().zip(&target.copied) {
                record.insert(field.to_string(), value.clone());
            }
            return Ok(());
        }
        Some((code, None)) if reference.required => {
            return Err(format!("{}: {}", reference.missing, code));
        }
        _ => {}
    }
    record.insert(reference.id_field.to_string(), FieldValue::Null);
    for (_, field) in reference.copy {
        record.insert(field.to_string(), FieldValue::Null);
    }
    Ok(())
}

/// What a single row of a sub-batch is going to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RowPlan {
    Invalid(String),
    Insert { key: String, record: NormalizedRecord },
    Update { id: i64, record: NormalizedRecord },
}

/// Normalizes one sub-batch and classifies each row against the store.
/// `Err` carries the message for a lookup that failed for the whole chunk.
fn plan_chunk<S: RecordStore + ?Sized>(
    store: &mut S,
    entity: &EntitySpec,
    chunk: &[CandidateRecord],
) -> Result<Vec<RowPlan>, String> {
    let mut normalized: Vec<Result<Normalized, String>> =
        chunk.iter().map(|row| normalize(entity, row)).collect();

    for reference in entity.references {
        let mut seen = HashSet::new();
        let codes: Vec<String> = normalized
            .iter()
            .flatten()
            .filter_map(|n| n.record.get(reference.code_field))
            .filter(|v| !v.is_null())
            .map(FieldValue::key_part)
            .filter(|c| seen.insert(c.clone()))
            .collect();
        let resolved = if codes.is_empty() {
            HashMap::new()
        } else {
            store
                .resolve_references(reference, &codes)
                .map_err(|e| format!("Lỗi khi tra cứu dữ liệu liên kết: {}", e))?
        };
        for slot in normalized.iter_mut() {
            let Ok(n) = slot else { continue };
            if let Err(message) = apply_reference(reference, &mut n.record, &resolved) {
                *slot = Err(message);
            }
        }
    }

    let mut seen = HashSet::new();
    let keys: Vec<Vec<FieldValue>> = normalized
        .iter()
        .flatten()
        .filter(|n| seen.insert(n.key.clone()))
        .map(|n| n.key_parts.clone())
        .collect();
    let existing = if keys.is_empty() {
        HashMap::new()
    } else {
        store
            .find_existing(entity, &keys)
            .map_err(|e| format!("Lỗi khi kiểm tra dữ liệu tồn tại: {}", e))?
    };

    Ok(normalized
        .into_iter()
        .map(|n| match n {
            Err(message) => RowPlan::Invalid(message),
            Ok(n) => match existing.get(&n.key) {
                Some(&id) => RowPlan::Update {
                    id,
                    record: n.record,
                },
                None => RowPlan::Insert {
                    key: n.key,
                    record: n.record,
                },
            },
        })
        .collect())
}

fn check_actor(entity: &EntitySpec, actor: Option<i64>) -> Result<Option<i64>, ReconcileError> {
    let actor = actor.filter(|id| *id > 0);
    match entity.actor {
        Some(stamp) if stamp.required && actor.is_none() => Err(ReconcileError::MissingActor {
            entity: entity.name,
        }),
        _ => Ok(actor),
    }
}

struct PendingInsert {
    /// Every row that collapsed onto this key; the last one supplied `record`.
    rows: Vec<usize>,
    record: NormalizedRecord,
}

/// A written row whose optional reference code did not resolve when its
/// sub-batch was planned.
struct Unlinked {
    row: usize,
    /// Index into `EntitySpec::references`.
    reference: usize,
    code: String,
    key_parts: Vec<FieldValue>,
}

fn collect_unlinked(
    entity: &EntitySpec,
    row: usize,
    record: &NormalizedRecord,
    out: &mut Vec<Unlinked>,
) {
    for (index, reference) in entity.references.iter().enumerate() {
        let code = match record.get(reference.code_field) {
            Some(v) if !v.is_null() => v.key_part(),
            _ => continue,
        };
        if record.get(reference.id_field).is_some_and(|v| !v.is_null()) {
            continue;
        }
        let key_parts = entity
            .natural_key
            .iter()
            .map(|k| record.get(*k).cloned().unwrap_or(FieldValue::Null))
            .collect();
        out.push(Unlinked {
            row,
            reference: index,
            code,
            key_parts,
        });
    }
}

fn write_chunk<S: RecordStore + ?Sized>(
    store: &mut S,
    entity: &EntitySpec,
    start: usize,
    plans: Vec<RowPlan>,
    actor: Option<i64>,
    result: &mut BatchResult,
    unlinked: &mut Vec<Unlinked>,
) {
    let mut pending: Vec<PendingInsert> = Vec::new();
    let mut pending_by_key: HashMap<String, usize> = HashMap::new();
    let mut updates: Vec<(usize, i64, NormalizedRecord)> = Vec::new();

    for (offset, plan) in plans.into_iter().enumerate() {
        let row = start + offset;
        match plan {
            RowPlan::Invalid(message) => result.errors.push(RowError { row, message }),
            RowPlan::Update { id, record } => updates.push((row, id, record)),
            RowPlan::Insert { key, mut record } => {
                if let Some(stamp) = entity.actor {
                    record.insert(
                        stamp.field.to_string(),
                        actor.map_or(FieldValue::Null, FieldValue::Int),
                    );
                }
                match pending_by_key.get(&key) {
                    Some(&i) => {
                        pending[i].rows.push(row);
                        pending[i].record = record;
                    }
                    None => {
                        pending_by_key.insert(key, pending.len());
                        pending.push(PendingInsert {
                            rows: vec![row],
                            record,
                        });
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        let (rows, records): (Vec<Vec<usize>>, Vec<NormalizedRecord>) =
            pending.into_iter().map(|p| (p.rows, p.record)).unzip();
        match store.insert_many(entity, &records) {
            Ok(report) => {
                let failed: HashMap<usize, String> = report.failed.into_iter().collect();
                for (i, merged) in rows.iter().enumerate() {
                    match failed.get(&i) {
                        Some(message) => {
                            for &row in merged {
                                result.errors.push(RowError {
                                    row,
                                    message: format!("Lỗi khi thêm mới: {}", message),
                                });
                            }
                        }
                        None => {
                            result.inserted += 1;
                            result.updated += merged.len() - 1;
                            if let Some(&row) = merged.last() {
                                collect_unlinked(entity, row, &records[i], unlinked);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(start, count = records.len(), error = %e, "bulk insert failed");
                result.errors.push(RowError {
                    row: start,
                    message: format!("Lỗi khi thêm mới: {}", e),
                });
            }
        }
    }

    for (row, id, mut record) in updates {
        if let Some(field) = entity.updated_at_field {
            record.insert(
                field.to_string(),
                FieldValue::Text(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        match store.update_one(entity, id, &record) {
            Ok(()) => {
                result.updated += 1;
                collect_unlinked(entity, row, &record, unlinked);
            }
            Err(e) => {
                warn!(row, id, error = %e, "update failed");
                result.errors.push(RowError {
                    row,
                    message: format!("Lỗi khi cập nhật ID {}: {}", id, e),
                });
            }
        }
    }
}

pub fn batch_upsert<S: RecordStore + ?Sized>(
    store: &mut S,
    entity: &EntitySpec,
    records: &[CandidateRecord],
    actor: Option<i64>,
    options: &UpsertOptions,
) -> Result<BatchResult, ReconcileError> {
    let actor = check_actor(entity, actor)?;
    let mut result = BatchResult::default();
    if records.is_empty() {
        return Ok(result);
    }
    store
        .ensure_ready(entity)
        .map_err(ReconcileError::StoreUnavailable)?;

    let size = options.chunk_size.max(1);
    let mut unlinked = Vec::new();
    for (index, chunk) in records.chunks(size).enumerate() {
        let start = index * size;
        debug!(chunk = index, start, rows = chunk.len(), "processing sub-batch");
        match plan_chunk(store, entity, chunk) {
            Ok(plans) => write_chunk(
                store,
                entity,
                start,
                plans,
                actor,
                &mut result,
                &mut unlinked,
            ),
            Err(message) => {
                warn!(chunk = index, start, %message, "sub-batch skipped");
                result.errors.push(RowError {
                    row: start,
                    message,
                });
            }
        }
    }

    link_references(store, entity, &unlinked, size, &mut result);

    result.errors.sort_by_key(|e| e.row);
    result.warnings.sort_by_key(|e| e.row);
    info!(
        inserted = result.inserted,
        updated = result.updated,
        failed = result.errors.len(),
        warnings = result.warnings.len(),
        "batch upsert finished"
    );
    Ok(result)
}

fn unresolved(reference: &ReferenceSpec, u: &Unlinked) -> RowError {
    RowError {
        row: u.row,
        message: format!("{}: {}", reference.missing, u.code),
    }
}

/// Resolves optional references left empty while planning. A self-reference
/// may name a row written later in the same import, so its codes are looked
/// up again once every sub-batch is in. Codes that still do not resolve
/// become warnings on their rows.
fn link_references<S: RecordStore + ?Sized>(
    store: &mut S,
    entity: &EntitySpec,
    unlinked: &[Unlinked],
    chunk_size: usize,
    result: &mut BatchResult,
) {
    for (index, reference) in entity.references.iter().enumerate() {
        let pending: Vec<&Unlinked> = unlinked.iter().filter(|u| u.reference == index).collect();
        if pending.is_empty() {
            continue;
        }
        if reference.table != entity.table {
            result
                .warnings
                .extend(pending.iter().map(|u| unresolved(reference, u)));
            continue;
        }
        for chunk in pending.chunks(chunk_size) {
            if let Err(message) = link_chunk(store, entity, reference, chunk, result) {
                warn!(rows = chunk.len(), %message, "reference linking skipped");
                result.warnings.extend(chunk.iter().map(|u| RowError {
                    row: u.row,
                    message: message.clone(),
                }));
            }
        }
    }
}

fn link_chunk<S: RecordStore + ?Sized>(
    store: &mut S,
    entity: &EntitySpec,
    reference: &ReferenceSpec,
    chunk: &[&Unlinked],
    result: &mut BatchResult,
) -> Result<(), String> {
    let mut seen = HashSet::new();
    let codes: Vec<String> = chunk
        .iter()
        .map(|u| u.code.clone())
        .filter(|c| seen.insert(c.clone()))
        .collect();
    let resolved = store
        .resolve_references(reference, &codes)
        .map_err(|e| format!("Lỗi khi liên kết dữ liệu: {}", e))?;

    let mut seen = HashSet::new();
    let keys: Vec<Vec<FieldValue>> = chunk
        .iter()
        .filter(|u| resolved.contains_key(&u.code))
        .filter(|u| seen.insert(compose_key(&u.key_parts)))
        .map(|u| u.key_parts.clone())
        .collect();
    let ids = if keys.is_empty() {
        HashMap::new()
    } else {
        store
            .find_existing(entity, &keys)
            .map_err(|e| format!("Lỗi khi liên kết dữ liệu: {}", e))?
    };

    for u in chunk {
        let Some(target) = resolved.get(&u.code) else {
            result.warnings.push(unresolved(reference, u));
            continue;
        };
        let Some(&id) = ids.get(&compose_key(&u.key_parts)) else {
            continue;
        };
        let mut link = NormalizedRecord::new();
        link.insert(reference.id_field.to_string(), FieldValue::Int(target.id));
        for ((_, field), value) in reference.copy.iter().zip(&target.copied) {
            link.insert(field.to_string(), value.clone());
        }
        if let Err(e) = store.update_one(entity, id, &link) {
            warn!(row = u.row, id, error = %e, "reference link failed");
            result.warnings.push(RowError {
                row: u.row,
                message: format!("Lỗi khi liên kết dữ liệu: {}", e),
            });
        }
    }
    Ok(())
}

/// Classifies every row without writing anything.
pub fn preview<S: RecordStore + ?Sized>(
    store: &mut S,
    entity: &EntitySpec,
    records: &[CandidateRecord],
    options: &UpsertOptions,
) -> Result<Vec<RowPlan>, ReconcileError> {
    let mut plans = Vec::with_capacity(records.len());
    if records.is_empty() {
        return Ok(plans);
    }
    store
        .ensure_ready(entity)
        .map_err(ReconcileError::StoreUnavailable)?;
    for chunk in records.chunks(options.chunk_size.max(1)) {
        match plan_chunk(store, entity, chunk) {
            Ok(mut chunk_plans) => plans.append(&mut chunk_plans),
            Err(message) => plans.extend(chunk.iter().map(|_| RowPlan::Invalid(message.clone()))),
        }
    }
    Ok(plans)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub key: Vec<String>,
    pub rows: Vec<usize>,
}

/// Groups rows sharing a natural key. Rows whose key fields are blank or
/// cannot be coerced are left out. Advisory only.
pub fn find_duplicates(entity: &EntitySpec, records: &[CandidateRecord]) -> Vec<DuplicateGroup> {
    let mut groups: Vec<DuplicateGroup> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    'rows: for (row, record) in records.iter().enumerate() {
        let mut parts = Vec::with_capacity(entity.natural_key.len());
        for name in entity.natural_key {
            let Some(field) = entity.field(name) else {
                continue 'rows;
            };
            match coerce_field(field.kind, record.get(*name)) {
                Coerced::Value(v) => parts.push(v),
                Coerced::Absent | Coerced::Invalid => continue 'rows,
            }
        }
        let key = compose_key(&parts);
        match by_key.get(&key) {
            Some(&i) => groups[i].rows.push(row),
            None => {
                by_key.insert(key, groups.len());
                groups.push(DuplicateGroup {
                    key: parts.iter().map(FieldValue::key_part).collect(),
                    rows: vec![row],
                });
            }
        }
    }
    groups.retain(|g| g.rows.len() > 1);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{CHAM_OLE, DIEM_CONG_TRU, KY_THI, PHONG_BAN, PHUONG_XA_SNN};
    use crate::store::{InsertReport, SqliteStore};
    use serde_json::json;

    #[derive(Default)]
    struct FakeStore {
        rows: Vec<(i64, NormalizedRecord)>,
        references: HashMap<String, ResolvedReference>,
        unavailable: bool,
        lookup_calls: usize,
        fail_lookup_on_call: Option<usize>,
        resolve_calls: usize,
        fail_resolve_on_call: Option<usize>,
        fail_bulk_insert_on_call: Option<usize>,
        insert_calls: usize,
        reject_note: Option<&'static str>,
        fail_update_ids: HashSet<i64>,
    }

    impl FakeStore {
        fn record_for(&self, id: i64) -> &NormalizedRecord {
            &self.rows.iter().find(|(rid, _)| *rid == id).expect("row").1
        }
    }

    impl RecordStore for FakeStore {
        fn ensure_ready(&mut self, _entity: &EntitySpec) -> Result<(), StoreError> {
            if self.unavailable {
                return Err(StoreError::new("store_unavailable", "connection refused"));
            }
            Ok(())
        }

        fn find_existing(
            &mut self,
            entity: &EntitySpec,
            keys: &[Vec<FieldValue>],
        ) -> Result<HashMap<String, i64>, StoreError> {
            let call = self.lookup_calls;
            self.lookup_calls += 1;
            if self.fail_lookup_on_call == Some(call) {
                return Err(StoreError::new("db_error", "timeout"));
            }
            let wanted: HashSet<String> = keys.iter().map(|k| compose_key(k)).collect();
            let mut found = HashMap::new();
            for (id, record) in &self.rows {
                let parts: Vec<FieldValue> = entity
                    .natural_key
                    .iter()
                    .map(|k| record.get(*k).cloned().unwrap_or(FieldValue::Null))
                    .collect();
                let key = compose_key(&parts);
                if wanted.contains(&key) {
                    found.insert(key, *id);
                }
            }
            Ok(found)
        }

        fn resolve_references(
            &mut self,
            _reference: &ReferenceSpec,
            codes: &[String],
        ) -> Result<HashMap<String, ResolvedReference>, StoreError> {
            let call = self.resolve_calls;
            self.resolve_calls += 1;
            if self.fail_resolve_on_call == Some(call) {
                return Err(StoreError::new("db_error", "no such table"));
            }
            Ok(codes
                .iter()
                .filter_map(|c| self.references.get(c).map(|r| (c.clone(), r.clone())))
                .collect())
        }

        fn insert_many(
            &mut self,
            _entity: &EntitySpec,
            records: &[NormalizedRecord],
        ) -> Result<InsertReport, StoreError> {
            let call = self.insert_calls;
            self.insert_calls += 1;
            if self.fail_bulk_insert_on_call == Some(call) {
                return Err(StoreError::new("db_error", "payload too large"));
            }
            let mut report = InsertReport::default();
            for (i, record) in records.iter().enumerate() {
                let rejected = self.reject_note.is_some_and(|note| {
                    record.get("ghi_chu") == Some(&FieldValue::Text(note.to_string()))
                });
                if rejected {
                    report.failed.push((i, "violates check".to_string()));
                    continue;
                }
                let id = self.rows.len() as i64 + 1;
                self.rows.push((id, record.clone()));
            }
            Ok(report)
        }

        fn update_one(
            &mut self,
            _entity: &EntitySpec,
            id: i64,
            record: &NormalizedRecord,
        ) -> Result<(), StoreError> {
            if self.fail_update_ids.contains(&id) {
                return Err(StoreError::new("db_error", "row locked"));
            }
            let Some((_, existing)) = self.rows.iter_mut().find(|(rid, _)| *rid == id) else {
                return Err(StoreError::new("not_found", "Không tìm thấy bản ghi"));
            };
            for (k, v) in record {
                existing.insert(k.clone(), v.clone());
            }
            Ok(())
        }
    }

    fn row(pairs: &[(&str, &str)]) -> CandidateRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), RawValue::Text(v.to_string())))
            .collect()
    }

    fn upsert(store: &mut FakeStore, entity: &EntitySpec, rows: &[CandidateRecord]) -> BatchResult {
        batch_upsert(store, entity, rows, Some(7), &UpsertOptions::default()).expect("upsert")
    }

    fn err(row: usize, message: &str) -> RowError {
        RowError {
            row,
            message: message.to_string(),
        }
    }

    fn ole_rows(n: usize) -> Vec<CandidateRecord> {
        (0..n)
            .map(|i| {
                let mut r = CandidateRecord::new();
                r.insert("nhan_vien_id".into(), RawValue::Int(i as i64 + 1));
                r.insert("nam".into(), RawValue::Int(2024));
                r.insert("thang".into(), RawValue::Int(5));
                r.insert("ole".into(), RawValue::Float(8.5));
                r
            })
            .collect()
    }

    #[test]
    fn exam_import_inserts_then_updates_on_rerun() {
        let rows = vec![
            row(&[("ten_ky_thi", "Kỳ thi A"), ("ngay", "2024-01-01"), ("so_cau_hoi", "20")]),
            row(&[("ten_ky_thi", ""), ("ngay", "2024-01-02")]),
        ];
        let mut store = FakeStore::default();

        let first = upsert(&mut store, &KY_THI, &rows);
        assert_eq!(first.inserted, 1);
        assert_eq!(first.updated, 0);
        assert_eq!(first.errors, vec![err(1, "Tên kỳ thi là bắt buộc")]);

        let saved = store.record_for(1);
        assert_eq!(saved["so_cau_hoi"], FieldValue::Int(20));
        assert_eq!(saved["so_phut_lam_bai"], FieldValue::Int(15));
        assert_eq!(saved["trang_thai"], FieldValue::Text("Mở".into()));
        assert_eq!(saved["chuyen_de_ids"], FieldValue::IdList(vec![]));
        assert_eq!(saved["chuc_vu_ids"], FieldValue::Null);
        assert_eq!(saved["nguoi_tao_id"], FieldValue::Int(7));
        assert!(!saved.contains_key("tg_cap_nhat"));

        let second = batch_upsert(&mut store, &KY_THI, &rows, Some(9), &UpsertOptions::default())
            .expect("upsert");
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);
        assert_eq!(second.errors, vec![err(1, "Tên kỳ thi là bắt buộc")]);
        assert_eq!(store.rows.len(), 1);

        let saved = store.record_for(1);
        assert_eq!(saved["nguoi_tao_id"], FieldValue::Int(7));
        assert!(matches!(saved.get("tg_cap_nhat"), Some(FieldValue::Text(_))));
    }

    #[test]
    fn missing_actor_fails_the_whole_call() {
        let rows = vec![row(&[("ten_ky_thi", "A"), ("ngay", "2024-01-01")])];
        let mut store = FakeStore::default();
        for actor in [None, Some(0)] {
            let e = batch_upsert(&mut store, &KY_THI, &rows, actor, &UpsertOptions::default())
                .expect_err("actor required");
            assert_eq!(e, ReconcileError::MissingActor { entity: "ky_thi" });
            assert_eq!(
                e.to_string(),
                "Không tìm thấy thông tin nhân viên khi nhập ky_thi. Vui lòng đăng nhập lại."
            );
        }
        assert!(store.rows.is_empty());
        assert_eq!(store.lookup_calls, 0);
    }

    #[test]
    fn optional_actor_may_be_absent() {
        let rows = vec![row(&[("nhan_vien_id", "3"), ("ngay", "2024-02-01"), ("diem", "x")])];
        let mut store = FakeStore::default();
        let options = UpsertOptions::default();
        let result =
            batch_upsert(&mut store, &DIEM_CONG_TRU, &rows, None, &options).expect("upsert");
        assert_eq!(result.inserted, 1);
        let saved = store.record_for(1);
        assert_eq!(saved["nguoi_tao_id"], FieldValue::Null);
        assert_eq!(saved["diem"], FieldValue::Float(0.0));
        assert_eq!(saved["tien"], FieldValue::Float(0.0));
    }

    #[test]
    fn unavailable_store_fails_before_any_sub_batch() {
        let mut store = FakeStore {
            unavailable: true,
            ..FakeStore::default()
        };
        let e = upsert_err(&mut store, &ole_rows(3));
        assert!(matches!(e, ReconcileError::StoreUnavailable(_)));
        assert_eq!(
            e.to_string(),
            "Không thể kết nối cơ sở dữ liệu: connection refused"
        );
        assert_eq!(store.lookup_calls, 0);
    }

    fn upsert_err(store: &mut FakeStore, rows: &[CandidateRecord]) -> ReconcileError {
        batch_upsert(store, &CHAM_OLE, rows, None, &UpsertOptions::default())
            .expect_err("should fail")
    }

    #[test]
    fn lookup_failure_skips_only_its_sub_batch() {
        let mut store = FakeStore {
            fail_lookup_on_call: Some(1),
            ..FakeStore::default()
        };
        let result = upsert(&mut store, &CHAM_OLE, &ole_rows(2500));
        assert_eq!(store.lookup_calls, 3);
        assert_eq!(result.inserted, 1500);
        assert_eq!(result.updated, 0);
        assert_eq!(
            result.errors,
            vec![err(1000, "Lỗi khi kiểm tra dữ liệu tồn tại: timeout")]
        );
        assert_eq!(store.insert_calls, 2);
    }

    #[test]
    fn bulk_insert_failure_is_one_error_at_the_sub_batch_start() {
        let mut store = FakeStore {
            fail_bulk_insert_on_call: Some(0),
            ..FakeStore::default()
        };
        let options = UpsertOptions { chunk_size: 2 };
        let result = batch_upsert(&mut store, &CHAM_OLE, &ole_rows(4), None, &options)
            .expect("upsert");
        assert_eq!(result.inserted, 2);
        assert_eq!(result.errors, vec![err(0, "Lỗi khi thêm mới: payload too large")]);
    }

    #[test]
    fn rejected_insert_rows_are_reported_individually() {
        let mut rows = ole_rows(3);
        rows[1].insert("ghi_chu".into(), RawValue::Text("bad".into()));
        let mut store = FakeStore {
            reject_note: Some("bad"),
            ..FakeStore::default()
        };
        let result = upsert(&mut store, &CHAM_OLE, &rows);
        assert_eq!(result.inserted, 2);
        assert_eq!(result.errors, vec![err(1, "Lỗi khi thêm mới: violates check")]);
    }

    #[test]
    fn update_failure_does_not_affect_other_updates() {
        let mut store = FakeStore::default();
        upsert(&mut store, &CHAM_OLE, &ole_rows(3));
        store.fail_update_ids.insert(2);

        let result = upsert(&mut store, &CHAM_OLE, &ole_rows(3));
        assert_eq!(result.inserted, 0);
        assert_eq!(result.updated, 2);
        assert_eq!(result.errors, vec![err(1, "Lỗi khi cập nhật ID 2: row locked")]);
    }

    #[test]
    fn same_batch_duplicates_collapse_with_last_row_winning() {
        let rows = vec![
            row(&[("ten_ky_thi", "A"), ("ngay", "2024-01-01"), ("ghi_chu", "first")]),
            row(&[("ten_ky_thi", "B"), ("ngay", "2024-01-01")]),
            row(&[("ten_ky_thi", "A"), ("ngay", "01/01/2024"), ("ghi_chu", "second")]),
        ];
        let mut store = FakeStore::default();
        let result = upsert(&mut store, &KY_THI, &rows);
        assert_eq!(result.inserted, 2);
        assert_eq!(result.updated, 1);
        assert!(result.errors.is_empty());
        assert_eq!(store.rows.len(), 2);
        assert_eq!(store.record_for(1)["ghi_chu"], FieldValue::Text("second".into()));

        let groups = find_duplicates(&KY_THI, &rows);
        assert_eq!(
            groups,
            vec![DuplicateGroup {
                key: vec!["A".into(), "2024-01-01".into()],
                rows: vec![0, 2],
            }]
        );
    }

    #[test]
    fn duplicate_detection_skips_rows_without_a_key() {
        let rows = vec![
            row(&[("ma_phong_ban", "")]),
            row(&[("ma_phong_ban", "")]),
            row(&[("ma_phong_ban", "KD")]),
        ];
        assert!(find_duplicates(&PHONG_BAN, &rows).is_empty());
    }

    #[test]
    fn coercion_failures_use_defaults_or_report_the_field() {
        let rows = vec![
            row(&[
                ("ten_ky_thi", "A"),
                ("ngay", "2024-01-01"),
                ("so_cau_hoi", "0"),
                ("chuyen_de_ids", "3, 7, abc, 9"),
            ]),
            row(&[("ten_ky_thi", "B"), ("ngay", "not a date")]),
        ];
        let mut store = FakeStore::default();
        let result = upsert(&mut store, &KY_THI, &rows);
        assert_eq!(result.inserted, 1);
        assert_eq!(result.errors, vec![err(1, "Ngày không hợp lệ")]);
        let saved = store.record_for(1);
        assert_eq!(saved["so_cau_hoi"], FieldValue::Int(10));
        assert_eq!(saved["chuyen_de_ids"], FieldValue::IdList(vec![3, 7, 9]));

        let ole = vec![row(&[("nhan_vien_id", "1"), ("nam", "2024"), ("thang", "13")])];
        let result = upsert(&mut store, &CHAM_OLE, &ole);
        assert_eq!(result.errors, vec![err(0, "Tháng phải từ 1 đến 12")]);
    }

    #[test]
    fn only_the_first_missing_required_field_is_reported() {
        let rows = vec![row(&[("ma_tinh_thanh", "01")])];
        let mut store = FakeStore::default();
        let result = upsert(&mut store, &crate::entities::TINH_THANH_SSN, &rows);
        assert_eq!(result.errors, vec![err(0, "Tên tỉnh thành là bắt buộc")]);
    }

    #[test]
    fn key_values_containing_the_separator_are_rejected() {
        let name = format!("A{}B", KEY_SEPARATOR);
        let rows = vec![row(&[("ten_ky_thi", name.as_str()), ("ngay", "2024-01-01")])];
        let mut store = FakeStore::default();
        let result = upsert(&mut store, &KY_THI, &rows);
        assert_eq!(result.errors, vec![err(0, "Tên kỳ thi chứa ký tự không hợp lệ")]);
        assert_eq!(store.lookup_calls, 0);
    }

    #[test]
    fn required_reference_resolves_or_fails_the_row() {
        let mut store = FakeStore::default();
        store.references.insert(
            "01".into(),
            ResolvedReference {
                id: 4,
                copied: vec![FieldValue::Text("Hà Nội".into())],
            },
        );
        let rows = vec![
            row(&[
                ("ma_tinh_thanh", "01"),
                ("ma_phuong_xa", "00004"),
                ("ten_phuong_xa", "Ba Đình"),
            ]),
            row(&[("ma_tinh_thanh", "99"), ("ma_phuong_xa", "00007"), ("ten_phuong_xa", "X")]),
        ];
        let result = upsert(&mut store, &PHUONG_XA_SNN, &rows);
        assert_eq!(result.inserted, 1);
        assert_eq!(
            result.errors,
            vec![err(1, "Không tìm thấy tỉnh thành với mã: 99")]
        );
        let saved = store.record_for(1);
        assert_eq!(saved["tinh_thanh_id"], FieldValue::Int(4));
        assert_eq!(saved["ten_tinh_thanh"], FieldValue::Text("Hà Nội".into()));
    }

    #[test]
    fn optional_reference_leaves_the_parent_empty() {
        let rows = vec![row(&[
            ("tt", "1"),
            ("ma_phong_ban", "KD"),
            ("ten_phong_ban", "Kinh doanh"),
            ("cap_do", "Phòng"),
            ("truc_thuoc_ma", "GD"),
        ])];
        let mut store = FakeStore::default();
        let result = upsert(&mut store, &PHONG_BAN, &rows);
        assert_eq!(result.inserted, 1);
        assert!(result.errors.is_empty());
        assert_eq!(
            result.warnings,
            vec![err(0, "Không tìm thấy phòng ban trực thuộc với mã: GD")]
        );
        assert_eq!(store.resolve_calls, 2);
        let saved = store.record_for(1);
        assert_eq!(saved["truc_thuoc_id"], FieldValue::Null);
        assert_eq!(saved["truc_thuoc_phong_ban"], FieldValue::Null);
    }

    fn department(tt: &str, code: &str, name: &str, parent: &str) -> CandidateRecord {
        let mut r = row(&[
            ("tt", tt),
            ("ma_phong_ban", code),
            ("ten_phong_ban", name),
            ("cap_do", "Phòng"),
        ]);
        if !parent.is_empty() {
            r.insert("truc_thuoc_ma".into(), RawValue::Text(parent.into()));
        }
        r
    }

    #[test]
    fn departments_link_to_parents_from_the_same_import() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        crate::db::migrate(&conn).expect("migrate");
        let mut store = SqliteStore::new(&conn);
        // Child before parent, each in its own sub-batch.
        let rows = vec![
            department("2", "KD", "Kinh doanh", "GD"),
            department("1", "GD", "Ban Giám đốc", ""),
            department("3", "KT", "Kỹ thuật", "ZZ"),
        ];
        let options = UpsertOptions { chunk_size: 1 };

        let first = batch_upsert(&mut store, &PHONG_BAN, &rows, None, &options).expect("first");
        assert_eq!((first.inserted, first.updated), (3, 0));
        assert!(first.errors.is_empty());
        assert_eq!(
            first.warnings,
            vec![err(2, "Không tìm thấy phòng ban trực thuộc với mã: ZZ")]
        );
        let linked = |store: &SqliteStore<'_>| {
            let kd = store.get(&PHONG_BAN, 1).expect("get").expect("KD");
            (kd["truc_thuoc_id"].clone(), kd["truc_thuoc_phong_ban"].clone())
        };
        let after_first = linked(&store);
        assert_eq!(after_first, (json!(2), json!("Ban Giám đốc")));

        let second = batch_upsert(&mut store, &PHONG_BAN, &rows, None, &options).expect("second");
        assert_eq!((second.inserted, second.updated), (0, 3));
        assert_eq!(second.warnings, first.warnings);
        assert_eq!(linked(&store), after_first);
    }

    #[test]
    fn reference_resolution_failure_skips_only_its_sub_batch() {
        let mut store = FakeStore {
            fail_resolve_on_call: Some(1),
            ..FakeStore::default()
        };
        store.references.insert(
            "01".into(),
            ResolvedReference {
                id: 4,
                copied: vec![FieldValue::Text("Hà Nội".into())],
            },
        );
        let rows: Vec<CandidateRecord> = (0..5)
            .map(|i| {
                let code = format!("{:05}", i);
                row(&[
                    ("ma_tinh_thanh", "01"),
                    ("ma_phuong_xa", code.as_str()),
                    ("ten_phuong_xa", "Phường"),
                ])
            })
            .collect();
        let options = UpsertOptions { chunk_size: 2 };
        let result =
            batch_upsert(&mut store, &PHUONG_XA_SNN, &rows, None, &options).expect("upsert");
        assert_eq!(store.resolve_calls, 3);
        assert_eq!(store.lookup_calls, 2);
        assert_eq!(result.inserted, 3);
        assert_eq!(
            result.errors,
            vec![err(2, "Lỗi khi tra cứu dữ liệu liên kết: no such table")]
        );
    }

    #[test]
    fn rejected_merged_insert_fails_every_row_of_the_key() {
        let mut rows = ole_rows(3);
        rows[2] = rows[0].clone();
        rows[2].insert("ghi_chu".into(), RawValue::Text("bad".into()));
        let mut store = FakeStore {
            reject_note: Some("bad"),
            ..FakeStore::default()
        };
        let result = upsert(&mut store, &CHAM_OLE, &rows);
        assert_eq!((result.inserted, result.updated), (1, 0));
        assert_eq!(
            result.errors,
            vec![
                err(0, "Lỗi khi thêm mới: violates check"),
                err(2, "Lỗi khi thêm mới: violates check"),
            ]
        );
        assert_eq!(store.rows.len(), 1);
    }

    #[test]
    fn preview_classifies_without_writing() {
        let mut store = FakeStore::default();
        upsert(&mut store, &CHAM_OLE, &ole_rows(1));
        let mut rows = ole_rows(2);
        rows.push(row(&[("nam", "2024")]));

        let plans =
            preview(&mut store, &CHAM_OLE, &rows, &UpsertOptions::default()).expect("preview");
        assert!(matches!(plans[0], RowPlan::Update { id: 1, .. }));
        assert!(matches!(plans[1], RowPlan::Insert { .. }));
        assert_eq!(
            plans[2],
            RowPlan::Invalid("Mã nhân viên là bắt buộc và phải là số".into())
        );
        assert_eq!(store.rows.len(), 1);
        assert_eq!(store.insert_calls, 1);
    }

    #[test]
    fn every_classified_row_has_exactly_one_outcome() {
        let mut rows = ole_rows(10);
        rows[3].insert("thang".into(), RawValue::Text("abc".into()));
        rows[6] = rows[5].clone();
        let mut store = FakeStore::default();
        upsert(&mut store, &CHAM_OLE, &rows[..2]);

        let result = upsert(&mut store, &CHAM_OLE, &rows);
        assert_eq!(result.inserted + result.updated + result.errors.len(), rows.len());
        assert_eq!(result.updated, 3);
        assert_eq!(result.errors, vec![err(3, "Tháng phải từ 1 đến 12")]);
    }

    #[test]
    fn empty_input_touches_nothing() {
        let mut store = FakeStore {
            unavailable: true,
            ..FakeStore::default()
        };
        let result = batch_upsert(&mut store, &CHAM_OLE, &[], None, &UpsertOptions::default())
            .expect("empty");
        assert_eq!(result, BatchResult::default());
    }
}
