//! Spreadsheet import methods: duplicate check, dry-run preview and the
//! batch upsert itself.

use std::collections::HashMap;

use crate::entities::EntitySpec;
use crate::ipc::handlers::setup::{load_import_settings, ImportSettings};
use crate::ipc::helpers::{get_entity, get_optional_i64, get_rows, reply, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{
    self, BatchResult, CandidateRecord, DuplicateGroup, RowError, RowPlan, UpsertOptions,
};
use crate::store::{record_json, SqliteStore};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{info, info_span, warn};
use uuid::Uuid;

struct ImportInput {
    entity: &'static EntitySpec,
    rows: Vec<CandidateRecord>,
    settings: ImportSettings,
}

fn read_input(conn: &Connection, params: &Value) -> Result<ImportInput, HandlerErr> {
    let entity = get_entity(params)?;
    let rows = get_rows(params)?;
    let settings = load_import_settings(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if rows.len() > settings.max_rows {
        return Err(HandlerErr::new(
            "too_many_rows",
            format!("{} rows exceed the import limit of {}", rows.len(), settings.max_rows),
        )
        .with_details(json!({ "rows": rows.len(), "maxRows": settings.max_rows })));
    }
    Ok(ImportInput {
        entity,
        rows,
        settings,
    })
}

fn duplicates_json(groups: &[DuplicateGroup]) -> Value {
    Value::Array(
        groups
            .iter()
            .map(|g| {
                json!({
                    "key": g.key,
                    "rowNumbers": g.rows.iter().map(|r| r + 1).collect::<Vec<_>>(),
                })
            })
            .collect(),
    )
}

/// Groups row messages under 1-based row numbers, keeping their order.
fn group_by_row(errors: &[RowError], field: &str) -> Vec<Value> {
    let mut grouped: Vec<(usize, Vec<&str>)> = Vec::new();
    for e in errors {
        match grouped.last_mut() {
            Some((row, messages)) if *row == e.row => messages.push(e.message.as_str()),
            _ => grouped.push((e.row, vec![e.message.as_str()])),
        }
    }
    grouped
        .into_iter()
        .map(|(row, messages)| {
            let mut entry = json!({ "rowNumber": row + 1 });
            entry[field] = json!(messages);
            entry
        })
        .collect()
}

fn batch_result_json(result: &BatchResult) -> Value {
    let errors = group_by_row(&result.errors, "errors");
    json!({
        "success": errors.is_empty(),
        "inserted": result.inserted,
        "updated": result.updated,
        "failed": errors.len(),
        "errors": errors,
        "warnings": group_by_row(&result.warnings, "warnings"),
    })
}

/// Shape used when the whole call failed before any row was written.
fn failed_batch_json(row_count: usize, message: &str) -> Value {
    let errors: Vec<Value> = (0..row_count)
        .map(|row| json!({ "rowNumber": row + 1, "errors": [message] }))
        .collect();
    json!({
        "success": false,
        "inserted": 0,
        "updated": 0,
        "failed": row_count,
        "errors": errors,
        "warnings": [],
        "message": message,
    })
}

/// Rows of a preview with their planned action. A later row repeating the
/// key of an earlier insert is written over it, so it is reported as an
/// update of that row, the way the import counts it.
fn preview_rows_json(plans: &[RowPlan]) -> (Vec<Value>, Value) {
    let (mut inserts, mut updates, mut invalid) = (0, 0, 0);
    let mut first_insert: HashMap<&str, usize> = HashMap::new();
    let rows: Vec<Value> = plans
        .iter()
        .enumerate()
        .map(|(i, plan)| match plan {
            RowPlan::Invalid(message) => {
                invalid += 1;
                json!({ "rowNumber": i + 1, "action": "invalid", "errors": [message] })
            }
            RowPlan::Insert { key, record } => match first_insert.get(key.as_str()) {
                Some(&first) => {
                    updates += 1;
                    json!({
                        "rowNumber": i + 1,
                        "action": "update",
                        "mergedInto": first + 1,
                        "record": record_json(record),
                    })
                }
                None => {
                    inserts += 1;
                    first_insert.insert(key.as_str(), i);
                    json!({
                        "rowNumber": i + 1,
                        "action": "insert",
                        "record": record_json(record),
                    })
                }
            },
            RowPlan::Update { id, record } => {
                updates += 1;
                json!({
                    "rowNumber": i + 1,
                    "action": "update",
                    "id": id,
                    "record": record_json(record),
                })
            }
        })
        .collect();
    let summary = json!({ "insert": inserts, "update": updates, "invalid": invalid });
    (rows, summary)
}

fn import_check_duplicates(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = state.conn()?;
    let input = read_input(conn, params)?;
    let groups = reconcile::find_duplicates(input.entity, &input.rows);
    Ok(json!({ "duplicates": duplicates_json(&groups) }))
}

fn import_preview(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = state.conn()?;
    let input = read_input(conn, params)?;
    let mut store = SqliteStore::new(conn);
    let options = UpsertOptions {
        chunk_size: input.settings.chunk_size,
    };
    let plans = reconcile::preview(&mut store, input.entity, &input.rows, &options)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let (rows, summary) = preview_rows_json(&plans);
    let groups = reconcile::find_duplicates(input.entity, &input.rows);
    Ok(json!({
        "rows": rows,
        "summary": summary,
        "duplicates": duplicates_json(&groups),
    }))
}

fn import_batch_upsert(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = state.conn()?;
    let input = read_input(conn, params)?;
    let actor = get_optional_i64(params, "actorId")?;

    let import_id = Uuid::new_v4().to_string();
    let span = info_span!(
        "batch_upsert",
        entity = input.entity.name,
        import_id = %import_id,
        rows = input.rows.len()
    );
    let _enter = span.enter();

    let groups = reconcile::find_duplicates(input.entity, &input.rows);
    if !groups.is_empty() {
        info!(groups = groups.len(), "rows share natural keys; last row wins");
    }

    let mut store = SqliteStore::new(conn);
    let options = UpsertOptions {
        chunk_size: input.settings.chunk_size,
    };
    let outcome =
        reconcile::batch_upsert(&mut store, input.entity, &input.rows, actor, &options);
    let mut body = match outcome {
        Ok(result) => batch_result_json(&result),
        Err(e) => {
            warn!(error = %e, "import aborted");
            failed_batch_json(input.rows.len(), &e.to_string())
        }
    };
    body["importId"] = Value::String(import_id);
    body["duplicates"] = duplicates_json(&groups);
    Ok(body)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "import.checkDuplicates" => import_check_duplicates(state, &req.params),
        "import.preview" => import_preview(state, &req.params),
        "import.batchUpsert" => import_batch_upsert(state, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
