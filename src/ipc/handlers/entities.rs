use crate::entities::{self, ENTITIES};
use crate::ipc::helpers::{get_entity, get_id_list, get_required_i64, reply, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use serde_json::{json, Value};
use tracing::info;

const DEFAULT_PAGE: i64 = 100;
const MAX_PAGE: i64 = 1_000;

fn entities_kinds() -> Value {
    let kinds: Vec<Value> = ENTITIES.iter().map(|e| entities::describe(e)).collect();
    json!({ "entities": kinds })
}

fn entities_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = state.conn()?;
    let entity = get_entity(params)?;
    let limit = params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_PAGE)
        .clamp(1, MAX_PAGE);
    let offset = params
        .get("offset")
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
        .max(0);
    let (total, rows) = SqliteStore::new(conn)
        .list(entity, limit, offset)
        .map_err(|e| HandlerErr::store("db_query_failed", e))?;
    Ok(json!({ "total": total, "rows": rows }))
}

fn entities_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = state.conn()?;
    let entity = get_entity(params)?;
    let id = get_required_i64(params, "id")?;
    SqliteStore::new(conn)
        .get(entity, id)
        .map_err(|e| HandlerErr::store("db_query_failed", e))?
        .map(|row| json!({ "row": row }))
        .ok_or_else(|| HandlerErr::new("not_found", format!("{} {} not found", entity.name, id)))
}

fn entities_delete(state: &AppState, ids: &[i64], params: &Value) -> Result<Value, HandlerErr> {
    let conn = state.conn()?;
    let entity = get_entity(params)?;
    let deleted = SqliteStore::new(conn)
        .delete_many(entity, ids)
        .map_err(|e| HandlerErr::store("db_delete_failed", e))?;
    info!(entity = entity.name, requested = ids.len(), deleted, "records deleted");
    Ok(json!({ "deleted": deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "entities.kinds" => Ok(entities_kinds()),
        "entities.list" => entities_list(state, &req.params),
        "entities.get" => entities_get(state, &req.params),
        "entities.delete" => get_required_i64(&req.params, "id")
            .and_then(|id| entities_delete(state, &[id], &req.params)),
        "entities.batchDelete" => get_id_list(&req.params, "ids")
            .and_then(|ids| entities_delete(state, &ids, &req.params)),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
