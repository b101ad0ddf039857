use serde::Deserialize;
use serde_json::{json, Value};

use crate::entities::{self, EntitySpec};
use crate::reconcile::CandidateRecord;
use crate::store::StoreError;

pub fn ok(id: &str, result: Value) -> Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Wraps a store failure under the handler's own code, keeping the
    /// store's classification in the details.
    pub fn store(code: &'static str, e: StoreError) -> Self {
        Self::new(code, e.message).with_details(json!({ "cause": e.code }))
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn reply(id: &str, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn get_required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be an integer", key)))
}

pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be an integer", key))),
    }
}

pub fn get_entity(params: &Value) -> Result<&'static EntitySpec, HandlerErr> {
    let name = get_required_str(params, "entity")?;
    entities::find(name).ok_or_else(|| {
        let known: Vec<&str> = entities::ENTITIES.iter().map(|e| e.name).collect();
        HandlerErr::new("bad_params", format!("unknown entity: {}", name))
            .with_details(json!({ "known": known }))
    })
}

/// Reads `params.rows` as spreadsheet rows. Cells must be scalars or lists;
/// nested objects are rejected here so nothing downstream sees them.
pub fn get_rows(params: &Value) -> Result<Vec<CandidateRecord>, HandlerErr> {
    let rows = params
        .get("rows")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::new("bad_params", "rows must be an array"))?;
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            if !row.is_object() {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("rows[{}] must be an object", i),
                ));
            }
            CandidateRecord::deserialize(row).map_err(|e| {
                HandlerErr::new("bad_params", format!("rows[{}]: {}", i, e))
                    .with_details(json!({ "rowNumber": i + 1 }))
            })
        })
        .collect()
}

pub fn get_id_list(params: &Value, key: &str) -> Result<Vec<i64>, HandlerErr> {
    let arr = params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be an array", key)))?;
    arr.iter()
        .map(|v| {
            v.as_i64().ok_or_else(|| {
                HandlerErr::new("bad_params", format!("{} must contain integers", key))
            })
        })
        .collect()
}
