use crate::db;
use crate::ipc::helpers::{reply, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::DEFAULT_CHUNK_SIZE;
use serde_json::{json, Map, Value};

const DEFAULT_MAX_ROWS: i64 = 50_000;

#[derive(Clone, Copy)]
enum SetupSection {
    Import,
}

impl SetupSection {
    const ALL: [SetupSection; 1] = [SetupSection::Import];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "import" => Some(Self::Import),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Import => "import",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Import => "setup.import",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Import => json!({
            "chunkSize": DEFAULT_CHUNK_SIZE,
            "maxRows": DEFAULT_MAX_ROWS
        }),
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Import => match k.as_str() {
                "chunkSize" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 5_000)?));
                }
                "maxRows" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 200_000)?));
                }
                _ => return Err(format!("unknown import field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // A stale or hand-edited value falls back to defaults field by field.
            for (k, v) in saved_obj {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &single);
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImportSettings {
    pub chunk_size: usize,
    pub max_rows: usize,
}

pub fn load_import_settings(conn: &rusqlite::Connection) -> anyhow::Result<ImportSettings> {
    let section = load_section(conn, SetupSection::Import)?;
    let read = |key: &str, fallback: i64| {
        section
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(fallback)
    };
    Ok(ImportSettings {
        chunk_size: read("chunkSize", DEFAULT_CHUNK_SIZE as i64) as usize,
        max_rows: read("maxRows", DEFAULT_MAX_ROWS) as usize,
    })
}

fn setup_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = state.conn()?;
    let load = |section: SetupSection| {
        load_section(conn, section).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
    };
    match params.get("section").and_then(|v| v.as_str()) {
        Some(raw) => {
            let section = SetupSection::parse(raw)
                .ok_or_else(|| HandlerErr::new("bad_params", "unknown section"))?;
            load(section)
        }
        None => {
            let mut all = Map::new();
            for section in SetupSection::ALL {
                all.insert(section.name().to_string(), load(section)?);
            }
            Ok(Value::Object(all))
        }
    }
}

fn setup_update(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = state.conn()?;
    let section_raw = params
        .get("section")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing section"))?;
    let section = SetupSection::parse(section_raw)
        .ok_or_else(|| HandlerErr::new("bad_params", "unknown section"))?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::new("bad_params", "patch must be an object"))?;

    let mut current = load_section(conn, section)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    merge_section_patch(section, &mut current, patch)
        .map_err(|msg| HandlerErr::new("bad_params", msg))?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(current)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(reply(&req.id, setup_get(state, &req.params))),
        "setup.update" => Some(reply(&req.id, setup_update(state, &req.params))),
        _ => None,
    }
}
