use chrono::{Duration, NaiveDate};
use serde::Deserialize;

/// One spreadsheet cell as handed over by the UI after parsing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<RawValue>),
}

/// A typed value ready to be written to a column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    IdList(Vec<i64>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Rendering used when composing natural-key strings.
    pub fn key_part(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Float(v) => v.to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::IdList(ids) => ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Int(v) => serde_json::Value::from(*v),
            FieldValue::Float(v) => serde_json::Value::from(*v),
            FieldValue::Text(s) => serde_json::Value::String(s.clone()),
            FieldValue::IdList(ids) => serde_json::Value::from(ids.clone()),
        }
    }
}

pub fn is_blank(raw: Option<&RawValue>) -> bool {
    match raw {
        None | Some(RawValue::Empty) => true,
        Some(RawValue::Text(s)) => s.trim().is_empty(),
        Some(RawValue::List(items)) => items.iter().all(|v| is_blank(Some(v))),
        Some(RawValue::Float(v)) => !v.is_finite(),
        Some(RawValue::Bool(_)) | Some(RawValue::Int(_)) => false,
    }
}

pub fn text(raw: &RawValue) -> Option<String> {
    let s = match raw {
        RawValue::Empty => return None,
        RawValue::Bool(b) => b.to_string(),
        RawValue::Int(v) => v.to_string(),
        RawValue::Float(v) => {
            if !v.is_finite() {
                return None;
            }
            // Spreadsheet cells holding codes often arrive as 12.0.
            if v.fract() == 0.0 && v.abs() < 1e15 {
                (*v as i64).to_string()
            } else {
                v.to_string()
            }
        }
        RawValue::Text(s) => s.trim().to_string(),
        RawValue::List(items) => items
            .iter()
            .filter_map(text)
            .collect::<Vec<_>>()
            .join(","),
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

pub fn integer(raw: &RawValue, min: Option<i64>, max: Option<i64>) -> Option<i64> {
    let v = match raw {
        RawValue::Int(v) => *v,
        RawValue::Float(f) => integral(*f)?,
        RawValue::Text(s) => {
            let t = s.trim();
            match t.parse::<i64>() {
                Ok(v) => v,
                Err(_) => integral(t.parse::<f64>().ok()?)?,
            }
        }
        RawValue::Empty | RawValue::Bool(_) | RawValue::List(_) => return None,
    };
    if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
        return None;
    }
    Some(v)
}

fn integral(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        Some(f as i64)
    } else {
        None
    }
}

pub fn decimal(raw: &RawValue) -> Option<f64> {
    let v = match raw {
        RawValue::Int(v) => *v as f64,
        RawValue::Float(f) => *f,
        RawValue::Text(s) => {
            let t = s.trim();
            match t.parse::<f64>() {
                Ok(v) => v,
                Err(_) if !t.contains('.') => t.replace(',', ".").parse::<f64>().ok()?,
                Err(_) => return None,
            }
        }
        RawValue::Empty | RawValue::Bool(_) | RawValue::List(_) => return None,
    };
    v.is_finite().then_some(v)
}

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];
// Day 60 in the 1900 system is the phantom 29 Feb 1900; counting from
// 30 Dec 1899 absorbs it for every date after Mar 1900.
const SERIAL_MAX: i64 = 2_958_465;

/// Normalizes a date cell to `YYYY-MM-DD`.
pub fn date(raw: &RawValue) -> Option<String> {
    let parsed = match raw {
        RawValue::Int(v) => from_serial(*v)?,
        RawValue::Float(f) => from_serial(f.trunc() as i64)?,
        RawValue::Text(s) => {
            let t = s.trim();
            if let Ok(serial) = t.parse::<i64>() {
                from_serial(serial)?
            } else {
                // ISO timestamps keep their date part.
                let head = t.split(['T', ' ']).next().unwrap_or(t);
                DATE_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveDate::parse_from_str(head, fmt).ok())?
            }
        }
        RawValue::Empty | RawValue::Bool(_) | RawValue::List(_) => return None,
    };
    Some(parsed.format("%Y-%m-%d").to_string())
}

fn from_serial(serial: i64) -> Option<NaiveDate> {
    if !(1..=SERIAL_MAX).contains(&serial) {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(Duration::days(serial))
}

/// Parses "1, 2,3" style id lists. Tokens that are not positive integers are
/// dropped, so the result may be empty.
pub fn id_list(raw: &RawValue) -> Vec<i64> {
    match raw {
        RawValue::Text(s) => s
            .split(',')
            .filter_map(|token| token.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .collect(),
        RawValue::List(items) => items
            .iter()
            .filter_map(|item| integer(item, Some(1), None))
            .collect(),
        RawValue::Int(_) | RawValue::Float(_) => integer(raw, Some(1), None).into_iter().collect(),
        RawValue::Empty | RawValue::Bool(_) => Vec::new(),
    }
}

/// Maps a cell onto one of the canonical values through an alias table.
/// Matching ignores case.
pub fn choice(raw: &RawValue, aliases: &[(&str, &'static str)]) -> Option<String> {
    let t = text(raw)?;
    let lowered = t.to_lowercase();
    aliases
        .iter()
        .find(|(alias, _)| alias.to_lowercase() == lowered)
        .map(|(_, canonical)| canonical.to_string())
}
