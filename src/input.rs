use std::fs;
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::InputError;

const REQUIRED_COLUMNS: [&str; 2] = ["url", "views"];

#[derive(Clone, Debug, PartialEq)]
pub struct InputRow {
    pub url: String,
    pub views: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputSummary {
    pub total: usize,
    pub total_views: u64,
    pub average_views: f64,
    pub max_views: u64,
    pub min_views: u64,
}

/// Reads a JSON array of row objects. Column names are matched without
/// regard to case; rows come back ordered by views, most viewed first.
pub fn read_rows(path: &Path) -> Result<Vec<InputRow>, InputError> {
    let text = fs::read_to_string(path).map_err(|source| InputError::Io { path: path.to_path_buf(), source })?;
    let value: Value = serde_json::from_str(&text).map_err(|source| InputError::Parse { path: path.to_path_buf(), source })?;
    let objects = match value {
        Value::Array(items) => items,
        _ => return Err(InputError::NotAnArray { path: path.to_path_buf() }),
    };

    let rows: Vec<Map<String, Value>> = objects
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect()),
            _ => None,
        })
        .collect();

    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|column| !rows.is_empty() && rows.iter().all(|row| !row.contains_key(**column)))
        .map(|column| String::from(*column))
        .collect();
    if !missing.is_empty() {
        return Err(InputError::MissingColumns(missing));
    }

    let mut parsed = rows
        .iter()
        .enumerate()
        .map(|(index, row)| parse_row(index, row))
        .collect::<Result<Vec<_>, _>>()?;
    parsed.sort_by(|a, b| b.views.cmp(&a.views));
    Ok(parsed)
}

fn parse_row(index: usize, row: &Map<String, Value>) -> Result<InputRow, InputError> {
    let invalid = |column: &str| InputError::InvalidValue { row: index, column: String::from(column) };

    let url = match row.get("url") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(invalid("url")),
    };
    let views = match row.get("views") {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().replace(',', "").parse::<u64>().ok(),
        _ => None,
    };

    match views {
        Some(views) => Ok(InputRow { url, views }),
        None => Err(invalid("views")),
    }
}

pub fn summarize(rows: &[InputRow]) -> Option<InputSummary> {
    if rows.is_empty() {
        return None;
    }
    // u64 view counts can overflow a u64 total
    let exact_total: u128 = rows.iter().map(|r| u128::from(r.views)).sum();
    Some(InputSummary {
        total: rows.len(),
        total_views: u64::try_from(exact_total).unwrap_or(u64::MAX),
        average_views: exact_total as f64 / rows.len() as f64,
        max_views: rows.iter().map(|r| r.views).max().unwrap_or(0),
        min_views: rows.iter().map(|r| r.views).min().unwrap_or(0),
    })
}
