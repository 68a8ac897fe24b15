// 🔤 Column Parser - one raw cell → typed filter and upload values
//
// Every mapped cell goes through parse_column. The result says what the
// cell contributes to the match predicate (filter_on) and what it writes
// when a record is created (upload). Bad values come back as a
// ParseFailure scoped to the column, never as an error.

use crate::config::UploadConfig;
use crate::schema::{FieldType, FieldValue, Record, Table};
use crate::upload::plan::MatchBehavior;
use crate::upload::scoping::ScopedColumn;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseFailure {
    /// Message key, e.g. "failedParsingDecimal"
    pub message: String,
    pub payload: serde_json::Value,
    pub column: String,
}

impl ParseFailure {
    pub fn new(message: &str, payload: serde_json::Value, column: &str) -> Self {
        ParseFailure {
            message: message.to_string(),
            payload,
            column: column.to_string(),
        }
    }
}

/// A value headed for a writable picklist that does not have it yet
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPicklistAddition {
    pub picklist_id: i64,
    pub picklist_name: String,
    pub value: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub field: &'static str,
    pub column: String,
    pub filter_on: Record,
    pub upload: Record,
    pub picklist_addition: Option<PendingPicklistAddition>,
    /// Set when a schema-required field got no value
    pub missing_required: Option<String>,
}

// ============================================================================
// ENTRY POINT
// ============================================================================

pub fn parse_column(
    table: &Table,
    column: &ScopedColumn,
    raw: &str,
    config: &UploadConfig,
) -> Result<ParseResult, ParseFailure> {
    let field = column.field;
    let name = column.column();
    let trimmed = raw.trim();
    let value = if trimmed.is_empty() {
        column.options.default.as_deref().unwrap_or("").trim()
    } else {
        trimmed
    };

    let mut result = ParseResult {
        field: field.name,
        column: name.to_string(),
        filter_on: Record::new(),
        upload: Record::new(),
        picklist_addition: None,
        missing_required: None,
    };

    if value.is_empty() {
        if !column.options.null_allowed {
            return Err(ParseFailure::new("fieldRequiredByUploadPlan", serde_json::json!({}), name));
        }
        if field.required {
            result.missing_required = Some(field.name.to_string());
        }
        result.upload.insert(field.name.to_string(), FieldValue::Null);
        if let Some(companion) = field.companion {
            result.upload.insert(companion.to_string(), FieldValue::Null);
        }
        if column.options.match_behavior == MatchBehavior::IgnoreNever
            && config.counts_for_match(table.name, field.name)
        {
            result.filter_on.insert(field.name.to_string(), FieldValue::Null);
        }
        return Ok(result);
    }

    let parsed = match field.field_type {
        FieldType::Text => {
            let (text, addition) = parse_text(column, value)?;
            result.picklist_addition = addition;
            FieldValue::Text(text)
        }
        FieldType::Integer => value
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| ParseFailure::new("failedParsingInteger", serde_json::json!({"value": value}), name))?,
        FieldType::Decimal => parse_decimal(value)
            .map(FieldValue::Real)
            .ok_or_else(|| ParseFailure::new("failedParsingDecimal", serde_json::json!({"value": value}), name))?,
        FieldType::Boolean => parse_boolean(value)
            .map(FieldValue::Boolean)
            .ok_or_else(|| ParseFailure::new("failedParsingBoolean", serde_json::json!({"value": value}), name))?,
        FieldType::AgentType => FieldValue::Integer(parse_agent_type(value).ok_or_else(|| {
            ParseFailure::new(
                "failedParsingAgentType",
                serde_json::json!({"badType": value, "validTypes": AGENT_TYPES}),
                name,
            )
        })?),
        FieldType::Date => {
            let (date, precision) = parse_date(value, &config.date_format).ok_or_else(|| {
                ParseFailure::new(
                    "badDateFormat",
                    serde_json::json!({"value": value, "format": config.date_format}),
                    name,
                )
            })?;
            if let Some(companion) = field.companion {
                result.upload.insert(companion.to_string(), FieldValue::Integer(precision));
            }
            FieldValue::Text(date.format("%Y-%m-%d").to_string())
        }
        FieldType::Latitude | FieldType::Longitude => {
            let is_latitude = field.field_type == FieldType::Latitude;
            let degrees = parse_lat_long(value)
                .ok_or_else(|| ParseFailure::new("failedParsingLatLong", serde_json::json!({"value": value}), name))?;
            let limit = if is_latitude { 90.0 } else { 180.0 };
            if degrees.abs() > limit {
                let message = if is_latitude { "latitudeOutOfRange" } else { "longitudeOutOfRange" };
                return Err(ParseFailure::new(message, serde_json::json!({"value": value}), name));
            }
            if let Some(companion) = field.companion {
                result.upload.insert(companion.to_string(), FieldValue::Text(value.to_string()));
            }
            FieldValue::Real(degrees)
        }
    };

    result.upload.insert(field.name.to_string(), parsed.clone());
    if column.options.match_behavior != MatchBehavior::IgnoreAlways
        && config.counts_for_match(table.name, field.name)
    {
        result.filter_on.insert(field.name.to_string(), parsed);
    }
    Ok(result)
}

// ============================================================================
// TYPE PARSERS
// ============================================================================

fn parse_text(column: &ScopedColumn, value: &str) -> Result<(String, Option<PendingPicklistAddition>), ParseFailure> {
    let name = column.column();
    let mut text = value.to_string();
    let mut addition = None;

    if let Some(picklist) = &column.picklist {
        match picklist.find(value) {
            Some(item) => text = item.value.clone(),
            None if picklist.read_only => {
                return Err(ParseFailure::new(
                    "failedParsingPickList",
                    serde_json::json!({"value": value}),
                    name,
                ))
            }
            None => {
                addition = Some(PendingPicklistAddition {
                    picklist_id: picklist.id,
                    picklist_name: picklist.name.clone(),
                    value: value.to_string(),
                    column: name.to_string(),
                })
            }
        }
    }

    if let Some(max) = column.field.length {
        if text.chars().count() > max {
            return Err(ParseFailure::new("valueTooLong", serde_json::json!({"maxLength": max}), name));
        }
    }
    Ok((text, addition))
}

fn parse_decimal(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|d| d.is_finite())
}

fn parse_boolean(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

const AGENT_TYPES: [&str; 4] = ["Organization", "Person", "Other", "Group"];

fn parse_agent_type(value: &str) -> Option<i64> {
    AGENT_TYPES
        .iter()
        .position(|t| t.eq_ignore_ascii_case(value))
        .map(|i| i as i64)
}

/// Date plus precision: 1 = full date, 2 = month, 3 = year
pub fn parse_date(value: &str, format: &str) -> Option<(NaiveDate, i64)> {
    if let Ok(date) = NaiveDate::parse_from_str(value, format) {
        return Some((date, 1));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some((date, 1));
    }

    let all_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    let year_month = |year: &str, month: &str| -> Option<(NaiveDate, i64)> {
        if year.len() != 4 || !all_digits(year) || month.len() > 2 || !all_digits(month) {
            return None;
        }
        NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1).map(|d| (d, 2))
    };

    if value.len() == 4 && all_digits(value) {
        return NaiveDate::from_ymd_opt(value.parse().ok()?, 1, 1).map(|d| (d, 3));
    }
    if let Some((year, month)) = value.split_once('-') {
        return year_month(year, month);
    }
    if let Some((month, year)) = value.split_once('/') {
        return year_month(year, month);
    }
    None
}

/// Decimal degrees from "38.5", "-92.1", "38.5 N", "38°30'15\" N", "38 30.25 S", ...
pub fn parse_lat_long(value: &str) -> Option<f64> {
    let mut text = value.trim().to_uppercase();
    let mut sign = 1.0;

    if let Some(last) = text.chars().last().filter(|c| "NSEW".contains(*c)) {
        if last == 'S' || last == 'W' {
            sign = -1.0;
        }
        text.pop();
    } else if let Some(first) = text.chars().next().filter(|c| "NSEW".contains(*c)) {
        if first == 'S' || first == 'W' {
            sign = -1.0;
        }
        text.remove(0);
    }
    let text = text.trim();
    let text = match text.strip_prefix('-') {
        Some(rest) => {
            sign = -sign;
            rest
        }
        None => text,
    };

    let parts: Vec<f64> = text
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<f64>().ok())
        .collect::<Option<Vec<_>>>()?;

    let degrees = match parts.as_slice() {
        [d] => *d,
        [d, m] if *m < 60.0 => d + m / 60.0,
        [d, m, s] if *m < 60.0 && *s < 60.0 => d + m / 60.0 + s / 3600.0,
        _ => return None,
    };
    Some(sign * degrees)
}

// ============================================================================
// TESTS
// ============================================================================
