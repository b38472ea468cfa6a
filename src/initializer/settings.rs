//! Typed accessors over an initializer's configuration map
//!
//! Every accessor names the offending key in its `ConfigurationError`.

use crate::error::ConfigurationError;
use std::time::Duration;
use toml::{Table, Value};

fn type_error(field: &str, expected: &str) -> ConfigurationError {
    ConfigurationError::InvalidType {
        field: field.to_string(),
        expected: expected.to_string(),
    }
}

fn value_error(field: &str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// A string that must be present; empty strings are rejected
pub fn required_str(table: &Table, field: &str) -> Result<String, ConfigurationError> {
    match table.get(field) {
        None => Err(ConfigurationError::Missing(field.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(ConfigurationError::Empty(field.to_string()))
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(type_error(field, "string")),
    }
}

/// A string that must be present but may be empty (passwords)
pub fn required_secret(table: &Table, field: &str) -> Result<String, ConfigurationError> {
    match table.get(field) {
        None => Err(ConfigurationError::Missing(field.to_string())),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(type_error(field, "string")),
    }
}

pub fn optional_str(table: &Table, field: &str) -> Result<Option<String>, ConfigurationError> {
    match table.get(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(type_error(field, "string")),
    }
}

pub fn optional_bool(table: &Table, field: &str, default: bool) -> Result<bool, ConfigurationError> {
    match table.get(field) {
        None => Ok(default),
        Some(Value::Boolean(b)) => Ok(*b),
        Some(_) => Err(type_error(field, "boolean")),
    }
}

/// An integer that must fall within `min..=max`
pub fn integer_in_range(
    table: &Table,
    field: &str,
    default: Option<i64>,
    min: i64,
    max: i64,
) -> Result<i64, ConfigurationError> {
    let value = match (table.get(field), default) {
        (None, Some(default)) => default,
        (None, None) => return Err(ConfigurationError::Missing(field.to_string())),
        (Some(Value::Integer(i)), _) => *i,
        (Some(Value::String(s)), _) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| type_error(field, "integer"))?,
        (Some(_), _) => return Err(type_error(field, "integer")),
    };
    if value < min || value > max {
        return Err(value_error(
            field,
            format!("must be between {} and {}, got {}", min, max, value),
        ));
    }
    Ok(value)
}

/// A TCP port (1-65535)
pub fn port(table: &Table, field: &str, default: Option<u16>) -> Result<u16, ConfigurationError> {
    let value = integer_in_range(table, field, default.map(i64::from), 1, 65_535)?;
    u16::try_from(value).map_err(|_| value_error(field, "must be a valid port"))
}

/// A duration in seconds given as integer or float
///
/// `allow_zero` permits `0` (retry delays); timeouts must be strictly positive.
pub fn seconds(
    table: &Table,
    field: &str,
    default: f64,
    allow_zero: bool,
) -> Result<Duration, ConfigurationError> {
    let value = match table.get(field) {
        None => default,
        Some(Value::Integer(i)) => *i as f64,
        Some(Value::Float(f)) => *f,
        Some(_) => return Err(type_error(field, "number of seconds")),
    };
    if !value.is_finite() || value < 0.0 || (!allow_zero && value == 0.0) {
        let bound = if allow_zero { "non-negative" } else { "positive" };
        return Err(value_error(
            field,
            format!("must be a {} number of seconds, got {}", bound, value),
        ));
    }
    if value > 86_400.0 {
        return Err(value_error(field, "must not exceed one day"));
    }
    Ok(Duration::from_secs_f64(value))
}

/// Unix permission bits given as an octal string (`"0755"`) or an integer (`0o755`)
pub fn permissions(table: &Table, field: &str, default: u32) -> Result<u32, ConfigurationError> {
    let mode = match table.get(field) {
        None => default,
        Some(Value::Integer(i)) => {
            u32::try_from(*i).map_err(|_| value_error(field, "must not be negative"))?
        }
        Some(Value::String(s)) => {
            let digits = s.trim().trim_start_matches("0o");
            u32::from_str_radix(digits, 8)
                .map_err(|_| value_error(field, format!("'{}' is not an octal mode", s)))?
        }
        Some(_) => return Err(type_error(field, "octal string or integer")),
    };
    if mode > 0o7777 {
        return Err(value_error(field, format!("{:o} exceeds 7777", mode)));
    }
    Ok(mode)
}

/// An array of non-empty strings
pub fn string_list(table: &Table, field: &str) -> Result<Option<Vec<String>>, ConfigurationError> {
    let Some(value) = table.get(field) else {
        return Ok(None);
    };
    let items = value
        .as_array()
        .ok_or_else(|| type_error(field, "array of strings"))?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
            Value::String(_) => Err(ConfigurationError::Empty(format!("{}[{}]", field, index))),
            _ => Err(type_error(&format!("{}[{}]", field, index), "string")),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// A nested table
pub fn table<'a>(parent: &'a Table, field: &str) -> Result<Option<&'a Table>, ConfigurationError> {
    match parent.get(field) {
        None => Ok(None),
        Some(Value::Table(t)) => Ok(Some(t)),
        Some(_) => Err(type_error(field, "table")),
    }
}

/// An array of tables, each handed to `parse` with its indexed field name
pub fn table_list<T>(
    parent: &Table,
    field: &str,
    mut parse: impl FnMut(&Table, &str) -> Result<T, ConfigurationError>,
) -> Result<Vec<T>, ConfigurationError> {
    let Some(value) = parent.get(field) else {
        return Ok(Vec::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| type_error(field, "array of tables"))?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let name = format!("{}[{}]", field, index);
            match item {
                Value::Table(t) => parse(t, &name),
                _ => Err(type_error(&name, "table")),
            }
        })
        .collect()
}

/// Prefix a nested field with its parent path (`connections.api.port`)
pub fn nested(err: ConfigurationError, parent: &str) -> ConfigurationError {
    let qualify = |field: String| format!("{}.{}", parent, field);
    match err {
        ConfigurationError::Missing(f) => ConfigurationError::Missing(qualify(f)),
        ConfigurationError::Empty(f) => ConfigurationError::Empty(qualify(f)),
        ConfigurationError::InvalidType { field, expected } => ConfigurationError::InvalidType {
            field: qualify(field),
            expected,
        },
        ConfigurationError::InvalidValue { field, reason } => ConfigurationError::InvalidValue {
            field: qualify(field),
            reason,
        },
    }
}
