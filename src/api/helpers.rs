use rusqlite::{Connection, OptionalExtension};

use super::error::HandlerErr;

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    get_optional_str(params, key).ok_or_else(|| HandlerErr::bad_params(format!("missing {key}")))
}

/// Trimmed non-empty string. Numbers are accepted and rendered, since
/// spreadsheet and form inputs often carry codes as numbers.
pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    match params.get(key)? {
        serde_json::Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    match get_optional_i64(params, key)? {
        Some(v) => Ok(v),
        None => Err(HandlerErr::bad_params(format!("missing {key}"))),
    }
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be an integer"))),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| HandlerErr::bad_params(format!("{key} must be an integer"))),
        Some(_) => Err(HandlerErr::bad_params(format!("{key} must be an integer"))),
    }
}

pub fn get_optional_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_f64()),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| HandlerErr::bad_params(format!("{key} must be a number"))),
        Some(_) => Err(HandlerErr::bad_params(format!("{key} must be a number"))),
    }
}

/// Booleans as JSON, as form strings, or as the Persian yes/no labels.
pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    match params.get(key)? {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Number(n) => n.as_i64().map(|v| v != 0),
        serde_json::Value::String(s) => match s.trim() {
            "true" | "1" | "yes" | "بله" => Some(true),
            "false" | "0" | "no" | "خیر" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn get_str_array(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("{key} must be an array")));
    };
    Ok(arr
        .iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect())
}

/// Nested objects arrive either as JSON or, from multipart forms, as a JSON
/// string.
pub fn get_json_object(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v @ serde_json::Value::Object(_)) => Ok(Some(v.clone())),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => serde_json::from_str::<serde_json::Value>(s)
            .ok()
            .filter(|v| v.is_object())
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be an object"))),
        Some(_) => Err(HandlerErr::bad_params(format!("{key} must be an object"))),
    }
}

pub fn row_exists(conn: &Connection, sql: &str, key: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(sql, [key], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn parse_json_column(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_and_strings_both_read_as_ints() {
        let p = json!({ "a": 3, "b": " 4 ", "c": "x", "d": "" });
        assert_eq!(get_required_i64(&p, "a").unwrap(), 3);
        assert_eq!(get_required_i64(&p, "b").unwrap(), 4);
        assert!(get_required_i64(&p, "c").is_err());
        assert_eq!(get_optional_i64(&p, "d").unwrap(), None);
        assert!(get_required_i64(&p, "zzz").is_err());
    }

    #[test]
    fn blank_strings_are_missing() {
        let p = json!({ "name": "   ", "code": 12 });
        assert!(get_required_str(&p, "name").is_err());
        assert_eq!(get_required_str(&p, "code").unwrap(), "12");
    }

    #[test]
    fn nested_object_from_string() {
        let p = json!({ "g": "{\"name\":\"x\"}", "h": "not json" });
        assert_eq!(get_json_object(&p, "g").unwrap(), Some(json!({ "name": "x" })));
        assert!(get_json_object(&p, "h").is_err());
        assert_eq!(get_json_object(&p, "missing").unwrap(), None);
    }
}
