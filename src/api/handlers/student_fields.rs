//! Student columns: which are required, how each is validated, and how a row
//! is rendered back to JSON. Create, edit and roster import all go through
//! [`validate_fields`].

use std::sync::LazyLock;

use rusqlite::types::Value as SqlValue;
use serde_json::{json, Value};

use crate::api::error::HandlerErr;
use crate::api::helpers::{get_json_object, get_optional_bool, get_optional_f64, get_optional_str};
use crate::model::{
    is_home_phone, is_mobile, is_national_code, Choices, ACADEMIC_STATUS, EDUCATION_LEVEL,
    EVALUATION_RESULT, MARITAL_STATUS, RESIDENCE_STATUS,
};

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Text,
    Mobile,
    NationalCode,
    HomePhone,
    Choice(&'static Choices),
    Grade,
    Flag,
    Guardian,
    Commitment,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

const fn field(name: &'static str, kind: FieldKind, required: bool) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required,
    }
}

/// Column order here is also the export column order.
pub const FIELDS: &[FieldSpec] = &[
    field("first_name", FieldKind::Text, true),
    field("last_name", FieldKind::Text, true),
    field("father_name", FieldKind::Text, true),
    field("mother_name", FieldKind::Text, true),
    field("national_code", FieldKind::NationalCode, true),
    field("birth_date", FieldKind::Text, true),
    field("birth_certificate_number", FieldKind::Text, true),
    field("student_phone", FieldKind::Mobile, true),
    field("father_phone", FieldKind::Mobile, true),
    field("father_job", FieldKind::Text, true),
    field("mother_phone", FieldKind::Mobile, true),
    field("academic_year", FieldKind::Text, true),
    field("education_level", FieldKind::Choice(&EDUCATION_LEVEL), true),
    field("mother_job", FieldKind::Text, true),
    field("grade", FieldKind::Grade, false),
    field("emergency_phone", FieldKind::Mobile, true),
    field("marital_status", FieldKind::Choice(&MARITAL_STATUS), true),
    field("guardian", FieldKind::Guardian, false),
    field("previous_school_address", FieldKind::Text, true),
    field("home_address", FieldKind::Text, true),
    field("residence_status", FieldKind::Choice(&RESIDENCE_STATUS), true),
    field("postal_code", FieldKind::Text, true),
    field("home_phone", FieldKind::HomePhone, true),
    field("appearance_neat", FieldKind::Flag, false),
    field("polite_behavior", FieldKind::Flag, false),
    field("family_involvement", FieldKind::Flag, false),
    field("student_goal", FieldKind::Text, true),
    field("academic_status", FieldKind::Choice(&ACADEMIC_STATUS), true),
    field("commitment", FieldKind::Commitment, false),
    field("evaluation_result", FieldKind::Choice(&EVALUATION_RESULT), false),
];

fn field_err(name: &str, message: impl Into<String>) -> HandlerErr {
    HandlerErr::bad_params(message).with_details(json!({ "field": name }))
}

fn is_missing(params: &Value, name: &str) -> bool {
    match params.get(name) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn parse_guardian(params: &Value, name: &str) -> Result<SqlValue, HandlerErr> {
    let Some(obj) = get_json_object(params, name).map_err(|e| field_err(name, e.message))? else {
        return Ok(SqlValue::Null);
    };
    let part = |key: &str| get_optional_str(&obj, key);
    let (g_name, relation, phone) = (part("name"), part("relation"), part("phone"));
    if let Some(p) = &phone {
        if !is_mobile(p) {
            return Err(field_err(name, "Guardian phone must match 09XXXXXXXXX"));
        }
        if g_name.is_none() || relation.is_none() {
            return Err(field_err(name, "Guardian name and relation are required with a phone"));
        }
    }
    if g_name.is_none() && relation.is_none() && phone.is_none() {
        return Ok(SqlValue::Null);
    }
    let stored = json!({
        "name": g_name.unwrap_or_default(),
        "relation": relation.unwrap_or_default(),
        "phone": phone.unwrap_or_default(),
    });
    Ok(SqlValue::Text(stored.to_string()))
}

fn parse_commitment(params: &Value, name: &str) -> Result<SqlValue, HandlerErr> {
    let obj = get_json_object(params, name)
        .map_err(|e| field_err(name, e.message))?
        .unwrap_or_else(|| json!({}));
    let stored = json!({
        "discipline": get_optional_bool(&obj, "discipline").unwrap_or(false),
        "rules": get_optional_bool(&obj, "rules").unwrap_or(false),
    });
    Ok(SqlValue::Text(stored.to_string()))
}

fn parse_one(params: &Value, spec: &FieldSpec) -> Result<SqlValue, HandlerErr> {
    let name = spec.name;
    let text = || get_optional_str(params, name).unwrap_or_default();
    match spec.kind {
        FieldKind::Text => Ok(SqlValue::Text(text())),
        FieldKind::Mobile => {
            let v = text();
            if !is_mobile(&v) {
                return Err(field_err(name, format!("{name} must match 09XXXXXXXXX")));
            }
            Ok(SqlValue::Text(v))
        }
        FieldKind::NationalCode => {
            let v = text();
            if !is_national_code(&v) {
                return Err(field_err(name, "National code must be exactly 10 digits"));
            }
            Ok(SqlValue::Text(v))
        }
        FieldKind::HomePhone => {
            let v = text();
            if !is_home_phone(&v) {
                return Err(field_err(name, "Home phone must be 8 to 11 digits"));
            }
            Ok(SqlValue::Text(v))
        }
        FieldKind::Choice(choices) => match choices.normalize(&text()) {
            Some(v) => Ok(SqlValue::Text(v.to_string())),
            None => Err(field_err(name, format!("Invalid {}: {}", choices.name, text()))
                .with_details(json!({ "field": name, "allowed": choices.values() }))),
        },
        FieldKind::Grade => match get_optional_f64(params, name) {
            Ok(Some(g)) => Ok(SqlValue::Real(g)),
            Ok(None) => Ok(SqlValue::Null),
            Err(e) => Err(field_err(name, e.message)),
        },
        FieldKind::Flag => match get_optional_bool(params, name) {
            Some(b) => Ok(SqlValue::Integer(b as i64)),
            None => Err(field_err(name, format!("{name} must be a boolean"))),
        },
        FieldKind::Guardian => parse_guardian(params, name),
        FieldKind::Commitment => parse_commitment(params, name),
    }
}

fn default_for(spec: &FieldSpec) -> Option<SqlValue> {
    match spec.kind {
        FieldKind::Flag => Some(SqlValue::Integer(0)),
        FieldKind::Commitment => Some(SqlValue::Text(
            json!({ "discipline": false, "rules": false }).to_string(),
        )),
        _ => None,
    }
}

/// Validated column values present in `params`. With `partial` unset every
/// required field must be present and optional flags get their defaults.
pub fn validate_fields(
    params: &Value,
    partial: bool,
) -> Result<Vec<(&'static str, SqlValue)>, HandlerErr> {
    let mut out = Vec::new();
    let mut missing = Vec::new();
    for spec in FIELDS {
        if is_missing(params, spec.name) {
            if partial {
                continue;
            }
            if spec.required {
                missing.push(spec.name);
            } else if let Some(v) = default_for(spec) {
                out.push((spec.name, v));
            }
            continue;
        }
        if !missing.is_empty() {
            continue;
        }
        out.push((spec.name, parse_one(params, spec)?));
    }
    if !missing.is_empty() {
        return Err(HandlerErr::bad_params(format!(
            "Missing or empty fields: {}",
            missing.join(", ")
        ))
        .with_details(json!({ "field": missing[0], "missing": missing })));
    }
    Ok(out)
}

/// `SELECT` list matching [`student_from_row`].
pub static STUDENT_COLUMNS: LazyLock<String> = LazyLock::new(|| {
    let mut cols: Vec<&str> = FIELDS.iter().map(|f| f.name).collect();
    cols.extend([
        "id",
        "portrait_url",
        "portrait_file",
        "accepted",
        "class_id",
        "created_at",
        "updated_at",
    ]);
    cols.join(", ")
});

pub fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let mut obj = serde_json::Map::new();
    for (i, spec) in FIELDS.iter().enumerate() {
        let raw: SqlValue = r.get(i)?;
        let v = match (raw, spec.kind) {
            (SqlValue::Null, _) => Value::Null,
            (SqlValue::Integer(n), FieldKind::Flag) => Value::Bool(n != 0),
            (SqlValue::Integer(n), _) => json!(n),
            (SqlValue::Real(f), _) => json!(f),
            (SqlValue::Text(s), FieldKind::Guardian | FieldKind::Commitment) => {
                serde_json::from_str(&s).unwrap_or(Value::Null)
            }
            (SqlValue::Text(s), _) => Value::String(s),
            (SqlValue::Blob(_), _) => Value::Null,
        };
        obj.insert(spec.name.to_string(), v);
    }
    let base = FIELDS.len();
    let portrait_url: Option<String> = r.get(base + 1)?;
    let portrait_file: Option<String> = r.get(base + 2)?;
    let accepted: Option<i64> = r.get(base + 3)?;
    obj.insert("id".into(), json!(r.get::<_, String>(base)?));
    obj.insert(
        "student_portrait_front".into(),
        portrait_url
            .map(|url| json!({ "url": url, "public_id": portrait_file }))
            .unwrap_or(Value::Null),
    );
    obj.insert("accepted".into(), json!(accepted.map(|v| v != 0)));
    obj.insert("class".into(), json!(r.get::<_, Option<String>>(base + 4)?));
    obj.insert("createdAt".into(), json!(r.get::<_, String>(base + 5)?));
    obj.insert("updatedAt".into(), json!(r.get::<_, String>(base + 6)?));
    Ok(Value::Object(obj))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> Value {
        json!({
            "first_name": "Sara", "last_name": "Ahmadi", "father_name": "Ali",
            "mother_name": "Maryam", "national_code": "0012345678",
            "birth_date": "1390/01/01", "birth_certificate_number": "123",
            "student_phone": "09120000001", "father_phone": "09120000002",
            "father_job": "engineer", "mother_phone": "09120000003",
            "mother_job": "teacher", "academic_year": "1403-1404",
            "education_level": "دهم", "emergency_phone": "09120000004",
            "marital_status": "single", "previous_school_address": "Tehran",
            "home_address": "Tehran", "residence_status": "مستاجر",
            "postal_code": "1234567890", "home_phone": "02112345678",
            "student_goal": "medicine", "academic_status": "high",
        })
    }

    fn value_of<'a>(fields: &'a [(&'static str, SqlValue)], name: &str) -> Option<&'a SqlValue> {
        fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    #[test]
    fn complete_record_normalizes_labels_and_fills_defaults() {
        let fields = validate_fields(&complete(), false).expect("valid");
        assert_eq!(
            value_of(&fields, "education_level"),
            Some(&SqlValue::Text("10".into()))
        );
        assert_eq!(
            value_of(&fields, "residence_status"),
            Some(&SqlValue::Text("tenant".into()))
        );
        assert_eq!(value_of(&fields, "polite_behavior"), Some(&SqlValue::Integer(0)));
        assert!(value_of(&fields, "commitment").is_some());
        assert!(value_of(&fields, "grade").is_none());
    }

    #[test]
    fn missing_required_fields_are_listed() {
        let mut p = complete();
        p["father_name"] = json!("  ");
        p.as_object_mut().unwrap().remove("home_phone");
        let err = validate_fields(&p, false).unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(
            err.details.unwrap()["missing"],
            json!(["father_name", "home_phone"])
        );
    }

    #[test]
    fn patterns_and_guardian_are_checked() {
        let mut p = complete();
        p["father_phone"] = json!("9120000002");
        assert_eq!(
            validate_fields(&p, false).unwrap_err().details.unwrap()["field"],
            "father_phone"
        );

        let p = json!({ "guardian": "{\"phone\":\"09121111111\"}" });
        assert!(validate_fields(&p, true).is_err());
        let p = json!({ "guardian": { "name": "Reza", "relation": "uncle", "phone": "09121111111" } });
        assert_eq!(validate_fields(&p, true).unwrap().len(), 1);
    }

    #[test]
    fn partial_update_only_touches_given_fields() {
        let fields = validate_fields(&json!({ "grade": "18.5", "last_name": "Karimi" }), true)
            .expect("valid");
        assert_eq!(fields.len(), 2);
        assert_eq!(value_of(&fields, "grade"), Some(&SqlValue::Real(18.5)));
    }
}
