use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use tracing::{info, warn};

use super::otp::{self, STUDENT_OTP};
use super::portraits::{discard_portrait, save_portrait};
use super::student_fields::{student_from_row, validate_fields, STUDENT_COLUMNS};
use crate::api::error::{created, ok, HandlerErr, HandlerResult};
use crate::api::guard;
use crate::api::helpers::get_optional_i64;
use crate::api::types::{AppState, Body, Method, Request, Response};
use crate::auth::{self, AccountKind};
use crate::db::{new_id, now_rfc3339};
use crate::roster::{self, MAX_ROSTER_BYTES};
use crate::uploads::StoredFile;

const PORTRAIT_FIELD: &str = "portrait";
const PORTRAIT_BUCKET: &str = "students";
const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub const REGISTER_PERMS: &[&str] = &["register_student", "manage_students"];
/// Everyone whose work starts from a student record.
pub const VIEW_PERMS: &[&str] = &[
    "register_student",
    "manage_students",
    "academic_counseling",
    "educational_deputy",
    "disciplinary_deputy",
    "psych_counselor",
    "principal",
    "evaluate_performance",
];

pub fn load_student(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM students WHERE id = ?", *STUDENT_COLUMNS),
            [id],
            student_from_row,
        )
        .optional()?)
}

pub fn student_id_by_national_code(conn: &Connection, code: &str) -> Result<Option<String>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id FROM students WHERE national_code = ?",
            [code],
            |r| r.get(0),
        )
        .optional()?)
}

fn field_text<'a>(fields: &'a [(&'static str, SqlValue)], name: &str) -> Option<&'a str> {
    fields.iter().find_map(|(n, v)| match v {
        SqlValue::Text(s) if *n == name => Some(s.as_str()),
        _ => None,
    })
}

/// Unique-column clash for the given values, if any.
fn duplicate_reason(
    conn: &Connection,
    fields: &[(&'static str, SqlValue)],
    except_id: Option<&str>,
) -> Result<Option<&'static str>, HandlerErr> {
    let checks = [
        ("national_code", "National code already exists"),
        ("home_phone", "Home phone already exists"),
    ];
    for (column, message) in checks {
        let Some(value) = field_text(fields, column) else {
            continue;
        };
        let hit: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM students WHERE {column} = ?1 AND id <> COALESCE(?2, '')"),
                (value, except_id),
                |r| r.get(0),
            )
            .optional()?;
        if hit.is_some() {
            return Ok(Some(message));
        }
    }
    Ok(None)
}

fn insert_student(
    conn: &Connection,
    fields: Vec<(&'static str, SqlValue)>,
    portrait: Option<&StoredFile>,
) -> Result<String, HandlerErr> {
    let id = new_id();
    let now = now_rfc3339();
    let (mut columns, mut values): (Vec<&str>, Vec<SqlValue>) = fields.into_iter().unzip();
    columns.extend(["id", "portrait_url", "portrait_file", "created_at", "updated_at"]);
    values.extend([
        SqlValue::Text(id.clone()),
        portrait.map_or(SqlValue::Null, |f| SqlValue::Text(f.url.clone())),
        portrait.map_or(SqlValue::Null, |f| SqlValue::Text(f.file_name.clone())),
        SqlValue::Text(now.clone()),
        SqlValue::Text(now),
    ]);
    let placeholders = vec!["?"; columns.len()].join(", ");
    conn.execute(
        &format!(
            "INSERT INTO students({}) VALUES({placeholders})",
            columns.join(", ")
        ),
        params_from_iter(values),
    )?;
    Ok(id)
}

fn handle_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let staff = guard::require_staff(state, req, REGISTER_PERMS)?;
    let fields = validate_fields(&req.body, false)?;
    if let Some(reason) = duplicate_reason(&state.db, &fields, None)? {
        return Err(HandlerErr::bad_params(reason));
    }

    let portrait = save_portrait(state, req, PORTRAIT_FIELD, PORTRAIT_BUCKET, "")?;
    let id = match insert_student(&state.db, fields, portrait.as_ref()) {
        Ok(id) => id,
        Err(e) => {
            discard_portrait(state, PORTRAIT_BUCKET, portrait.as_ref().map(|f| f.file_name.as_str()));
            return Err(e);
        }
    };
    info!(by = %staff.id, student = %id, "student registered");
    let student = load_student(&state.db, &id)?;
    Ok(created(json!({
        "message": "Student created successfully",
        "student": student,
    })))
}

/// `LIKE` pattern matching `needle` literally anywhere.
fn contains_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    let q = serde_json::to_value(&req.query).unwrap_or_default();
    let page = get_optional_i64(&q, "page")?.unwrap_or(1).max(1);
    let limit = get_optional_i64(&q, "limit")?.unwrap_or(20).clamp(1, 500);
    let search = req.query.get("search").map(|s| s.trim()).unwrap_or("");

    let filter = "?1 = '' OR first_name LIKE ?2 ESCAPE '\\' OR last_name LIKE ?2 ESCAPE '\\'
        OR national_code LIKE ?2 ESCAPE '\\' OR student_phone LIKE ?2 ESCAPE '\\'
        OR father_phone LIKE ?2 ESCAPE '\\' OR mother_phone LIKE ?2 ESCAPE '\\'";
    let pattern = contains_pattern(search);
    let total: i64 = state.db.query_row(
        &format!("SELECT COUNT(*) FROM students WHERE {filter}"),
        (search, &pattern),
        |r| r.get(0),
    )?;
    let mut stmt = state.db.prepare(&format!(
        "SELECT {} FROM students WHERE {filter} ORDER BY rowid DESC LIMIT ?3 OFFSET ?4",
        *STUDENT_COLUMNS
    ))?;
    let students = stmt
        .query_map(
            (search, &pattern, limit, (page - 1).saturating_mul(limit)),
            student_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ok(json!({
        "students": students,
        "total": total,
        "page": page,
        "totalPages": (total + limit - 1) / limit,
    })))
}

fn handle_get(state: &mut AppState, req: &Request, id: &str) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    load_student(&state.db, id)?
        .map(ok)
        .ok_or_else(|| HandlerErr::not_found("Student not found"))
}

fn handle_get_by_national_code(state: &mut AppState, req: &Request, code: &str) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    let Some(id) = student_id_by_national_code(&state.db, code)? else {
        return Err(HandlerErr::not_found("Student not found"));
    };
    load_student(&state.db, &id)?
        .map(ok)
        .ok_or_else(|| HandlerErr::not_found("Student not found"))
}

fn handle_edit(state: &mut AppState, req: &Request, id: &str) -> HandlerResult {
    let staff = guard::require_staff(state, req, REGISTER_PERMS)?;
    let old_portrait: Option<Option<String>> = state
        .db
        .query_row("SELECT portrait_file FROM students WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    let Some(old_portrait) = old_portrait else {
        return Err(HandlerErr::not_found("Student not found"));
    };

    let fields = validate_fields(&req.body, true)?;
    if let Some(reason) = duplicate_reason(&state.db, &fields, Some(id))? {
        return Err(HandlerErr::bad_params(reason));
    }
    let portrait = save_portrait(state, req, PORTRAIT_FIELD, PORTRAIT_BUCKET, "")?;

    let (mut columns, mut values): (Vec<&str>, Vec<SqlValue>) = fields.into_iter().unzip();
    if let Some(f) = &portrait {
        columns.extend(["portrait_url", "portrait_file"]);
        values.extend([
            SqlValue::Text(f.url.clone()),
            SqlValue::Text(f.file_name.clone()),
        ]);
    }
    columns.push("updated_at");
    values.push(SqlValue::Text(now_rfc3339()));
    values.push(SqlValue::Text(id.to_string()));
    let assignments: Vec<String> = columns.iter().map(|c| format!("{c} = ?")).collect();
    state.db.execute(
        &format!("UPDATE students SET {} WHERE id = ?", assignments.join(", ")),
        params_from_iter(values),
    )?;

    if portrait.is_some() {
        discard_portrait(state, PORTRAIT_BUCKET, old_portrait.as_deref());
    }
    info!(by = %staff.id, student = %id, "student updated");
    let student = load_student(&state.db, id)?;
    Ok(ok(json!({
        "message": "Student updated successfully",
        "student": student,
    })))
}

fn handle_delete(state: &mut AppState, req: &Request, id: &str) -> HandlerResult {
    let staff = guard::require_staff(state, req, REGISTER_PERMS)?;
    let portrait: Option<Option<String>> = state
        .db
        .query_row("SELECT portrait_file FROM students WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    let Some(portrait) = portrait else {
        return Err(HandlerErr::not_found("Student not found"));
    };

    let tx = state.db.unchecked_transaction()?;
    tx.execute("DELETE FROM decisions WHERE student_id = ?", [id])?;
    tx.execute("DELETE FROM attendance_entries WHERE student_id = ?", [id])?;
    tx.execute("DELETE FROM students WHERE id = ?", [id])?;
    tx.commit()?;
    auth::revoke_sessions(&state.db, AccountKind::Student, id)?;
    discard_portrait(state, PORTRAIT_BUCKET, portrait.as_deref());

    info!(by = %staff.id, student = %id, "student deleted");
    Ok(ok(json!({ "message": "Student deleted successfully" })))
}

fn handle_login(state: &mut AppState, req: &Request) -> HandlerResult {
    let (student_id, session) = otp::login(state, req, &STUDENT_OTP)?;
    let student = load_student(&state.db, &student_id)?
        .ok_or_else(|| HandlerErr::not_found("Student not found"))?;
    Ok(ok(json!({
        "message": "Login successful",
        "token": session.token,
        "expiresAt": session.expires_at.to_rfc3339(),
        "student": {
            "id": student["id"],
            "first_name": student["first_name"],
            "last_name": student["last_name"],
            "national_code": student["national_code"],
            "student_phone": student["student_phone"],
        },
    })))
}

fn handle_me(state: &mut AppState, req: &Request) -> HandlerResult {
    let student_id = guard::require_student(state, req)?;
    load_student(&state.db, &student_id)?
        .map(ok)
        .ok_or_else(|| HandlerErr::not_found("Student not found"))
}

fn handle_import(state: &mut AppState, req: &Request) -> HandlerResult {
    let staff = guard::require_staff(state, req, REGISTER_PERMS)?;
    let Some(upload) = req.file("file") else {
        return Err(HandlerErr::bad_params("Please upload an .xlsx or .csv file"));
    };
    if upload.bytes.len() > MAX_ROSTER_BYTES {
        return Err(HandlerErr::new(413, "too_large", "Roster file must be at most 10MB"));
    }
    let rows = roster::read_roster(&upload.file_name, &upload.bytes)
        .map_err(|e| HandlerErr::bad_params(format!("{e:#}")))?;

    let mut added = 0usize;
    let mut skipped_rows = Vec::new();
    for row in rows {
        let data = serde_json::Value::Object(row.values);
        let outcome = validate_fields(&data, false).and_then(|fields| {
            if let Some(reason) = duplicate_reason(&state.db, &fields, None)? {
                return Err(HandlerErr::bad_params(reason));
            }
            insert_student(&state.db, fields, None)
        });
        match outcome {
            Ok(_) => added += 1,
            Err(e) => {
                if e.status >= 500 {
                    warn!(line = row.line, error = %e.message, "roster row failed to insert");
                }
                skipped_rows.push(json!({
                    "row": row.line,
                    "data": data,
                    "reason": e.message,
                }));
            }
        }
    }

    info!(
        by = %staff.id,
        file = %upload.file_name,
        added,
        skipped = skipped_rows.len(),
        "student roster imported"
    );
    Ok(created(json!({
        "message": "Students imported",
        "added": added,
        "skipped": skipped_rows.len(),
        "skippedRows": skipped_rows,
    })))
}

fn handle_export(state: &mut AppState, req: &Request) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    let mut stmt = state.db.prepare(&format!(
        "SELECT {} FROM students ORDER BY rowid",
        *STUDENT_COLUMNS
    ))?;
    let students = stmt
        .query_map([], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let bytes = roster::write_roster(&students).map_err(HandlerErr::internal)?;
    Ok(Response {
        status: 200,
        body: Body::File {
            content_type: XLSX_CONTENT_TYPE,
            file_name: "students.xlsx".to_string(),
            bytes,
        },
    })
}

pub fn try_handle(state: &mut AppState, req: &Request, segs: &[&str]) -> Option<HandlerResult> {
    let res = match (req.method, segs) {
        (Method::Post, ["student", "send-otp"]) => otp::send_otp(state, req, &STUDENT_OTP),
        (Method::Post, ["student", "check-otp"]) => otp::check_otp(state, req, &STUDENT_OTP),
        (Method::Post, ["student", "login"]) => handle_login(state, req),
        (Method::Get, ["student", "me"]) => handle_me(state, req),
        (Method::Post, ["student", "import"]) => handle_import(state, req),
        (Method::Get, ["student", "export"]) => handle_export(state, req),
        (Method::Get, ["student", "national-code", code]) => {
            handle_get_by_national_code(state, req, code)
        }
        (Method::Post, ["student"]) => handle_create(state, req),
        (Method::Get, ["student"]) => handle_list(state, req),
        (Method::Get, ["student", id]) => handle_get(state, req, id),
        (Method::Put, ["student", id]) => handle_edit(state, req, id),
        (Method::Delete, ["student", id]) => handle_delete(state, req, id),
        _ => return None,
    };
    Some(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("ali"), "%ali%");
        assert_eq!(contains_pattern("50%_x"), "%50\\%\\_x%");
    }
}
