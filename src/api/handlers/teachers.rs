use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

use super::otp::{self, TEACHER_OTP};
use super::portraits::{discard_portrait, save_portrait};
use crate::api::error::{created, ok, HandlerErr, HandlerResult};
use crate::api::guard::{self, Principal};
use crate::api::helpers::{get_optional_str, get_required_str};
use crate::api::types::{AppState, Method, Request};
use crate::auth::{self, AccountKind};
use crate::db::{new_id, now_rfc3339};
use crate::model::{is_mobile, is_national_code, ACADEMIC_LEVEL};

const PORTRAIT_FIELD: &str = "teacher_portrait_front";
const PORTRAIT_BUCKET: &str = "teachers";

/// Staff who may look teachers up.
const VIEW_PERMS: &[&str] = &[
    "register_teachers",
    "evaluate_performance",
    "manage_students",
    "disciplinary_deputy",
    "principal",
];
/// Staff who may file warnings against a teacher.
const REPORT_PERMS: &[&str] = &["evaluate_performance", "disciplinary_deputy", "principal"];

const TEACHER_COLUMNS: &str = "id, mobile, first_name, last_name, birth_date, birth_certificate_number,
    national_code, academic_year, academic_level, portrait_url, portrait_file, created_at, updated_at,
    (SELECT COUNT(*) FROM teacher_reports tr WHERE tr.teacher_id = teachers.id)";

fn teacher_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let portrait_url: Option<String> = r.get(9)?;
    let portrait_file: Option<String> = r.get(10)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "mobile": r.get::<_, String>(1)?,
        "first_name": r.get::<_, String>(2)?,
        "last_name": r.get::<_, String>(3)?,
        "birth_date": r.get::<_, String>(4)?,
        "birth_certificate_number": r.get::<_, String>(5)?,
        "national_code": r.get::<_, String>(6)?,
        "academic_year": r.get::<_, String>(7)?,
        "academic_level": r.get::<_, String>(8)?,
        "teacher_portrait_front": portrait_url.map(|url| json!({ "url": url, "public_id": portrait_file })),
        "createdAt": r.get::<_, String>(11)?,
        "updatedAt": r.get::<_, String>(12)?,
        "numberOfReports": r.get::<_, i64>(13)?,
    }))
}

pub fn load_teacher(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    Ok(conn
        .query_row(
            &format!("SELECT {TEACHER_COLUMNS} FROM teachers WHERE id = ?"),
            [id],
            teacher_from_row,
        )
        .optional()?)
}

fn duplicate_teacher(
    conn: &Connection,
    mobile: Option<&str>,
    national_code: Option<&str>,
    except_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM teachers
             WHERE (mobile = ?1 OR national_code = ?2) AND id <> COALESCE(?3, '')",
            (mobile, national_code, except_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn handle_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let staff = guard::require_staff(state, req, &["register_teachers"])?;
    let p = &req.body;

    let mut values = Vec::new();
    for key in [
        "mobile",
        "first_name",
        "last_name",
        "birth_date",
        "birth_certificate_number",
        "national_code",
        "academic_year",
        "academic_level",
    ] {
        values.push(get_required_str(p, key).map_err(|_| {
            HandlerErr::bad_params("All required fields must be provided")
                .with_details(json!({ "field": key }))
        })?);
    }
    let [mobile, first_name, last_name, birth_date, birth_cert, national_code, academic_year, level_raw]: [String; 8] =
        values.try_into().map_err(|_| HandlerErr::bad_params("All required fields must be provided"))?;

    if !is_mobile(&mobile) {
        return Err(HandlerErr::bad_params("Mobile must match 09XXXXXXXXX"));
    }
    if !is_national_code(&national_code) {
        return Err(HandlerErr::bad_params("National code must be exactly 10 digits"));
    }
    let Some(academic_level) = ACADEMIC_LEVEL.normalize(&level_raw) else {
        return Err(HandlerErr::bad_params("Invalid academic level")
            .with_details(json!({ "allowed": ACADEMIC_LEVEL.values() })));
    };
    if duplicate_teacher(&state.db, Some(&mobile), Some(&national_code), None)? {
        return Err(HandlerErr::bad_params("National code or mobile number already exists"));
    }

    let portrait = save_portrait(state, req, PORTRAIT_FIELD, PORTRAIT_BUCKET, "teacher-")?;
    let id = new_id();
    let now = now_rfc3339();
    let inserted = state.db.execute(
        "INSERT INTO teachers(id, mobile, first_name, last_name, birth_date, birth_certificate_number,
            national_code, academic_year, academic_level, portrait_url, portrait_file, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            mobile,
            first_name,
            last_name,
            birth_date,
            birth_cert,
            national_code,
            academic_year,
            academic_level,
            portrait.as_ref().map(|f| f.url.clone()),
            portrait.as_ref().map(|f| f.file_name.clone()),
            now,
            now,
        ],
    );
    if let Err(e) = inserted {
        discard_portrait(state, PORTRAIT_BUCKET, portrait.as_ref().map(|f| f.file_name.as_str()));
        return Err(e.into());
    }

    info!(by = %staff.id, teacher = %id, "teacher registered");
    let data = load_teacher(&state.db, &id)?;
    Ok(created(json!({
        "success": true,
        "message": "Teacher added successfully",
        "data": data,
    })))
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    let mut stmt = state.db.prepare(&format!(
        "SELECT {TEACHER_COLUMNS} FROM teachers ORDER BY last_name, first_name"
    ))?;
    let rows = stmt
        .query_map([], teacher_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let teachers: Vec<_> = rows
        .into_iter()
        .map(|t| {
            json!({
                "id": t["id"],
                "first_name": t["first_name"],
                "last_name": t["last_name"],
                "mobile": t["mobile"],
                "numberOfReports": t["numberOfReports"],
            })
        })
        .collect();
    Ok(ok(json!(teachers)))
}

fn handle_get(state: &mut AppState, req: &Request, id: &str) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    let Some(teacher) = load_teacher(&state.db, id)? else {
        return Err(HandlerErr::not_found("Teacher not found"));
    };
    Ok(ok(json!({ "success": true, "data": teacher })))
}

fn handle_edit(state: &mut AppState, req: &Request, id: &str) -> HandlerResult {
    guard::require_staff(state, req, &["register_teachers"])?;
    let old_portrait: Option<Option<String>> = state
        .db
        .query_row("SELECT portrait_file FROM teachers WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    let Some(old_portrait) = old_portrait else {
        return Err(HandlerErr::not_found("Teacher not found"));
    };

    let p = &req.body;
    let mobile = get_optional_str(p, "mobile");
    let national_code = get_optional_str(p, "national_code");
    if let Some(m) = &mobile {
        if !is_mobile(m) {
            return Err(HandlerErr::bad_params("Mobile must match 09XXXXXXXXX"));
        }
    }
    if let Some(nc) = &national_code {
        if !is_national_code(nc) {
            return Err(HandlerErr::bad_params("National code must be exactly 10 digits"));
        }
    }
    let academic_level = match get_optional_str(p, "academic_level") {
        Some(raw) => Some(
            ACADEMIC_LEVEL
                .normalize(&raw)
                .ok_or_else(|| HandlerErr::bad_params("Invalid academic level"))?,
        ),
        None => None,
    };
    if (mobile.is_some() || national_code.is_some())
        && duplicate_teacher(&state.db, mobile.as_deref(), national_code.as_deref(), Some(id))?
    {
        return Err(HandlerErr::bad_params("National code or mobile number already exists"));
    }

    let portrait = save_portrait(state, req, PORTRAIT_FIELD, PORTRAIT_BUCKET, "teacher-")?;

    let tx = state.db.unchecked_transaction()?;
    let set_text = |column: &str, value: Option<String>| -> rusqlite::Result<()> {
        if let Some(v) = value {
            tx.execute(&format!("UPDATE teachers SET {column} = ? WHERE id = ?"), (v, id))?;
        }
        Ok(())
    };
    set_text("mobile", mobile)?;
    set_text("national_code", national_code)?;
    set_text("academic_level", academic_level.map(str::to_string))?;
    for column in [
        "first_name",
        "last_name",
        "birth_date",
        "birth_certificate_number",
        "academic_year",
    ] {
        set_text(column, get_optional_str(p, column))?;
    }
    if let Some(f) = &portrait {
        tx.execute(
            "UPDATE teachers SET portrait_url = ?, portrait_file = ? WHERE id = ?",
            (&f.url, &f.file_name, id),
        )?;
    }
    tx.execute(
        "UPDATE teachers SET updated_at = ? WHERE id = ?",
        (now_rfc3339(), id),
    )?;
    tx.commit()?;

    if portrait.is_some() {
        discard_portrait(state, PORTRAIT_BUCKET, old_portrait.as_deref());
    }

    let data = load_teacher(&state.db, id)?;
    Ok(ok(json!({
        "success": true,
        "message": "Teacher updated successfully",
        "data": data,
    })))
}

fn handle_delete(state: &mut AppState, req: &Request, id: &str) -> HandlerResult {
    let staff = guard::require_staff(state, req, &["register_teachers"])?;
    let portrait: Option<Option<String>> = state
        .db
        .query_row("SELECT portrait_file FROM teachers WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    let Some(portrait) = portrait else {
        return Err(HandlerErr::not_found("Teacher not found"));
    };

    let scheduled: i64 = state.db.query_row(
        "SELECT COUNT(*) FROM class_periods WHERE teacher_id = ?",
        [id],
        |r| r.get(0),
    )?;
    if scheduled > 0 {
        return Err(HandlerErr::conflict(format!(
            "Teacher is still assigned to {scheduled} period(s); remove them from the timetable first"
        ))
        .with_details(json!({ "periods": scheduled })));
    }

    let tx = state.db.unchecked_transaction()?;
    tx.execute("DELETE FROM teacher_reports WHERE teacher_id = ?", [id])?;
    tx.execute("UPDATE attendance SET teacher_id = NULL WHERE teacher_id = ?", [id])?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [id])?;
    tx.commit()?;
    auth::revoke_sessions(&state.db, AccountKind::Teacher, id)?;
    discard_portrait(state, PORTRAIT_BUCKET, portrait.as_deref());

    info!(by = %staff.id, teacher = %id, "teacher deleted");
    Ok(ok(json!({ "success": true, "message": "Teacher deleted successfully" })))
}

fn handle_login(state: &mut AppState, req: &Request) -> HandlerResult {
    let (teacher_id, session) = otp::login(state, req, &TEACHER_OTP)?;
    let teacher = load_teacher(&state.db, &teacher_id)?
        .ok_or_else(|| HandlerErr::not_found("Teacher not found"))?;
    Ok(ok(json!({
        "message": "Login successful",
        "token": session.token,
        "expiresAt": session.expires_at.to_rfc3339(),
        "teacher": {
            "id": teacher["id"],
            "mobile": teacher["mobile"],
            "firstName": teacher["first_name"],
            "lastName": teacher["last_name"],
        },
    })))
}

fn handle_me(state: &mut AppState, req: &Request) -> HandlerResult {
    let teacher_id = guard::require_teacher(state, req)?;
    let teacher = load_teacher(&state.db, &teacher_id)?
        .ok_or_else(|| HandlerErr::not_found("Teacher not found"))?;
    Ok(ok(json!({
        "id": teacher["id"],
        "mobile": teacher["mobile"],
        "firstName": teacher["first_name"],
        "lastName": teacher["last_name"],
    })))
}

fn handle_reports_get(state: &mut AppState, req: &Request, id: &str) -> HandlerResult {
    match guard::authenticate(state, req)? {
        Principal::Teacher { id: own } if own == id => {}
        Principal::Staff(user) if user.has_any(REPORT_PERMS) || user.has_any(VIEW_PERMS) => {}
        _ => return Err(HandlerErr::forbidden("Insufficient permissions")),
    }
    if load_teacher(&state.db, id)?.is_none() {
        return Err(HandlerErr::not_found("Teacher not found"));
    }
    let mut stmt = state.db.prepare(
        "SELECT id, date, message FROM teacher_reports WHERE teacher_id = ? ORDER BY created_at, rowid",
    )?;
    let reports = stmt
        .query_map([id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "message": r.get::<_, String>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ok(json!({ "amount": reports.len(), "reports": reports })))
}

fn handle_reports_add(state: &mut AppState, req: &Request) -> HandlerResult {
    let staff = guard::require_staff(state, req, REPORT_PERMS)?;
    let p = &req.body;
    let (teacher_id, date, message) = match (
        get_required_str(p, "teacherId"),
        get_required_str(p, "date"),
        get_required_str(p, "message"),
    ) {
        (Ok(t), Ok(d), Ok(m)) => (t, d, m),
        _ => {
            return Err(HandlerErr::bad_params(
                "teacherId, date, and message are required",
            ))
        }
    };
    if load_teacher(&state.db, &teacher_id)?.is_none() {
        return Err(HandlerErr::not_found("Teacher not found"));
    }
    state.db.execute(
        "INSERT INTO teacher_reports(id, teacher_id, date, message, created_at) VALUES(?, ?, ?, ?, ?)",
        (new_id(), &teacher_id, &date, &message, now_rfc3339()),
    )?;
    info!(by = %staff.id, teacher = %teacher_id, "teacher report filed");
    handle_reports_get(state, req, &teacher_id).map(|mut resp| {
        resp.status = 201;
        resp
    })
}

pub fn try_handle(state: &mut AppState, req: &Request, segs: &[&str]) -> Option<HandlerResult> {
    let res = match (req.method, segs) {
        (Method::Post, ["teacher", "send-otp"]) => otp::send_otp(state, req, &TEACHER_OTP),
        (Method::Post, ["teacher", "check-otp"]) => otp::check_otp(state, req, &TEACHER_OTP),
        (Method::Post, ["teacher", "login"]) => handle_login(state, req),
        (Method::Get, ["teacher", "me"]) => handle_me(state, req),
        (Method::Get, ["teacher", "reports", id]) => handle_reports_get(state, req, id),
        (Method::Post, ["teacher", "reports"]) => handle_reports_add(state, req),
        (Method::Post, ["teacher"]) => handle_create(state, req),
        (Method::Get, ["teacher"]) => handle_list(state, req),
        (Method::Get, ["teacher", id]) => handle_get(state, req, id),
        (Method::Put, ["teacher", id]) => handle_edit(state, req, id),
        (Method::Delete, ["teacher", id]) => handle_delete(state, req, id),
        _ => return None,
    };
    Some(res)
}
