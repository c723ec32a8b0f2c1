//! Per-period attendance and its sign-off chain: the teacher submits, the
//! disciplinary deputy may correct and then confirms, and the principal
//! confirms last. A deputy-confirmed record is frozen.

use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

use super::classes::{class_exists, class_id_by_name, class_student_ids, timetable_period};
use super::students::{student_id_by_national_code, VIEW_PERMS as STUDENT_VIEW_PERMS};
use crate::api::error::{ok, HandlerErr, HandlerResult};
use crate::api::guard::{self, Principal};
use crate::api::helpers::{get_optional_i64, get_required_i64, get_required_str};
use crate::api::types::{AppState, Method, Request};
use crate::db::{new_id, now_rfc3339};
use crate::model::{parse_iso_date, Day, ATTENDANCE_STATUS};

const DEPUTY_PERMS: &[&str] = &["disciplinary_deputy"];
const PRINCIPAL_PERMS: &[&str] = &["principal"];
const VIEW_PERMS: &[&str] = &[
    "disciplinary_deputy",
    "principal",
    "educational_deputy",
    "manage_students",
];

/// One timetable slot on one date.
#[derive(Debug, Clone)]
struct Slot {
    class_id: String,
    date: String,
    day: Day,
    period: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassRef {
    Id,
    Name,
}

#[derive(Debug, Clone)]
struct Existing {
    id: String,
    by_deputy: bool,
    by_principal: bool,
}

fn parse_slot(conn: &Connection, params: &serde_json::Value, by: ClassRef) -> Result<Slot, HandlerErr> {
    let class_key = match by {
        ClassRef::Id => "classId",
        ClassRef::Name => "className",
    };
    let (class_raw, date, day_raw, period) = match (
        get_required_str(params, class_key),
        get_required_str(params, "date"),
        get_required_str(params, "day"),
        get_required_i64(params, "period"),
    ) {
        (Ok(c), Ok(d), Ok(day), Ok(p)) => (c, d, day, p),
        _ => {
            return Err(HandlerErr::bad_params("Missing required fields")
                .with_details(json!({ "required": [class_key, "date", "day", "period"] })))
        }
    };
    if parse_iso_date(&date).is_none() {
        return Err(HandlerErr::bad_params("Invalid date format (use YYYY-MM-DD)"));
    }
    let day = Day::parse(&day_raw).ok_or_else(|| HandlerErr::bad_params("Invalid day"))?;
    let class_id = match by {
        ClassRef::Id if class_exists(conn, &class_raw)? => Some(class_raw),
        ClassRef::Id => None,
        ClassRef::Name => class_id_by_name(conn, &class_raw)?,
    };
    let class_id = class_id.ok_or_else(|| HandlerErr::not_found("Class not found"))?;
    Ok(Slot {
        class_id,
        date,
        day,
        period,
    })
}

fn find_existing(conn: &Connection, slot: &Slot) -> Result<Option<Existing>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id, confirmed_by_deputy, confirmed_by_principal FROM attendance
             WHERE class_id = ? AND date = ? AND day = ? AND period = ?",
            (&slot.class_id, &slot.date, slot.day.as_str(), slot.period),
            |r| {
                Ok(Existing {
                    id: r.get(0)?,
                    by_deputy: r.get::<_, i64>(1)? != 0,
                    by_principal: r.get::<_, i64>(2)? != 0,
                })
            },
        )
        .optional()?)
}

fn require_existing(conn: &Connection, slot: &Slot) -> Result<Existing, HandlerErr> {
    find_existing(conn, slot)?.ok_or_else(|| HandlerErr::not_found("Attendance record not found"))
}

fn ensure_editable(existing: &Existing) -> Result<(), HandlerErr> {
    if existing.by_deputy {
        return Err(HandlerErr::locked(
            "Attendance already confirmed by disciplinary deputy, cannot edit",
        ));
    }
    Ok(())
}

fn scheduled_period(conn: &Connection, slot: &Slot) -> Result<(String, String), HandlerErr> {
    timetable_period(conn, &slot.class_id, slot.day, slot.period)?
        .ok_or_else(|| HandlerErr::bad_params("Invalid day or period for this class"))
}

/// Teachers and the disciplinary deputy may write attendance.
fn writer_principal(state: &AppState, req: &Request) -> Result<Principal, HandlerErr> {
    match guard::authenticate(state, req)? {
        p @ Principal::Teacher { .. } => Ok(p),
        Principal::Staff(user) if user.has_any(DEPUTY_PERMS) => Ok(Principal::Staff(user)),
        _ => Err(HandlerErr::forbidden("Insufficient permissions")),
    }
}

/// Teachers may write only periods they teach; the deputy may write any.
/// Returns the acting account id.
fn authorize_slot(principal: Principal, scheduled_teacher: &str) -> Result<String, HandlerErr> {
    match principal {
        Principal::Teacher { id } if id == scheduled_teacher => Ok(id),
        Principal::Teacher { .. } => Err(HandlerErr::forbidden(
            "You are not scheduled to teach this period",
        )),
        Principal::Staff(user) => Ok(user.id),
        Principal::Student { .. } => Err(HandlerErr::forbidden("Insufficient permissions")),
    }
}

/// Parses `attendances` and checks it names every class member exactly once.
fn parse_entries(
    params: &serde_json::Value,
    class_students: &[String],
) -> Result<Vec<(String, &'static str)>, HandlerErr> {
    let Some(list) = params.get("attendances").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("Missing required fields")
            .with_details(json!({ "required": ["attendances"] })));
    };
    let mut entries = Vec::with_capacity(list.len());
    let mut seen = HashSet::new();
    for item in list {
        let Ok(student_id) = get_required_str(item, "studentId") else {
            return Err(HandlerErr::bad_params("Each attendance needs a studentId"));
        };
        let raw_status = get_required_str(item, "status").unwrap_or_default();
        let Some(status) = ATTENDANCE_STATUS.normalize(&raw_status) else {
            return Err(HandlerErr::bad_params(format!("Invalid status: {raw_status}"))
                .with_details(json!({ "allowed": ATTENDANCE_STATUS.values() })));
        };
        if !seen.insert(student_id.clone()) {
            return Err(HandlerErr::bad_params("A student appears more than once"));
        }
        entries.push((student_id, status));
    }
    let expected: HashSet<&String> = class_students.iter().collect();
    if expected.len() != seen.len() || !seen.iter().all(|id| expected.contains(id)) {
        return Err(HandlerErr::bad_params(
            "Attendance must be provided for all students in the class",
        ));
    }
    Ok(entries)
}

fn replace_entries(
    conn: &Connection,
    attendance_id: &str,
    entries: &[(String, &'static str)],
) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM attendance_entries WHERE attendance_id = ?",
        [attendance_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO attendance_entries(attendance_id, student_id, status) VALUES(?, ?, ?)",
    )?;
    for (student_id, status) in entries {
        stmt.execute((attendance_id, student_id, status))?;
    }
    Ok(())
}

fn handle_submit(state: &mut AppState, req: &Request) -> HandlerResult {
    let principal = writer_principal(state, req)?;
    let slot = parse_slot(&state.db, &req.body, ClassRef::Id)?;
    let (subject, teacher_id) = scheduled_period(&state.db, &slot)?;
    let actor = authorize_slot(principal, &teacher_id)?;
    let members = class_student_ids(&state.db, &slot.class_id)?;
    let entries = parse_entries(&req.body, &members)?;

    let existing = find_existing(&state.db, &slot)?;
    if let Some(e) = &existing {
        ensure_editable(e)?;
    }

    let now = now_rfc3339();
    let tx = state.db.unchecked_transaction()?;
    let attendance_id = match existing {
        Some(e) => {
            tx.execute(
                "UPDATE attendance SET subject = ?, teacher_id = ?, updated_at = ? WHERE id = ?",
                (&subject, &teacher_id, &now, &e.id),
            )?;
            e.id
        }
        None => {
            let id = new_id();
            tx.execute(
                "INSERT INTO attendance(id, class_id, date, day, period, subject, teacher_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    id,
                    slot.class_id,
                    slot.date,
                    slot.day.as_str(),
                    slot.period,
                    subject,
                    teacher_id,
                    now,
                    now
                ],
            )?;
            id
        }
    };
    replace_entries(&tx, &attendance_id, &entries)?;
    tx.commit()?;

    info!(
        by = %actor,
        class = %slot.class_id,
        date = %slot.date,
        period = slot.period,
        "attendance saved"
    );
    Ok(ok(json!({ "message": "Attendance saved successfully", "id": attendance_id })))
}

fn handle_report(state: &mut AppState, req: &Request) -> HandlerResult {
    let principal = writer_principal(state, req)?;
    let slot = parse_slot(&state.db, &req.body, ClassRef::Id)?;
    let (_, teacher_id) = scheduled_period(&state.db, &slot)?;
    authorize_slot(principal, &teacher_id)?;
    let existing = find_existing(&state.db, &slot)?.ok_or_else(|| {
        HandlerErr::not_found("Attendance record not found. Please submit attendance first.")
    })?;
    ensure_editable(&existing)?;

    let report = req
        .body
        .get("report")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    state.db.execute(
        "UPDATE attendance SET report = ?, updated_at = ? WHERE id = ?",
        (&report, now_rfc3339(), &existing.id),
    )?;
    Ok(ok(json!({ "message": "Report updated successfully" })))
}

fn handle_deputy_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let staff = guard::require_staff(state, req, DEPUTY_PERMS)?;
    let slot = parse_slot(&state.db, &req.body, ClassRef::Name)?;
    let existing = require_existing(&state.db, &slot)?;
    ensure_editable(&existing)?;
    scheduled_period(&state.db, &slot)?;
    let members = class_student_ids(&state.db, &slot.class_id)?;
    let entries = parse_entries(&req.body, &members)?;

    let now = now_rfc3339();
    let tx = state.db.unchecked_transaction()?;
    replace_entries(&tx, &existing.id, &entries)?;
    if let Some(report) = req.body.get("report").and_then(|v| v.as_str()) {
        tx.execute(
            "UPDATE attendance SET report = ? WHERE id = ?",
            (report, &existing.id),
        )?;
    }
    tx.execute(
        "UPDATE attendance SET updated_at = ? WHERE id = ?",
        (&now, &existing.id),
    )?;
    tx.commit()?;
    info!(by = %staff.id, attendance = %existing.id, "attendance corrected by deputy");
    Ok(ok(json!({ "message": "Attendance updated successfully" })))
}

fn handle_confirm_deputy(state: &mut AppState, req: &Request) -> HandlerResult {
    let staff = guard::require_staff(state, req, DEPUTY_PERMS)?;
    let slot = parse_slot(&state.db, &req.body, ClassRef::Name)?;
    let existing = require_existing(&state.db, &slot)?;
    state.db.execute(
        "UPDATE attendance SET confirmed_by_deputy = 1, updated_at = ? WHERE id = ?",
        (now_rfc3339(), &existing.id),
    )?;
    info!(by = %staff.id, attendance = %existing.id, "attendance confirmed by deputy");
    Ok(ok(json!({ "message": "Confirmed by disciplinary deputy successfully" })))
}

fn handle_confirm_principal(state: &mut AppState, req: &Request) -> HandlerResult {
    let staff = guard::require_staff(state, req, PRINCIPAL_PERMS)?;
    let slot = parse_slot(&state.db, &req.body, ClassRef::Name)?;
    let existing = require_existing(&state.db, &slot)?;
    if !existing.by_deputy {
        return Err(HandlerErr::conflict(
            "Attendance must be confirmed by the disciplinary deputy first",
        ));
    }
    if !existing.by_principal {
        state.db.execute(
            "UPDATE attendance SET confirmed_by_principal = 1, updated_at = ? WHERE id = ?",
            (now_rfc3339(), &existing.id),
        )?;
    }
    info!(by = %staff.id, attendance = %existing.id, "attendance confirmed by principal");
    Ok(ok(json!({ "message": "Confirmed by principal successfully" })))
}

fn record_entries(conn: &Connection, attendance_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.first_name, s.last_name, s.national_code, e.status
         FROM attendance_entries e JOIN students s ON s.id = e.student_id
         WHERE e.attendance_id = ? ORDER BY s.last_name, s.first_name",
    )?;
    let rows = stmt
        .query_map([attendance_id], |r| {
            Ok(json!({
                "student": {
                    "id": r.get::<_, String>(0)?,
                    "first_name": r.get::<_, String>(1)?,
                    "last_name": r.get::<_, String>(2)?,
                    "national_code": r.get::<_, String>(3)?,
                },
                "status": r.get::<_, String>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

const RECORD_SELECT: &str = "SELECT a.id, a.class_id, c.name, a.date, a.day, a.period, a.subject,
        t.id, t.first_name, t.last_name, t.mobile, a.report,
        a.confirmed_by_deputy, a.confirmed_by_principal, a.created_at, a.updated_at
    FROM attendance a
    JOIN classes c ON c.id = a.class_id
    LEFT JOIN teachers t ON t.id = a.teacher_id";

fn record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let teacher = match r.get::<_, Option<String>>(7)? {
        Some(id) => json!({
            "id": id,
            "first_name": r.get::<_, String>(8)?,
            "last_name": r.get::<_, String>(9)?,
            "mobile": r.get::<_, String>(10)?,
        }),
        None => serde_json::Value::Null,
    };
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "classId": r.get::<_, String>(1)?,
        "className": r.get::<_, String>(2)?,
        "date": r.get::<_, String>(3)?,
        "day": r.get::<_, String>(4)?,
        "period": r.get::<_, i64>(5)?,
        "subject": r.get::<_, String>(6)?,
        "teacher": teacher,
        "report": r.get::<_, String>(11)?,
        "confirmedBy": {
            "disciplinaryDeputy": r.get::<_, i64>(12)? != 0,
            "principal": r.get::<_, i64>(13)? != 0,
        },
        "createdAt": r.get::<_, String>(14)?,
        "updatedAt": r.get::<_, String>(15)?,
    }))
}

/// Records matching `filter` (a `WHERE` body over `a`/`c`), each with its
/// student statuses attached.
fn load_records<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "{RECORD_SELECT} WHERE {filter} ORDER BY a.date, c.name, a.period"
    ))?;
    let mut records = stmt
        .query_map(params, record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for rec in &mut records {
        let id = rec["id"].as_str().unwrap_or_default().to_string();
        rec["studentsAttendance"] = json!(record_entries(conn, &id)?);
    }
    Ok(records)
}

fn require_viewer(state: &AppState, req: &Request) -> Result<(), HandlerErr> {
    match guard::authenticate(state, req)? {
        Principal::Teacher { .. } => Ok(()),
        Principal::Staff(user) if user.has_any(VIEW_PERMS) => Ok(()),
        Principal::Staff(_) => Err(HandlerErr::forbidden("Insufficient permissions")
            .with_details(json!({ "required": VIEW_PERMS }))),
        Principal::Student { .. } => Err(HandlerErr::forbidden("Staff or teacher account required")),
    }
}

fn handle_class_attendance(state: &mut AppState, req: &Request, class_id: &str) -> HandlerResult {
    require_viewer(state, req)?;
    if !class_exists(&state.db, class_id)? {
        return Err(HandlerErr::not_found("Class not found"));
    }
    let q = serde_json::to_value(&req.query).unwrap_or_default();
    let date = req.query.get("date").map(|s| s.trim()).filter(|s| !s.is_empty());
    let day = match req.query.get("day").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(raw) => Some(Day::parse(raw).ok_or_else(|| HandlerErr::bad_params("Invalid day"))?),
        None => None,
    };
    let period = get_optional_i64(&q, "period")?;
    let records = load_records(
        &state.db,
        "a.class_id = ?1 AND (?2 IS NULL OR a.date = ?2)
         AND (?3 IS NULL OR a.day = ?3) AND (?4 IS NULL OR a.period = ?4)",
        (class_id, date, day.map(Day::as_str), period),
    )?;
    Ok(ok(json!(records)))
}

fn handle_by_date(state: &mut AppState, req: &Request, date: &str) -> HandlerResult {
    require_viewer(state, req)?;
    if parse_iso_date(date).is_none() {
        return Err(HandlerErr::bad_params("Invalid date format (use YYYY-MM-DD)"));
    }
    let records = load_records(&state.db, "a.date = ?1", [date])?;
    let mut grouped: Vec<serde_json::Value> = Vec::new();
    for rec in records {
        let name = rec["className"].clone();
        let same_class = grouped.last().is_some_and(|g| g["className"] == name);
        if same_class {
            if let Some(list) = grouped
                .last_mut()
                .and_then(|g| g["attendance"].as_array_mut())
            {
                list.push(rec);
            }
        } else {
            grouped.push(json!({ "className": name, "attendance": [rec] }));
        }
    }
    Ok(ok(json!(grouped)))
}

/// Timetabled periods on `date`'s weekday that have no record for `date`.
pub fn missing_attendance(conn: &Connection, date: &str, day: Day) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, p.position, p.subject, t.id, t.first_name, t.last_name, t.mobile
         FROM class_periods p
         JOIN classes c ON c.id = p.class_id
         JOIN teachers t ON t.id = p.teacher_id
         WHERE p.day = ?1 AND NOT EXISTS (
            SELECT 1 FROM attendance a
            WHERE a.class_id = p.class_id AND a.date = ?2 AND a.day = ?1 AND a.period = p.position
         )
         ORDER BY c.name, p.position",
    )?;
    let rows = stmt
        .query_map((day.as_str(), date), |r| {
            Ok(json!({
                "classId": r.get::<_, String>(0)?,
                "className": r.get::<_, String>(1)?,
                "date": date,
                "day": day.as_str(),
                "period": r.get::<_, i64>(2)?,
                "subject": r.get::<_, String>(3)?,
                "teacherId": r.get::<_, String>(4)?,
                "teacherName": format!("{} {}", r.get::<_, String>(5)?, r.get::<_, String>(6)?),
                "teacherMobile": r.get::<_, String>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_missing(state: &mut AppState, req: &Request, date: &str) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    let Some(parsed) = parse_iso_date(date) else {
        return Err(HandlerErr::bad_params("Invalid date format (use YYYY-MM-DD)"));
    };
    Ok(ok(json!(missing_attendance(&state.db, date, Day::of_date(parsed))?)))
}

fn handle_reports(state: &mut AppState, req: &Request) -> HandlerResult {
    guard::require_staff(state, req, &["disciplinary_deputy", "principal"])?;
    let stage = match req.query.get("status").map(|s| s.trim()).unwrap_or("") {
        "" => "1 = 1",
        "unconfirmed" => "a.confirmed_by_deputy = 0",
        "deputy" => "a.confirmed_by_deputy = 1 AND a.confirmed_by_principal = 0",
        "confirmed" => "a.confirmed_by_principal = 1",
        other => {
            return Err(HandlerErr::bad_params(format!("Invalid status: {other}"))
                .with_details(json!({ "allowed": ["unconfirmed", "deputy", "confirmed"] })))
        }
    };
    let records = load_records(&state.db, &format!("a.report <> '' AND {stage}"), [])?;
    Ok(ok(json!(records)))
}

/// A student's attendance across all records, newest first.
pub fn student_history(conn: &Connection, student_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT a.date, a.day, a.period, a.subject, c.name, e.status, t.first_name, t.last_name,
                a.confirmed_by_deputy, a.confirmed_by_principal
         FROM attendance_entries e
         JOIN attendance a ON a.id = e.attendance_id
         JOIN classes c ON c.id = a.class_id
         LEFT JOIN teachers t ON t.id = a.teacher_id
         WHERE e.student_id = ?
         ORDER BY a.date DESC, a.period",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            let teacher = match (r.get::<_, Option<String>>(6)?, r.get::<_, Option<String>>(7)?) {
                (Some(f), Some(l)) => json!(format!("{f} {l}")),
                _ => serde_json::Value::Null,
            };
            Ok(json!({
                "date": r.get::<_, String>(0)?,
                "day": r.get::<_, String>(1)?,
                "period": r.get::<_, i64>(2)?,
                "subject": r.get::<_, String>(3)?,
                "className": r.get::<_, String>(4)?,
                "status": r.get::<_, String>(5)?,
                "teacher": teacher,
                "confirmedBy": {
                    "disciplinaryDeputy": r.get::<_, i64>(8)? != 0,
                    "principal": r.get::<_, i64>(9)? != 0,
                },
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_student_history(state: &mut AppState, req: &Request, national_code: &str) -> HandlerResult {
    guard::require_staff(state, req, STUDENT_VIEW_PERMS)?;
    let Some(student_id) = student_id_by_national_code(&state.db, national_code)? else {
        return Err(HandlerErr::not_found("Student not found"));
    };
    Ok(ok(json!(student_history(&state.db, &student_id)?)))
}

fn handle_my_history(state: &mut AppState, req: &Request) -> HandlerResult {
    let student_id = guard::require_student(state, req)?;
    Ok(ok(json!(student_history(&state.db, &student_id)?)))
}

pub fn try_handle(state: &mut AppState, req: &Request, segs: &[&str]) -> Option<HandlerResult> {
    let res = match (req.method, segs) {
        (Method::Post, ["class", "attendance"]) => handle_submit(state, req),
        (Method::Post, ["class", "attendance", "report"]) => handle_report(state, req),
        (Method::Post, ["class", "attendance", "deputy-update"]) => handle_deputy_update(state, req),
        (Method::Post, ["class", "attendance", "confirm-deputy"]) => {
            handle_confirm_deputy(state, req)
        }
        (Method::Post, ["class", "attendance", "confirm-principal"]) => {
            handle_confirm_principal(state, req)
        }
        (Method::Get, ["class", "attendance-reports"]) => handle_reports(state, req),
        (Method::Get, ["class", "attendance", date]) => handle_by_date(state, req, date),
        (Method::Get, ["class", "missing-attendance", date]) => handle_missing(state, req, date),
        (Method::Get, ["class", class_id, "attendance"]) => {
            handle_class_attendance(state, req, class_id)
        }
        (Method::Get, ["student", "me", "attendance"]) => handle_my_history(state, req),
        (Method::Get, ["student", national_code, "attendance"]) => {
            handle_student_history(state, req, national_code)
        }
        _ => return None,
    };
    Some(res)
}
