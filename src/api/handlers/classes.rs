use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

use crate::api::error::{created, ok, HandlerErr, HandlerResult};
use crate::api::guard;
use crate::api::helpers::{get_optional_i64, get_required_str, get_str_array, row_exists};
use crate::api::types::{AppState, Method, Request};
use crate::db::{new_id, now_rfc3339};
use crate::model::{Day, EDUCATION_LEVEL};

/// Building classes, the timetable, and class membership.
pub const MANAGE_PERMS: &[&str] = &["manage_students"];
/// Staff who may look at classes and rosters.
pub const VIEW_PERMS: &[&str] = &[
    "manage_students",
    "register_student",
    "register_teachers",
    "disciplinary_deputy",
    "educational_deputy",
    "principal",
    "evaluate_performance",
];

pub fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", class_id)
}

pub fn class_id_by_name(conn: &Connection, name: &str) -> Result<Option<String>, HandlerErr> {
    Ok(conn
        .query_row("SELECT id FROM classes WHERE name = ?", [name], |r| r.get(0))
        .optional()?)
}

pub fn class_student_ids(conn: &Connection, class_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn.prepare("SELECT id FROM students WHERE class_id = ? ORDER BY last_name, first_name")?;
    let ids = stmt
        .query_map([class_id], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// `(subject, teacher_id)` of a 1-based period, if the timetable has it.
pub fn timetable_period(
    conn: &Connection,
    class_id: &str,
    day: Day,
    period: i64,
) -> Result<Option<(String, String)>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT subject, teacher_id FROM class_periods WHERE class_id = ? AND day = ? AND position = ?",
            (class_id, day.as_str(), period),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?)
}

fn periods_on(conn: &Connection, class_id: &str, day: Day) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM class_periods WHERE class_id = ? AND day = ?",
        (class_id, day.as_str()),
        |r| r.get(0),
    )?)
}

fn parse_day(params: &serde_json::Value) -> Result<Day, HandlerErr> {
    let raw = get_required_str(params, "day")?;
    Day::parse(&raw).ok_or_else(|| HandlerErr::bad_params("Invalid day"))
}

fn parse_level(raw: &str) -> Result<&'static str, HandlerErr> {
    EDUCATION_LEVEL
        .normalize(raw)
        .ok_or_else(|| HandlerErr::bad_params("Invalid level"))
}

fn brief_students(conn: &Connection, class_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name, national_code FROM students
         WHERE class_id = ? ORDER BY last_name, first_name",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "first_name": r.get::<_, String>(1)?,
                "last_name": r.get::<_, String>(2)?,
                "national_code": r.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn timetable_json(conn: &Connection, class_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let mut days = serde_json::Map::new();
    for day in Day::ALL {
        days.insert(day.as_str().to_string(), json!([]));
    }
    let mut stmt = conn.prepare(
        "SELECT p.day, p.position, p.subject, t.id, t.first_name, t.last_name, t.mobile
         FROM class_periods p LEFT JOIN teachers t ON t.id = p.teacher_id
         WHERE p.class_id = ? ORDER BY p.day, p.position",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            let teacher = match r.get::<_, Option<String>>(3)? {
                Some(id) => json!({
                    "id": id,
                    "first_name": r.get::<_, String>(4)?,
                    "last_name": r.get::<_, String>(5)?,
                    "mobile": r.get::<_, String>(6)?,
                }),
                None => serde_json::Value::Null,
            };
            Ok((
                r.get::<_, String>(0)?,
                json!({
                    "period": r.get::<_, i64>(1)?,
                    "subject": r.get::<_, String>(2)?,
                    "teacher": teacher,
                }),
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (day, period) in rows {
        if let Some(serde_json::Value::Array(list)) = days.get_mut(&day) {
            list.push(period);
        }
    }
    Ok(serde_json::Value::Object(days))
}

pub fn class_json(conn: &Connection, class_id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT name, level FROM classes WHERE id = ?",
            [class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((name, level)) = row else {
        return Ok(None);
    };
    Ok(Some(json!({
        "id": class_id,
        "name": name,
        "level": level,
        "days": timetable_json(conn, class_id)?,
        "students": brief_students(conn, class_id)?,
    })))
}

fn classes_where(conn: &Connection, level: Option<&str>) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id FROM classes WHERE ?1 IS NULL OR level = ?1 ORDER BY name",
    )?;
    let ids = stmt
        .query_map([level], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(c) = class_json(conn, &id)? {
            out.push(c);
        }
    }
    Ok(out)
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    Ok(ok(json!(classes_where(&state.db, None)?)))
}

fn handle_by_name(state: &mut AppState, req: &Request, name: &str) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    let Some(id) = class_id_by_name(&state.db, name)? else {
        return Err(HandlerErr::not_found("Class not found"));
    };
    class_json(&state.db, &id)?
        .map(ok)
        .ok_or_else(|| HandlerErr::not_found("Class not found"))
}

fn handle_by_level(state: &mut AppState, req: &Request, level: &str) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    let level = parse_level(level)?;
    Ok(ok(json!(classes_where(&state.db, Some(level))?)))
}

fn handle_add(state: &mut AppState, req: &Request) -> HandlerResult {
    let staff = guard::require_staff(state, req, MANAGE_PERMS)?;
    let (name, level) = match (
        get_required_str(&req.body, "name"),
        get_required_str(&req.body, "level"),
    ) {
        (Ok(n), Ok(l)) => (n, l),
        _ => return Err(HandlerErr::bad_params("Class name and level are required")),
    };
    let level = parse_level(&level)?;
    if class_id_by_name(&state.db, &name)?.is_some() {
        return Err(HandlerErr::bad_params("Class with this name already exists"));
    }
    let id = new_id();
    state.db.execute(
        "INSERT INTO classes(id, name, level, created_at) VALUES(?, ?, ?, ?)",
        (&id, &name, level, now_rfc3339()),
    )?;
    info!(by = %staff.id, class = %name, level, "class created");
    Ok(created(json!({
        "message": "Class created successfully",
        "class": class_json(&state.db, &id)?,
    })))
}

fn handle_delete(state: &mut AppState, req: &Request, class_id: &str) -> HandlerResult {
    let staff = guard::require_staff(state, req, MANAGE_PERMS)?;
    let Some(deleted) = class_json(&state.db, class_id)? else {
        return Err(HandlerErr::not_found("Class not found"));
    };
    let tx = state.db.unchecked_transaction()?;
    tx.execute("UPDATE students SET class_id = NULL WHERE class_id = ?", [class_id])?;
    tx.execute(
        "DELETE FROM attendance_entries
         WHERE attendance_id IN (SELECT id FROM attendance WHERE class_id = ?)",
        [class_id],
    )?;
    tx.execute("DELETE FROM attendance WHERE class_id = ?", [class_id])?;
    tx.execute("DELETE FROM class_periods WHERE class_id = ?", [class_id])?;
    tx.execute("DELETE FROM classes WHERE id = ?", [class_id])?;
    tx.commit()?;
    info!(by = %staff.id, class = %class_id, "class deleted");
    Ok(ok(json!({
        "message": "Class deleted successfully",
        "deletedClass": deleted,
    })))
}

fn handle_assign_teacher(state: &mut AppState, req: &Request) -> HandlerResult {
    guard::require_staff(state, req, MANAGE_PERMS)?;
    let p = &req.body;
    let class_id = get_required_str(p, "classId")?;
    let subject = get_required_str(p, "subject")?;
    let teacher_id = get_required_str(p, "teacherId")?;
    let day = parse_day(p)?;
    let period = get_optional_i64(p, "period")?;

    if !class_exists(&state.db, &class_id)? {
        return Err(HandlerErr::not_found("Class not found"));
    }
    if !row_exists(&state.db, "SELECT 1 FROM teachers WHERE id = ?", &teacher_id)? {
        return Err(HandlerErr::not_found("Teacher not found"));
    }

    let count = periods_on(&state.db, &class_id, day)?;
    match period {
        Some(n) if n < 1 || n > count => {
            return Err(HandlerErr::bad_params("Invalid period index")
                .with_details(json!({ "periods": count })));
        }
        Some(n) => {
            state.db.execute(
                "UPDATE class_periods SET subject = ?, teacher_id = ?
                 WHERE class_id = ? AND day = ? AND position = ?",
                (&subject, &teacher_id, &class_id, day.as_str(), n),
            )?;
        }
        None => {
            state.db.execute(
                "INSERT INTO class_periods(class_id, day, position, subject, teacher_id)
                 VALUES(?, ?, ?, ?, ?)",
                (&class_id, day.as_str(), count + 1, &subject, &teacher_id),
            )?;
        }
    }
    Ok(ok(json!({
        "message": "Teacher assigned successfully",
        "cls": class_json(&state.db, &class_id)?,
    })))
}

fn handle_remove_period(state: &mut AppState, req: &Request) -> HandlerResult {
    guard::require_staff(state, req, MANAGE_PERMS)?;
    let p = &req.body;
    let class_id = get_required_str(p, "classId")?;
    let day = parse_day(p)?;
    let period = get_optional_i64(p, "period")?
        .ok_or_else(|| HandlerErr::bad_params("missing period"))?;

    if !class_exists(&state.db, &class_id)? {
        return Err(HandlerErr::not_found("Class not found"));
    }
    let count = periods_on(&state.db, &class_id, day)?;
    if period < 1 || period > count {
        return Err(HandlerErr::bad_params("Invalid period index"));
    }

    let tx = state.db.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM class_periods WHERE class_id = ? AND day = ? AND position = ?",
        (&class_id, day.as_str(), period),
    )?;
    // Close the gap one row at a time, lowest first, so positions never collide.
    for pos in (period + 1)..=count {
        tx.execute(
            "UPDATE class_periods SET position = ? WHERE class_id = ? AND day = ? AND position = ?",
            (pos - 1, &class_id, day.as_str(), pos),
        )?;
    }
    tx.commit()?;
    Ok(ok(json!({
        "message": "Period removed successfully",
        "cls": class_json(&state.db, &class_id)?,
    })))
}

fn students_by_codes(conn: &Connection, codes: &[String]) -> Result<Vec<(String, serde_json::Value)>, HandlerErr> {
    let mut out = Vec::new();
    for code in codes {
        let row = conn
            .query_row(
                "SELECT id, first_name, last_name, national_code FROM students WHERE national_code = ?",
                [code],
                |r| {
                    let id: String = r.get(0)?;
                    Ok((
                        id.clone(),
                        json!({
                            "id": id,
                            "first_name": r.get::<_, String>(1)?,
                            "last_name": r.get::<_, String>(2)?,
                            "national_code": r.get::<_, String>(3)?,
                        }),
                    ))
                },
            )
            .optional()?;
        if let Some(found) = row {
            if !out.iter().any(|(id, _)| *id == found.0) {
                out.push(found);
            }
        }
    }
    Ok(out)
}

fn handle_membership(state: &mut AppState, req: &Request, add: bool) -> HandlerResult {
    let staff = guard::require_staff(state, req, MANAGE_PERMS)?;
    let class_id = get_required_str(&req.body, "classId")?;
    let codes = get_str_array(&req.body, "nationalCodes")?;
    if !class_exists(&state.db, &class_id)? {
        return Err(HandlerErr::not_found("Class not found"));
    }
    let students = students_by_codes(&state.db, &codes)?;
    if students.is_empty() {
        return Err(HandlerErr::not_found("No students found"));
    }

    let tx = state.db.unchecked_transaction()?;
    for (id, _) in &students {
        if add {
            tx.execute("UPDATE students SET class_id = ? WHERE id = ?", (&class_id, id))?;
        } else {
            tx.execute(
                "UPDATE students SET class_id = NULL WHERE id = ? AND class_id = ?",
                (id, &class_id),
            )?;
        }
    }
    tx.commit()?;
    info!(by = %staff.id, class = %class_id, count = students.len(), add, "class membership changed");

    let message = if add {
        "Students added successfully"
    } else {
        "Students removed successfully"
    };
    let students: Vec<_> = students.into_iter().map(|(_, s)| s).collect();
    Ok(ok(json!({ "message": message, "students": students })))
}

fn handle_students(state: &mut AppState, req: &Request, class_id: &str) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    if !class_exists(&state.db, class_id)? {
        return Err(HandlerErr::not_found("Class not found"));
    }
    Ok(ok(json!(brief_students(&state.db, class_id)?)))
}

/// Every period the teacher is timetabled for, as a flat list.
pub fn teacher_schedule(conn: &Connection, teacher_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, p.day, p.position, p.subject
         FROM class_periods p JOIN classes c ON c.id = p.class_id
         WHERE p.teacher_id = ?",
    )?;
    let mut rows = stmt
        .query_map([teacher_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.sort_by(|a, b| {
        (Day::parse(&a.2), &a.1, a.3).cmp(&(Day::parse(&b.2), &b.1, b.3))
    });
    Ok(rows
        .into_iter()
        .map(|(class_id, class_name, day, period, subject)| {
            json!({
                "classId": class_id,
                "className": class_name,
                "day": day,
                "period": period,
                "periodName": subject,
            })
        })
        .collect())
}

fn handle_teacher_classes(state: &mut AppState, req: &Request, teacher_id: &str) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    if !row_exists(&state.db, "SELECT 1 FROM teachers WHERE id = ?", teacher_id)? {
        return Err(HandlerErr::not_found("Teacher not found"));
    }
    Ok(ok(json!(teacher_schedule(&state.db, teacher_id)?)))
}

fn handle_my_classes(state: &mut AppState, req: &Request) -> HandlerResult {
    let teacher_id = guard::require_teacher(state, req)?;
    Ok(ok(json!(teacher_schedule(&state.db, &teacher_id)?)))
}

/// Unassigned students of a level, best grade first; ungraded last.
fn unassigned_students(conn: &Connection, level: &str) -> Result<Vec<(String, serde_json::Value)>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name, national_code, grade FROM students
         WHERE education_level = ? AND class_id IS NULL
         ORDER BY grade IS NULL, grade DESC, rowid",
    )?;
    let rows = stmt
        .query_map([level], |r| {
            let id: String = r.get(0)?;
            Ok((
                id.clone(),
                json!({
                    "id": id,
                    "first_name": r.get::<_, String>(1)?,
                    "last_name": r.get::<_, String>(2)?,
                    "national_code": r.get::<_, String>(3)?,
                    "grade": r.get::<_, Option<f64>>(4)?,
                }),
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Hands each student, in order, to whichever class currently has the fewest
/// students. Ties go to the earliest class in `sizes`.
pub fn balance_assignments(sizes: &mut [(String, usize)], students: usize) -> Vec<usize> {
    let mut picks = Vec::with_capacity(students);
    for _ in 0..students {
        let Some((idx, _)) = sizes
            .iter()
            .enumerate()
            .min_by_key(|(i, (_, n))| (*n, *i))
        else {
            break;
        };
        sizes[idx].1 += 1;
        picks.push(idx);
    }
    picks
}

fn handle_distribute(state: &mut AppState, req: &Request, level: &str) -> HandlerResult {
    let staff = guard::require_staff(state, req, MANAGE_PERMS)?;
    let level = parse_level(level)?;

    let mut stmt = state.db.prepare(
        "SELECT c.id, c.name, (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id)
         FROM classes c WHERE c.level = ? ORDER BY c.name",
    )?;
    let classes = stmt
        .query_map([level], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    if classes.is_empty() {
        return Err(HandlerErr::not_found("No classes found for this level"));
    }
    let students = unassigned_students(&state.db, level)?;
    if students.is_empty() {
        return Err(HandlerErr::not_found("No unassigned students found for this level"));
    }

    let mut sizes: Vec<(String, usize)> = classes
        .iter()
        .map(|(id, _, n)| (id.clone(), *n as usize))
        .collect();
    let picks = balance_assignments(&mut sizes, students.len());

    let tx = state.db.unchecked_transaction()?;
    for ((student_id, _), class_idx) in students.iter().zip(&picks) {
        tx.execute(
            "UPDATE students SET class_id = ? WHERE id = ?",
            (&sizes[*class_idx].0, student_id),
        )?;
    }
    tx.commit()?;

    info!(by = %staff.id, level, students = picks.len(), "students distributed");
    let summary: BTreeMap<&str, usize> = classes
        .iter()
        .zip(&sizes)
        .map(|((_, name, _), (_, n))| (name.as_str(), *n))
        .collect();
    Ok(ok(json!({
        "message": "Students distributed successfully",
        "assigned": picks.len(),
        "classSizes": summary,
    })))
}

fn handle_auto_add(state: &mut AppState, req: &Request, class_id: &str) -> HandlerResult {
    let staff = guard::require_staff(state, req, MANAGE_PERMS)?;
    let level: Option<String> = state
        .db
        .query_row("SELECT level FROM classes WHERE id = ?", [class_id], |r| r.get(0))
        .optional()?;
    let Some(level) = level else {
        return Err(HandlerErr::not_found("Class not found"));
    };
    let students = unassigned_students(&state.db, &level)?;
    if students.is_empty() {
        return Err(HandlerErr::not_found("No unassigned students found for this level"));
    }

    let tx = state.db.unchecked_transaction()?;
    for (student_id, _) in &students {
        tx.execute(
            "UPDATE students SET class_id = ? WHERE id = ?",
            (class_id, student_id),
        )?;
    }
    tx.commit()?;
    info!(by = %staff.id, class = %class_id, students = students.len(), "students auto-added");
    Ok(ok(json!({
        "message": "Students added automatically to the class",
        "added": students.len(),
    })))
}

fn handle_unassigned(state: &mut AppState, req: &Request, level: &str) -> HandlerResult {
    guard::require_staff(state, req, VIEW_PERMS)?;
    let level = parse_level(level)?;
    let students: Vec<_> = unassigned_students(&state.db, level)?
        .into_iter()
        .map(|(_, s)| s)
        .collect();
    Ok(ok(json!(students)))
}

pub fn try_handle(state: &mut AppState, req: &Request, segs: &[&str]) -> Option<HandlerResult> {
    let res = match (req.method, segs) {
        (Method::Get, ["class"]) => handle_list(state, req),
        (Method::Get, ["class", "name", name]) => handle_by_name(state, req, name),
        (Method::Get, ["class", "level", level]) => handle_by_level(state, req, level),
        (Method::Post, ["class", "add"]) => handle_add(state, req),
        (Method::Post, ["class", "assign-teacher"]) => handle_assign_teacher(state, req),
        (Method::Post, ["class", "remove-period"]) => handle_remove_period(state, req),
        (Method::Post, ["class", "add-students"]) => handle_membership(state, req, true),
        (Method::Post, ["class", "remove-students"]) => handle_membership(state, req, false),
        (Method::Get, ["class", "teacher", "me", "classes"]) => handle_my_classes(state, req),
        (Method::Get, ["class", "teacher", teacher_id, "classes"]) => {
            handle_teacher_classes(state, req, teacher_id)
        }
        (Method::Post, ["class", "distribute-students", level]) => {
            handle_distribute(state, req, level)
        }
        (Method::Post, ["class", "auto-add-students", class_id]) => {
            handle_auto_add(state, req, class_id)
        }
        (Method::Get, ["class", "unassigned-students", level]) => {
            handle_unassigned(state, req, level)
        }
        (Method::Get, ["class", class_id, "students"]) => handle_students(state, req, class_id),
        (Method::Delete, ["class", class_id]) => handle_delete(state, req, class_id),
        _ => return None,
    };
    Some(res)
}
