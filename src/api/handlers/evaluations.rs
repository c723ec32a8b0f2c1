use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

use super::students::{student_id_by_national_code, VIEW_PERMS as STUDENT_VIEW_PERMS};
use crate::admission::{self, parse_decision, DecisionRole};
use crate::api::error::{created, ok, HandlerErr, HandlerResult};
use crate::api::guard;
use crate::api::helpers::{parse_json_column, row_exists};
use crate::api::types::{AppState, Method, Request};
use crate::db::now_rfc3339;

fn summary_key(role: DecisionRole) -> &'static str {
    match role {
        DecisionRole::AcademicAdvisor => "academicAdvisor",
        DecisionRole::DisciplinaryDeputy => "disciplinaryDeputy",
        DecisionRole::EducationalDeputy => "educationalDeputy",
        DecisionRole::Principal => "principal",
        DecisionRole::PsychCounselor => "psychCounselor",
    }
}

/// The stored form as the client sees it, or `None` if the role has not
/// submitted one yet.
pub fn load_form(
    conn: &Connection,
    role: DecisionRole,
    student_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    let row: Option<(String, i64, i64, Option<String>, String, String)> = conn
        .query_row(
            "SELECT fields, decision, locked, submitted_by, created_at, updated_at
             FROM decisions WHERE role = ? AND student_id = ?",
            (role.as_str(), student_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )
        .optional()?;
    let Some((fields, decision, locked, submitted_by, created_at, updated_at)) = row else {
        return Ok(None);
    };
    let mut form = match parse_json_column(Some(fields)) {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    form.insert("studentId".into(), json!(student_id));
    form.insert(role.decision_field().into(), json!(decision != 0));
    form.insert("locked".into(), json!(locked != 0));
    form.insert("submittedBy".into(), json!(submitted_by));
    form.insert("createdAt".into(), json!(created_at));
    form.insert("updatedAt".into(), json!(updated_at));
    Ok(Some(serde_json::Value::Object(form)))
}

fn handle_get(state: &mut AppState, req: &Request, role: DecisionRole, student_id: &str) -> HandlerResult {
    guard::require_staff(state, req, &[role.permission()])?;
    match load_form(&state.db, role, student_id)? {
        Some(form) => {
            let locked = form["locked"].as_bool().unwrap_or(false);
            Ok(ok(json!({ "form": form, "exists": true, "locked": locked })))
        }
        None => Ok(ok(json!({
            "message": "No form found for this student",
            "form": null,
            "exists": false,
            "locked": false,
        }))),
    }
}

fn handle_submit(state: &mut AppState, req: &Request, role: DecisionRole, student_id: &str) -> HandlerResult {
    let staff = guard::require_staff(state, req, &[role.permission()])?;
    if !row_exists(&state.db, "SELECT 1 FROM students WHERE id = ?", student_id)? {
        return Err(HandlerErr::not_found("Student not found"));
    }
    if load_form(&state.db, role, student_id)?.is_some() {
        return Err(HandlerErr::locked("Form is already submitted and locked"));
    }

    let raw_decision = req
        .body
        .get(role.decision_field())
        .or_else(|| req.body.get("decision"));
    let Some(decision) = raw_decision.and_then(parse_decision) else {
        return Err(HandlerErr::bad_params(format!(
            "{} must be true/false or پذیرش/عدم پذیرش",
            role.decision_field()
        )));
    };

    let mut fields = serde_json::Map::new();
    for name in role.assessment_fields() {
        if let Some(v) = req.body.get(*name).filter(|v| !v.is_null()) {
            fields.insert(name.to_string(), v.clone());
        }
    }

    let now = now_rfc3339();
    let tx = state.db.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO decisions(role, student_id, fields, decision, locked, submitted_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, 1, ?, ?, ?)",
        rusqlite::params![
            role.as_str(),
            student_id,
            serde_json::Value::Object(fields).to_string(),
            decision as i64,
            staff.id,
            now,
            now
        ],
    )?;
    let accepted = admission::refresh_student_acceptance(&tx, student_id)?;
    tx.commit()?;

    info!(
        by = %staff.id,
        role = role.as_str(),
        student = %student_id,
        decision,
        accepted = ?accepted,
        "admission decision submitted"
    );
    let form = load_form(&state.db, role, student_id)?;
    Ok(created(json!({
        "message": "Form submitted and locked successfully",
        "form": form,
        "accepted": accepted,
    })))
}

fn handle_student_decisions(state: &mut AppState, req: &Request, national_code: &str) -> HandlerResult {
    guard::require_staff(state, req, STUDENT_VIEW_PERMS)?;
    let Some(student_id) = student_id_by_national_code(&state.db, national_code)? else {
        return Err(HandlerErr::not_found("Student not found"));
    };
    let mut decisions = serde_json::Map::new();
    for role in DecisionRole::ALL {
        decisions.insert(
            summary_key(role).to_string(),
            json!(load_form(&state.db, role, &student_id)?),
        );
    }
    let accepted: Option<i64> = state.db.query_row(
        "SELECT accepted FROM students WHERE id = ?",
        [&student_id],
        |r| r.get(0),
    )?;
    Ok(ok(json!({
        "studentId": student_id,
        "accepted": accepted.map(|v| v != 0),
        "decisions": decisions,
    })))
}

pub fn try_handle(state: &mut AppState, req: &Request, segs: &[&str]) -> Option<HandlerResult> {
    if let (Method::Get, ["student", "national-code", code, "decisions"]) = (req.method, segs) {
        return Some(handle_student_decisions(state, req, code));
    }
    let [head, rest @ ..] = segs else {
        return None;
    };
    let role = DecisionRole::from_route_segment(head)?;
    let res = match (req.method, rest) {
        (Method::Get, [student_id]) => handle_get(state, req, role, student_id),
        (Method::Post, [student_id, "submit"]) => handle_submit(state, req, role, student_id),
        _ => return None,
    };
    Some(res)
}
