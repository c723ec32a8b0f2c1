use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::api::error::{ok, HandlerErr, HandlerResult};
use crate::api::helpers::get_optional_str;
use crate::api::types::{AppState, Request};
use crate::auth::{self, AccountKind, OtpCheck, Session};

/// How one account family is found by the identifier its login form sends.
pub struct OtpTarget {
    pub kind: AccountKind,
    pub identifier_key: &'static str,
    pub lookup_sql: &'static str,
    pub label: &'static str,
}

pub const USER_OTP: OtpTarget = OtpTarget {
    kind: AccountKind::User,
    identifier_key: "mobile",
    lookup_sql: "SELECT id FROM users WHERE mobile = ?",
    label: "User",
};

pub const TEACHER_OTP: OtpTarget = OtpTarget {
    kind: AccountKind::Teacher,
    identifier_key: "mobile",
    lookup_sql: "SELECT id FROM teachers WHERE mobile = ?",
    label: "Teacher",
};

pub const STUDENT_OTP: OtpTarget = OtpTarget {
    kind: AccountKind::Student,
    identifier_key: "student_phone",
    lookup_sql: "SELECT id FROM students WHERE student_phone = ?",
    label: "Student",
};

fn identifier(req: &Request, target: &OtpTarget) -> Result<String, HandlerErr> {
    get_optional_str(&req.body, target.identifier_key)
        // Student forms sometimes post the phone as `mobile`.
        .or_else(|| get_optional_str(&req.body, "mobile"))
        .ok_or_else(|| HandlerErr::bad_params("Mobile number is required"))
}

fn find_account(state: &AppState, target: &OtpTarget, ident: &str) -> Result<String, HandlerErr> {
    let mut stmt = state.db.prepare(target.lookup_sql)?;
    let ids = stmt
        .query_map([ident], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    match ids.as_slice() {
        [] => Err(HandlerErr::not_found(format!("{} not found", target.label))),
        [id] => Ok(id.clone()),
        _ => Err(HandlerErr::conflict(format!(
            "More than one {} uses this phone number",
            target.label.to_lowercase()
        ))),
    }
}

pub fn send_otp(state: &mut AppState, req: &Request, target: &OtpTarget) -> HandlerResult {
    let ident = identifier(req, target)?;
    let account_id = find_account(state, target, &ident)?;
    let code = auth::issue_otp(
        &state.db,
        target.kind,
        &account_id,
        state.config.otp_ttl_secs,
        Utc::now(),
    )?;
    // No SMS gateway yet: the log line is the delivery channel.
    info!(
        account = target.kind.as_str(),
        mobile = %ident,
        otp = %code,
        "one-time code generated"
    );
    Ok(ok(json!({ "message": "OTP generated and logged successfully" })))
}

fn verify(state: &AppState, req: &Request, target: &OtpTarget) -> Result<String, HandlerErr> {
    let ident = identifier(req, target)?;
    let Some(otp) = get_optional_str(&req.body, "otp") else {
        return Err(HandlerErr::bad_params("Mobile number and OTP are required"));
    };
    let account_id = find_account(state, target, &ident)?;
    let (stored, expires) = auth::load_otp(&state.db, target.kind, &account_id)?;
    match auth::verify_otp(stored.as_deref(), expires, &otp, Utc::now()) {
        OtpCheck::Valid => Ok(account_id),
        OtpCheck::Mismatch | OtpCheck::Expired => {
            Err(HandlerErr::unauthorized("Invalid or expired OTP"))
        }
    }
}

pub fn check_otp(state: &mut AppState, req: &Request, target: &OtpTarget) -> HandlerResult {
    verify(state, req, target)?;
    Ok(ok(json!({ "message": "OTP is valid" })))
}

/// Consumes the code and opens a session for the account.
pub fn login(
    state: &mut AppState,
    req: &Request,
    target: &OtpTarget,
) -> Result<(String, Session), HandlerErr> {
    let account_id = verify(state, req, target)?;
    auth::clear_otp(&state.db, target.kind, &account_id)?;
    let session = auth::create_session(
        &state.db,
        target.kind,
        &account_id,
        state.config.session_ttl_hours,
        Utc::now(),
    )?;
    info!(account = target.kind.as_str(), id = %account_id, "login succeeded");
    Ok((account_id, session))
}
