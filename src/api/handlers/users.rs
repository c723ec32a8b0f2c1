use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

use super::otp::{self, USER_OTP};
use crate::api::error::{created, ok, HandlerErr, HandlerResult};
use crate::api::guard::{self, load_staff_user, Principal};
use crate::api::helpers::get_required_str;
use crate::api::types::{AppState, Method, Request};
use crate::db::{new_id, now_rfc3339};
use crate::model::{is_mobile, PERMISSIONS};

fn handle_login(state: &mut AppState, req: &Request) -> HandlerResult {
    let (user_id, session) = otp::login(state, req, &USER_OTP)?;
    let user = load_staff_user(&state.db, &user_id)?
        .ok_or_else(|| HandlerErr::not_found("User not found"))?;
    Ok(ok(json!({
        "message": "Login successful",
        "token": session.token,
        "expiresAt": session.expires_at.to_rfc3339(),
        "user": json!(user),
    })))
}

fn handle_me(state: &mut AppState, req: &Request) -> HandlerResult {
    match guard::authenticate(state, req)? {
        Principal::Staff(user) => Ok(ok(json!(user))),
        _ => Err(HandlerErr::forbidden("Staff account required")),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    guard::require_staff(state, req, &["manage_users"])?;
    let mut stmt = state.db.prepare(
        "SELECT id FROM users ORDER BY created_at, username",
    )?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut users = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(u) = load_staff_user(&state.db, &id)? {
            users.push(json!(u));
        }
    }
    Ok(ok(json!(users)))
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub mobile: String,
    pub role: String,
    pub name: String,
    pub permissions: Vec<String>,
}

fn parse_new_user(params: &serde_json::Value) -> Result<NewUser, HandlerErr> {
    let (username, mobile, role, name) = match (
        get_required_str(params, "username"),
        get_required_str(params, "mobile"),
        get_required_str(params, "role"),
        get_required_str(params, "name"),
    ) {
        (Ok(u), Ok(m), Ok(r), Ok(n)) => (u, m, r, n),
        _ => {
            return Err(HandlerErr::bad_params(
                "Username, mobile, role, and name are required",
            ))
        }
    };
    if !is_mobile(&mobile) {
        return Err(HandlerErr::bad_params("mobile must match 09XXXXXXXXX"));
    }

    let mut permissions = Vec::new();
    if let Some(raw) = params.get("permissions").filter(|v| !v.is_null()) {
        let Some(arr) = raw.as_array() else {
            return Err(HandlerErr::bad_params("permissions must be an array"));
        };
        for p in arr {
            let Some(p) = p.as_str() else {
                return Err(HandlerErr::bad_params("permissions must be strings"));
            };
            if !PERMISSIONS.contains(&p) {
                return Err(HandlerErr::bad_params(format!("unknown permission: {p}"))
                    .with_details(json!({ "allowed": PERMISSIONS })));
            }
            if !permissions.iter().any(|q: &String| q == p) {
                permissions.push(p.to_string());
            }
        }
    }

    Ok(NewUser {
        username,
        mobile,
        role,
        name,
        permissions,
    })
}

pub fn insert_user(conn: &Connection, user: &NewUser) -> Result<String, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE username = ? OR mobile = ?",
            (&user.username, &user.mobile),
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(HandlerErr::bad_params("Username or mobile already exists"));
    }

    let id = new_id();
    let permissions = serde_json::to_string(&user.permissions)
        .map_err(|e| HandlerErr::internal(e.into()))?;
    conn.execute(
        "INSERT INTO users(id, username, mobile, role, name, permissions, is_admin, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &user.username,
            &user.mobile,
            &user.role,
            &user.name,
            &permissions,
            (user.role == "admin") as i64,
            now_rfc3339(),
        ),
    )?;
    Ok(id)
}

fn handle_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let admin = guard::require_admin(state, req)?;
    let new_user = parse_new_user(&req.body)?;
    let id = insert_user(&state.db, &new_user)?;
    info!(by = %admin.id, user = %id, role = %new_user.role, "user created");
    let user = load_staff_user(&state.db, &id)?
        .ok_or_else(|| HandlerErr::not_found("User not found"))?;
    Ok(created(json!({
        "message": "User created successfully",
        "user": json!(user),
    })))
}

/// Creates the bootstrap administrator unless an `admin` username exists.
/// Returns whether a row was inserted.
pub fn seed_admin(conn: &Connection, mobile: &str, name: &str) -> anyhow::Result<bool> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE username = 'admin'", [], |r| r.get(0))
        .optional()?;
    if exists.is_some() {
        return Ok(false);
    }
    if !is_mobile(mobile) {
        anyhow::bail!("admin mobile must match 09XXXXXXXXX, got {mobile}");
    }
    insert_user(
        conn,
        &NewUser {
            username: "admin".to_string(),
            mobile: mobile.to_string(),
            role: "admin".to_string(),
            name: name.to_string(),
            permissions: PERMISSIONS.iter().map(|p| p.to_string()).collect(),
        },
    )
    .map_err(|e| anyhow::anyhow!("{}: {}", e.code, e.message))?;
    Ok(true)
}

pub fn try_handle(state: &mut AppState, req: &Request, segs: &[&str]) -> Option<HandlerResult> {
    let res = match (req.method, segs) {
        (Method::Post, ["user", "send-otp"]) => otp::send_otp(state, req, &USER_OTP),
        (Method::Post, ["user", "check-otp"]) => otp::check_otp(state, req, &USER_OTP),
        (Method::Post, ["user", "login"]) => handle_login(state, req),
        (Method::Get, ["user", "me"]) => handle_me(state, req),
        (Method::Get, ["user"]) => handle_list(state, req),
        (Method::Post, ["user"] | ["user", "users"]) => handle_create(state, req),
        _ => return None,
    };
    Some(res)
}
