use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

use super::error::HandlerErr;
use super::types::{AppState, Request};
use crate::auth::{self, AccountKind};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffUser {
    pub id: String,
    pub username: String,
    pub mobile: String,
    pub name: String,
    pub role: String,
    pub is_admin: bool,
    pub permissions: Vec<String>,
}

impl StaffUser {
    /// Admins bypass every permission check.
    pub fn has_any(&self, perms: &[&str]) -> bool {
        self.is_admin || perms.iter().any(|p| self.permissions.iter().any(|q| q == p))
    }
}

#[derive(Debug, Clone)]
pub enum Principal {
    Staff(StaffUser),
    Teacher { id: String },
    Student { id: String },
}

pub fn load_staff_user(conn: &Connection, user_id: &str) -> Result<Option<StaffUser>, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, username, mobile, name, role, is_admin, permissions FROM users WHERE id = ?",
            [user_id],
            |r| {
                let permissions_raw: String = r.get(6)?;
                Ok(StaffUser {
                    id: r.get(0)?,
                    username: r.get(1)?,
                    mobile: r.get(2)?,
                    name: r.get(3)?,
                    role: r.get(4)?,
                    is_admin: r.get::<_, i64>(5)? != 0,
                    permissions: serde_json::from_str(&permissions_raw).unwrap_or_default(),
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn account_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?"), [id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

pub fn authenticate(state: &AppState, req: &Request) -> Result<Principal, HandlerErr> {
    let Some(token) = req.bearer.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
        return Err(HandlerErr::unauthorized("No token provided"));
    };
    let Some((kind, id)) = auth::resolve_session(&state.db, token, Utc::now())? else {
        return Err(HandlerErr::unauthorized("Invalid or expired token"));
    };
    let principal = match kind {
        AccountKind::User => load_staff_user(&state.db, &id)?.map(Principal::Staff),
        AccountKind::Teacher => account_exists(&state.db, "teachers", &id)?
            .then(|| Principal::Teacher { id: id.clone() }),
        AccountKind::Student => account_exists(&state.db, "students", &id)?
            .then(|| Principal::Student { id: id.clone() }),
    };
    principal.ok_or_else(|| HandlerErr::unauthorized("Account for this token no longer exists"))
}

/// Staff user holding at least one of `perms`.
pub fn require_staff(state: &AppState, req: &Request, perms: &[&str]) -> Result<StaffUser, HandlerErr> {
    match authenticate(state, req)? {
        Principal::Staff(user) if user.has_any(perms) => Ok(user),
        Principal::Staff(_) => Err(HandlerErr::forbidden("Insufficient permissions")
            .with_details(json!({ "required": perms }))),
        _ => Err(HandlerErr::forbidden("Staff account required")),
    }
}

pub fn require_admin(state: &AppState, req: &Request) -> Result<StaffUser, HandlerErr> {
    match authenticate(state, req)? {
        Principal::Staff(user) if user.is_admin => Ok(user),
        _ => Err(HandlerErr::forbidden("Unauthorized: Admin access required")),
    }
}

pub fn require_teacher(state: &AppState, req: &Request) -> Result<String, HandlerErr> {
    match authenticate(state, req)? {
        Principal::Teacher { id } => Ok(id),
        _ => Err(HandlerErr::forbidden("Teacher account required")),
    }
}

pub fn require_student(state: &AppState, req: &Request) -> Result<String, HandlerErr> {
    match authenticate(state, req)? {
        Principal::Student { id } => Ok(id),
        _ => Err(HandlerErr::forbidden("Student account required")),
    }
}
