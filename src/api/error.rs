use serde_json::json;

use super::types::{Body, Response};

pub fn ok(result: serde_json::Value) -> Response {
    Response {
        status: 200,
        body: Body::Json(result),
    }
}

pub fn created(result: serde_json::Value) -> Response {
    Response {
        status: 201,
        body: Body::Json(result),
    }
}

pub fn err(
    status: u16,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> Response {
    let mut body = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        body["details"] = d;
    }
    Response {
        status,
        body: Body::Json(body),
    }
}

#[derive(Debug)]
pub struct HandlerErr {
    pub status: u16,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(status: u16, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new(400, "bad_params", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, "forbidden", message)
    }

    pub fn locked(message: impl Into<String>) -> Self {
        Self::new(403, "locked", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, "not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, "conflict", message)
    }

    pub fn internal(e: anyhow::Error) -> Self {
        Self::new(500, "internal", format!("{e:#}"))
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self) -> Response {
        err(self.status, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::new(500, "db_query_failed", e.to_string())
    }
}

pub type HandlerResult = Result<Response, HandlerErr>;
