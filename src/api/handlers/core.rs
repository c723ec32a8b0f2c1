use serde_json::json;

use crate::api::error::{ok, HandlerResult};
use crate::api::types::{AppState, Method, Request};

fn handle_health(state: &mut AppState) -> HandlerResult {
    let students: i64 = state
        .db
        .query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?;
    Ok(ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "dataDir": state.config.data_dir.to_string_lossy(),
        "students": students,
    })))
}

pub fn try_handle(state: &mut AppState, req: &Request, segs: &[&str]) -> Option<HandlerResult> {
    match (req.method, segs) {
        (Method::Get, ["health"]) => Some(handle_health(state)),
        _ => None,
    }
}
