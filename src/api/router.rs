use tracing::{debug, error};

use super::error::{err, HandlerResult};
use super::handlers;
use super::types::{AppState, Request, Response};

type Family = fn(&mut AppState, &Request, &[&str]) -> Option<HandlerResult>;

/// Tried in order; the first family that claims the path answers it.
const FAMILIES: &[Family] = &[
    handlers::core::try_handle,
    handlers::users::try_handle,
    handlers::teachers::try_handle,
    handlers::evaluations::try_handle,
    handlers::attendance::try_handle,
    handlers::classes::try_handle,
    handlers::students::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> Response {
    let segs = req.segments();
    let resp = match segs.split_first() {
        Some((&"api", rest)) => FAMILIES
            .iter()
            .find_map(|family| family(state, &req, rest))
            .unwrap_or_else(|| {
                Err(super::error::HandlerErr::not_found(format!(
                    "unknown route: {:?} {}",
                    req.method, req.path
                )))
            }),
        _ => Ok(err(404, "not_found", format!("unknown route: {}", req.path), None)),
    };

    match resp {
        Ok(r) => {
            debug!(method = ?req.method, path = %req.path, status = r.status, "request handled");
            r
        }
        Err(e) => {
            if e.status >= 500 {
                error!(method = ?req.method, path = %req.path, code = e.code, error = %e.message, "request failed");
            } else {
                debug!(method = ?req.method, path = %req.path, status = e.status, code = e.code, "request rejected");
            }
            e.response()
        }
    }
}
