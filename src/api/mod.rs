mod error;
mod guard;
mod handlers;
mod helpers;
mod router;
mod types;

pub use error::HandlerErr;
pub use handlers::users::seed_admin;
pub use router::handle_request;
pub use types::{AppState, Body, Method, Request, Response, Upload};
