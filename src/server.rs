//! HTTP transport. Every `/api/...` call is translated into a transport-neutral
//! [`api::Request`] and routed through [`api::handle_request`]; portraits are
//! served statically from the uploads directory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{
    body::to_bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, FromRequest, Multipart, Query, State,
    },
    http::{
        header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE},
        HeaderValue, Method as HttpMethod, StatusCode,
    },
    response::{IntoResponse, Response as HttpResponse},
    Json, Router,
};
use percent_encoding::percent_decode_str;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{error, info, warn};

use crate::api::{self, AppState, Body, Method, Upload};
use crate::config::Config;

/// Covers the 10 MB roster import plus multipart framing.
const MAX_BODY_BYTES: usize = 12 * 1024 * 1024;

type SharedState = Arc<Mutex<AppState>>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("unsupported method {0}")]
    UnsupportedMethod(String),
    #[error("malformed JSON body: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("malformed query string")]
    MalformedQuery,
    #[error("multipart body rejected: {0}")]
    MultipartRejected(#[from] MultipartRejection),
    #[error("multipart field unreadable: {0}")]
    Multipart(#[from] MultipartError),
    #[error("request body unreadable: {0}")]
    Body(#[from] axum::Error),
    #[error("malformed request path")]
    MalformedPath,
    #[error("request worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("startup failed: {0}")]
    Startup(#[from] anyhow::Error),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> HttpResponse {
        let (status, code) = match &self {
            ServerError::UnsupportedMethod(_) => (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed"),
            ServerError::MalformedJson(_) | ServerError::MalformedQuery => {
                (StatusCode::BAD_REQUEST, "bad_json")
            }
            ServerError::MalformedPath => (StatusCode::BAD_REQUEST, "bad_path"),
            ServerError::MultipartRejected(e) => (e.status(), "bad_multipart"),
            ServerError::Multipart(e) => (e.status(), "bad_multipart"),
            ServerError::Body(_) => (StatusCode::PAYLOAD_TOO_LARGE, "too_large"),
            ServerError::Worker(_)
            | ServerError::Io(_)
            | ServerError::Startup(_) => {
                error!("{self}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        let body = json!({ "code": code, "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Percent-decodes each path segment. A segment decoding to `/` is rejected.
fn decode_path(raw: &str) -> Result<String, ServerError> {
    raw.split('/')
        .map(|seg| match percent_decode_str(seg).decode_utf8() {
            Ok(decoded) if !decoded.contains('/') => Ok(decoded.into_owned()),
            _ => Err(ServerError::MalformedPath),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|segs| segs.join("/"))
}

async fn into_api_request(request: axum::extract::Request) -> Result<api::Request, ServerError> {
    let method = Method::parse(request.method().as_str())
        .ok_or_else(|| ServerError::UnsupportedMethod(request.method().to_string()))?;
    let uri = request.uri().clone();
    let Query(query) = Query::<HashMap<String, String>>::try_from_uri(&uri)
        .map_err(|_| ServerError::MalformedQuery)?;
    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string());
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let mut api_req = api::Request::new(method, decode_path(uri.path())?);
    api_req.query = query;
    api_req.bearer = bearer;

    if is_multipart {
        let mut multipart = Multipart::from_request(request, &()).await?;
        let mut fields = serde_json::Map::new();
        while let Some(field) = multipart.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match field.file_name().map(str::to_string) {
                Some(file_name) => {
                    let bytes = field.bytes().await?;
                    if !bytes.is_empty() {
                        api_req.files.push(Upload {
                            field: name,
                            file_name,
                            bytes: bytes.to_vec(),
                        });
                    }
                }
                None => {
                    fields.insert(name, serde_json::Value::String(field.text().await?));
                }
            }
        }
        api_req.body = serde_json::Value::Object(fields);
    } else {
        let bytes = to_bytes(request.into_body(), MAX_BODY_BYTES).await?;
        if !bytes.iter().all(u8::is_ascii_whitespace) {
            api_req.body = serde_json::from_slice(&bytes)?;
        }
    }
    Ok(api_req)
}

fn into_http_response(response: api::Response) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match response.body {
        Body::Json(value) => (status, Json(value)).into_response(),
        Body::File {
            content_type,
            file_name,
            bytes,
        } => {
            let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
                .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
            (
                status,
                [
                    (CONTENT_TYPE, HeaderValue::from_static(content_type)),
                    (CONTENT_DISPOSITION, disposition),
                ],
                bytes,
            )
                .into_response()
        }
    }
}

async fn dispatch(
    State(state): State<SharedState>,
    request: axum::extract::Request,
) -> Result<HttpResponse, ServerError> {
    let api_req = into_api_request(request).await?;
    // rusqlite is blocking; keep it off the async workers.
    let response = tokio::task::spawn_blocking(move || {
        // A handler panic poisons the lock; its transaction rolled back on unwind.
        let mut app = state.lock().unwrap_or_else(|poisoned| {
            warn!("recovering application state after a panicked request");
            state.clear_poison();
            PoisonError::into_inner(poisoned)
        });
        api::handle_request(&mut app, api_req)
    })
    .await?;
    Ok(into_http_response(response))
}

pub fn router(state: AppState) -> Router {
    let uploads = ServeDir::new(state.uploads_dir());
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            HttpMethod::GET,
            HttpMethod::POST,
            HttpMethod::PUT,
            HttpMethod::PATCH,
            HttpMethod::DELETE,
            HttpMethod::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .nest_service("/uploads", uploads)
        .fallback(dispatch)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(Arc::new(Mutex::new(state)))
}

pub async fn serve(config: Config) -> Result<(), ServerError> {
    let state = AppState::open(config.clone())?;
    std::fs::create_dir_all(state.uploads_dir())?;
    let app = router(state);

    let address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&address).await?;
    info!("schoold listening on {address}, data in {}", config.data_dir.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("schoold stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
