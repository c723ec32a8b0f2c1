use tracing::warn;

use crate::api::error::HandlerErr;
use crate::api::types::{AppState, Request};
use crate::uploads::{self, StoredFile, MAX_PORTRAIT_BYTES};

/// Stores the image in `field`, if the request carries one.
pub fn save_portrait(
    state: &AppState,
    req: &Request,
    field: &str,
    bucket: &str,
    prefix: &str,
) -> Result<Option<StoredFile>, HandlerErr> {
    let Some(upload) = req.file(field) else {
        return Ok(None);
    };
    if upload.bytes.len() > MAX_PORTRAIT_BYTES {
        return Err(HandlerErr::new(413, "too_large", "Portrait must be at most 5MB"));
    }
    let Some(ext) = uploads::portrait_extension(&upload.file_name) else {
        return Err(HandlerErr::bad_params(
            "Only .jpg, .jpeg, and .png images are allowed",
        ));
    };
    uploads::store_file(&state.uploads_dir(), bucket, prefix, &ext, &upload.bytes)
        .map(Some)
        .map_err(HandlerErr::internal)
}

pub fn discard_portrait(state: &AppState, bucket: &str, file_name: Option<&str>) {
    let Some(file_name) = file_name else { return };
    if let Err(e) = uploads::remove_file(&state.uploads_dir(), bucket, file_name) {
        warn!(error = %e, "failed to remove portrait");
    }
}
