//! Portrait files on disk under `<data_dir>/uploads/<bucket>/`, served back
//! at `/uploads/<bucket>/<file>`.

use anyhow::Context;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAX_PORTRAIT_BYTES: usize = 5 * 1024 * 1024;
const PORTRAIT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub url: String,
    pub file_name: String,
}

pub fn portrait_extension(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())?
        .to_ascii_lowercase();
    PORTRAIT_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

pub fn store_file(
    uploads_dir: &Path,
    bucket: &str,
    prefix: &str,
    ext: &str,
    bytes: &[u8],
) -> anyhow::Result<StoredFile> {
    let dir = uploads_dir.join(bucket);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create upload directory {}", dir.display()))?;
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let file_name = format!("{prefix}{millis}-{}.{ext}", uuid::Uuid::new_v4().simple());
    let path = dir.join(&file_name);
    std::fs::write(&path, bytes)
        .with_context(|| format!("failed to write upload {}", path.display()))?;
    Ok(StoredFile {
        url: format!("/uploads/{bucket}/{file_name}"),
        file_name,
    })
}

/// Missing files are not an error.
pub fn remove_file(uploads_dir: &Path, bucket: &str, file_name: &str) -> anyhow::Result<()> {
    // Stored names never contain separators; refuse anything that does.
    if file_name.contains('/') || file_name.contains('\\') || file_name.contains("..") {
        anyhow::bail!("refusing to remove suspicious upload name {file_name}");
    }
    let path = uploads_dir.join(bucket).join(file_name);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
