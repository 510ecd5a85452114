use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("file is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("filename is empty after sanitizing")]
    InvalidName,

    #[error("invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to write {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// Reduce an uploaded filename to a single safe path component.
///
/// Directory parts are stripped, control characters and separators are
/// replaced, and leading dots are removed so the result is never hidden,
/// `.` or `..`.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        return None;
    }
    // Keep names within common filesystem limits.
    let mut end = cleaned.len().min(200);
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    Some(cleaned[..end].to_string())
}

fn with_suffix(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{n}.{ext}"),
        _ => format!("{name}-{n}"),
    }
}

/// Save an upload into `dir`, never overwriting an existing file.
///
/// Returns the path written.
pub async fn save_upload(
    dir: &Path,
    filename: &str,
    data: &[u8],
    max_bytes: usize,
) -> Result<PathBuf, UploadError> {
    if data.len() > max_bytes {
        return Err(UploadError::TooLarge { size: data.len(), max: max_bytes });
    }
    let name = sanitize_filename(filename).ok_or(UploadError::InvalidName)?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| UploadError::Io(dir.to_path_buf(), e))?;

    let mut attempt = 0u32;
    loop {
        let candidate = if attempt == 0 { name.clone() } else { with_suffix(&name, attempt) };
        let path = dir.join(candidate);
        let open = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match open {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(data)
                    .await
                    .map_err(|e| UploadError::Io(path.clone(), e))?;
                file.flush().await.map_err(|e| UploadError::Io(path.clone(), e))?;
                tracing::info!(path = %path.display(), bytes = data.len(), "saved upload");
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 1000 => {
                attempt += 1;
            }
            Err(e) => return Err(UploadError::Io(path, e)),
        }
    }
}
