//! Multipart parsing: inbound files are spooled to uuid-prefixed temp files
//! in the upload directory before the orchestrator ever sees them.

use std::path::{Path, PathBuf};

use axum::extract::multipart::{Field, Multipart};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::context::StoredFile;
use crate::error::ApiError;

pub struct ParsedUpload {
    pub files: Vec<StoredFile>,
    pub callbacks_raw: Option<String>,
}

/// Drain a multipart body, spooling every file field named in `file_fields`
/// and capturing the `callbacks` text field. On any error, files spooled so
/// far are unlinked before the error propagates.
pub async fn collect(
    multipart: &mut Multipart,
    upload_dir: &Path,
    file_fields: &[&str],
    primary_field: &'static str,
    max_files: usize,
    per_file_limit: usize,
) -> Result<ParsedUpload, ApiError> {
    match collect_inner(
        multipart,
        upload_dir,
        file_fields,
        primary_field,
        max_files,
        per_file_limit,
    )
    .await
    {
        Ok(parsed) => Ok(parsed),
        Err((err, spooled)) => {
            for path in spooled {
                if let Err(unlink_err) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), %unlink_err, "failed to unlink rejected upload");
                }
            }
            Err(err)
        }
    }
}

async fn collect_inner(
    multipart: &mut Multipart,
    upload_dir: &Path,
    file_fields: &[&str],
    primary_field: &'static str,
    max_files: usize,
    per_file_limit: usize,
) -> Result<ParsedUpload, (ApiError, Vec<PathBuf>)> {
    if let Err(err) = tokio::fs::create_dir_all(upload_dir).await {
        return Err((
            ApiError::Internal(format!("upload directory unavailable: {err}")),
            Vec::new(),
        ));
    }

    let mut files: Vec<StoredFile> = Vec::new();
    let mut callbacks_raw = None;

    loop {
        let spooled = |files: &[StoredFile]| files.iter().map(|f| f.path.clone()).collect();
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return Err((
                    ApiError::InvalidParameter(format!("invalid multipart body: {err}")),
                    spooled(&files),
                ))
            }
        };
        let name = field.name().unwrap_or("").to_string();

        if file_fields.contains(&name.as_str()) {
            if files.len() >= max_files {
                return Err((
                    ApiError::PayloadTooLarge(format!("at most {max_files} files per request")),
                    spooled(&files),
                ));
            }
            match spool_field(field, upload_dir, per_file_limit).await {
                Ok(stored) => files.push(stored),
                Err(err) => return Err((err, spooled(&files))),
            }
        } else if name == "callbacks" {
            match field.text().await {
                Ok(text) => callbacks_raw = Some(text),
                Err(err) => {
                    return Err((
                        ApiError::BadCallbacks(err.to_string()),
                        spooled(&files),
                    ))
                }
            }
        }
        // Unknown fields are drained and ignored by the multipart reader.
    }

    if files.is_empty() {
        return Err((ApiError::MissingFile(primary_field), Vec::new()));
    }
    Ok(ParsedUpload {
        files,
        callbacks_raw,
    })
}

/// Stream one field to disk, enforcing the per-file limit as bytes arrive.
async fn spool_field(
    mut field: Field<'_>,
    upload_dir: &Path,
    limit: usize,
) -> Result<StoredFile, ApiError> {
    let original_name = sanitize_filename(field.file_name().unwrap_or("upload"));
    let mime = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();
    let path = upload_dir.join(format!("{}_{original_name}", Uuid::new_v4()));

    let mut file = File::create(&path)
        .await
        .map_err(|err| ApiError::Internal(format!("failed to spool upload: {err}")))?;
    let mut size: u64 = 0;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                remove_quietly(&path).await;
                return Err(ApiError::InvalidParameter(format!(
                    "failed to read upload body: {err}"
                )));
            }
        };
        size += chunk.len() as u64;
        if size > limit as u64 {
            remove_quietly(&path).await;
            return Err(ApiError::PayloadTooLarge(format!(
                "file exceeds the {limit}-byte limit"
            )));
        }
        if let Err(err) = file.write_all(&chunk).await {
            remove_quietly(&path).await;
            return Err(ApiError::Internal(format!("failed to spool upload: {err}")));
        }
    }
    if let Err(err) = file.flush().await {
        remove_quietly(&path).await;
        return Err(ApiError::Internal(format!("failed to spool upload: {err}")));
    }

    Ok(StoredFile {
        path,
        original_name,
        size,
        mime,
    })
}

/// Read a single file field fully into memory, for the synchronous codec
/// endpoints that respond with transformed bytes.
pub async fn read_inline(
    multipart: &mut Multipart,
    file_fields: &[&str],
    primary_field: &'static str,
    limit: usize,
) -> Result<(Vec<u8>, String), ApiError> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::InvalidParameter(format!("invalid multipart body: {err}")))?;
        let Some(mut field) = field else {
            return Err(ApiError::MissingFile(primary_field));
        };
        let name = field.name().unwrap_or("").to_string();
        if !file_fields.contains(&name.as_str()) {
            continue;
        }
        let original_name = sanitize_filename(field.file_name().unwrap_or("upload"));
        let mut bytes = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(|err| {
            ApiError::InvalidParameter(format!("failed to read upload body: {err}"))
        })? {
            if bytes.len() + chunk.len() > limit {
                return Err(ApiError::PayloadTooLarge(format!(
                    "file exceeds the {limit}-byte limit"
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        if bytes.is_empty() {
            return Err(ApiError::MissingFile(primary_field));
        }
        return Ok((bytes, original_name));
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), %err, "failed to unlink partial upload");
    }
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.chars().take(120).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("photo.png"), "photo.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("sp ace&odd.jpg"), "sp_ace_odd.jpg");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("..."), "upload");
    }
}
