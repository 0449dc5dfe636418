//! Uploaded files on disk.
//!
//! Attachments live under `<root>/attachments/` and inline images under
//! `<root>/inline/`. Every stored name is prefixed with the upload time and a
//! short random tag so two uploads of `report.pdf` never overwrite each other.

use chrono::Utc;
use std::fs::{self, create_dir_all};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::error::AppError;

const ATTACHMENT_DIR: &str = "attachments";
const INLINE_DIR: &str = "inline";

/// A file received from a client, held in memory.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// A file written to the upload directory.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    /// Name the client uploaded it as
    pub filename: String,
    /// Path relative to the upload root, always with `/` separators
    pub relative_path: String,
    pub content_type: String,
    pub size: u64,
}

/// Reduce a client-supplied file name to `[A-Za-z0-9._-]`.
///
/// Directory parts are dropped, other characters become `_` and leading dots
/// are stripped so the result can never escape the upload directory or be
/// hidden. An empty result becomes `file`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

fn stored_name(original: &str) -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &tag[..8],
        sanitize_filename(original)
    )
}

/// Reject relative paths that could point outside the upload root.
fn checked_relative(relative: &str) -> Result<&Path, AppError> {
    let path = Path::new(relative);
    let safe = !relative.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path)
    } else {
        Err(AppError::bad_request("Invalid file path"))
    }
}

/// Whether the upload is an image, judged by its declared type and its bytes.
#[cfg(feature = "web")]
pub fn is_image(content_type: &str, bytes: &[u8]) -> bool {
    content_type.starts_with("image/") && image::guess_format(bytes).is_ok()
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    /// Use `root` as the upload directory, creating its subdirectories.
    pub fn open(root: &Path) -> Result<Self, AppError> {
        create_dir_all(root.join(ATTACHMENT_DIR))?;
        create_dir_all(root.join(INLINE_DIR))?;
        Ok(UploadStore {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inline_dir(&self) -> PathBuf {
        self.root.join(INLINE_DIR)
    }

    fn write(&self, dir: &str, file: &UploadedFile) -> Result<StoredFile, AppError> {
        let name = stored_name(&file.filename);
        fs::write(self.root.join(dir).join(&name), &file.bytes)?;
        Ok(StoredFile {
            filename: file.filename.clone(),
            relative_path: format!("{}/{}", dir, name),
            content_type: file.content_type.clone(),
            size: file.bytes.len() as u64,
        })
    }

    /// Write attachment files. If any write fails, the ones already written
    /// are removed again.
    pub fn store_attachments(&self, files: &[UploadedFile]) -> Result<Vec<StoredFile>, AppError> {
        let mut stored = Vec::with_capacity(files.len());
        for file in files {
            match self.write(ATTACHMENT_DIR, file) {
                Ok(s) => stored.push(s),
                Err(e) => {
                    self.discard(&stored);
                    return Err(e);
                }
            }
        }
        Ok(stored)
    }

    /// Store an inline image and return the URL it is served from.
    #[cfg(feature = "web")]
    pub fn store_inline_image(&self, file: &UploadedFile) -> Result<String, AppError> {
        if !is_image(&file.content_type, &file.bytes) {
            return Err(AppError::bad_request("File must be an image"));
        }
        let stored = self.write(INLINE_DIR, file)?;
        Ok(format!("/uploads/{}", stored.relative_path))
    }

    /// Read a stored file back.
    pub fn read(&self, relative: &str) -> Result<Vec<u8>, AppError> {
        let path = self.root.join(checked_relative(relative)?);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::not_found("File not found")
            } else {
                AppError::Io(e)
            }
        })
    }

    /// Delete a stored file. A file that is already gone is not an error.
    pub fn delete(&self, relative: &str) {
        let Ok(relative) = checked_relative(relative) else {
            log::warn!("refusing to delete suspicious upload path {:?}", relative);
            return;
        };
        match fs::remove_file(self.root.join(relative)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to delete upload {}: {}", relative.display(), e),
        }
    }

    /// Remove files written for a request that ended up failing.
    pub fn discard(&self, stored: &[StoredFile]) {
        for file in stored {
            self.delete(&file.relative_path);
        }
    }
}

#[cfg(feature = "web")]
pub use handlers::*;

#[cfg(feature = "web")]
mod handlers {
    use axum::{
        Extension, Json,
        extract::{Multipart, Path, State, multipart::Field},
        http::header,
        response::{IntoResponse, Response},
    };
    use chrono::Utc;

    use super::UploadedFile;
    use crate::app::SharedState;
    use crate::error::AppError;
    use crate::login::AuthUser;
    use crate::models::AttachmentResponse;

    /// Read one file field into memory, enforcing `max_bytes`.
    ///
    /// Returns `None` for a file field with no name, which is what browsers
    /// send when no file was picked.
    pub async fn read_upload(
        mut field: Field<'_>,
        max_bytes: usize,
    ) -> Result<Option<UploadedFile>, AppError> {
        let filename = field.file_name().unwrap_or("").to_string();
        if filename.is_empty() {
            return Ok(None);
        }
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        let mut bytes = Vec::new();
        while let Some(chunk) = field.chunk().await? {
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::PayloadTooLarge(format!(
                    "{} exceeds the {} byte upload limit",
                    filename, max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(Some(UploadedFile {
            filename,
            content_type,
            bytes,
        }))
    }

    /// Attach a single file to a report the caller owns.
    pub async fn upload_attachment(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path(report_id): Path<u64>,
        mut multipart: Multipart,
    ) -> Result<Json<AttachmentResponse>, AppError> {
        state
            .store
            .read(|db| db.owned_report(&auth.user, report_id).map(|_| ()))??;

        let mut upload = None;
        while let Some(field) = multipart.next_field().await? {
            if field.name() == Some("file") {
                upload = read_upload(field, state.settings.max_upload_bytes).await?;
            }
        }
        let upload = upload.ok_or_else(|| AppError::bad_request("No file uploaded"))?;

        let stored = state.uploads.store_attachments(std::slice::from_ref(&upload))?;
        let result = state.store.write(|db| {
            db.owned_report(&auth.user, report_id)?;
            let file = &stored[0];
            db.add_attachment(
                report_id,
                &file.filename,
                &file.relative_path,
                &file.content_type,
                file.size,
                Utc::now(),
            )
        });

        match result {
            Ok(attachment) => {
                log::info!(
                    "user {} attached {} to report {}",
                    auth.user.username,
                    attachment.filename,
                    report_id
                );
                Ok(Json(AttachmentResponse::from(&attachment)))
            }
            Err(e) => {
                state.uploads.discard(&stored);
                Err(e)
            }
        }
    }

    /// Stream an attachment back with its original name.
    pub async fn download_attachment(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path((report_id, attachment_id)): Path<(u64, u64)>,
    ) -> Result<Response, AppError> {
        let attachment = state.store.read(|db| {
            db.visible_report(&auth.user, report_id)?;
            db.attachment(report_id, attachment_id)
                .cloned()
                .ok_or_else(|| AppError::not_found("Attachment not found"))
        })??;

        let bytes = state.uploads.read(&attachment.file_path)?;
        let disposition = format!(
            "attachment; filename*=UTF-8''{}",
            urlencoding::encode(&attachment.filename)
        );

        Ok((
            [
                (header::CONTENT_TYPE, attachment.content_type),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            bytes,
        )
            .into_response())
    }

    /// Remove an attachment from a report the caller owns.
    pub async fn delete_attachment(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path((report_id, attachment_id)): Path<(u64, u64)>,
    ) -> Result<Json<serde_json::Value>, AppError> {
        let removed = state.store.write(|db| {
            if db.attachment(report_id, attachment_id).is_none() {
                return Err(AppError::not_found("Attachment not found"));
            }
            db.owned_report(&auth.user, report_id)?;
            db.remove_attachment(report_id, attachment_id)
        })?;

        state.uploads.delete(&removed.file_path);
        Ok(Json(
            serde_json::json!({ "message": "Attachment deleted successfully" }),
        ))
    }
}
