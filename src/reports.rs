//! Reports: listing, search and pagination, plus the report HTTP handlers.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// One page of a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matching items across all pages
    pub total: usize,
    /// 1-based page number
    pub page: usize,
    pub size: usize,
    pub pages: usize,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            size: self.size,
            pages: self.pages,
        }
    }
}

/// Query string of the report listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub skip: usize,
    pub limit: Option<usize>,
    #[serde(default)]
    pub search: String,
}

impl ListQuery {
    /// Page size, defaulted and clamped to `1..=MAX_PAGE_SIZE`.
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }
}

/// Slice `items` into the page starting at `skip`.
///
/// `page` is `skip / limit + 1`, so an offset that is not a multiple of the
/// page size reports the page it starts in.
pub fn paginate<T>(items: Vec<T>, skip: usize, limit: usize) -> Page<T> {
    let limit = limit.max(1);
    let total = items.len();
    let items: Vec<T> = items.into_iter().skip(skip).take(limit).collect();
    Page {
        items,
        total,
        page: skip / limit + 1,
        size: limit,
        pages: total.div_ceil(limit),
    }
}

/// Case-insensitive substring match; an empty search matches everything.
pub fn title_matches(title: &str, search: &str) -> bool {
    let search = search.trim();
    search.is_empty() || title.to_lowercase().contains(&search.to_lowercase())
}

/// Title and content are both required when a report is created.
pub fn validate_new_report(title: &str, content: &str) -> Result<(), AppError> {
    if title.trim().is_empty() {
        return Err(AppError::bad_request("Title is required"));
    }
    if content.trim().is_empty() {
        return Err(AppError::bad_request("Content is required"));
    }
    Ok(())
}

// Web handler functions below (only compiled with "web" feature)

#[cfg(feature = "web")]
pub use handlers::*;

#[cfg(feature = "web")]
mod handlers {
    use axum::{
        Extension, Json,
        extract::{Multipart, Path, Query, State},
    };
    use chrono::Utc;

    use super::{ListQuery, Page, validate_new_report};
    use crate::app::SharedState;
    use crate::error::AppError;
    use crate::login::AuthUser;
    use crate::mentions::extract_mentions;
    use crate::models::{AttachmentResponse, Report, ReportResponse, UserResponse};
    use crate::store::{Database, MentionSource};
    use crate::uploads::{StoredFile, UploadedFile, read_upload};

    /// Fields of a report create/update form.
    #[derive(Debug, Default)]
    pub struct ReportForm {
        pub title: Option<String>,
        pub content: Option<String>,
        pub files: Vec<UploadedFile>,
    }

    /// Read a multipart report form. Unknown fields are ignored.
    pub async fn read_report_form(
        mut multipart: Multipart,
        max_file_bytes: usize,
    ) -> Result<ReportForm, AppError> {
        let mut form = ReportForm::default();

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or("").to_string();
            match name.as_str() {
                "title" => form.title = Some(field.text().await?),
                "content" => form.content = Some(field.text().await?),
                "files" | "file" => {
                    if let Some(file) = read_upload(field, max_file_bytes).await? {
                        form.files.push(file);
                    }
                }
                _ => {}
            }
        }

        Ok(form)
    }

    /// Build the full response for a report: author and attachments included.
    pub fn report_response(db: &Database, report: &Report) -> ReportResponse {
        ReportResponse {
            id: report.id,
            user_id: report.user_id,
            title: report.title.clone(),
            content: report.content.clone(),
            created_at: report.created_at,
            updated_at: report.updated_at,
            user: db.user(report.user_id).map(UserResponse::from),
            attachments: db
                .attachments_for(report.id)
                .iter()
                .map(AttachmentResponse::from)
                .collect(),
        }
    }

    /// Save uploaded files and register them as attachments of `report_id`.
    fn attach_files(
        db: &mut Database,
        report_id: u64,
        stored: &[StoredFile],
    ) -> Result<(), AppError> {
        let now = Utc::now();
        for file in stored {
            db.add_attachment(
                report_id,
                &file.filename,
                &file.relative_path,
                &file.content_type,
                file.size,
                now,
            )?;
        }
        Ok(())
    }

    /// List the current user's reports, newest first.
    pub async fn list_reports(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Query(query): Query<ListQuery>,
    ) -> Result<Json<Page<ReportResponse>>, AppError> {
        let limit = query.limit();
        let page = state.store.read(|db| {
            db.list_reports(auth.user.id, &query.search, query.skip, limit)
                .map(|report| report_response(db, &report))
        })?;

        log::debug!(
            "listed {} of {} reports for {} (skip={}, limit={}, search={:?})",
            page.items.len(),
            page.total,
            auth.user.username,
            query.skip,
            limit,
            query.search
        );
        Ok(Json(page))
    }

    /// Create a report from a multipart form with optional files.
    pub async fn create_report(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        multipart: Multipart,
    ) -> Result<Json<ReportResponse>, AppError> {
        let form = read_report_form(multipart, state.settings.max_upload_bytes).await?;
        let title = form.title.unwrap_or_default();
        let content = form.content.unwrap_or_default();
        validate_new_report(&title, &content)?;

        let stored = state.uploads.store_attachments(&form.files)?;
        let now = Utc::now();
        let result = state.store.write(|db| {
            let report = db.create_report(auth.user.id, &title, &content, now);
            attach_files(db, report.id, &stored)?;
            db.replace_mentions(
                MentionSource::Report(report.id),
                &extract_mentions(&report.content),
                now,
            );
            Ok(report_response(db, &report))
        });

        match result {
            Ok(response) => {
                log::info!(
                    "user {} created report {} with {} attachment(s)",
                    auth.user.username,
                    response.id,
                    stored.len()
                );
                Ok(Json(response))
            }
            Err(e) => {
                state.uploads.discard(&stored);
                Err(e)
            }
        }
    }

    pub async fn get_report(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path(report_id): Path<u64>,
    ) -> Result<Json<ReportResponse>, AppError> {
        let response = state.store.read(|db| {
            let report = db.visible_report(&auth.user, report_id)?;
            Ok::<_, AppError>(report_response(db, report))
        })??;
        Ok(Json(response))
    }

    /// Update title and/or content and append any uploaded files.
    pub async fn update_report(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path(report_id): Path<u64>,
        multipart: Multipart,
    ) -> Result<Json<ReportResponse>, AppError> {
        let form = read_report_form(multipart, state.settings.max_upload_bytes).await?;
        if form.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(AppError::bad_request("Title cannot be empty"));
        }

        // Fail fast before touching the disk.
        state
            .store
            .read(|db| db.owned_report(&auth.user, report_id).map(|_| ()))??;

        let stored = state.uploads.store_attachments(&form.files)?;
        let now = Utc::now();
        let result = state.store.write(|db| {
            db.owned_report(&auth.user, report_id)?;
            let report = db.update_report(
                report_id,
                form.title.as_deref(),
                form.content.as_deref(),
                now,
            )?;
            attach_files(db, report.id, &stored)?;
            if form.content.is_some() {
                db.replace_mentions(
                    MentionSource::Report(report.id),
                    &extract_mentions(&report.content),
                    now,
                );
            }
            Ok(report_response(db, &report))
        });

        result.inspect_err(|_| state.uploads.discard(&stored)).map(Json)
    }

    /// Delete a report, its comments and its attachment files.
    pub async fn delete_report(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path(report_id): Path<u64>,
    ) -> Result<Json<serde_json::Value>, AppError> {
        let removed = state.store.write(|db| {
            db.owned_report(&auth.user, report_id)?;
            db.delete_report(report_id)
        })?;

        for attachment in &removed {
            state.uploads.delete(&attachment.file_path);
        }
        log::info!(
            "user {} deleted report {} ({} attachment file(s))",
            auth.user.username,
            report_id,
            removed.len()
        );
        Ok(Json(
            serde_json::json!({ "message": "Report deleted successfully" }),
        ))
    }

    /// Upload an image for use inside report markdown.
    pub async fn upload_inline_image(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        mut multipart: Multipart,
    ) -> Result<Json<serde_json::Value>, AppError> {
        let mut upload = None;
        while let Some(field) = multipart.next_field().await? {
            if field.name() == Some("file") {
                upload = read_upload(field, state.settings.max_upload_bytes).await?;
            }
        }
        let upload = upload.ok_or_else(|| AppError::bad_request("No file uploaded"))?;

        let url = state.uploads.store_inline_image(&upload)?;
        log::info!("user {} uploaded inline image {}", auth.user.username, url);
        Ok(Json(serde_json::json!({ "url": url })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_reports_page_numbers() {
        let page = paginate((1..=25).collect::<Vec<_>>(), 10, 10);
        assert_eq!(page.items, (11..=20).collect::<Vec<_>>());
        assert_eq!(page.total, 25);
        assert_eq!(page.page, 2);
        assert_eq!(page.pages, 3);

        let past_end = paginate((1..=3).collect::<Vec<_>>(), 10, 10);
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.pages, 1);

        let empty = paginate(Vec::<u8>::new(), 0, 10);
        assert_eq!(empty.pages, 0);
        assert_eq!(empty.page, 1);
    }

    #[test]
    fn limit_is_clamped() {
        let q = ListQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(q.limit(), 1);
        let q = ListQuery {
            limit: Some(5000),
            ..Default::default()
        };
        assert_eq!(q.limit(), MAX_PAGE_SIZE);
        assert_eq!(ListQuery::default().limit(), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn search_is_case_insensitive() {
        assert!(title_matches("Quarterly Budget", "budget"));
        assert!(title_matches("Quarterly Budget", "  "));
        assert!(!title_matches("Quarterly Budget", "sales"));
    }

    #[test]
    fn blank_reports_are_rejected() {
        assert!(validate_new_report("Title", "Body").is_ok());
        assert!(validate_new_report("  ", "Body").is_err());
        assert!(validate_new_report("Title", "\n").is_err());
    }
}
