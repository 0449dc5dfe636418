//! Typed HTTP client for the API, plus optimistic comment editing on top of it.
//!
//! ```no_run
//! # async fn demo() -> Result<(), reportdesk::client::ClientError> {
//! use reportdesk::client::{ApiClient, CommentSection};
//!
//! let mut api = ApiClient::new("http://127.0.0.1:8000");
//! api.login("alice", "password1").await?;
//! let me = api.me().await?;
//!
//! let mut section = CommentSection::load(&api, 1, &me).await?;
//! section.post(&api, None, "Looks good @bob").await?;
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::comments::{CommentNode, CommentThread, MAX_COMMENT_PAGE, NodeKey, ThreadError};
use crate::models::{AttachmentResponse, MentionResponse, ReportResponse, Token, UserResponse};
use crate::reports::Page;
use crate::uploads::UploadedFile;

/// Root comments requested per page when loading a whole thread.
pub const COMMENT_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error status.
    #[error("{status}: {detail}")]
    Api { status: StatusCode, detail: String },

    #[error("comment thread: {0}")]
    Thread(#[from] ThreadError),
}

impl ClientError {
    /// HTTP status of an API error, if this is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(e) => e.status(),
            ClientError::Thread(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Deserialize)]
struct DeletedComments {
    #[serde(default)]
    deleted: Vec<u64>,
}

/// Client for one server. Holds the bearer token after [`ApiClient::login`].
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8000`.
    pub fn new(base_url: &str) -> Self {
        ApiClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/api{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn checked(builder: RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.detail)
            .unwrap_or(text);
        Err(ClientError::Api { status, detail })
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ClientError> {
        Ok(Self::checked(builder).await?.json::<T>().await?)
    }

    fn file_part(file: &UploadedFile) -> Result<Part, ClientError> {
        Ok(Part::bytes(file.bytes.clone())
            .file_name(file.filename.clone())
            .mime_str(&file.content_type)?)
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<UserResponse, ClientError> {
        let body = serde_json::json!({
            "username": username,
            "email": email,
            "password": password,
            "full_name": full_name,
        });
        Self::send(self.request(Method::POST, "/auth/register").json(&body)).await
    }

    /// Log in with a username or email and keep the returned token.
    pub async fn login(&mut self, login: &str, password: &str) -> Result<Token, ClientError> {
        let form = [("username", login), ("password", password)];
        let token: Token =
            Self::send(self.request(Method::POST, "/auth/login").form(&form)).await?;
        self.token = Some(token.access_token.clone());
        Ok(token)
    }

    pub async fn logout(&mut self) -> Result<(), ClientError> {
        Self::checked(self.request(Method::POST, "/auth/logout")).await?;
        self.token = None;
        Ok(())
    }

    pub async fn me(&self) -> Result<UserResponse, ClientError> {
        Self::send(self.request(Method::GET, "/auth/me")).await
    }

    /// Change the signed-in user's full name and/or password.
    pub async fn update_me(
        &self,
        full_name: Option<&str>,
        password: Option<&str>,
    ) -> Result<UserResponse, ClientError> {
        let body = serde_json::json!({
            "full_name": full_name,
            "password": password,
        });
        Self::send(self.request(Method::PUT, "/auth/me").json(&body)).await
    }

    pub async fn list_reports(
        &self,
        skip: usize,
        limit: usize,
        search: &str,
    ) -> Result<Page<ReportResponse>, ClientError> {
        let query = [
            ("skip", skip.to_string()),
            ("limit", limit.to_string()),
            ("search", search.to_string()),
        ];
        Self::send(self.request(Method::GET, "/reports").query(&query)).await
    }

    pub async fn get_report(&self, report_id: u64) -> Result<ReportResponse, ClientError> {
        Self::send(self.request(Method::GET, &format!("/reports/{}", report_id))).await
    }

    pub async fn create_report(
        &self,
        title: &str,
        content: &str,
        files: &[UploadedFile],
    ) -> Result<ReportResponse, ClientError> {
        let mut form = Form::new()
            .text("title", title.to_string())
            .text("content", content.to_string());
        for file in files {
            form = form.part("files", Self::file_part(file)?);
        }
        Self::send(self.request(Method::POST, "/reports").multipart(form)).await
    }

    /// Change title and/or content; `files` are appended as attachments.
    pub async fn update_report(
        &self,
        report_id: u64,
        title: Option<&str>,
        content: Option<&str>,
        files: &[UploadedFile],
    ) -> Result<ReportResponse, ClientError> {
        let mut form = Form::new();
        if let Some(title) = title {
            form = form.text("title", title.to_string());
        }
        if let Some(content) = content {
            form = form.text("content", content.to_string());
        }
        for file in files {
            form = form.part("files", Self::file_part(file)?);
        }
        Self::send(
            self.request(Method::PUT, &format!("/reports/{}", report_id))
                .multipart(form),
        )
        .await
    }

    pub async fn delete_report(&self, report_id: u64) -> Result<(), ClientError> {
        Self::checked(self.request(Method::DELETE, &format!("/reports/{}", report_id))).await?;
        Ok(())
    }

    pub async fn upload_attachment(
        &self,
        report_id: u64,
        file: &UploadedFile,
    ) -> Result<AttachmentResponse, ClientError> {
        let form = Form::new().part("file", Self::file_part(file)?);
        Self::send(
            self.request(Method::POST, &format!("/reports/{}/attachments", report_id))
                .multipart(form),
        )
        .await
    }

    pub async fn download_attachment(
        &self,
        report_id: u64,
        attachment_id: u64,
    ) -> Result<Vec<u8>, ClientError> {
        let path = format!("/reports/{}/attachments/{}", report_id, attachment_id);
        let response = Self::checked(self.request(Method::GET, &path)).await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn delete_attachment(
        &self,
        report_id: u64,
        attachment_id: u64,
    ) -> Result<(), ClientError> {
        let path = format!("/reports/{}/attachments/{}", report_id, attachment_id);
        Self::checked(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    /// One page of root comments, each with all of its replies.
    pub async fn list_comments(
        &self,
        report_id: u64,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<CommentNode>, ClientError> {
        let query = [("skip", skip), ("limit", limit)];
        Self::send(
            self.request(Method::GET, &format!("/comments/report/{}", report_id))
                .query(&query),
        )
        .await
    }

    /// Every root comment of a report, fetched `page_size` roots at a time.
    pub async fn list_all_comments(
        &self,
        report_id: u64,
        page_size: usize,
    ) -> Result<Vec<CommentNode>, ClientError> {
        let page_size = page_size.clamp(1, MAX_COMMENT_PAGE);
        let mut roots = Vec::new();
        loop {
            let page = self.list_comments(report_id, roots.len(), page_size).await?;
            let done = page.len() < page_size;
            roots.extend(page);
            if done {
                return Ok(roots);
            }
        }
    }

    pub async fn create_comment(
        &self,
        report_id: u64,
        parent_id: Option<u64>,
        content: &str,
    ) -> Result<CommentNode, ClientError> {
        let body = serde_json::json!({
            "report_id": report_id,
            "parent_id": parent_id,
            "content": content,
        });
        Self::send(self.request(Method::POST, "/comments").json(&body)).await
    }

    pub async fn update_comment(
        &self,
        comment_id: u64,
        content: &str,
    ) -> Result<CommentNode, ClientError> {
        let body = serde_json::json!({ "content": content });
        Self::send(
            self.request(Method::PUT, &format!("/comments/{}", comment_id))
                .json(&body),
        )
        .await
    }

    /// Delete a comment; returns the ids removed with it, the comment first.
    pub async fn delete_comment(&self, comment_id: u64) -> Result<Vec<u64>, ClientError> {
        let deleted: DeletedComments =
            Self::send(self.request(Method::DELETE, &format!("/comments/{}", comment_id))).await?;
        Ok(deleted.deleted)
    }

    pub async fn search_users(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<UserResponse>, ClientError> {
        let query = [("q", query.to_string()), ("limit", limit.to_string())];
        Self::send(self.request(Method::GET, "/users/search").query(&query)).await
    }

    pub async fn my_mentions(&self) -> Result<Vec<MentionResponse>, ClientError> {
        Self::send(self.request(Method::GET, "/mentions")).await
    }
}

/// The comment thread of one report, kept in sync with the server through
/// optimistic updates.
///
/// Every mutation is applied locally first. If the server refuses it the
/// local change is undone, so the thread never shows a state the server
/// rejected.
#[derive(Debug, Clone)]
pub struct CommentSection {
    thread: CommentThread,
    user_id: u64,
    username: String,
}

impl CommentSection {
    pub fn new(thread: CommentThread, me: &UserResponse) -> Self {
        CommentSection {
            thread,
            user_id: me.id,
            username: me.username.clone(),
        }
    }

    /// Fetch the current thread of `report_id`.
    pub async fn load(
        client: &ApiClient,
        report_id: u64,
        me: &UserResponse,
    ) -> Result<Self, ClientError> {
        let roots = client.list_all_comments(report_id, COMMENT_PAGE_SIZE).await?;
        Ok(Self::new(CommentThread::from_nodes(report_id, roots), me))
    }

    pub fn thread(&self) -> &CommentThread {
        &self.thread
    }

    /// Replace the local thread with the server's.
    pub async fn refresh(&mut self, client: &ApiClient) -> Result<(), ClientError> {
        let report_id = self.thread.report_id();
        let roots = client.list_all_comments(report_id, COMMENT_PAGE_SIZE).await?;
        self.thread = CommentThread::from_nodes(report_id, roots);
        Ok(())
    }

    /// Post a comment, or a reply when `parent` is given.
    ///
    /// # Returns
    /// * `NodeKey::Saved` of the stored comment
    pub async fn post(
        &mut self,
        client: &ApiClient,
        parent: Option<u64>,
        content: &str,
    ) -> Result<NodeKey, ClientError> {
        let key = self.thread.insert_optimistic(
            parent,
            self.user_id,
            &self.username,
            content,
            Utc::now(),
        )?;

        match client
            .create_comment(self.thread.report_id(), parent, content)
            .await
        {
            Ok(saved) => {
                let id = saved.id;
                self.thread.confirm(key, saved)?;
                Ok(NodeKey::Saved(id))
            }
            Err(e) => {
                if let Err(rollback) = self.thread.rollback(key) {
                    log::warn!("could not roll back {}: {}", key, rollback);
                }
                Err(e)
            }
        }
    }

    /// Edit a stored comment, reverting the local text if the server refuses.
    pub async fn edit(
        &mut self,
        client: &ApiClient,
        comment_id: u64,
        content: &str,
    ) -> Result<(), ClientError> {
        let key = NodeKey::Saved(comment_id);
        let previous = self.thread.edit(key, content, Utc::now())?;

        match client.update_comment(comment_id, content).await {
            Ok(saved) => {
                self.thread.edit(
                    key,
                    &saved.content,
                    saved.updated_at.unwrap_or_else(Utc::now),
                )?;
                Ok(())
            }
            Err(e) => {
                self.thread.restore_content(key, previous)?;
                Err(e)
            }
        }
    }

    /// Delete a stored comment with its replies, putting the subtree back if
    /// the server refuses.
    pub async fn delete(&mut self, client: &ApiClient, comment_id: u64) -> Result<(), ClientError> {
        let key = NodeKey::Saved(comment_id);
        let detached = self.thread.remove(key).ok_or(ThreadError::NotFound(key))?;

        match client.delete_comment(comment_id).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.thread.reattach(detached)?;
                Err(e)
            }
        }
    }
}
