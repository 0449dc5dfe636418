//! Stored records and the JSON shapes the API returns.
//!
//! Stored records are serialized with bincode inside the database snapshot,
//! so they avoid serde attributes that skip fields. The `*Response` types are
//! what goes over the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a user inside the organisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Director,
    Manager,
    Developer,
    #[default]
    Analyst,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Director => "director",
            UserRole::Manager => "manager",
            UserRole::Developer => "developer",
            UserRole::Analyst => "analyst",
        }
    }
}

/// Projects a user can be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Project {
    #[serde(rename = "HIMS")]
    Hims,
    #[serde(rename = "ISPK")]
    Ispk,
    Rasumi,
    #[serde(rename = "MDI")]
    Mdi,
    Eroses,
    MyAssessement,
    MyCukai,
}

impl Project {
    pub const ALL: [Project; 7] = [
        Project::Hims,
        Project::Ispk,
        Project::Rasumi,
        Project::Mdi,
        Project::Eroses,
        Project::MyAssessement,
        Project::MyCukai,
    ];
}

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,

    /// Unique login name, also the handle used in `@mentions`
    pub username: String,

    /// Unique email address, accepted as an alternative login
    pub email: String,

    pub full_name: String,

    /// Argon2 hash of the user's password
    pub password_hash: String,

    pub role: UserRole,

    pub projects: Vec<Project>,

    pub is_active: bool,

    pub is_superuser: bool,

    pub created_at: DateTime<Utc>,

    /// Password reset code (if a reset has been requested)
    pub reset_code: Option<String>,

    /// Expiration time for the reset code
    pub reset_code_expires: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.is_superuser || self.role == UserRole::Admin
    }

    pub fn can_manage_projects(&self) -> bool {
        self.is_superuser || matches!(self.role, UserRole::Director | UserRole::Manager)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: u64,
    pub title: String,
    /// Markdown source, stored verbatim
    pub content: String,
    pub user_id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: u64,
    /// Name the file was uploaded with
    pub filename: String,
    /// Location relative to the upload root
    pub file_path: String,
    pub content_type: String,
    pub size: u64,
    pub report_id: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub content: String,
    pub report_id: u64,
    pub user_id: u64,
    /// Comment this one replies to; `None` for top-level comments
    pub parent_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A user named with `@username` in a report body or a comment.
///
/// `report_id` is always set; `comment_id` is set when the mention came from
/// a comment on that report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    pub id: u64,
    pub user_id: u64,
    pub report_id: u64,
    pub comment_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: u64,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub role: UserRole,
    pub is_active: bool,
    pub is_superuser: bool,
    #[serde(default)]
    pub projects: Vec<Project>,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        UserResponse {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            role: user.role,
            is_active: user.is_active,
            is_superuser: user.is_superuser,
            projects: user.projects.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentResponse {
    pub id: u64,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub report_id: u64,
    pub created_at: DateTime<Utc>,
    /// Download location under the API root
    pub url: String,
}

impl From<&Attachment> for AttachmentResponse {
    fn from(attachment: &Attachment) -> Self {
        AttachmentResponse {
            id: attachment.id,
            filename: attachment.filename.clone(),
            content_type: attachment.content_type.clone(),
            size: attachment.size,
            report_id: attachment.report_id,
            created_at: attachment.created_at,
            url: format!(
                "/api/reports/{}/attachments/{}",
                attachment.report_id, attachment.id
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub id: u64,
    pub user_id: u64,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub user: Option<UserResponse>,
    #[serde(default)]
    pub attachments: Vec<AttachmentResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionResponse {
    pub id: u64,
    pub report_id: u64,
    pub comment_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    /// Title of the report the mention appears in
    pub report_title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
}
