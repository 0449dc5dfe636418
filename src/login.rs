//! User accounts, password hashing and login sessions.
//!
//! Login tokens are opaque random ids kept in a process-wide session table.
//! A request proves who it is with `Authorization: Bearer <token>` or with
//! the `session` cookie set at login.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{User, UserRole};
use crate::store::{Database, NewUser};

/// Name of the cookie carrying the session token
pub const SESSION_COOKIE: &str = "session";

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 50;

/// How long a password reset code stays valid
pub const RESET_CODE_LIFETIME_SECS: i64 = 60 * 60;

/// User session data
///
/// Represents an authenticated user session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Id of the authenticated user
    pub user_id: u64,

    /// Time when the session expires
    pub expires_at: SystemTime,
}

lazy_static! {
    static ref SESSIONS: RwLock<HashMap<String, Session>> = RwLock::new(HashMap::new());
}

/// Create a new user session
///
/// Stores a session for an authenticated user and drops any sessions that
/// have already expired.
///
/// # Arguments
/// * `user_id` - The user to create a session for
/// * `lifetime` - How long the session stays valid
///
/// # Returns
/// * `String` - A unique session token
pub fn create_session(user_id: u64, lifetime: Duration) -> String {
    let token = Uuid::new_v4().simple().to_string();
    let now = SystemTime::now();

    let mut sessions = SESSIONS.write().unwrap_or_else(|e| e.into_inner());
    sessions.retain(|_, s| s.expires_at > now);
    sessions.insert(
        token.clone(),
        Session {
            user_id,
            expires_at: now + lifetime,
        },
    );

    token
}

/// Validate a session
///
/// # Returns
/// * `Option<u64>` - The user id for the session if valid and unexpired
pub fn validate_session(token: &str) -> Option<u64> {
    let sessions = SESSIONS.read().unwrap_or_else(|e| e.into_inner());
    sessions
        .get(token)
        .filter(|s| s.expires_at > SystemTime::now())
        .map(|s| s.user_id)
}

/// End a single session (logout).
pub fn end_session(token: &str) {
    let mut sessions = SESSIONS.write().unwrap_or_else(|e| e.into_inner());
    sessions.remove(token);
}

/// End every session of a user, e.g. after their password was reset.
pub fn end_user_sessions(user_id: u64) {
    let mut sessions = SESSIONS.write().unwrap_or_else(|e| e.into_inner());
    sessions.retain(|_, s| s.user_id != user_id);
}

/// Hash a password using Argon2
///
/// # Errors
/// * Returns an error if the password hashing fails
pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| AppError::Storage("Password hashing failed".to_string()))
}

/// Verify a password against a stored hash
///
/// # Returns
/// * `Result<bool, AppError>` - True if the password matches, false if not
///
/// # Errors
/// * Returns an error if the hash is in an invalid format
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AppError> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|_| AppError::Storage("Invalid password hash format".to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

pub fn validate_username(username: &str) -> Result<(), AppError> {
    let len = username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(AppError::bad_request(format!(
            "Username must be between {} and {} characters",
            MIN_USERNAME_LEN, MAX_USERNAME_LEN
        )));
    }
    // Usernames double as @mention handles.
    let valid = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if !valid || username.ends_with('.') || username.ends_with('-') {
        return Err(AppError::bad_request(
            "Username may only contain letters, digits, '_', '.' and '-', and must not end with '.' or '-'",
        ));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), AppError> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(AppError::bad_request("Invalid email address"))
    }
}

/// Trim and validate an email address.
pub fn normalize_email(email: &str) -> Result<String, AppError> {
    let email = email.trim();
    validate_email(email)?;
    Ok(email.to_string())
}

pub fn validate_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Validate a registration and hash its password.
///
/// Uniqueness is checked later, when the user is inserted.
pub fn prepare_new_user(
    username: &str,
    email: &str,
    full_name: &str,
    password: &str,
) -> Result<NewUser, AppError> {
    let username = username.trim();
    validate_username(username)?;
    let email = normalize_email(email)?;
    validate_password(password)?;

    let full_name = if full_name.trim().is_empty() {
        username
    } else {
        full_name.trim()
    };

    Ok(NewUser {
        username: username.to_string(),
        email,
        full_name: full_name.to_string(),
        password_hash: hash_password(password)?,
        role: UserRole::Analyst,
    })
}

/// Check a login (username or email) and password.
///
/// # Returns
/// * `Ok(Some(user))` for valid credentials of an active user, `Ok(None)` otherwise
pub fn authenticate(db: &Database, login: &str, password: &str) -> Result<Option<User>, AppError> {
    let Some(user) = db.user_by_login(login.trim()) else {
        return Ok(None);
    };
    if !user.is_active || !verify_password(password, &user.password_hash)? {
        return Ok(None);
    }
    Ok(Some(user.clone()))
}

/// Whether `code` is the user's current, unexpired reset code.
pub fn reset_code_matches(user: &User, code: &str, now: chrono::DateTime<chrono::Utc>) -> bool {
    match (&user.reset_code, user.reset_code_expires) {
        (Some(stored), Some(expires)) => {
            now <= expires && stored.eq_ignore_ascii_case(code.trim())
        }
        _ => false,
    }
}

// Web handler functions below (only compiled with "web" feature)

#[cfg(feature = "web")]
pub use handlers::*;

#[cfg(feature = "web")]
mod handlers {
    use axum::{
        Extension, Form, Json,
        extract::{Path, Query, Request, State},
        http::header,
        middleware::Next,
        response::{IntoResponse, Response},
    };
    use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
    use chrono::Utc;
    use serde::Deserialize;

    use super::*;
    use crate::app::SharedState;
    use crate::mailer::generate_reset_code;
    use crate::mentions::DEFAULT_SUGGESTIONS;
    use crate::models::{Project, Token, UserResponse};
    use crate::store::UserChanges;

    /// The authenticated caller, placed in request extensions by [`require_auth`].
    #[derive(Debug, Clone)]
    pub struct AuthUser {
        pub user: User,
        pub token: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct RegisterRequest {
        pub username: String,
        pub email: String,
        pub password: String,
        #[serde(default)]
        pub full_name: String,
    }

    /// Login form; `username` may also be an email address.
    #[derive(Debug, Deserialize)]
    pub struct LoginForm {
        pub username: String,
        pub password: String,
    }

    /// Changes a user may make to their own account.
    #[derive(Debug, Default, Deserialize)]
    pub struct ProfileUpdate {
        pub full_name: Option<String>,
        pub password: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct PasswordChangeRequest {
        pub old_password: String,
        pub new_password: String,
        pub confirm_password: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct PasswordResetRequest {
        pub email: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct PasswordResetConfirm {
        pub email: String,
        pub reset_code: String,
        pub new_password: String,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct AdminUserUpdate {
        pub email: Option<String>,
        pub full_name: Option<String>,
        pub role: Option<UserRole>,
        pub is_active: Option<bool>,
        pub password: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ProjectAssignment {
        pub projects: Vec<Project>,
    }

    #[derive(Debug, Deserialize)]
    pub struct UserSearchQuery {
        #[serde(default)]
        pub q: String,
        pub limit: Option<usize>,
    }

    fn bearer_token(request: &Request) -> Option<String> {
        let value = request
            .headers()
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?;
        let (scheme, token) = value.split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
            Some(token.trim().to_string())
        } else {
            None
        }
    }

    /// Authentication middleware
    ///
    /// Resolves the bearer token or session cookie to an active user and
    /// stores it in the request extensions. Anything else gets a 401.
    pub async fn require_auth(
        State(state): State<SharedState>,
        jar: CookieJar,
        mut request: Request,
        next: Next,
    ) -> Response {
        let token = bearer_token(&request)
            .or_else(|| jar.get(SESSION_COOKIE).map(|c| c.value().to_string()));

        let Some(token) = token else {
            return AppError::Unauthorized("Not authenticated".to_string()).into_response();
        };
        let Some(user_id) = validate_session(&token) else {
            return AppError::Unauthorized("Session expired or invalid".to_string())
                .into_response();
        };

        let user = match state.store.read(|db| db.user(user_id).cloned()) {
            Ok(Some(user)) if user.is_active => user,
            Ok(_) => {
                end_session(&token);
                return AppError::Unauthorized("Account is not active".to_string())
                    .into_response();
            }
            Err(e) => return e.into_response(),
        };

        request.extensions_mut().insert(AuthUser { user, token });
        next.run(request).await
    }

    fn require_admin(auth: &AuthUser) -> Result<(), AppError> {
        if auth.user.is_admin() {
            Ok(())
        } else {
            Err(AppError::forbidden("Administrator access required"))
        }
    }

    /// Handle user registration
    pub async fn handle_register(
        State(state): State<SharedState>,
        Json(req): Json<RegisterRequest>,
    ) -> Result<Json<UserResponse>, AppError> {
        let new_user = prepare_new_user(&req.username, &req.email, &req.full_name, &req.password)?;
        let user = state
            .store
            .write(|db| db.create_user(new_user, Utc::now()))?;

        log::info!("registered user {} (id {})", user.username, user.id);
        Ok(Json(UserResponse::from(&user)))
    }

    /// Handle user login requests
    ///
    /// Validates credentials and returns a bearer token; the same token is
    /// set as the session cookie for browser clients.
    pub async fn handle_login(
        State(state): State<SharedState>,
        jar: CookieJar,
        Form(form): Form<LoginForm>,
    ) -> Result<(CookieJar, Json<Token>), AppError> {
        let user = state
            .store
            .read(|db| authenticate(db, &form.username, &form.password))??;
        let Some(user) = user else {
            log::info!("failed login for {:?}", form.username);
            return Err(AppError::Unauthorized(
                "Incorrect username or password".to_string(),
            ));
        };

        let token = create_session(user.id, state.settings.session_lifetime);
        let cookie = Cookie::build((SESSION_COOKIE, token.clone()))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax);

        log::info!("user {} logged in", user.username);
        Ok((
            jar.add(cookie),
            Json(Token {
                access_token: token,
                token_type: "bearer".to_string(),
            }),
        ))
    }

    /// Handle user logout
    ///
    /// Ends the session and clears the session cookie.
    pub async fn handle_logout(
        Extension(auth): Extension<AuthUser>,
        jar: CookieJar,
    ) -> (CookieJar, Json<serde_json::Value>) {
        end_session(&auth.token);
        (
            jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
            Json(serde_json::json!({ "success": true })),
        )
    }

    pub async fn handle_me(Extension(auth): Extension<AuthUser>) -> Json<UserResponse> {
        Json(UserResponse::from(&auth.user))
    }

    /// Update the caller's own full name and/or password.
    pub async fn handle_update_me(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Json(req): Json<ProfileUpdate>,
    ) -> Result<Json<UserResponse>, AppError> {
        let full_name = match req.full_name.as_deref().map(str::trim) {
            Some("") => return Err(AppError::bad_request("Full name cannot be empty")),
            Some(name) => Some(name.to_string()),
            None => None,
        };
        let password_hash = match &req.password {
            Some(password) => {
                validate_password(password)?;
                Some(hash_password(password)?)
            }
            None => None,
        };

        let user = state.store.write(|db| {
            db.update_user(
                auth.user.id,
                UserChanges {
                    full_name,
                    password_hash,
                    ..Default::default()
                },
            )
        })?;
        Ok(Json(UserResponse::from(&user)))
    }

    /// Handle password change for authenticated users
    pub async fn handle_change_password(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Json(req): Json<PasswordChangeRequest>,
    ) -> Result<Json<serde_json::Value>, AppError> {
        if !verify_password(&req.old_password, &auth.user.password_hash)? {
            return Err(AppError::bad_request("Invalid old password"));
        }
        if req.new_password != req.confirm_password {
            return Err(AppError::bad_request("New passwords don't match"));
        }
        validate_password(&req.new_password)?;

        let hash = hash_password(&req.new_password)?;
        state.store.write(|db| {
            db.update_user(
                auth.user.id,
                UserChanges {
                    password_hash: Some(hash),
                    ..Default::default()
                },
            )
        })?;

        Ok(Json(
            serde_json::json!({ "message": "Password changed successfully" }),
        ))
    }

    /// Handle password reset requests
    ///
    /// Generates a reset code for the account with this email and mails it.
    /// The response is the same whether or not the email is registered.
    pub async fn handle_forgot_password(
        State(state): State<SharedState>,
        Json(req): Json<PasswordResetRequest>,
    ) -> Result<Json<serde_json::Value>, AppError> {
        let code = generate_reset_code();
        let expires = Utc::now() + chrono::Duration::seconds(RESET_CODE_LIFETIME_SECS);

        let target = state.store.write(|db| {
            let Some(user_id) = db.user_by_email(req.email.trim()).map(|u| u.id) else {
                return Ok(None);
            };
            db.set_reset_code(user_id, code.clone(), expires)?;
            Ok(db.user(user_id).map(|u| u.email.clone()))
        })?;

        if let Some(email) = target {
            match state.mailer.clone() {
                Some(mailer) => {
                    let code = code.clone();
                    let sent = tokio::task::spawn_blocking(move || {
                        mailer.send_password_reset(&email, &code)
                    })
                    .await;
                    match sent {
                        Ok(Ok(())) => log::info!("sent password reset code"),
                        Ok(Err(e)) => log::error!("failed to send password reset email: {}", e),
                        Err(e) => log::error!("password reset mail task failed: {}", e),
                    }
                }
                None => log::warn!(
                    "no SMTP configured; password reset code for {} is {}",
                    email,
                    code
                ),
            }
        }

        Ok(Json(serde_json::json!({
            "message": "If the email is registered, a reset code has been sent"
        })))
    }

    /// Handle password reset confirmation
    pub async fn handle_reset_password(
        State(state): State<SharedState>,
        Json(req): Json<PasswordResetConfirm>,
    ) -> Result<Json<serde_json::Value>, AppError> {
        validate_password(&req.new_password)?;
        let hash = hash_password(&req.new_password)?;
        let now = Utc::now();

        let user_id = state.store.write(|db| {
            let user = db
                .user_by_email(req.email.trim())
                .filter(|u| reset_code_matches(u, &req.reset_code, now))
                .ok_or_else(|| AppError::bad_request("Invalid or expired reset code"))?;
            let id = user.id;
            db.update_user(
                id,
                UserChanges {
                    password_hash: Some(hash),
                    ..Default::default()
                },
            )?;
            Ok(id)
        })?;

        end_user_sessions(user_id);
        Ok(Json(
            serde_json::json!({ "message": "Password reset successful" }),
        ))
    }

    /// List all users (admin only)
    pub async fn list_users(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
    ) -> Result<Json<Vec<UserResponse>>, AppError> {
        require_admin(&auth)?;
        let users = state
            .store
            .read(|db| db.users().map(UserResponse::from).collect::<Vec<_>>())?;
        Ok(Json(users))
    }

    /// Update a user (admin only)
    pub async fn update_user(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path(user_id): Path<u64>,
        Json(req): Json<AdminUserUpdate>,
    ) -> Result<Json<UserResponse>, AppError> {
        require_admin(&auth)?;
        let email = req.email.as_deref().map(normalize_email).transpose()?;
        let password_hash = match &req.password {
            Some(password) => {
                validate_password(password)?;
                Some(hash_password(password)?)
            }
            None => None,
        };
        let deactivated = req.is_active == Some(false);

        let user = state.store.write(|db| {
            db.update_user(
                user_id,
                UserChanges {
                    email,
                    full_name: req.full_name,
                    role: req.role,
                    is_active: req.is_active,
                    password_hash,
                },
            )
        })?;

        if deactivated {
            end_user_sessions(user.id);
        }
        log::info!("admin {} updated user {}", auth.user.username, user.username);
        Ok(Json(UserResponse::from(&user)))
    }

    /// Assign projects to a user (superusers, directors and managers)
    pub async fn assign_projects(
        State(state): State<SharedState>,
        Extension(auth): Extension<AuthUser>,
        Path(user_id): Path<u64>,
        Json(req): Json<ProjectAssignment>,
    ) -> Result<Json<UserResponse>, AppError> {
        if !auth.user.can_manage_projects() {
            return Err(AppError::forbidden(
                "You don't have permission to assign projects",
            ));
        }
        let user = state
            .store
            .write(|db| db.assign_projects(user_id, &req.projects))?;
        Ok(Json(UserResponse::from(&user)))
    }

    /// Find users for @-mention autocompletion.
    pub async fn search_users(
        State(state): State<SharedState>,
        Extension(_auth): Extension<AuthUser>,
        Query(query): Query<UserSearchQuery>,
    ) -> Result<Json<Vec<UserResponse>>, AppError> {
        let limit = query.limit.unwrap_or(DEFAULT_SUGGESTIONS).clamp(1, 50);
        let users = state.store.read(|db| {
            db.search_users(&query.q, limit)
                .iter()
                .map(UserResponse::from)
                .collect::<Vec<_>>()
        })?;
        Ok(Json(users))
    }
}
