//! HTTP server: shared state, routing and start-up.

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post, put},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::comments;
use crate::config::Settings;
use crate::error::AppError;
use crate::login;
use crate::mailer::Mailer;
use crate::mentions;
use crate::reports;
use crate::store::Store;
use crate::uploads::{self, UploadStore};

/// Room for multipart framing and text fields on top of the file limit.
const BODY_SLACK_BYTES: usize = 1024 * 1024;

pub struct AppState {
    pub store: Store,
    pub settings: Settings,
    pub uploads: UploadStore,
    pub mailer: Option<Arc<Mailer>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Open the store, the upload directories and the mailer described by `settings`.
    pub fn new(settings: Settings) -> Result<Self, AppError> {
        let store = Store::open(settings.data_dir.as_deref())?;
        let uploads = UploadStore::open(&settings.upload_dir)?;
        let mailer = match &settings.smtp {
            Some(smtp) => {
                log::info!("password reset mail goes through {}:{}", smtp.host, smtp.port);
                Some(Arc::new(Mailer::new(smtp)?))
            }
            None => {
                log::warn!("SMTP is not configured; password reset codes will be logged");
                None
            }
        };

        Ok(AppState {
            store,
            settings,
            uploads,
            mailer,
        })
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn cors_layer(settings: &Settings) -> Result<CorsLayer, AppError> {
    let origin = settings.cors_origin.parse::<HeaderValue>().map_err(|_| {
        AppError::Config(format!("invalid CORS origin {:?}", settings.cors_origin))
    })?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true))
}

/// Build the application router.
///
/// Everything lives under `/api`; inline images are served statically from
/// `/uploads/inline`.
pub fn build_router(state: SharedState) -> Result<Router, AppError> {
    let public = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(login::handle_register))
        .route("/auth/login", post(login::handle_login))
        .route("/auth/forgot-password", post(login::handle_forgot_password))
        .route("/auth/reset-password", post(login::handle_reset_password));

    let protected = Router::new()
        .route("/auth/me", get(login::handle_me).put(login::handle_update_me))
        .route("/auth/logout", post(login::handle_logout))
        .route("/auth/change-password", post(login::handle_change_password))
        .route("/users", get(login::list_users))
        .route("/users/search", get(login::search_users))
        .route("/users/:id", put(login::update_user))
        .route("/users/:id/projects", put(login::assign_projects))
        .route(
            "/reports",
            get(reports::list_reports).post(reports::create_report),
        )
        .route("/reports/upload-inline", post(reports::upload_inline_image))
        .route(
            "/reports/:id",
            get(reports::get_report)
                .put(reports::update_report)
                .delete(reports::delete_report),
        )
        .route("/reports/:id/attachments", post(uploads::upload_attachment))
        .route(
            "/reports/:id/attachments/:attachment_id",
            get(uploads::download_attachment).delete(uploads::delete_attachment),
        )
        .route("/comments", post(comments::create_comment))
        .route("/comments/report/:report_id", get(comments::list_comments))
        .route(
            "/comments/:id",
            put(comments::update_comment).delete(comments::delete_comment),
        )
        .route("/mentions", get(mentions::list_my_mentions))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            login::require_auth,
        ));

    let body_limit = state.settings.max_upload_bytes + BODY_SLACK_BYTES;
    let cors = cors_layer(&state.settings)?;

    Ok(Router::new()
        .nest("/api", public.merge(protected))
        .nest_service("/uploads/inline", ServeDir::new(state.uploads.inline_dir()))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state))
}

/// Start the server and run until it fails.
pub async fn run(settings: Settings) -> Result<(), AppError> {
    let bind_addr = settings.bind_addr.clone();
    let state = Arc::new(AppState::new(settings)?);
    let app = build_router(state)?;

    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
