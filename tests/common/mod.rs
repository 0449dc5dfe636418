#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use reportdesk::app::{AppState, SharedState, build_router};
use reportdesk::config::Settings;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const PASSWORD: &str = "password123";
pub const BOUNDARY: &str = "reportdesk-test-boundary";

pub struct TestApp {
    pub router: Router,
    pub state: SharedState,
    _dir: TempDir,
}

pub fn settings_in(dir: &TempDir) -> Settings {
    Settings {
        data_dir: None,
        upload_dir: dir.path().join("uploads"),
        ..Settings::default()
    }
}

pub fn test_app() -> TestApp {
    test_app_with(|_| {})
}

pub fn test_app_with(tweak: impl FnOnce(&mut Settings)) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings_in(&dir);
    tweak(&mut settings);
    let state = Arc::new(AppState::new(settings).unwrap());
    TestApp {
        router: build_router(state.clone()).unwrap(),
        state,
        _dir: dir,
    }
}

/// One multipart part: field name, optional (file name, content type), body.
pub struct Part<'a> {
    pub name: &'a str,
    pub file: Option<(&'a str, &'a str)>,
    pub body: &'a [u8],
}

pub fn text_part<'a>(name: &'a str, value: &'a str) -> Part<'a> {
    Part {
        name,
        file: None,
        body: value.as_bytes(),
    }
}

pub fn file_part<'a>(name: &'a str, filename: &'a str, content_type: &'a str, body: &'a [u8]) -> Part<'a> {
    Part {
        name,
        file: Some((filename, content_type)),
        body,
    }
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part.file {
            Some((filename, content_type)) => {
                out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        part.name, filename, content_type
                    )
                    .as_bytes(),
                );
            }
            None => {
                out.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name)
                        .as_bytes(),
                );
            }
        }
        out.extend_from_slice(part.body);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    out
}

impl TestApp {
    pub async fn raw(&self, request: Request<Body>) -> axum::response::Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.raw(request).await;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn json(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    pub async fn multipart(
        &self,
        method: &str,
        uri: &str,
        token: &str,
        parts: &[Part<'_>],
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap();
        self.send(request).await
    }

    pub async fn login(&self, login: &str, password: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("username={}&password={}", login, password)))
            .unwrap();
        self.send(request).await
    }

    /// Register `username` and return a bearer token for it.
    pub async fn signup(&self, username: &str) -> String {
        let (status, _) = self
            .json(
                "POST",
                "/api/auth/register",
                None,
                Some(serde_json::json!({
                    "username": username,
                    "email": format!("{}@example.com", username),
                    "password": PASSWORD,
                    "full_name": username.to_uppercase(),
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "registering {}", username);

        let (status, body) = self.login(username, PASSWORD).await;
        assert_eq!(status, StatusCode::OK, "logging in {}", username);
        body["access_token"].as_str().unwrap().to_string()
    }

    pub async fn create_report(&self, token: &str, title: &str, content: &str) -> Value {
        let (status, body) = self
            .multipart(
                "POST",
                "/api/reports",
                token,
                &[text_part("title", title), text_part("content", content)],
            )
            .await;
        assert_eq!(status, StatusCode::OK, "creating report: {}", body);
        body
    }

    pub async fn comment(
        &self,
        token: &str,
        report_id: u64,
        parent_id: Option<u64>,
        content: &str,
    ) -> (StatusCode, Value) {
        self.json(
            "POST",
            "/api/comments",
            Some(token),
            Some(serde_json::json!({
                "report_id": report_id,
                "parent_id": parent_id,
                "content": content,
            })),
        )
        .await
    }
}
