//! Runtime settings.
//!
//! Values come from the process environment, optionally seeded from a `.env`
//! file in the working directory.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

const DEFAULT_BIND: &str = "127.0.0.1:8000";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_SESSION_HOURS: u64 = 8 * 24;
const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";

/// SMTP relay used to deliver password reset codes.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the HTTP server listens on.
    pub bind_addr: String,

    /// Directory holding the database snapshot. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,

    /// Root directory for attachments and inline images.
    pub upload_dir: PathBuf,

    /// Largest accepted file, in bytes.
    pub max_upload_bytes: usize,

    /// How long a login token stays valid.
    pub session_lifetime: Duration,

    /// Browser origin allowed to call the API with credentials.
    pub cors_origin: String,

    pub smtp: Option<SmtpSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_addr: DEFAULT_BIND.to_string(),
            data_dir: Some(PathBuf::from("database")),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            session_lifetime: Duration::from_secs(DEFAULT_SESSION_HOURS * 60 * 60),
            cors_origin: DEFAULT_CORS_ORIGIN.to_string(),
            smtp: None,
        }
    }
}

impl Settings {
    /// Load settings from the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, AppError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(AppError::Config(format!("failed to read .env: {}", e)));
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = match get("REPORTDESK_DATA_DIR") {
            Some(dir) if dir == ":memory:" => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => defaults.data_dir,
        };

        let max_upload_bytes = match get("REPORTDESK_MAX_UPLOAD_BYTES") {
            Some(raw) => parse_number::<usize>("REPORTDESK_MAX_UPLOAD_BYTES", &raw)?,
            None => defaults.max_upload_bytes,
        };
        if max_upload_bytes == 0 {
            return Err(AppError::Config(
                "REPORTDESK_MAX_UPLOAD_BYTES must be positive".to_string(),
            ));
        }

        let session_lifetime = match get("REPORTDESK_SESSION_HOURS") {
            Some(raw) => {
                let hours = parse_number::<u64>("REPORTDESK_SESSION_HOURS", &raw)?;
                Duration::from_secs(hours * 60 * 60)
            }
            None => defaults.session_lifetime,
        };

        let smtp = match get("SMTP_HOST") {
            Some(host) => {
                let port = match get("SMTP_PORT") {
                    Some(raw) => parse_number::<u16>("SMTP_PORT", &raw)?,
                    None => 465,
                };
                let username = get("SMTP_USERNAME").unwrap_or_default();
                let from = get("SMTP_FROM").unwrap_or_else(|| username.clone());
                if from.is_empty() {
                    return Err(AppError::Config(
                        "SMTP_FROM or SMTP_USERNAME is required when SMTP_HOST is set".to_string(),
                    ));
                }
                Some(SmtpSettings {
                    host,
                    port,
                    username,
                    password: get("SMTP_PASSWORD").unwrap_or_default(),
                    from,
                })
            }
            None => None,
        };

        Ok(Settings {
            bind_addr: get("REPORTDESK_BIND").unwrap_or(defaults.bind_addr),
            data_dir,
            upload_dir: get("REPORTDESK_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            max_upload_bytes,
            session_lifetime,
            cors_origin: get("REPORTDESK_CORS_ORIGIN").unwrap_or(defaults.cors_origin),
            smtp,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, AppError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| AppError::Config(format!("{} must be a number, got {:?}", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.bind_addr, "127.0.0.1:8000");
        assert_eq!(settings.max_upload_bytes, 16 * 1024 * 1024);
        assert_eq!(settings.session_lifetime, Duration::from_secs(192 * 3600));
        assert!(settings.smtp.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let settings = Settings::from_lookup(lookup(&[
            ("REPORTDESK_BIND", "0.0.0.0:9000"),
            ("REPORTDESK_DATA_DIR", ":memory:"),
            ("REPORTDESK_SESSION_HOURS", "2"),
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USERNAME", "bot@example.com"),
        ]))
        .unwrap();
        assert_eq!(settings.bind_addr, "0.0.0.0:9000");
        assert!(settings.data_dir.is_none());
        assert_eq!(settings.session_lifetime, Duration::from_secs(7200));
        let smtp = settings.smtp.unwrap();
        assert_eq!(smtp.port, 465);
        assert_eq!(smtp.from, "bot@example.com");
    }

    #[test]
    fn bad_numbers_are_config_errors() {
        let err = Settings::from_lookup(lookup(&[("REPORTDESK_MAX_UPLOAD_BYTES", "lots")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
