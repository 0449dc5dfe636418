#[cfg(feature = "web")]
use lettre::transport::smtp::authentication::Credentials;
#[cfg(feature = "web")]
use lettre::transport::smtp::client::{Tls, TlsParameters};
#[cfg(feature = "web")]
use lettre::message::Mailbox;
#[cfg(feature = "web")]
use lettre::{Message, SmtpTransport, Transport};
#[cfg(feature = "web")]
use rand::Rng;

#[cfg(feature = "web")]
use crate::config::SmtpSettings;
#[cfg(feature = "web")]
use crate::error::AppError;

/// Length of a password reset code
pub const RESET_CODE_LEN: usize = 8;

/// Sends password reset codes over SMTP.
#[cfg(feature = "web")]
pub struct Mailer {
    smtp: SmtpTransport,
    from: String,
}

#[cfg(feature = "web")]
impl Mailer {
    /// Build an SMTP transport. Port 465 uses implicit TLS, anything else
    /// upgrades with STARTTLS.
    pub fn new(settings: &SmtpSettings) -> Result<Self, AppError> {
        let mail_err = |e: lettre::transport::smtp::Error| AppError::Mail(e.to_string());

        let builder = if settings.port == 465 {
            let tls_parameters = TlsParameters::new(settings.host.clone()).map_err(mail_err)?;
            SmtpTransport::relay(&settings.host)
                .map_err(mail_err)?
                .tls(Tls::Wrapper(tls_parameters))
        } else {
            SmtpTransport::starttls_relay(&settings.host).map_err(mail_err)?
        };

        let mut builder = builder.port(settings.port);
        if !settings.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ));
        }

        Ok(Mailer {
            smtp: builder.build(),
            from: settings.from.clone(),
        })
    }

    pub fn send_password_reset(&self, to_email: &str, reset_code: &str) -> Result<(), AppError> {
        let from = self
            .from
            .parse::<Mailbox>()
            .map_err(|e: lettre::address::AddressError| AppError::Mail(e.to_string()))?;
        let to = to_email
            .parse::<Mailbox>()
            .map_err(|e: lettre::address::AddressError| AppError::Mail(e.to_string()))?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject("Password Reset Request")
            .body(format!(
                "Your password reset code is: {}\nThis code will expire in 1 hour.",
                reset_code
            ))
            .map_err(|e| AppError::Mail(e.to_string()))?;

        self.smtp
            .send(&email)
            .map_err(|e| AppError::Mail(e.to_string()))?;
        Ok(())
    }
}

#[cfg(feature = "web")]
pub fn generate_reset_code() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();

    (0..RESET_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use super::*;

    #[test]
    fn reset_codes_use_the_expected_alphabet() {
        let code = generate_reset_code();
        assert_eq!(code.len(), RESET_CODE_LEN);
        assert!(
            code.chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn mailer_builds_without_connecting() {
        let settings = SmtpSettings {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "bot@example.com".to_string(),
            password: "secret".to_string(),
            from: "Reports <bot@example.com>".to_string(),
        };
        assert!(Mailer::new(&settings).is_ok());
    }
}
