use std::env;
use std::error::Error as StdError;

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MailSettings;

/// Plain-text message to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailReceipt {
    pub message_id: String,
}

/// Transport-level diagnostics attached to a failed send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailDiagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{error}")]
pub struct MailFailure {
    pub error: String,
    pub details: MailDiagnostics,
}

impl MailFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: MailDiagnostics::default(),
        }
    }
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<MailReceipt, MailFailure>;
}

/// SMTP relay sender authenticating with credentials read from the environment.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    settings: MailSettings,
}

impl SmtpMailer {
    pub fn new(settings: &MailSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    fn credentials(&self) -> Result<(String, String), MailFailure> {
        let read = |key: &str| {
            env::var(key)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| MailFailure::new(format!("Missing credentials: set {key}")))
        };
        Ok((
            read(&self.settings.username_env)?,
            read(&self.settings.password_env)?,
        ))
    }

    fn transport(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailFailure> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.settings.smtp_host)
            .map_err(|err| {
                MailFailure::new(format!(
                    "Invalid SMTP relay {}: {err}",
                    self.settings.smtp_host
                ))
            })?
            .credentials(Credentials::new(username.to_string(), password.to_string()));
        if let Some(port) = self.settings.smtp_port {
            builder = builder.port(port);
        }
        Ok(builder.build())
    }
}

pub fn build_message(
    from: &str,
    mail: &OutgoingMail,
    message_id: &str,
) -> Result<Message, MailFailure> {
    let from: Mailbox = from
        .parse()
        .map_err(|err| MailFailure::new(format!("Invalid sender address {from}: {err}")))?;
    let to: Mailbox = mail
        .to
        .parse()
        .map_err(|err| MailFailure::new(format!("Invalid recipient address {}: {err}", mail.to)))?;
    Message::builder()
        .from(from)
        .to(to)
        .subject(mail.subject.clone())
        .message_id(Some(message_id.to_string()))
        .header(ContentType::TEXT_PLAIN)
        .body(mail.body.clone())
        .map_err(|err| MailFailure::new(format!("Failed to build message: {err}")))
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<MailReceipt, MailFailure> {
        let (username, password) = self.credentials()?;
        let message_id = format!("<{}@sidekick>", Uuid::new_v4());
        let message = build_message(&username, mail, &message_id)?;
        let transport = self.transport(&username, &password)?;

        info!(
            relay = %self.settings.smtp_host,
            user = %username,
            to = %mail.to,
            "sending email"
        );
        match transport.send(message).await {
            Ok(response) => {
                info!(message_id = %message_id, code = %response.code(), "email sent");
                Ok(MailReceipt { message_id })
            }
            Err(err) => {
                let code = err.status().map(|code| code.to_string());
                let response = smtp_response(&err)
                    .or_else(|| code.as_ref().map(|_| err.to_string()));
                let details = MailDiagnostics { code, response };
                warn!(error = %err, code = ?details.code, to = %mail.to, "email send failed");
                Err(MailFailure {
                    error: err.to_string(),
                    details,
                })
            }
        }
    }
}

/// The causes behind a transport error, outermost first.
fn smtp_response(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    (!causes.is_empty()).then(|| causes.join(": "))
}
