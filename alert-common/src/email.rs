//! Outbound email transport.
//!
//! The notifier only ever sees the [`EmailSender`] capability: one operation,
//! plain-text payload. Production wires an SMTP transport; tests use the
//! in-memory capture implementation; local development can print instead of
//! sending.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmailError {
    #[error("invalid mailbox address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp transport failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("timed out sending email")]
    Timeout,
    #[error("transport rejected the message: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait EmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError>;
}

/// SMTP-backed sender. Credentials come from configuration; this code never
/// inspects them.
pub struct SmtpEmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    timeout: Duration,
}

impl SmtpEmailSender {
    pub fn new(
        relay: &str,
        username: String,
        password: String,
        from: &str,
        timeout: Duration,
    ) -> Result<Self, EmailError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(relay)?
            .credentials(Credentials::new(username, password))
            .build();

        Ok(Self {
            transport,
            from: from.parse()?,
            timeout,
        })
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse()?)
            .subject(subject)
            .body(body.to_owned())?;

        match tokio::time::timeout(self.timeout, self.transport.send(message)).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(EmailError::Timeout),
        }
    }
}

/// Logs instead of sending. Useful when running against a live queue without
/// an SMTP relay at hand.
pub struct LogEmailSender {}

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        tracing::info!(to, subject, "email (not sent):\n{}", body);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// In-memory capture sender for tests. Can be told to reject every send.
#[derive(Clone, Default)]
pub struct MemoryEmailSender {
    sent: Arc<Mutex<Vec<CapturedEmail>>>,
    reject_with: Option<String>,
}

impl MemoryEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(reason: &str) -> Self {
        Self {
            sent: Default::default(),
            reject_with: Some(reason.to_owned()),
        }
    }

    pub fn captured(&self) -> Vec<CapturedEmail> {
        self.sent.lock().expect("poisoned capture lock").clone()
    }
}

#[async_trait]
impl EmailSender for MemoryEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        if let Some(reason) = &self.reject_with {
            return Err(EmailError::Rejected(reason.clone()));
        }
        self.sent
            .lock()
            .expect("poisoned capture lock")
            .push(CapturedEmail {
                to: to.to_owned(),
                subject: subject.to_owned(),
                body: body.to_owned(),
            });
        Ok(())
    }
}
