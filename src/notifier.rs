//! Notification gateway: one plain-text email per call through an SMTP relay.
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::fmt;
use tracing::{info, instrument};

use crate::config::Smtp;
use crate::error::NotificationError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotificationError>;
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl fmt::Debug for SmtpNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpNotifier")
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl SmtpNotifier {
    /// STARTTLS relay authenticated with the configured credentials.
    pub fn from_config(cfg: &Smtp) -> Result<Self, NotificationError> {
        let from = parse_mailbox(&cfg.from)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)?
            .port(cfg.port)
            .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
            .build();
        Ok(Self { transport, from })
    }

    pub fn build_message(&self, to: &str, subject: &str, body: &str) -> Result<Message, NotificationError> {
        Ok(Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(to)?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?)
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotificationError> {
    address
        .parse()
        .map_err(|source| NotificationError::Address {
            address: address.to_string(),
            source,
        })
}

#[async_trait]
impl Notifier for SmtpNotifier {
    #[instrument(skip_all, fields(to = %to))]
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotificationError> {
        let message = self.build_message(to, subject, body)?;
        self.transport.send(message).await?;
        info!("email sent");
        Ok(())
    }
}
