//! Outgoing mail transport.
//!
//! The dispatcher only talks to the `Mailer` trait. The SMTP implementation
//! is constructed once at startup from config and shared by all dispatches.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use lettre::{
    address::AddressError,
    message::{Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use uuid::Uuid;

use crate::{Error, ErrorKind, Result};

/// Fully resolved email, ready to be handed to a transport.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outgoing {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
}

pub trait Mailer: Send + Sync {
    /// Sends the email, returning the message id it was sent with.
    fn send(&self, mail: Outgoing) -> BoxFuture<'_, Result<String>>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    domain: String,
}

impl SmtpMailer {
    pub fn new(config: &crate::Config) -> Result<Self> {
        let email = &config.email;
        if email.smtp_server.is_empty() {
            return Err(ErrorKind::MissingConfig("email.smtp_server".to_string()).into());
        }

        let builder = if email.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&email.smtp_server)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&email.smtp_server)
        };
        let mut builder = builder.port(email.smtp_port);
        if !email.smtp_user.is_empty() {
            builder = builder.credentials(Credentials::new(
                email.smtp_user.clone(),
                email.smtp_password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            domain: config.domain.clone(),
        })
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, mail: Outgoing) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let message_id = new_message_id(&self.domain);
            let message = build_message(&mail, &message_id)?;

            let response = self.transport.send(message).await?;
            if response.is_positive() {
                Ok(message_id)
            } else {
                Err(ErrorKind::EmailBadResponse(response.code().to_string()).into())
            }
        })
    }
}

/// Mailer that keeps messages in memory instead of sending them. Used for
/// dry runs.
#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<Outgoing>>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Outgoing> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, mail: Outgoing) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let message_id = new_message_id("dry-run.local");
            // Validate the same way a real send would.
            build_message(&mail, &message_id)?;
            tracing::info!(%message_id, to = ?mail.to, subject = %mail.subject, "recorded email");
            self.sent
                .lock()
                .map_err(|e| ErrorKind::Other(e.to_string()))?
                .push(mail);
            Ok(message_id)
        })
    }
}

pub fn new_message_id(domain: &str) -> String {
    format!("<{}@{}>", Uuid::new_v4(), domain)
}

fn mailbox(addr: &str) -> Result<Mailbox> {
    addr.parse()
        .map_err(|e: AddressError| Error::new(ErrorKind::EmailParseError(format!("{addr}: {e}"))))
}

/// Builds a multipart (plain + html) message.
pub fn build_message(mail: &Outgoing, message_id: &str) -> Result<Message> {
    if mail.to.is_empty() {
        return Err(ErrorKind::BadInput("no recipients".to_string()).into());
    }

    let mut builder = Message::builder()
        .from(mailbox(&mail.from)?)
        .subject(mail.subject.clone())
        .message_id(Some(message_id.to_string()));
    for addr in &mail.to {
        builder = builder.to(mailbox(addr)?);
    }
    for addr in &mail.cc {
        builder = builder.cc(mailbox(addr)?);
    }
    for addr in &mail.bcc {
        builder = builder.bcc(mailbox(addr)?);
    }
    if let Some(reply_to) = &mail.reply_to {
        builder = builder.reply_to(mailbox(reply_to)?);
    }

    let message = builder.multipart(
        MultiPart::alternative()
            .singlepart(SinglePart::plain(mail.text.clone()))
            .singlepart(SinglePart::html(mail.html.clone())),
    )?;
    Ok(message)
}
