//! Outbound notification documents.
//!
//! Every notification is a single `MailDocument` in the `mail` collection.
//! Clients create it through `schedule_email`, the dispatcher writes the
//! delivery outcome once, and the tracking endpoints keep updating the
//! tracking section for as long as the recipient interacts with the email.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::ValidateEmail;

use crate::db::{Collectable, Database, Identifiable};
use crate::render::{self, NotificationEmail};
use crate::{Config, ErrorKind, Result};

pub type MailId = Uuid;

pub const DEFAULT_SUBJECT: &str = "Sin asunto";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MailDocument {
    pub id: MailId,

    pub to: Vec<String>,
    pub from: Option<String>,
    pub reply_to: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,

    pub message: MailMessage,

    /// Written by the dispatcher only.
    pub delivery: Option<Delivery>,
    /// Initialized by the dispatcher after a successful send, mutated by the
    /// tracking endpoints afterwards.
    pub tracking: Option<Tracking>,

    pub created_at: DateTime<Utc>,
}

impl Collectable for MailDocument {
    fn get_collection_name() -> &'static str {
        "mail"
    }
}

impl Identifiable for MailDocument {
    fn get_id(&self) -> Uuid {
        self.id
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MailMessage {
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    #[default]
    Pending,
    Success,
    Error,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Pending)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Delivery {
    pub state: DeliveryState,
    pub time: DateTime<Utc>,
    /// SMTP message id on success.
    pub info: Option<String>,
    pub error: Option<String>,
}

impl Delivery {
    pub fn pending() -> Self {
        Self {
            state: DeliveryState::Pending,
            time: Utc::now(),
            info: None,
            error: None,
        }
    }

    pub fn success(message_id: String) -> Self {
        Self {
            state: DeliveryState::Success,
            time: Utc::now(),
            info: Some(message_id),
            error: None,
        }
    }

    pub fn failure(error: String) -> Self {
        Self {
            state: DeliveryState::Error,
            time: Utc::now(),
            info: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Tracking {
    /// Shared secret authorizing all tracking mutations of the document.
    pub token: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub message_id: Option<String>,

    pub opened: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub open_count: u64,

    pub click_count: u64,
    pub clicks: Vec<Click>,
    pub last_click_at: Option<DateTime<Utc>>,

    pub read_confirmed: bool,
    pub read_confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Click {
    pub url: String,
    pub at: DateTime<Utc>,
}

impl Tracking {
    pub fn new(token: String, message_id: String) -> Self {
        Self {
            token,
            sent_at: Some(Utc::now()),
            message_id: Some(message_id),
            ..Default::default()
        }
    }

    /// True while the token was issued but nothing was sent or recorded
    /// with it yet.
    pub fn is_untouched(&self) -> bool {
        self.sent_at.is_none()
            && self.open_count == 0
            && self.click_count == 0
            && !self.read_confirmed
    }

    /// Compares the candidate against the stored token without bailing out
    /// on the first differing byte.
    pub fn token_matches(&self, candidate: &str) -> bool {
        let (a, b) = (self.token.as_bytes(), candidate.as_bytes());
        if a.is_empty() || a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }

    pub fn record_open(&mut self, at: DateTime<Utc>) {
        self.opened = true;
        self.opened_at = Some(at);
        self.open_count += 1;
    }

    pub fn record_click(&mut self, url: String, at: DateTime<Utc>) {
        self.clicks.push(Click { url, at });
        self.click_count += 1;
        self.last_click_at = Some(at);
    }

    pub fn confirm_read(&mut self, at: DateTime<Utc>) {
        self.read_confirmed = true;
        self.read_confirmed_at = Some(at);
    }
}

impl MailDocument {
    /// Returns the tracking section if `token` authorizes mutating it.
    pub fn authorized_tracking(&mut self, token: &str) -> Option<&mut Tracking> {
        self.tracking
            .as_mut()
            .filter(|tracking| tracking.token_matches(token))
    }

    pub fn delivery_state(&self) -> Option<DeliveryState> {
        self.delivery.as_ref().map(|d| d.state)
    }
}

/// Either a single address or a list of them, as accepted by the mail api.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Default for Recipients {
    fn default() -> Self {
        Recipients::Many(vec![])
    }
}

impl From<Recipients> for Vec<String> {
    fn from(r: Recipients) -> Self {
        match r {
            Recipients::One(addr) => vec![addr],
            Recipients::Many(addrs) => addrs,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScheduleEmail {
    pub to: Recipients,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    pub from: Option<String>,
    pub reply_to: Option<String>,
    pub cc: Option<Recipients>,
    pub bcc: Option<Recipients>,
}

/// Stores a new mail document, which in turn gets picked up by the
/// dispatcher. Returns the id of the new document.
pub fn schedule_email(db: &Database, params: ScheduleEmail) -> Result<MailId> {
    let doc = new_document(Uuid::new_v4(), params)?;
    db.set(&doc)?;

    tracing::debug!(mail = %doc.id, recipients = doc.to.len(), "scheduled email");
    Ok(doc.id)
}

/// Parameters of the standard certified notification email.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScheduleNotification {
    pub to: String,
    pub subject: String,
    pub sender_name: Option<String>,
    pub recipient_name: Option<String>,
    pub from: Option<String>,
    pub reply_to: Option<String>,
}

/// Schedules the standard notification email, whose body points the
/// recipient at the reader page of the new document.
pub fn schedule_notification(
    db: &Database,
    config: &Config,
    params: ScheduleNotification,
) -> Result<MailId> {
    let id = Uuid::new_v4();
    let read_url = config.reader_url(id)?;

    let mut email = NotificationEmail::new(read_url);
    email.recipient_email = address_part(&params.to).to_string();
    if let Some(name) = params.sender_name {
        email.sender_name = name;
    }
    if let Some(name) = params.recipient_name {
        email.recipient_name = name;
    }

    let subject = if params.subject.is_empty() {
        format!("Nueva notificación de {}", email.sender_name)
    } else {
        params.subject
    };
    let text = format!(
        "Estimado/a {},\n\nTiene una nueva notificación enviada por {}. Para leerla ingrese a {}\n",
        email.recipient_name, email.sender_name, email.read_url
    );
    let doc = new_document(
        id,
        ScheduleEmail {
            to: Recipients::One(params.to),
            subject,
            html: render::notification(&email)?,
            text: Some(text),
            from: params.from,
            reply_to: params.reply_to,
            ..Default::default()
        },
    )?;
    db.set(&doc)?;

    tracing::debug!(mail = %doc.id, "scheduled notification");
    Ok(doc.id)
}

fn new_document(id: MailId, params: ScheduleEmail) -> Result<MailDocument> {
    let to: Vec<String> = params.to.into();
    let cc: Vec<String> = params.cc.map(Into::into).unwrap_or_default();
    let bcc: Vec<String> = params.bcc.map(Into::into).unwrap_or_default();

    if to.is_empty() {
        return Err(ErrorKind::BadInput("at least one recipient is required".to_string()).into());
    }
    for addr in to.iter().chain(&cc).chain(&bcc).chain(&params.reply_to) {
        if !address_part(addr).to_string().validate_email() {
            return Err(ErrorKind::BadInput(format!("invalid email address: {addr}")).into());
        }
    }

    let text = params.text.unwrap_or_else(|| strip_tags(&params.html));
    Ok(MailDocument {
        id,
        to,
        from: params.from,
        reply_to: params.reply_to,
        cc,
        bcc,
        message: MailMessage {
            subject: params.subject,
            html: params.html,
            text,
        },
        delivery: None,
        tracking: None,
        created_at: Utc::now(),
    })
}

/// Extracts the bare address from `Name <addr>` forms.
pub fn address_part(addr: &str) -> &str {
    match (addr.rfind('<'), addr.rfind('>')) {
        (Some(start), Some(end)) if start < end => addr[start + 1..end].trim(),
        _ => addr.trim(),
    }
}

/// Plain text fallback for an html body: drops every `<...>` span. A `<`
/// without a closing `>` is kept as text.
pub fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find('<') {
        match rest[start..].find('>') {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &rest[start + end + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// View of a mail document without the tracking secret, for status pages.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailStatus {
    pub id: MailId,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub delivery: Option<Delivery>,
    pub tracking: Option<Tracking>,
}

impl From<MailDocument> for MailStatus {
    fn from(doc: MailDocument) -> Self {
        Self {
            id: doc.id,
            from: doc.from,
            to: doc.to,
            subject: doc.message.subject,
            created_at: doc.created_at,
            delivery: doc.delivery,
            tracking: doc.tracking.map(|t| Tracking {
                token: String::new(),
                ..t
            }),
        }
    }
}
