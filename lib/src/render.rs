//! Html bodies produced by the service itself.

use askama::Template;
use chrono::{Datelike, Utc};
use url::Url;

use crate::Result;

/// Notification email pointing the recipient at the reader page.
///
/// Names and addresses are escaped by the template; urls are inserted as
/// serialized by `Url`, which never contains quotes or angle brackets.
#[derive(Template, Clone, Debug)]
#[template(path = "notification.html")]
pub struct NotificationEmail {
    pub sender_name: String,
    pub recipient_name: String,
    pub recipient_email: String,
    pub read_url: Url,
    pub fallback_url: Url,
    pub year: i32,
}

impl NotificationEmail {
    pub fn new(read_url: Url) -> Self {
        Self {
            sender_name: "Notificas".to_string(),
            recipient_name: "Usuario".to_string(),
            recipient_email: String::new(),
            fallback_url: read_url.clone(),
            read_url,
            year: Utc::now().year(),
        }
    }
}

/// Page shown after the recipient follows the read confirmation link.
#[derive(Template, Clone, Debug)]
#[template(path = "read_confirmed.html")]
pub struct ReadConfirmedPage {
    pub title: &'static str,
}

impl Default for ReadConfirmedPage {
    fn default() -> Self {
        Self {
            title: "Lectura confirmada",
        }
    }
}

pub fn notification(email: &NotificationEmail) -> Result<String> {
    Ok(email.render()?)
}
