use chrono::Utc;

use crate::mail::{MailDocument, MailId};
use crate::{Database, ErrorKind, Result};

/// Result of a tracking hit against the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Recorded,
    /// Token missing, not yet issued or not matching.
    TokenMismatch,
    NotFound,
}

/// Registers an open: bumps the open counter and marks the document opened.
pub fn record_open(db: &Database, msg: MailId, token: &str) -> Result<Outcome> {
    apply(db, msg, |doc| match doc.authorized_tracking(token) {
        Some(tracking) => {
            tracking.record_open(Utc::now());
            Some(())
        }
        None => None,
    })
}

/// Registers a click on `url`.
pub fn record_click(db: &Database, msg: MailId, token: &str, url: &str) -> Result<Outcome> {
    apply(db, msg, |doc| match doc.authorized_tracking(token) {
        Some(tracking) => {
            tracking.record_click(url.to_string(), Utc::now());
            Some(())
        }
        None => None,
    })
}

/// Marks the document as read by the recipient.
pub fn confirm_read(db: &Database, msg: MailId, token: &str) -> Result<Outcome> {
    apply(db, msg, |doc| match doc.authorized_tracking(token) {
        Some(tracking) => {
            tracking.confirm_read(Utc::now());
            Some(())
        }
        None => None,
    })
}

fn apply<F>(db: &Database, msg: MailId, f: F) -> Result<Outcome>
where
    F: FnMut(&mut MailDocument) -> Option<()>,
{
    match db.update::<MailDocument, (), _>(msg, f) {
        Ok(Some(())) => Ok(Outcome::Recorded),
        Ok(None) => Ok(Outcome::TokenMismatch),
        Err(e) if matches!(e.kind, ErrorKind::NotFound(_)) => Ok(Outcome::NotFound),
        Err(e) => Err(e),
    }
}
