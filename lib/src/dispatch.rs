//! Sends scheduled mail documents.
//!
//! The dispatcher watches the `mail` collection and handles every document
//! without a delivery section. Before sending, a document is claimed by
//! atomically moving its delivery state from absent to `PENDING`; the
//! tracking token is stored together with the claim. Triggers that fire
//! twice for the same document therefore send a single email and never
//! replace a token that was already handed out.

use std::sync::Arc;

use chrono::Utc;

use crate::db::{decode, Change};
use crate::email::{Mailer, Outgoing};
use crate::mail::{
    strip_tags, Delivery, DeliveryState, MailDocument, MailId, Tracking, DEFAULT_SUBJECT,
};
use crate::tracking::{self, TrackingLinks};
use crate::{Config, Database, Result};

/// Outcome of a single dispatch attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatched {
    /// Email was accepted by the transport, carries the message id.
    Sent(String),
    /// Sending failed, the error was written to the document.
    Failed(String),
    /// Document was already claimed by an earlier dispatch.
    Skipped,
}

#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    mailer: Arc<dyn Mailer>,
    config: Arc<Config>,
}

impl Dispatcher {
    pub fn new(db: Database, mailer: Arc<dyn Mailer>, config: Arc<Config>) -> Self {
        Self { db, mailer, config }
    }

    /// Claims, sends and records the outcome for a single document.
    ///
    /// A single attempt is made. Transport errors end up in the document's
    /// `delivery.error`; only store errors are returned.
    pub async fn dispatch(&self, id: MailId) -> Result<Dispatched> {
        let doc = match self.claim(id)? {
            Some(doc) => doc,
            None => {
                tracing::debug!(mail = %id, "already claimed, skipping");
                return Ok(Dispatched::Skipped);
            }
        };
        let token = doc
            .tracking
            .as_ref()
            .map(|t| t.token.clone())
            .unwrap_or_default();

        match self.send(&doc, &token).await {
            Ok(message_id) => {
                self.db.update::<MailDocument, (), _>(id, |doc| {
                    doc.delivery = Some(Delivery::success(message_id.clone()));
                    let tracking = doc.tracking.get_or_insert_with(|| Tracking {
                        token: token.clone(),
                        ..Default::default()
                    });
                    tracking.sent_at = Some(Utc::now());
                    tracking.message_id = Some(message_id.clone());
                    Some(())
                })?;
                tracing::info!(mail = %id, %message_id, "email sent");
                Ok(Dispatched::Sent(message_id))
            }
            Err(e) => {
                let error = e.kind.to_string();
                self.db.update::<MailDocument, (), _>(id, |doc| {
                    fail(doc, &error);
                    Some(())
                })?;
                tracing::warn!(mail = %id, %error, "email dispatch failed");
                Ok(Dispatched::Failed(error))
            }
        }
    }

    /// Fails documents left in `PENDING` by a dispatcher that stopped
    /// between claiming and recording the outcome. Whether the email went
    /// out is unknown, so they are not sent again.
    ///
    /// Only safe to call while no other dispatch is in flight.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let stale = self
            .db
            .get_collection::<MailDocument>()?
            .into_iter()
            .filter(|doc| doc.delivery_state() == Some(DeliveryState::Pending))
            .map(|doc| doc.id)
            .collect::<Vec<_>>();

        let mut recovered = 0;
        for id in stale {
            let failed = self.db.update::<MailDocument, (), _>(id, |doc| {
                if doc.delivery_state() != Some(DeliveryState::Pending) {
                    return None;
                }
                fail(doc, INTERRUPTED);
                Some(())
            })?;
            if failed.is_some() {
                tracing::warn!(mail = %id, "dispatch was interrupted, marked as failed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Moves the document into `PENDING`, making sure it carries a token.
    /// Returns `None` if some other dispatch got there first.
    fn claim(&self, id: MailId) -> Result<Option<MailDocument>> {
        let candidate = tracking::generate_token();
        self.db.update::<MailDocument, MailDocument, _>(id, |doc| {
            if doc.delivery.is_some() {
                return None;
            }
            doc.delivery = Some(Delivery::pending());
            match &mut doc.tracking {
                Some(tracking) if !tracking.token.is_empty() => (),
                Some(tracking) => tracking.token = candidate.clone(),
                None => {
                    doc.tracking = Some(Tracking {
                        token: candidate.clone(),
                        ..Default::default()
                    })
                }
            }
            Some(doc.clone())
        })
    }

    async fn send(&self, doc: &MailDocument, token: &str) -> Result<String> {
        let links = TrackingLinks::new(&self.config.tracking_base()?, doc.id, token)?;
        let html = tracking::inject(&doc.message.html, &links)?;

        let mail = Outgoing {
            from: doc
                .from
                .clone()
                .filter(|from| !from.is_empty())
                .unwrap_or_else(|| self.config.email.address.clone()),
            to: doc.to.clone(),
            cc: doc.cc.clone(),
            bcc: doc.bcc.clone(),
            reply_to: doc.reply_to.clone(),
            subject: if doc.message.subject.is_empty() {
                DEFAULT_SUBJECT.to_string()
            } else {
                doc.message.subject.clone()
            },
            text: if doc.message.text.is_empty() {
                strip_tags(&doc.message.html)
            } else {
                doc.message.text.clone()
            },
            html,
        };

        tracing::debug!(mail = %doc.id, to = ?mail.to, "sending email");
        self.mailer.send(mail).await
    }

    /// Dispatches every document that was stored without a delivery section.
    /// Returns the number of documents handled.
    pub async fn sweep(&self) -> Result<usize> {
        let pending = self
            .db
            .get_collection::<MailDocument>()?
            .into_iter()
            .filter(|doc| doc.delivery.is_none())
            .map(|doc| doc.id)
            .collect::<Vec<_>>();

        for id in &pending {
            self.dispatch(*id).await?;
        }
        Ok(pending.len())
    }

    /// Watches the `mail` collection and dispatches new documents as they
    /// come in. Documents stored while the dispatcher wasn't running are
    /// picked up by an initial sweep.
    pub async fn run(self) -> Result<()> {
        // Subscribe first so that nothing stored during the sweep is missed.
        let mut watcher = self.db.watch::<MailDocument>()?;

        let recovered = self.recover_interrupted()?;
        let swept = self.sweep().await?;
        tracing::info!(
            "dispatcher started, {swept} pending documents handled, {recovered} interrupted"
        );

        while let Some(event) = watcher.next().await {
            let id = match Change::from_event(&event) {
                Some(Change::Set(id)) => id,
                _ => continue,
            };
            // Our own delivery writes show up here as well.
            if let sled::Event::Insert { value, .. } = &event {
                if let Ok(doc) = decode::<MailDocument>(value) {
                    if doc.delivery.is_some() {
                        continue;
                    }
                }
            }

            let dispatcher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.dispatch(id).await {
                    tracing::error!(mail = %id, "dispatch failed: {e}");
                }
            });
        }

        Ok(())
    }
}

/// Error recorded for documents whose dispatch never finished.
pub const INTERRUPTED: &str = "interrupted";

/// Records a failed delivery. Tracking is dropped unless a recipient already
/// used it, so the token of an email that never went out stops working.
fn fail(doc: &mut MailDocument, error: &str) {
    doc.delivery = Some(Delivery::failure(error.to_string()));
    if doc.tracking.as_ref().map_or(false, Tracking::is_untouched) {
        doc.tracking = None;
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;

    use super::*;
    use crate::email::RecordingMailer;
    use crate::mail::{schedule_email, Recipients, ScheduleEmail};
    use crate::tracking::{confirm_read, record_open, Outcome};
    use crate::ErrorKind;

    struct FailingMailer;

    impl Mailer for FailingMailer {
        fn send(&self, _mail: Outgoing) -> BoxFuture<'_, Result<String>> {
            Box::pin(async { Err(ErrorKind::EmailBadResponse("550".to_string()).into()) })
        }
    }

    fn config() -> Arc<Config> {
        let mut config = Config::default();
        config.tracking.base_url = "https://track.example.com".to_string();
        Arc::new(config)
    }

    fn schedule(db: &Database) -> MailId {
        schedule_email(
            db,
            ScheduleEmail {
                to: Recipients::Many(vec!["a@b.com".to_string()]),
                subject: "S".to_string(),
                html: "<a href=\"http://x.com\">x</a>".to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn successful_dispatch_initializes_tracking() {
        let db = Database::temporary().unwrap();
        let mailer = RecordingMailer::new();
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(mailer.clone()), config());
        let id = schedule(&db);

        let outcome = dispatcher.dispatch(id).await.unwrap();
        let message_id = match outcome {
            Dispatched::Sent(message_id) => message_id,
            other => panic!("unexpected outcome: {other:?}"),
        };

        let doc: MailDocument = db.get(id).unwrap();
        let delivery = doc.delivery.unwrap();
        assert_eq!(delivery.state, DeliveryState::Success);
        assert_eq!(delivery.info.as_deref(), Some(message_id.as_str()));

        let tracking = doc.tracking.unwrap();
        assert_eq!(tracking.token.len(), 32);
        assert!(tracking.token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(tracking.open_count, 0);
        assert!(!tracking.opened && !tracking.read_confirmed);
        assert!(tracking.sent_at.is_some());

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "contacto@notificas.com");
        assert_eq!(sent[0].to, vec!["a@b.com".to_string()]);
        assert_eq!(sent[0].text, "x");
        let prefix = format!(
            "href=\"https://track.example.com/linkRedirect?msg={}&amp;u={}&amp;k={}\"",
            id,
            crate::tracking::encode_url("http://x.com"),
            tracking.token
        );
        let unescaped = prefix.replace("&amp;", "&");
        assert!(
            sent[0].html.contains(&prefix) || sent[0].html.contains(&unescaped),
            "{}",
            sent[0].html
        );
    }

    #[tokio::test]
    async fn second_dispatch_is_skipped_and_keeps_the_token() {
        let db = Database::temporary().unwrap();
        let mailer = RecordingMailer::new();
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(mailer.clone()), config());
        let id = schedule(&db);

        dispatcher.dispatch(id).await.unwrap();
        let token = db.get::<MailDocument>(id).unwrap().tracking.unwrap().token;

        assert_eq!(dispatcher.dispatch(id).await.unwrap(), Dispatched::Skipped);
        assert_eq!(mailer.sent().len(), 1);
        assert_eq!(
            db.get::<MailDocument>(id).unwrap().tracking.unwrap().token,
            token
        );
    }

    #[tokio::test]
    async fn concurrent_triggers_send_once() {
        let db = Database::temporary().unwrap();
        let mailer = RecordingMailer::new();
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(mailer.clone()), config());
        let id = schedule(&db);

        let (a, b) = tokio::join!(dispatcher.dispatch(id), dispatcher.dispatch(id));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Dispatched::Sent(_)))
                .count(),
            1
        );
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn failures_are_recorded_without_tracking_data() {
        let db = Database::temporary().unwrap();
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(FailingMailer), config());
        let id = schedule(&db);

        // Claim once to learn the token, then release it for the dispatch.
        let token = dispatcher.claim(id).unwrap().unwrap().tracking.unwrap().token;
        db.update::<MailDocument, (), _>(id, |doc| {
            doc.delivery = None;
            Some(())
        })
        .unwrap();

        let outcome = dispatcher.dispatch(id).await.unwrap();
        assert!(matches!(outcome, Dispatched::Failed(_)));

        let doc: MailDocument = db.get(id).unwrap();
        let delivery = doc.delivery.unwrap();
        assert_eq!(delivery.state, DeliveryState::Error);
        assert!(delivery.error.unwrap().contains("550"));
        assert!(doc.tracking.is_none());

        // The token of an email that never went out is dead.
        assert_eq!(confirm_read(&db, id, &token).unwrap(), Outcome::TokenMismatch);
        assert_eq!(record_open(&db, id, &token).unwrap(), Outcome::TokenMismatch);

        // Terminal: no retry on a later trigger.
        assert_eq!(dispatcher.dispatch(id).await.unwrap(), Dispatched::Skipped);
    }

    #[tokio::test]
    async fn failures_keep_tracking_that_was_already_used() {
        let db = Database::temporary().unwrap();
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(FailingMailer), config());
        let id = schedule(&db);
        db.update::<MailDocument, (), _>(id, |doc| {
            doc.tracking = Some(Tracking {
                token: "f".repeat(32),
                open_count: 1,
                opened: true,
                ..Default::default()
            });
            Some(())
        })
        .unwrap();

        dispatcher.dispatch(id).await.unwrap();
        let doc: MailDocument = db.get(id).unwrap();
        assert_eq!(doc.delivery_state(), Some(DeliveryState::Error));
        assert_eq!(doc.tracking.unwrap().open_count, 1);
    }

    #[tokio::test]
    async fn interrupted_dispatches_are_failed_not_resent() {
        let db = Database::temporary().unwrap();
        let mailer = RecordingMailer::new();
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(mailer.clone()), config());
        let stale = schedule(&db);
        let fresh = schedule(&db);
        dispatcher.claim(stale).unwrap().unwrap();

        assert_eq!(dispatcher.recover_interrupted().unwrap(), 1);
        assert_eq!(dispatcher.sweep().await.unwrap(), 1);

        let doc: MailDocument = db.get(stale).unwrap();
        let delivery = doc.delivery.unwrap();
        assert_eq!(delivery.state, DeliveryState::Error);
        assert_eq!(delivery.error.as_deref(), Some(INTERRUPTED));
        assert!(doc.tracking.is_none());

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            db.get::<MailDocument>(fresh).unwrap().delivery_state(),
            Some(DeliveryState::Success)
        );
        assert_eq!(dispatcher.recover_interrupted().unwrap(), 0);
    }

    #[tokio::test]
    async fn existing_token_is_reused() {
        let db = Database::temporary().unwrap();
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(RecordingMailer::new()), config());
        let id = schedule(&db);
        db.update::<MailDocument, (), _>(id, |doc| {
            doc.tracking = Some(Tracking {
                token: "f".repeat(32),
                ..Default::default()
            });
            Some(())
        })
        .unwrap();

        dispatcher.dispatch(id).await.unwrap();
        let tracking = db.get::<MailDocument>(id).unwrap().tracking.unwrap();
        assert_eq!(tracking.token, "f".repeat(32));
    }

    #[tokio::test]
    async fn sweep_handles_undelivered_documents() {
        let db = Database::temporary().unwrap();
        let mailer = RecordingMailer::new();
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(mailer.clone()), config());
        schedule(&db);
        schedule(&db);

        assert_eq!(dispatcher.sweep().await.unwrap(), 2);
        assert_eq!(dispatcher.sweep().await.unwrap(), 0);
        assert_eq!(mailer.sent().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn large_backlog_does_not_stall_the_store() {
        let db = Database::temporary().unwrap();
        let mailer = RecordingMailer::new();
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(mailer.clone()), config());
        // Each dispatch writes twice, this is well beyond what a sled
        // subscriber buffers.
        let backlog = (0..1500).map(|_| schedule(&db)).collect::<Vec<_>>();

        tokio::spawn(dispatcher.run());

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(60);
        while mailer.sent().len() < backlog.len() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "sent {} of {}",
                mailer.sent().len(),
                backlog.len()
            );
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        // Still following the collection after the sweep.
        let late = schedule(&db);
        for _ in 0..200 {
            let state = db.get::<MailDocument>(late).unwrap().delivery_state();
            if state == Some(DeliveryState::Success) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        assert_eq!(
            db.get::<MailDocument>(late).unwrap().delivery_state(),
            Some(DeliveryState::Success)
        );
        assert_eq!(mailer.sent().len(), backlog.len() + 1);
    }
}
