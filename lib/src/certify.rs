//! Anchoring of notification lifecycle events on chain.
//!
//! Each event is serialized into a pipe-delimited payload, submitted through
//! a `Chain` client and recorded as a `Movement` in the
//! `blockchain_movements` collection. Errors are passed on to the caller, no
//! retries are made.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::chain::Chain;
use crate::db::{Collectable, Identifiable};
use crate::{Database, Result};

pub const STATUS_CONFIRMED: &str = "confirmed";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CertEvent {
    Read {
        message_id: String,
        user_id: String,
        at: DateTime<Utc>,
    },
    Send {
        message_id: String,
        from_user_id: String,
        to_email: String,
        at: DateTime<Utc>,
    },
    Receive {
        message_id: String,
        user_id: String,
        at: DateTime<Utc>,
    },
    UserCreated {
        user_id: String,
        email: String,
        at: DateTime<Utc>,
    },
}

impl CertEvent {
    /// Movement type as stored in the audit record.
    pub fn kind(&self) -> &'static str {
        match self {
            CertEvent::Read { .. } => "read",
            CertEvent::Send { .. } => "send",
            CertEvent::Receive { .. } => "receive",
            CertEvent::UserCreated { .. } => "user_created",
        }
    }

    /// Transaction data carried on chain.
    pub fn payload(&self) -> String {
        match self {
            CertEvent::Read {
                message_id,
                user_id,
                at,
            } => format!("READ|{}|{}|{}", message_id, user_id, timestamp(at)),
            CertEvent::Send {
                message_id,
                from_user_id,
                to_email,
                at,
            } => format!(
                "SEND|{}|{}|{}|{}",
                message_id,
                from_user_id,
                to_email,
                timestamp(at)
            ),
            CertEvent::Receive {
                message_id,
                user_id,
                at,
            } => format!("RECEIVE|{}|{}|{}", message_id, user_id, timestamp(at)),
            CertEvent::UserCreated { user_id, email, at } => {
                format!("USER_CREATED|{}|{}|{}", user_id, email, timestamp(at))
            }
        }
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Audit record of a certified event.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Movement {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: Option<String>,
    pub message_id: Option<String>,
    pub to_email: Option<String>,
    pub email: Option<String>,
    pub payload: String,
    pub tx_hash: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub verification_url: String,
}

impl Collectable for Movement {
    fn get_collection_name() -> &'static str {
        "blockchain_movements"
    }
}

impl Identifiable for Movement {
    fn get_id(&self) -> Uuid {
        self.id
    }
}

impl Movement {
    fn new(event: &CertEvent, tx_hash: String, verification_url: String) -> Self {
        let mut movement = Movement {
            id: Uuid::new_v4(),
            kind: event.kind().to_string(),
            payload: event.payload(),
            tx_hash,
            status: STATUS_CONFIRMED.to_string(),
            timestamp: Utc::now(),
            verification_url,
            ..Default::default()
        };
        match event {
            CertEvent::Read {
                message_id,
                user_id,
                ..
            }
            | CertEvent::Receive {
                message_id,
                user_id,
                ..
            } => {
                movement.message_id = Some(message_id.clone());
                movement.user_id = Some(user_id.clone());
            }
            CertEvent::Send {
                message_id,
                from_user_id,
                to_email,
                ..
            } => {
                movement.message_id = Some(message_id.clone());
                movement.user_id = Some(from_user_id.clone());
                movement.to_email = Some(to_email.clone());
            }
            CertEvent::UserCreated { user_id, email, .. } => {
                movement.user_id = Some(user_id.clone());
                movement.email = Some(email.clone());
            }
        }
        movement
    }

    pub fn stamp(&self) -> Stamp {
        Stamp {
            hash: self.tx_hash.clone(),
            transaction_id: self.id,
            verification_url: self.verification_url.clone(),
        }
    }
}

/// Proof of anchoring handed out to users: transaction hash, the id of the
/// audit record and a public verification url.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stamp {
    pub hash: String,
    pub transaction_id: Uuid,
    pub verification_url: String,
}

/// Submits the event on chain and records the resulting movement.
pub async fn certify(chain: &dyn Chain, db: &Database, event: CertEvent) -> Result<Movement> {
    let payload = event.payload();
    tracing::info!(kind = event.kind(), %payload, "certifying event");

    let tx_hash = chain.send_data(&payload).await?;
    let movement = Movement::new(&event, tx_hash.clone(), chain.verification_url(&tx_hash));
    db.set(&movement)?;

    tracing::info!(kind = event.kind(), %tx_hash, movement = %movement.id, "event certified");
    Ok(movement)
}

pub async fn certify_read(
    chain: &dyn Chain,
    db: &Database,
    message_id: &str,
    user_id: &str,
) -> Result<String> {
    let event = CertEvent::Read {
        message_id: message_id.to_string(),
        user_id: user_id.to_string(),
        at: Utc::now(),
    };
    Ok(certify(chain, db, event).await?.tx_hash)
}

pub async fn certify_send(
    chain: &dyn Chain,
    db: &Database,
    message_id: &str,
    from_user_id: &str,
    to_email: &str,
) -> Result<String> {
    let event = CertEvent::Send {
        message_id: message_id.to_string(),
        from_user_id: from_user_id.to_string(),
        to_email: to_email.to_string(),
        at: Utc::now(),
    };
    Ok(certify(chain, db, event).await?.tx_hash)
}

pub async fn certify_receive(
    chain: &dyn Chain,
    db: &Database,
    message_id: &str,
    user_id: &str,
) -> Result<String> {
    let event = CertEvent::Receive {
        message_id: message_id.to_string(),
        user_id: user_id.to_string(),
        at: Utc::now(),
    };
    Ok(certify(chain, db, event).await?.tx_hash)
}

pub async fn certify_user(
    chain: &dyn Chain,
    db: &Database,
    user_id: &str,
    email: &str,
) -> Result<String> {
    let event = CertEvent::UserCreated {
        user_id: user_id.to_string(),
        email: email.to_string(),
        at: Utc::now(),
    };
    Ok(certify(chain, db, event).await?.tx_hash)
}

/// Movements recorded for a message, oldest first.
pub fn movements_for(db: &Database, message_id: &str) -> Result<Vec<Movement>> {
    let mut movements = db
        .get_collection::<Movement>()?
        .into_iter()
        .filter(|m| m.message_id.as_deref() == Some(message_id))
        .collect::<Vec<_>>();
    movements.sort_by_key(|m| m.timestamp);
    Ok(movements)
}
