//! Certified email notifications.
//!
//! Outbound notifications are stored as documents in the `mail` collection.
//! A dispatcher watching that collection renders each new document, injects
//! tracking links, and hands it to the SMTP transport. Recipients interacting
//! with the email hit the tracking endpoints, which validate the document's
//! token and update its counters. Lifecycle events can additionally be
//! anchored on a Polygon-compatible chain.

#[macro_use]
extern crate serde_derive;

pub mod certify;
pub mod chain;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod email;
pub mod error;
pub mod mail;
pub mod render;
pub mod tracing;
pub mod tracking;

#[cfg(feature = "axum")]
pub mod axum;

pub use config::Config;
pub use db::Database;
pub use error::{Error, ErrorKind, Result};
pub use mail::{MailDocument, MailId};
