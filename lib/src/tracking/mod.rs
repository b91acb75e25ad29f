//! Recipient interaction tracking.
//!
//! Each dispatched email carries a per-document secret token. Links in the
//! email body are rewritten to go through `linkRedirect`, and a hidden pixel
//! (`trackOpen`) plus a visible confirmation link (`confirmRead`) are
//! appended. All three endpoints mutate the document only if the token
//! matches.

mod events;
mod inject;

pub use events::{confirm_read, record_click, record_open, Outcome};
pub use inject::inject;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use url::Url;

use crate::mail::MailId;
use crate::{ErrorKind, Result};

pub const TRACK_OPEN: &str = "trackOpen";
pub const LINK_REDIRECT: &str = "linkRedirect";
pub const CONFIRM_READ: &str = "confirmRead";

/// Transparent 1x1 png served by `trackOpen`.
pub const PIXEL_PNG: [u8; 70] = [
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
    0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x18, 0x57, 0x63, 0xfc, 0xcf, 0xc0, 0xf0,
    0x1f, 0x00, 0x05, 0x83, 0x02, 0x7f, 0x97, 0x36, 0x21, 0x37, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45,
    0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// Generates a new tracking token: 16 random bytes as 32 lowercase hex
/// characters.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Encodes a url for the `u` query parameter: url-safe base64 without
/// padding.
pub fn encode_url(url: &str) -> String {
    URL_SAFE_NO_PAD.encode(url.as_bytes())
}

/// Reverses `encode_url`. Accepts padded input and the standard base64
/// alphabet as well.
pub fn decode_url(encoded: &str) -> Result<String> {
    let normalized: String = encoded
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    let bytes = URL_SAFE_NO_PAD.decode(normalized.as_bytes())?;
    Ok(String::from_utf8(bytes)?)
}

/// Builds the tracking urls for a single document.
#[derive(Clone, Debug)]
pub struct TrackingLinks {
    base: Url,
    msg: MailId,
    token: String,
}

impl TrackingLinks {
    pub fn new(base: &Url, msg: MailId, token: impl Into<String>) -> Result<Self> {
        if base.cannot_be_a_base() {
            return Err(ErrorKind::BadInput(format!("invalid tracking base url: {base}")).into());
        }
        Ok(Self {
            base: base.clone(),
            msg,
            token: token.into(),
        })
    }

    pub fn endpoint(&self, name: &str) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(name);
        }
        url
    }

    pub fn open_url(&self) -> Url {
        let mut url = self.endpoint(TRACK_OPEN);
        url.query_pairs_mut()
            .append_pair("msg", &self.msg.to_string())
            .append_pair("k", &self.token);
        url
    }

    pub fn redirect_url(&self, target: &str) -> Url {
        let mut url = self.endpoint(LINK_REDIRECT);
        url.query_pairs_mut()
            .append_pair("msg", &self.msg.to_string())
            .append_pair("u", &encode_url(target))
            .append_pair("k", &self.token);
        url
    }

    pub fn confirm_url(&self) -> Url {
        let mut url = self.endpoint(CONFIRM_READ);
        url.query_pairs_mut()
            .append_pair("msg", &self.msg.to_string())
            .append_pair("k", &self.token);
        url
    }

    /// Whether the link already goes through the redirect endpoint.
    pub fn is_tracked(&self, href: &str) -> bool {
        href.starts_with(self.endpoint(LINK_REDIRECT).as_str())
    }
}
