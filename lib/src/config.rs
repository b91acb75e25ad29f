use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use url::Url;

use crate::{ErrorKind, Result};

pub static CONFIG_FILE: &'static str = "notificas.toml";

/// Region the tracking endpoints were historically deployed to. Used when
/// deriving the tracking base url from the cloud project id.
pub static DEFAULT_REGION: &'static str = "us-central1";
pub static DEFAULT_PROJECT: &'static str = "notificas-f9953";

/// Application configuration.
///
/// # Sensible defaults
///
/// `Config::default()` yields a setup that runs locally: the store lives in
/// `./db`, the server binds to `127.0.0.1:8080` and tracking links point back
/// at that address. SMTP and chain credentials are empty and must be provided
/// through `notificas.toml`, `secret.notificas.toml` or the environment.
///
/// ```ignore
/// let cfg = Config {
///     tracing: Tracing {
///         enabled: false,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub version: String,

    /// Domain used for generated message ids.
    pub domain: String,
    /// Address on which to serve the tracking endpoints and the mail api.
    pub address: SocketAddr,

    pub db: Db,
    pub tracking: Tracking,
    pub email: Email,
    pub chain: Chain,
    pub api: Api,
    pub tracing: Tracing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            domain: "notificas.com".to_string(),
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            db: Db::default(),
            tracking: Tracking::default(),
            email: Email::default(),
            chain: Chain::default(),
            api: Api::default(),
            tracing: Tracing::default(),
        }
    }
}

impl Config {
    /// Base url prepended to all tracking links.
    ///
    /// Falls back to the cloud functions url derived from `GCLOUD_PROJECT`
    /// when no explicit base url is configured.
    pub fn tracking_base(&self) -> Result<Url> {
        let raw = if self.tracking.base_url.is_empty() {
            let project = std::env::var("GCLOUD_PROJECT")
                .or_else(|_| std::env::var("GOOGLE_CLOUD_PROJECT"))
                .unwrap_or_else(|_| DEFAULT_PROJECT.to_string());
            format!("https://{}-{}.cloudfunctions.net", DEFAULT_REGION, project)
        } else {
            self.tracking.base_url.trim_end_matches('/').to_string()
        };
        Ok(Url::parse(&raw)?)
    }

    /// Reader page url for a single mail document.
    pub fn reader_url(&self, id: uuid::Uuid) -> Result<Url> {
        let raw = format!("{}/{}", self.tracking.reader_url.trim_end_matches('/'), id);
        Ok(Url::parse(&raw)?)
    }

    pub fn fallback_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.tracking.fallback_url)?)
    }
}

/// Loads application config from the toml file at the default location.
///
/// The file is optional. Without it the defaults apply, overridden by
/// whatever the environment provides.
pub fn load<T: DeserializeOwned>() -> Result<T> {
    build(CONFIG_FILE, false)
}

/// Loads application config from toml file at standard path using provided
/// name. Unlike [`load`], the file must exist.
///
/// For example for `name` == `notificas.toml` we will load both
/// `notificas.toml` and `secret.notificas.toml` from the working directory.
pub fn load_from<T: DeserializeOwned>(name: impl AsRef<str>) -> Result<T> {
    build(name.as_ref(), true)
}

fn build<T: DeserializeOwned>(name: &str, required: bool) -> Result<T> {
    let config = config::Config::builder()
        .add_source(config::File::with_name(name).required(required))
        .add_source(config::File::with_name(&format!("secret.{}", name)).required(false))
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix_separator("__"),
        )
        .build()?;

    let config: T = config.try_deserialize()?;

    Ok(config)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Db {
    /// Path to the store directory, relative to the working directory.
    pub path: String,
    /// Use a throwaway store removed on drop. Meant for tests and demos.
    pub temporary: bool,
}

impl Default for Db {
    fn default() -> Self {
        Self {
            path: "db".to_string(),
            temporary: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Tracking {
    /// Public url under which `trackOpen`, `linkRedirect` and `confirmRead`
    /// are reachable. Empty means derive it, see `Config::tracking_base`.
    pub base_url: String,
    /// Redirect target used when a tracked link can't be decoded.
    pub fallback_url: String,
    /// Reader page; notification emails link to `{reader_url}/{mail id}`.
    pub reader_url: String,
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            fallback_url: "https://notificas.com".to_string(),
            reader_url: "https://notificas.com/reader".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Email {
    /// Sender used when a mail document doesn't define one.
    pub address: String,

    // Smtp server and credentials.
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    /// Upgrade the connection with STARTTLS. Disable only for local sinks.
    pub starttls: bool,
    /// Keep outgoing emails in memory and log them instead of sending.
    pub dry_run: bool,
}

impl Default for Email {
    fn default() -> Self {
        Self {
            address: "contacto@notificas.com".to_string(),
            smtp_server: "".to_string(),
            smtp_port: 587,
            smtp_user: "".to_string(),
            smtp_password: "".to_string(),
            starttls: true,
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Chain {
    /// JSON-RPC endpoint. Falls back to `POLYGON_PROVIDER_URL`.
    pub provider_url: String,
    /// Wallet the anchoring transactions are sent to. Falls back to
    /// `POLYGON_WALLET_ADDRESS`. Without a private key it is also the sender.
    pub wallet_address: String,
    /// Hex encoded key signing the anchoring transactions. Falls back to
    /// `POLYGON_PRIVATE_KEY`. When absent the provider has to sign.
    pub private_key: String,
    pub gas_limit: u64,
    /// Interval between receipt polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Time to wait for the first confirmation, in seconds.
    pub confirmation_timeout_secs: u64,
    /// Block explorer transaction url prefix, used for verification links.
    pub explorer_url: String,
}

impl Default for Chain {
    fn default() -> Self {
        Self {
            provider_url: "".to_string(),
            wallet_address: "".to_string(),
            private_key: "".to_string(),
            gas_limit: 100_000,
            poll_interval_ms: 2_000,
            confirmation_timeout_secs: 120,
            explorer_url: "https://polygonscan.com/tx/".to_string(),
        }
    }
}

impl Chain {
    pub fn provider_url(&self) -> Result<String> {
        non_empty_or_env(&self.provider_url, "POLYGON_PROVIDER_URL")
    }

    pub fn wallet_address(&self) -> Result<String> {
        non_empty_or_env(&self.wallet_address, "POLYGON_WALLET_ADDRESS")
    }

    pub fn private_key(&self) -> Option<String> {
        non_empty_or_env(&self.private_key, "POLYGON_PRIVATE_KEY").ok()
    }
}

fn non_empty_or_env(value: &str, var: &str) -> Result<String> {
    if !value.is_empty() {
        return Ok(value.to_string());
    }
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ErrorKind::MissingConfig(var.to_string()).into()),
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Api {
    /// Bearer key required by the `/api` routes. Empty disables the check.
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Tracing {
    pub enabled: bool,

    pub mode: crate::tracing::Mode,
    pub level: crate::tracing::Level,

    pub loki_address: String,
}

impl Default for Tracing {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: crate::tracing::Mode::default(),
            level: crate::tracing::Level::default(),
            loki_address: "".to_string(),
        }
    }
}
