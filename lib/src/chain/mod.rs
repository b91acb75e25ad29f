//! Anchoring data on a Polygon-compatible chain.
//!
//! Payloads are carried as the data of zero-value transactions sent to the
//! configured wallet. Transactions are signed locally when a private key is
//! configured, otherwise by the node behind the provider url.

mod polygon;

pub use polygon::PolygonRpc;

use futures::future::BoxFuture;
use rust_decimal::Decimal;

use crate::{Error, ErrorKind, Result};

/// Minimal chain client used by the certifier.
pub trait Chain: Send + Sync {
    /// Submits `payload` as transaction data and waits for one confirmation.
    /// Returns the transaction hash.
    fn send_data<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, Result<String>>;

    fn transaction_info<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<TxInfo>>;

    /// Wallet balance in the native currency.
    fn balance(&self) -> BoxFuture<'_, Result<Decimal>>;

    /// Public url where anyone can verify the transaction.
    fn verification_url(&self, hash: &str) -> String;
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInfo {
    pub hash: String,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    /// `None` while the transaction is not mined yet.
    pub success: Option<bool>,
    /// Transaction data decoded as utf-8.
    pub data: String,
}

/// Encodes bytes as a `0x` prefixed lowercase hex string.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Decodes a hex string, with or without the `0x` prefix.
pub fn from_hex(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(ErrorKind::ChainRpcError(format!("malformed hex string: {hex}")).into());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| Error::new(ErrorKind::ChainRpcError(format!("invalid hex: {e}"))))
        })
        .collect()
}

/// Parses a hex quantity as returned by the json-rpc api.
pub fn quantity(hex: &str) -> Result<u128> {
    let digits = hex.strip_prefix("0x").unwrap_or(hex);
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| ErrorKind::ChainRpcError(format!("invalid quantity {hex}: {e}")).into())
}

/// Converts a wei amount into the native currency unit (18 decimals).
pub fn from_wei(wei: u128) -> Result<Decimal> {
    let wei = i128::try_from(wei)
        .map_err(|_| ErrorKind::ChainRpcError(format!("amount out of range: {wei}")))?;
    Decimal::try_from_i128_with_scale(wei, 18)
        .map(|d| d.normalize())
        .map_err(|e| ErrorKind::ChainRpcError(format!("amount out of range: {e}")).into())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn hex_recovers_payload() {
        let payload = "READ|m|u|2025-01-01T00:00:00.000Z";
        let hex = to_hex(payload.as_bytes());
        assert!(hex.starts_with("0x52454144"));
        assert_eq!(from_hex(&hex).unwrap(), payload.as_bytes());
        assert!(from_hex("0xabc").is_err());
        assert!(from_hex("0xzz").is_err());
    }

    #[test]
    fn quantities_are_hex() {
        assert_eq!(quantity("0x1").unwrap(), 1);
        assert_eq!(quantity("0x186a0").unwrap(), 100_000);
        assert_eq!(quantity("0x").unwrap(), 0);
        assert!(quantity("0xg").is_err());
    }

    #[test]
    fn wei_converts_to_whole_units() {
        assert_eq!(
            from_wei(1_500_000_000_000_000_000).unwrap(),
            Decimal::from_str("1.5").unwrap()
        );
        assert_eq!(from_wei(1).unwrap().to_string(), "0.000000000000000001");
        assert_eq!(from_wei(0).unwrap(), Decimal::ZERO);
    }
}
