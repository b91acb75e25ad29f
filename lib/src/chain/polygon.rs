use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, TransactionRequest, U256};
use ethers_signers::{LocalWallet, Signer};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{from_hex, from_wei, quantity, to_hex, Chain, TxInfo};
use crate::{ErrorKind, Result};

/// Json-rpc client for Polygon (or any other evm chain).
///
/// With a private key configured, transactions are signed locally and
/// submitted raw, which works against public providers. Otherwise the
/// provider is asked to sign for the configured wallet.
pub struct PolygonRpc {
    client: reqwest::Client,
    provider_url: String,
    /// Sender of the anchoring transactions.
    wallet: String,
    /// Receiver of the anchoring transactions.
    to: String,
    signer: Option<LocalWallet>,
    /// Held from nonce lookup until the node accepted the transaction.
    sending: Mutex<()>,
    gas_limit: u64,
    poll_interval: Duration,
    confirmation_timeout: Duration,
    explorer_url: String,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Receipt {
    block_number: Option<String>,
    gas_used: Option<String>,
    status: Option<String>,
}

impl Receipt {
    fn succeeded(&self) -> Option<bool> {
        self.status.as_deref().map(|s| s != "0x0")
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Transaction {
    hash: String,
    input: String,
    block_number: Option<String>,
}

impl PolygonRpc {
    pub fn new(config: &crate::config::Chain) -> Result<Self> {
        let provider_url = config.provider_url()?;
        let signer = match config.private_key() {
            Some(key) => Some(
                LocalWallet::from_str(key.trim().trim_start_matches("0x"))
                    .map_err(|e| ErrorKind::ChainSignerError(format!("invalid private key: {e}")))?,
            ),
            None => None,
        };
        let (wallet, to) = match &signer {
            Some(signer) => {
                let own = format!("{:#x}", signer.address());
                let to = config.wallet_address().unwrap_or_else(|_| own.clone());
                Address::from_str(&to).map_err(|e| {
                    ErrorKind::ChainSignerError(format!("invalid wallet address {to}: {e}"))
                })?;
                (own, to)
            }
            None => {
                let wallet = config.wallet_address()?;
                (wallet.clone(), wallet)
            }
        };

        Ok(Self {
            client: reqwest::Client::new(),
            provider_url,
            wallet,
            to,
            signer,
            sending: Mutex::new(()),
            gas_limit: config.gas_limit,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            confirmation_timeout: Duration::from_secs(config.confirmation_timeout_secs),
            explorer_url: config.explorer_url.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response: RpcResponse = self
            .client
            .post(&self.provider_url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(ErrorKind::ChainRpcError(format!(
                "{method} failed ({}): {}",
                error.code, error.message
            ))
            .into());
        }
        Ok(serde_json::from_value(response.result)?)
    }

    async fn receipt(&self, hash: &str) -> Result<Option<Receipt>> {
        self.call("eth_getTransactionReceipt", json!([hash])).await
    }

    async fn poll_receipt(&self, hash: &str) -> Result<Receipt> {
        loop {
            if let Some(receipt) = self.receipt(hash).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn submit(&self, payload: &str) -> Result<String> {
        let hash = match &self.signer {
            Some(signer) => self.send_signed(signer, payload.as_bytes()).await?,
            None => self.send_unsigned(payload.as_bytes()).await?,
        };
        tracing::info!(%hash, "transaction submitted, waiting for confirmation");

        let receipt = tokio::time::timeout(self.confirmation_timeout, self.poll_receipt(&hash))
            .await
            .map_err(|_| ErrorKind::TransactionTimeout(hash.clone()))??;
        if receipt.succeeded() == Some(false) {
            return Err(ErrorKind::TransactionReverted(hash).into());
        }

        tracing::debug!(%hash, block = ?receipt.block_number, "transaction confirmed");
        Ok(hash)
    }

    /// Signs locally and submits through `eth_sendRawTransaction`.
    async fn send_signed(&self, signer: &LocalWallet, data: &[u8]) -> Result<String> {
        let _sending = self.sending.lock().await;

        let from = format!("{:#x}", signer.address());
        let nonce: String = self
            .call("eth_getTransactionCount", json!([from, "pending"]))
            .await?;
        let gas_price: String = self.call("eth_gasPrice", json!([])).await?;
        let chain_id: String = self.call("eth_chainId", json!([])).await?;

        let to = Address::from_str(&self.to)
            .map_err(|e| ErrorKind::ChainSignerError(format!("invalid wallet address: {e}")))?;
        let tx: TypedTransaction = TransactionRequest::new()
            .from(signer.address())
            .to(to)
            .value(U256::zero())
            .data(data.to_vec())
            .gas(self.gas_limit)
            .gas_price(U256::from(quantity(&gas_price)?))
            .nonce(U256::from(quantity(&nonce)?))
            .chain_id(quantity(&chain_id)? as u64)
            .into();
        let signature = signer
            .sign_transaction_sync(&tx)
            .map_err(|e| ErrorKind::ChainSignerError(e.to_string()))?;

        self.call(
            "eth_sendRawTransaction",
            json!([to_hex(&tx.rlp_signed(&signature))]),
        )
        .await
    }

    /// Leaves signing to the provider, which must hold the wallet key.
    async fn send_unsigned(&self, data: &[u8]) -> Result<String> {
        let tx = json!({
            "from": self.wallet,
            "to": self.to,
            "value": "0x0",
            "gas": format!("{:#x}", self.gas_limit),
            "data": to_hex(data),
        });
        self.call("eth_sendTransaction", json!([tx])).await
    }

    async fn info(&self, hash: &str) -> Result<TxInfo> {
        let tx: Option<Transaction> = self
            .call("eth_getTransactionByHash", json!([hash]))
            .await?;
        let tx = tx.ok_or_else(|| ErrorKind::NotFound(format!("transaction {hash}")))?;
        let receipt = self.receipt(hash).await?;

        let block_number = match tx.block_number.as_deref() {
            Some(n) => Some(quantity(n)? as u64),
            None => None,
        };
        let gas_used = match receipt.as_ref().and_then(|r| r.gas_used.as_deref()) {
            Some(n) => Some(quantity(n)? as u64),
            None => None,
        };

        Ok(TxInfo {
            hash: tx.hash,
            block_number,
            gas_used,
            success: receipt.as_ref().and_then(Receipt::succeeded),
            data: String::from_utf8_lossy(&from_hex(&tx.input)?).into_owned(),
        })
    }

    async fn wallet_balance(&self) -> Result<Decimal> {
        let wei: String = self
            .call("eth_getBalance", json!([self.wallet, "latest"]))
            .await?;
        from_wei(quantity(&wei)?)
    }
}

impl Chain for PolygonRpc {
    fn send_data<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.submit(payload))
    }

    fn transaction_info<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<TxInfo>> {
        Box::pin(self.info(hash))
    }

    fn balance(&self) -> BoxFuture<'_, Result<Decimal>> {
        Box::pin(self.wallet_balance())
    }

    fn verification_url(&self, hash: &str) -> String {
        format!("{}/{}", self.explorer_url.trim_end_matches('/'), hash)
    }
}
