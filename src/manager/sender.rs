//! Pool of Palette signing accounts. Each sender owns a distinct nonce
//! sequence; different senders submit concurrently without contention.

use crate::chain::PaletteClient;
use crate::config::PaletteConfig;
use crate::error::{RelayerError, RelayerResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, H256, U256};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct PaletteSender {
    wallet: LocalWallet,
    client: Arc<PaletteClient>,
    /// Next nonce; the lock serializes this account's submissions.
    nonce: Mutex<u64>,
    gas_price: u64,
    gas_limit: u64,
}

impl PaletteSender {
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Sign and submit a contract call, then wait for its receipt. Returns
    /// the Palette tx hash on a successful execution.
    pub async fn send_tx_to_palette(
        &self,
        contract: Address,
        tag: &str,
        tx_data: Vec<u8>,
    ) -> RelayerResult<H256> {
        let mut nonce = self.nonce.lock().await;

        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(contract)
            .data(tx_data)
            .nonce(*nonce)
            .gas_price(self.gas_price)
            .gas(self.gas_limit)
            .chain_id(self.wallet.chain_id())
            .into();

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(format!("sign palette tx: {e}")))?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = match self.client.send_raw_transaction(raw).await {
            Ok(hash) => hash,
            Err(RelayerError::Transaction(message)) if message.contains("nonce too low") => {
                warn!(sender = ?self.address(), "nonce too low, resyncing");
                *nonce = self.fetch_nonce().await?;
                return Err(RelayerError::Nonce {
                    sender: format!("{:?}", self.address()),
                    message,
                });
            }
            Err(e) => return Err(e),
        };
        *nonce += 1;
        drop(nonce);

        debug!(tag, ?tx_hash, "palette tx submitted");
        self.wait_tx_confirmed(tx_hash, tag).await?;
        Ok(tx_hash)
    }

    async fn wait_tx_confirmed(&self, tx_hash: H256, tag: &str) -> RelayerResult<()> {
        let deadline = tokio::time::Instant::now() + RECEIPT_TIMEOUT;
        loop {
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            if tokio::time::Instant::now() > deadline {
                return Err(RelayerError::Timeout {
                    operation: format!("palette receipt of {tx_hash:?}"),
                });
            }
            match self.client.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status == Some(1.into()) {
                        info!(tag, ?tx_hash, "palette tx confirmed");
                        return Ok(());
                    }
                    return Err(RelayerError::Transaction(format!(
                        "palette tx {tx_hash:?} reverted"
                    )));
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(?tx_hash, "receipt poll: {e}");
                }
            }
        }
    }

    async fn fetch_nonce(&self) -> RelayerResult<u64> {
        let count: U256 = self.client.get_transaction_count(self.wallet.address()).await?;
        Ok(count.as_u64())
    }
}

/// Fixed-size set of signing accounts loaded from the keystore directory.
pub struct SenderPool {
    senders: Vec<Arc<PaletteSender>>,
}

impl SenderPool {
    /// Decrypt every keystore file and seed each account's nonce from the
    /// chain.
    pub async fn load(
        config: &PaletteConfig,
        client: Arc<PaletteClient>,
        evm_chain_id: u64,
    ) -> RelayerResult<Self> {
        let mut senders = Vec::new();
        let dir = std::fs::read_dir(&config.key_store_path).map_err(|e| {
            RelayerError::Wallet(format!("open keystore dir {}: {e}", config.key_store_path))
        })?;

        for entry in dir {
            let entry = entry.map_err(|e| RelayerError::Wallet(format!("keystore dir: {e}")))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let address = keystore_address(&path)?;
            let pwd = config
                .key_store_pwd_set
                .get(&format!("{address:?}"))
                .ok_or_else(|| {
                    RelayerError::Wallet(format!("no password configured for {address:?}"))
                })?;
            let wallet = LocalWallet::decrypt_keystore(&path, pwd)
                .map_err(|e| RelayerError::Wallet(format!("decrypt {}: {e}", path.display())))?
                .with_chain_id(evm_chain_id);

            let nonce = client.get_transaction_count(wallet.address()).await?.as_u64();
            info!(sender = ?wallet.address(), nonce, "palette sender loaded");
            senders.push(Arc::new(PaletteSender {
                wallet,
                client: client.clone(),
                nonce: Mutex::new(nonce),
                gas_price: config.gas_price,
                gas_limit: config.gas_limit,
            }));
        }

        if senders.is_empty() {
            return Err(RelayerError::Wallet(format!(
                "no keystore accounts under {}",
                config.key_store_path
            )));
        }
        Ok(Self { senders })
    }

    /// Uniform random selection; per-sender ordering comes from the nonce
    /// lock inside each sender.
    pub fn select(&self) -> Arc<PaletteSender> {
        let idx = rand::thread_rng().gen_range(0..self.senders.len());
        self.senders[idx].clone()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

/// Peek the address recorded in a keystore JSON without decrypting it.
fn keystore_address(path: &std::path::Path) -> RelayerResult<Address> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RelayerError::Wallet(format!("read {}: {e}", path.display())))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| RelayerError::Wallet(format!("parse {}: {e}", path.display())))?;
    let addr = value
        .get("address")
        .and_then(|a| a.as_str())
        .ok_or_else(|| {
            RelayerError::Wallet(format!("{} has no address field", path.display()))
        })?;
    let addr = addr.trim_start_matches("0x");
    format!("0x{addr}")
        .parse()
        .map_err(|e| RelayerError::Wallet(format!("{} address: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystore_address_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        std::fs::write(
            &path,
            r#"{"address":"5593b2b8dc63d0ed68aa8f885707b2dc5787e391","crypto":{}}"#,
        )
        .unwrap();
        let addr = keystore_address(&path).unwrap();
        assert_eq!(
            addr,
            "0x5593b2b8dc63d0ed68aa8f885707b2dc5787e391".parse::<Address>().unwrap()
        );
    }

    #[test]
    fn keystore_without_address_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, r#"{"crypto":{}}"#).unwrap();
        assert!(keystore_address(&path).is_err());
    }
}
