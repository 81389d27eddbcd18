//! Thin typed client for the Palette chain rpc endpoint.

use crate::error::{RelayerError, RelayerResult};

use ethers::abi::{self, ParamType, Token};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{
    Address, Block, BlockNumber, Bytes, Filter, Log, TransactionReceipt, TransactionRequest,
    H256, U256,
};
use ethers::utils::{id, keccak256};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// `CrossChainEvent(address,bytes,address,uint64,bytes,bytes)` emitted by
/// the cross-chain-manager contract on every lock.
#[derive(Debug, Clone)]
pub struct CrossChainEvent {
    pub sender: Address,
    pub tx_id: Vec<u8>,
    pub proxy_or_asset_contract: Address,
    pub to_chain_id: u64,
    pub to_contract: Vec<u8>,
    pub raw_data: Vec<u8>,
    /// Transaction hash of the emitting transaction.
    pub raw_tx_hash: H256,
}

const CROSS_CHAIN_EVENT_SIG: &str = "CrossChainEvent(address,bytes,address,uint64,bytes,bytes)";

/// Shared, thread-safe connection holder for the Palette side.
#[derive(Clone)]
pub struct PaletteClient {
    provider: Arc<Provider<Http>>,
    eccm: Address,
    eccd: Address,
}

impl PaletteClient {
    pub fn connect(url: &str, eccm: Address, eccd: Address) -> RelayerResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| RelayerError::Config(format!("cannot dial palette node {url}: {e}")))?
            .interval(Duration::from_millis(100));
        Ok(Self {
            provider: Arc::new(provider),
            eccm,
            eccd,
        })
    }

    pub fn eccm_contract(&self) -> Address {
        self.eccm
    }

    pub fn eccd_contract(&self) -> Address {
        self.eccd
    }

    /// EVM chain id used for transaction signing.
    pub async fn get_chain_id(&self) -> RelayerResult<u64> {
        let id = self
            .provider
            .get_chainid()
            .await
            .map_err(|e| RelayerError::PaletteRpc(e.to_string()))?;
        Ok(id.as_u64())
    }

    pub async fn get_node_height(&self) -> RelayerResult<u64> {
        let height = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| RelayerError::PaletteRpc(e.to_string()))?;
        Ok(height.as_u64())
    }

    pub async fn block_by_number(&self, height: u64) -> RelayerResult<Block<H256>> {
        self.provider
            .get_block(height)
            .await
            .map_err(|e| RelayerError::PaletteRpc(e.to_string()))?
            .ok_or_else(|| RelayerError::PaletteRpc(format!("block {height} not found")))
    }

    /// Canonical JSON bytes of the header at `height`, as consumed by the
    /// header-sync contract.
    pub async fn header_json(&self, height: u64) -> RelayerResult<(Block<H256>, Vec<u8>)> {
        let block = self.block_by_number(height).await?;
        let raw = serde_json::to_vec(&block)
            .map_err(|e| RelayerError::Codec(format!("marshal header: {e}")))?;
        Ok((block, raw))
    }

    /// Lock events emitted by the cross-chain manager at exactly `height`.
    pub async fn filter_cross_chain_events(
        &self,
        height: u64,
    ) -> RelayerResult<Vec<CrossChainEvent>> {
        let topic = H256::from(keccak256(CROSS_CHAIN_EVENT_SIG.as_bytes()));
        let filter = Filter::new()
            .address(self.eccm)
            .topic0(topic)
            .from_block(height)
            .to_block(height);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| RelayerError::PaletteRpc(e.to_string()))?;
        logs.iter().map(decode_cross_chain_event).collect()
    }

    /// Fetch the storage proof of one event key at `height`. The node's
    /// whole proof response is forwarded verbatim to the relay chain.
    pub async fn get_proof(
        &self,
        contract: Address,
        storage_key: [u8; 32],
        height: u64,
    ) -> RelayerResult<Vec<u8>> {
        let params = json!([
            format!("{contract:?}"),
            [format!("0x{}", hex::encode(storage_key))],
            format!("0x{height:x}"),
        ]);
        let proof: serde_json::Value = self
            .provider
            .request("eth_getProof", params)
            .await
            .map_err(|e| RelayerError::PaletteRpc(format!("eth_getProof: {e}")))?;
        serde_json::to_vec(&proof).map_err(|e| RelayerError::Codec(format!("marshal proof: {e}")))
    }

    async fn eccd_call(&self, selector: &str) -> RelayerResult<Bytes> {
        let tx = TransactionRequest::new()
            .to(self.eccd)
            .data(id(selector).to_vec());
        self.provider
            .call(&tx.into(), None)
            .await
            .map_err(|e| RelayerError::PaletteRpc(format!("{selector}: {e}")))
    }

    /// Serialized keeper set of the current epoch, from the data contract.
    pub async fn get_cur_epoch_con_pubkey_bytes(&self) -> RelayerResult<Vec<u8>> {
        let out = self.eccd_call("getCurEpochConPubKeyBytes()").await?;
        let tokens = abi::decode(&[ParamType::Bytes], &out)
            .map_err(|e| RelayerError::Codec(format!("decode keeper bytes: {e}")))?;
        match tokens.into_iter().next() {
            Some(Token::Bytes(bytes)) => Ok(bytes),
            _ => Err(RelayerError::Codec("keeper bytes: unexpected abi shape".into())),
        }
    }

    /// Relay-chain height at which the current keeper epoch began.
    pub async fn get_cur_epoch_start_height(&self) -> RelayerResult<u32> {
        let out = self.eccd_call("getCurEpochStartHeight()").await?;
        let tokens = abi::decode(&[ParamType::Uint(64)], &out)
            .map_err(|e| RelayerError::Codec(format!("decode epoch start: {e}")))?;
        match tokens.into_iter().next() {
            Some(Token::Uint(v)) => Ok(v.as_u32()),
            _ => Err(RelayerError::Codec("epoch start: unexpected abi shape".into())),
        }
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| RelayerError::Transaction(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| RelayerError::PaletteRpc(e.to_string()))
    }

    pub async fn get_transaction_count(&self, address: Address) -> RelayerResult<U256> {
        self.provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| RelayerError::PaletteRpc(e.to_string()))
    }
}

/// Decode one cross-chain log. The sender is indexed; the remaining fields
/// sit in the data section.
fn decode_cross_chain_event(log: &Log) -> RelayerResult<CrossChainEvent> {
    let sender = log
        .topics
        .get(1)
        .map(|t| Address::from_slice(&t.as_bytes()[12..]))
        .ok_or_else(|| RelayerError::Codec("cross-chain event missing sender topic".into()))?;

    let tokens = abi::decode(
        &[
            ParamType::Bytes,
            ParamType::Address,
            ParamType::Uint(64),
            ParamType::Bytes,
            ParamType::Bytes,
        ],
        &log.data,
    )
    .map_err(|e| RelayerError::Codec(format!("decode cross-chain event: {e}")))?;

    let mut iter = tokens.into_iter();
    let tx_id = match iter.next() {
        Some(Token::Bytes(b)) => b,
        _ => return Err(bad_event_shape()),
    };
    let proxy_or_asset_contract = match iter.next() {
        Some(Token::Address(a)) => a,
        _ => return Err(bad_event_shape()),
    };
    let to_chain_id = match iter.next() {
        Some(Token::Uint(v)) => v.as_u64(),
        _ => return Err(bad_event_shape()),
    };
    let to_contract = match iter.next() {
        Some(Token::Bytes(b)) => b,
        _ => return Err(bad_event_shape()),
    };
    let raw_data = match iter.next() {
        Some(Token::Bytes(b)) => b,
        _ => return Err(bad_event_shape()),
    };

    let raw_tx_hash = log.transaction_hash.unwrap_or_default();
    debug!(
        to_chain_id,
        tx_hash = ?raw_tx_hash,
        "decoded cross-chain event"
    );

    Ok(CrossChainEvent {
        sender,
        tx_id,
        proxy_or_asset_contract,
        to_chain_id,
        to_contract,
        raw_data,
        raw_tx_hash,
    })
}

fn bad_event_shape() -> RelayerError {
    RelayerError::Codec("cross-chain event: unexpected abi shape".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U64;

    fn event_log(to_chain_id: u64, raw_data: &[u8]) -> Log {
        let sender: Address = "0x5593b2b8dc63d0ed68aa8f885707b2dc5787e391".parse().unwrap();
        let proxy: Address = "0x0000000000000000000000000000000000000103".parse().unwrap();
        let data = abi::encode(&[
            Token::Bytes(vec![0x03]),
            Token::Address(proxy),
            Token::Uint(U256::from(to_chain_id)),
            Token::Bytes(vec![0xAA; 20]),
            Token::Bytes(raw_data.to_vec()),
        ]);
        Log {
            address: proxy,
            topics: vec![
                H256::from(keccak256(CROSS_CHAIN_EVENT_SIG.as_bytes())),
                H256::from(sender),
            ],
            data: data.into(),
            block_number: Some(U64::from(14420u64)),
            transaction_hash: Some(H256::repeat_byte(7)),
            ..Default::default()
        }
    }

    #[test]
    fn decode_event_log() {
        let event = decode_cross_chain_event(&event_log(101, b"payload")).unwrap();
        assert_eq!(event.to_chain_id, 101);
        assert_eq!(event.tx_id, vec![0x03]);
        assert_eq!(event.raw_data, b"payload");
        assert_eq!(event.raw_tx_hash, H256::repeat_byte(7));
    }

    #[test]
    fn decode_rejects_truncated_data() {
        let mut log = event_log(101, b"payload");
        log.data = log.data[..8].to_vec().into();
        assert!(decode_cross_chain_event(&log).is_err());
    }
}
