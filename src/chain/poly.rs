//! Thin typed client for the Poly relay chain: JSON-RPC plumbing, header
//! decoding, and native-contract invocations.

use crate::codec::{ZeroCopySink, ZeroCopySource};
use crate::error::{RelayerError, RelayerResult, SubmitErrorKind};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256};
use ethers::utils::keccak256;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Native header-sync contract storing foreign-chain headers and valsets.
pub const HEADER_SYNC_CONTRACT: &str = "0200000000000000000000000000000000000000";
/// Native cross-chain manager recording and dispatching messages.
pub const CROSS_CHAIN_MANAGER_CONTRACT: &str = "0300000000000000000000000000000000000000";

const INVOKE_TX_TYPE: u8 = 0xD1;
const INVOKE_GAS_LIMIT: u64 = 20_000;

/// A Poly block header. On-chain verification consumes the unsigned
/// serialization plus the normalized signature blob.
#[derive(Debug, Clone)]
pub struct PolyHeader {
    pub version: u32,
    pub chain_id: u64,
    pub prev_block_hash: [u8; 32],
    pub transactions_root: [u8; 32],
    pub cross_state_root: [u8; 32],
    pub block_root: [u8; 32],
    pub timestamp: u32,
    pub height: u32,
    pub consensus_data: u64,
    pub consensus_payload: Vec<u8>,
    pub next_book_keeper: [u8; 20],
    pub book_keepers: Vec<Vec<u8>>,
    pub sig_data: Vec<Vec<u8>>,
}

impl PolyHeader {
    pub fn from_raw(raw: &[u8]) -> RelayerResult<Self> {
        let mut source = ZeroCopySource::new(raw);
        let version = source.next_u32()?;
        let chain_id = source.next_u64()?;
        let prev_block_hash = source.next_hash()?;
        let transactions_root = source.next_hash()?;
        let cross_state_root = source.next_hash()?;
        let block_root = source.next_hash()?;
        let timestamp = source.next_u32()?;
        let height = source.next_u32()?;
        let consensus_data = source.next_u64()?;
        let consensus_payload = source.next_var_bytes()?;
        let next_book_keeper: [u8; 20] = source
            .next_bytes(20)?
            .try_into()
            .expect("fixed-length read");

        // the signed section is absent on headers served for hashing
        let (book_keepers, sig_data) = if source.remaining() > 0 {
            let mut book_keepers = Vec::new();
            for _ in 0..source.next_var_uint()? {
                book_keepers.push(source.next_var_bytes()?);
            }
            let mut sig_data = Vec::new();
            for _ in 0..source.next_var_uint()? {
                sig_data.push(source.next_var_bytes()?);
            }
            (book_keepers, sig_data)
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(Self {
            version,
            chain_id,
            prev_block_hash,
            transactions_root,
            cross_state_root,
            block_root,
            timestamp,
            height,
            consensus_data,
            consensus_payload,
            next_book_keeper,
            book_keepers,
            sig_data,
        })
    }

    /// The unsigned portion: everything up to the bookkeeper section.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut sink = ZeroCopySink::new();
        sink.write_u32(self.version);
        sink.write_u64(self.chain_id);
        sink.write_bytes(&self.prev_block_hash);
        sink.write_bytes(&self.transactions_root);
        sink.write_bytes(&self.cross_state_root);
        sink.write_bytes(&self.block_root);
        sink.write_u32(self.timestamp);
        sink.write_u32(self.height);
        sink.write_u64(self.consensus_data);
        sink.write_var_bytes(&self.consensus_payload);
        sink.write_bytes(&self.next_book_keeper);
        sink.into_bytes()
    }

    /// Digest the Palette-side contracts recover bookkeeper signatures over.
    pub fn hash(&self) -> H256 {
        H256::from(keccak256(self.unsigned_bytes()))
    }

    /// Parse the VBFT consensus payload carried in this header.
    pub fn vbft_block_info(&self) -> RelayerResult<VbftBlockInfo> {
        serde_json::from_slice(&self.consensus_payload)
            .map_err(|e| RelayerError::Codec(format!("vbft block info: {e}")))
    }
}

/// VBFT consensus metadata embedded in every Poly header. A non-null
/// `new_chain_config` announces a bookkeeper rotation.
#[derive(Debug, Clone, Deserialize)]
pub struct VbftBlockInfo {
    #[serde(default)]
    pub leader: u32,
    #[serde(default)]
    pub vrf_value: String,
    #[serde(default)]
    pub vrf_proof: String,
    #[serde(default)]
    pub last_config_block_num: u32,
    #[serde(default)]
    pub new_chain_config: Option<VbftChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VbftChainConfig {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub view: u32,
    #[serde(default)]
    pub n: u32,
    #[serde(default)]
    pub c: u32,
    #[serde(default)]
    pub peers: Vec<VbftPeerStakeInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VbftPeerStakeInfo {
    #[serde(default)]
    pub index: u32,
    /// Hex-encoded consensus public key.
    #[serde(default)]
    pub id: String,
}

/// One notification entry of an executed Poly transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyEntry {
    #[serde(rename = "ContractAddress")]
    pub contract_address: String,
    #[serde(rename = "States", default)]
    pub states: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmartContractEvent {
    #[serde(rename = "TxHash", default)]
    pub tx_hash: String,
    #[serde(rename = "State", default)]
    pub state: i64,
    #[serde(rename = "Notify", default)]
    pub notify: Vec<NotifyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct MerkleProofResponse {
    #[serde(rename = "AuditPath", alias = "auditPath", default)]
    audit_path: String,
}

/// The relayer's signing account on Poly.
pub struct PolySigner {
    wallet: LocalWallet,
}

impl PolySigner {
    pub fn open(wallet_file: &str, pwd: &str) -> RelayerResult<Self> {
        let wallet = LocalWallet::decrypt_keystore(wallet_file, pwd)
            .map_err(|e| RelayerError::Wallet(format!("open poly wallet {wallet_file}: {e}")))?;
        Ok(Self { wallet })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    fn sign(&self, hash: H256) -> RelayerResult<Vec<u8>> {
        let sig = self
            .wallet
            .sign_hash(hash)
            .map_err(|e| RelayerError::Wallet(format!("poly signing: {e}")))?;
        Ok(sig.to_vec())
    }
}

/// Shared, thread-safe connection holder for the Poly side.
pub struct PolyClient {
    http: reqwest::Client,
    url: String,
    signer: Arc<PolySigner>,
    nonce: AtomicU64,
}

impl PolyClient {
    pub fn connect(url: &str, signer: PolySigner) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            signer: Arc::new(signer),
            nonce: AtomicU64::new(1),
        }
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    async fn rpc(&self, method: &str, params: serde_json::Value) -> RelayerResult<serde_json::Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let response: serde_json::Value = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayerError::PolyRpc(format!("{method}: {e}")))?
            .json()
            .await
            .map_err(|e| RelayerError::PolyRpc(format!("{method}: bad response: {e}")))?;

        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            return Err(RelayerError::PolyRpc(format!("{method}: {err}")));
        }
        Ok(response.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    pub async fn get_current_block_height(&self) -> RelayerResult<u32> {
        let count = self
            .rpc("getblockcount", json!([]))
            .await?
            .as_u64()
            .ok_or_else(|| RelayerError::PolyRpc("getblockcount: not a number".into()))?;
        Ok(count.saturating_sub(1) as u32)
    }

    pub async fn get_block_height_by_tx_hash(&self, tx_hash: &str) -> RelayerResult<u32> {
        let height = self
            .rpc("getblockheightbytxhash", json!([tx_hash]))
            .await?
            .as_u64()
            .ok_or_else(|| RelayerError::PolyRpc("getblockheightbytxhash: not a number".into()))?;
        Ok(height as u32)
    }

    /// Raw storage bytes of a native contract; absent keys yield empty bytes.
    pub async fn get_storage(&self, contract: &str, key: &[u8]) -> RelayerResult<Vec<u8>> {
        let result = self
            .rpc("getstorage", json!([contract, hex::encode(key)]))
            .await?;
        match result.as_str() {
            Some(s) if !s.is_empty() => hex::decode(s)
                .map_err(|e| RelayerError::PolyRpc(format!("getstorage: bad hex: {e}"))),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn get_header_by_height(&self, height: u32) -> RelayerResult<PolyHeader> {
        let result = self.rpc("getheader", json!([height])).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| RelayerError::PolyRpc(format!("getheader {height}: not a string")))?;
        let bytes = hex::decode(raw)
            .map_err(|e| RelayerError::PolyRpc(format!("getheader {height}: bad hex: {e}")))?;
        PolyHeader::from_raw(&bytes)
    }

    pub async fn get_smart_contract_events_by_height(
        &self,
        height: u32,
    ) -> RelayerResult<Vec<SmartContractEvent>> {
        let result = self.rpc("getsmartcodeevent", json!([height])).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| RelayerError::PolyRpc(format!("getsmartcodeevent: {e}")))
    }

    /// Event of a single transaction; `None` while it is not yet executed.
    pub async fn get_smart_contract_event(
        &self,
        tx_hash: &str,
    ) -> RelayerResult<Option<SmartContractEvent>> {
        let result = self.rpc("getsmartcodeevent", json!([tx_hash])).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| RelayerError::PolyRpc(format!("getsmartcodeevent: {e}")))
    }

    /// Inclusion proof of a cross-chain message against the cross-state root
    /// of the block it was recorded in.
    pub async fn get_cross_states_proof(&self, height: u32, key: &str) -> RelayerResult<Vec<u8>> {
        let result = self
            .rpc("getcrossstatesproof", json!([height, key]))
            .await?;
        let proof: MerkleProofResponse = serde_json::from_value(result)
            .map_err(|e| RelayerError::PolyRpc(format!("getcrossstatesproof: {e}")))?;
        hex::decode(&proof.audit_path)
            .map_err(|e| RelayerError::PolyRpc(format!("getcrossstatesproof: bad hex: {e}")))
    }

    /// Header inclusion proof from `height` up to an anchor at `root_height`.
    pub async fn get_merkle_proof(&self, height: u32, root_height: u32) -> RelayerResult<Vec<u8>> {
        let result = self
            .rpc("getmerkleproof", json!([height, root_height]))
            .await?;
        let proof: MerkleProofResponse = serde_json::from_value(result)
            .map_err(|e| RelayerError::PolyRpc(format!("getmerkleproof: {e}")))?;
        hex::decode(&proof.audit_path)
            .map_err(|e| RelayerError::PolyRpc(format!("getmerkleproof: bad hex: {e}")))
    }

    /// `Native.Hs.SyncBlockHeader`: commit side-chain headers to the
    /// header-sync contract. Returns the Poly tx hash.
    pub async fn sync_block_header(
        &self,
        chain_id: u64,
        relayer: Address,
        headers: &[Vec<u8>],
    ) -> RelayerResult<String> {
        let mut args = ZeroCopySink::new();
        args.write_u64(chain_id);
        args.write_var_bytes(relayer.as_bytes());
        args.write_var_uint(headers.len() as u64);
        for header in headers {
            args.write_var_bytes(header);
        }
        self.invoke_native(HEADER_SYNC_CONTRACT, "syncBlockHeader", args.into_bytes())
            .await
    }

    /// `Native.Ccm.ImportOuterTransfer`: relay one cross-chain event with
    /// its storage proof and the header it was proven against.
    pub async fn import_outer_transfer(
        &self,
        chain_id: u64,
        value: &[u8],
        height: u32,
        proof: &[u8],
        relayer: Address,
        header_json: &[u8],
    ) -> RelayerResult<String> {
        let mut args = ZeroCopySink::new();
        args.write_u64(chain_id);
        args.write_var_bytes(value);
        args.write_u32(height);
        args.write_var_bytes(proof);
        args.write_var_bytes(relayer.as_bytes());
        args.write_var_bytes(header_json);
        match self
            .invoke_native(CROSS_CHAIN_MANAGER_CONTRACT, "ImportOuterTransfer", args.into_bytes())
            .await
        {
            Ok(hash) => Ok(hash),
            Err(RelayerError::PolyRpc(message)) => {
                match SubmitErrorKind::classify(&message) {
                    SubmitErrorKind::Other => Err(RelayerError::PolyRpc(message)),
                    kind => Err(RelayerError::Submit(kind)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn invoke_native(
        &self,
        contract: &str,
        method: &str,
        args: Vec<u8>,
    ) -> RelayerResult<String> {
        let contract_bytes = hex::decode(contract)
            .map_err(|e| RelayerError::Internal(format!("native contract hex: {e}")))?;
        let raw = build_native_invoke_tx(
            &contract_bytes,
            method,
            &args,
            self.signer.address(),
            self.nonce.fetch_add(1, Ordering::Relaxed) as u32,
            &self.signer,
        )?;
        let result = self
            .rpc("sendrawtransaction", json!([hex::encode(&raw)]))
            .await?;
        let hash = result
            .as_str()
            .ok_or_else(|| RelayerError::PolyRpc("sendrawtransaction: not a string".into()))?;
        debug!(method, tx_hash = hash, "native invoke accepted");
        Ok(hash.to_string())
    }
}

/// Assemble and sign a native-contract invocation transaction.
fn build_native_invoke_tx(
    contract: &[u8],
    method: &str,
    args: &[u8],
    payer: Address,
    nonce: u32,
    signer: &PolySigner,
) -> RelayerResult<Vec<u8>> {
    let mut code = ZeroCopySink::new();
    code.write_u8(0); // native contract version
    code.write_bytes(contract);
    code.write_string(method);
    code.write_var_bytes(args);

    let mut tx = ZeroCopySink::new();
    tx.write_u8(0); // tx version
    tx.write_u8(INVOKE_TX_TYPE);
    tx.write_u32(nonce);
    tx.write_u64(0); // gas price: native invokes are free for relayers
    tx.write_u64(INVOKE_GAS_LIMIT);
    tx.write_bytes(payer.as_bytes());
    tx.write_var_bytes(code.bytes());

    let hash = H256::from(sha256d(tx.bytes()));
    let sig = signer.sign(hash)?;
    tx.write_var_uint(1);
    tx.write_var_bytes(&sig);
    Ok(tx.into_bytes())
}

fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Header captured from a Poly testnet node; no signed section.
    const HEADER_RAW: &str = "00000000db056dd1000000006cb80beaedecc3c1f88e70b2f393fdfc3948733c1447638b2f97aea0dbaa1eb600\
        00000000000000000000000000000000000000000000000000000000000000f605278b9fe4bea01f09d4f8d180\
        3ae0f2ec5e9a6bd85b18924ed4f8f905b25e1b52a770c45cb9e1c71808fdf22c5b6151c04c9cec23497478f4d7\
        87061e176dff98ea5fff7f0700e6009e4247a15cb2fd11017b226c6561646572223a322c227672665f76616c75\
        65223a224249354e43342b3666716d4a645274626a2f424278364d656b56394b423266647537397a6d67536d64\
        43706467682f3031746b7772794a694c4556535769462f5278596338704b35554558766e3170654274332f5469\
        6f3d222c227672665f70726f6f66223a225864482f55434e4c31334244557359766335526650566c445054496f\
        7737663151355277574543553357484c754a454b4930322f426d4b564c3271727266354b6e4475467765334a36\
        6734755578657a615142742b673d3d222c226c6173745f636f6e6669675f626c6f636b5f6e756d223a34373035\
        36352c226e65775f636861696e5f636f6e666967223a6e756c6c7d000000000000000000000000000000000000\
        0000";

    fn header_bytes() -> Vec<u8> {
        hex::decode(HEADER_RAW.replace(char::is_whitespace, "")).unwrap()
    }

    #[test]
    fn decode_testnet_header() {
        let header = PolyHeader::from_raw(&header_bytes()).unwrap();
        assert_eq!(header.version, 0);
        assert_eq!(header.height, 0x0007_7FFF);
        assert!(header.book_keepers.is_empty());
        assert!(header.sig_data.is_empty());
        assert_eq!(header.next_book_keeper, [0u8; 20]);
    }

    #[test]
    fn unsigned_bytes_round_trip() {
        let header = PolyHeader::from_raw(&header_bytes()).unwrap();
        assert_eq!(header.unsigned_bytes(), header_bytes());
        // the pre-flight digest is stable
        assert_eq!(header.hash(), PolyHeader::from_raw(&header_bytes()).unwrap().hash());
    }

    #[test]
    fn vbft_payload_parses() {
        let header = PolyHeader::from_raw(&header_bytes()).unwrap();
        let info = header.vbft_block_info().unwrap();
        assert_eq!(info.leader, 2);
        assert_eq!(info.last_config_block_num, 470_565);
        assert!(info.new_chain_config.is_none());
    }

    #[test]
    fn vbft_chain_config_announces_rotation() {
        let payload = r#"{
            "leader": 1,
            "last_config_block_num": 470565,
            "new_chain_config": {
                "version": 1, "view": 3, "n": 7, "c": 2,
                "peers": [
                    {"index": 1, "id": "120202c4ff"},
                    {"index": 2, "id": "120203aabb"}
                ]
            }
        }"#;
        let info: VbftBlockInfo = serde_json::from_str(payload).unwrap();
        let config = info.new_chain_config.unwrap();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].index, 1);
    }

    #[test]
    fn truncated_header_rejected() {
        let bytes = header_bytes();
        assert!(PolyHeader::from_raw(&bytes[..60]).is_err());
    }

    #[test]
    fn smart_contract_event_shape() {
        let raw = r#"{
            "TxHash": "d468025ac3c5dc05704dce49694d2cb74ff3b4672440fc8b62a90802b119356e",
            "State": 1,
            "Notify": [{
                "ContractAddress": "0300000000000000000000000000000000000000",
                "States": ["makeProof", 101, 101, "00", "00", "0011"]
            }]
        }"#;
        let event: SmartContractEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.state, 1);
        assert_eq!(event.notify.len(), 1);
        assert_eq!(event.notify[0].states[0], "makeProof");
    }
}
