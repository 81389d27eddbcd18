//! Poly→Palette manager: mirrors bookkeeper rotations into the Palette data
//! contract and replays Poly cross-chain messages through the cross-chain
//! manager's `verifyHeaderAndExecuteTx`.

use crate::chain::poly::PolyHeader;
use crate::chain::{PaletteClient, PolyClient};
use crate::codec::sigs::{assemble_multi_sigs, convert_to_eth_compatible, quorum_m, verify_sig};
use crate::codec::valset::bytes_to_valset;
use crate::config::{ServiceConfig, PLT_MONITOR_INTERVAL};
use crate::error::{RelayerError, RelayerResult};
use crate::manager::sender::SenderPool;
use crate::metrics;
use crate::store::Store;

use ethers::abi::{self, Token};
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::core::k256::PublicKey;
use ethers::types::Address;
use ethers::utils::{id, keccak256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const VERIFY_AND_EXECUTE_SIG: &str = "verifyHeaderAndExecuteTx(bytes,bytes,bytes,bytes,bytes)";
const CHANGE_BOOK_KEEPER_SIG: &str = "changeBookKeeper(bytes,bytes,bytes)";

pub struct PolyManager {
    config: ServiceConfig,
    store: Store,
    palette: Arc<PaletteClient>,
    poly: Arc<PolyClient>,
    senders: Arc<SenderPool>,
    /// Caps concurrent Palette submissions.
    routines: Arc<Semaphore>,
    sync_height: AtomicU32,
    /// Current bookkeeper set, as Ethereum-style addresses.
    keepers: Mutex<Vec<Address>>,
}

impl PolyManager {
    pub async fn new(
        config: ServiceConfig,
        start_height: u32,
        palette: Arc<PaletteClient>,
        poly: Arc<PolyClient>,
        store: Store,
    ) -> RelayerResult<Arc<Self>> {
        let evm_chain_id = palette.get_chain_id().await?;
        let senders = SenderPool::load(&config.palette, palette.clone(), evm_chain_id).await?;
        info!(senders = senders.len(), "palette sender pool ready");

        let keeper_bytes = palette.get_cur_epoch_con_pubkey_bytes().await?;
        if keeper_bytes.is_empty() {
            return Err(RelayerError::GenesisNotSynced);
        }
        let keepers = bytes_to_valset(&keeper_bytes)?;
        let epoch_start = palette.get_cur_epoch_start_height().await?;

        let stored = store.get_poly_height()?;
        let mut start = stored.max(start_height);
        if start == 0 {
            start = epoch_start;
        }
        info!(start, epoch_start, "poly manager initialized");

        let routines = Arc::new(Semaphore::new(config.routine_num));
        Ok(Arc::new(Self {
            config,
            store,
            palette,
            poly,
            senders: Arc::new(senders),
            routines,
            sync_height: AtomicU32::new(start),
            keepers: Mutex::new(keepers),
        }))
    }

    pub fn spawn(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let rx = shutdown.subscribe();
        vec![tokio::spawn(async move { self.monitor_chain(rx).await })]
    }

    async fn monitor_chain(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(PLT_MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => return,
            }

            let node_height = match self.poly.get_current_block_height().await {
                Ok(h) => h,
                Err(e) => {
                    info!("cannot get poly node height: {e}");
                    continue;
                }
            };
            metrics::set_poly_node_height(node_height);

            // events at h anchor against the header at h + 1
            while self.sync_height.load(Ordering::SeqCst) + 1 < node_height {
                if shutdown.try_recv().is_ok() {
                    return;
                }
                let height = self.sync_height.load(Ordering::SeqCst);
                if self.handle_new_block(height).await {
                    if let Err(e) = self.store.update_poly_height(height + 1) {
                        error!("persist poly checkpoint {height}: {e}");
                    }
                    self.sync_height.store(height + 1, Ordering::SeqCst);
                    metrics::set_poly_sync_height(height + 1);
                    debug!(height, node_height, "poly block handled");
                } else {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Handle one Poly height: rotate bookkeepers when announced, then relay
    /// every matching cross-chain event. All submissions of the block finish
    /// before the checkpoint advances.
    async fn handle_new_block(&self, height: u32) -> bool {
        let header = match self.poly.get_header_by_height(height + 1).await {
            Ok(header) => header,
            Err(e) => {
                info!("fetch poly header {}: {e}", height + 1);
                return false;
            }
        };
        let info = match header.vbft_block_info() {
            Ok(info) => info,
            Err(e) => {
                error!("undecodable consensus payload at {}: {e}", height + 1);
                return false;
            }
        };

        if let Some(chain_config) = &info.new_chain_config {
            if let Err(e) = self.change_book_keeper(&header, &chain_config.peers).await {
                error!("change bookkeeper at {}: {e}", height + 1);
                return false;
            }
        }

        match self.handle_cross_chain_events(height, &header).await {
            Ok(()) => true,
            Err(e) => {
                error!("cross-chain events at {height}: {e}");
                false
            }
        }
    }

    /// Push the announced bookkeeper set into the Palette data contract and
    /// refresh the local keeper cache from it.
    async fn change_book_keeper(
        &self,
        header: &PolyHeader,
        peers: &[crate::chain::poly::VbftPeerStakeInfo],
    ) -> RelayerResult<()> {
        let (_, pub_key_list) = assemble_pub_key_list(peers)?;
        let sigs = assemble_header_sigs(&header.sig_data)?;

        let mut tx_data = id(CHANGE_BOOK_KEEPER_SIG).to_vec();
        tx_data.extend(abi::encode(&[
            Token::Bytes(header.unsigned_bytes()),
            Token::Bytes(pub_key_list),
            Token::Bytes(sigs),
        ]));

        let sender = self.senders.select();
        let tx_hash = sender
            .send_tx_to_palette(self.palette.eccd_contract(), "changeBookKeeper", tx_data)
            .await?;
        info!(
            ?tx_hash,
            poly_height = header.height,
            "bookkeeper rotation committed on palette"
        );
        metrics::inc_bookkeeper_rotations();

        let keeper_bytes = self.palette.get_cur_epoch_con_pubkey_bytes().await?;
        let mut keepers = self.keepers.lock().await;
        *keepers = bytes_to_valset(&keeper_bytes)?;
        Ok(())
    }

    /// Relay every `makeProof` notification of this block bound for the
    /// Palette side chain.
    async fn handle_cross_chain_events(
        &self,
        height: u32,
        header: &PolyHeader,
    ) -> RelayerResult<()> {
        let events = self.poly.get_smart_contract_events_by_height(height).await?;
        if events.is_empty() {
            return Ok(());
        }

        // anchor the event header when it predates the keeper epoch palette
        // currently trusts
        let epoch_start = self.palette.get_cur_epoch_start_height().await?;
        let is_current = epoch_start < header.height;
        let (anchor, header_proof) = if !is_current {
            let anchor = self.poly.get_header_by_height(epoch_start + 1).await?;
            let proof = self
                .poly
                .get_merkle_proof(header.height, epoch_start + 1)
                .await?;
            (Some(anchor), proof)
        } else {
            (None, Vec::new())
        };

        let sig_source = anchor.as_ref().unwrap_or(header);
        let sigs = assemble_header_sigs(&sig_source.sig_data)?;
        if !self.preflight_quorum(sig_source, &sigs).await {
            // the keeper cache may trail a rotation committed elsewhere
            self.refresh_keepers().await;
            return Err(RelayerError::Signature(format!(
                "poly header {} lacks a bookkeeper quorum",
                sig_source.height
            )));
        }

        let mut jobs = Vec::new();
        for event in events {
            for notify in &event.notify {
                if !notify
                    .contract_address
                    .eq_ignore_ascii_case(&self.config.poly.entrance_contract_address)
                {
                    continue;
                }
                let Some(proof_key) = parse_make_proof_states(
                    &notify.states,
                    self.config.palette.side_chain_id,
                ) else {
                    continue;
                };

                let audit_path = self.poly.get_cross_states_proof(height, &proof_key).await?;
                match self.screen_inbound(&audit_path) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        error!(poly_tx = %event.tx_hash, "bad audit path: {e}");
                        continue;
                    }
                }

                jobs.push(self.spawn_commit(
                    audit_path,
                    header.unsigned_bytes(),
                    header_proof.clone(),
                    anchor.as_ref().map(|a| a.unsigned_bytes()).unwrap_or_default(),
                    sigs.clone(),
                    event.tx_hash.clone(),
                ));
            }
        }

        for job in jobs {
            if let Err(e) = job.await {
                error!("commit task panicked: {e}");
            }
        }
        Ok(())
    }

    /// Decode the audit-path leaf and apply the inbound allow-list.
    fn screen_inbound(&self, audit_path: &[u8]) -> RelayerResult<bool> {
        let value = crate::codec::cross_tx::audit_path_value(audit_path)?;
        let merkle_value = crate::codec::ToMerkleValue::from_bytes(&value)?;
        let param = &merkle_value.make_tx_param;
        if param.to_contract.len() != 20 {
            return Err(RelayerError::Codec(format!(
                "palette target contract must be 20 bytes, got {}",
                param.to_contract.len()
            )));
        }
        let target = Address::from_slice(&param.to_contract);
        Ok(self
            .config
            .target_contracts
            .check_inbound(merkle_value.from_chain_id, target))
    }

    async fn refresh_keepers(&self) {
        match self.palette.get_cur_epoch_con_pubkey_bytes().await {
            Ok(bytes) => match bytes_to_valset(&bytes) {
                Ok(fresh) => *self.keepers.lock().await = fresh,
                Err(e) => error!("keeper set decode: {e}"),
            },
            Err(e) => error!("keeper set refresh: {e}"),
        }
    }

    /// Defensive local check; on-chain verification stays authoritative.
    async fn preflight_quorum(&self, header: &PolyHeader, sigs: &[u8]) -> bool {
        let keepers = self.keepers.lock().await;
        let m = quorum_m(keepers.len());
        match verify_sig(header.hash(), sigs, &keepers, m) {
            Ok(()) => true,
            Err(e) => {
                warn!(poly_height = header.height, "quorum pre-flight failed: {e}");
                false
            }
        }
    }

    fn spawn_commit(
        &self,
        audit_path: Vec<u8>,
        raw_header: Vec<u8>,
        raw_proof: Vec<u8>,
        raw_anchor: Vec<u8>,
        sigs: Vec<u8>,
        poly_tx_hash: String,
    ) -> JoinHandle<()> {
        let senders = self.senders.clone();
        let routines = self.routines.clone();
        let eccm = self.palette.eccm_contract();
        tokio::spawn(async move {
            let _permit = match routines.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let mut tx_data = id(VERIFY_AND_EXECUTE_SIG).to_vec();
            tx_data.extend(abi::encode(&[
                Token::Bytes(audit_path),
                Token::Bytes(raw_header),
                Token::Bytes(raw_proof),
                Token::Bytes(raw_anchor),
                Token::Bytes(sigs),
            ]));

            let sender = senders.select();
            match sender
                .send_tx_to_palette(eccm, "verifyHeaderAndExecuteTx", tx_data)
                .await
            {
                Ok(tx_hash) => {
                    metrics::inc_poly_txs_relayed();
                    info!(poly_tx = %poly_tx_hash, palette_tx = ?tx_hash, "cross-chain tx executed");
                }
                Err(e) => {
                    error!(poly_tx = %poly_tx_hash, "execute on palette: {e}");
                }
            }
        })
    }
}

/// Pull the proof key out of a `makeProof` notification bound for our side
/// chain. States: `[method, _, toChainId, _, _, key]`.
fn parse_make_proof_states(states: &serde_json::Value, side_chain_id: u64) -> Option<String> {
    let states = states.as_array()?;
    if states.first()?.as_str()? != "makeProof" {
        return None;
    }
    let to_chain = states.get(2).and_then(state_as_u64)?;
    if to_chain != side_chain_id {
        return None;
    }
    Some(states.get(5)?.as_str()?.to_string())
}

fn state_as_u64(state: &serde_json::Value) -> Option<u64> {
    state
        .as_u64()
        .or_else(|| state.as_f64().map(|f| f as u64))
        .or_else(|| state.as_str().and_then(|s| s.parse().ok()))
}

/// Sort the announced consensus keys and produce both the keeper addresses
/// and the concatenated uncompressed-key list the data contract verifies.
pub fn assemble_pub_key_list(
    peers: &[crate::chain::poly::VbftPeerStakeInfo],
) -> RelayerResult<(Vec<Address>, Vec<u8>)> {
    let mut compressed_keys = Vec::with_capacity(peers.len());
    for peer in peers {
        let raw = hex::decode(&peer.id)
            .map_err(|e| RelayerError::Codec(format!("peer key hex: {e}")))?;
        // consensus keys carry a two-byte scheme/curve prefix
        let key = if raw.len() == 35 { raw[2..].to_vec() } else { raw };
        compressed_keys.push(key);
    }
    compressed_keys.sort();

    let mut keepers = Vec::with_capacity(compressed_keys.len());
    let mut pub_key_list = Vec::new();
    for compressed in &compressed_keys {
        let key = PublicKey::from_sec1_bytes(compressed)
            .map_err(|e| RelayerError::Codec(format!("peer key: {e}")))?;
        let uncompressed = key.to_encoded_point(false);
        let bytes = uncompressed.as_bytes();
        pub_key_list.extend_from_slice(bytes);
        let digest = keccak256(&bytes[1..]);
        keepers.push(Address::from_slice(&digest[12..]));
    }
    Ok((keepers, pub_key_list))
}

/// Normalize every header signature to the Ethereum recoverable form and
/// concatenate them.
pub fn assemble_header_sigs(sig_data: &[Vec<u8>]) -> RelayerResult<Vec<u8>> {
    let mut sigs = Vec::with_capacity(sig_data.len());
    for sig in sig_data {
        sigs.push(convert_to_eth_compatible(sig)?);
    }
    assemble_multi_sigs(&sigs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn make_proof_states_filtering() {
        let states = json!(["makeProof", 2, 101, "aa", "bb", "00112233"]);
        assert_eq!(
            parse_make_proof_states(&states, 101),
            Some("00112233".to_string())
        );
        // wrong target chain
        assert_eq!(parse_make_proof_states(&states, 7), None);
        // wrong method
        let states = json!(["btcTxToRelay", 2, 101, "aa", "bb", "00112233"]);
        assert_eq!(parse_make_proof_states(&states, 101), None);
        // chain id served as a string still matches
        let states = json!(["makeProof", 2, "101", "aa", "bb", "00112233"]);
        assert_eq!(
            parse_make_proof_states(&states, 101),
            Some("00112233".to_string())
        );
    }

    #[test]
    fn pub_key_list_is_sorted_and_uncompressed() {
        use ethers::core::k256::SecretKey;

        let mut peers = Vec::new();
        for i in 1u8..=4 {
            let secret = SecretKey::from_slice(&[i; 32]).unwrap();
            let compressed = secret.public_key().to_encoded_point(true);
            peers.push(crate::chain::poly::VbftPeerStakeInfo {
                index: i as u32,
                id: format!("1202{}", hex::encode(compressed.as_bytes())),
            });
        }

        let (keepers, pub_key_list) = assemble_pub_key_list(&peers).unwrap();
        assert_eq!(keepers.len(), 4);
        // four uncompressed keys, 65 bytes each
        assert_eq!(pub_key_list.len(), 4 * 65);
        assert!(pub_key_list.chunks(65).all(|c| c[0] == 0x04));

        // input order must not matter
        peers.reverse();
        let (keepers_rev, pub_key_list_rev) = assemble_pub_key_list(&peers).unwrap();
        assert_eq!(keepers, keepers_rev);
        assert_eq!(pub_key_list, pub_key_list_rev);
    }

    #[test]
    fn header_sigs_require_65_bytes() {
        assert!(assemble_header_sigs(&[vec![0u8; 64]]).is_err());
        let blob = assemble_header_sigs(&[vec![0u8; 65], vec![1u8; 65]]).unwrap();
        assert_eq!(blob.len(), 130);
    }
}
