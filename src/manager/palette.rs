//! Palette→Poly manager: mirrors Palette headers into the relay chain's
//! header-sync contract at epoch boundaries and relays lock events with
//! storage proofs into the cross-chain manager.

use crate::chain::{PaletteClient, PolyClient};
use crate::codec::cross_tx::{encode_big_int, CrossTransfer, MakeTxParam};
use crate::codec::istanbul::{ecrecover_proposer, extract_istanbul_extra, EvmHeader};
use crate::codec::keys::{
    bytes_to_u64, format_storage_key, get_mapping_key, CONSENSUS_PEER,
    CONSENSUS_PEER_BLOCK_HEIGHT, DONE_TX,
};
use crate::codec::valset::{bytes_to_valset, valset_changed};
use crate::config::{ServiceConfig, PLT_MONITOR_INTERVAL};
use crate::error::{RelayerError, RelayerResult};
use crate::metrics;
use crate::store::Store;

use ethers::types::{Address, U256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a header commit may poll for relay-chain confirmation before the
/// iteration is abandoned and retried.
const HEADER_CONFIRM_TIMEOUT: Duration = Duration::from_secs(300);

/// One validator-set snapshot.
#[derive(Debug, Clone)]
struct PltEpoch {
    height: u64,
    valset: Vec<Address>,
    raw: Vec<u8>,
}

/// State owned by the header loop; the other loops never touch it.
#[derive(Default)]
struct EpochState {
    last_epoch: Option<PltEpoch>,
    cur_header: Option<PltEpoch>,
}

pub struct PaletteManager {
    config: ServiceConfig,
    store: Store,
    palette: Arc<PaletteClient>,
    poly: Arc<PolyClient>,
    sync_header_height: AtomicU64,
    deposit_height: AtomicU64,
    epoch: Mutex<EpochState>,
}

impl PaletteManager {
    pub async fn new(
        config: ServiceConfig,
        start_height: u64,
        force_height: u64,
        palette: Arc<PaletteClient>,
        poly: Arc<PolyClient>,
        store: Store,
    ) -> RelayerResult<Arc<Self>> {
        if config.target_contracts.is_empty() {
            return Err(RelayerError::Config("no target contracts".into()));
        }

        let manager = Self {
            config,
            store,
            palette,
            poly,
            sync_header_height: AtomicU64::new(0),
            deposit_height: AtomicU64::new(0),
            epoch: Mutex::new(EpochState::default()),
        };
        manager.init(start_height, force_height).await?;
        Ok(Arc::new(manager))
    }

    /// Discover the last committed epoch on the relay chain and settle the
    /// working height. Aborts when the genesis header was never synced.
    async fn init(&self, start_height: u64, force_height: u64) -> RelayerResult<()> {
        let last_epoch_height = self.find_last_epoch_height().await?;
        if last_epoch_height == 0 {
            return Err(RelayerError::GenesisNotSynced);
        }
        self.fetch_last_epoch(last_epoch_height).await?;

        let stored = self.store.get_palette_height()?.max(start_height);
        let start = resolve_start_height(stored, last_epoch_height, force_height);
        self.sync_header_height.store(start, Ordering::SeqCst);
        self.deposit_height.store(start, Ordering::SeqCst);
        info!(start, "palette manager initialized");
        Ok(())
    }

    async fn find_last_epoch_height(&self) -> RelayerResult<u64> {
        let key = format_storage_key(
            CONSENSUS_PEER_BLOCK_HEIGHT,
            self.side_chain_id(),
            None,
        );
        let raw = self
            .poly
            .get_storage(crate::chain::poly::HEADER_SYNC_CONTRACT, &key)
            .await?;
        Ok(bytes_to_u64(&raw))
    }

    async fn fetch_last_epoch(&self, height: u64) -> RelayerResult<()> {
        let key = format_storage_key(CONSENSUS_PEER, self.side_chain_id(), None);
        let raw = self
            .poly
            .get_storage(crate::chain::poly::HEADER_SYNC_CONTRACT, &key)
            .await?;
        let valset = bytes_to_valset(&raw)?;
        let mut epoch = self.epoch.lock().await;
        epoch.last_epoch = Some(PltEpoch {
            height,
            valset,
            raw,
        });
        Ok(())
    }

    /// Spawn the three loops. Each observes the shutdown signal every tick.
    pub fn spawn(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let chain = {
            let manager = self.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { manager.monitor_chain(rx).await })
        };
        let deposit = {
            let manager = self.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { manager.monitor_deposit(rx).await })
        };
        let check = {
            let manager = self.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { manager.check_deposit(rx).await })
        };
        vec![chain, deposit, check]
    }

    /// Header-sync loop: walk every Palette block, commit epoch-boundary
    /// headers to the relay chain, scan lock events, advance the checkpoint.
    async fn monitor_chain(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(PLT_MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => return,
            }

            let node_height = match self.palette.get_node_height().await {
                Ok(h) => h,
                Err(e) => {
                    info!("cannot get palette node height: {e}");
                    continue;
                }
            };
            metrics::set_palette_node_height(node_height);

            while self.sync_header_height.load(Ordering::SeqCst) < node_height {
                if shutdown.try_recv().is_ok() {
                    return;
                }
                let height = self.sync_header_height.load(Ordering::SeqCst);
                if self.handle_new_block(height, &mut shutdown).await {
                    if let Err(e) = self.store.update_palette_height(height + 1) {
                        error!("persist palette checkpoint {height}: {e}");
                    }
                    self.sync_header_height.store(height + 1, Ordering::SeqCst);
                    metrics::set_palette_sync_height(height + 1);
                    debug!(height, node_height, "palette block handled");
                } else {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// A failed header commit aborts the iteration; failed event scans do
    /// not gate header advance.
    async fn handle_new_block(&self, height: u64, shutdown: &mut broadcast::Receiver<()>) -> bool {
        if self.past_last_epoch(height).await {
            if let Err(e) = self.fetch_block_header(height).await {
                error!("fetch palette header {height}: {e}");
                return false;
            }
            if self.is_epoch().await && !self.commit_header(shutdown).await {
                error!("commit palette header {height} failed");
                return false;
            }
        }

        if let Err(e) = self.fetch_lock_events(height).await {
            error!("fetch lock events at {height}: {e}");
        }
        true
    }

    async fn past_last_epoch(&self, height: u64) -> bool {
        let epoch = self.epoch.lock().await;
        match &epoch.last_epoch {
            Some(last) => height > last.height,
            None => false,
        }
    }

    /// Cache the header at `height`, reusing the previous fetch when the
    /// node serves identical bytes.
    async fn fetch_block_header(&self, height: u64) -> RelayerResult<()> {
        {
            let epoch = self.epoch.lock().await;
            if let Some(cur) = &epoch.cur_header {
                if cur.height == height {
                    return Ok(());
                }
            }
        }

        let (block, raw) = self.palette.header_json(height).await?;
        {
            let epoch = self.epoch.lock().await;
            if let Some(cur) = &epoch.cur_header {
                if cur.raw == raw {
                    return Ok(());
                }
            }
        }

        let extra = extract_istanbul_extra(&block.extra_data)?;
        match EvmHeader::from_block(&block).and_then(|h| ecrecover_proposer(&h, &extra)) {
            Ok(proposer) if !extra.validators.contains(&proposer) => {
                warn!(height, ?proposer, "proposer seal not in the validator set");
            }
            Err(e) => debug!(height, "proposer recovery skipped: {e}"),
            _ => {}
        }

        let mut epoch = self.epoch.lock().await;
        epoch.cur_header = Some(PltEpoch {
            height,
            valset: extra.validators,
            raw,
        });
        Ok(())
    }

    async fn is_epoch(&self) -> bool {
        let epoch = self.epoch.lock().await;
        match (&epoch.cur_header, &epoch.last_epoch) {
            (Some(cur), Some(last)) => valset_changed(&cur.valset, &last.valset),
            _ => false,
        }
    }

    /// Commit the cached header to the relay chain and wait until the chain
    /// height passes the inclusion height; only then promote the epoch.
    async fn commit_header(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let (cur_height, cur_raw) = {
            let epoch = self.epoch.lock().await;
            match &epoch.cur_header {
                Some(cur) => (cur.height, cur.raw.clone()),
                None => return false,
            }
        };

        let tx_hash = match self
            .poly
            .sync_block_header(
                self.side_chain_id(),
                self.poly.signer_address(),
                &[cur_raw],
            )
            .await
        {
            Ok(hash) => hash,
            Err(e) => {
                error!("sync block header: {e}");
                return false;
            }
        };

        if !self.wait_header_confirmed(&tx_hash, shutdown).await {
            return false;
        }

        let mut epoch = self.epoch.lock().await;
        epoch.last_epoch = epoch.cur_header.clone();
        metrics::inc_headers_committed();
        info!(
            poly_tx = %tx_hash,
            header_height = cur_height,
            "palette epoch header confirmed on poly"
        );
        true
    }

    /// The landmark is the relay-chain height passing the tx's inclusion
    /// height. Bounded by [`HEADER_CONFIRM_TIMEOUT`] and the exit signal.
    async fn wait_header_confirmed(
        &self,
        tx_hash: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + HEADER_CONFIRM_TIMEOUT;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut included_at: u32 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => return false,
            }
            if tokio::time::Instant::now() > deadline {
                warn!(poly_tx = %tx_hash, "header confirmation timed out");
                return false;
            }
            if included_at == 0 {
                included_at = self
                    .poly
                    .get_block_height_by_tx_hash(tx_hash)
                    .await
                    .unwrap_or(0);
            } else if let Ok(current) = self.poly.get_current_block_height().await {
                if current > included_at {
                    return true;
                }
            }
        }
    }

    /// Scan lock events at `height`, drop the ones the relay chain already
    /// applied, and durably enqueue the rest.
    async fn fetch_lock_events(&self, height: u64) -> RelayerResult<()> {
        let events = self.palette.filter_cross_chain_events(height).await?;
        for event in events {
            if !self
                .config
                .target_contracts
                .check_outbound(event.to_chain_id, event.proxy_or_asset_contract)
            {
                continue;
            }

            let param = match MakeTxParam::from_bytes(&event.raw_data) {
                Ok(param) => param,
                Err(e) => {
                    error!("malformed lock event payload at {height}: {e}");
                    continue;
                }
            };
            if self.already_done(&param).await {
                continue;
            }

            // event ids are uint256; tolerate oversized encodings
            let index_bytes = if event.tx_id.len() > 32 {
                &event.tx_id[event.tx_id.len() - 32..]
            } else {
                &event.tx_id[..]
            };
            let cross_tx = CrossTransfer {
                tx_index: encode_big_int(U256::from_big_endian(index_bytes)),
                tx_id: event.raw_tx_hash.as_bytes().to_vec(),
                to_chain: event.to_chain_id as u32,
                value: event.raw_data.clone(),
                height,
            };
            if let Err(e) = self.store.put_retry(&cross_tx.to_bytes()) {
                error!("enqueue cross transfer: {e}");
            } else {
                metrics::inc_deposits_scanned();
                info!(height, tx_index = %cross_tx.tx_index, "lock event enqueued");
            }
        }
        Ok(())
    }

    /// Has the relay chain already recorded this transfer as done?
    async fn already_done(&self, param: &MakeTxParam) -> bool {
        let key = format_storage_key(DONE_TX, self.side_chain_id(), Some(&param.cross_chain_id));
        match self
            .poly
            .get_storage(crate::chain::poly::CROSS_CHAIN_MANAGER_CONTRACT, &key)
            .await
        {
            Ok(raw) if !raw.is_empty() => {
                debug!(
                    cross_chain_id = %hex::encode(&param.cross_chain_id),
                    "transfer already on poly"
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                // fail open: the submitter's idempotency branch covers it
                info!("done-tx lookup failed: {e}");
                false
            }
        }
    }

    /// Proof-submission loop.
    async fn monitor_deposit(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(PLT_MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => return,
            }
            while self.deposit_height.load(Ordering::SeqCst)
                < self.sync_header_height.load(Ordering::SeqCst)
            {
                if shutdown.try_recv().is_ok() {
                    return;
                }
                let ref_height = self.deposit_height.load(Ordering::SeqCst);
                if let Err(e) = self.handle_deposit_events(ref_height).await {
                    error!("handle deposits at {ref_height}: {e}");
                }
                self.deposit_height.store(ref_height + 1, Ordering::SeqCst);
            }
        }
    }

    /// Submit proofs for every retry-table record mature at `ref_height`.
    async fn handle_deposit_events(&self, ref_height: u64) -> RelayerResult<()> {
        let retry_list = self.store.get_all_retry()?;
        let distance = self.config.safe_block_distance();

        for raw in retry_list {
            let cross_tx = match CrossTransfer::from_bytes(&raw) {
                Ok(tx) => tx,
                Err(e) => {
                    error!("undecodable retry record: {e}");
                    continue;
                }
            };

            if !proof_mature(ref_height, cross_tx.height, distance) {
                info!(
                    tx_index = %cross_tx.tx_index,
                    ref_height,
                    distance,
                    event_height = cross_tx.height,
                    "deposit not yet mature"
                );
                continue;
            }
            let safe_height = ref_height - 1;

            let (proof, header_json) = match self.get_proof(&cross_tx, safe_height).await {
                Ok(v) => v,
                Err(e) => {
                    error!(tx_index = %cross_tx.tx_index, "get proof: {e}");
                    continue;
                }
            };

            match self
                .poly
                .import_outer_transfer(
                    self.side_chain_id(),
                    &cross_tx.value,
                    safe_height as u32,
                    &proof,
                    self.poly.signer_address(),
                    &header_json,
                )
                .await
            {
                Ok(poly_tx_hash) => {
                    if let Err(e) = self.store.put_check(&poly_tx_hash, &raw) {
                        error!("record check entry: {e}");
                    }
                    if let Err(e) = self.store.delete_retry(&raw) {
                        error!("drop retry entry: {e}");
                    }
                    metrics::inc_deposits_submitted();
                    info!(
                        poly_tx = %poly_tx_hash,
                        tx_index = %cross_tx.tx_index,
                        safe_height,
                        "deposit proof submitted"
                    );
                }
                Err(RelayerError::Submit(kind)) => match kind {
                    crate::error::SubmitErrorKind::AlreadyDone => {
                        info!(tx_index = %cross_tx.tx_index, "transfer already on poly");
                        if let Err(e) = self.store.delete_retry(&raw) {
                            error!("drop retry entry: {e}");
                        }
                    }
                    crate::error::SubmitErrorKind::InsufficientFunds => {
                        info!(tx_index = %cross_tx.tx_index, "relayer funds exhausted, will retry");
                    }
                    crate::error::SubmitErrorKind::Other => {
                        error!(tx_index = %cross_tx.tx_index, "submit rejected, will retry");
                    }
                },
                Err(e) => {
                    error!(tx_index = %cross_tx.tx_index, "import outer transfer: {e}");
                }
            }
        }
        Ok(())
    }

    /// Storage proof of the event key plus the header it is proven against.
    async fn get_proof(
        &self,
        cross_tx: &CrossTransfer,
        height: u64,
    ) -> RelayerResult<(Vec<u8>, Vec<u8>)> {
        let storage_key = get_mapping_key(&cross_tx.tx_index)?;
        let proof = self
            .palette
            .get_proof(self.palette.eccd_contract(), storage_key, height)
            .await?;
        let (_, header_json) = self.palette.header_json(height).await?;
        Ok((proof, header_json))
    }

    /// Confirmation loop over the check table.
    async fn check_deposit(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(PLT_MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => return,
            }
            if let Err(e) = self.check_lock_events().await {
                error!("check lock events: {e}");
            }
        }
    }

    async fn check_lock_events(&self) -> RelayerResult<()> {
        let check_list = self.store.get_all_check()?;
        metrics::set_check_depth(check_list.len());
        for (poly_tx_hash, raw) in check_list {
            let event = match self.poly.get_smart_contract_event(&poly_tx_hash).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    error!(poly_tx = %poly_tx_hash, "query event: {e}");
                    continue;
                }
            };

            if event.state != 1 {
                error!(poly_tx = %poly_tx_hash, "poly tx failed, requeueing transfer");
                if let Err(e) = self.store.put_retry(&raw) {
                    error!("requeue transfer: {e}");
                }
            } else {
                metrics::inc_deposits_confirmed();
                info!(poly_tx = %poly_tx_hash, "poly tx confirmed");
            }
            if let Err(e) = self.store.delete_check(&poly_tx_hash) {
                error!("drop check entry: {e}");
            }
        }
        Ok(())
    }

    fn side_chain_id(&self) -> u64 {
        self.config.palette.side_chain_id
    }
}

/// A proof at `ref_height − 1` is only built once the reference height has
/// outrun the event by more than the fork-safety distance.
fn proof_mature(ref_height: u64, event_height: u64, distance: u64) -> bool {
    ref_height.saturating_sub(distance) > event_height
}

/// Start from whichever is further along, the stored checkpoint or the last
/// epoch committed on the relay chain; a lower force height wins over both.
fn resolve_start_height(stored: u64, last_epoch_height: u64, force_height: u64) -> u64 {
    let start = stored.max(last_epoch_height);
    if force_height > 0 && force_height < start {
        force_height
    } else {
        start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_gates_submission() {
        let h = 14_400u64;
        // three blocks past the event: skipped
        assert!(!proof_mature(h + 3, h, 6));
        // exactly distance past: still skipped
        assert!(!proof_mature(h + 6, h, 6));
        // one beyond the distance: submitted with safe height h + 6
        assert!(proof_mature(h + 7, h, 6));
    }

    #[test]
    fn safe_height_trails_reference() {
        let h = 14_400u64;
        let ref_height = h + 7;
        assert!(proof_mature(ref_height, h, 6));
        let safe_height = ref_height - 1;
        assert!(safe_height - h >= 6);
    }

    #[test]
    fn force_height_only_lowers() {
        // stored checkpoint behind the epoch: epoch wins
        assert_eq!(resolve_start_height(100, 500, 0), 500);
        // stored checkpoint ahead: checkpoint wins
        assert_eq!(resolve_start_height(900, 500, 0), 900);
        // force below the working height rewinds
        assert_eq!(resolve_start_height(900, 500, 200), 200);
        // force at or above the working height has no effect
        assert_eq!(resolve_start_height(900, 500, 900), 900);
        assert_eq!(resolve_start_height(900, 500, 2000), 900);
    }
}
