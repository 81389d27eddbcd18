//! Storage-key derivation and address-format conversions.

use crate::error::{RelayerError, RelayerResult};

use ethers::types::Address;
use ethers::utils::keccak256;
use sha2::{Digest, Sha256};

/// Key prefixes of the header-sync and cross-chain-manager native contracts.
pub const CONSENSUS_PEER: &str = "consensusPeer";
pub const CONSENSUS_PEER_BLOCK_HEIGHT: &str = "consensusPeerBlockHeight";
pub const DONE_TX: &str = "doneTx";

/// Storage slot of the proof-mapping on the data contract; the per-event key
/// is `keccak256(pad32(txIndex) ‖ pad32(slot))`.
const PROOF_MAP_SLOT: &str = "01";

pub fn left_pad_bytes(slice: &[u8], len: usize) -> Vec<u8> {
    if slice.len() >= len {
        return slice.to_vec();
    }
    let mut padded = vec![0u8; len];
    padded[len - slice.len()..].copy_from_slice(slice);
    padded
}

fn mapping_key_at(position1: &str, position2: &str) -> RelayerResult<[u8; 32]> {
    let p1 = hex::decode(position1)
        .map_err(|e| RelayerError::Codec(format!("bad mapping position {position1}: {e}")))?;
    let p2 = hex::decode(position2)
        .map_err(|e| RelayerError::Codec(format!("bad mapping position {position2}: {e}")))?;
    let mut preimage = left_pad_bytes(&p1, 32);
    preimage.extend_from_slice(&left_pad_bytes(&p2, 32));
    Ok(keccak256(preimage))
}

/// Storage key addressing the proof entry of one cross-chain event.
pub fn get_mapping_key(tx_index: &str) -> RelayerResult<[u8; 32]> {
    mapping_key_at(tx_index, PROOF_MAP_SLOT)
}

/// Key layout of the Poly native contracts: prefix bytes, the side-chain id
/// in little-endian, then optional content.
pub fn format_storage_key(prefix: &str, chain_id: u64, content: Option<&[u8]>) -> Vec<u8> {
    let mut key = prefix.as_bytes().to_vec();
    key.extend_from_slice(&chain_id.to_le_bytes());
    if let Some(content) = content {
        key.extend_from_slice(content);
    }
    key
}

/// Decode a little-endian height value; short reads are zero-extended the
/// way the storage contract pads them.
pub fn bytes_to_u64(bz: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bz.len().min(8);
    buf[..n].copy_from_slice(&bz[..n]);
    u64::from_le_bytes(buf)
}

const ADDR_VERSION: u8 = 0x17;

/// Render a 20-byte address in the Poly text form: base58 over
/// `version ‖ addr ‖ sha256d-checksum`.
pub fn addr_to_base58(addr: Address) -> String {
    let mut data = vec![ADDR_VERSION];
    data.extend_from_slice(addr.as_bytes());
    let checksum = sha256d(&data);
    data.extend_from_slice(&checksum[..4]);
    bs58::encode(data).into_string()
}

/// Parse a Poly base58 address back to its 20 bytes.
pub fn addr_from_base58(s: &str) -> RelayerResult<Address> {
    let data = bs58::decode(s)
        .into_vec()
        .map_err(|e| RelayerError::Codec(format!("bad base58 address: {e}")))?;
    if data.len() != 25 || data[0] != ADDR_VERSION {
        return Err(RelayerError::Codec("malformed base58 address".into()));
    }
    let checksum = sha256d(&data[..21]);
    if checksum[..4] != data[21..] {
        return Err(RelayerError::Codec("base58 address checksum mismatch".into()));
    }
    Ok(Address::from_slice(&data[1..21]))
}

fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_padding() {
        assert_eq!(left_pad_bytes(&[0x03], 4), vec![0, 0, 0, 3]);
        assert_eq!(left_pad_bytes(&[1, 2, 3, 4, 5], 4), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn mapping_key_matches_padded_preimage() {
        let key = get_mapping_key("03").unwrap();
        let mut preimage = vec![0u8; 31];
        preimage.push(0x03);
        preimage.extend_from_slice(&[0u8; 31]);
        preimage.push(0x01);
        assert_eq!(key, keccak256(preimage));
    }

    #[test]
    fn mapping_key_rejects_odd_hex() {
        assert!(get_mapping_key("3").is_err());
        assert!(get_mapping_key("zz").is_err());
    }

    #[test]
    fn storage_key_layout() {
        let key = format_storage_key(CONSENSUS_PEER, 101, None);
        assert_eq!(&key[..CONSENSUS_PEER.len()], CONSENSUS_PEER.as_bytes());
        assert_eq!(&key[CONSENSUS_PEER.len()..], &101u64.to_le_bytes());

        let key = format_storage_key(DONE_TX, 101, Some(&[0xAA, 0xBB]));
        assert!(key.ends_with(&[0xAA, 0xBB]));
    }

    #[test]
    fn height_bytes_decode() {
        assert_eq!(bytes_to_u64(&[]), 0);
        assert_eq!(bytes_to_u64(&[0x39, 0x10]), 0x1039);
        assert_eq!(bytes_to_u64(&[1, 0, 0, 0, 0, 0, 0, 0, 9, 9]), 1);
    }

    #[test]
    fn base58_round_trip() {
        let addr: Address = "0x5593b2b8dc63d0ed68aa8f885707b2dc5787e391".parse().unwrap();
        let text = addr_to_base58(addr);
        assert_eq!(addr_from_base58(&text).unwrap(), addr);
    }

    #[test]
    fn base58_rejects_tampering() {
        let addr: Address = "0x5593b2b8dc63d0ed68aa8f885707b2dc5787e391".parse().unwrap();
        let mut text = addr_to_base58(addr);
        text.replace_range(1..2, if &text[1..2] == "1" { "2" } else { "1" });
        assert!(addr_from_base58(&text).is_err());
    }
}
