//! Istanbul (IBFT) header plumbing: extra-data extraction, the filtered
//! header hash, and seal signer recovery.

use crate::error::{RelayerError, RelayerResult};

use ethers::types::{Address, Block, Signature, H256, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::{Rlp, RlpStream};

/// Fixed-size prefix of `header.extra_data` reserved for proposer vanity.
pub const ISTANBUL_EXTRA_VANITY: usize = 32;

/// Message code appended to a block hash before committers sign it.
const COMMIT_MSG_CODE: u8 = 0x02;

/// Decoded Istanbul consensus fields carried past the extra-data vanity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IstanbulExtra {
    pub validators: Vec<Address>,
    pub seal: Vec<u8>,
    pub committed_seal: Vec<Vec<u8>>,
}

/// RLP-decode the Istanbul extra from raw `extra_data` bytes. An empty
/// validator list is rejected: no Istanbul chain produces one, and the epoch
/// comparison downstream would silently misfire on it.
pub fn extract_istanbul_extra(extra_data: &[u8]) -> RelayerResult<IstanbulExtra> {
    if extra_data.len() < ISTANBUL_EXTRA_VANITY {
        return Err(RelayerError::Codec(format!(
            "extra-data shorter than the {ISTANBUL_EXTRA_VANITY}-byte vanity"
        )));
    }
    let rlp = Rlp::new(&extra_data[ISTANBUL_EXTRA_VANITY..]);
    let err = |e| RelayerError::Codec(format!("istanbul extra rlp: {e}"));

    let validators_rlp = rlp.at(0).map_err(err)?;
    let mut validators = Vec::new();
    for item in validators_rlp.iter() {
        let data = item.data().map_err(err)?;
        if data.len() != 20 {
            return Err(RelayerError::Codec(format!(
                "istanbul validator must be 20 bytes, got {}",
                data.len()
            )));
        }
        validators.push(Address::from_slice(data));
    }
    if validators.is_empty() {
        return Err(RelayerError::Codec("istanbul extra has no validators".into()));
    }

    let seal = rlp.at(1).map_err(err)?.data().map_err(err)?.to_vec();
    let mut committed_seal = Vec::new();
    for item in rlp.at(2).map_err(err)?.iter() {
        committed_seal.push(item.data().map_err(err)?.to_vec());
    }

    Ok(IstanbulExtra {
        validators,
        seal,
        committed_seal,
    })
}

/// Re-encode an extra payload (vanity plus RLP list). Used when clearing
/// seal fields for the filtered hash, and by tests to synthesize headers.
pub fn encode_istanbul_extra(vanity: &[u8], extra: &IstanbulExtra) -> Vec<u8> {
    let mut out = vec![0u8; ISTANBUL_EXTRA_VANITY];
    let n = vanity.len().min(ISTANBUL_EXTRA_VANITY);
    out[..n].copy_from_slice(&vanity[..n]);

    let mut stream = RlpStream::new_list(3);
    stream.begin_list(extra.validators.len());
    for v in &extra.validators {
        stream.append(&v.as_bytes().to_vec());
    }
    stream.append(&extra.seal);
    stream.begin_list(extra.committed_seal.len());
    for s in &extra.committed_seal {
        stream.append(s);
    }
    out.extend_from_slice(&stream.out());
    out
}

/// The EVM header fields that participate in the Istanbul hashes, lifted out
/// of an rpc block.
#[derive(Debug, Clone)]
pub struct EvmHeader {
    pub parent_hash: H256,
    pub uncles_hash: H256,
    pub coinbase: Address,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub logs_bloom: [u8; 256],
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub timestamp: U256,
    pub extra_data: Vec<u8>,
    pub mix_hash: H256,
    pub nonce: [u8; 8],
    pub base_fee_per_gas: Option<U256>,
}

impl EvmHeader {
    pub fn from_block<T>(block: &Block<T>) -> RelayerResult<Self> {
        Ok(Self {
            parent_hash: block.parent_hash,
            uncles_hash: block.uncles_hash,
            coinbase: block.author.unwrap_or_default(),
            state_root: block.state_root,
            transactions_root: block.transactions_root,
            receipts_root: block.receipts_root,
            logs_bloom: block.logs_bloom.map(|b| b.0).unwrap_or([0u8; 256]),
            difficulty: block.difficulty,
            number: block
                .number
                .ok_or_else(|| RelayerError::Codec("block has no number".into()))?
                .as_u64(),
            gas_limit: block.gas_limit,
            gas_used: block.gas_used,
            timestamp: block.timestamp,
            extra_data: block.extra_data.to_vec(),
            mix_hash: block.mix_hash.unwrap_or_default(),
            nonce: block.nonce.map(|n| n.0).unwrap_or_default(),
            base_fee_per_gas: block.base_fee_per_gas,
        })
    }

    fn rlp_bytes(&self, extra_data: &[u8]) -> Vec<u8> {
        let field_count = if self.base_fee_per_gas.is_some() { 16 } else { 15 };
        let mut s = RlpStream::new_list(field_count);
        s.append(&self.parent_hash.as_bytes().to_vec());
        s.append(&self.uncles_hash.as_bytes().to_vec());
        s.append(&self.coinbase.as_bytes().to_vec());
        s.append(&self.state_root.as_bytes().to_vec());
        s.append(&self.transactions_root.as_bytes().to_vec());
        s.append(&self.receipts_root.as_bytes().to_vec());
        s.append(&self.logs_bloom.to_vec());
        append_uint(&mut s, self.difficulty);
        append_uint(&mut s, U256::from(self.number));
        append_uint(&mut s, self.gas_limit);
        append_uint(&mut s, self.gas_used);
        append_uint(&mut s, self.timestamp);
        s.append(&extra_data.to_vec());
        s.append(&self.mix_hash.as_bytes().to_vec());
        s.append(&self.nonce.to_vec());
        if let Some(base_fee) = self.base_fee_per_gas {
            append_uint(&mut s, base_fee);
        }
        s.out().to_vec()
    }

    /// Hash over the header with the committed seals cleared but the
    /// proposer seal kept; this is the block hash committers sign over.
    pub fn hash(&self) -> RelayerResult<H256> {
        let filtered = self.filtered_extra(true)?;
        Ok(H256::from(keccak256(self.rlp_bytes(&filtered))))
    }

    /// Hash over the header with every seal field cleared; the proposer
    /// signs this one.
    pub fn sig_hash(&self) -> RelayerResult<H256> {
        let filtered = self.filtered_extra(false)?;
        Ok(H256::from(keccak256(self.rlp_bytes(&filtered))))
    }

    fn filtered_extra(&self, keep_seal: bool) -> RelayerResult<Vec<u8>> {
        let mut extra = extract_istanbul_extra(&self.extra_data)?;
        if !keep_seal {
            extra.seal = Vec::new();
        }
        extra.committed_seal = Vec::new();
        Ok(encode_istanbul_extra(
            &self.extra_data[..ISTANBUL_EXTRA_VANITY],
            &extra,
        ))
    }
}

/// RLP integers are minimal big-endian byte strings.
fn append_uint(stream: &mut RlpStream, v: U256) {
    if v.is_zero() {
        stream.append_empty_data();
        return;
    }
    let mut buf = [0u8; 32];
    v.to_big_endian(&mut buf);
    let first = buf.iter().position(|b| *b != 0).unwrap_or(31);
    stream.append(&buf[first..].to_vec());
}

/// Recover the signer of a 65-byte `(r‖s‖v)` signature over arbitrary data,
/// hashing it with Keccak256 first (the Istanbul signing convention).
pub fn get_signature_address(data: &[u8], sig: &[u8]) -> RelayerResult<Address> {
    recover_signer(H256::from(keccak256(data)), sig)
}

/// Recover the signer of a 65-byte signature over an already-hashed message.
pub fn recover_signer(hash: H256, sig: &[u8]) -> RelayerResult<Address> {
    if sig.len() != 65 {
        return Err(RelayerError::Signature(format!(
            "signature must be 65 bytes, got {}",
            sig.len()
        )));
    }
    let signature = Signature {
        r: U256::from_big_endian(&sig[..32]),
        s: U256::from_big_endian(&sig[32..64]),
        v: sig[64] as u64,
    };
    signature
        .recover(ethers::types::RecoveryMessage::Hash(hash))
        .map_err(|e| RelayerError::Signature(format!("ecrecover: {e}")))
}

/// Recover the block proposer from the Istanbul proposer seal.
pub fn ecrecover_proposer(header: &EvmHeader, extra: &IstanbulExtra) -> RelayerResult<Address> {
    let sig_hash = header.sig_hash()?;
    get_signature_address(sig_hash.as_bytes(), &extra.seal)
}

/// Recover a committer from one committed seal.
pub fn ecrecover_committer(block_hash: H256, committed_seal: &[u8]) -> RelayerResult<Address> {
    let mut msg = block_hash.as_bytes().to_vec();
    msg.push(COMMIT_MSG_CODE);
    get_signature_address(&msg, committed_seal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    fn addr(n: u8) -> Address {
        let mut bz = [0u8; 20];
        bz[19] = n;
        Address::from(bz)
    }

    fn sample_extra(validators: Vec<Address>) -> Vec<u8> {
        encode_istanbul_extra(
            &[0u8; 32],
            &IstanbulExtra {
                validators,
                seal: vec![0u8; 65],
                committed_seal: vec![vec![1u8; 65], vec![2u8; 65]],
            },
        )
    }

    #[test]
    fn extra_round_trip() {
        let validators: Vec<Address> = (1..=8).map(addr).collect();
        let raw = sample_extra(validators.clone());
        let extra = extract_istanbul_extra(&raw).unwrap();
        assert_eq!(extra.validators, validators);
        assert_eq!(extra.seal.len(), 65);
        assert_eq!(extra.committed_seal.len(), 2);
    }

    #[test]
    fn empty_validator_set_rejected() {
        let raw = encode_istanbul_extra(
            &[0u8; 32],
            &IstanbulExtra {
                validators: Vec::new(),
                seal: Vec::new(),
                committed_seal: Vec::new(),
            },
        );
        assert!(extract_istanbul_extra(&raw).is_err());
    }

    #[test]
    fn short_extra_rejected() {
        assert!(extract_istanbul_extra(&[0u8; 16]).is_err());
    }

    fn sample_header(extra_data: Vec<u8>) -> EvmHeader {
        EvmHeader {
            parent_hash: H256::repeat_byte(1),
            uncles_hash: H256::repeat_byte(2),
            coinbase: addr(9),
            state_root: H256::repeat_byte(3),
            transactions_root: H256::repeat_byte(4),
            receipts_root: H256::repeat_byte(5),
            logs_bloom: [0u8; 256],
            difficulty: U256::one(),
            number: 6569,
            gas_limit: U256::from(8_000_000u64),
            gas_used: U256::from(21_000u64),
            timestamp: U256::from(1_600_000_000u64),
            extra_data,
            mix_hash: H256::zero(),
            nonce: [0u8; 8],
            base_fee_per_gas: None,
        }
    }

    #[test]
    fn seal_fields_do_not_move_the_sig_hash() {
        let validators: Vec<Address> = (1..=4).map(addr).collect();
        let a = sample_header(sample_extra(validators.clone()));
        let mut with_other_seals = sample_extra(validators);
        // same header, one committed-seal byte flipped
        let b_extra_len = with_other_seals.len();
        with_other_seals[b_extra_len - 70] ^= 0xFF;
        let b = sample_header(with_other_seals);
        assert_eq!(a.sig_hash().unwrap(), b.sig_hash().unwrap());
    }

    #[test]
    fn committer_recovery_round_trip() {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let validators: Vec<Address> = (1..=4).map(addr).collect();
        let header = sample_header(sample_extra(validators));
        let block_hash = header.hash().unwrap();

        let mut msg = block_hash.as_bytes().to_vec();
        msg.push(COMMIT_MSG_CODE);
        let digest = H256::from(keccak256(&msg));
        let sig = wallet.sign_hash(digest).unwrap();

        let recovered = ecrecover_committer(block_hash, &sig.to_vec()).unwrap();
        assert_eq!(recovered, wallet.address());
    }

    #[test]
    fn proposer_recovery_round_trip() {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let validators: Vec<Address> = (1..=4).map(addr).collect();

        // seal is produced over the sig hash, which ignores the seal itself
        let unsealed = sample_header(sample_extra(validators.clone()));
        let sig_hash = unsealed.sig_hash().unwrap();
        let digest = H256::from(keccak256(sig_hash.as_bytes()));
        let seal = wallet.sign_hash(digest).unwrap().to_vec();

        let sealed_extra = encode_istanbul_extra(
            &[0u8; 32],
            &IstanbulExtra {
                validators,
                seal,
                committed_seal: Vec::new(),
            },
        );
        let header = sample_header(sealed_extra);
        let extra = extract_istanbul_extra(&header.extra_data).unwrap();
        assert_eq!(ecrecover_proposer(&header, &extra).unwrap(), wallet.address());
    }
}
