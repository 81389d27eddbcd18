//! Multi-signature blobs: 65-byte `(r‖s‖v)` tuples concatenated, quorum
//! verification, and normalization of Poly-native signatures into the
//! Ethereum recovery convention.

use super::istanbul::recover_signer;
use crate::error::{RelayerError, RelayerResult};

use ethers::types::{Address, H256};

pub const SIG_LEN: usize = 65;

/// Split a signature blob into its 65-byte members.
pub fn raw_multi_sigs_to_list(sig_data: &[u8]) -> RelayerResult<Vec<Vec<u8>>> {
    if sig_data.len() % SIG_LEN != 0 {
        return Err(RelayerError::Signature(format!(
            "signature blob length {} is not a multiple of {SIG_LEN}",
            sig_data.len()
        )));
    }
    let count = sig_data.len() / SIG_LEN;
    if count == 0 {
        return Err(RelayerError::Signature("signature blob is empty".into()));
    }
    Ok(sig_data.chunks(SIG_LEN).map(|c| c.to_vec()).collect())
}

/// Concatenate 65-byte signatures into one blob.
pub fn assemble_multi_sigs(sigs: &[Vec<u8>]) -> RelayerResult<Vec<u8>> {
    let mut out = Vec::with_capacity(sigs.len() * SIG_LEN);
    for sig in sigs {
        if sig.len() != SIG_LEN {
            return Err(RelayerError::Signature(format!(
                "signature must be {SIG_LEN} bytes, got {}",
                sig.len()
            )));
        }
        out.extend_from_slice(sig);
    }
    Ok(out)
}

/// Normalize one Poly-native signature to the Ethereum recoverable layout:
/// the leading scheme/recovery byte moves to the tail and is reduced to a
/// `{0,1}` recovery id.
pub fn convert_to_eth_compatible(sig: &[u8]) -> RelayerResult<Vec<u8>> {
    if sig.len() != SIG_LEN {
        return Err(RelayerError::Signature(format!(
            "native signature must be {SIG_LEN} bytes, got {}",
            sig.len()
        )));
    }
    let mut out = sig[1..].to_vec();
    let v = sig[0];
    out.push(if v >= 27 { v - 27 } else { v });
    Ok(out)
}

/// Recover every signer in a blob over an already-hashed message.
pub fn recover_signers_from_multi_sigs(
    hash: H256,
    sigs: &[Vec<u8>],
) -> RelayerResult<Vec<Address>> {
    sigs.iter().map(|sig| recover_signer(hash, sig)).collect()
}

/// Minimum signer count for a keeper set of size `n`: ⌈2n/3⌉.
pub fn quorum_m(n: usize) -> usize {
    (2 * n + 2) / 3
}

/// Verify that at least `m` of `keepers` signed `hash` in the blob.
pub fn verify_sig(hash: H256, multi_sig_data: &[u8], keepers: &[Address], m: usize) -> RelayerResult<()> {
    let sigs = raw_multi_sigs_to_list(multi_sig_data)?;
    let signers = recover_signers_from_multi_sigs(hash, &sigs)?;
    let count = keepers
        .iter()
        .filter(|keeper| signers.contains(keeper))
        .count();
    if count >= m {
        Ok(())
    } else {
        Err(RelayerError::Signature(format!(
            "signers not enough: {count} of {} keepers signed, need {m}",
            keepers.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    #[test]
    fn blob_length_must_be_multiple_of_65() {
        assert!(raw_multi_sigs_to_list(&[0u8; 64]).is_err());
        assert!(raw_multi_sigs_to_list(&[0u8; 130]).is_ok());
        assert!(raw_multi_sigs_to_list(&[]).is_err());
    }

    #[test]
    fn assemble_then_split() {
        let sigs = vec![vec![1u8; 65], vec![2u8; 65], vec![3u8; 65]];
        let blob = assemble_multi_sigs(&sigs).unwrap();
        assert_eq!(blob.len(), 195);
        assert_eq!(raw_multi_sigs_to_list(&blob).unwrap(), sigs);
    }

    #[test]
    fn assemble_rejects_short_member() {
        assert!(assemble_multi_sigs(&[vec![0u8; 64]]).is_err());
    }

    #[test]
    fn native_signature_reordering() {
        let mut native = vec![28u8];
        native.extend_from_slice(&[7u8; 64]);
        let eth = convert_to_eth_compatible(&native).unwrap();
        assert_eq!(eth.len(), 65);
        assert_eq!(&eth[..64], &[7u8; 64][..]);
        assert_eq!(eth[64], 1);
    }

    #[test]
    fn quorum_formula() {
        assert_eq!(quorum_m(4), 3);
        assert_eq!(quorum_m(6), 5);
        assert_eq!(quorum_m(7), 5);
        assert_eq!(quorum_m(9), 7);
    }

    fn sign_all(hash: H256, wallets: &[LocalWallet]) -> Vec<Vec<u8>> {
        wallets
            .iter()
            .map(|w| w.sign_hash(hash).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn quorum_verification_boundary() {
        let wallets: Vec<LocalWallet> =
            (0..4).map(|_| LocalWallet::new(&mut rand::thread_rng())).collect();
        let keepers: Vec<Address> = wallets.iter().map(|w| w.address()).collect();
        let n = keepers.len();
        let m = quorum_m(n);
        let hash = H256::repeat_byte(0x42);

        // ⌊2N/3⌋ signers are not enough
        let below = sign_all(hash, &wallets[..(2 * n / 3)]);
        let blob = assemble_multi_sigs(&below).unwrap();
        assert!(verify_sig(hash, &blob, &keepers, m).is_err());

        // ⌈2N/3⌉ signers pass
        let enough = sign_all(hash, &wallets[..m]);
        let blob = assemble_multi_sigs(&enough).unwrap();
        verify_sig(hash, &blob, &keepers, m).unwrap();
    }

    #[test]
    fn foreign_signers_do_not_count() {
        let keeper_wallets: Vec<LocalWallet> =
            (0..4).map(|_| LocalWallet::new(&mut rand::thread_rng())).collect();
        let keepers: Vec<Address> = keeper_wallets.iter().map(|w| w.address()).collect();
        let strangers: Vec<LocalWallet> =
            (0..3).map(|_| LocalWallet::new(&mut rand::thread_rng())).collect();
        let hash = H256::repeat_byte(0x42);
        let blob = assemble_multi_sigs(&sign_all(hash, &strangers)).unwrap();
        assert!(verify_sig(hash, &blob, &keepers, quorum_m(4)).is_err());
    }
}
