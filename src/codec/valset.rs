//! Validator-set canonicalization and wire form.

use super::zerocopy::{ZeroCopySink, ZeroCopySource};
use crate::error::{RelayerError, RelayerResult};

use ethers::types::Address;

/// Sort addresses by their canonical hex form.
pub fn sort_addr_list(list: &mut [Address]) {
    list.sort_by_key(|a| *a);
}

/// Two validator sets describe the same epoch iff their canonical sorts are
/// element-wise equal.
pub fn valset_changed(a: &[Address], b: &[Address]) -> bool {
    if a.len() != b.len() {
        return true;
    }
    let mut sa = a.to_vec();
    let mut sb = b.to_vec();
    sort_addr_list(&mut sa);
    sort_addr_list(&mut sb);
    sa != sb
}

/// Serialize a validator set the way the header-sync contract stores its
/// consensus peers: u64 count followed by per-validator var-bytes.
pub fn valset_to_bytes(vals: &[Address]) -> Vec<u8> {
    let mut sink = ZeroCopySink::new();
    sink.write_u64(vals.len() as u64);
    for v in vals {
        sink.write_var_bytes(v.as_bytes());
    }
    sink.into_bytes()
}

pub fn bytes_to_valset(raw: &[u8]) -> RelayerResult<Vec<Address>> {
    let mut source = ZeroCopySource::new(raw);
    let count = source.next_u64()?;
    let mut vals = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let bz = source.next_var_bytes()?;
        if bz.len() != 20 {
            return Err(RelayerError::Codec(format!(
                "validator address must be 20 bytes, got {}",
                bz.len()
            )));
        }
        vals.push(Address::from_slice(&bz));
    }
    Ok(vals)
}
