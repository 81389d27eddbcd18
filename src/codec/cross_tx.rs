//! Cross-chain event records and their wire forms.

use super::zerocopy::{ZeroCopySink, ZeroCopySource};
use crate::error::{RelayerError, RelayerResult};

use ethers::types::U256;

/// One pending cross-chain event, as persisted in the retry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossTransfer {
    /// Even-length hex form of the big-integer event id; also the storage
    /// mapping key on the data contract.
    pub tx_index: String,
    /// Source-chain transaction hash.
    pub tx_id: Vec<u8>,
    /// Target chain id.
    pub to_chain: u32,
    /// Source-contract-encoded MakeTxParam payload.
    pub value: Vec<u8>,
    /// Block height the event was emitted at.
    pub height: u64,
}

impl CrossTransfer {
    pub fn serialization(&self, sink: &mut ZeroCopySink) {
        sink.write_string(&self.tx_index);
        sink.write_var_bytes(&self.tx_id);
        sink.write_var_bytes(&self.value);
        sink.write_u32(self.to_chain);
        sink.write_u64(self.height);
    }

    pub fn deserialization(source: &mut ZeroCopySource) -> RelayerResult<Self> {
        let tx_index = source.next_string()?;
        let tx_id = source.next_var_bytes()?;
        let value = source.next_var_bytes()?;
        let to_chain = source.next_u32()?;
        let height = source.next_u64()?;
        Ok(Self {
            tx_index,
            tx_id,
            to_chain,
            value,
            height,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut sink = ZeroCopySink::new();
        self.serialization(&mut sink);
        sink.into_bytes()
    }

    pub fn from_bytes(raw: &[u8]) -> RelayerResult<Self> {
        let mut source = ZeroCopySource::new(raw);
        Self::deserialization(&mut source)
    }
}

/// Hex-encode a big-integer event id the way the data contract keys its
/// proof mapping: minimal big-endian bytes, `"00"` for zero.
pub fn encode_big_int(v: U256) -> String {
    if v.is_zero() {
        return "00".to_string();
    }
    let mut buf = [0u8; 32];
    v.to_big_endian(&mut buf);
    let first = buf.iter().position(|b| *b != 0).unwrap_or(31);
    hex::encode(&buf[first..])
}

/// The canonical cross-chain message payload emitted by the source contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeTxParam {
    pub tx_hash: Vec<u8>,
    pub cross_chain_id: Vec<u8>,
    pub from_contract: Vec<u8>,
    pub to_chain_id: u64,
    pub to_contract: Vec<u8>,
    pub method: String,
    pub args: Vec<u8>,
}

impl MakeTxParam {
    pub fn deserialization(source: &mut ZeroCopySource) -> RelayerResult<Self> {
        Ok(Self {
            tx_hash: source.next_var_bytes()?,
            cross_chain_id: source.next_var_bytes()?,
            from_contract: source.next_var_bytes()?,
            to_chain_id: source.next_u64()?,
            to_contract: source.next_var_bytes()?,
            method: source.next_string()?,
            args: source.next_var_bytes()?,
        })
    }

    pub fn from_bytes(raw: &[u8]) -> RelayerResult<Self> {
        let mut source = ZeroCopySource::new(raw);
        Self::deserialization(&mut source)
    }
}

/// A cross-chain message anchored in a Poly block's cross-state root.
#[derive(Debug, Clone)]
pub struct ToMerkleValue {
    pub tx_hash: Vec<u8>,
    pub from_chain_id: u64,
    pub make_tx_param: MakeTxParam,
}

impl ToMerkleValue {
    pub fn from_bytes(raw: &[u8]) -> RelayerResult<Self> {
        let mut source = ZeroCopySource::new(raw);
        Ok(Self {
            tx_hash: source.next_var_bytes()?,
            from_chain_id: source.next_u64()?,
            make_tx_param: MakeTxParam::deserialization(&mut source)?,
        })
    }
}

/// Extract the leaf value carried at the head of a cross-state audit path.
/// The remainder of the path is node hashes the target contract walks; only
/// the leaf is needed off-chain.
pub fn audit_path_value(audit_path: &[u8]) -> RelayerResult<Vec<u8>> {
    let mut source = ZeroCopySource::new(audit_path);
    let value = source.next_var_bytes()?;
    if value.is_empty() {
        return Err(RelayerError::Codec("empty audit path value".into()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    // A retry-table record captured from a live deposit relay.
    const RETRY_RECORD: &str = "023033200043f645f9be7bba122c2e1322fcacb042a2bb5a4b66dd2b0b3a482e7b212ae8c62000000000000000\
        000000000000000000000000000000000000000000000000032069968925c79a08f4f9bd08cb1361db48dea29b\
        431d57736831c0239728ec4b831400000000000000000000000000000000000001036500000000000000140000\
        00000000000000000000000000000000010306756e6c6f636b4a14000000000000000000000000000000000000\
        0103145593b2b8dc63d0ed68aa8f885707b2dc5787e391000064a7b3b6e00d0000000000000000000000000000\
        0000000000000000000065000000f135000000000000";

    fn record_bytes() -> Vec<u8> {
        hex::decode(RETRY_RECORD.replace(char::is_whitespace, "")).unwrap()
    }

    #[test]
    fn decode_live_retry_record() {
        let tx = CrossTransfer::from_bytes(&record_bytes()).unwrap();
        assert_eq!(tx.tx_index, "03");
        assert_eq!(tx.tx_id.len(), 32);
        assert_eq!(
            hex::encode(&tx.tx_id),
            "0043f645f9be7bba122c2e1322fcacb042a2bb5a4b66dd2b0b3a482e7b212ae8"
        );
        assert_eq!(tx.to_chain, 101);
        assert_eq!(tx.height, 13809);
        assert_eq!(tx.value.len(), 198);
    }

    #[test]
    fn cross_transfer_round_trip() {
        let tx = CrossTransfer::from_bytes(&record_bytes()).unwrap();
        let encoded = tx.to_bytes();
        assert_eq!(encoded, record_bytes());
        assert_eq!(CrossTransfer::from_bytes(&encoded).unwrap(), tx);
    }

    #[test]
    fn decode_embedded_make_tx_param() {
        let tx = CrossTransfer::from_bytes(&record_bytes()).unwrap();
        let param = MakeTxParam::from_bytes(&tx.value).unwrap();
        assert_eq!(param.method, "unlock");
        assert_eq!(param.to_chain_id, 101);
        assert_eq!(param.cross_chain_id.len(), 32);
        assert_eq!(param.from_contract.len(), 20);
        assert_eq!(param.to_contract.len(), 20);
        assert_eq!(param.args.len(), 74);
    }

    #[test]
    fn big_int_hex_form() {
        assert_eq!(encode_big_int(U256::zero()), "00");
        assert_eq!(encode_big_int(U256::from(3u64)), "03");
        assert_eq!(encode_big_int(U256::from(0xff_u64)), "ff");
        assert_eq!(encode_big_int(U256::from(0x0100_u64)), "0100");
    }
}
