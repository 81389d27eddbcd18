//! Durable relayer state: per-chain checkpoints, the retry table of pending
//! cross-chain events, and the check table of in-flight submissions.

use crate::error::RelayerResult;

use std::path::Path;

const RETRY_TREE: &str = "retry";
const CHECK_TREE: &str = "check";
const HEIGHT_TREE: &str = "height";

const PALETTE_HEIGHT_KEY: &[u8] = b"palette";
const POLY_HEIGHT_KEY: &[u8] = b"poly";

/// Embedded key/value store shared by both managers. All operations are
/// single-row atomic; iteration tolerates concurrent inserts.
#[derive(Clone)]
pub struct Store {
    retry: sled::Tree,
    check: sled::Tree,
    height: sled::Tree,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> RelayerResult<Self> {
        let db = sled::Config::new()
            .path(path)
            .temporary(cfg!(test))
            .open()?;
        Ok(Self {
            retry: db.open_tree(RETRY_TREE)?,
            check: db.open_tree(CHECK_TREE)?,
            height: db.open_tree(HEIGHT_TREE)?,
        })
    }

    /// Enqueue a serialized cross transfer; the record is its own key.
    pub fn put_retry(&self, raw: &[u8]) -> RelayerResult<()> {
        self.retry.insert(raw, &[])?;
        Ok(())
    }

    pub fn delete_retry(&self, raw: &[u8]) -> RelayerResult<()> {
        self.retry.remove(raw)?;
        Ok(())
    }

    pub fn get_all_retry(&self) -> RelayerResult<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for item in self.retry.iter() {
            let (key, _) = item?;
            out.push(key.to_vec());
        }
        Ok(out)
    }

    /// Record an in-flight submission keyed by the target-chain tx hash.
    pub fn put_check(&self, tx_hash: &str, raw: &[u8]) -> RelayerResult<()> {
        self.check.insert(tx_hash.as_bytes(), raw)?;
        Ok(())
    }

    pub fn delete_check(&self, tx_hash: &str) -> RelayerResult<()> {
        self.check.remove(tx_hash.as_bytes())?;
        Ok(())
    }

    pub fn get_all_check(&self) -> RelayerResult<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.check.iter() {
            let (key, value) = item?;
            out.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(out)
    }

    pub fn update_palette_height(&self, height: u64) -> RelayerResult<()> {
        self.height
            .insert(PALETTE_HEIGHT_KEY, &height.to_le_bytes())?;
        Ok(())
    }

    pub fn get_palette_height(&self) -> RelayerResult<u64> {
        self.read_height(PALETTE_HEIGHT_KEY)
    }

    pub fn update_poly_height(&self, height: u32) -> RelayerResult<()> {
        self.height
            .insert(POLY_HEIGHT_KEY, &(height as u64).to_le_bytes())?;
        Ok(())
    }

    pub fn get_poly_height(&self) -> RelayerResult<u32> {
        Ok(self.read_height(POLY_HEIGHT_KEY)? as u32)
    }

    fn read_height(&self, key: &[u8]) -> RelayerResult<u64> {
        let value = self.height.get(key)?;
        Ok(match value {
            Some(v) if v.len() >= 8 => u64::from_le_bytes(v[..8].try_into().unwrap()),
            _ => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> Store {
        let dir = tempfile::tempdir().unwrap();
        Store::open(dir.path()).unwrap()
    }

    #[test]
    fn retry_set_semantics() {
        let store = open_temp();
        assert!(store.get_all_retry().unwrap().is_empty());

        store.put_retry(b"record-a").unwrap();
        store.put_retry(b"record-b").unwrap();
        // inserting the same record twice keeps one copy
        store.put_retry(b"record-a").unwrap();
        assert_eq!(store.get_all_retry().unwrap().len(), 2);

        store.delete_retry(b"record-a").unwrap();
        let rest = store.get_all_retry().unwrap();
        assert_eq!(rest, vec![b"record-b".to_vec()]);

        // deleting an absent record is a no-op
        store.delete_retry(b"record-a").unwrap();
    }

    #[test]
    fn check_table_round_trip() {
        let store = open_temp();
        store.put_check("0xabc", b"payload").unwrap();
        let all = store.get_all_check().unwrap();
        assert_eq!(all, vec![("0xabc".to_string(), b"payload".to_vec())]);

        store.delete_check("0xabc").unwrap();
        assert!(store.get_all_check().unwrap().is_empty());
    }

    #[test]
    fn promote_check_back_to_retry() {
        let store = open_temp();
        store.put_check("0xdead", b"transfer").unwrap();

        // a failed confirmation moves the record back to retry
        for (hash, raw) in store.get_all_check().unwrap() {
            store.put_retry(&raw).unwrap();
            store.delete_check(&hash).unwrap();
        }
        assert_eq!(store.get_all_retry().unwrap(), vec![b"transfer".to_vec()]);
        assert!(store.get_all_check().unwrap().is_empty());
    }

    #[test]
    fn heights_default_to_zero_and_persist() {
        let store = open_temp();
        assert_eq!(store.get_palette_height().unwrap(), 0);
        assert_eq!(store.get_poly_height().unwrap(), 0);

        store.update_palette_height(14420).unwrap();
        store.update_poly_height(470_565).unwrap();
        assert_eq!(store.get_palette_height().unwrap(), 14420);
        assert_eq!(store.get_poly_height().unwrap(), 470_565);
    }
}
