//! Pure, stateless (de)serialization and signature plumbing shared by both
//! relay directions.

pub mod cross_tx;
pub mod istanbul;
pub mod keys;
pub mod sigs;
pub mod valset;
pub mod zerocopy;

pub use cross_tx::{CrossTransfer, MakeTxParam, ToMerkleValue};
pub use zerocopy::{ZeroCopySink, ZeroCopySource};
