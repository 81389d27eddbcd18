//! Chain clients: shared, thread-safe connection holders for the two rpc
//! endpoints. Everything above this layer consumes typed calls only.

pub mod palette;
pub mod poly;

pub use palette::{CrossChainEvent, PaletteClient};
pub use poly::{PolyClient, PolyHeader, PolySigner};
