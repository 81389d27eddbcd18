//! The two relay directions. Each manager owns its loops and shares state
//! only through the persistent store.

pub mod palette;
pub mod poly;
pub mod sender;

pub use palette::PaletteManager;
pub use poly::PolyManager;
