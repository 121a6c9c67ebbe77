//! Lookup table loading, storage and export.
//!
//! - [`table`]: the dense cube and trilinear sampling
//! - [`parser`]: `.cube` reading with strict and loose row grammars
//! - [`export`]: resampling and `.cube` writing
//! - [`cache`]: parsed tables keyed by source path
//! - [`store`]: the primary and secondary slots

pub mod cache;
pub mod export;
pub mod parser;
pub mod store;
pub mod table;

pub use cache::{CacheStats, LutCache};
pub use export::{export_cube, resample, write_cube, EXPORT_SIZE};
pub use parser::{detect_info, parse_cube, parse_cube_bytes, LutFormat, LutInfo};
pub use store::{LutStore, TableSlot, TableSnapshot};
pub use table::LookupTable;
