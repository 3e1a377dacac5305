//! Zip access stack for ct-archive-serve
//!
//! Layered fast-to-slow access to entries inside archived zip parts:
//! decompressed-content cache, open-reader cache, and an integrity gate that
//! separates "permanently missing" from "still downloading". The
//! [`store::ZipStore`] façade orchestrates the layers.

mod flight;

pub mod entry_cache;
pub mod integrity;
pub mod part_cache;
pub mod store;

pub use entry_cache::EntryContentCache;
pub use integrity::IntegrityGate;
pub use part_cache::{CachedZip, ZipPartCache};
pub use store::ZipStore;
