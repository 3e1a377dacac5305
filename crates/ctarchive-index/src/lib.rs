//! Request routing and archive discovery
//!
//! The route parser turns raw request paths into a closed set of route
//! variants; the archive index maintains immutable snapshots of discovered
//! logs and answers zip-part lookups without touching disk on the request
//! path.

pub mod index;
pub mod routing;

pub use index::{ArchiveIndex, ArchiveLog, ArchiveSnapshot};
pub use routing::Route;
