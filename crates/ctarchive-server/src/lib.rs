//! HTTP surface for ct-archive-serve
//!
//! Dispatches parsed routes to handlers over the archive index and zip
//! store, builds the log-list discovery document, and runs the connection
//! loop with the configured timeouts.

pub mod loglist;
pub mod proxy;
pub mod serve;
pub mod server;

pub use loglist::LogListBuilder;
pub use server::{router, App, ClientAddr};
