//! Node roles
//!
//! The role is chosen once at start from the persisted settings. Both roles
//! consume the same transport event stream.

mod client;
mod proxy;

pub use client::ClientService;
pub use proxy::ProxyService;
