//! wormholed: keeps an haproxy configuration in sync with service instances
//! registered in etcd.
//!
//! ```text
//! etcd subtree ──watch──▶ backend::watcher ──signal──▶ service loop
//!                                                        │
//!              ◀──read─── backend::reader ◀──────────────┤
//!                                                        ▼
//!                  render (haproxy builder) ──text──▶ apply (write + reload)
//! ```

pub mod apply;
pub mod backend;
pub mod config;
pub mod digest;
pub mod haproxy;
pub mod registry;
pub mod render;
pub mod service;

pub use backend::Backend;
pub use config::Config;
pub use service::Service;
