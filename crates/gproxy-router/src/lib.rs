//! HTTP surface for gproxy: the downstream-facing proxy routes and the
//! admin API, both built as axum `Router`s mounted by the binary crate.

pub mod admin;
pub mod proxy;

pub use admin::{AdminState, admin_router};
pub use proxy::{ProxyState, proxy_router};
