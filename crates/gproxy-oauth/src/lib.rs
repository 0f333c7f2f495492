//! Provider-agnostic OAuth credential lifecycle: on-disk token store,
//! device-code/auth-code acquisition strategies, single-flight lifecycle
//! orchestration, and a background refresh daemon.

pub mod daemon;
pub mod lifecycle;
pub mod pkce;
pub mod store;
pub mod strategy;

pub use daemon::{DaemonConfig, TokenDaemon, WatchedToken};
pub use lifecycle::{EnsureOptions, FlowKind, OAuthFlowRunner, ensure_valid_token, handle_upstream_invalid_oauth_token};
pub use store::{StoredTokenRecord, TokenDescriptor, TokenStoreError};
pub use strategy::{OAuthEndpointConfig, OAuthFlowError, OAuthFlowResult};
