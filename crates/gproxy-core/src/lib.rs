pub mod auth;
pub mod bootstrap;
pub mod parallel;
pub mod pipeline;
pub mod pool;
pub mod proxy_engine;
pub mod route;
pub mod sse_bridge;
pub mod state;
pub mod upstream_client;

pub use auth::{
    AuthContext, AuthError, AuthKeyEntry, AuthProvider, AuthSnapshot, MemoryAuth, NoopAuth,
    UserEntry,
};
