//! HTTP operational surface for the ledger relay.
//!
//! A thin axum router over a running [`RelayCoordinator`]: health, status,
//! pause/resume, drain and operator abandonment of permanently failed
//! records.
//!
//! [`RelayCoordinator`]: relay_engine::RelayCoordinator

pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use router::{build_router, AppState};
pub use server::RelayServer;
