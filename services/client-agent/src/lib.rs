//! spotproxy Client Agent
//!
//! Listens for `migrate <ip>[:<port>]` messages from the proxy fleet. Each
//! message rewrites the local WireGuard configuration to the new peer
//! endpoint and restarts the tunnel; the applied endpoint is then published
//! so the local data-plane user can reconnect.

pub mod config;
pub mod listener;
pub mod tunnel;

pub use config::Config;
pub use listener::MigrationListener;
pub use tunnel::{RecordingBackend, TunnelBackend, TunnelError, WireGuardBackend};
