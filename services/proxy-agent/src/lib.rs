//! spotproxy Proxy Agent
//!
//! Runs on every proxy node next to the tunnel endpoint:
//!
//! - **Data plane**: relays client TCP sessions to the local upstream and
//!   can close any of them on request, saying `bye!` first.
//! - **Broker**: a line-protocol endpoint the rejuvenator uses to list
//!   attached clients, drain sessions, or have the proxy migrate its own
//!   clients to a new endpoint.
//!
//! Both share one [`SessionRegistry`]; there is no global state.

pub mod broker;
pub mod config;
pub mod relay;
pub mod sessions;

pub use broker::BrokerServer;
pub use config::Config;
pub use relay::DataPlane;
pub use sessions::SessionRegistry;
