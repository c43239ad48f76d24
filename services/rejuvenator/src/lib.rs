//! spotproxy Rejuvenation Engine
//!
//! Rotates the network identity of a spot-priced proxy fleet on a schedule
//! without dropping the clients attached to it.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler
//! └── BatchWorker(n)            (one per fleet batch, sequential cycles)
//!     ├── IdentityRotator       (whole-instance or live-IP)
//!     │   ├── InstanceSelector  (ranked offers, architecture filter)
//!     │   └── FleetProvisioner  (partial fulfillment)
//!     ├── HealthVerifier        (bounded-retry reachability gate)
//!     └── MigrationHandshake    (registry, clients, drain, retire)
//! ```
//!
//! ## Modules
//!
//! - `cloud`: provider abstraction and the in-memory provider
//! - `rotator`: generation building per rotation mode
//! - `handshake`: migration state machine and proxy broker client
//! - `scheduler`: batch workers and their cycle loop

pub mod cloud;
pub mod config;
pub mod cycle_log;
pub mod decommission;
pub mod error;
pub mod handshake;
pub mod health;
pub mod model;
pub mod provisioner;
pub mod registry;
pub mod rotator;
pub mod scheduler;
pub mod selector;

pub use cloud::{CloudProvider, MockCloud};
pub use config::{Config, RotationMode};
pub use error::CycleError;
pub use scheduler::{BatchExit, BatchWorker, Scheduler};
