//! # spotproxy-proto
//!
//! Wire formats shared by the rejuvenator, the proxy agent and the client
//! agent.
//!
//! ## Line protocol
//!
//! Every command is one ASCII line terminated by `\n` (a preceding `\r` is
//! tolerated) and at most [`MAX_LINE_LEN`] bytes long. The first word is the
//! keyword, matched case-insensitively:
//!
//! ```text
//! migrate <ip>[:<port>]     client migration endpoint, proxy broker
//! clients                   proxy broker: list attached clients
//! drain [<ip> ...]          proxy broker: close data-plane sessions
//! ```
//!
//! A `clients` reply has one `<client_ip> [<proxy_ip>]` line per attached
//! client, naming the proxy address the session arrived on. A selective
//! `drain` longer than one line is split with
//! [`BrokerCommand::drain_batches`].
//!
//! Each command travels over its own short-lived TCP connection. `migrate`
//! sent to a client is fire-and-forget; broker commands are answered with
//! zero or more lines before the broker closes the connection.
//!
//! ## Registry
//!
//! [`TopologyUpdate`] is the JSON body posted to the assignment registry
//! when fleet membership changes.

mod endpoint;
mod error;
mod exchange;
mod framing;
mod message;
mod registry;

pub use endpoint::Endpoint;
pub use error::ProtoError;
pub use exchange::{notify_client, send_command};
pub use framing::{read_line, write_line, MAX_LINE_LEN};
pub use message::{Attachment, BrokerCommand, MigrationMessage};
pub use registry::{TopologyUpdate, UpdateKind};
