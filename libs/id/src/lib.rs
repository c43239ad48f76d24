//! # spotproxy-id
//!
//! Typed identifiers for the cloud resources a proxy fleet is built from.
//!
//! Cloud providers hand out opaque string identifiers with a short resource
//! prefix (`i-0f3a...` for instances, `eni-...` for network interfaces and
//! so on). Keeping them as distinct types stops an interface id from being
//! passed where an address allocation is expected, which matters in the
//! rotation code where all four kinds are juggled in the same function.
//!
//! ## ID Format
//!
//! `{prefix}-{suffix}` where the suffix is non-empty lowercase ASCII
//! alphanumerics.
//!
//! Examples:
//! - `i-0a1b2c3d4e5f67890`
//! - `eni-01hv4z2wqxkjnm8gpqy6vbkc3d`
//! - `eipalloc-7f00aa`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that mint identifiers locally.
pub use ulid::Ulid;
