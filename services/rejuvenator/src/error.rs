//! Error taxonomy for the rejuvenation engine.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::handshake::HandshakeState;

/// Failures reported by a cloud provider call.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The provider refused the request.
    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    /// The referenced resource does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The call did not reach the provider or got no usable answer.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Failures talking to the assignment registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("refusing to send invalid update: {0}")]
    Invalid(#[from] spotproxy_proto::ProtoError),

    #[error("registry unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registry answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Why one cycle of a batch worker did not complete.
#[derive(Debug, Error)]
pub enum CycleError {
    /// No offer in the selector's sequence has a supported architecture.
    #[error("no_capacity_available: no offer matches the supported architectures")]
    NoCapacityAvailable,

    /// Offers ran out before the target was reached.
    #[error("insufficient_capacity: provisioned {provisioned} of {target}")]
    InsufficientCapacity { target: usize, provisioned: usize },

    /// Provider failure while building a generation.
    #[error("cloud_error: {0}")]
    Cloud(#[from] CloudError),

    /// Health verification left addresses that never responded.
    #[error("unreachable_new_identity: {addresses:?}")]
    UnreachableNewIdentity { addresses: Vec<IpAddr> },

    #[error("registry_notification_failed: {0}")]
    RegistryNotificationFailed(#[source] RegistryError),

    /// Old (or aborted) resources could not be fully decommissioned.
    #[error("retirement_failed: {0}")]
    RetirementFailed(#[source] CloudError),

    /// Tearing down after `cause` failed as well. Reported as a retirement
    /// failure; `cause` is what aborted the cycle in the first place.
    #[error("retirement_failed: {source} (tearing down after {cause})")]
    TeardownFailed {
        cause: Box<CycleError>,
        #[source]
        source: CloudError,
    },

    #[error("invalid handshake transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: HandshakeState,
        to: HandshakeState,
    },
}

impl CycleError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CycleError::NoCapacityAvailable => "no_capacity_available",
            CycleError::InsufficientCapacity { .. } => "insufficient_capacity",
            CycleError::Cloud(_) => "cloud_error",
            CycleError::UnreachableNewIdentity { .. } => "unreachable_new_identity",
            CycleError::RegistryNotificationFailed(_) => "registry_notification_failed",
            CycleError::RetirementFailed(_) | CycleError::TeardownFailed { .. } => {
                "retirement_failed"
            }
            CycleError::InvalidTransition { .. } => "invalid_transition",
        }
    }

    /// Fatal errors halt the batch; the rest abort the cycle and retry on
    /// the next interval.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CycleError::RetirementFailed(_)
                | CycleError::TeardownFailed { .. }
                | CycleError::InvalidTransition { .. }
        )
    }

    /// Wrap a failed teardown so the failure that caused it survives.
    pub fn teardown_failed(cause: CycleError, source: CloudError) -> Self {
        CycleError::TeardownFailed {
            cause: Box::new(cause),
            source,
        }
    }

    /// Errors that may leave external state inconsistent and are surfaced
    /// to the operator with a full generation snapshot.
    pub fn is_escalated(&self) -> bool {
        self.is_fatal() || matches!(self, CycleError::RegistryNotificationFailed(_))
    }
}

/// One client that did not take its migration message. Never aborts a cycle.
#[derive(Debug, Error)]
#[error("client_notification_failed: {client}: {reason}")]
pub struct ClientNotificationFailed {
    pub client: SocketAddr,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_prefixes_message() {
        let errors = [
            CycleError::NoCapacityAvailable,
            CycleError::InsufficientCapacity {
                target: 3,
                provisioned: 1,
            },
            CycleError::UnreachableNewIdentity {
                addresses: vec!["198.51.100.1".parse().unwrap()],
            },
            CycleError::RetirementFailed(CloudError::Transport("reset".into())),
            CycleError::teardown_failed(
                CycleError::NoCapacityAvailable,
                CloudError::Transport("reset".into()),
            ),
        ];
        for e in errors {
            assert!(e.to_string().starts_with(e.reason_code()), "{e}");
        }
    }

    #[test]
    fn test_fatality() {
        assert!(!CycleError::NoCapacityAvailable.is_fatal());
        assert!(!CycleError::UnreachableNewIdentity { addresses: vec![] }.is_fatal());
        assert!(CycleError::RetirementFailed(CloudError::Transport("x".into())).is_fatal());

        let registry = CycleError::RegistryNotificationFailed(RegistryError::Rejected {
            status: 400,
            body: String::new(),
        });
        assert!(!registry.is_fatal());
        assert!(registry.is_escalated());
    }

    #[test]
    fn test_teardown_failure_keeps_its_cause() {
        let e = CycleError::teardown_failed(
            CycleError::InsufficientCapacity {
                target: 4,
                provisioned: 2,
            },
            CloudError::Transport("reset".into()),
        );
        assert!(e.is_fatal());
        assert_eq!(e.reason_code(), "retirement_failed");
        assert!(e.to_string().contains("insufficient_capacity: provisioned 2 of 4"));
        match e {
            CycleError::TeardownFailed { cause, .. } => {
                assert_eq!(cause.reason_code(), "insufficient_capacity")
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
