//! Identifier definitions for the resources a proxy fleet touches.

use crate::define_resource_id;

// =============================================================================
// Compute
// =============================================================================

define_resource_id!(InstanceId, "i");
define_resource_id!(FleetRequestId, "fleet");

// =============================================================================
// Networking
// =============================================================================

define_resource_id!(InterfaceId, "eni");
define_resource_id!(AllocationId, "eipalloc");
define_resource_id!(AssociationId, "eipassoc");

// =============================================================================
// Cycle sequence
// =============================================================================

/// Rejuvenation cycle number within one batch. Cycle 1 is the bootstrap cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleSeq(u64);

impl CycleSeq {
    /// The bootstrap cycle, which has no previous generation.
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn is_bootstrap(&self) -> bool {
        self.0 == Self::FIRST.0
    }
}

impl Default for CycleSeq {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for CycleSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for CycleSeq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for CycleSeq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(u64::deserialize(deserializer)?))
    }
}

// =============================================================================
// Tests
// =============================================================================
