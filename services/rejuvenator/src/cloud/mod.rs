//! Cloud provider capability interface.
//!
//! The engine only needs a narrow slice of a provider's compute and
//! networking API. Implementations must be safe to share between batch
//! workers; every call is an independent remote operation.

use std::net::IpAddr;

use async_trait::async_trait;
use spotproxy_id::{AllocationId, AssociationId, FleetRequestId, InstanceId, InterfaceId};

use crate::error::CloudError;
use crate::model::{Arch, SpotQuote};

pub mod mock;

pub use mock::{CloudEvent, CloudOp, MockCloud};

/// An instance reported by a fleet request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedInstance {
    pub instance_id: InstanceId,
    pub instance_type: String,
    pub zone: String,
    /// Interface the instance was launched with.
    pub primary_interface: InterfaceId,
    /// Public address auto-assigned at launch.
    pub public_address: IpAddr,
}

/// A freshly allocated public address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAllocation {
    pub allocation_id: AllocationId,
    pub public_address: IpAddr,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Current spot quotes, narrowed to zones starting with one of
    /// `regions` (all zones when empty).
    async fn list_offers(&self, regions: &[String]) -> Result<Vec<SpotQuote>, CloudError>;

    async fn describe_architectures(&self, instance_type: &str) -> Result<Vec<Arch>, CloudError>;

    /// Submit one batch request for `count` instances.
    async fn create_instances(
        &self,
        instance_type: &str,
        zone: &str,
        count: usize,
    ) -> Result<FleetRequestId, CloudError>;

    /// Instances actually created for a request; may be fewer than asked.
    async fn poll_created_instances(
        &self,
        request: &FleetRequestId,
    ) -> Result<Vec<LaunchedInstance>, CloudError>;

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), CloudError>;

    /// Interfaces currently attached to `instance`, primary first.
    async fn attached_interfaces(&self, instance: &InstanceId)
        -> Result<Vec<InterfaceId>, CloudError>;

    async fn create_interface(&self, zone: &str) -> Result<InterfaceId, CloudError>;

    async fn attach_interface(
        &self,
        interface: &InterfaceId,
        instance: &InstanceId,
    ) -> Result<(), CloudError>;

    async fn allocate_address(&self) -> Result<AddressAllocation, CloudError>;

    async fn associate_address(
        &self,
        allocation: &AllocationId,
        interface: &InterfaceId,
    ) -> Result<AssociationId, CloudError>;

    async fn disassociate_address(&self, association: &AssociationId) -> Result<(), CloudError>;

    /// Fails while the allocation is still associated.
    async fn release_address(&self, allocation: &AllocationId) -> Result<(), CloudError>;
}
