//! In-memory cloud provider for tests and development.
//!
//! Models just enough provider behaviour to exercise the engine: fleet
//! requests that may be partially fulfilled, interface limits per instance
//! type, and the association/release ordering rules for public addresses.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;

use async_trait::async_trait;
use spotproxy_id::{AllocationId, AssociationId, FleetRequestId, InstanceId, InterfaceId};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AddressAllocation, CloudProvider, LaunchedInstance};
use crate::error::CloudError;
use crate::model::{Arch, SpotQuote};

/// Provider operations, for failure injection and the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOp {
    ListOffers,
    DescribeArchitectures,
    CreateInstances,
    PollCreatedInstances,
    TerminateInstances,
    DescribeInterfaces,
    CreateInterface,
    AttachInterface,
    AllocateAddress,
    AssociateAddress,
    DisassociateAddress,
    ReleaseAddress,
}

impl CloudOp {
    fn name(self) -> &'static str {
        match self {
            CloudOp::ListOffers => "list_offers",
            CloudOp::DescribeArchitectures => "describe_architectures",
            CloudOp::CreateInstances => "create_instances",
            CloudOp::PollCreatedInstances => "poll_created_instances",
            CloudOp::TerminateInstances => "terminate_instances",
            CloudOp::DescribeInterfaces => "describe_interfaces",
            CloudOp::CreateInterface => "create_interface",
            CloudOp::AttachInterface => "attach_interface",
            CloudOp::AllocateAddress => "allocate_address",
            CloudOp::AssociateAddress => "associate_address",
            CloudOp::DisassociateAddress => "disassociate_address",
            CloudOp::ReleaseAddress => "release_address",
        }
    }

    /// Operations that decommission resources.
    pub fn is_retirement(self) -> bool {
        matches!(
            self,
            CloudOp::TerminateInstances | CloudOp::DisassociateAddress | CloudOp::ReleaseAddress
        )
    }
}

/// One successful provider call.
#[derive(Debug, Clone)]
pub struct CloudEvent {
    pub at: Instant,
    pub op: CloudOp,
    pub detail: String,
}

#[derive(Debug)]
struct MockInstance {
    instance_type: String,
    zone: String,
    running: bool,
    interfaces: Vec<InterfaceId>,
}

#[derive(Debug)]
struct MockInterface {
    zone: String,
    attached_to: Option<InstanceId>,
}

#[derive(Debug)]
struct MockAllocation {
    address: IpAddr,
    association: Option<AssociationId>,
}

#[derive(Debug, Default)]
struct MockState {
    quotes: Vec<SpotQuote>,
    architectures: HashMap<String, Vec<Arch>>,
    /// Most instances a single request yields.
    fulfillment_cap: Option<usize>,
    /// Instances still obtainable per instance type.
    capacity: HashMap<String, usize>,
    requests: HashMap<FleetRequestId, Vec<LaunchedInstance>>,
    instances: BTreeMap<InstanceId, MockInstance>,
    interfaces: HashMap<InterfaceId, MockInterface>,
    allocations: HashMap<AllocationId, MockAllocation>,
    associations: HashMap<AssociationId, (AllocationId, InterfaceId)>,
    failing: HashSet<CloudOp>,
    /// Successful calls left before an op starts failing.
    fail_after: HashMap<CloudOp, usize>,
    next_address: u32,
    events: Vec<CloudEvent>,
}

impl MockState {
    fn check(&mut self, op: CloudOp) -> Result<(), CloudError> {
        if let Some(left) = self.fail_after.get_mut(&op) {
            if *left == 0 {
                self.fail_after.remove(&op);
                self.failing.insert(op);
            } else {
                *left -= 1;
            }
        }
        if self.failing.contains(&op) {
            return Err(CloudError::Rejected {
                operation: op.name(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn record(&mut self, op: CloudOp, detail: String) {
        debug!(op = op.name(), detail = %detail, "[MOCK] cloud call");
        self.events.push(CloudEvent {
            at: Instant::now(),
            op,
            detail,
        });
    }

    fn next_address(&mut self) -> IpAddr {
        // 100.64.0.0/10, skipping the network address.
        self.next_address += 1;
        IpAddr::V4(Ipv4Addr::from(0x6440_0000u32 + self.next_address))
    }

    fn max_interfaces(&self, instance_type: &str) -> u32 {
        self.quotes
            .iter()
            .find(|q| q.instance_type == instance_type)
            .map_or(1, |q| q.max_interfaces)
    }
}

/// Mock cloud provider.
#[derive(Debug, Default)]
pub struct MockCloud {
    state: Mutex<MockState>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a quote and the architectures its instance type supports.
    pub fn with_offer(
        mut self,
        instance_type: &str,
        zone: &str,
        price: f64,
        max_interfaces: u32,
        architectures: &[Arch],
    ) -> Self {
        let state = self.state.get_mut();
        state.quotes.push(SpotQuote {
            instance_type: instance_type.to_string(),
            zone: zone.to_string(),
            price,
            max_interfaces,
        });
        state
            .architectures
            .insert(instance_type.to_string(), architectures.to_vec());
        self
    }

    /// Cap the instances a single request yields.
    pub fn with_fulfillment_cap(mut self, cap: usize) -> Self {
        self.state.get_mut().fulfillment_cap = Some(cap);
        self
    }

    /// Limit the total instances obtainable for an instance type.
    pub fn with_capacity(mut self, instance_type: &str, available: usize) -> Self {
        self.state
            .get_mut()
            .capacity
            .insert(instance_type.to_string(), available);
        self
    }

    /// Make every subsequent call to `op` fail.
    pub async fn inject_failure(&self, op: CloudOp) {
        self.state.lock().await.failing.insert(op);
    }

    /// Let `successes` more calls to `op` through, then fail every one after.
    pub async fn inject_failure_after(&self, op: CloudOp, successes: usize) {
        self.state.lock().await.fail_after.insert(op, successes);
    }

    pub async fn clear_failure(&self, op: CloudOp) {
        let mut state = self.state.lock().await;
        state.failing.remove(&op);
        state.fail_after.remove(&op);
    }

    pub async fn events(&self) -> Vec<CloudEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn running_instances(&self) -> Vec<InstanceId> {
        self.state
            .lock()
            .await
            .instances
            .iter()
            .filter(|(_, i)| i.running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Addresses currently allocated (associated or not).
    pub async fn allocated_addresses(&self) -> Vec<IpAddr> {
        let mut out: Vec<IpAddr> = self
            .state
            .lock()
            .await
            .allocations
            .values()
            .map(|a| a.address)
            .collect();
        out.sort();
        out
    }

    pub async fn association_count(&self) -> usize {
        self.state.lock().await.associations.len()
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    async fn list_offers(&self, regions: &[String]) -> Result<Vec<SpotQuote>, CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::ListOffers)?;
        let quotes: Vec<SpotQuote> = state
            .quotes
            .iter()
            .filter(|q| regions.is_empty() || regions.iter().any(|r| q.zone.starts_with(r)))
            .cloned()
            .collect();
        state.record(CloudOp::ListOffers, format!("{} quotes", quotes.len()));
        Ok(quotes)
    }

    async fn describe_architectures(&self, instance_type: &str) -> Result<Vec<Arch>, CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::DescribeArchitectures)?;
        let archs = state
            .architectures
            .get(instance_type)
            .cloned()
            .ok_or_else(|| CloudError::NotFound {
                kind: "instance type",
                id: instance_type.to_string(),
            })?;
        state.record(CloudOp::DescribeArchitectures, instance_type.to_string());
        Ok(archs)
    }

    async fn create_instances(
        &self,
        instance_type: &str,
        zone: &str,
        count: usize,
    ) -> Result<FleetRequestId, CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::CreateInstances)?;

        let mut granted = count;
        if let Some(cap) = state.fulfillment_cap {
            granted = granted.min(cap);
        }
        if let Some(available) = state.capacity.get_mut(instance_type) {
            granted = granted.min(*available);
            *available -= granted;
        }

        let mut launched = Vec::with_capacity(granted);
        for _ in 0..granted {
            let instance_id = InstanceId::generate();
            let primary_interface = InterfaceId::generate();
            let public_address = state.next_address();
            state.interfaces.insert(
                primary_interface.clone(),
                MockInterface {
                    zone: zone.to_string(),
                    attached_to: Some(instance_id.clone()),
                },
            );
            state.instances.insert(
                instance_id.clone(),
                MockInstance {
                    instance_type: instance_type.to_string(),
                    zone: zone.to_string(),
                    running: true,
                    interfaces: vec![primary_interface.clone()],
                },
            );
            launched.push(LaunchedInstance {
                instance_id,
                instance_type: instance_type.to_string(),
                zone: zone.to_string(),
                primary_interface,
                public_address,
            });
        }

        let request = FleetRequestId::generate();
        info!(
            request = %request,
            instance_type,
            zone,
            requested = count,
            granted,
            "[MOCK] Fleet request"
        );
        state.requests.insert(request.clone(), launched);
        state.record(
            CloudOp::CreateInstances,
            format!("{request} {instance_type} {zone} {granted}/{count}"),
        );
        Ok(request)
    }

    async fn poll_created_instances(
        &self,
        request: &FleetRequestId,
    ) -> Result<Vec<LaunchedInstance>, CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::PollCreatedInstances)?;
        let launched = state
            .requests
            .get(request)
            .cloned()
            .ok_or_else(|| CloudError::NotFound {
                kind: "fleet request",
                id: request.to_string(),
            })?;
        state.record(CloudOp::PollCreatedInstances, request.to_string());
        Ok(launched)
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::TerminateInstances)?;

        for id in ids {
            match state.instances.get(id) {
                Some(i) if i.running => {}
                _ => {
                    return Err(CloudError::NotFound {
                        kind: "instance",
                        id: id.to_string(),
                    })
                }
            }
        }

        for id in ids {
            let interfaces = match state.instances.get_mut(id) {
                Some(instance) => {
                    instance.running = false;
                    std::mem::take(&mut instance.interfaces)
                }
                None => Vec::new(),
            };
            // Interfaces go with the instance; their associations lapse and
            // the allocations stay billed until released.
            for interface in interfaces {
                state.interfaces.remove(&interface);
                let lapsed: Vec<AssociationId> = state
                    .associations
                    .iter()
                    .filter(|(_, (_, i))| *i == interface)
                    .map(|(a, _)| a.clone())
                    .collect();
                for association in lapsed {
                    if let Some((allocation, _)) = state.associations.remove(&association) {
                        if let Some(a) = state.allocations.get_mut(&allocation) {
                            a.association = None;
                        }
                    }
                }
            }
        }

        let detail = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        state.record(CloudOp::TerminateInstances, detail);
        Ok(())
    }

    async fn attached_interfaces(
        &self,
        instance: &InstanceId,
    ) -> Result<Vec<InterfaceId>, CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::DescribeInterfaces)?;
        let interfaces = match state.instances.get(instance) {
            Some(i) if i.running => i.interfaces.clone(),
            _ => {
                return Err(CloudError::NotFound {
                    kind: "instance",
                    id: instance.to_string(),
                })
            }
        };
        state.record(CloudOp::DescribeInterfaces, instance.to_string());
        Ok(interfaces)
    }

    async fn create_interface(&self, zone: &str) -> Result<InterfaceId, CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::CreateInterface)?;
        let id = InterfaceId::generate();
        state.interfaces.insert(
            id.clone(),
            MockInterface {
                zone: zone.to_string(),
                attached_to: None,
            },
        );
        state.record(CloudOp::CreateInterface, format!("{id} {zone}"));
        Ok(id)
    }

    async fn attach_interface(
        &self,
        interface: &InterfaceId,
        instance: &InstanceId,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::AttachInterface)?;

        let (instance_type, zone, attached) = match state.instances.get(instance) {
            Some(i) if i.running => (i.instance_type.clone(), i.zone.clone(), i.interfaces.len()),
            _ => {
                return Err(CloudError::NotFound {
                    kind: "instance",
                    id: instance.to_string(),
                })
            }
        };
        if attached as u32 >= state.max_interfaces(&instance_type) {
            return Err(CloudError::Rejected {
                operation: "attach_interface",
                reason: format!("{instance} already has {attached} interfaces"),
            });
        }
        match state.interfaces.get(interface) {
            Some(i) if i.zone != zone => {
                return Err(CloudError::Rejected {
                    operation: "attach_interface",
                    reason: format!("{interface} is in {}, {instance} in {zone}", i.zone),
                })
            }
            Some(i) if i.attached_to.is_none() => {}
            Some(_) => {
                return Err(CloudError::Rejected {
                    operation: "attach_interface",
                    reason: format!("{interface} is already attached"),
                })
            }
            None => {
                return Err(CloudError::NotFound {
                    kind: "interface",
                    id: interface.to_string(),
                })
            }
        }

        if let Some(i) = state.interfaces.get_mut(interface) {
            i.attached_to = Some(instance.clone());
        }
        if let Some(i) = state.instances.get_mut(instance) {
            i.interfaces.push(interface.clone());
        }
        state.record(CloudOp::AttachInterface, format!("{interface} -> {instance}"));
        Ok(())
    }

    async fn allocate_address(&self) -> Result<AddressAllocation, CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::AllocateAddress)?;
        let allocation_id = AllocationId::generate();
        let address = state.next_address();
        state.allocations.insert(
            allocation_id.clone(),
            MockAllocation {
                address,
                association: None,
            },
        );
        state.record(CloudOp::AllocateAddress, format!("{allocation_id} {address}"));
        Ok(AddressAllocation {
            allocation_id,
            public_address: address,
        })
    }

    async fn associate_address(
        &self,
        allocation: &AllocationId,
        interface: &InterfaceId,
    ) -> Result<AssociationId, CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::AssociateAddress)?;

        match state.allocations.get(allocation) {
            Some(a) if a.association.is_none() => {}
            Some(_) => {
                return Err(CloudError::Rejected {
                    operation: "associate_address",
                    reason: format!("{allocation} is already associated"),
                })
            }
            None => {
                return Err(CloudError::NotFound {
                    kind: "allocation",
                    id: allocation.to_string(),
                })
            }
        }
        let attached = state
            .interfaces
            .get(interface)
            .and_then(|i| i.attached_to.as_ref())
            .and_then(|inst| state.instances.get(inst))
            .is_some_and(|inst| inst.running);
        if !attached {
            return Err(CloudError::Rejected {
                operation: "associate_address",
                reason: format!("{interface} is not attached to a running instance"),
            });
        }

        let association = AssociationId::generate();
        if let Some(a) = state.allocations.get_mut(allocation) {
            a.association = Some(association.clone());
        }
        state
            .associations
            .insert(association.clone(), (allocation.clone(), interface.clone()));
        state.record(
            CloudOp::AssociateAddress,
            format!("{allocation} -> {interface} ({association})"),
        );
        Ok(association)
    }

    async fn disassociate_address(&self, association: &AssociationId) -> Result<(), CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::DisassociateAddress)?;
        let (allocation, _) =
            state
                .associations
                .remove(association)
                .ok_or_else(|| CloudError::NotFound {
                    kind: "association",
                    id: association.to_string(),
                })?;
        if let Some(a) = state.allocations.get_mut(&allocation) {
            a.association = None;
        }
        state.record(CloudOp::DisassociateAddress, association.to_string());
        Ok(())
    }

    async fn release_address(&self, allocation: &AllocationId) -> Result<(), CloudError> {
        let mut state = self.state.lock().await;
        state.check(CloudOp::ReleaseAddress)?;
        match state.allocations.get(allocation) {
            Some(a) if a.association.is_some() => {
                return Err(CloudError::Rejected {
                    operation: "release_address",
                    reason: format!("{allocation} is still associated"),
                })
            }
            Some(_) => {}
            None => {
                return Err(CloudError::NotFound {
                    kind: "allocation",
                    id: allocation.to_string(),
                })
            }
        }
        state.allocations.remove(allocation);
        state.record(CloudOp::ReleaseAddress, allocation.to_string());
        Ok(())
    }
}
