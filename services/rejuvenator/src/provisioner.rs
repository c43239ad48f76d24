//! Fleet provisioning against ranked offers, absorbing partial fulfillment.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use spotproxy_id::InstanceId;
use tracing::{info, warn};

use crate::cloud::CloudProvider;
use crate::error::{CloudError, CycleError};
use crate::model::{NicHandle, NodeState, Offer, ProxyNode};
use crate::selector::OfferSequence;

/// What a provisioning `count` is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionUnits {
    /// One unit per instance.
    Instances,
    /// One unit per usable address; each instance hosts up to its
    /// interface limit.
    Addresses,
}

/// Outcome of one fleet request.
#[derive(Debug)]
pub struct Provisioned {
    pub nodes: Vec<ProxyNode>,
    /// Units the request did not cover.
    pub remaining: usize,
}

pub struct FleetProvisioner {
    cloud: Arc<dyn CloudProvider>,
    settle: Duration,
    units: ProvisionUnits,
}

impl FleetProvisioner {
    pub fn new(cloud: Arc<dyn CloudProvider>, settle: Duration, units: ProvisionUnits) -> Self {
        Self {
            cloud,
            settle,
            units,
        }
    }

    /// Instances needed to cover `count` units on `offer`.
    pub fn instances_for(&self, offer: &Offer, count: usize) -> usize {
        match self.units {
            ProvisionUnits::Instances => count,
            ProvisionUnits::Addresses => count.div_ceil(offer.max_interfaces.max(1) as usize),
        }
    }

    /// Units covered by `instances` launched on `offer`, capped at `count`.
    fn covered(&self, offer: &Offer, instances: usize, count: usize) -> usize {
        let units = match self.units {
            ProvisionUnits::Instances => instances,
            ProvisionUnits::Addresses => instances * offer.max_interfaces.max(1) as usize,
        };
        units.min(count)
    }

    /// Submit one batch request, wait for it to settle, and read back what
    /// was actually created. Nodes are indexed from `first_index`.
    pub async fn provision(
        &self,
        offer: &Offer,
        count: usize,
        first_index: usize,
    ) -> Result<Provisioned, CloudError> {
        let wanted = self.instances_for(offer, count);
        let request = self
            .cloud
            .create_instances(&offer.instance_type, &offer.zone, wanted)
            .await?;
        info!(
            request = %request,
            instance_type = %offer.instance_type,
            zone = %offer.zone,
            price = offer.price,
            instances = wanted,
            "Submitted fleet request"
        );

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        let launched = self.cloud.poll_created_instances(&request).await?;
        let nodes: Vec<ProxyNode> = launched
            .into_iter()
            .take(wanted)
            .enumerate()
            .map(|(i, l)| ProxyNode {
                index: first_index + i,
                nics: vec![NicHandle {
                    interface_id: l.primary_interface.clone(),
                    address: l.public_address,
                    allocation_id: None,
                    association_id: None,
                }],
                instance_id: l.instance_id,
                instance_type: l.instance_type,
                zone: l.zone,
                hourly_cost: offer.price,
                arch: offer.arch,
                max_interfaces: offer.max_interfaces,
                primary_interface: l.primary_interface,
                state: NodeState::Provisioning,
            })
            .collect();

        let remaining = count - self.covered(offer, nodes.len(), count);
        if nodes.len() < wanted {
            warn!(
                request = %request,
                requested = wanted,
                created = nodes.len(),
                remaining,
                "Fleet request partially fulfilled"
            );
        }

        Ok(Provisioned { nodes, remaining })
    }

    /// Provision `count` units starting at `first`, moving down the offer
    /// sequence while a shortfall remains.
    ///
    /// On failure every instance launched here is terminated before the
    /// error is returned. If that fails too the error is
    /// [`CycleError::TeardownFailed`] carrying the original failure.
    pub async fn fill(
        &self,
        offers: &mut OfferSequence,
        first: Offer,
        count: usize,
        first_index: usize,
    ) -> Result<Vec<ProxyNode>, CycleError> {
        let mut nodes = Vec::new();
        match self
            .fill_into(offers, first, count, first_index, &mut nodes)
            .await
        {
            Ok(()) => Ok(nodes),
            Err(e) => match self.terminate(&nodes).await {
                Ok(()) => Err(e),
                Err(cleanup) => Err(CycleError::teardown_failed(e, cleanup)),
            },
        }
    }

    async fn fill_into(
        &self,
        offers: &mut OfferSequence,
        first: Offer,
        count: usize,
        first_index: usize,
        nodes: &mut Vec<ProxyNode>,
    ) -> Result<(), CycleError> {
        let mut seen: HashSet<InstanceId> = HashSet::new();
        let mut remaining = count;
        let mut offer = Some(first);

        while remaining > 0 {
            let Some(current) = offer.take() else {
                return Err(CycleError::InsufficientCapacity {
                    target: count,
                    provisioned: count - remaining,
                });
            };

            let provisioned = self
                .provision(&current, remaining, first_index + nodes.len())
                .await?;
            let mut fresh = Vec::new();
            for mut node in provisioned.nodes {
                if seen.insert(node.instance_id.clone()) {
                    node.index = first_index + nodes.len() + fresh.len();
                    fresh.push(node);
                }
            }
            remaining -= self.covered(&current, fresh.len(), remaining);
            nodes.extend(fresh);

            if remaining > 0 {
                offer = offers.next_supported().await?;
            }
        }
        Ok(())
    }

    async fn terminate(&self, nodes: &[ProxyNode]) -> Result<(), CloudError> {
        if nodes.is_empty() {
            return Ok(());
        }
        let ids: Vec<InstanceId> = nodes.iter().map(|n| n.instance_id.clone()).collect();
        warn!(instances = ids.len(), "Terminating instances from aborted provisioning");
        self.cloud.terminate_instances(&ids).await
    }
}
