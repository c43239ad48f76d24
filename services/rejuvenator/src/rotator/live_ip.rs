use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spotproxy_id::{AllocationId, CycleSeq, InterfaceId};
use tracing::{debug, info, warn};

use super::IdentityRotator;
use crate::cloud::CloudProvider;
use crate::config::RotationMode;
use crate::decommission::Decommissioner;
use crate::error::{CloudError, CycleError};
use crate::model::{CheapestOffer, Generation, NicHandle, NodeState, ProxyNode};
use crate::provisioner::FleetProvisioner;
use crate::selector::InstanceSelector;

/// Keeps instances running and gives every interface a fresh public
/// address each cycle. Instances are only added when the existing ones
/// cannot host the target address count.
pub struct LiveIpRotator {
    cloud: Arc<dyn CloudProvider>,
    selector: InstanceSelector,
    provisioner: FleetProvisioner,
    decommissioner: Arc<Decommissioner>,
    settle_after_rotation: Duration,
}

/// Resources created so far in one build, for teardown on failure.
#[derive(Default)]
struct Partial {
    nodes: Vec<ProxyNode>,
    /// Allocated but not yet associated.
    loose: Vec<AllocationId>,
}

impl LiveIpRotator {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        selector: InstanceSelector,
        provisioner: FleetProvisioner,
        decommissioner: Arc<Decommissioner>,
        settle_after_rotation: Duration,
    ) -> Self {
        Self {
            cloud,
            selector,
            provisioner,
            decommissioner,
            settle_after_rotation,
        }
    }

    async fn build_into(
        &self,
        target: usize,
        previous: Option<&Generation>,
        partial: &mut Partial,
    ) -> Result<Option<CheapestOffer>, CycleError> {
        let mut left = target;

        // Retained instances first, in their previous order.
        let mut work: Vec<(usize, usize)> = Vec::new();
        if let Some(prev) = previous {
            for node in &prev.nodes {
                if left == 0 {
                    debug!(instance = %node.instance_id, "Instance not needed this cycle");
                    continue;
                }
                let slots = (node.max_interfaces.max(1) as usize).min(left);
                partial.nodes.push(ProxyNode {
                    index: partial.nodes.len(),
                    nics: Vec::with_capacity(slots),
                    state: NodeState::Provisioning,
                    ..node.clone()
                });
                work.push((partial.nodes.len() - 1, slots));
                left -= slots;
            }
        }

        let mut cheapest = previous.and_then(|p| p.cheapest.clone());
        if left > 0 {
            let mut offers = self.selector.select().await?;
            let offer = offers.cheapest().await?;
            info!(
                instance_type = %offer.instance_type,
                zone = %offer.zone,
                max_interfaces = offer.max_interfaces,
                addresses = left,
                "Provisioning instances for address shortfall"
            );
            let launched = self
                .provisioner
                .fill(&mut offers, offer.clone(), left, partial.nodes.len())
                .await?;
            cheapest = Some(CheapestOffer {
                instances_needed: self.provisioner.instances_for(&offer, left),
                offer,
            });

            for node in launched {
                let slots = (node.max_interfaces.max(1) as usize).min(left);
                partial.nodes.push(ProxyNode {
                    index: partial.nodes.len(),
                    nics: Vec::with_capacity(slots),
                    ..node
                });
                work.push((partial.nodes.len() - 1, slots));
                left = left.saturating_sub(slots);
            }
        }

        let Partial { nodes, loose } = partial;
        for (position, slots) in work {
            self.rotate(&mut nodes[position], slots, loose).await?;
        }
        Ok(cheapest)
    }

    /// Give `node` `slots` freshly addressed interfaces, reusing those
    /// already attached and attaching more when short. The primary
    /// interface stays last.
    async fn rotate(
        &self,
        node: &mut ProxyNode,
        slots: usize,
        loose: &mut Vec<AllocationId>,
    ) -> Result<(), CycleError> {
        if slots == 0 {
            return Ok(());
        }

        let attached = self.cloud.attached_interfaces(&node.instance_id).await?;
        let mut interfaces: Vec<InterfaceId> = attached
            .into_iter()
            .filter(|i| *i != node.primary_interface)
            .take(slots - 1)
            .collect();
        while interfaces.len() < slots - 1 {
            let interface = self.cloud.create_interface(&node.zone).await?;
            self.cloud
                .attach_interface(&interface, &node.instance_id)
                .await?;
            debug!(instance = %node.instance_id, interface = %interface, "Attached interface");
            interfaces.push(interface);
        }
        interfaces.push(node.primary_interface.clone());

        for interface in interfaces {
            let allocation = self.cloud.allocate_address().await?;
            loose.push(allocation.allocation_id.clone());
            let association = self
                .cloud
                .associate_address(&allocation.allocation_id, &interface)
                .await?;
            loose.pop();
            node.nics.push(NicHandle {
                interface_id: interface,
                address: allocation.public_address,
                allocation_id: Some(allocation.allocation_id),
                association_id: Some(association),
            });
        }

        info!(
            instance = %node.instance_id,
            addresses = node.nics.len(),
            "Rotated instance addresses"
        );
        Ok(())
    }

    /// Undo a failed build without touching anything `previous` still holds.
    async fn abandon(
        &self,
        seq: CycleSeq,
        partial: Partial,
        previous: Option<&Generation>,
    ) -> Result<(), CloudError> {
        for allocation in &partial.loose {
            self.cloud.release_address(allocation).await?;
        }
        let abandoned = Generation::new(seq, partial.nodes, None);
        self.decommissioner.decommission(&abandoned, previous).await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityRotator for LiveIpRotator {
    fn mode(&self) -> RotationMode {
        RotationMode::LiveIp
    }

    async fn build_generation(
        &self,
        seq: CycleSeq,
        target: usize,
        previous: Option<&Generation>,
    ) -> Result<Generation, CycleError> {
        let mut partial = Partial::default();
        match self.build_into(target, previous, &mut partial).await {
            Ok(cheapest) => {
                if !self.settle_after_rotation.is_zero() {
                    tokio::time::sleep(self.settle_after_rotation).await;
                }
                Ok(Generation::new(seq, partial.nodes, cheapest))
            }
            Err(e) => {
                warn!(cycle = %seq, error = %e, "Address rotation failed; releasing new resources");
                match self.abandon(seq, partial, previous).await {
                    Ok(()) => Err(e),
                    Err(cleanup) => Err(CycleError::teardown_failed(e, cleanup)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudOp, MockCloud};
    use crate::config::Config;
    use crate::model::Arch;
    use std::collections::HashSet;

    fn rotator(cloud: &Arc<MockCloud>, fleet_size: usize) -> Box<dyn IdentityRotator> {
        let config = Config::for_tests(RotationMode::LiveIp, fleet_size);
        let cloud: Arc<dyn CloudProvider> = cloud.clone();
        super::super::for_config(
            Arc::clone(&cloud),
            &config,
            Arc::new(Decommissioner::new(cloud)),
        )
    }

    fn cloud() -> Arc<MockCloud> {
        Arc::new(
            MockCloud::new()
                .with_offer("c5.large", "us-east-1a", 0.040, 2, &[Arch::X86_64])
                .with_offer("c5.xlarge", "us-east-1a", 0.200, 4, &[Arch::X86_64]),
        )
    }

    #[tokio::test]
    async fn test_bootstrap_provisions_ceil_instances() {
        let cloud = cloud();
        let rotator = rotator(&cloud, 5);

        let generation = rotator
            .build_generation(CycleSeq::FIRST, 5, None)
            .await
            .unwrap();

        // 0.040 at 2 interfaces beats 0.200 at 4 per usable address.
        assert_eq!(generation.nodes.len(), 3);
        assert_eq!(generation.nics().count(), 5);
        assert_eq!(generation.cheapest.as_ref().unwrap().instances_needed, 3);
        assert_eq!(cloud.allocated_addresses().await.len(), 5);
        assert_eq!(cloud.association_count().await, 5);

        for node in &generation.nodes {
            let last = node.nics.last().unwrap();
            assert_eq!(last.interface_id, node.primary_interface);
        }
    }

    #[tokio::test]
    async fn test_rotation_keeps_instances_and_interfaces() {
        let cloud = cloud();
        let rotator = rotator(&cloud, 3);

        let first = rotator
            .build_generation(CycleSeq::FIRST, 3, None)
            .await
            .unwrap();
        let second = rotator
            .build_generation(CycleSeq::FIRST.next(), 3, Some(&first))
            .await
            .unwrap();

        assert_eq!(first.instance_ids(), second.instance_ids());
        let old: HashSet<_> = first.addresses().into_iter().collect();
        assert!(second.addresses().iter().all(|a| !old.contains(a)));
        for (a, b) in first.nodes.iter().zip(&second.nodes) {
            assert_eq!(a.interfaces(), b.interfaces());
        }
        // Old addresses stay allocated until the handshake retires them.
        assert_eq!(cloud.allocated_addresses().await.len(), 6);
    }

    #[tokio::test]
    async fn test_failed_association_releases_new_addresses_only() {
        let cloud = cloud();
        let rotator = rotator(&cloud, 2);

        let first = rotator
            .build_generation(CycleSeq::FIRST, 2, None)
            .await
            .unwrap();
        cloud.inject_failure(CloudOp::AssociateAddress).await;

        let err = rotator
            .build_generation(CycleSeq::FIRST.next(), 2, Some(&first))
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::Cloud(_)));

        let mut allocated = cloud.allocated_addresses().await;
        let mut expected = first.addresses();
        allocated.sort();
        expected.sort();
        assert_eq!(allocated, expected);
        let running: HashSet<_> = cloud.running_instances().await.into_iter().collect();
        let kept: HashSet<_> = first.instance_ids().into_iter().collect();
        assert_eq!(running, kept);
    }

    #[tokio::test]
    async fn test_shrinking_target_leaves_surplus_for_retirement() {
        let cloud = cloud();
        let rotator = rotator(&cloud, 5);

        let first = rotator
            .build_generation(CycleSeq::FIRST, 5, None)
            .await
            .unwrap();
        assert_eq!(first.nodes.len(), 3);
        let second = rotator
            .build_generation(CycleSeq::FIRST.next(), 2, Some(&first))
            .await
            .unwrap();

        // The first instance hosts both addresses; the other two are surplus.
        assert_eq!(second.instance_ids(), vec![first.nodes[0].instance_id.clone()]);
        assert_eq!(second.nics().count(), 2);
        assert_eq!(cloud.running_instances().await.len(), 3);

        let decommissioner = Decommissioner::new(cloud.clone());
        let summary = decommissioner
            .decommission(&first, Some(&second))
            .await
            .unwrap();
        assert_eq!(
            summary.terminated,
            vec![
                first.nodes[1].instance_id.clone(),
                first.nodes[2].instance_id.clone()
            ]
        );
        assert_eq!(summary.released, 5);
        assert_eq!(cloud.running_instances().await, second.instance_ids());

        let mut expected = second.addresses();
        expected.sort();
        assert_eq!(cloud.allocated_addresses().await, expected);
    }

    #[tokio::test]
    async fn test_association_failure_midway_releases_loose_addresses() {
        let cloud = cloud();
        let rotator = rotator(&cloud, 4);

        let first = rotator
            .build_generation(CycleSeq::FIRST, 4, None)
            .await
            .unwrap();
        assert_eq!(first.nodes.len(), 2);
        // The first instance rotates fully; the second fails on its first
        // association with an allocation in hand.
        cloud
            .inject_failure_after(CloudOp::AssociateAddress, 2)
            .await;

        let err = rotator
            .build_generation(CycleSeq::FIRST.next(), 4, Some(&first))
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::Cloud(_)));

        let mut expected = first.addresses();
        expected.sort();
        assert_eq!(cloud.allocated_addresses().await, expected);
        assert_eq!(cloud.association_count().await, 4);
        let running: HashSet<_> = cloud.running_instances().await.into_iter().collect();
        let kept: HashSet<_> = first.instance_ids().into_iter().collect();
        assert_eq!(running, kept);
    }
}
