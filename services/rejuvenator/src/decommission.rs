//! Decommissioning of generations.
//!
//! Retiring the previous generation after a handshake and tearing down an
//! aborted cycle's new resources are the same operation seen from opposite
//! sides: release every owned address and terminate every instance of one
//! generation that the surviving generation does not hold.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use spotproxy_id::{AllocationId, AssociationId, InstanceId};
use tracing::{info, warn};

use crate::cloud::CloudProvider;
use crate::error::CloudError;
use crate::model::Generation;

/// What a decommission pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecommissionSummary {
    pub disassociated: usize,
    pub released: usize,
    pub terminated: Vec<InstanceId>,
}

pub struct Decommissioner {
    cloud: Arc<dyn CloudProvider>,
}

impl Decommissioner {
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self { cloud }
    }

    /// Remove everything `retiring` owns that `survivors` does not.
    ///
    /// Addresses are disassociated before they are released, and released
    /// before their instances are terminated.
    pub async fn decommission(
        &self,
        retiring: &Generation,
        survivors: Option<&Generation>,
    ) -> Result<DecommissionSummary, CloudError> {
        let kept_allocations: HashSet<&AllocationId> = survivors
            .into_iter()
            .flat_map(|g| g.nics())
            .filter_map(|n| n.allocation_id.as_ref())
            .collect();
        let kept_associations: HashSet<&AssociationId> = survivors
            .into_iter()
            .flat_map(|g| g.nics())
            .filter_map(|n| n.association_id.as_ref())
            .collect();

        let mut summary = DecommissionSummary::default();

        for nic in retiring.nics() {
            let Some(allocation) = nic.allocation_id.as_ref() else {
                continue;
            };
            if kept_allocations.contains(allocation) {
                continue;
            }

            if let Some(association) = nic.association_id.as_ref() {
                if !kept_associations.contains(association) {
                    match self.cloud.disassociate_address(association).await {
                        Ok(()) => summary.disassociated += 1,
                        // Already gone with a terminated instance.
                        Err(CloudError::NotFound { .. }) => {
                            warn!(association = %association, "Association already gone")
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            self.cloud.release_address(allocation).await?;
            summary.released += 1;
        }

        let terminate: Vec<InstanceId> = retiring
            .nodes
            .iter()
            .map(|n| n.instance_id.clone())
            .filter(|id| !survivors.is_some_and(|g| g.contains_instance(id)))
            .collect();
        if !terminate.is_empty() {
            self.cloud.terminate_instances(&terminate).await?;
            summary.terminated = terminate;
        }

        info!(
            generation = %retiring.seq,
            disassociated = summary.disassociated,
            released = summary.released,
            terminated = summary.terminated.len(),
            "Decommissioned generation"
        );
        Ok(summary)
    }
}
