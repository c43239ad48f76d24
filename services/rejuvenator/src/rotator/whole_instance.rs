use async_trait::async_trait;
use spotproxy_id::CycleSeq;
use tracing::info;

use super::IdentityRotator;
use crate::config::RotationMode;
use crate::error::CycleError;
use crate::model::{CheapestOffer, Generation};
use crate::provisioner::FleetProvisioner;
use crate::selector::InstanceSelector;

/// Replaces every instance each cycle with fresh ones on the cheapest
/// acceptable offers.
pub struct WholeInstanceRotator {
    selector: InstanceSelector,
    provisioner: FleetProvisioner,
}

impl WholeInstanceRotator {
    pub fn new(selector: InstanceSelector, provisioner: FleetProvisioner) -> Self {
        Self {
            selector,
            provisioner,
        }
    }
}

#[async_trait]
impl IdentityRotator for WholeInstanceRotator {
    fn mode(&self) -> RotationMode {
        RotationMode::WholeInstance
    }

    async fn build_generation(
        &self,
        seq: CycleSeq,
        target: usize,
        _previous: Option<&Generation>,
    ) -> Result<Generation, CycleError> {
        let mut offers = self.selector.select().await?;
        let offer = offers.cheapest().await?;
        info!(
            cycle = %seq,
            instance_type = %offer.instance_type,
            zone = %offer.zone,
            price = offer.price,
            target,
            "Building replacement fleet"
        );

        let nodes = self
            .provisioner
            .fill(&mut offers, offer.clone(), target, 0)
            .await?;

        Ok(Generation::new(
            seq,
            nodes,
            Some(CheapestOffer {
                offer,
                instances_needed: target,
            }),
        ))
    }
}
