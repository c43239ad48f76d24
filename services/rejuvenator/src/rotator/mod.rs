//! Identity rotation strategies.
//!
//! Both strategies build the next generation from the previous one and
//! leave retirement of the previous generation to the handshake. A
//! strategy that fails part-way tears down whatever it created before
//! returning the error.

use std::sync::Arc;

use async_trait::async_trait;
use spotproxy_id::CycleSeq;

use crate::cloud::CloudProvider;
use crate::config::{Config, RotationMode};
use crate::decommission::Decommissioner;
use crate::error::CycleError;
use crate::model::Generation;
use crate::provisioner::{FleetProvisioner, ProvisionUnits};
use crate::selector::InstanceSelector;

mod live_ip;
mod whole_instance;

pub use live_ip::LiveIpRotator;
pub use whole_instance::WholeInstanceRotator;

#[async_trait]
pub trait IdentityRotator: Send + Sync {
    fn mode(&self) -> RotationMode;

    /// Build (but do not verify or advertise) the generation for cycle `seq`.
    async fn build_generation(
        &self,
        seq: CycleSeq,
        target: usize,
        previous: Option<&Generation>,
    ) -> Result<Generation, CycleError>;
}

/// Rotator for the configured mode.
pub fn for_config(
    cloud: Arc<dyn CloudProvider>,
    config: &Config,
    decommissioner: Arc<Decommissioner>,
) -> Box<dyn IdentityRotator> {
    let selector = InstanceSelector::from_config(Arc::clone(&cloud), config);
    match config.mode {
        RotationMode::WholeInstance => Box::new(WholeInstanceRotator::new(
            selector,
            FleetProvisioner::new(
                Arc::clone(&cloud),
                config.settle_after_create,
                ProvisionUnits::Instances,
            ),
        )),
        RotationMode::LiveIp => Box::new(LiveIpRotator::new(
            Arc::clone(&cloud),
            selector,
            FleetProvisioner::new(
                Arc::clone(&cloud),
                config.settle_after_create,
                ProvisionUnits::Addresses,
            ),
            decommissioner,
            config.settle_after_rotation,
        )),
    }
}
