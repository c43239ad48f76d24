//! Fleet data model: offers, proxy nodes, NIC handles and generations.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spotproxy_id::{AllocationId, AssociationId, CycleSeq, InstanceId, InterfaceId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "i386")]
    I386,
}

#[derive(Debug, Error)]
#[error("unknown architecture '{0}'")]
pub struct UnknownArch(pub String);

impl std::str::FromStr for Arch {
    type Err = UnknownArch;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "i386" => Ok(Arch::I386),
            other => Err(UnknownArch(other.to_string())),
        }
    }
}

/// Raw spot market quote as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotQuote {
    pub instance_type: String,
    pub zone: String,
    /// Hourly price.
    pub price: f64,
    pub max_interfaces: u32,
}

/// A quote the selector accepted: architecture-checked and ranked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Offer {
    pub instance_type: String,
    pub zone: String,
    pub price: f64,
    /// Price the offer was ranked by (per instance or per usable interface).
    pub effective_price: f64,
    pub max_interfaces: u32,
    pub architectures: Vec<Arch>,
    /// The supported architecture the fleet will run on this offer.
    pub arch: Arch,
}

/// Lifecycle of a proxy node within one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Provisioning,
    Verified,
    Serving,
    Retired,
}

/// One usable network path out of an instance.
///
/// `allocation_id`/`association_id` are set for addresses the fleet owns
/// (live-IP mode). Addresses auto-assigned at launch have neither; they go
/// away with the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NicHandle {
    pub interface_id: InterfaceId,
    pub address: IpAddr,
    pub allocation_id: Option<AllocationId>,
    pub association_id: Option<AssociationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyNode {
    /// Stable position within the batch.
    pub index: usize,
    pub instance_id: InstanceId,
    pub instance_type: String,
    pub zone: String,
    pub hourly_cost: f64,
    pub arch: Arch,
    pub max_interfaces: u32,
    /// Interface the instance was launched with.
    pub primary_interface: InterfaceId,
    /// Address paths, auxiliary interfaces first and the primary interface last.
    pub nics: Vec<NicHandle>,
    pub state: NodeState,
}

impl ProxyNode {
    /// Address advertised for reachability checks: the one on the primary
    /// interface, falling back to the last handle.
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.nics
            .iter()
            .rev()
            .find(|n| n.interface_id == self.primary_interface)
            .or_else(|| self.nics.last())
            .map(|n| n.address)
    }

    /// Interfaces in NIC order, primary last, without duplicates.
    pub fn interfaces(&self) -> Vec<InterfaceId> {
        let mut seen = HashSet::new();
        self.nics
            .iter()
            .map(|n| n.interface_id.clone())
            .filter(|i| seen.insert(i.clone()))
            .collect()
    }
}

/// Cheapest accepted offer of a cycle and the instance count it implies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheapestOffer {
    pub offer: Offer,
    pub instances_needed: usize,
}

/// The fleet as of one rejuvenation cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    pub seq: CycleSeq,
    pub nodes: Vec<ProxyNode>,
    pub cheapest: Option<CheapestOffer>,
    pub created_at: DateTime<Utc>,
}

impl Generation {
    pub fn new(seq: CycleSeq, nodes: Vec<ProxyNode>, cheapest: Option<CheapestOffer>) -> Self {
        Self {
            seq,
            nodes,
            cheapest,
            created_at: Utc::now(),
        }
    }

    /// Every NIC address, in node order then NIC order.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.nics().map(|n| n.address).collect()
    }

    /// One address per node, as probed by the health verifier.
    pub fn primary_addresses(&self) -> Vec<IpAddr> {
        self.nodes
            .iter()
            .filter_map(ProxyNode::primary_address)
            .collect()
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.nodes.iter().map(|n| n.instance_id.clone()).collect()
    }

    pub fn nics(&self) -> impl Iterator<Item = &NicHandle> {
        self.nodes.iter().flat_map(|n| n.nics.iter())
    }

    pub fn contains_instance(&self, id: &InstanceId) -> bool {
        self.nodes.iter().any(|n| &n.instance_id == id)
    }

    pub fn set_state(&mut self, state: NodeState) {
        for node in &mut self.nodes {
            node.state = state;
        }
    }

    /// JSON snapshot for operator logs.
    pub fn snapshot(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("<unserializable: {e}>"))
    }
}
