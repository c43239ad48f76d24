//! Registry topology update body.

use serde::{Deserialize, Serialize};

use crate::ProtoError;

/// Shape of a [`TopologyUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// `old_ips` empty: new members joined the fleet.
    Add,
    /// `new_ips` empty: members left the fleet.
    Remove,
    /// Equal lengths: `old_ips[i]` is replaced by `new_ips[i]`.
    Replace,
}

/// Body of the registry's topology update endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyUpdate {
    pub old_ips: Vec<String>,
    pub new_ips: Vec<String>,
}

impl TopologyUpdate {
    pub fn add(new_ips: Vec<String>) -> Self {
        Self {
            old_ips: Vec::new(),
            new_ips,
        }
    }

    pub fn remove(old_ips: Vec<String>) -> Self {
        Self {
            old_ips,
            new_ips: Vec::new(),
        }
    }

    pub fn replace(old_ips: Vec<String>, new_ips: Vec<String>) -> Result<Self, ProtoError> {
        let update = Self { old_ips, new_ips };
        update.kind()?;
        Ok(update)
    }

    /// Classifies the update, rejecting the shapes the registry refuses.
    pub fn kind(&self) -> Result<UpdateKind, ProtoError> {
        match (self.old_ips.len(), self.new_ips.len()) {
            (0, 0) => Err(ProtoError::InvalidUpdate("both address lists are empty")),
            (0, _) => Ok(UpdateKind::Add),
            (_, 0) => Ok(UpdateKind::Remove),
            (old, new) if old == new => Ok(UpdateKind::Replace),
            _ => Err(ProtoError::InvalidUpdate(
                "old and new address lists differ in length",
            )),
        }
    }

    /// The old-to-new pairs of a replacement, in order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.old_ips
            .iter()
            .zip(self.new_ips.iter())
            .map(|(o, n)| (o.as_str(), n.as_str()))
    }
}
