//! Change events published by the store.
//!
//! The three resource kinds the workload proxy cares about are carried in
//! one sum type, so consumers dispatch with a single `match`.

use serde::{Deserialize, Serialize};

use crate::types::{ClusterId, ClusterRecord, ExposedService, MachineStatus};

/// A created/updated or destroyed resource.
///
/// `Destroyed` carries the last stored value so consumers can find the
/// owning cluster without keeping their own reverse index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "resource", rename_all = "snake_case")]
pub enum Change<T> {
    Upserted(T),
    Destroyed(T),
}

impl<T> Change<T> {
    pub fn resource(&self) -> &T {
        match self {
            Change::Upserted(r) | Change::Destroyed(r) => r,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, Change::Destroyed(_))
    }
}

/// A change to one of the watched resource kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceEvent {
    Cluster(Change<ClusterRecord>),
    MachineStatus(Change<MachineStatus>),
    ExposedService(Change<ExposedService>),
}

impl ResourceEvent {
    /// The cluster whose desired state this event affects.
    pub fn cluster_id(&self) -> &ClusterId {
        match self {
            ResourceEvent::Cluster(c) => &c.resource().id,
            ResourceEvent::MachineStatus(c) => &c.resource().cluster_id,
            ResourceEvent::ExposedService(c) => &c.resource().cluster_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_id_dispatches_on_kind() {
        let ev = ResourceEvent::MachineStatus(Change::Destroyed(MachineStatus {
            id: "m1".into(),
            cluster_id: "c1".into(),
            ready: true,
            management_address: "10.0.0.1".into(),
        }));
        assert_eq!(ev.cluster_id(), "c1");
        assert!(matches!(&ev, ResourceEvent::MachineStatus(c) if c.is_destroyed()));
    }
}
