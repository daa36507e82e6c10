//! Domain types for the fleetgate state store.
//!
//! These mirror the upstream resources the workload proxy watches, plus
//! the key and role records consulted when authorizing a proxied request.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a tenant cluster.
pub type ClusterId = String;

/// Unique identifier for a backend machine.
pub type MachineId = String;

/// Unique identifier for an exposed service resource.
pub type ServiceId = String;

/// Short public name of an exposed service, unique across all clusters.
pub type Alias = String;

// ── Cluster ───────────────────────────────────────────────────────

/// A tenant cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterRecord {
    pub id: ClusterId,
    /// Whether workload services of this cluster may be exposed.
    #[serde(default)]
    pub workload_proxy_enabled: bool,
}

// ── Machine ───────────────────────────────────────────────────────

/// Status of a backend machine belonging to a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineStatus {
    pub id: MachineId,
    pub cluster_id: ClusterId,
    /// Machine is admitted as a backend.
    #[serde(default)]
    pub ready: bool,
    /// Host (IP or hostname, no port) reachable from the control plane.
    #[serde(default)]
    pub management_address: String,
}

// ── Exposed service ───────────────────────────────────────────────

/// A workload service a cluster exposes through the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExposedService {
    pub id: ServiceId,
    pub cluster_id: ClusterId,
    pub alias: Alias,
    /// Port the service listens on, on every backend host.
    pub port: u16,
    /// Human-readable label shown in UIs.
    #[serde(default)]
    pub label: Option<String>,
}

// ── Access ────────────────────────────────────────────────────────

/// Access role, ordered from least to most privileged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    None,
    Reader,
    Operator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Reader => "reader",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    /// Whether this role grants at least the privileges of `other`.
    pub fn check(&self, other: Role) -> bool {
        *self >= other
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a role name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role {0:?}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Role::None),
            "reader" => Ok(Role::Reader),
            "operator" => Ok(Role::Operator),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// A registered public key used to sign workload-proxy cookies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicKeyRecord {
    pub id: String,
    /// Identity (user) that owns the key.
    pub identity: String,
    /// Base64 encoding of the raw key bytes.
    pub public_key: String,
    /// Unix timestamp (seconds) after which the key is no longer valid.
    pub expiration: u64,
    /// Role pinned on the key itself; overrides the identity's role.
    #[serde(default)]
    pub role: Option<Role>,
}

/// A user identity with its base role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub id: String,
    pub role: Role,
}

/// Per-cluster access grants: identity → role.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterAcl {
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub grants: HashMap<String, Role>,
}
