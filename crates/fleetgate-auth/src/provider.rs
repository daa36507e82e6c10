//! Lookups the validator depends on: stored keys and cluster roles.

use async_trait::async_trait;

use fleetgate_state::{PublicKeyRecord, Role, StateError, StateStore};

/// Who is making a request, as established by a validated key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub identity: String,
    /// Role pinned on the key, used instead of the identity's own role.
    pub role: Option<Role>,
}

/// Source of registered public keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn public_key(&self, id: &str) -> Result<Option<PublicKeyRecord>, StateError>;
}

/// Resolves the effective role of an actor on a cluster.
#[async_trait]
pub trait RoleProvider: Send + Sync {
    async fn cluster_role(&self, actor: &Actor, cluster_id: &str) -> Result<Role, StateError>;
}

#[async_trait]
impl KeyStore for StateStore {
    async fn public_key(&self, id: &str) -> Result<Option<PublicKeyRecord>, StateError> {
        self.get_public_key(id)
    }
}

/// Base role (key role, else the identity's role) raised by any ACL grant
/// for the cluster.
#[async_trait]
impl RoleProvider for StateStore {
    async fn cluster_role(&self, actor: &Actor, cluster_id: &str) -> Result<Role, StateError> {
        let base = match actor.role {
            Some(role) => role,
            None => self
                .get_identity(&actor.identity)?
                .map(|i| i.role)
                .unwrap_or_default(),
        };
        let grant = self
            .get_acl(cluster_id)?
            .and_then(|acl| acl.grants.get(&actor.identity).copied())
            .unwrap_or_default();
        Ok(base.max(grant))
    }
}
