//! Cookie signature and role check for proxied requests.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use fleetgate_state::{Role, StateStore};

use crate::error::{AccessError, ValidationFailure};
use crate::keys::parse_public_key;
use crate::provider::{Actor, KeyStore, RoleProvider};

/// Checks that a signed public key ID grants access to a cluster.
#[derive(Clone)]
pub struct AccessValidator {
    keys: Arc<dyn KeyStore>,
    roles: Arc<dyn RoleProvider>,
}

impl AccessValidator {
    pub fn new(keys: Arc<dyn KeyStore>, roles: Arc<dyn RoleProvider>) -> Self {
        Self { keys, roles }
    }

    /// Keys and roles both served by the state store.
    pub fn from_store(store: StateStore) -> Self {
        let store = Arc::new(store);
        Self::new(store.clone(), store)
    }

    /// Allow the request only if `signature_base64` is a valid signature of
    /// `public_key_id` by that key and the key's owner is at least a reader
    /// on `cluster_id`.
    pub async fn validate_access(
        &self,
        public_key_id: &str,
        signature_base64: &str,
        cluster_id: &str,
    ) -> Result<(), AccessError> {
        match self.check(public_key_id, signature_base64, cluster_id).await {
            Ok(actor) => {
                debug!(%cluster_id, identity = %actor.identity, "access granted");
                Ok(())
            }
            Err(reason) => {
                debug!(%cluster_id, key_id = %public_key_id, %reason, "access denied");
                Err(reason.into())
            }
        }
    }

    async fn check(
        &self,
        public_key_id: &str,
        signature_base64: &str,
        cluster_id: &str,
    ) -> Result<Actor, ValidationFailure> {
        let signature = STANDARD
            .decode(signature_base64.trim())
            .map_err(|_| ValidationFailure::SignatureEncoding)?;

        let record = self
            .keys
            .public_key(public_key_id)
            .await
            .map_err(|e| ValidationFailure::Lookup(e.to_string()))?
            .ok_or(ValidationFailure::UnknownKey)?;

        let key = parse_public_key(&record, unix_now())?;
        key.verify(public_key_id.as_bytes(), &signature)?;

        let actor = Actor {
            identity: key.identity,
            role: key.role,
        };
        let role = self
            .roles
            .cluster_role(&actor, cluster_id)
            .await
            .map_err(|e| ValidationFailure::Lookup(e.to_string()))?;
        if !role.check(Role::Reader) {
            return Err(ValidationFailure::InsufficientRole { role });
        }
        Ok(actor)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
