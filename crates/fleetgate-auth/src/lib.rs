//! fleetgate-auth — decides whether a proxied request may reach a cluster.
//!
//! A browser proves its identity with two cookies: a public key ID and a
//! base64 signature over that ID made with the matching private key. The
//! [`AccessValidator`] checks the signature against the registered key,
//! then resolves the caller's role for the target cluster and requires at
//! least [`Role::Reader`](fleetgate_state::Role::Reader).
//!
//! Every failure is reported as the same opaque [`AccessError`].

pub mod error;
pub mod keys;
pub mod provider;
pub mod validator;

pub use error::{AccessError, KeyError, ValidationFailure};
pub use keys::{ValidatedKey, parse_public_key};
pub use provider::{Actor, KeyStore, RoleProvider};
pub use validator::AccessValidator;
