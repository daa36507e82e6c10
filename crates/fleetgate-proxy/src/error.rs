//! Error types for the workload proxy.

use std::fmt;
use std::io;

use thiserror::Error;

use fleetgate_state::{Alias, ClusterId};

/// An alias is already claimed by another cluster.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("alias {alias:?} is already used by cluster {owner:?}")]
pub struct AliasConflict {
    pub alias: Alias,
    pub owner: ClusterId,
}

/// Errors raised by a single load balancer.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("address {0} is already in use")]
    AddressInUse(String),

    #[error("load balancer task failed: {0}")]
    Task(String),
}

/// Errors raised while forwarding a request to a load balancer.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("dial load balancer: {0}")]
    Dial(#[source] io::Error),

    #[error("http handshake: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("send request: {0}")]
    Request(#[source] hyper::Error),
}

/// Errors surfaced by reconciliation and shutdown.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Conflict(#[from] AliasConflict),

    #[error("cluster {cluster_id:?} alias {alias:?}: {source}")]
    Balancer {
        cluster_id: ClusterId,
        alias: Alias,
        #[source]
        source: BalancerError,
    },

    #[error("{}", JoinedErrors(.0))]
    Multiple(Vec<ProxyError>),

    #[error("workload proxy is shut down")]
    Closed,
}

impl ProxyError {
    /// Fold collected errors into a single result.
    pub fn collect(mut errors: Vec<ProxyError>) -> Result<(), ProxyError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ProxyError::Multiple(errors)),
        }
    }
}

struct JoinedErrors<'a>(&'a Vec<ProxyError>);

impl fmt::Display for JoinedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}
