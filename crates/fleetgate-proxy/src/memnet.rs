//! In-process network used between the reverse proxy and the load balancers.
//!
//! Load balancers listen on synthetic `host:port` names that never touch a
//! real socket. Dialing a name hands the listener one end of an in-memory
//! duplex pipe.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::BalancerError;

/// Per-direction buffer of an in-memory connection.
const PIPE_BUFFER: usize = 64 * 1024;

/// Pending connections a listener may queue before dialers wait.
const BACKLOG: usize = 128;

struct Registration {
    id: u64,
    tx: mpsc::Sender<DuplexStream>,
}

/// Registry of in-memory listeners keyed by name.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, Registration>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener under `name`.
    pub fn listen(&self, name: &str) -> Result<MemoryListener, BalancerError> {
        let mut listeners = self.lock();
        if listeners.contains_key(name) {
            return Err(BalancerError::AddressInUse(name.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(BACKLOG);
        listeners.insert(name.to_string(), Registration { id, tx });
        trace!(%name, "memory listener registered");
        Ok(MemoryListener {
            name: name.to_string(),
            id,
            rx,
            network: self.clone(),
        })
    }

    /// Connect to the listener registered under `name`.
    pub async fn dial(&self, name: &str) -> io::Result<DuplexStream> {
        let tx = self
            .lock()
            .get(name)
            .map(|r| r.tx.clone())
            .ok_or_else(|| refused(name))?;
        let (client, server) = tokio::io::duplex(PIPE_BUFFER);
        tx.send(server).await.map_err(|_| refused(name))?;
        Ok(client)
    }

    /// Whether a listener is registered under `name`.
    pub fn is_listening(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    fn unregister(&self, name: &str, id: u64) {
        let mut listeners = self.lock();
        if listeners.get(name).is_some_and(|r| r.id == id) {
            listeners.remove(name);
            trace!(%name, "memory listener unregistered");
        }
    }
}

fn refused(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("nothing listening on {name}"),
    )
}

/// Accepting end of an in-memory address. Unregisters itself on drop.
pub struct MemoryListener {
    name: String,
    id: u64,
    rx: mpsc::Receiver<DuplexStream>,
    network: MemoryNetwork,
}

impl MemoryListener {
    /// Wait for the next inbound connection.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unregister(&self.name, self.id);
    }
}
