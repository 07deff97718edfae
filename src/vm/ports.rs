//! SSH forwarding port allocation.
//!
//! A [`PortPool`] hands out host ports from a configured range. Ports are
//! tracked in one set per pool so concurrent sessions never share a port,
//! and each candidate is probed before it is leased so ports held by other
//! processes are skipped. A [`PortLease`] returns its port on drop.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::PortRange;
use crate::error::{ForgeError, ForgeResult};

/// Returns true when `port` can currently be bound on the host.
pub type PortProbe = fn(u16) -> bool;

pub fn probe_tcp(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[derive(Debug)]
pub struct PortPool {
    leased: Arc<Mutex<BTreeSet<u16>>>,
    probe: PortProbe,
}

impl Default for PortPool {
    fn default() -> Self {
        Self::with_probe(probe_tcp)
    }
}

impl PortPool {
    pub fn with_probe(probe: PortProbe) -> Self {
        Self {
            leased: Arc::new(Mutex::new(BTreeSet::new())),
            probe,
        }
    }

    /// The pool shared by every session of this process.
    pub fn global() -> Arc<PortPool> {
        static GLOBAL: OnceLock<Arc<PortPool>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(PortPool::default())))
    }

    /// Lease the lowest free port of `range`.
    pub fn allocate(&self, range: PortRange) -> ForgeResult<PortLease> {
        let mut leased = self
            .leased
            .lock()
            .map_err(|_| anyhow::anyhow!("port pool lock poisoned"))?;

        for port in range.start..=range.end {
            if leased.contains(&port) || !(self.probe)(port) {
                continue;
            }
            leased.insert(port);
            tracing::debug!(port, "leased SSH port");
            return Ok(PortLease {
                port,
                leased: Arc::clone(&self.leased),
            });
        }

        Err(ForgeError::ResourceExhausted {
            start: range.start,
            end: range.end,
        })
    }

    pub fn leased_count(&self) -> usize {
        self.leased.lock().map(|set| set.len()).unwrap_or(0)
    }
}

/// A port reserved for one VM session.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    leased: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Ok(mut leased) = self.leased.lock() {
            leased.remove(&self.port);
        }
        tracing::debug!(port = self.port, "released SSH port");
    }
}
