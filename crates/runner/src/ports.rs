//! Port allocation for concurrently running scenarios
//!
//! Ports are drawn at random from the non-privileged range and checked only
//! against the ports this run has already handed out, not against what the OS
//! has bound. A [`PortLease`] returns its port to the pool when dropped.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

pub const PORT_MIN: u16 = 1024;
pub const PORT_MAX: u16 = 65535;

#[derive(Debug, Default)]
pub struct PortAllocator {
    issued: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lease a port no live lease holds.
    pub fn allocate(self: &Arc<Self>) -> PortLease {
        let mut rng = rand::thread_rng();
        let mut issued = self.issued.lock();
        loop {
            let port = rng.gen_range(PORT_MIN..=PORT_MAX);
            if issued.insert(port) {
                return PortLease {
                    port,
                    allocator: Arc::clone(self),
                };
            }
        }
    }

    /// Lease the server/mock pair for one scenario.
    pub fn allocate_pair(self: &Arc<Self>) -> PortPair {
        PortPair {
            server: self.allocate(),
            mock: self.allocate(),
        }
    }

    pub fn is_issued(&self, port: u16) -> bool {
        self.issued.lock().contains(&port)
    }

    pub fn issued_count(&self) -> usize {
        self.issued.lock().len()
    }

    fn release(&self, port: u16) {
        self.issued.lock().remove(&port);
    }
}

/// Exclusive ownership of one port for a scenario's lifetime
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortLease").field(&self.port).finish()
    }
}

impl fmt::Display for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port)
    }
}

/// The two ports a scenario needs
#[derive(Debug)]
pub struct PortPair {
    pub server: PortLease,
    pub mock: PortLease,
}
