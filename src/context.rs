use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// A [ConnectionContext] is the identity of a single physical connection as the transport sees
///  it. It is an immutable value: there are accessors, but no setters.
///
/// The remote IP address is an IPv4 address in 'host representation', i.e. the first octet of
///  the dotted notation is the *least* significant byte. `0x0100007F` is `127.0.0.1`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct ConnectionContext {
    connection_id: Uuid,
    remote_ip: u32,
    remote_port: u16,
    is_incoming: bool,
}

impl Debug for ConnectionContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", crate::format::format_context(self))
    }
}

impl ConnectionContext {
    pub fn new(connection_id: Uuid, remote_ip: u32, remote_port: u16, is_incoming: bool) -> ConnectionContext {
        ConnectionContext {
            connection_id,
            remote_ip,
            remote_port,
            is_incoming,
        }
    }

    /// IPv6 peers that are not IPv4-mapped have no representation in a context, their address
    ///  is recorded as `0`.
    pub fn from_socket_addr(connection_id: Uuid, addr: SocketAddr, is_incoming: bool) -> ConnectionContext {
        let ip = match addr {
            SocketAddr::V4(a) => Some(*a.ip()),
            SocketAddr::V6(a) => a.ip().to_ipv4_mapped(),
        };

        let remote_ip = match ip {
            Some(ip) => ip_to_host_repr(ip),
            None => {
                debug!("remote address {:?} has no IPv4 representation", addr);
                0
            }
        };

        ConnectionContext::new(connection_id, remote_ip, addr.port(), is_incoming)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn remote_ip(&self) -> u32 {
        self.remote_ip
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn is_incoming(&self) -> bool {
        self.is_incoming
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(ip_from_host_repr(self.remote_ip), self.remote_port)
    }
}

pub fn ip_to_host_repr(ip: Ipv4Addr) -> u32 {
    u32::from_le_bytes(ip.octets())
}

pub fn ip_from_host_repr(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_le_bytes())
}


/// The mutable slot holding a connection's current [ConnectionContext]. Replacing the value is
///  a single atomic pointer swap, so readers see either the old or the new context in full.
///
/// The slot is only reachable through a [ContextOwner] (read-write, held by the transport) or a
///  [ContextView] (read-only, handed to protocol code).
type ContextSlot = Arc<ArcSwap<ConnectionContext>>;

/// Exclusive write access to a context slot, held by the transport. Not `Clone`, and resetting
///  requires `&mut self`.
pub struct ContextOwner {
    slot: ContextSlot,
}

impl Debug for ContextOwner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContextOwner{{{:?}}}", self.slot.load())
    }
}

impl Default for ContextOwner {
    fn default() -> Self {
        ContextOwner::new(ConnectionContext::default())
    }
}

impl ContextOwner {
    pub fn new(ctx: ConnectionContext) -> ContextOwner {
        ContextOwner {
            slot: Arc::new(ArcSwap::from_pointee(ctx)),
        }
    }

    /// Replaces all four fields as a unit, e.g. when a pooled slot is reused for a new
    ///  physical connection.
    pub fn reset(&mut self, connection_id: Uuid, remote_ip: u32, remote_port: u16, is_incoming: bool) {
        self.assign(&ConnectionContext::new(connection_id, remote_ip, remote_port, is_incoming));
    }

    pub fn assign(&mut self, ctx: &ConnectionContext) {
        trace!("resetting context slot to {:?}", ctx);
        self.slot.store(Arc::new(*ctx));
    }

    pub fn load(&self) -> Arc<ConnectionContext> {
        self.slot.load_full()
    }

    pub fn view(&self) -> ContextView {
        ContextView {
            slot: self.slot.clone(),
        }
    }
}

/// Read-only access to a context slot, this is what protocol handlers get.
#[derive(Clone)]
pub struct ContextView {
    slot: ContextSlot,
}

impl Debug for ContextView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.slot.load())
    }
}

impl ContextView {
    /// a consistent snapshot of the slot's current value
    pub fn load(&self) -> Arc<ConnectionContext> {
        self.slot.load_full()
    }
}


/// Pool of context slots for transports recycling per-connection objects. Slots in excess of the
///  pool's capacity are discarded when they are returned.
pub struct ContextPool {
    max_pool_size: usize,
    slots: Mutex<Vec<ContextOwner>>,
}

impl ContextPool {
    pub fn new(max_pool_size: usize) -> ContextPool {
        ContextPool {
            max_pool_size,
            slots: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self, ctx: &ConnectionContext) -> ContextOwner {
        let pooled = match self.slots.lock() {
            Ok(mut slots) => slots.pop(),
            Err(_) => {
                warn!("context pool is poisoned, not reusing slots");
                None
            }
        };

        match pooled {
            Some(mut owner) => {
                trace!("reusing pooled context slot");
                owner.assign(ctx);
                owner
            }
            None => {
                debug!("no context slot in pool: creating new slot");
                ContextOwner::new(*ctx)
            }
        }
    }

    pub fn return_to_pool(&self, owner: ContextOwner) {
        let Ok(mut slots) = self.slots.lock() else {
            warn!("context pool is poisoned, discarding returned context slot");
            return;
        };

        if self.max_pool_size > slots.len() {
            trace!("returning context slot to pool");
            slots.push(owner);
        }
        else {
            debug!("pool is full: discarding returned context slot");
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.slots.lock()
            .map(|s| s.len())
            .unwrap_or(0)
    }
}
