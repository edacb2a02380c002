//! Mapping between the `connectionId`s callers send and the ids the routing
//! engine indexes by.
//!
//! Under transport binding the two are the same: the socket's own id. Under
//! declared binding a gateway peer speaks for many apps, and two peers may
//! both declare id 7. Each `(peer socket, declared id)` pair is therefore
//! given its own routed id, and every delivery resolves that routed id back
//! to the peer socket carrying it and the id the peer declared.

use std::sync::atomic::{AtomicU32, Ordering};

use capbroker_core::{ConnectionId, RequestContext};
use dashmap::DashMap;
use tracing::debug;

use super::config::ContextBinding;

/// Where a routed id is delivered: the socket to write to and the
/// `connectionId` to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub socket: ConnectionId,
    pub wire_id: ConnectionId,
}

/// Shared by the classifier (inbound), the gateway (outbound), and session
/// teardown.
#[derive(Debug)]
pub struct ConnectionBindings {
    mode: ContextBinding,
    routed: DashMap<(ConnectionId, ConnectionId), ConnectionId>,
    routes: DashMap<ConnectionId, Route>,
    next_id: AtomicU32,
}

impl ConnectionBindings {
    #[must_use]
    pub fn new(mode: ContextBinding) -> Self {
        Self {
            mode,
            routed: DashMap::new(),
            routes: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ContextBinding {
        self.mode
    }

    /// Rewrites `context.connection_id`, received on socket `peer`, to the id
    /// the engine should see.
    ///
    /// A declared id that does not parse is left as is so the engine rejects
    /// it as a bad parameter.
    pub fn bind(&self, peer: ConnectionId, context: &mut RequestContext) {
        let routed = match self.mode {
            ContextBinding::Transport => peer,
            ContextBinding::Declared => match ConnectionId::parse(&context.connection_id) {
                Some(declared) => self.alias(peer, declared),
                None => return,
            },
        };
        context.connection_id = routed.to_string();
    }

    /// Resolves a routed id for delivery. `None` once the declared
    /// connection or its peer has closed.
    #[must_use]
    pub fn route(&self, routed: ConnectionId) -> Option<Route> {
        match self.mode {
            ContextBinding::Transport => Some(Route {
                socket: routed,
                wire_id: routed,
            }),
            ContextBinding::Declared => self.routes.get(&routed).map(|route| *route),
        }
    }

    /// Forgets the declared connection `declared` behind `peer`, returning
    /// the routed id whose broker state should be cleaned up.
    pub fn release(&self, peer: ConnectionId, declared: ConnectionId) -> Option<ConnectionId> {
        if self.mode == ContextBinding::Transport {
            return None;
        }
        let (_, routed) = self.routed.remove(&(peer, declared))?;
        self.routes.remove(&routed);
        Some(routed)
    }

    /// Forgets everything carried by socket `peer`, returning every routed id
    /// whose broker state should be cleaned up.
    pub fn release_peer(&self, peer: ConnectionId) -> Vec<ConnectionId> {
        if self.mode == ContextBinding::Transport {
            return vec![peer];
        }
        let mut released = Vec::new();
        self.routed.retain(|(socket, _), routed| {
            if *socket == peer {
                released.push(*routed);
                false
            } else {
                true
            }
        });
        for routed in &released {
            self.routes.remove(routed);
        }
        if !released.is_empty() {
            debug!(peer = %peer, count = released.len(), "released declared connections");
        }
        released
    }

    fn alias(&self, peer: ConnectionId, declared: ConnectionId) -> ConnectionId {
        *self
            .routed
            .entry((peer, declared))
            .or_insert_with(|| {
                let routed = self.allocate_id();
                self.routes.insert(
                    routed,
                    Route {
                        socket: peer,
                        wire_id: declared,
                    },
                );
                routed
            })
            .value()
    }

    // 0 is never handed out; ids still routed are skipped after wrap-around.
    fn allocate_id(&self) -> ConnectionId {
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
            if raw != 0 && !self.routes.contains_key(&ConnectionId(raw)) {
                return ConnectionId(raw);
            }
        }
    }
}
