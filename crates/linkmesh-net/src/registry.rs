use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
};

use crate::connection::{Connection, ConnectionId};

/// Established connections plus TCP-only connections awaiting UDP
/// registration. A connection lives in exactly one of the two collections
/// at a time.
#[derive(Default)]
pub(crate) struct RegistryState<A> {
    established: VecDeque<Arc<Connection<A>>>,
    pending: HashMap<ConnectionId, Arc<Connection<A>>>,
}

impl<A> RegistryState<A> {
    pub(crate) fn insert_pending(&mut self, connection: Arc<Connection<A>>) {
        linkmesh_util::safe_assert!(
            !self.established.iter().any(|c| c.id() == connection.id()),
            "connection {} inserted into pending while already established",
            connection.id()
        );
        self.pending.insert(connection.id(), connection);
    }

    pub(crate) fn insert_established(&mut self, connection: Arc<Connection<A>>) {
        linkmesh_util::safe_assert!(
            !self.pending.contains_key(&connection.id()),
            "connection {} inserted into established while still pending",
            connection.id()
        );
        self.established.push_front(connection);
    }

    /// Promotes a pending connection to established if `id` is pending and
    /// its UDP address is still unbound, binding `addr` in the process.
    /// Returns `None` for an unknown id or a duplicate registration.
    pub(crate) fn promote_pending(
        &mut self,
        id: ConnectionId,
        addr: SocketAddr,
    ) -> Option<Arc<Connection<A>>> {
        if self.pending.get(&id)?.udp_remote_address().is_some() {
            return None;
        }
        let connection = self.pending.remove(&id)?;
        connection.set_udp_remote_address(addr);
        self.established.push_front(Arc::clone(&connection));
        Some(connection)
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Arc<Connection<A>>> {
        self.pending
            .get(&id)
            .cloned()
            .or_else(|| self.established.iter().find(|c| c.id() == id).cloned())
    }

    /// Removes a connection from whichever collection holds it, if any.
    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection<A>>> {
        if let Some(connection) = self.pending.remove(&id) {
            return Some(connection);
        }
        let index = self.established.iter().position(|c| c.id() == id)?;
        self.established.remove(index)
    }

    /// Newest-first snapshot of established connections.
    pub(crate) fn established_snapshot(&self) -> Vec<Arc<Connection<A>>> {
        self.established.iter().cloned().collect()
    }

    pub(crate) fn pending_ids(&self) -> Vec<ConnectionId> {
        self.pending.keys().copied().collect()
    }

    pub(crate) fn established_len(&self) -> usize {
        self.established.len()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
