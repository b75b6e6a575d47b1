//! Process-wide collections of clients and rooms.
//!
//! The registry is the only owner of both. It is built once when the router
//! starts and handed to the dispatcher; nothing is ever removed while the
//! router runs. Each map has its own lock, separate from every room's member
//! lock, so a lookup in one map never waits on a broadcast in some room.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::room::Room;
use crate::transport::Address;

/// Client identity; also the client's transport address.
pub type ClientId = i32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    id: ClientId,
    display_name: String,
}

impl Client {
    /// A client whose display name is its id.
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            display_name: id.to_string(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn address(&self) -> Address {
        Address::Client(self.id)
    }
}

#[derive(Default)]
pub struct Registry {
    clients: Mutex<BTreeMap<ClientId, Arc<Client>>>,
    rooms: Mutex<BTreeMap<String, Arc<Room>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the client for `id`, registering it on first sight.
    /// `None` when `id` is not positive.
    pub fn find_or_create_client(&self, id: ClientId) -> Option<Arc<Client>> {
        if id <= 0 {
            return None;
        }
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let client = clients.entry(id).or_insert_with(|| {
            debug!(client = id, "registered client");
            Arc::new(Client::new(id))
        });
        Some(Arc::clone(client))
    }

    pub fn find_client(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Looks up room `name`, creating it when `create_if_missing` is set.
    /// `None` for an empty name or a missing room that may not be created.
    pub fn find_or_create_room(&self, name: &str, create_if_missing: bool) -> Option<Arc<Room>> {
        if name.is_empty() {
            return None;
        }
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = rooms.get(name) {
            return Some(Arc::clone(room));
        }
        if !create_if_missing {
            return None;
        }
        debug!(room = name, "created room");
        let room = Arc::new(Room::new(name));
        rooms.insert(name.to_string(), Arc::clone(&room));
        Some(room)
    }

    /// Known client ids in ascending order.
    pub fn list_client_ids(&self) -> Vec<ClientId> {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Room names in ascending order.
    pub fn room_names(&self) -> Vec<String> {
        self.rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_ids_are_rejected() {
        let registry = Registry::new();
        assert!(registry.find_or_create_client(0).is_none());
        assert!(registry.find_or_create_client(-5).is_none());
        assert!(registry.list_client_ids().is_empty());
    }

    #[test]
    fn clients_are_created_once() {
        let registry = Registry::new();
        let first = registry.find_or_create_client(42).unwrap();
        let second = registry.find_or_create_client(42).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &registry.find_client(42).unwrap()));
        assert!(registry.find_client(43).is_none());
        assert_eq!(first.display_name(), "42");
        assert_eq!(registry.list_client_ids(), vec![42]);
    }

    #[test]
    fn client_ids_are_listed_in_order() {
        let registry = Registry::new();
        for id in [30, 10, 20] {
            registry.find_or_create_client(id);
        }
        assert_eq!(registry.list_client_ids(), vec![10, 20, 30]);
    }

    #[test]
    fn rooms_are_only_created_on_request() {
        let registry = Registry::new();
        assert!(registry.find_or_create_room("", true).is_none());
        assert!(registry.find_or_create_room("lobby", false).is_none());

        let created = registry.find_or_create_room("lobby", true).unwrap();
        let found = registry.find_or_create_room("lobby", false).unwrap();
        assert!(Arc::ptr_eq(&created, &found));
        assert_eq!(registry.room_names(), vec!["lobby".to_string()]);
    }
}
