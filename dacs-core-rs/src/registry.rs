//! Truck registry
//!
//! Owns every known truck keyed by id. The registry keeps the connection
//! graph symmetric: edges are only ever added or removed in pairs. It has no
//! locking of its own and is reached only through the [`Coordinator`].
//!
//! [`Coordinator`]: crate::coordinator::Coordinator

use crate::error::DacsError;
use crate::types::{Position, Truck, TruckId, Velocity};
use std::collections::BTreeMap;
use tracing::debug;

/// Result of removing a truck
#[derive(Debug, Clone)]
pub struct Removed {
    /// The truck as it was just before removal
    pub truck: Truck,
    /// Peers that lost their connection to it
    pub disconnected: Vec<TruckId>,
    /// Peers that were following it and are now unpaired
    pub released: Vec<TruckId>,
}

/// Point-in-time copy of the registry contents, in id order
#[derive(Debug)]
pub struct Snapshot {
    inner: std::vec::IntoIter<Truck>,
}

impl Iterator for Snapshot {
    type Item = Truck;

    fn next(&mut self) -> Option<Truck> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Snapshot {}

/// Set of known trucks
#[derive(Debug, Default)]
pub struct Registry {
    trucks: BTreeMap<TruckId, Truck>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new truck
    pub fn add(&mut self, truck: Truck) -> Result<(), DacsError> {
        if self.trucks.contains_key(&truck.id) {
            return Err(DacsError::DuplicateId(truck.id));
        }

        debug!("Registry: Added {}", truck.id);
        self.trucks.insert(truck.id.clone(), truck);
        Ok(())
    }

    /// Delete a truck and strip every reference to it from its peers
    pub fn remove(&mut self, id: &str) -> Result<Removed, DacsError> {
        let truck = self
            .trucks
            .remove(id)
            .ok_or_else(|| DacsError::NotFound(id.to_string()))?;

        let mut disconnected = Vec::new();
        let mut released = Vec::new();

        for peer in self.trucks.values_mut() {
            if peer.connections.remove(id) {
                disconnected.push(peer.id.clone());
            }
            if peer.leader_id.as_deref() == Some(id) {
                peer.clear_leader();
                released.push(peer.id.clone());
            }
        }

        debug!(
            "Registry: Removed {} ({} peers disconnected, {} released)",
            id,
            disconnected.len(),
            released.len()
        );

        Ok(Removed {
            truck,
            disconnected,
            released,
        })
    }

    /// Overwrite the last-known position and velocity
    pub fn update_position(
        &mut self,
        id: &str,
        position: Position,
        velocity: Velocity,
    ) -> Result<(), DacsError> {
        let truck = self.get_mut(id)?;
        truck.position = position;
        truck.velocity = velocity;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Truck> {
        self.trucks.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Result<&mut Truck, DacsError> {
        self.trucks
            .get_mut(id)
            .ok_or_else(|| DacsError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.trucks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.trucks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trucks.is_empty()
    }

    /// All known ids in order
    pub fn ids(&self) -> Vec<TruckId> {
        self.trucks.keys().cloned().collect()
    }

    /// Copy-on-read snapshot of every truck
    pub fn all(&self) -> Snapshot {
        let trucks: Vec<Truck> = self.trucks.values().cloned().collect();
        Snapshot {
            inner: trucks.into_iter(),
        }
    }

    /// Add the edge a-b. Returns false if it already existed.
    pub(crate) fn connect(&mut self, a: &str, b: &str) -> Result<bool, DacsError> {
        self.ensure_pair(a, b)?;
        if a == b {
            return Ok(false);
        }

        let added = self.get_mut(a)?.connections.insert(b.to_string());
        let mirrored = self.get_mut(b)?.connections.insert(a.to_string());
        debug_assert_eq!(added, mirrored, "asymmetric edge {}-{}", a, b);

        Ok(added)
    }

    /// Remove the edge a-b. Returns false if there was none.
    pub(crate) fn disconnect(&mut self, a: &str, b: &str) -> Result<bool, DacsError> {
        self.ensure_pair(a, b)?;

        let removed = self.get_mut(a)?.connections.remove(b);
        let mirrored = self.get_mut(b)?.connections.remove(a);
        debug_assert_eq!(removed, mirrored, "asymmetric edge {}-{}", a, b);

        Ok(removed)
    }

    /// Unpair every follower of `leader`
    pub(crate) fn release_followers_of(&mut self, leader: &str) -> Vec<TruckId> {
        let mut released = Vec::new();
        for truck in self.trucks.values_mut() {
            if truck.id != leader && truck.leader_id.as_deref() == Some(leader) {
                truck.clear_leader();
                released.push(truck.id.clone());
            }
        }
        released
    }

    fn ensure_pair(&self, a: &str, b: &str) -> Result<(), DacsError> {
        for id in [a, b] {
            if !self.trucks.contains_key(id) {
                return Err(DacsError::NotFound(id.to_string()));
            }
        }
        Ok(())
    }

    /// Check the connection-graph and leadership invariants.
    ///
    /// Returns a description of the first violation found.
    pub fn verify(&self) -> Result<(), String> {
        for truck in self.trucks.values() {
            for peer_id in &truck.connections {
                if peer_id == &truck.id {
                    return Err(format!("{} is connected to itself", truck.id));
                }
                match self.trucks.get(peer_id) {
                    Some(peer) if peer.connections.contains(&truck.id) => {}
                    Some(_) => {
                        return Err(format!("edge {}-{} is not symmetric", truck.id, peer_id))
                    }
                    None => {
                        return Err(format!("{} is connected to unknown {}", truck.id, peer_id))
                    }
                }
            }

            if truck.is_leader && truck.leader_id.as_deref() != Some(truck.id.as_str()) {
                return Err(format!("leader {} does not point to itself", truck.id));
            }

            if let (false, Some(leader)) = (truck.is_leader, &truck.leader_id) {
                if !truck.connections.contains(leader) {
                    return Err(format!("{} follows {} without a connection", truck.id, leader));
                }
                if !self.trucks.get(leader).map_or(false, |l| l.is_leader) {
                    return Err(format!("{} follows {} which is not a leader", truck.id, leader));
                }
            }
        }
        Ok(())
    }
}
