//! Proximity engine
//!
//! Classifies every pair (truck, peer) as in or out of connection range and
//! reports the pairs whose classification no longer matches the connection
//! graph.
//!
//! ## Scaling
//!
//! A scan compares one truck against every other truck, so it is O(N) per
//! position update. When every truck reports once, a full settle cycle costs
//! O(N²). This is fine for fleets of tens of trucks and is the known limit of
//! the design; a spatial index would be needed beyond that.

use crate::error::DacsError;
use crate::registry::Registry;
use crate::types::TruckId;

/// Default connection range in world distance units
pub const DEFAULT_CONNECTION_RANGE: f64 = 300.0;

/// Transition of a pair relative to the connection range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProximityEvent {
    /// The pair came within range and is not yet connected
    Entered { truck: TruckId, peer: TruckId },
    /// The pair moved out of range while connected
    Left { truck: TruckId, peer: TruckId },
}

/// Range classifier over the registry
#[derive(Debug, Clone, Copy)]
pub struct ProximityEngine {
    range: f64,
}

impl Default for ProximityEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_RANGE)
    }
}

impl ProximityEngine {
    pub fn new(range: f64) -> Self {
        Self { range }
    }

    /// Inclusive: a pair exactly at the range is in range
    pub fn in_range(&self, distance: f64) -> bool {
        distance <= self.range
    }

    /// Exclusive, and false for NaN so a bad sample never breaks a pair
    pub fn out_of_range(&self, distance: f64) -> bool {
        distance > self.range
    }

    /// Compare `truck_id` against every other truck.
    ///
    /// Events come out in ascending peer-id order.
    pub fn scan(&self, registry: &Registry, truck_id: &str) -> Result<Vec<ProximityEvent>, DacsError> {
        let truck = registry
            .get(truck_id)
            .ok_or_else(|| DacsError::NotFound(truck_id.to_string()))?;

        let mut events = Vec::new();

        for peer in registry.all() {
            if peer.id == truck.id {
                continue;
            }

            let distance = truck.position.distance_to(&peer.position);
            let connected = truck.is_connected_to(&peer.id);

            if self.in_range(distance) && !connected {
                events.push(ProximityEvent::Entered {
                    truck: truck.id.clone(),
                    peer: peer.id,
                });
            } else if self.out_of_range(distance) && connected {
                events.push(ProximityEvent::Left {
                    truck: truck.id.clone(),
                    peer: peer.id,
                });
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Position, Truck};

    fn registry(trucks: &[(&str, f64, f64)]) -> Registry {
        let mut registry = Registry::new();
        for (id, x, z) in trucks {
            registry.add(Truck::new(*id).at(Position::new(*x, *z))).unwrap();
        }
        registry
    }

    #[test]
    fn test_entered_within_range() {
        let registry = registry(&[("a", 0.0, 0.0), ("b", 10.0, 0.0), ("c", 1000.0, 0.0)]);
        let events = ProximityEngine::default().scan(&registry, "a").unwrap();

        assert_eq!(
            events,
            vec![ProximityEvent::Entered {
                truck: "a".to_string(),
                peer: "b".to_string()
            }]
        );
    }

    #[test]
    fn test_range_boundary_is_inclusive() {
        let registry = registry(&[("a", 0.0, 0.0), ("b", 300.0, 0.0)]);
        let events = ProximityEngine::new(300.0).scan(&registry, "a").unwrap();
        assert_eq!(events.len(), 1);

        let registry = registry_with_edge(300.000_001);
        let events = ProximityEngine::new(300.0).scan(&registry, "a").unwrap();
        assert!(matches!(&events[..], [ProximityEvent::Left { .. }]));
    }

    fn registry_with_edge(distance: f64) -> Registry {
        let mut registry = registry(&[("a", 0.0, 0.0), ("b", distance, 0.0)]);
        registry.connect("a", "b").unwrap();
        registry
    }

    #[test]
    fn test_connected_pair_in_range_is_quiet() {
        let registry = registry_with_edge(5.0);
        let events = ProximityEngine::default().scan(&registry, "b").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_nan_position_changes_nothing() {
        let mut registry = registry_with_edge(5.0);
        registry
            .update_position("a", Position::new(f64::NAN, 0.0), Default::default())
            .unwrap();
        registry.add(Truck::new("c")).unwrap();

        let events = ProximityEngine::default().scan(&registry, "a").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_scan_unknown_truck() {
        let registry = Registry::new();
        assert!(matches!(
            ProximityEngine::default().scan(&registry, "x"),
            Err(DacsError::NotFound(_))
        ));
    }
}
