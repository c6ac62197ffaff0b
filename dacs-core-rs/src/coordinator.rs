//! Coordinator: registry, proximity engine and election behind one owner.
//!
//! Every mutation of fleet state goes through a `Coordinator` method. The
//! server holds the coordinator in a single mutex, so one call is one atomic
//! step: update position, scan, elect, mutate connection sets. None of the
//! methods perform I/O. Instead they return [`Dispatch`] items that the
//! caller delivers after releasing the lock. Recipient lists are resolved
//! here, while the state is still consistent.

use crate::election::{LeaderElection, Pairing, Separation, TieBreak};
use crate::error::DacsError;
use crate::proximity::{ProximityEngine, ProximityEvent};
use crate::registry::Registry;
use crate::types::{
    FleetEvent, PlannerCommand, Position, ServerMessage, Truck, TruckId, TruckUpdate, Velocity,
};
use tracing::debug;

/// Side effect produced by a coordinator step
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Send a message to each listed truck
    Send {
        to: Vec<TruckId>,
        message: ServerMessage,
    },
    /// Report a new connection to the downstream planner
    Notify(PlannerCommand),
    /// Publish an event to the host
    Event(FleetEvent),
}

/// Single owner of all fleet state
#[derive(Debug)]
pub struct Coordinator {
    registry: Registry,
    proximity: ProximityEngine,
    election: LeaderElection,
}

impl Coordinator {
    pub fn new(range: f64, tie_break: TieBreak) -> Self {
        Self {
            registry: Registry::new(),
            proximity: ProximityEngine::new(range),
            election: LeaderElection::new(tie_break),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a truck and announce it to everyone else
    pub fn join(&mut self, truck: Truck) -> Result<Vec<Dispatch>, DacsError> {
        let id = truck.id.clone();
        self.registry.add(truck)?;

        Ok(vec![
            Dispatch::Send {
                to: self.others(&[&id]),
                message: ServerMessage::TruckJoined { id: id.clone() },
            },
            Dispatch::Event(FleetEvent::TruckJoined { id }),
        ])
    }

    /// Apply a wire update; absent fields keep their previous values
    pub fn apply(&mut self, id: &str, update: &TruckUpdate) -> Result<Vec<Dispatch>, DacsError> {
        let truck = self
            .registry
            .get(id)
            .ok_or_else(|| DacsError::NotFound(id.to_string()))?;
        let position = update.placement.unwrap_or(truck.position);
        let velocity = update.vector.unwrap_or(truck.velocity);

        self.update_position(id, position, velocity)
    }

    /// Store a new sample, rescan the truck and run the election on every
    /// transition found
    pub fn update_position(
        &mut self,
        id: &str,
        position: Position,
        velocity: Velocity,
    ) -> Result<Vec<Dispatch>, DacsError> {
        self.registry.update_position(id, position, velocity)?;

        let events = self.proximity.scan(&self.registry, id)?;
        if !events.is_empty() {
            debug!("Coordinator: {} produced {} transitions", id, events.len());
        }

        let mut dispatches = Vec::new();
        for event in events {
            match event {
                ProximityEvent::Entered { truck, peer } => {
                    if let Some(pairing) = self.election.on_entered(&mut self.registry, &truck, &peer)? {
                        self.paired(pairing, &mut dispatches)?;
                    }
                }
                ProximityEvent::Left { truck, peer } => {
                    if let Some(separation) = self.election.on_left(&mut self.registry, &truck, &peer)? {
                        self.separated(separation, &mut dispatches)?;
                    }
                }
            }
        }

        Ok(dispatches)
    }

    /// Remove a truck and tell the remaining trucks
    pub fn leave(&mut self, id: &str) -> Result<Vec<Dispatch>, DacsError> {
        let removed = self.registry.remove(id)?;
        let mut dispatches = vec![
            Dispatch::Send {
                to: self.registry.ids(),
                message: ServerMessage::TruckLeft { id: id.to_string() },
            },
            Dispatch::Event(FleetEvent::TruckLeft { id: id.to_string() }),
        ];

        for peer in removed.disconnected {
            dispatches.push(Dispatch::Event(FleetEvent::ConnectionLost {
                truck: peer,
                peer: id.to_string(),
            }));
        }
        for released in &removed.released {
            self.status_update(released, &mut dispatches)?;
        }

        Ok(dispatches)
    }

    /// Remove every truck, keeping `last` until the end.
    ///
    /// Used on shutdown; only host events are produced.
    pub fn drain(&mut self, last: &str) -> Vec<Dispatch> {
        let mut order: Vec<TruckId> = self.registry.ids().into_iter().filter(|id| id != last).collect();
        if self.registry.contains(last) {
            order.push(last.to_string());
        }

        let mut events = Vec::new();
        for id in order {
            if self.registry.remove(&id).is_ok() {
                events.push(Dispatch::Event(FleetEvent::TruckLeft { id }));
            }
        }
        events
    }

    fn paired(&self, pairing: Pairing, out: &mut Vec<Dispatch>) -> Result<(), DacsError> {
        out.push(Dispatch::Event(FleetEvent::ConnectionFormed {
            truck: pairing.truck.clone(),
            peer: pairing.peer.clone(),
        }));

        for id in [&pairing.truck, &pairing.peer] {
            self.status_update(id, out)?;
        }

        let others = self.others(&[&pairing.truck, &pairing.peer]);
        for id in [&pairing.truck, &pairing.peer] {
            out.push(Dispatch::Send {
                to: others.clone(),
                message: ServerMessage::TruckStatusChange {
                    truck_id: id.clone(),
                    is_leader: self.truck(id)?.is_leader,
                },
            });
        }

        for id in &pairing.orphaned {
            self.status_update(id, out)?;
        }

        out.push(Dispatch::Notify(PlannerCommand::LaunchGbpPlanner {
            truck1: self.truck(&pairing.truck)?.planner_view(),
            truck2: self.truck(&pairing.peer)?.planner_view(),
        }));

        Ok(())
    }

    fn separated(&self, separation: Separation, out: &mut Vec<Dispatch>) -> Result<(), DacsError> {
        out.push(Dispatch::Event(FleetEvent::ConnectionLost {
            truck: separation.truck.clone(),
            peer: separation.peer.clone(),
        }));

        for id in [&separation.truck, &separation.peer] {
            self.status_update(id, out)?;
        }

        Ok(())
    }

    /// Direct leadership update to one truck, mirrored to the host
    fn status_update(&self, id: &str, out: &mut Vec<Dispatch>) -> Result<(), DacsError> {
        let truck = self.truck(id)?;

        out.push(Dispatch::Send {
            to: vec![truck.id.clone()],
            message: truck.status_message(),
        });
        out.push(Dispatch::Event(FleetEvent::LeadershipChanged {
            id: truck.id.clone(),
            role: truck.role(),
        }));

        Ok(())
    }

    fn truck(&self, id: &str) -> Result<&Truck, DacsError> {
        self.registry
            .get(id)
            .ok_or_else(|| DacsError::NotFound(id.to_string()))
    }

    fn others(&self, exclude: &[&TruckId]) -> Vec<TruckId> {
        self.registry
            .ids()
            .into_iter()
            .filter(|id| !exclude.contains(&id))
            .collect()
    }
}
