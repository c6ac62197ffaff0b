//! Core types for the DACS truck protocol

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Unique identifier for a connected truck.
///
/// Ids are compared by value; their byte-wise order is the total order used
/// to break leadership ties.
pub type TruckId = String;

/// Last-known world position of a truck (x, z plane)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    #[serde(rename = "coordinateX", default)]
    pub x: f64,
    #[serde(rename = "coordinateZ", default)]
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, z: f64) -> Self {
        Self { x, z }
    }

    /// Euclidean distance in the x/z plane
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2})", self.x, self.z)
    }
}

/// Last-known velocity of a truck
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    #[serde(rename = "velocityX", default)]
    pub x: f64,
    #[serde(rename = "velocityZ", default)]
    pub z: f64,
}

impl Velocity {
    pub fn new(x: f64, z: f64) -> Self {
        Self { x, z }
    }
}

/// Leadership role of a truck, derived from its flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Leads every peer that follows it
    Leader,
    /// Follows the given peer
    Follower(TruckId),
    /// Neither leading nor following
    Unpaired,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "Leader"),
            Role::Follower(leader) => write!(f, "Follower (Leader: {})", leader),
            Role::Unpaired => write!(f, "Unpaired"),
        }
    }
}

/// A tracked truck and its leadership state
#[derive(Debug, Clone)]
pub struct Truck {
    pub id: TruckId,
    pub position: Position,
    pub velocity: Velocity,
    /// Peers currently within connection range
    pub connections: BTreeSet<TruckId>,
    pub is_leader: bool,
    /// `Some(self)` for leaders, the leader's id for followers
    pub leader_id: Option<TruckId>,
}

impl Truck {
    /// Create an unpaired truck at the origin
    pub fn new(id: impl Into<TruckId>) -> Self {
        Self::with_leader_flag(id, false)
    }

    /// Create a truck that may start out as a leader
    pub fn with_leader_flag(id: impl Into<TruckId>, is_leader: bool) -> Self {
        let id = id.into();
        let leader_id = is_leader.then(|| id.clone());

        Self {
            id,
            position: Position::default(),
            velocity: Velocity::default(),
            connections: BTreeSet::new(),
            is_leader,
            leader_id,
        }
    }

    /// Place the truck at a position
    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn role(&self) -> Role {
        if self.is_leader {
            return Role::Leader;
        }
        match &self.leader_id {
            Some(leader) => Role::Follower(leader.clone()),
            None => Role::Unpaired,
        }
    }

    pub fn is_connected_to(&self, peer: &str) -> bool {
        self.connections.contains(peer)
    }

    /// Current leadership state as sent to the truck itself
    pub fn status_message(&self) -> ServerMessage {
        ServerMessage::LeaderStatusUpdate {
            is_leader: self.is_leader,
            leader_id: self.leader_id.clone(),
        }
    }

    pub(crate) fn lead(&mut self) {
        self.is_leader = true;
        self.leader_id = Some(self.id.clone());
    }

    pub(crate) fn follow(&mut self, leader: &str) {
        self.is_leader = false;
        self.leader_id = Some(leader.to_string());
    }

    pub(crate) fn clear_leader(&mut self) {
        self.leader_id = None;
    }

    pub(crate) fn planner_view(&self) -> PlannerTruck {
        PlannerTruck {
            id: self.id.clone(),
            position: self.position,
            is_leader: self.is_leader,
        }
    }
}

/// Position report sent by a truck, one per line.
///
/// A missing field leaves the previously known value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TruckUpdate {
    #[serde(rename = "truckPlacement", default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Position>,
    #[serde(rename = "truckVector", default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Velocity>,
}

impl TruckUpdate {
    pub fn new(position: Position, velocity: Velocity) -> Self {
        Self {
            placement: Some(position),
            vector: Some(velocity),
        }
    }

    /// Serialize update to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize update from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Messages the server sends to connected trucks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Another truck connected
    TruckJoined { id: TruckId },

    /// A truck disconnected
    TruckLeft { id: TruckId },

    /// Leadership state of the receiving truck
    LeaderStatusUpdate {
        is_leader: bool,
        leader_id: Option<TruckId>,
    },

    /// Leadership flag of some other truck changed
    TruckStatusChange { truck_id: TruckId, is_leader: bool },
}

impl ServerMessage {
    /// Serialize as a single JSON line (without the trailing newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Truck summary carried in planner commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerTruck {
    pub id: TruckId,
    pub position: Position,
    pub is_leader: bool,
}

/// Commands sent to the downstream planning service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum PlannerCommand {
    /// Two trucks just came into range of each other
    #[serde(rename = "launch_gbpplanner")]
    LaunchGbpPlanner {
        truck1: PlannerTruck,
        truck2: PlannerTruck,
    },
}

impl PlannerCommand {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// State changes published to the host process
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    TruckJoined { id: TruckId },
    TruckLeft { id: TruckId },
    ConnectionFormed { truck: TruckId, peer: TruckId },
    ConnectionLost { truck: TruckId, peer: TruckId },
    LeadershipChanged { id: TruckId, role: Role },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_parses_wire_names() {
        let raw = br#"{"truckPlacement":{"coordinateX":12.5,"coordinateZ":-3.0},"truckVector":{"velocityX":1.0,"velocityZ":0.5}}"#;
        let update = TruckUpdate::from_bytes(raw).unwrap();

        assert_eq!(update.placement, Some(Position::new(12.5, -3.0)));
        assert_eq!(update.vector, Some(Velocity::new(1.0, 0.5)));
    }

    #[test]
    fn test_update_missing_fields() {
        let update = TruckUpdate::from_bytes(br#"{"truckPlacement":{"coordinateX":1.0}}"#).unwrap();

        assert_eq!(update.placement, Some(Position::new(1.0, 0.0)));
        assert!(update.vector.is_none());
    }

    #[test]
    fn test_server_message_shape() {
        let msg = ServerMessage::LeaderStatusUpdate {
            is_leader: false,
            leader_id: None,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_line().unwrap()).unwrap();

        assert_eq!(value["type"], "leader_status_update");
        assert_eq!(value["is_leader"], false);
        assert!(value["leader_id"].is_null());

        let msg = ServerMessage::TruckStatusChange {
            truck_id: "a".to_string(),
            is_leader: true,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_line().unwrap()).unwrap();
        assert_eq!(value["type"], "truck_status_change");
        assert_eq!(value["truck_id"], "a");
    }

    #[test]
    fn test_planner_command_shape() {
        let cmd = PlannerCommand::LaunchGbpPlanner {
            truck1: Truck::with_leader_flag("a", true).at(Position::new(1.0, 2.0)).planner_view(),
            truck2: Truck::new("b").planner_view(),
        };
        let value: serde_json::Value = serde_json::from_slice(&cmd.to_bytes().unwrap()).unwrap();

        assert_eq!(value["command"], "launch_gbpplanner");
        assert_eq!(value["truck1"]["id"], "a");
        assert_eq!(value["truck1"]["position"]["coordinateX"], 1.0);
        assert_eq!(value["truck1"]["is_leader"], true);
        assert_eq!(value["truck2"]["is_leader"], false);
    }

    #[test]
    fn test_role_from_flags() {
        let leader = Truck::with_leader_flag("a", true);
        assert_eq!(leader.role(), Role::Leader);
        assert_eq!(leader.leader_id.as_deref(), Some("a"));

        let mut follower = Truck::new("b");
        assert_eq!(follower.role(), Role::Unpaired);
        follower.follow("a");
        assert_eq!(follower.role(), Role::Follower("a".to_string()));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Leader.to_string(), "Leader");
        assert_eq!(Role::Follower("a".to_string()).to_string(), "Follower (Leader: a)");
        assert_eq!(Role::Unpaired.to_string(), "Unpaired");
    }

    #[test]
    fn test_distance() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(3.0, 4.0);
        assert_eq!(a.distance_to(&b), 5.0);
    }
}
