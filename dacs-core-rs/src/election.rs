//! Pairwise leader election for trucks in range.
//!
//! Each truck is in one of three states:
//! - `Leader`: `is_leader` set, `leader_id` points to itself
//! - `Follower(X)`: `leader_id` points to the connected peer X
//! - `Unpaired`: no leader
//!
//! The protocol runs only on proximity transitions and only touches the pair
//! involved, plus the followers of a leader that gets demoted.
//!
//! On entering range:
//! - both leaders: the winner of the tie-break keeps leading, the loser
//!   follows it and the loser's own followers become unpaired
//! - one leader: the other truck follows it
//! - no leader: the tie-break winner leads, the other follows
//!
//! On leaving range, a truck that followed the departing peer becomes
//! unpaired. `is_leader` is never cleared by a separation.
//!
//! Leadership is a single field per truck, so in a cluster of three or more
//! mutually connected trucks the latest pairing wins. Followers of a demoted
//! leader are unpaired rather than re-homed, so every follower always points
//! at a connected leader.
//!
//! The cost is liveness: an orphan keeps its connection to the demoted truck,
//! and a connected pair never produces another `Entered`, so the orphan stays
//! unpaired while it remains in range. It pairs again only after a range
//! transition: moving away from and back to that truck, or meeting another.

use crate::error::DacsError;
use crate::registry::Registry;
use crate::types::TruckId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

/// How to choose between two equally ranked trucks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// Lower id wins
    #[default]
    LowestId,
    /// Reproducible pseudo-random choice from the given seed
    Seeded(u64),
}

/// Outcome of a pair coming into range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    pub truck: TruckId,
    pub peer: TruckId,
    /// Leader of the pair after resolution
    pub leader: TruckId,
    /// Truck that lost its leader flag, if both were leaders
    pub demoted: Option<TruckId>,
    /// Former followers of the demoted truck, now unpaired
    pub orphaned: Vec<TruckId>,
}

/// Outcome of a pair going out of range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Separation {
    pub truck: TruckId,
    pub peer: TruckId,
    /// Trucks of the pair whose leader was the other one
    pub released: Vec<TruckId>,
}

/// Leader election state machine
#[derive(Debug)]
pub struct LeaderElection {
    rng: Option<StdRng>,
}

impl Default for LeaderElection {
    fn default() -> Self {
        Self::new(TieBreak::LowestId)
    }
}

impl LeaderElection {
    pub fn new(tie_break: TieBreak) -> Self {
        let rng = match tie_break {
            TieBreak::LowestId => None,
            TieBreak::Seeded(seed) => Some(StdRng::seed_from_u64(seed)),
        };
        Self { rng }
    }

    /// Connect the pair and resolve leadership.
    ///
    /// Returns `None` if the pair was already connected.
    pub fn on_entered(
        &mut self,
        registry: &mut Registry,
        truck: &str,
        peer: &str,
    ) -> Result<Option<Pairing>, DacsError> {
        if !registry.connect(truck, peer)? {
            debug!("Election: {} and {} already connected", truck, peer);
            return Ok(None);
        }

        let truck_leads = registry.get_mut(truck)?.is_leader;
        let peer_leads = registry.get_mut(peer)?.is_leader;

        let mut demoted = None;
        let mut orphaned = Vec::new();

        let leader = match (truck_leads, peer_leads) {
            (true, true) => {
                let (winner, loser) = self.pick(truck, peer);
                registry.get_mut(loser)?.follow(winner);
                orphaned = registry.release_followers_of(loser);
                info!(
                    "Election: Leader conflict {} vs {}, {} steps down ({} followers released)",
                    truck,
                    peer,
                    loser,
                    orphaned.len()
                );
                demoted = Some(loser.to_string());
                winner
            }
            (true, false) => {
                registry.get_mut(peer)?.follow(truck);
                truck
            }
            (false, true) => {
                registry.get_mut(truck)?.follow(peer);
                peer
            }
            (false, false) => {
                let (winner, loser) = self.pick(truck, peer);
                registry.get_mut(winner)?.lead();
                registry.get_mut(loser)?.follow(winner);
                winner
            }
        };

        info!("Election: {} leads {} / {} pair", leader, truck, peer);

        Ok(Some(Pairing {
            truck: truck.to_string(),
            peer: peer.to_string(),
            leader: leader.to_string(),
            demoted,
            orphaned,
        }))
    }

    /// Disconnect the pair and drop any leadership that ran between them.
    ///
    /// Returns `None` if the pair was not connected.
    pub fn on_left(
        &mut self,
        registry: &mut Registry,
        truck: &str,
        peer: &str,
    ) -> Result<Option<Separation>, DacsError> {
        if !registry.disconnect(truck, peer)? {
            debug!("Election: {} and {} already apart", truck, peer);
            return Ok(None);
        }

        let mut released = Vec::new();
        for (id, other) in [(truck, peer), (peer, truck)] {
            let t = registry.get_mut(id)?;
            if t.leader_id.as_deref() == Some(other) {
                t.clear_leader();
                released.push(id.to_string());
            }
        }

        info!(
            "Election: {} and {} separated ({} released)",
            truck,
            peer,
            released.len()
        );

        Ok(Some(Separation {
            truck: truck.to_string(),
            peer: peer.to_string(),
            released,
        }))
    }

    /// Returns (winner, loser)
    fn pick<'a>(&mut self, a: &'a str, b: &'a str) -> (&'a str, &'a str) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        match self.rng.as_mut() {
            None => (low, high),
            Some(rng) => {
                if rng.gen_bool(0.5) {
                    (low, high)
                } else {
                    (high, low)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Truck;

    fn registry(trucks: &[(&str, bool)]) -> Registry {
        let mut registry = Registry::new();
        for (id, leader) in trucks {
            registry.add(Truck::with_leader_flag(*id, *leader)).unwrap();
        }
        registry
    }

    #[test]
    fn test_unpaired_pair_elects_lower_id() {
        for (first, second) in [("a", "b"), ("b", "a")] {
            let mut registry = registry(&[("a", false), ("b", false)]);
            let mut election = LeaderElection::default();

            let pairing = election.on_entered(&mut registry, first, second).unwrap().unwrap();

            assert_eq!(pairing.leader, "a");
            assert!(registry.get("a").unwrap().is_leader);
            assert_eq!(registry.get("b").unwrap().leader_id.as_deref(), Some("a"));
            assert!(registry.verify().is_ok());
        }
    }

    #[test]
    fn test_existing_leader_keeps_role() {
        let mut registry = registry(&[("a", false), ("z", true)]);
        let mut election = LeaderElection::default();

        let pairing = election.on_entered(&mut registry, "a", "z").unwrap().unwrap();

        assert_eq!(pairing.leader, "z");
        assert!(!registry.get("a").unwrap().is_leader);
        assert_eq!(registry.get("a").unwrap().leader_id.as_deref(), Some("z"));
    }

    #[test]
    fn test_leader_conflict_demotes_higher_id() {
        let mut registry = registry(&[("a", true), ("c", true), ("d", false)]);
        let mut election = LeaderElection::default();
        election.on_entered(&mut registry, "c", "d").unwrap();

        let pairing = election.on_entered(&mut registry, "c", "a").unwrap().unwrap();

        assert_eq!(pairing.leader, "a");
        assert_eq!(pairing.demoted.as_deref(), Some("c"));
        assert_eq!(pairing.orphaned, vec!["d".to_string()]);
        let c = registry.get("c").unwrap();
        assert!(!c.is_leader);
        assert_eq!(c.leader_id.as_deref(), Some("a"));
        assert!(registry.get("d").unwrap().leader_id.is_none());
        assert!(registry.verify().is_ok());
    }

    #[test]
    fn test_duplicate_events_are_noops() {
        let mut registry = registry(&[("a", false), ("b", false)]);
        let mut election = LeaderElection::default();

        assert!(election.on_entered(&mut registry, "a", "b").unwrap().is_some());
        assert!(election.on_entered(&mut registry, "b", "a").unwrap().is_none());
        assert!(election.on_left(&mut registry, "a", "b").unwrap().is_some());
        assert!(election.on_left(&mut registry, "a", "b").unwrap().is_none());
    }

    #[test]
    fn test_separation_keeps_leader_flag() {
        let mut registry = registry(&[("a", false), ("b", false)]);
        let mut election = LeaderElection::default();
        election.on_entered(&mut registry, "a", "b").unwrap();

        let separation = election.on_left(&mut registry, "b", "a").unwrap().unwrap();

        assert_eq!(separation.released, vec!["b".to_string()]);
        let a = registry.get("a").unwrap();
        assert!(a.is_leader);
        assert!(a.connections.is_empty());
        assert!(registry.get("b").unwrap().leader_id.is_none());
        assert!(registry.verify().is_ok());
    }

    #[test]
    fn test_seeded_tie_break_is_reproducible() {
        let outcomes: Vec<String> = (0..2)
            .map(|_| {
                let mut registry = registry(&[("a", false), ("b", false)]);
                let mut election = LeaderElection::new(TieBreak::Seeded(7));
                election.on_entered(&mut registry, "a", "b").unwrap().unwrap().leader
            })
            .collect();

        assert_eq!(outcomes[0], outcomes[1]);
    }
}
