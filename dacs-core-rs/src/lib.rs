//! # DACS Core
//!
//! Proximity tracking and leader/follower coordination for a fleet of
//! simulated trucks.
//!
//! Trucks connect over TCP and stream position updates as line-delimited
//! JSON. Every update rescans the sender against the rest of the fleet; when
//! two trucks come within range they are connected and one of them leads the
//! pair. Newly formed connections are reported to a downstream planning
//! service over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! Trucks (TCP, JSON lines)          Host process
//!       │                               │ update_local_truck / subscribe
//!       ▼                               ▼
//! ┌──────────────────────────────────────────────┐
//! │  server: accept loop, connection tasks       │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ Coordinator (one mutex)                │  │
//! │  │  Registry → Proximity → Election       │  │
//! │  └────────────────────────────────────────┘  │
//! │      │ Dispatch list, delivered unlocked     │
//! │      ├─► outboxes → writer tasks → trucks    │
//! │      ├─► FleetEvent broadcast → host         │
//! │      └─► Notifier ──────────────┐            │
//! └─────────────────────────────────┼────────────┘
//!                                   ▼ WebSocket
//!                          Planning service
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use dacs_core::{DacsConfig, Position, Velocity};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = dacs_core::start(DacsConfig::default()).await?;
//!
//!     server
//!         .update_local_truck(Position::new(10.0, 20.0), Velocity::default())
//!         .await?;
//!
//!     server.stop(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

pub mod types;
pub mod error;
pub mod registry;
pub mod proximity;
pub mod election;
pub mod coordinator;
pub mod config;
pub mod transport;
pub mod notifier;
pub mod server;

pub use types::*;
pub use error::DacsError;
pub use registry::{Registry, Removed, Snapshot};
pub use proximity::{ProximityEngine, ProximityEvent, DEFAULT_CONNECTION_RANGE};
pub use election::{LeaderElection, Pairing, Separation, TieBreak};
pub use coordinator::{Coordinator, Dispatch};
pub use config::DacsConfig;
pub use notifier::Notifier;
pub use server::{start, ServerHandle};
