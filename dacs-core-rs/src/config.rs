//! Configuration for the DACS coordination server

use crate::election::TieBreak;
use crate::proximity::DEFAULT_CONNECTION_RANGE;
use crate::types::TruckId;
use std::time::Duration;

/// Default port trucks connect to
pub const DEFAULT_TRUCK_PORT: u16 = 39850;

/// Default port of the downstream planning service
pub const DEFAULT_SERVER_PORT: u16 = 39851;

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct DacsConfig {
    /// Address the truck listener binds to
    pub bind_host: String,

    /// Truck listener port (0 picks a free port)
    pub truck_port: u16,

    /// Pair distance threshold, inclusive
    pub connection_range: f64,

    // Local truck
    pub local_truck_id: TruckId,
    pub is_leader: bool,

    // Downstream planner
    pub downstream_host: String,
    pub server_port: u16,
    pub notifier_enabled: bool,
    /// Bound on connect plus send
    pub notify_timeout: Duration,

    /// Messages buffered per connection before sends to it fail
    pub outbox_capacity: usize,

    /// Host event buffer; slow subscribers skip ahead past it
    pub event_capacity: usize,

    /// Longest accepted inbound line, excluding the newline
    pub max_line_bytes: usize,

    pub shutdown_timeout: Duration,

    pub tie_break: TieBreak,
}

impl Default for DacsConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            truck_port: DEFAULT_TRUCK_PORT,
            connection_range: DEFAULT_CONNECTION_RANGE,
            local_truck_id: "current_truck".to_string(),
            is_leader: false,
            downstream_host: "localhost".to_string(),
            server_port: DEFAULT_SERVER_PORT,
            notifier_enabled: true,
            notify_timeout: Duration::from_secs(2),
            outbox_capacity: 64,
            event_capacity: 256,
            max_line_bytes: 64 * 1024,
            shutdown_timeout: Duration::from_secs(5),
            tie_break: TieBreak::LowestId,
        }
    }
}

impl DacsConfig {
    /// Create config with the listener and downstream ports
    pub fn new(truck_port: u16, server_port: u16) -> Self {
        Self {
            truck_port,
            server_port,
            ..Default::default()
        }
    }

    /// Address string for the truck listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.truck_port)
    }

    /// WebSocket URL of the downstream planner
    pub fn downstream_url(&self) -> String {
        format!("ws://{}:{}", self.downstream_host, self.server_port)
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_connection_range(mut self, range: f64) -> Self {
        self.connection_range = range;
        self
    }

    /// Set the id and initial leader flag of the local truck
    pub fn with_local_truck(mut self, id: impl Into<TruckId>, is_leader: bool) -> Self {
        self.local_truck_id = id.into();
        self.is_leader = is_leader;
        self
    }

    pub fn with_downstream_host(mut self, host: impl Into<String>) -> Self {
        self.downstream_host = host.into();
        self
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    /// Disable downstream planner reports
    pub fn without_notifier(mut self) -> Self {
        self.notifier_enabled = false;
        self
    }

    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DacsConfig::default();

        assert_eq!(config.truck_port, 39850);
        assert_eq!(config.server_port, 39851);
        assert_eq!(config.connection_range, 300.0);
        assert_eq!(config.local_truck_id, "current_truck");
        assert!(!config.is_leader);
        assert_eq!(config.downstream_url(), "ws://localhost:39851");
    }

    #[test]
    fn test_config_builder() {
        let config = DacsConfig::new(0, 9000)
            .with_bind_host("127.0.0.1")
            .with_connection_range(50.0)
            .with_local_truck("me", true)
            .with_tie_break(TieBreak::Seeded(3))
            .without_notifier();

        assert_eq!(config.bind_addr(), "127.0.0.1:0");
        assert_eq!(config.connection_range, 50.0);
        assert_eq!(config.local_truck_id, "me");
        assert!(config.is_leader);
        assert_eq!(config.tie_break, TieBreak::Seeded(3));
        assert!(!config.notifier_enabled);
    }
}
