//! Error types for the DACS core

use crate::types::TruckId;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the registry, the server and the notifier
#[derive(Debug, Error)]
pub enum DacsError {
    #[error("Unknown truck: {0}")]
    NotFound(TruckId),

    #[error("Truck id already registered: {0}")]
    DuplicateId(TruckId),

    #[error("Transport error on truck {truck_id}: {reason}")]
    Transport { truck_id: TruckId, reason: String },

    #[error("Downstream service unavailable: {0}")]
    DownstreamUnavailable(String),

    #[error("Could not bind truck listener on {addr}: {source}")]
    PortInUse {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown did not finish within {0:?}, forcing closure")]
    ShutdownTimeout(Duration),
}

impl DacsError {
    pub(crate) fn transport(truck_id: &str, reason: impl ToString) -> Self {
        DacsError::Transport {
            truck_id: truck_id.to_string(),
            reason: reason.to_string(),
        }
    }
}
