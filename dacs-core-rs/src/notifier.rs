//! Downstream planner notifier
//!
//! Opens a short-lived WebSocket to the planning service for each newly
//! formed connection, sends one text frame and closes. Best effort: failures
//! are logged and dropped, never retried.

use crate::error::DacsError;
use crate::types::PlannerCommand;
use futures_util::SinkExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Fire-and-forget client for the planning service
#[derive(Debug, Clone)]
pub struct Notifier {
    url: String,
    timeout: Duration,
}

impl Notifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send on a background task and swallow any failure
    pub fn dispatch(&self, command: PlannerCommand) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            match notifier.send(&command).await {
                Ok(()) => debug!("Notifier: Reported to {}", notifier.url),
                Err(e) => warn!("Notifier: {}", e),
            }
        })
    }

    /// Connect, send one command and close, within the configured timeout
    pub async fn send(&self, command: &PlannerCommand) -> Result<(), DacsError> {
        let payload = String::from_utf8(command.to_bytes()?)
            .map_err(|e| DacsError::DownstreamUnavailable(e.to_string()))?;

        let exchange = async {
            let (mut ws, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| DacsError::DownstreamUnavailable(format!("{}: {}", self.url, e)))?;

            ws.send(Message::Text(payload.into()))
                .await
                .map_err(|e| DacsError::DownstreamUnavailable(format!("{}: {}", self.url, e)))?;

            // The planner may drop the socket first
            let _ = ws.close(None).await;
            Ok::<(), DacsError>(())
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DacsError::DownstreamUnavailable(format!(
                "{}: no response within {:?}",
                self.url, self.timeout
            ))),
        }
    }
}
