//! Connection server
//!
//! Accepts truck connections over TCP and drives the [`Coordinator`] with
//! every position update received.
//!
//! Per connection:
//! - a fresh UUID id and a bounded outbox drained by a writer task
//! - `truck_joined` to every other truck
//! - a read loop feeding each line through the coordinator
//! - on close: removal from the registry and `truck_left` to the rest
//!
//! A truck whose outbox is full or closed when a message is due is evicted
//! and closed the same way, so no connected truck holds a stale view.
//!
//! The coordinator mutex is held only for the synchronous coordinator call.
//! Messages, host events and planner reports go out after it is released.

use crate::config::DacsConfig;
use crate::coordinator::{Coordinator, Dispatch};
use crate::error::DacsError;
use crate::notifier::Notifier;
use crate::transport::{run_writer, LineReader, Outboxes};
use crate::types::{FleetEvent, Position, Truck, TruckId, TruckUpdate, Velocity};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a closing connection waits for its writer to flush
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by the accept loop, every connection task and the handle
struct Shared {
    config: DacsConfig,
    coordinator: Mutex<Coordinator>,
    outboxes: Outboxes,
    events: broadcast::Sender<FleetEvent>,
    notifier: Option<Notifier>,
}

impl Shared {
    /// Run one coordinator call under the lock, then deliver its output
    async fn step<F>(&self, f: F) -> Result<(), DacsError>
    where
        F: FnOnce(&mut Coordinator) -> Result<Vec<Dispatch>, DacsError>,
    {
        let dispatches = {
            let mut coordinator = self.coordinator.lock().await;
            f(&mut coordinator)?
        };
        self.deliver(dispatches);
        Ok(())
    }

    fn deliver(&self, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            match dispatch {
                Dispatch::Send { to, message } => {
                    for truck_id in self.outboxes.send_all(&to, &message) {
                        if self.outboxes.evict(&truck_id) {
                            warn!("Server: Evicting {}, it missed a message", truck_id);
                        }
                    }
                }
                Dispatch::Notify(command) => {
                    if let Some(notifier) = &self.notifier {
                        notifier.dispatch(command);
                    }
                }
                Dispatch::Event(event) => {
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
            }
        }
    }

    async fn handle_line(&self, truck_id: &str, line: &[u8]) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let update = match TruckUpdate::from_bytes(line) {
            Ok(update) => update,
            Err(e) => {
                warn!(
                    "Server: Skipping malformed line from {}: {}",
                    truck_id,
                    DacsError::from(e)
                );
                return;
            }
        };

        if let Err(e) = self.step(|c| c.apply(truck_id, &update)).await {
            warn!("Server: Update from {} rejected: {}", truck_id, e);
        }
    }
}

/// Handle to a running server
pub struct ServerHandle {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Bind the truck listener, register the local truck and start accepting
pub async fn start(config: DacsConfig) -> Result<ServerHandle, DacsError> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| DacsError::PortInUse {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let mut coordinator = Coordinator::new(config.connection_range, config.tie_break);
    let local = Truck::with_leader_flag(config.local_truck_id.clone(), config.is_leader);
    let dispatches = coordinator.join(local)?;

    let notifier = config
        .notifier_enabled
        .then(|| Notifier::new(config.downstream_url(), config.notify_timeout));
    let (events, _) = broadcast::channel(config.event_capacity.max(1));

    info!(
        "Server: Listening on {} (range {}, local truck {}{})",
        local_addr,
        config.connection_range,
        config.local_truck_id,
        if config.is_leader { ", leader" } else { "" }
    );
    match &notifier {
        Some(n) => info!("Server: Reporting connections to {}", n.url()),
        None => info!("Server: Downstream notifier disabled"),
    }

    let shared = Arc::new(Shared {
        config,
        coordinator: Mutex::new(coordinator),
        outboxes: Outboxes::new(),
        events,
        notifier,
    });
    shared.deliver(dispatches);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accept_task = tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx));

    Ok(ServerHandle {
        shared,
        local_addr,
        shutdown_tx,
        accept_task,
    })
}

impl ServerHandle {
    /// Bound listener address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_truck_id(&self) -> &str {
        &self.shared.config.local_truck_id
    }

    pub fn config(&self) -> &DacsConfig {
        &self.shared.config
    }

    /// Stream of fleet events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.shared.events.subscribe()
    }

    /// Feed a sample for the locally hosted truck through the same pipeline
    /// as socket updates
    pub async fn update_local_truck(
        &self,
        position: Position,
        velocity: Velocity,
    ) -> Result<(), DacsError> {
        let id = &self.shared.config.local_truck_id;
        self.shared
            .step(|c| c.update_position(id, position, velocity))
            .await
    }

    /// Snapshot of every known truck, in id order
    pub async fn fleet(&self) -> Vec<Truck> {
        self.shared.coordinator.lock().await.registry().all().collect()
    }

    pub async fn truck(&self, id: &str) -> Option<Truck> {
        self.shared.coordinator.lock().await.registry().get(id).cloned()
    }

    pub async fn local_truck(&self) -> Option<Truck> {
        self.truck(self.local_truck_id()).await
    }

    pub async fn truck_count(&self) -> usize {
        self.shared.coordinator.lock().await.registry().len()
    }

    /// Stop accepting, close every connection and clear the registry.
    ///
    /// Connections still open after `timeout` are aborted and
    /// `ShutdownTimeout` is returned; the registry is cleared either way.
    pub async fn stop(self, timeout: Duration) -> Result<(), DacsError> {
        let ServerHandle {
            shared,
            shutdown_tx,
            mut accept_task,
            ..
        } = self;

        info!("Server: Stopping");
        let _ = shutdown_tx.send(true);

        let result = match tokio::time::timeout(timeout, &mut accept_task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Server: Accept loop failed: {}", e);
                Ok(())
            }
            Err(_) => {
                accept_task.abort();
                let err = DacsError::ShutdownTimeout(timeout);
                warn!("Server: {}", err);
                Err(err)
            }
        };

        let dispatches = shared
            .coordinator
            .lock()
            .await
            .drain(&shared.config.local_truck_id);
        shared.deliver(dispatches);
        shared.outboxes.clear();

        info!("Server: Stopped");
        result
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    connections.spawn(handle_connection(
                        stream,
                        addr,
                        shared.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Server: Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(done) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = done {
                    error!("Server: Connection task failed: {}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    debug!("Server: Listener closed, {} connections open", connections.len());

    while let Some(done) = connections.join_next().await {
        if let Err(e) = done {
            error!("Server: Connection task failed: {}", e);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let truck_id: TruckId = Uuid::new_v4().to_string();
    let (read_half, write_half) = stream.into_split();

    let (outbox, evicted) = shared
        .outboxes
        .register(&truck_id, shared.config.outbox_capacity);
    let (failed_tx, mut failed_rx) = oneshot::channel();
    let mut writer = tokio::spawn(run_writer(truck_id.clone(), write_half, outbox, failed_tx));

    let joined = shared
        .step(|c| c.join(Truck::new(truck_id.clone())))
        .await;

    let reason = match joined {
        Ok(()) => {
            info!("Server: Truck {} connected from {}", truck_id, addr);
            let mut reader = LineReader::new(BufReader::new(read_half), shared.config.max_line_bytes);

            loop {
                tokio::select! {
                    line = reader.next_line() => match line {
                        Ok(Some(line)) => shared.handle_line(&truck_id, &line).await,
                        Ok(None) => break "closed by peer".to_string(),
                        Err(e) => break DacsError::transport(&truck_id, e).to_string(),
                    },
                    failed = &mut failed_rx => match failed {
                        Ok(e) => break e.to_string(),
                        Err(_) => break "writer stopped".to_string(),
                    },
                    _ = evicted.notified() => break "outbox overflow".to_string(),
                    _ = shutdown.changed() => break "server stopping".to_string(),
                }
            }
        }
        Err(e) => e.to_string(),
    };

    shared.outboxes.unregister(&truck_id);
    if let Err(e) = shared.step(|c| c.leave(&truck_id)).await {
        debug!("Server: Removing {}: {}", truck_id, e);
    }

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    info!("Server: Truck {} disconnected ({})", truck_id, reason);
}
