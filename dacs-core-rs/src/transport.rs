//! Line-delimited JSON transport for truck connections
//!
//! Each connection has a bounded outbox drained by its own writer task.
//! Broadcasts serialize once and `try_send` to each outbox, so a slow or dead
//! peer only ever fails its own delivery. A peer that misses a message is
//! evicted: its outbox is dropped and its connection told to close.

use crate::error::DacsError;
use crate::types::{ServerMessage, TruckId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

/// Sending side of one connection's outbox
#[derive(Debug)]
struct Outbox {
    tx: mpsc::Sender<String>,
    evicted: Arc<Notify>,
}

/// Outbound queues keyed by truck id
#[derive(Debug, Default)]
pub struct Outboxes {
    senders: RwLock<HashMap<TruckId, Outbox>>,
}

impl Outboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the outbox for a truck.
    ///
    /// Returns the receiving side for its writer, and the signal raised
    /// when the outbox is evicted and the connection must close.
    pub fn register(&self, truck_id: &str, capacity: usize) -> (mpsc::Receiver<String>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let evicted = Arc::new(Notify::new());
        self.senders.write().insert(
            truck_id.to_string(),
            Outbox {
                tx,
                evicted: evicted.clone(),
            },
        );
        (rx, evicted)
    }

    /// Drop the outbox; its writer drains what is queued and exits
    pub fn unregister(&self, truck_id: &str) {
        self.senders.write().remove(truck_id);
    }

    /// Drop the outbox and tell its connection to close.
    ///
    /// Returns false if the truck had no outbox.
    pub fn evict(&self, truck_id: &str) -> bool {
        match self.senders.write().remove(truck_id) {
            Some(outbox) => {
                outbox.evicted.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.senders.write().clear();
    }

    pub fn len(&self) -> usize {
        self.senders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.read().is_empty()
    }

    /// Queue one serialized line for a truck
    pub fn send_line(&self, truck_id: &str, line: String) -> Result<(), DacsError> {
        let senders = self.senders.read();
        let outbox = senders
            .get(truck_id)
            .ok_or_else(|| DacsError::NotFound(truck_id.to_string()))?;

        outbox.tx.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DacsError::transport(truck_id, "outbox full"),
            mpsc::error::TrySendError::Closed(_) => DacsError::transport(truck_id, "outbox closed"),
        })
    }

    /// Send a message to every listed truck.
    ///
    /// Trucks without an outbox (such as the local truck) are skipped
    /// silently. Returns the trucks whose outbox was full or closed; they
    /// have missed a message and must be evicted.
    pub fn send_all(&self, to: &[TruckId], message: &ServerMessage) -> Vec<TruckId> {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("Transport: Failed to serialize {:?}: {}", message, e);
                return Vec::new();
            }
        };

        let mut failed = Vec::new();
        for truck_id in to {
            match self.send_line(truck_id, line.clone()) {
                Ok(()) | Err(DacsError::NotFound(_)) => {}
                Err(e) => {
                    warn!("Transport: {}", e);
                    failed.push(truck_id.clone());
                }
            }
        }

        debug!(
            "Transport: Queued {:?} for {}/{} trucks",
            message,
            to.len() - failed.len(),
            to.len()
        );
        failed
    }
}

/// Drain an outbox into the socket, one line per message.
///
/// Returns when the outbox is dropped. A write error is reported once on
/// `failed` so the connection task can tear the connection down.
pub async fn run_writer<W>(
    truck_id: TruckId,
    mut writer: W,
    mut outbox: mpsc::Receiver<String>,
    failed: oneshot::Sender<DacsError>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = outbox.recv().await {
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Transport: Write to {} failed: {}", truck_id, e);
            let _ = failed.send(DacsError::transport(&truck_id, e));
            return;
        }
    }

    let _ = writer.shutdown().await;
}

/// Reads newline-terminated lines with a length cap
pub struct LineReader<R> {
    inner: R,
    max_line_bytes: usize,
    buf: Vec<u8>,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R, max_line_bytes: usize) -> Self {
        Self {
            inner,
            max_line_bytes,
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator; `None` at end of stream.
    ///
    /// A final line without a newline is still returned. A line over the cap
    /// is an error and leaves the stream mid-line, so the caller must stop
    /// reading.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>, std::io::Error> {
        self.buf.clear();
        let limit = self.max_line_bytes as u64 + 1;
        let n = (&mut self.inner).take(limit).read_until(b'\n', &mut self.buf).await?;

        if n == 0 {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        } else if self.buf.len() > self.max_line_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("line exceeds {} bytes", self.max_line_bytes),
            ));
        }

        Ok(Some(std::mem::take(&mut self.buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_lines_and_trailing_fragment() {
        let data: &[u8] = b"one\r\ntwo\n\nlast";
        let mut reader = LineReader::new(BufReader::new(data), 16);

        assert_eq!(reader.next_line().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(reader.next_line().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(reader.next_line().await.unwrap(), Some(Vec::new()));
        assert_eq!(reader.next_line().await.unwrap(), Some(b"last".to_vec()));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_cap() {
        let data: &[u8] = b"1234\n12345\n";
        let mut reader = LineReader::new(BufReader::new(data), 4);

        assert_eq!(reader.next_line().await.unwrap(), Some(b"1234".to_vec()));
        let err = reader.next_line().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_send_all_reports_full_outbox() {
        let outboxes = Outboxes::new();
        let (mut a, _) = outboxes.register("a", 1);
        let (_b, _) = outboxes.register("b", 1);
        outboxes.send_line("b", "filler".to_string()).unwrap();

        let msg = ServerMessage::TruckLeft { id: "x".to_string() };
        let to = vec!["a".to_string(), "b".to_string(), "local".to_string()];
        assert_eq!(outboxes.send_all(&to, &msg), vec!["b".to_string()]);

        let line = a.recv().await.unwrap();
        assert_eq!(ServerMessage::from_bytes(line.as_bytes()).unwrap(), msg);
        assert!(matches!(
            outboxes.send_line("b", "more".to_string()),
            Err(DacsError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_evict_signals_connection() {
        let outboxes = Outboxes::new();
        let (mut rx, evicted) = outboxes.register("a", 2);
        outboxes.send_line("a", "last".to_string()).unwrap();

        assert!(outboxes.evict("a"));
        assert!(!outboxes.evict("a"));
        assert!(outboxes.is_empty());

        // The stored permit wakes a waiter that arrives later
        tokio::time::timeout(std::time::Duration::from_secs(1), evicted.notified())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("last"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_writer_exits_when_outbox_dropped() {
        let outboxes = Outboxes::new();
        let (rx, _) = outboxes.register("a", 4);
        let (failed_tx, mut failed_rx) = oneshot::channel();
        let mut sink = Vec::new();

        outboxes.send_line("a", "hello".to_string()).unwrap();
        outboxes.unregister("a");
        run_writer("a".to_string(), &mut sink, rx, failed_tx).await;

        assert_eq!(sink, b"hello\n");
        assert!(failed_rx.try_recv().is_err());
        assert!(outboxes.is_empty());
    }

    /// Socket whose peer has gone away
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<Result<usize, std::io::Error>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_writer_reports_write_failure() {
        let outboxes = Outboxes::new();
        let (rx, _) = outboxes.register("a", 4);
        let (failed_tx, failed_rx) = oneshot::channel();
        outboxes.send_line("a", "hello".to_string()).unwrap();

        // Returns on the failed write even though the outbox is still open
        run_writer("a".to_string(), BrokenPipe, rx, failed_tx).await;

        let err = failed_rx.await.unwrap();
        assert!(matches!(err, DacsError::Transport { ref truck_id, .. } if truck_id == "a"));
        assert!(matches!(
            outboxes.send_line("a", "more".to_string()),
            Err(DacsError::Transport { .. })
        ));
    }
}
