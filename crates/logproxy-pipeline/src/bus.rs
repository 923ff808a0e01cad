use logproxy_core::{LogEvent, LogproxyError, Result};
use tokio::sync::mpsc;

/// Create the single-producer ingest → broadcast channel.
///
/// FIFO: the receiver observes events in exactly the order they were
/// published. Dropping or closing the [`Publisher`] ends the stream.
pub fn channel(capacity: usize) -> (Publisher, BusReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (Publisher { tx }, BusReceiver { rx })
}

/// Producer side. Not `Clone`: there is exactly one producer, and
/// [`Publisher::close`] consumes it so the bus is closed at most once.
#[derive(Debug)]
pub struct Publisher {
    tx: mpsc::Sender<LogEvent>,
}

impl Publisher {
    /// Waits for room when the bus is full. Fails only when the
    /// receiving side is gone.
    pub async fn publish(&self, event: LogEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| LogproxyError::BusClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn close(self) {
        drop(self.tx);
    }
}

#[derive(Debug)]
pub struct BusReceiver {
    rx: mpsc::Receiver<LogEvent>,
}

impl BusReceiver {
    /// `None` once the publisher is closed and every queued event is drained.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    /// Events published but not yet drained.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
}
