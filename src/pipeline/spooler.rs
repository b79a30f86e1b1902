use crate::source::event::Event;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpoolerError {
    /// The draining side is gone; nothing will ever consume the event
    #[error("spooler closed")]
    Closed,
}

/// Ordered events handed from the spooler to the publisher
#[derive(Debug, Default)]
pub struct Batch {
    pub events: Vec<Event>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl IntoIterator for Batch {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

/// Create a spooler holding at most `capacity` events.
///
/// Senders are cloned into every harvester; the receiver is owned by the
/// publisher loop.
pub fn spooler(capacity: usize) -> (SpoolerSender, SpoolerReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SpoolerSender { tx }, SpoolerReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct SpoolerSender {
    tx: mpsc::Sender<Event>,
}

impl SpoolerSender {
    /// Enqueue an event, waiting while the queue is full
    pub async fn push(&self, event: Event) -> Result<(), SpoolerError> {
        self.tx.send(event).await.map_err(|_| SpoolerError::Closed)
    }
}

#[derive(Debug)]
pub struct SpoolerReceiver {
    rx: mpsc::Receiver<Event>,
}

impl SpoolerReceiver {
    /// Wait for at least one event, then keep collecting until `max_batch`
    /// events are gathered or `linger` elapses.
    ///
    /// Returns `None` once every sender is dropped and the queue is empty.
    pub async fn drain(&mut self, max_batch: usize, linger: Duration) -> Option<Batch> {
        let max_batch = max_batch.max(1);
        let mut events = Vec::with_capacity(max_batch.min(1024));

        if self.rx.recv_many(&mut events, max_batch).await == 0 {
            return None;
        }

        if events.len() < max_batch && !linger.is_zero() {
            let deadline = tokio::time::sleep(linger);
            tokio::pin!(deadline);
            while events.len() < max_batch {
                let remaining = max_batch - events.len();
                tokio::select! {
                    _ = &mut deadline => break,
                    received = self.rx.recv_many(&mut events, remaining) => {
                        if received == 0 {
                            break;
                        }
                    }
                }
            }
        }

        Some(Batch { events })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
