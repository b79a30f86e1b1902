use super::state::OffsetTable;
use super::store::{Registry, RegistryError, Result};
use crate::source::file_id::FileId;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry shared between the crawler (lookups) and the writer (flushes)
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Copies live offsets into the registry and persists it.
#[derive(Clone)]
pub struct RegistryWriter {
    registry: SharedRegistry,
    table: OffsetTable,
    clean_inactive: Duration,
}

impl RegistryWriter {
    pub fn new(registry: SharedRegistry, table: OffsetTable, clean_inactive: Duration) -> Self {
        Self {
            registry,
            table,
            clean_inactive,
        }
    }

    /// Snapshot the offset table, merge it into the registry, prune and flush.
    ///
    /// Returns the number of live entries captured. On a write error the
    /// previous file on disk stays authoritative and the entries stay in the
    /// table for the next attempt.
    pub fn flush_once(&self) -> Result<usize> {
        let snapshot = self.table.snapshot();

        {
            let mut registry = self.registry.lock().map_err(|_| {
                RegistryError::Io(std::io::Error::other("registry lock poisoned"))
            })?;

            for (id, state) in &snapshot {
                registry.apply(*id, state);
            }

            let active: Vec<FileId> = snapshot
                .iter()
                .filter(|(_, state)| state.active)
                .map(|(id, _)| *id)
                .collect();
            registry.prune(self.clean_inactive, &active);

            registry.flush()?;
        }

        self.table.remove_flushed(&snapshot);
        Ok(snapshot.len())
    }

    /// `flush_once` on the blocking pool. The registry lock is held across
    /// serialisation and `sync_all`, so it stays off the runtime workers.
    pub async fn flush(&self) -> Result<usize> {
        let writer = self.clone();
        tokio::task::spawn_blocking(move || writer.flush_once())
            .await
            .map_err(|e| RegistryError::Io(std::io::Error::other(e)))?
    }
}

/// Run the periodic registry flush until `shutdown` fires.
///
/// The final flush on shutdown is issued by the agent once the publisher has
/// drained, not here.
pub async fn run_registry_writer(
    writer: RegistryWriter,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    info!(interval = ?interval, "Registry writer started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match writer.flush().await {
                    Ok(count) => debug!(files = count, "Periodic registry flush"),
                    Err(e) => warn!(error = %e, "Registry flush failed, will retry next cycle"),
                }
            }
        }
    }

    info!("Registry writer stopped");
}
