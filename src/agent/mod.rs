use crate::config::types::Config;
use crate::crawler::{Crawler, CrawlerReport, DiscoveryError};
use crate::pipeline::spooler;
use crate::publisher::{
    run_publisher, PublisherStats, PublisherStatsSnapshot, RetryPolicy, UdpPublisher,
    UdpTransport, WireEncoder,
};
use crate::registry::{run_registry_writer, Registry, RegistryError, RegistryWriter};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Failures that keep the agent from starting or stopping cleanly
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("input error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("cannot resolve destination '{address}': {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot open UDP socket: {0}")]
    Bind(#[source] io::Error),

    #[error("cannot write running marker '{path}': {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub crawler: CrawlerReport,
    pub publisher: PublisherStatsSnapshot,
    /// The publisher missed the grace period and was aborted
    pub publisher_aborted: bool,
    /// Entries captured by the final registry flush, if it ran and succeeded
    pub registry_entries: Option<usize>,
}

/// A running shipper: crawler, harvesters, publisher and registry writer.
pub struct Agent {
    config: Config,
    destination: SocketAddr,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
    stats: Arc<PublisherStats>,
    writer: RegistryWriter,
    crawler_task: JoinHandle<CrawlerReport>,
    publisher_task: JoinHandle<PublisherStatsSnapshot>,
    writer_task: JoinHandle<()>,
}

impl Agent {
    /// Start crawling, harvesting and publishing.
    ///
    /// Only configuration-level problems fail here: an unusable registry
    /// directory, bad globs, or a destination that cannot be resolved.
    pub async fn start(config: Config) -> Result<Self, AgentError> {
        Registry::ensure_dir(&config.registry.path)?;
        let registry = Arc::new(Mutex::new(Registry::load_or_empty(&config.registry.path)));

        let address = config.output.address();
        let destination = resolve(&address).await?;
        let transport = UdpTransport::connect(destination)
            .await
            .map_err(AgentError::Bind)?;
        let publisher = UdpPublisher::new(
            Box::new(transport),
            WireEncoder::new(&config.output),
            RetryPolicy::from(&config.output.retry),
        );
        let stats = publisher.stats();

        let shutdown = CancellationToken::new();
        let table = crate::registry::OffsetTable::new();
        let (tx, rx) = spooler(config.spooler.capacity);

        let crawler = Crawler::new(
            &config.inputs,
            table.clone(),
            registry.clone(),
            tx,
            shutdown.clone(),
        )?;
        let writer = RegistryWriter::new(registry, table, config.registry.clean_inactive);

        if let Some(marker) = &config.shutdown.running_marker {
            write_marker(marker)?;
        }

        let publisher_task = tokio::spawn(run_publisher(
            rx,
            publisher,
            config.spooler.batch_size,
            config.spooler.batch_timeout,
        ));
        let crawler_task = tokio::spawn(crawler.run(config.shutdown.grace_period));
        let writer_task = tokio::spawn(run_registry_writer(
            writer.clone(),
            config.registry.flush_interval,
            shutdown.clone(),
        ));

        let running = Arc::new(AtomicBool::new(true));
        info!(
            paths = ?config.inputs.paths,
            destination = %destination,
            registry = %config.registry.path.display(),
            "udpshipper is running"
        );

        Ok(Self {
            config,
            destination,
            shutdown,
            running,
            stats,
            writer,
            crawler_task,
            publisher_task,
            writer_task,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn publisher_stats(&self) -> PublisherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop gracefully and return once the final registry flush is done.
    ///
    /// Harvesters finish their current line, queued events are published
    /// within the grace period, then offsets are persisted. If the publisher
    /// has to be aborted the final flush is skipped so the registry keeps
    /// its last durable offsets.
    pub async fn stop(self) -> Result<ShutdownReport, AgentError> {
        let Agent {
            config,
            shutdown,
            running,
            stats,
            writer,
            crawler_task,
            mut publisher_task,
            writer_task,
            ..
        } = self;
        let grace = config.shutdown.grace_period;

        info!(grace_period = ?grace, "Stopping udpshipper");
        // Harvesters and the publisher share one grace period
        let deadline = tokio::time::Instant::now() + grace;
        shutdown.cancel();

        let crawler = crawler_task.await?;

        let (publisher, publisher_aborted) =
            match tokio::time::timeout_at(deadline, &mut publisher_task).await {
                Ok(result) => (result?, false),
                Err(_) => {
                    warn!("Publisher did not drain within grace period, aborting");
                    publisher_task.abort();
                    (stats.snapshot(), true)
                }
            };

        writer_task.await?;

        let registry_entries = if publisher_aborted {
            warn!("Skipping final registry flush; unsent events will be re-read on restart");
            None
        } else {
            match writer.flush().await {
                Ok(count) => Some(count),
                Err(e) => {
                    error!(error = %e, "Final registry flush failed");
                    None
                }
            }
        };

        running.store(false, Ordering::SeqCst);
        if let Some(marker) = &config.shutdown.running_marker {
            remove_marker(marker);
        }

        info!(
            sent = publisher.sent,
            dropped = publisher.dropped,
            registry_entries = ?registry_entries,
            "udpshipper shutdown complete"
        );

        Ok(ShutdownReport {
            crawler,
            publisher,
            publisher_aborted,
            registry_entries,
        })
    }
}

async fn resolve(address: &str) -> Result<SocketAddr, AgentError> {
    let resolve_error = |source| AgentError::Resolve {
        address: address.to_string(),
        source,
    };

    tokio::net::lookup_host(address)
        .await
        .map_err(resolve_error)?
        .next()
        .ok_or_else(|| resolve_error(io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

fn write_marker(path: &Path) -> Result<(), AgentError> {
    fs::write(path, format!("{}\n", std::process::id())).map_err(|source| AgentError::Marker {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_marker(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove running marker");
        }
    }
}
