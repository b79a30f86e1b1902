pub mod finder;

pub use finder::FileFinder;

use crate::config::types::InputConfig;
use crate::pipeline::SpoolerSender;
use crate::registry::{FileState, OffsetTable, SharedRegistry};
use crate::source::file_id::FileId;
use crate::source::harvester::{
    HarvestSummary, Harvester, HarvesterConfig, HarvesterControl, HarvesterError,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONTROL_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid glob '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    #[error("cannot read '{path}' while expanding globs: {source}")]
    Glob {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot stat '{path}': {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What the crawler owns for each running harvester
struct HarvesterHandle {
    path: PathBuf,
    control: mpsc::Sender<HarvesterControl>,
    task: JoinHandle<Result<HarvestSummary, HarvesterError>>,
    draining: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Distinct files matched by the globs
    pub matched: usize,
    pub started: usize,
    pub truncated: usize,
    pub drained: usize,
    /// Harvesters that had exited since the previous scan
    pub reaped: usize,
    pub running: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlerReport {
    pub scans: u64,
    pub harvesters_closed: usize,
    pub harvesters_aborted: usize,
}

/// Reconciles glob matches against running harvesters.
pub struct Crawler {
    finder: FileFinder,
    scan_interval: Duration,
    tail_from_end: bool,
    harvester_config: HarvesterConfig,
    table: OffsetTable,
    registry: SharedRegistry,
    spooler: SpoolerSender,
    harvesters: HashMap<FileId, HarvesterHandle>,
    shutdown: CancellationToken,
    scans: u64,
}

impl Crawler {
    pub fn new(
        config: &InputConfig,
        table: OffsetTable,
        registry: SharedRegistry,
        spooler: SpoolerSender,
        shutdown: CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        Ok(Self {
            finder: FileFinder::new(config.paths.clone(), &config.exclude)?,
            scan_interval: config.scan_interval,
            tail_from_end: config.tail_from_end,
            harvester_config: HarvesterConfig::from(config),
            table,
            registry,
            spooler,
            harvesters: HashMap::new(),
            shutdown,
            scans: 0,
        })
    }

    /// Run one reconcile pass.
    pub async fn scan_once(&mut self) -> ScanSummary {
        self.scans += 1;
        let mut summary = ScanSummary {
            reaped: self.reap_finished().await,
            ..Default::default()
        };

        let now = Utc::now();
        let mut seen = HashSet::new();

        for path in self.finder.find_files() {
            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(source) => {
                    let err = DiscoveryError::Stat { path, source };
                    debug!(error = %err, "Skipping path");
                    continue;
                }
            };

            let id = FileId::from_metadata(&metadata);
            // Hard links and overlapping globs resolve to one harvester
            if !seen.insert(id) {
                continue;
            }

            let size = metadata.len();
            let mtime = metadata.modified().ok().map(DateTime::<Utc>::from);

            if let Some(handle) = self.harvesters.get_mut(&id) {
                handle.path = path.clone();
                if let Some(state) = self.table.entry(&id) {
                    let shipped = match state.lock() {
                        Ok(mut state) => {
                            state.last_seen = now;
                            state.path = path.clone();
                            state.offset
                        }
                        Err(_) => continue,
                    };

                    if size < shipped {
                        info!(
                            path = %path.display(),
                            size,
                            offset = shipped,
                            "File truncated, signalling harvester"
                        );
                        if handle.control.try_send(HarvesterControl::Truncated).is_ok() {
                            summary.truncated += 1;
                        }
                    }
                }
                continue;
            }

            self.start_harvester(id, path, size, mtime, now);
            summary.started += 1;
        }

        for (id, handle) in self.harvesters.iter_mut() {
            if seen.contains(id) || handle.draining {
                continue;
            }
            debug!(path = %handle.path.display(), file_id = %id, "File no longer matched, draining");
            if handle.control.try_send(HarvesterControl::Drain).is_ok() {
                handle.draining = true;
                summary.drained += 1;
            }
        }

        summary.matched = seen.len();
        summary.running = self.harvesters.len();
        summary
    }

    fn start_harvester(
        &mut self,
        id: FileId,
        path: PathBuf,
        size: u64,
        mtime: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let known = self.table.get(&id).or_else(|| {
            self.registry
                .lock()
                .ok()
                .and_then(|registry| registry.get(&id).cloned())
        });

        let (offset, generation) = match known {
            Some(state) if state.offset > size => {
                info!(
                    path = %path.display(),
                    size,
                    offset = state.offset,
                    "File shorter than stored offset, harvesting from the start"
                );
                (0, state.generation + 1)
            }
            Some(state) => (state.offset, state.generation),
            None if self.tail_from_end => (size, 0),
            None => (0, 0),
        };

        let mut state = FileState::new(path.clone(), offset, mtime);
        state.generation = generation;
        state.last_seen = now;
        let shared = self.table.activate(id, state);

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let harvester = Harvester::new(
            id,
            self.harvester_config.clone(),
            shared,
            self.spooler.clone(),
            control_rx,
            self.shutdown.child_token(),
        );

        debug!(path = %path.display(), file_id = %id, offset, "Starting harvester");
        self.harvesters.insert(
            id,
            HarvesterHandle {
                path,
                control: control_tx,
                task: tokio::spawn(harvester.run()),
                draining: false,
            },
        );
    }

    /// Collect harvesters that exited on their own
    async fn reap_finished(&mut self) -> usize {
        let finished: Vec<FileId> = self
            .harvesters
            .iter()
            .filter(|(_, handle)| handle.task.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in &finished {
            if let Some(handle) = self.harvesters.remove(id) {
                log_exit(&handle.path, handle.task.await);
            }
        }

        finished.len()
    }

    /// Scan every `scan_interval` until shutdown, then wait up to `grace` for
    /// harvesters to finish their current line.
    pub async fn run(mut self, grace: Duration) -> CrawlerReport {
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval = ?self.scan_interval, "Crawler started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.scan_once().await;
                    debug!(
                        matched = summary.matched,
                        started = summary.started,
                        truncated = summary.truncated,
                        drained = summary.drained,
                        running = summary.running,
                        "Scan complete"
                    );
                }
            }
        }

        self.stop_harvesters(grace).await
    }

    async fn stop_harvesters(mut self, grace: Duration) -> CrawlerReport {
        let mut report = CrawlerReport {
            scans: self.scans,
            ..Default::default()
        };

        let mut handles: Vec<(PathBuf, JoinHandle<_>)> = self
            .harvesters
            .drain()
            .map(|(_, handle)| (handle.path, handle.task))
            .collect();

        let waited = tokio::time::timeout(
            grace,
            futures::future::join_all(handles.iter_mut().map(|(_, task)| task)),
        )
        .await;

        match waited {
            Ok(results) => {
                for ((path, _), result) in handles.iter().zip(results) {
                    log_exit(path, result);
                }
                report.harvesters_closed = handles.len();
            }
            Err(_) => {
                for (path, task) in &handles {
                    if task.is_finished() {
                        report.harvesters_closed += 1;
                    } else {
                        warn!(path = %path.display(), "Harvester did not stop within grace period, aborting");
                        task.abort();
                        report.harvesters_aborted += 1;
                    }
                }
            }
        }

        info!(
            closed = report.harvesters_closed,
            aborted = report.harvesters_aborted,
            "Crawler stopped"
        );
        report
    }
}

fn log_exit(
    path: &std::path::Path,
    result: Result<Result<HarvestSummary, HarvesterError>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(summary)) => debug!(
            path = %path.display(),
            offset = summary.offset,
            reason = ?summary.reason,
            "Harvester exited"
        ),
        Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Harvester failed"),
        Err(e) => warn!(path = %path.display(), error = %e, "Harvester task panicked"),
    }
}
