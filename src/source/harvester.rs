use crate::config::types::{InputConfig, LongLinePolicy};
use crate::pipeline::{SpoolerError, SpoolerSender};
use crate::registry::SharedFileState;
use crate::source::event::Event;
use crate::source::file_id::FileId;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HarvesterError {
    #[error("failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{path}' no longer refers to file {expected}")]
    IdentityChanged { path: PathBuf, expected: FileId },
}

#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    pub max_line_bytes: usize,
    pub on_long_line: LongLinePolicy,
    pub eof_poll_interval: Duration,
}

impl From<&InputConfig> for HarvesterConfig {
    fn from(config: &InputConfig) -> Self {
        Self {
            max_line_bytes: config.max_line_bytes,
            on_long_line: config.on_long_line,
            eof_poll_interval: config.eof_poll_interval,
        }
    }
}

/// Signals the crawler sends to a running harvester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvesterControl {
    /// The file is now shorter than the shipped offset
    Truncated,
    /// The path no longer matches; ship what is left and stop
    Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvesterPhase {
    Opening,
    Reading,
    Draining,
    Truncated,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The path disappeared
    Removed,
    /// The path now points to a different file
    Renamed,
    /// The crawler asked for a drain
    Drained,
    Shutdown,
    ReadFailed(String),
    SpoolerClosed,
}

#[derive(Debug, Clone)]
pub struct HarvestSummary {
    pub file_id: FileId,
    pub path: PathBuf,
    pub offset: u64,
    pub lines: u64,
    pub truncated_lines: u64,
    pub dropped_lines: u64,
    pub reason: CloseReason,
}

/// Outcome of one bounded read from the buffered file
#[derive(Debug, PartialEq, Eq)]
enum Segment {
    /// A delimiter ended the pending bytes
    Line,
    /// Pending bytes reached the line limit without a delimiter
    Full,
    /// No more bytes right now; pending bytes are an incomplete line
    Eof,
}

enum EofOutcome {
    Continue,
    Close(CloseReason),
}

/// Marks the file state inactive however the harvester exits
struct ActiveGuard(SharedFileState);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.active = false;
        }
    }
}

/// Tails one file and pushes each complete line into the spooler.
pub struct Harvester {
    id: FileId,
    path: PathBuf,
    config: HarvesterConfig,
    reader: Option<BufReader<File>>,
    /// Bytes already handed to the spooler (or deliberately skipped)
    offset: u64,
    /// Bytes consumed from the file, including the pending partial line
    read_pos: u64,
    pending: Vec<u8>,
    discarding: bool,
    generation: u64,
    phase: HarvesterPhase,
    state: SharedFileState,
    spooler: SpoolerSender,
    control: mpsc::Receiver<HarvesterControl>,
    control_open: bool,
    shutdown: CancellationToken,
    lines: u64,
    truncated_lines: u64,
    dropped_lines: u64,
}

impl Harvester {
    /// Create a harvester that starts at the offset recorded in `state`
    pub fn new(
        id: FileId,
        config: HarvesterConfig,
        state: SharedFileState,
        spooler: SpoolerSender,
        control: mpsc::Receiver<HarvesterControl>,
        shutdown: CancellationToken,
    ) -> Self {
        let (path, offset, generation) = match state.lock() {
            Ok(s) => (s.path.clone(), s.offset, s.generation),
            Err(poisoned) => {
                let s = poisoned.into_inner();
                (s.path.clone(), s.offset, s.generation)
            }
        };

        Self {
            id,
            path,
            config,
            reader: None,
            offset,
            read_pos: offset,
            pending: Vec::new(),
            discarding: false,
            generation,
            phase: HarvesterPhase::Opening,
            state,
            spooler,
            control,
            control_open: true,
            shutdown,
            lines: 0,
            truncated_lines: 0,
            dropped_lines: 0,
        }
    }

    pub fn phase(&self) -> HarvesterPhase {
        self.phase
    }

    /// Run until the file goes away, the crawler drains it, or shutdown.
    pub async fn run(mut self) -> Result<HarvestSummary, HarvesterError> {
        let _guard = ActiveGuard(self.state.clone());

        self.open()?;
        info!(
            path = %self.path.display(),
            file_id = %self.id,
            offset = self.offset,
            "Harvester started"
        );

        let reason = self.read_loop().await;
        Ok(self.close(reason))
    }

    fn open(&mut self) -> Result<(), HarvesterError> {
        let path = self.path.clone();
        let open_error = |source: io::Error| HarvesterError::Open {
            path: path.clone(),
            source,
        };

        let file = File::open(&self.path).map_err(open_error)?;
        let metadata = file.metadata().map_err(open_error)?;
        if FileId::from_metadata(&metadata) != self.id {
            return Err(HarvesterError::IdentityChanged {
                path: self.path.clone(),
                expected: self.id,
            });
        }

        if self.offset > metadata.len() {
            warn!(
                path = %self.path.display(),
                offset = self.offset,
                size = metadata.len(),
                "File shorter than stored offset, starting from the beginning"
            );
            self.offset = 0;
            self.generation += 1;
        }

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(self.offset))
            .map_err(open_error)?;

        self.reader = Some(reader);
        self.read_pos = self.offset;
        self.phase = HarvesterPhase::Reading;
        self.update_state(file_mtime(&metadata));
        Ok(())
    }

    async fn read_loop(&mut self) -> CloseReason {
        loop {
            while let Ok(signal) = self.control.try_recv() {
                if let Some(reason) = self.handle_control(signal).await {
                    return reason;
                }
            }

            if self.shutdown.is_cancelled() {
                return CloseReason::Shutdown;
            }

            match self.next_event() {
                Ok(Some((event, advance))) => {
                    if let Some(reason) = self.ship(event, advance).await {
                        return reason;
                    }
                }
                Ok(None) => match self.at_eof().await {
                    EofOutcome::Continue => {}
                    EofOutcome::Close(reason) => return reason,
                },
                Err(e) => {
                    if self.shrunk() {
                        self.restart_from_beginning("file shrank during read");
                        continue;
                    }
                    warn!(path = %self.path.display(), error = %e, "Read failed, closing harvester");
                    return CloseReason::ReadFailed(e.to_string());
                }
            }
        }
    }

    async fn handle_control(&mut self, signal: HarvesterControl) -> Option<CloseReason> {
        match signal {
            HarvesterControl::Truncated => {
                if self.shrunk() {
                    self.restart_from_beginning("crawler detected truncation");
                } else {
                    debug!(path = %self.path.display(), "Truncation already handled");
                }
                None
            }
            HarvesterControl::Drain => Some(self.drain(CloseReason::Drained).await),
        }
    }

    /// Hand an event to the spooler and advance the offset once it is accepted
    async fn ship(&mut self, event: Event, advance: u64) -> Option<CloseReason> {
        let truncated = event.truncated;
        let pushed = tokio::select! {
            biased;
            result = self.spooler.push(event) => Some(result),
            _ = self.shutdown.cancelled() => None,
        };

        match pushed {
            Some(Ok(())) => {
                self.offset += advance;
                self.lines += 1;
                if truncated {
                    self.truncated_lines += 1;
                }
                self.update_state(None);
                None
            }
            Some(Err(SpoolerError::Closed)) => Some(CloseReason::SpoolerClosed),
            None => Some(CloseReason::Shutdown),
        }
    }

    /// Read the next complete line. Returns the event and the number of file
    /// bytes it accounts for, or `None` at the current end of file.
    fn next_event(&mut self) -> io::Result<Option<(Event, u64)>> {
        let limit = self.config.max_line_bytes.max(1);

        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };
            let (segment, consumed) = read_segment(reader, &mut self.pending, limit)?;
            self.read_pos += consumed as u64;

            if self.discarding {
                let skipped = match segment {
                    Segment::Line => {
                        self.discarding = false;
                        self.pending.len() + 1
                    }
                    Segment::Full | Segment::Eof => self.pending.len(),
                };
                self.pending.clear();
                self.skip(skipped as u64);
                if segment == Segment::Eof {
                    return Ok(None);
                }
                continue;
            }

            match segment {
                Segment::Eof => return Ok(None),
                Segment::Line => {
                    let advance = self.pending.len() as u64 + 1;
                    let mut line = std::mem::take(&mut self.pending);
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(Some((self.event(line, false), advance)));
                }
                Segment::Full => match self.config.on_long_line {
                    LongLinePolicy::Split => {
                        let line = std::mem::take(&mut self.pending);
                        let advance = line.len() as u64;
                        return Ok(Some((self.event(line, false), advance)));
                    }
                    LongLinePolicy::Truncate => {
                        let line = std::mem::take(&mut self.pending);
                        let advance = line.len() as u64;
                        self.discarding = true;
                        warn!(
                            path = %self.path.display(),
                            offset = self.offset,
                            limit,
                            "Line exceeds max_line_bytes, truncating"
                        );
                        return Ok(Some((self.event(line, true), advance)));
                    }
                    LongLinePolicy::Drop => {
                        warn!(
                            path = %self.path.display(),
                            offset = self.offset,
                            limit,
                            "Line exceeds max_line_bytes, dropping"
                        );
                        let skipped = self.pending.len() as u64;
                        self.pending.clear();
                        self.discarding = true;
                        self.dropped_lines += 1;
                        self.skip(skipped);
                    }
                },
            }
        }
    }

    fn event(&self, line: Vec<u8>, truncated: bool) -> Event {
        Event {
            source: self.path.clone(),
            file_id: self.id,
            offset: self.offset,
            read_at: Utc::now(),
            line,
            truncated,
        }
    }

    /// Advance past bytes that are intentionally not shipped
    fn skip(&mut self, bytes: u64) {
        if bytes > 0 {
            self.offset += bytes;
            self.update_state(None);
        }
    }

    async fn at_eof(&mut self) -> EofOutcome {
        let handle_metadata = match self.reader.as_ref().map(|r| r.get_ref().metadata()) {
            Some(Ok(metadata)) => metadata,
            Some(Err(e)) => return EofOutcome::Close(CloseReason::ReadFailed(e.to_string())),
            None => return EofOutcome::Close(CloseReason::ReadFailed("file not open".to_string())),
        };

        if handle_metadata.len() < self.read_pos {
            self.restart_from_beginning("file shrank");
            return EofOutcome::Continue;
        }
        if handle_metadata.len() > self.read_pos {
            return EofOutcome::Continue;
        }
        self.update_state(file_mtime(&handle_metadata));

        match std::fs::metadata(&self.path) {
            Ok(metadata) if FileId::from_metadata(&metadata) != self.id => {
                return EofOutcome::Close(self.drain(CloseReason::Renamed).await);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return EofOutcome::Close(self.drain(CloseReason::Removed).await);
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Could not stat path at EOF");
            }
        }

        let signal = tokio::select! {
            _ = tokio::time::sleep(self.config.eof_poll_interval) => None,
            _ = self.shutdown.cancelled() => None,
            signal = self.control.recv(), if self.control_open => {
                if signal.is_none() {
                    self.control_open = false;
                }
                signal
            }
        };

        if let Some(signal) = signal {
            if let Some(reason) = self.handle_control(signal).await {
                return EofOutcome::Close(reason);
            }
        }
        EofOutcome::Continue
    }

    /// Ship the complete lines still readable from the open handle. Returns
    /// `reason` once the handle is exhausted, or whatever stopped the drain.
    async fn drain(&mut self, reason: CloseReason) -> CloseReason {
        self.phase = HarvesterPhase::Draining;
        debug!(path = %self.path.display(), reason = ?reason, "Draining harvester");

        loop {
            match self.next_event() {
                Ok(Some((event, advance))) => {
                    if let Some(stop) = self.ship(event, advance).await {
                        return stop;
                    }
                }
                Ok(None) => return reason,
                Err(e) => return CloseReason::ReadFailed(e.to_string()),
            }
        }
    }

    fn shrunk(&self) -> bool {
        self.reader
            .as_ref()
            .and_then(|r| r.get_ref().metadata().ok())
            .map(|m| m.len() < self.read_pos)
            .unwrap_or(false)
    }

    /// Forget the old offset and read the file again from byte 0
    fn restart_from_beginning(&mut self, cause: &str) {
        self.phase = HarvesterPhase::Truncated;
        warn!(
            path = %self.path.display(),
            previous_offset = self.offset,
            cause,
            "Truncation detected, restarting at offset 0"
        );

        if let Some(reader) = self.reader.as_mut() {
            if let Err(e) = reader.seek(SeekFrom::Start(0)) {
                warn!(path = %self.path.display(), error = %e, "Failed to rewind file");
            }
        }

        self.offset = 0;
        self.read_pos = 0;
        self.pending.clear();
        self.discarding = false;
        self.generation += 1;
        self.update_state(None);
        self.phase = HarvesterPhase::Reading;
    }

    fn update_state(&self, mtime: Option<DateTime<Utc>>) {
        if let Ok(mut state) = self.state.lock() {
            state.offset = self.offset;
            state.generation = self.generation;
            if mtime.is_some() {
                state.mtime = mtime;
            }
        }
    }

    fn close(mut self, reason: CloseReason) -> HarvestSummary {
        self.phase = HarvesterPhase::Closed;
        self.reader = None;
        self.update_state(None);

        info!(
            path = %self.path.display(),
            file_id = %self.id,
            offset = self.offset,
            lines = self.lines,
            reason = ?reason,
            "Harvester closed"
        );

        HarvestSummary {
            file_id: self.id,
            path: self.path.clone(),
            offset: self.offset,
            lines: self.lines,
            truncated_lines: self.truncated_lines,
            dropped_lines: self.dropped_lines,
            reason,
        }
    }
}

/// Append bytes to `buf` up to and excluding the next `\n`, never letting
/// `buf` grow past `limit`. Returns the segment kind and the bytes consumed
/// from the reader (the delimiter included).
fn read_segment(
    reader: &mut impl BufRead,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<(Segment, usize)> {
    let mut consumed = 0;

    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            return Ok((Segment::Eof, consumed));
        }

        let room = limit.saturating_sub(buf.len());
        let window = available.len().min(room + 1);
        if let Some(i) = available[..window].iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&available[..i]);
            reader.consume(i + 1);
            return Ok((Segment::Line, consumed + i + 1));
        }

        let take = available.len().min(room);
        buf.extend_from_slice(&available[..take]);
        reader.consume(take);
        consumed += take;

        if buf.len() >= limit {
            return Ok((Segment::Full, consumed));
        }
    }
}

fn file_mtime(metadata: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{spooler, SpoolerReceiver};
    use crate::registry::{FileState, OffsetTable};
    use std::fs::OpenOptions;
    use std::io::{Cursor, Write};
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    struct Running {
        task: JoinHandle<Result<HarvestSummary, HarvesterError>>,
        events: SpoolerReceiver,
        state: SharedFileState,
        control: mpsc::Sender<HarvesterControl>,
        shutdown: CancellationToken,
    }

    fn config(max_line_bytes: usize, on_long_line: LongLinePolicy) -> HarvesterConfig {
        HarvesterConfig {
            max_line_bytes,
            on_long_line,
            eof_poll_interval: Duration::from_millis(10),
        }
    }

    fn start(path: &Path, offset: u64, config: HarvesterConfig) -> Running {
        let id = FileId::from_path(path).unwrap();
        let table = OffsetTable::new();
        let state = table.activate(id, FileState::new(path.to_path_buf(), offset, None));
        let (tx, rx) = spooler(64);
        let (control_tx, control_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let harvester = Harvester::new(id, config, state.clone(), tx, control_rx, shutdown.clone());
        Running {
            task: tokio::spawn(harvester.run()),
            events: rx,
            state,
            control: control_tx,
            shutdown,
        }
    }

    fn append(path: &Path, data: &str) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    async fn next_lines(events: &mut SpoolerReceiver, count: usize) -> Vec<Event> {
        let mut out = Vec::new();
        while out.len() < count {
            let batch = tokio::time::timeout(
                Duration::from_secs(2),
                events.drain(count - out.len(), Duration::ZERO),
            )
            .await
            .expect("timed out waiting for events")
            .expect("spooler closed");
            out.extend(batch);
        }
        out
    }

    fn offset_of(state: &SharedFileState) -> u64 {
        state.lock().unwrap().offset
    }

    #[test]
    fn test_read_segment_lines_and_eof() {
        let mut reader = Cursor::new(b"one\ntwo\npar".to_vec());
        let mut buf = Vec::new();

        assert_eq!(read_segment(&mut reader, &mut buf, 100).unwrap(), (Segment::Line, 4));
        assert_eq!(buf, b"one");
        buf.clear();
        assert_eq!(read_segment(&mut reader, &mut buf, 100).unwrap(), (Segment::Line, 4));
        buf.clear();
        assert_eq!(read_segment(&mut reader, &mut buf, 100).unwrap(), (Segment::Eof, 3));
        assert_eq!(buf, b"par");
    }

    #[test]
    fn test_read_segment_line_exactly_at_limit() {
        let mut reader = Cursor::new(b"abcd\nef".to_vec());
        let mut buf = Vec::new();

        assert_eq!(read_segment(&mut reader, &mut buf, 4).unwrap(), (Segment::Line, 5));
        assert_eq!(buf, b"abcd");
    }

    #[test]
    fn test_read_segment_full() {
        let mut reader = Cursor::new(b"abcdefgh\n".to_vec());
        let mut buf = Vec::new();

        assert_eq!(read_segment(&mut reader, &mut buf, 3).unwrap(), (Segment::Full, 3));
        assert_eq!(buf, b"abc");
    }

    #[tokio::test]
    async fn test_ships_complete_lines_and_tracks_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "hello\nworld\n");

        let mut running = start(&path, 0, config(1024, LongLinePolicy::Split));
        let events = next_lines(&mut running.events, 2).await;

        assert_eq!(events[0].line, b"hello");
        assert_eq!(events[0].offset, 0);
        assert_eq!(events[1].line, b"world");
        assert_eq!(events[1].offset, 6);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(offset_of(&running.state), 12);

        running.shutdown.cancel();
        let summary = running.task.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::Shutdown);
        assert_eq!(summary.offset, 12);
        assert_eq!(summary.lines, 2);
        assert!(!running.state.lock().unwrap().active);
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_delimiter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "first\nsec");

        let mut running = start(&path, 0, config(1024, LongLinePolicy::Split));
        let events = next_lines(&mut running.events, 1).await;
        assert_eq!(events[0].line, b"first");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(running.events.is_empty());
        assert_eq!(offset_of(&running.state), 6);

        append(&path, "ond\r\n");
        let events = next_lines(&mut running.events, 1).await;
        assert_eq!(events[0].line, b"second");
        assert_eq!(events[0].offset, 6);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(offset_of(&running.state), 14);
        running.shutdown.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resumes_from_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "old\nnew\n");

        let mut running = start(&path, 4, config(1024, LongLinePolicy::Split));
        let events = next_lines(&mut running.events, 1).await;
        assert_eq!(events[0].line, b"new");
        assert_eq!(events[0].offset, 4);

        running.shutdown.cancel();
        let summary = running.task.await.unwrap().unwrap();
        assert_eq!(summary.offset, 8);
        assert_eq!(summary.lines, 1);
    }

    #[tokio::test]
    async fn test_truncation_restarts_at_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "aaaa\nbbbb\ncccc\n");

        let mut running = start(&path, 0, config(1024, LongLinePolicy::Split));
        next_lines(&mut running.events, 3).await;

        OpenOptions::new().write(true).open(&path).unwrap().set_len(0).unwrap();
        append(&path, "new\n");

        let events = next_lines(&mut running.events, 1).await;
        assert_eq!(events[0].line, b"new");
        assert_eq!(events[0].offset, 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        {
            let state = running.state.lock().unwrap();
            assert_eq!(state.offset, 4);
            assert_eq!(state.generation, 1);
        }

        running.shutdown.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_truncation_signal_from_crawler() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "0123456789\n");

        let mut running = start(&path, 0, config(1024, LongLinePolicy::Split));
        next_lines(&mut running.events, 1).await;

        OpenOptions::new().write(true).open(&path).unwrap().set_len(0).unwrap();
        running.control.send(HarvesterControl::Truncated).await.unwrap();
        append(&path, "x\n");

        let events = next_lines(&mut running.events, 1).await;
        assert_eq!(events[0].line, b"x");
        assert_eq!(events[0].offset, 0);

        running.shutdown.cancel();
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_long_line_split() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "abcdefghij\nok\n");

        let mut running = start(&path, 0, config(4, LongLinePolicy::Split));
        let events = next_lines(&mut running.events, 4).await;
        let lines: Vec<&[u8]> = events.iter().map(|e| e.line.as_slice()).collect();
        assert_eq!(lines, vec![&b"abcd"[..], b"efgh", b"ij", b"ok"]);
        assert_eq!(events[1].offset, 4);
        assert!(events.iter().all(|e| !e.truncated));

        running.shutdown.cancel();
        assert_eq!(running.task.await.unwrap().unwrap().offset, 14);
    }

    #[tokio::test]
    async fn test_long_line_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "abcdefghij\nok\n");

        let mut running = start(&path, 0, config(4, LongLinePolicy::Truncate));
        let events = next_lines(&mut running.events, 2).await;
        assert_eq!(events[0].line, b"abcd");
        assert!(events[0].truncated);
        assert_eq!(events[1].line, b"ok");
        assert_eq!(events[1].offset, 11);

        running.shutdown.cancel();
        let summary = running.task.await.unwrap().unwrap();
        assert_eq!(summary.offset, 14);
        assert_eq!(summary.truncated_lines, 1);
    }

    #[tokio::test]
    async fn test_long_line_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "abcdefghij\nok\n");

        let mut running = start(&path, 0, config(4, LongLinePolicy::Drop));
        let events = next_lines(&mut running.events, 1).await;
        assert_eq!(events[0].line, b"ok");
        assert_eq!(events[0].offset, 11);

        running.shutdown.cancel();
        let summary = running.task.await.unwrap().unwrap();
        assert_eq!(summary.dropped_lines, 1);
        assert_eq!(summary.offset, 14);
    }

    #[tokio::test]
    async fn test_removed_file_closes_after_drain() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "one\n");

        let mut running = start(&path, 0, config(1024, LongLinePolicy::Split));
        next_lines(&mut running.events, 1).await;

        std::fs::remove_file(&path).unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(2), running.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.reason, CloseReason::Removed);
        assert_eq!(summary.offset, 4);
        assert!(!running.state.lock().unwrap().active);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotated_file_drains_remaining_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "one\n");

        let mut running = start(&path, 0, config(1024, LongLinePolicy::Split));
        next_lines(&mut running.events, 1).await;

        // Writer appends after the rename, then a fresh file takes the path
        let rotated = dir.path().join("a.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        append(&rotated, "two\n");
        append(&path, "fresh\n");

        let events = next_lines(&mut running.events, 1).await;
        assert_eq!(events[0].line, b"two");

        let summary = tokio::time::timeout(Duration::from_secs(2), running.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.reason, CloseReason::Renamed);
        assert_eq!(summary.offset, 8);
    }

    #[tokio::test]
    async fn test_drain_signal_closes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "one\n");

        let mut running = start(&path, 0, config(1024, LongLinePolicy::Split));
        next_lines(&mut running.events, 1).await;

        running.control.send(HarvesterControl::Drain).await.unwrap();
        let summary = running.task.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::Drained);
    }

    #[tokio::test]
    async fn test_drain_signal_ships_backlog_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        let mut content = String::new();
        for i in 0..100 {
            content.push_str(&format!("line {}\n", i));
        }
        append(&path, &content);

        // The spooler holds 64, so the harvester is blocked mid-file
        let mut running = start(&path, 0, config(1024, LongLinePolicy::Split));
        tokio::time::sleep(Duration::from_millis(30)).await;
        running.control.send(HarvesterControl::Drain).await.unwrap();

        let events = next_lines(&mut running.events, 100).await;
        let lines: Vec<String> = events.iter().map(|e| e.text().into_owned()).collect();
        let expected: Vec<String> = (0..100).map(|i| format!("line {}", i)).collect();
        assert_eq!(lines, expected);

        let summary = running.task.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::Drained);
        assert_eq!(summary.offset, content.len() as u64);
        assert_eq!(summary.lines, 100);
    }

    #[tokio::test]
    async fn test_open_error_leaves_state_inactive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "x\n");

        let id = FileId::from_path(&path).unwrap();
        let table = OffsetTable::new();
        let state = table.activate(id, FileState::new(path.clone(), 0, None));
        std::fs::remove_file(&path).unwrap();

        let (tx, _rx) = spooler(4);
        let (_control_tx, control_rx) = mpsc::channel(1);
        let harvester = Harvester::new(
            id,
            config(1024, LongLinePolicy::Split),
            state.clone(),
            tx,
            control_rx,
            CancellationToken::new(),
        );
        assert_eq!(harvester.phase(), HarvesterPhase::Opening);

        let result = harvester.run().await;
        assert!(matches!(result, Err(HarvesterError::Open { .. })));
        assert!(!state.lock().unwrap().active);
    }

    #[tokio::test]
    async fn test_spooler_closed_stops_harvester() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        append(&path, "one\ntwo\n");

        let running = start(&path, 0, config(1024, LongLinePolicy::Split));
        drop(running.events);

        let summary = running.task.await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::SpoolerClosed);
        assert_eq!(summary.offset, 0);
    }
}
