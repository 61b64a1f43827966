//! Segment import orchestration
//!
//! One import reads a log front to back, feeds every message to the time
//! synchronizer and the row accumulator, and hands the result to the store
//! in a single upsert. Nothing is written until the whole log decoded
//! cleanly; cancellation and deadlines are checked between frames and once
//! more right before the storage transaction.

use crate::config::ImportConfig;
use crate::formats::{DecodeStats, RlogReader};
use crate::signals::{can_signal_identity, BusDefinitionSet, DefinitionHandle};
use crate::storage::{ChildRowCounts, SegmentChildren, SegmentHeader, StoreHandle};
use crate::timesync::{ClockAlignment, TimeSynchronizer};
use crate::types::{
    Camera, CanFrameRow, ImportError, LogKind, LogMessage, LogSource, LogTextRow, MessagePayload,
    Result, SignalSample, VideoFrameRow,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Where a segment lands in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentIdentity {
    pub route_id: String,
    pub dongle_id: Option<String>,
    pub segment_number: u32,
}

impl SegmentIdentity {
    pub fn new(route_id: impl Into<String>, segment_number: u32) -> Self {
        Self {
            route_id: route_id.into(),
            dongle_id: None,
            segment_number,
        }
    }

    /// Derive the identity from `<dongle_id>--<hex_ts>--<segment_number>/<log>`
    pub fn from_log_path(path: &Path) -> Result<Self> {
        let invalid = |reason: &str| {
            ImportError::InvalidSegmentPath(format!("{}: {}", path.display(), reason))
        };

        let dir_name = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
            .ok_or_else(|| invalid("log file has no segment directory"))?;

        let parts: Vec<&str> = dir_name.split("--").collect();
        let [dongle_id, timestamp_hex, number] = parts.as_slice() else {
            return Err(invalid("segment directory is not <dongle_id>--<hex_ts>--<n>"));
        };

        if dongle_id.is_empty() {
            return Err(invalid("empty dongle id"));
        }
        if timestamp_hex.is_empty() || !timestamp_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("route timestamp is not hexadecimal"));
        }
        let segment_number = number
            .parse::<u32>()
            .map_err(|_| invalid("segment number is not a non-negative integer"))?;

        Ok(Self {
            route_id: format!("{dongle_id}--{timestamp_hex}"),
            dongle_id: Some(dongle_id.to_string()),
            segment_number,
        })
    }
}

/// A log file to import, with an optional explicit identity
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub log_path: PathBuf,
    pub identity: Option<SegmentIdentity>,
}

impl ImportRequest {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: SegmentIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn identity(&self) -> Result<SegmentIdentity> {
        match &self.identity {
            Some(identity) => Ok(identity.clone()),
            None => SegmentIdentity::from_log_path(&self.log_path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    Decoding,
    Storing,
    Finalizing,
    Done,
    /// Stopped by the cancellation token; nothing was committed
    Cancelled,
    /// Stopped by an error (deadline included); nothing was committed
    Failed(String),
}

impl ImportPhase {
    /// Terminal phase for an import that returned `err`
    pub fn from_error(err: &ImportError) -> Self {
        match err {
            ImportError::Cancelled { .. } => ImportPhase::Cancelled,
            other => ImportPhase::Failed(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportPhase::Done | ImportPhase::Cancelled | ImportPhase::Failed(_)
        )
    }
}

/// Snapshot published on the progress channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportProgress {
    pub phase: ImportPhase,
    pub messages_processed: u64,
    pub bytes_consumed: u64,
    pub total_bytes: Option<u64>,
}

impl ImportProgress {
    fn start(total_bytes: Option<u64>) -> Self {
        Self {
            phase: ImportPhase::Decoding,
            messages_processed: 0,
            bytes_consumed: 0,
            total_bytes,
        }
    }

    /// Fraction of the input consumed, when the input size is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_consumed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Caller-side handles of a running import
#[derive(Debug, Clone, Default)]
pub struct ImportControl {
    cancel: CancellationToken,
    progress: Option<Arc<watch::Sender<ImportProgress>>>,
}

impl ImportControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing token, e.g. one cancelled on Ctrl-C
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Create a progress channel; the receiver sees the latest snapshot
    pub fn with_progress_channel(mut self) -> (Self, watch::Receiver<ImportProgress>) {
        let (sender, receiver) = watch::channel(ImportProgress::start(None));
        self.progress = Some(Arc::new(sender));
        (self, receiver)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mark the import as stopped, keeping the last published counters
    fn publish_failure(&self, err: &ImportError) {
        if let Some(sender) = &self.progress {
            sender.send_modify(|progress| progress.phase = ImportPhase::from_error(err));
        }
    }
}

/// Throttled, monotonic progress publisher
struct ProgressPublisher<'a> {
    sender: Option<&'a watch::Sender<ImportProgress>>,
    interval: u64,
    last_published: u64,
    current: ImportProgress,
}

impl<'a> ProgressPublisher<'a> {
    fn new(control: &'a ImportControl, interval: u64, total_bytes: Option<u64>) -> Self {
        let publisher = Self {
            sender: control.progress.as_deref(),
            interval: interval.max(1),
            last_published: 0,
            current: ImportProgress::start(total_bytes),
        };
        publisher.publish();
        publisher
    }

    fn advance(&mut self, messages_processed: u64, bytes_consumed: u64) {
        self.current.messages_processed = self.current.messages_processed.max(messages_processed);
        self.current.bytes_consumed = self.current.bytes_consumed.max(bytes_consumed);
        if self.current.messages_processed - self.last_published >= self.interval {
            self.last_published = self.current.messages_processed;
            self.publish();
        }
    }

    fn phase(&mut self, phase: ImportPhase) {
        self.current.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        if let Some(sender) = self.sender {
            sender.send_replace(self.current.clone());
        }
    }
}

/// Final status of an import
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ImportStatus {
    Success,
    SuccessWithWarnings(u64),
    Failed(String),
}

impl ImportStatus {
    pub fn of(result: &Result<ImportReport>) -> Self {
        match result {
            Ok(report) => report.status(),
            Err(e) => ImportStatus::Failed(e.to_string()),
        }
    }
}

/// Outcome of a committed import
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub identity: SegmentIdentity,
    pub segment_id: i64,
    pub replaced_existing: bool,
    pub messages_processed: u64,
    pub rows: ChildRowCounts,
    pub clock: ClockAlignment,
    pub decode: DecodeStats,
    /// Samples whose message type was excluded by the allow list
    pub filtered_messages: u64,
    pub definitions_created: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ImportReport {
    pub fn warnings(&self) -> u64 {
        self.decode.warnings()
    }

    pub fn status(&self) -> ImportStatus {
        match self.warnings() {
            0 => ImportStatus::Success,
            n => ImportStatus::SuccessWithWarnings(n),
        }
    }
}

/// Turns the message stream into rows for one segment
struct SegmentAccumulator<'a> {
    config: &'a ImportConfig,
    definitions: Option<&'a BusDefinitionSet>,
    children: SegmentChildren,
    dongle_id: Option<String>,
    filtered_messages: u64,
}

impl<'a> SegmentAccumulator<'a> {
    fn new(config: &'a ImportConfig, definitions: Option<&'a BusDefinitionSet>) -> Self {
        Self {
            config,
            definitions: definitions.filter(|set| !set.is_empty()),
            children: SegmentChildren::default(),
            dongle_id: None,
            filtered_messages: 0,
        }
    }

    fn push(&mut self, message: &LogMessage) {
        let time_ns = message.mono_time_ns;
        match &message.payload {
            MessagePayload::InitData { dongle_id, .. } => {
                if self.dongle_id.is_none() && !dongle_id.is_empty() {
                    self.dongle_id = Some(dongle_id.clone());
                }
            }
            MessagePayload::GpsLocation(fix) => {
                if !self.config.should_process_message_type("gpsLocation") {
                    self.filtered_messages += 1;
                } else if fix.has_fix {
                    for (field, value) in [
                        ("latitude", fix.latitude),
                        ("longitude", fix.longitude),
                        ("altitude", fix.altitude),
                        ("speed", f64::from(fix.speed)),
                    ] {
                        self.sample(time_ns, format!("gpsLocation.{field}"), value);
                    }
                }
            }
            MessagePayload::VehicleState { message_type, fields } => {
                if !self.config.should_process_message_type(message_type) {
                    self.filtered_messages += 1;
                    return;
                }
                for field in fields {
                    self.sample(time_ns, format!("{}.{}", message_type, field.name), field.value.as_f64());
                }
            }
            MessagePayload::Can(frames) => {
                for frame in frames {
                    self.children.can_frames.push(CanFrameRow {
                        time_ns,
                        address: frame.address,
                        bus: frame.bus,
                        data: frame.data.clone(),
                    });

                    if !self.config.materialize_can_signals {
                        continue;
                    }
                    if let Some(definitions) = self.definitions {
                        for signal in definitions.decode(frame.address, &frame.data) {
                            let name = can_signal_identity(frame.address, &signal.name);
                            self.sample(time_ns, name, signal.value);
                        }
                    }
                }
            }
            MessagePayload::EncodeIndex { camera, frame_id, timestamp_sof } => {
                self.children.video_frames.push(VideoFrameRow {
                    camera: *camera,
                    frame_number: *frame_id,
                    timestamp_sof: *timestamp_sof,
                });
            }
            MessagePayload::Text { kind, text } => {
                self.children.log_messages.push(parse_log_text(time_ns, *kind, text));
            }
        }
    }

    fn sample(&mut self, time_ns: u64, signal_name: String, value: f64) {
        self.children.samples.push(SignalSample {
            time_ns,
            signal_name,
            value,
        });
    }
}

#[derive(Debug, Default, Deserialize)]
struct JsonLogContext {
    daemon: Option<String>,
    dongle_id: Option<String>,
    version: Option<String>,
    branch: Option<String>,
    commit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonLogLine {
    #[serde(default)]
    msg: serde_json::Value,
    levelnum: Option<i64>,
    filename: Option<String>,
    funcname: Option<String>,
    lineno: Option<i64>,
    #[serde(default)]
    ctx: JsonLogContext,
}

/// Split a structured log line into source metadata and message text.
/// Anything that is not a JSON object of the expected shape is kept raw.
pub fn parse_log_text(time_ns: u64, kind: LogKind, text: &str) -> LogTextRow {
    match serde_json::from_str::<JsonLogLine>(text) {
        Ok(line) => {
            let message = match line.msg {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            LogTextRow {
                time_ns,
                kind,
                source: LogSource {
                    daemon: line.ctx.daemon,
                    levelnum: line.levelnum,
                    filename: line.filename,
                    funcname: line.funcname,
                    lineno: line.lineno,
                    dongle_id: line.ctx.dongle_id,
                    version: line.ctx.version,
                    branch: line.ctx.branch,
                    commit: line.ctx.commit,
                },
                message,
            }
        }
        Err(_) => LogTextRow {
            time_ns,
            kind,
            source: LogSource::default(),
            message: text.to_string(),
        },
    }
}

/// Video files and thumbnail present next to a log
fn discover_media(segment_dir: &Path, segment_number: u32) -> (BTreeMap<Camera, String>, Option<String>) {
    let videos = Camera::ALL
        .iter()
        .filter_map(|camera| {
            let path = segment_dir.join(camera.file_name());
            path.is_file().then(|| (*camera, path.display().to_string()))
        })
        .collect();

    let thumbnail = segment_dir.join(format!("thumbnail_{segment_number}.jpg"));
    let thumbnail = thumbnail.is_file().then(|| thumbnail.display().to_string());
    (videos, thumbnail)
}

/// Imports segments into one store
pub struct SegmentImporter {
    store: StoreHandle,
    definitions: Option<DefinitionHandle>,
    config: ImportConfig,
}

impl SegmentImporter {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            definitions: None,
            config: ImportConfig::default(),
        }
    }

    /// Decode CAN traffic with the set currently held by `definitions`
    pub fn with_definitions(mut self, definitions: DefinitionHandle) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub fn with_config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Import one log file
    pub fn import(&self, request: &ImportRequest, control: &ImportControl) -> Result<ImportReport> {
        let path = &request.log_path;
        let opened = request.identity().and_then(|identity| {
            log::info!(
                "Importing segment {} of route {} from {:?}",
                identity.segment_number,
                identity.route_id,
                path
            );
            let total_bytes = std::fs::metadata(path)?.len();
            let reader = RlogReader::open(path)?;
            Ok((identity, reader, total_bytes))
        });

        match opened {
            Ok((identity, reader, total_bytes)) => {
                self.run(identity, reader, Some(path), Some(total_bytes), control)
            }
            Err(e) => {
                control.publish_failure(&e);
                Err(e)
            }
        }
    }

    /// Import from any byte stream; no media files are looked up
    pub fn import_reader<R: Read>(
        &self,
        identity: SegmentIdentity,
        reader: R,
        control: &ImportControl,
    ) -> Result<ImportReport> {
        self.run(identity, RlogReader::new(reader), None, None, control)
    }

    fn check_interrupt(&self, control: &ImportControl, messages_processed: u64) -> Result<()> {
        if control.is_cancelled() {
            return Err(ImportError::Cancelled { messages_processed });
        }
        if self.config.deadline_passed() {
            return Err(ImportError::DeadlineExceeded { messages_processed });
        }
        Ok(())
    }

    fn run<R: Read>(
        &self,
        identity: SegmentIdentity,
        reader: RlogReader<R>,
        log_path: Option<&Path>,
        total_bytes: Option<u64>,
        control: &ImportControl,
    ) -> Result<ImportReport> {
        let started = Instant::now();
        let definitions = self.definitions.as_ref().map(DefinitionHandle::snapshot);
        let mut progress = ProgressPublisher::new(control, self.config.progress_interval, total_bytes);

        let result = self.run_phases(
            identity,
            reader,
            log_path,
            control,
            definitions.as_deref(),
            &mut progress,
        );
        match result {
            Ok(mut report) => {
                report.elapsed = started.elapsed();
                log::info!(
                    "Imported segment {} of {} in {:.2?}: {} messages, {} rows, wall clock from {}",
                    report.identity.segment_number,
                    report.identity.route_id,
                    report.elapsed,
                    report.messages_processed,
                    report.rows.total(),
                    report.clock.source
                );
                Ok(report)
            }
            Err(e) => {
                progress.phase(ImportPhase::from_error(&e));
                Err(e)
            }
        }
    }

    fn run_phases<R: Read>(
        &self,
        identity: SegmentIdentity,
        mut reader: RlogReader<R>,
        log_path: Option<&Path>,
        control: &ImportControl,
        definitions: Option<&BusDefinitionSet>,
        progress: &mut ProgressPublisher<'_>,
    ) -> Result<ImportReport> {
        let mut sync = TimeSynchronizer::new(self.config.gps_search_window());
        let mut accumulator = SegmentAccumulator::new(&self.config, definitions);
        let mut messages_processed = 0u64;

        loop {
            if let Err(e) = self.check_interrupt(control, messages_processed) {
                log::warn!("Import of {} stopped before commit: {}", identity.route_id, e);
                return Err(e);
            }

            let message = match reader.next() {
                Some(message) => message?,
                None => break,
            };
            log::trace!(
                "{} at t={} (offset {})",
                message.message_type(),
                message.mono_time_ns,
                message.offset
            );

            sync.observe(&message);
            accumulator.push(&message);
            messages_processed += 1;
            progress.advance(messages_processed, reader.offset());
        }

        let decode = reader.into_stats();
        if decode.warnings() > 0 {
            log::warn!(
                "Segment {} of {}: {} frames skipped ({} unknown types, {} malformed payloads, {} malformed CAN entries)",
                identity.segment_number,
                identity.route_id,
                decode.warnings(),
                decode.unknown_frame_types,
                decode.malformed_payloads,
                decode.malformed_can_entries
            );
        }

        self.check_interrupt(control, messages_processed)?;

        let clock = sync.finish();
        let SegmentAccumulator {
            children,
            dongle_id,
            filtered_messages,
            ..
        } = accumulator;

        let mut header = SegmentHeader::new(identity.route_id.clone(), identity.segment_number);
        header.dongle_id = identity.dongle_id.clone().or(dongle_id);
        header.dbc_file = definitions.and_then(BusDefinitionSet::source_label);
        header.clock = clock;
        header.total_events = messages_processed;
        if let Some(path) = log_path {
            header.log_path = Some(path.display().to_string());
            if let Some(dir) = path.parent() {
                let (videos, thumbnail) = discover_media(dir, identity.segment_number);
                header.video_paths = videos;
                header.thumbnail_path = thumbnail;
            }
        }

        progress.phase(ImportPhase::Storing);
        let store = self.store.connect()?;
        let outcome = store.upsert_segment(&header, &children)?;

        progress.phase(ImportPhase::Finalizing);
        let definitions_created = if self.config.auto_create_definitions {
            match store.auto_create_missing_definitions(outcome.segment_id) {
                Ok(created) => created,
                Err(e) => {
                    log::warn!(
                        "Could not auto-create definitions for segment {}: {}",
                        outcome.segment_id,
                        e
                    );
                    0
                }
            }
        } else {
            0
        };
        progress.phase(ImportPhase::Done);

        Ok(ImportReport {
            identity,
            segment_id: outcome.segment_id,
            replaced_existing: outcome.replaced_existing,
            messages_processed,
            rows: outcome.inserted,
            clock,
            decode,
            filtered_messages,
            definitions_created,
            elapsed: Duration::ZERO,
        })
    }
}
