use crate::config::FuzzwatchConfig;
use crate::decoder::{DecodeError, LogLine};
use crate::extractor::{EventExtractors, ExtractorError, LineEvents, Timestamp};
use crate::persist::{PersistError, SummarySink};
use crate::sanitizer::CrashClassifier;
use crate::summary::{FuzzSummary, RunCounter};
use crate::triage::{CrashTriage, PendingCrash};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Extract(#[from] ExtractorError),
    #[error("input stream aborted: {0}")]
    Input(#[from] DecodeError),
}

/// How a stream run came to an end without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The input reached end of file.
    Exhausted,
    /// The tee reader went away; treated like a termination request.
    TeeClosed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessorOptions {
    pub sink_mode: bool,
    /// Dump at least this often, independent of milestones.
    pub dump_interval: Option<Duration>,
}

impl From<&FuzzwatchConfig> for ProcessorOptions {
    fn from(config: &FuzzwatchConfig) -> Self {
        Self {
            sink_mode: config.triage.sink_mode,
            dump_interval: config.dump_interval(),
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle that can persist the current summary from any thread,
/// e.g. a termination-signal handler.
///
/// The summary is only mutated while its lock is held for a whole line, so a
/// flush always sees the state as of a line boundary.
#[derive(Clone)]
pub struct FlushHandle {
    summary: Arc<Mutex<FuzzSummary>>,
    sink: Arc<Mutex<Box<dyn SummarySink>>>,
}

impl FlushHandle {
    pub fn flush(&self) -> Result<(), PersistError> {
        let summary = lock(&self.summary);
        lock(&self.sink).dump(&summary)
    }

    pub fn snapshot(&self) -> FuzzSummary {
        lock(&self.summary).clone()
    }

    pub fn sink_name(&self) -> &'static str {
        lock(&self.sink).name()
    }
}

/// Processing context for one fuzzer log stream.
///
/// Owns the baseline, the triage queue, the round counter and the shared
/// summary. Dropping an unfinished processor performs a last best-effort dump.
pub struct StreamProcessor {
    extractors: EventExtractors,
    classifier: CrashClassifier,
    triage: CrashTriage,
    runs: RunCounter,
    baseline: Option<Timestamp>,
    needs_dump: bool,
    dump_interval: Option<Duration>,
    last_dump: Instant,
    lines_since_dump: u64,
    handle: FlushHandle,
    finished: bool,
}

impl StreamProcessor {
    pub fn new(options: ProcessorOptions, sink: Box<dyn SummarySink>) -> Result<Self, ProcessError> {
        Ok(Self {
            extractors: EventExtractors::new()?,
            classifier: CrashClassifier::new(options.sink_mode),
            triage: CrashTriage::new(),
            runs: RunCounter::new(),
            baseline: None,
            needs_dump: false,
            dump_interval: options.dump_interval,
            last_dump: Instant::now(),
            lines_since_dump: 0,
            handle: FlushHandle {
                summary: Arc::new(Mutex::new(FuzzSummary::new())),
                sink: Arc::new(Mutex::new(sink)),
            },
            finished: false,
        })
    }

    pub fn flush_handle(&self) -> FlushHandle {
        self.handle.clone()
    }

    pub fn snapshot(&self) -> FuzzSummary {
        self.handle.snapshot()
    }

    pub fn baseline(&self) -> Option<Timestamp> {
        self.baseline
    }

    pub fn pending_crashes(&self) -> usize {
        self.triage.pending_len()
    }

    /// Processes one decoded line and dumps the summary if a milestone or the
    /// dump interval calls for it.
    ///
    /// On error the summary is left exactly as it was before the line.
    pub fn process_line(&mut self, line: &str) -> Result<(), ProcessError> {
        let events = self.extractors.extract(line)?;
        self.apply(events);
        self.lines_since_dump += 1;
        self.maybe_dump();
        Ok(())
    }

    /// Drives the processor over a stream of decoded lines.
    ///
    /// Per-line failures are logged and skipped. A read failure or a tee
    /// failure ends the stream after one last dump attempt.
    pub fn run<I>(&mut self, lines: I) -> Result<StreamEnd, ProcessError>
    where
        I: IntoIterator<Item = Result<LogLine, DecodeError>>,
    {
        for item in lines {
            match item {
                Ok(line) => {
                    if let Err(e) = self.process_line(&line.text) {
                        warn!(line = line.number, error = %e, "skipping line that failed to process");
                    }
                }
                Err(e @ DecodeError::Undecodable { .. }) => {
                    warn!(error = %e, "skipping undecodable line");
                }
                Err(e) if e.is_tee_closed() => {
                    info!("tee output closed, stopping");
                    self.flush_logged();
                    return Ok(StreamEnd::TeeClosed);
                }
                Err(e) => {
                    error!(error = %e, "input stream failed");
                    self.flush_logged();
                    return Err(e.into());
                }
            }
        }
        Ok(StreamEnd::Exhausted)
    }

    /// Persists the current summary. Safe to call any number of times.
    pub fn flush(&mut self) -> Result<(), PersistError> {
        let result = self.handle.flush();
        self.needs_dump = false;
        self.last_dump = Instant::now();
        if result.is_ok() {
            self.lines_since_dump = 0;
        }
        result
    }

    /// Final dump at the end of the stream.
    pub fn finish(mut self) -> Result<FuzzSummary, PersistError> {
        self.finished = true;
        self.flush()?;
        Ok(self.handle.snapshot())
    }

    fn flush_logged(&mut self) {
        match self.flush() {
            Ok(()) => debug!(sink = self.handle.sink_name(), "summary dumped"),
            Err(e) => warn!(error = %e, "summary dump failed, state is kept for the next dump"),
        }
    }

    fn maybe_dump(&mut self) {
        let interval_due = self
            .dump_interval
            .is_some_and(|interval| self.last_dump.elapsed() >= interval);
        if self.needs_dump || interval_due {
            self.flush_logged();
        }
    }

    fn elapsed(&self, timestamp: Option<Timestamp>) -> Option<i64> {
        Some(timestamp? - self.baseline?)
    }

    fn apply(&mut self, events: LineEvents) {
        let handle = self.handle.clone();
        let mut summary = lock(&handle.summary);

        if let Some(start) = events.run_start {
            match (self.baseline, start.timestamp) {
                (None, Some(ts)) => {
                    self.baseline = Some(ts);
                    info!(baseline = ts, "fuzzer started, baseline set");
                }
                _ => info!(timestamp = ?start.timestamp, "fuzzer run started"),
            }
            self.needs_dump = true;
        }

        if let Some(sample) = events.coverage {
            let elapsed = self.elapsed(sample.timestamp);
            summary.record_coverage(elapsed, sample.cov, sample.ft, sample.rss);
            summary.ttl_round = self.runs.observe_round(sample.round);
            debug!(
                elapsed = ?elapsed,
                round = summary.ttl_round,
                cov = sample.cov,
                ft = sample.ft,
                rss = sample.rss,
                "coverage sample"
            );
        }

        if let Some(crash) = events.crash {
            let elapsed = self.elapsed(crash.timestamp);
            summary.record_crash(elapsed, &crash.text);
            match self.classifier.classify(&crash.text) {
                Some(class) => self.triage.report_crash(PendingCrash {
                    elapsed_time: elapsed,
                    raw_text: crash.text,
                    class,
                }),
                None => debug!(crash = %crash.text, "crash is not interesting, not triaged"),
            }
        }

        if let Some(artifact) = events.artifact {
            let elapsed = self.elapsed(artifact.timestamp);
            summary.record_artifact(elapsed, &artifact.artifact_id);
            let triaged = self.triage.observe_artifact(elapsed, &artifact.artifact_id);
            if !triaged.is_empty() {
                summary.record_triaged(triaged);
                self.needs_dump = true;
            }
        }

        if let Some(hit) = events.beep_coord {
            let elapsed = self.elapsed(hit.timestamp);
            if summary.record_beep_coord(elapsed, &hit.coordinate) {
                info!(coordinate = %hit.coordinate, total = summary.ttl_beep_coord, "new sink coordinate hit");
            }
        }

        if events.exit {
            self.runs.end_run();
            summary.ttl_restart += 1;
            self.needs_dump = true;
            info!(
                ttl_round = self.runs.ttl_round(),
                restarts = summary.ttl_restart,
                "fuzzer run exited"
            );
        }

        if summary.check_fall_through() {
            warn!(
                restarts = summary.ttl_restart,
                "no cov/ft/round data at all after repeated restarts, the fuzzing setup is likely broken; falling through"
            );
        }
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        if !self.finished && self.lines_since_dump > 0 {
            self.flush_logged();
        }
    }
}
