use crate::triage::TriagedCrash;
use serde::Serialize;
use std::collections::HashSet;

/// Restarts without any coverage, feature or round data after which the
/// fuzzing setup is considered broken.
pub const FALL_THROUGH_THRESHOLD: u64 = 66;

/// Aggregate view of one fuzzer log stream.
///
/// Field names are the keys of the persisted `fuzz_data` document. Pairs and
/// triaged crashes serialize as JSON arrays; unknown elapsed times are `null`.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FuzzSummary {
    pub cov_over_time: Vec<(Option<i64>, u64)>,
    pub ft_over_time: Vec<(Option<i64>, u64)>,
    /// Resident set size in bytes.
    pub rss_over_time: Vec<(Option<i64>, u64)>,
    pub log_crash_over_time: Vec<(Option<i64>, String)>,
    pub artifact_over_time: Vec<(Option<i64>, String)>,
    pub log_triage_crash_over_time: Vec<TriagedCrash>,
    pub beep_coord_over_time: Vec<(Option<i64>, String)>,
    pub ttl_round: u64,
    pub last_cov: u64,
    pub last_ft: u64,
    pub last_rss: u64,
    pub max_cov: u64,
    pub max_ft: u64,
    pub max_rss: u64,
    /// Number of distinct sink coordinates hit so far.
    pub ttl_beep_coord: u64,
    /// Number of engine exits observed so far.
    pub ttl_restart: u64,
    /// Set once the engine keeps restarting without producing any data.
    pub do_fall_through: bool,
    #[serde(skip)]
    seen_beep_coords: HashSet<String>,
}

impl FuzzSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_coverage(&mut self, elapsed_time: Option<i64>, cov: u64, ft: u64, rss: u64) {
        self.cov_over_time.push((elapsed_time, cov));
        self.ft_over_time.push((elapsed_time, ft));
        self.rss_over_time.push((elapsed_time, rss));
        self.last_cov = cov;
        self.last_ft = ft;
        self.last_rss = rss;
        self.max_cov = self.max_cov.max(cov);
        self.max_ft = self.max_ft.max(ft);
        self.max_rss = self.max_rss.max(rss);
    }

    pub fn record_crash(&mut self, elapsed_time: Option<i64>, raw_text: &str) {
        self.log_crash_over_time.push((elapsed_time, raw_text.to_string()));
    }

    pub fn record_artifact(&mut self, elapsed_time: Option<i64>, artifact_id: &str) {
        self.artifact_over_time
            .push((elapsed_time, artifact_id.to_string()));
    }

    pub fn record_triaged(&mut self, crashes: impl IntoIterator<Item = TriagedCrash>) {
        self.log_triage_crash_over_time.extend(crashes);
    }

    /// Every hit is logged; `ttl_beep_coord` counts distinct coordinates.
    /// Returns `true` for a coordinate not seen before.
    pub fn record_beep_coord(&mut self, elapsed_time: Option<i64>, coordinate: &str) -> bool {
        self.beep_coord_over_time
            .push((elapsed_time, coordinate.to_string()));
        let is_new = self.seen_beep_coords.insert(coordinate.to_string());
        self.ttl_beep_coord = self.seen_beep_coords.len() as u64;
        is_new
    }

    /// Raises `do_fall_through` when more than [`FALL_THROUGH_THRESHOLD`]
    /// restarts have passed without a single coverage, feature or round.
    /// Returns `true` only on the call that raises it.
    pub fn check_fall_through(&mut self) -> bool {
        if self.do_fall_through
            || self.ttl_restart <= FALL_THROUGH_THRESHOLD
            || self.max_cov != 0
            || self.max_ft != 0
            || self.ttl_round != 0
        {
            return false;
        }
        self.do_fall_through = true;
        true
    }
}

/// Turns per-run round numbers into a round count that keeps growing across
/// engine restarts within one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounter {
    ttl_round: u64,
    ttl_round_base: u64,
}

impl RunCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest local round number and returns the global count.
    pub fn observe_round(&mut self, local_round: u64) -> u64 {
        self.ttl_round = self.ttl_round_base.saturating_add(local_round);
        self.ttl_round
    }

    /// Closes the current run segment; later rounds count on top of it.
    pub fn end_run(&mut self) {
        self.ttl_round_base = self.ttl_round;
    }

    pub fn ttl_round(&self) -> u64 {
        self.ttl_round
    }

    pub fn base(&self) -> u64 {
        self.ttl_round_base
    }
}
