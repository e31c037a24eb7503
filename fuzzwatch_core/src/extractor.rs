use regex::{Captures, Regex};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Banner the JVM prints when the fuzzing engine boots.
pub const RUN_START_BANNER: &str = "OpenJDK 64-Bit Server VM warning: Option CriticalJNINatives was deprecated in version 16.0 and will likely be removed in a future release.";

/// Marker the engine wrapper prints when one fuzzing process exits.
pub const EXIT_MARKER: &str = "@@@@@ exit code of Jazzer";

/// Unix time attached to a line by the current wire format.
pub type Timestamp = i64;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("invalid {label} pattern: {source}")]
    Pattern {
        label: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("{variant} line matched without a `{field}` field")]
    MissingField {
        variant: &'static str,
        field: &'static str,
    },
    #[error("{variant} line has a malformed `{field}` value {value:?}")]
    Number {
        variant: &'static str,
        field: &'static str,
        value: String,
    },
}

const COVERAGE_FORMATS: &[(&str, &str)] = &[
    (
        "coverage",
        r"^(?P<ts>\d+)\s#(?P<round>\d+).*cov: (?P<cov>\d+) ft: (?P<ft>\d+)(?:.*rss: (?P<rss>\w+))?",
    ),
    (
        "legacy coverage",
        r"^#(?P<round>\d+).*cov: (?P<cov>\d+) ft: (?P<ft>\d+)(?:.*rss: (?P<rss>\w+))?",
    ),
];

const CRASH_FORMATS: &[(&str, &str)] = &[
    ("crash", r"^(?P<ts>\d+)\s(?P<text>== Java Exception:.*)"),
    (
        "native crash",
        r"^(?P<ts>\d+)\s==\d+==(?P<text>ERROR: AddressSanitizer:.*)",
    ),
    ("legacy crash", r"^(?P<text>== Java Exception:.*)"),
    (
        "legacy native crash",
        r"^==\d+==(?P<text>ERROR: AddressSanitizer:.*)",
    ),
];

const ARTIFACT_FORMATS: &[(&str, &str)] = &[
    (
        "artifact",
        r"^(?P<ts>\d+)\sartifact_prefix=.*; Test unit written to .*/artifacts/(?P<id>crash-[a-z0-9]+)",
    ),
    (
        "legacy artifact",
        r"^artifact_prefix=.*; Test unit written to .*/artifacts/(?P<id>crash-[a-z0-9]+)",
    ),
];

const BEEP_COORD_FORMATS: &[(&str, &str)] = &[
    (
        "beep coordinate",
        r"^(?P<ts>\d+)\sINFO: BEEP COORDINATE HIT @ (?P<coord>.*)",
    ),
    (
        "legacy beep coordinate",
        r"^INFO: BEEP COORDINATE HIT @ (?P<coord>.*)",
    ),
];

const MEMORY_UNITS: &[(&str, u64)] = &[
    ("b", 1),
    ("kb", 1 << 10),
    ("mb", 1 << 20),
    ("gb", 1 << 30),
    ("tb", 1 << 40),
    ("pb", 1 << 50),
];

const HEX_ADDRESS: &str = r"\b0x[0-9a-fA-F]+\b";

/// The engine (re)started. The first timestamped one fixes the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStart {
    pub timestamp: Option<Timestamp>,
}

/// A periodic coverage status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageLine {
    pub timestamp: Option<Timestamp>,
    /// Round number local to the current run segment.
    pub round: u64,
    pub cov: u64,
    pub ft: u64,
    /// Resident set size in bytes; `0` when absent or in an unknown unit.
    pub rss: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashLine {
    pub timestamp: Option<Timestamp>,
    pub text: String,
}

/// The engine wrote a crash-reproducing input to `artifacts/<artifact_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLine {
    pub timestamp: Option<Timestamp>,
    pub artifact_id: String,
}

/// The instrumented target reported reaching a watched sink coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeepCoordLine {
    pub timestamp: Option<Timestamp>,
    pub coordinate: String,
}

/// Everything recognized on a single line.
///
/// Extractors run independently, so in principle several fields can be set
/// for the same line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineEvents {
    pub run_start: Option<RunStart>,
    pub coverage: Option<CoverageLine>,
    pub crash: Option<CrashLine>,
    pub artifact: Option<ArtifactLine>,
    pub beep_coord: Option<BeepCoordLine>,
    pub exit: bool,
}

impl LineEvents {
    pub fn is_empty(&self) -> bool {
        self.run_start.is_none()
            && self.coverage.is_none()
            && self.crash.is_none()
            && self.artifact.is_none()
            && self.beep_coord.is_none()
            && !self.exit
    }
}

/// One wire-format variant of an event kind. Variants of the same kind are
/// tried in table order, timestamped formats first.
#[derive(Debug)]
struct FormatVariant {
    label: &'static str,
    pattern: Regex,
}

impl FormatVariant {
    fn compile(label: &'static str, pattern: &str) -> Result<Self, ExtractorError> {
        let pattern =
            Regex::new(pattern).map_err(|source| ExtractorError::Pattern { label, source })?;
        Ok(Self { label, pattern })
    }

    fn compile_all(table: &[(&'static str, &str)]) -> Result<Vec<Self>, ExtractorError> {
        table
            .iter()
            .map(|&(label, pattern)| Self::compile(label, pattern))
            .collect()
    }

    /// A timestamp that does not fit is treated as absent so the rest of the
    /// line still counts.
    fn timestamp(&self, caps: &Captures<'_>) -> Option<Timestamp> {
        let value = caps.name("ts")?.as_str();
        match value.parse() {
            Ok(ts) => Some(ts),
            Err(_) => {
                warn!(variant = self.label, value, "timestamp out of range, treating as absent");
                None
            }
        }
    }

    fn field<'l>(&self, caps: &Captures<'l>, field: &'static str) -> Result<&'l str, ExtractorError> {
        caps.name(field)
            .map(|m| m.as_str())
            .ok_or(ExtractorError::MissingField {
                variant: self.label,
                field,
            })
    }

    fn number<T: FromStr>(&self, caps: &Captures<'_>, field: &'static str) -> Result<T, ExtractorError> {
        self.parse_number(field, self.field(caps, field)?)
    }

    fn parse_number<T: FromStr>(&self, field: &'static str, value: &str) -> Result<T, ExtractorError> {
        value.parse().map_err(|_| ExtractorError::Number {
            variant: self.label,
            field,
            value: value.to_string(),
        })
    }
}

/// Converts a libFuzzer memory figure such as `512Mb` to bytes.
///
/// Unknown units and unparsable numbers yield `0`.
pub fn parse_memory_bytes(memory: &str) -> u64 {
    let memory = memory.trim().to_ascii_lowercase();
    let split = memory
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(memory.len());
    let (number, unit) = memory.split_at(split);
    let Some(&(_, scale)) = MEMORY_UNITS.iter().find(|(name, _)| *name == unit.trim()) else {
        return 0;
    };
    match number.parse::<f64>() {
        Ok(value) => (value * scale as f64) as u64,
        Err(_) => 0,
    }
}

fn first_match<'v, 'l>(
    variants: &'v [FormatVariant],
    line: &'l str,
) -> Option<(&'v FormatVariant, Captures<'l>)> {
    variants
        .iter()
        .find_map(|variant| variant.pattern.captures(line).map(|caps| (variant, caps)))
}

/// The fixed set of line matchers, compiled once per stream.
#[derive(Debug)]
pub struct EventExtractors {
    run_start: Vec<FormatVariant>,
    coverage: Vec<FormatVariant>,
    crash: Vec<FormatVariant>,
    artifact: Vec<FormatVariant>,
    beep_coord: Vec<FormatVariant>,
    hex_address: Regex,
}

impl EventExtractors {
    pub fn new() -> Result<Self, ExtractorError> {
        let banner = regex::escape(RUN_START_BANNER);
        let run_start = vec![
            FormatVariant::compile("run start", &format!(r"^(?P<ts>\d+)\s{banner}"))?,
            FormatVariant::compile("legacy run start", &format!("^{banner}"))?,
        ];

        Ok(Self {
            run_start,
            coverage: FormatVariant::compile_all(COVERAGE_FORMATS)?,
            crash: FormatVariant::compile_all(CRASH_FORMATS)?,
            artifact: FormatVariant::compile_all(ARTIFACT_FORMATS)?,
            beep_coord: FormatVariant::compile_all(BEEP_COORD_FORMATS)?,
            hex_address: Regex::new(HEX_ADDRESS).map_err(|source| ExtractorError::Pattern {
                label: "hex address",
                source,
            })?,
        })
    }

    /// Runs every extractor against `line`.
    pub fn extract(&self, line: &str) -> Result<LineEvents, ExtractorError> {
        Ok(LineEvents {
            run_start: self.run_start(line)?,
            coverage: self.coverage(line)?,
            crash: self.crash(line)?,
            artifact: self.artifact(line)?,
            beep_coord: self.beep_coord(line)?,
            exit: self.is_exit(line),
        })
    }

    pub fn run_start(&self, line: &str) -> Result<Option<RunStart>, ExtractorError> {
        let Some((variant, caps)) = first_match(&self.run_start, line) else {
            return Ok(None);
        };
        Ok(Some(RunStart {
            timestamp: variant.timestamp(&caps),
        }))
    }

    pub fn coverage(&self, line: &str) -> Result<Option<CoverageLine>, ExtractorError> {
        let Some((variant, caps)) = first_match(&self.coverage, line) else {
            return Ok(None);
        };
        Ok(Some(CoverageLine {
            timestamp: variant.timestamp(&caps),
            round: variant.number(&caps, "round")?,
            cov: variant.number(&caps, "cov")?,
            ft: variant.number(&caps, "ft")?,
            rss: caps.name("rss").map_or(0, |m| parse_memory_bytes(m.as_str())),
        }))
    }

    /// Native sanitizer banners have their hex addresses replaced with
    /// `<ADDR>` so repeated reports of the same bug compare equal.
    pub fn crash(&self, line: &str) -> Result<Option<CrashLine>, ExtractorError> {
        let Some((variant, caps)) = first_match(&self.crash, line) else {
            return Ok(None);
        };
        let text = variant.field(&caps, "text")?;
        let text = if variant.label.contains("native") {
            self.hex_address.replace_all(text, "<ADDR>").trim().to_string()
        } else {
            text.to_string()
        };
        Ok(Some(CrashLine {
            timestamp: variant.timestamp(&caps),
            text,
        }))
    }

    pub fn artifact(&self, line: &str) -> Result<Option<ArtifactLine>, ExtractorError> {
        let Some((variant, caps)) = first_match(&self.artifact, line) else {
            return Ok(None);
        };
        Ok(Some(ArtifactLine {
            timestamp: variant.timestamp(&caps),
            artifact_id: variant.field(&caps, "id")?.to_string(),
        }))
    }

    pub fn beep_coord(&self, line: &str) -> Result<Option<BeepCoordLine>, ExtractorError> {
        let Some((variant, caps)) = first_match(&self.beep_coord, line) else {
            return Ok(None);
        };
        Ok(Some(BeepCoordLine {
            timestamp: variant.timestamp(&caps),
            coordinate: variant.field(&caps, "coord")?.to_string(),
        }))
    }

    pub fn is_exit(&self, line: &str) -> bool {
        line.contains(EXIT_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractors() -> EventExtractors {
        EventExtractors::new().expect("built-in patterns must compile")
    }

    #[test]
    fn run_start_current_and_legacy() {
        let ex = extractors();
        let current = ex.run_start(&format!("1000 {RUN_START_BANNER}")).unwrap();
        assert_eq!(current, Some(RunStart { timestamp: Some(1000) }));

        let legacy = ex.run_start(RUN_START_BANNER).unwrap();
        assert_eq!(legacy, Some(RunStart { timestamp: None }));

        assert_eq!(ex.run_start("1000 OpenJDK 64-Bit Server VM").unwrap(), None);
    }

    #[test]
    fn coverage_accepts_trailing_text_in_both_formats() {
        let ex = extractors();
        let current = ex
            .coverage("1010 #5\tNEW    cov: 100 ft: 50 corp: 3/9b exec/s: 0 rss: 512Mb L: 2/4")
            .unwrap()
            .expect("timestamped coverage line should match");
        assert_eq!(
            current,
            CoverageLine {
                timestamp: Some(1010),
                round: 5,
                cov: 100,
                ft: 50,
                rss: 512 << 20,
            }
        );

        let legacy = ex
            .coverage("#1024\tpulse  cov: 7 ft: 9 corp: 1/1b")
            .unwrap()
            .expect("legacy coverage line should match");
        assert_eq!(legacy.timestamp, None);
        assert_eq!((legacy.round, legacy.cov, legacy.ft), (1024, 7, 9));
        assert_eq!(legacy.rss, 0, "no rss field means zero");
    }

    #[test]
    fn legacy_coverage_reads_rss() {
        let ex = extractors();
        let sample = ex
            .coverage("#2048\tREDUCE cov: 8 ft: 12 corp: 4/20b lim: 4 exec/s: 1024 rss: 2Gb")
            .unwrap()
            .unwrap();
        assert_eq!(sample.rss, 2u64 << 30);
    }

    #[test]
    fn memory_units_convert_to_bytes() {
        assert_eq!(parse_memory_bytes("512Mb"), 512 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("3kb"), 3072);
        assert_eq!(parse_memory_bytes("1.5KB"), 1536);
        assert_eq!(parse_memory_bytes("42b"), 42);
        assert_eq!(parse_memory_bytes("7Zb"), 0, "unknown unit");
        assert_eq!(parse_memory_bytes("Mb"), 0, "missing number");
    }

    #[test]
    fn beep_coordinate_current_and_legacy() {
        let ex = extractors();
        let current = ex
            .beep_coord("1030 INFO: BEEP COORDINATE HIT @ com/example/Sink.run:42")
            .unwrap();
        assert_eq!(
            current,
            Some(BeepCoordLine {
                timestamp: Some(1030),
                coordinate: "com/example/Sink.run:42".to_string()
            })
        );

        let legacy = ex
            .beep_coord("INFO: BEEP COORDINATE HIT @ com/example/Sink.run:42")
            .unwrap()
            .unwrap();
        assert_eq!(legacy.timestamp, None);
        assert_eq!(legacy.coordinate, "com/example/Sink.run:42");
        assert_eq!(ex.beep_coord("INFO: BEEP BEEP").unwrap(), None);
    }

    #[test]
    fn overflowing_timestamp_is_treated_as_absent() {
        let ex = extractors();
        let text = "== Java Exception: com.code_intelligence.jazzer.api.FuzzerSecurityIssueHigh: SQL Injection";
        let crash = ex
            .crash(&format!("99999999999999999999 {text}"))
            .expect("an oversized timestamp must not reject the line")
            .expect("crash line should still match");
        assert_eq!(crash.timestamp, None);
        assert_eq!(crash.text, text);
    }

    #[test]
    fn coverage_without_cov_field_is_not_a_sample() {
        let ex = extractors();
        assert_eq!(ex.coverage("1010 #5 INITED ft: 50 corp: 1").unwrap(), None);
        assert_eq!(ex.coverage("INFO: seed corpus: files: 3").unwrap(), None);
    }

    #[test]
    fn oversized_round_number_is_an_error() {
        let ex = extractors();
        let err = ex
            .coverage("#99999999999999999999999 cov: 1 ft: 1")
            .expect_err("round does not fit in u64");
        assert!(matches!(err, ExtractorError::Number { field: "round", .. }));
    }

    #[test]
    fn crash_current_and_legacy() {
        let ex = extractors();
        let text = "== Java Exception: com.code_intelligence.jazzer.api.FuzzerSecurityIssueHigh: SQL Injection";
        let current = ex.crash(&format!("1015 {text}")).unwrap().unwrap();
        assert_eq!(current.timestamp, Some(1015));
        assert_eq!(current.text, text);

        let legacy = ex.crash(text).unwrap().unwrap();
        assert_eq!(legacy.timestamp, None);
        assert_eq!(legacy.text, text);
    }

    #[test]
    fn native_crash_addresses_are_normalized() {
        let ex = extractors();
        let line = "1020 ==4242==ERROR: AddressSanitizer: heap-use-after-free on address 0x602000000010 at pc 0x7f3a2b1c";
        let crash = ex.crash(line).unwrap().unwrap();
        assert_eq!(crash.timestamp, Some(1020));
        assert_eq!(
            crash.text,
            "ERROR: AddressSanitizer: heap-use-after-free on address <ADDR> at pc <ADDR>"
        );
    }

    #[test]
    fn artifact_current_and_legacy() {
        let ex = extractors();
        let current = ex
            .artifact("1020 artifact_prefix='/out/artifacts/'; Test unit written to /out/artifacts/crash-abc123")
            .unwrap()
            .unwrap();
        assert_eq!(
            current,
            ArtifactLine {
                timestamp: Some(1020),
                artifact_id: "crash-abc123".to_string()
            }
        );

        let legacy = ex
            .artifact("artifact_prefix='./'; Test unit written to ./fuzz/artifacts/crash-0f9e")
            .unwrap()
            .unwrap();
        assert_eq!(legacy.timestamp, None);
        assert_eq!(legacy.artifact_id, "crash-0f9e");
    }

    #[test]
    fn timeout_artifacts_are_not_crash_artifacts() {
        let ex = extractors();
        let line = "artifact_prefix='./'; Test unit written to ./artifacts/timeout-0f9e";
        assert_eq!(ex.artifact(line).unwrap(), None);
    }

    #[test]
    fn exit_marker_matches_anywhere_in_line() {
        let ex = extractors();
        assert!(ex.is_exit("1100 @@@@@ exit code of Jazzer: 77"));
        assert!(!ex.is_exit("exit code of Jazzer"));
    }

    #[test]
    fn extract_runs_every_matcher() {
        let ex = extractors();
        let events = ex.extract("2000 #3 REDUCE cov: 4 ft: 5").unwrap();
        assert!(events.coverage.is_some());
        assert!(events.crash.is_none() && events.artifact.is_none() && !events.exit);

        assert!(ex.extract("INFO: Loaded 1 modules").unwrap().is_empty());
    }
}
