use serde::{Serialize, Serializer};
use std::fmt;

/// Known vulnerability-class labels, in matching priority order.
pub const SANITIZER_CATALOG: &[&str] = &[
    "FuzzerSecurityIssueCritical: OS Command Injection",
    "FuzzerSecurityIssueCritical: Integer Overflow",
    "FuzzerSecurityIssueMedium: Server Side Request Forgery (SSRF)",
    "FuzzerSecurityIssueHigh: Remote Code Execution",
    "FuzzerSecurityIssueHigh: SQL Injection",
    "FuzzerSecurityIssueCritical: Remote JNDI Lookup",
    "FuzzerSecurityIssueCritical: LDAP Injection",
    "FuzzerSecurityIssueHigh: XPath Injection",
    "FuzzerSecurityIssueHigh: load arbitrary library",
    "FuzzerSecurityIssueLow: Regular Expression Injection",
    "FuzzerSecurityIssueCritical: Script Engine Injection",
    "FuzzerSecurityIssueCritical: File read/write hook path",
];

pub const UNKNOWN_SANITIZER: &str = "UNKNOWN SANITIZER";
pub const SINKPOINT: &str = "SINKPOINT";

/// Printed by the instrumented target when a watched sink is reached.
pub const SINK_HIT_MARKER: &str = "BEEP BEEP, sink point";

/// Package marker present in crashes raised by the managed sanitizer layer.
pub const MANAGED_SANITIZER_MARKER: &str = "code_intelligence";

/// Setting this variable to any non-empty value enables sink mode.
pub const SINK_MODE_ENV: &str = "JAZZER_SINK_MODE";

const STACK_OVERFLOW_MARKER: &str = "Stack overflow (use ";
const OUT_OF_MEMORY_MARKER: &str = "Out of memory";

/// Vulnerability class assigned to an interesting crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SanitizerClass {
    /// An entry of [`SANITIZER_CATALOG`].
    Catalog(&'static str),
    /// Interesting crash that matched no catalog entry.
    Unknown,
    /// Direct sink hit reported in sink mode. Never deduplicated.
    SinkPoint,
}

impl SanitizerClass {
    pub fn label(&self) -> &'static str {
        match self {
            SanitizerClass::Catalog(label) => *label,
            SanitizerClass::Unknown => UNKNOWN_SANITIZER,
            SanitizerClass::SinkPoint => SINKPOINT,
        }
    }

    /// Classes exempt from the one-triage-per-class rule.
    pub fn is_dedup_exempt(&self) -> bool {
        matches!(self, SanitizerClass::SinkPoint)
    }
}

impl fmt::Display for SanitizerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for SanitizerClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// A crash is interesting when it comes from the managed sanitizer layer and
/// is neither a stack overflow nor an out-of-memory condition.
///
/// The sanitizer marker is looked up in the second `:`-delimited field only;
/// text without such a field is never interesting.
pub fn is_interesting_crash(crash: &str) -> bool {
    let from_managed_sanitizer = crash
        .split(':')
        .nth(1)
        .is_some_and(|field| field.contains(MANAGED_SANITIZER_MARKER));

    from_managed_sanitizer
        && !crash.contains(STACK_OVERFLOW_MARKER)
        && !crash.contains(OUT_OF_MEMORY_MARKER)
}

/// Finds the catalog label for `crash`.
///
/// Verbatim matches win over the space-insensitive pass, which exists for
/// older banners that printed labels without spaces.
pub fn match_catalog(crash: &str) -> Option<&'static str> {
    if let Some(label) = SANITIZER_CATALOG
        .iter()
        .copied()
        .find(|label| crash.contains(label))
    {
        return Some(label);
    }

    let squashed = strip_spaces(crash);
    SANITIZER_CATALOG
        .iter()
        .find(|label| squashed.contains(&strip_spaces(label)))
        .copied()
}

fn strip_spaces(text: &str) -> String {
    text.chars().filter(|c| *c != ' ').collect()
}

/// Maps crash text to a [`SanitizerClass`].
///
/// The classifier is a pure function of its sink-mode setting and the crash
/// text, so repeated calls always agree.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrashClassifier {
    sink_mode: bool,
}

impl CrashClassifier {
    pub fn new(sink_mode: bool) -> Self {
        Self { sink_mode }
    }

    pub fn is_sink_hit(&self, crash: &str) -> bool {
        self.sink_mode && crash.contains(SINK_HIT_MARKER)
    }

    /// Returns `None` for crashes that are not worth triaging.
    pub fn classify(&self, crash: &str) -> Option<SanitizerClass> {
        if self.is_sink_hit(crash) {
            return Some(SanitizerClass::SinkPoint);
        }
        if !is_interesting_crash(crash) {
            return None;
        }
        Some(match_catalog(crash).map_or(SanitizerClass::Unknown, SanitizerClass::Catalog))
    }
}
