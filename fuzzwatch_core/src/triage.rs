use crate::sanitizer::SanitizerClass;
use serde::ser::{Serialize, SerializeTuple, Serializer};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

/// A classified crash report still waiting for its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCrash {
    pub elapsed_time: Option<i64>,
    pub raw_text: String,
    pub class: SanitizerClass,
}

/// A crash that was matched to an artifact and survived deduplication.
///
/// Serialized as `[elapsed_time, sanitizer_class, raw_text, artifact_id]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriagedCrash {
    pub elapsed_time: Option<i64>,
    pub sanitizer_class: SanitizerClass,
    pub raw_text: String,
    pub artifact_id: String,
}

impl Serialize for TriagedCrash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(4)?;
        tuple.serialize_element(&self.elapsed_time)?;
        tuple.serialize_element(&self.sanitizer_class)?;
        tuple.serialize_element(&self.raw_text)?;
        tuple.serialize_element(&self.artifact_id)?;
        tuple.end()
    }
}

/// A pending crash may be matched to an artifact written at or after it.
/// A missing timestamp on either side always counts as eligible.
pub fn is_eligible(artifact_time: Option<i64>, crash_time: Option<i64>) -> bool {
    match (artifact_time, crash_time) {
        (Some(artifact), Some(crash)) => artifact >= crash,
        _ => true,
    }
}

/// Correlates crash reports with the artifacts written for them and keeps at
/// most one triaged crash per sanitizer class (sink points excepted).
#[derive(Debug, Default)]
pub struct CrashTriage {
    pending: VecDeque<PendingCrash>,
    seen: HashSet<SanitizerClass>,
}

impl CrashTriage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a classified crash for correlation.
    pub fn report_crash(&mut self, crash: PendingCrash) {
        debug!(
            class = %crash.class,
            elapsed = ?crash.elapsed_time,
            queued = self.pending.len() + 1,
            "crash queued for triage"
        );
        self.pending.push_back(crash);
    }

    /// Matches an artifact against the pending queue in arrival order.
    ///
    /// Every eligible pending crash is consumed. It yields a [`TriagedCrash`]
    /// only if its class has not been triaged before or is exempt from
    /// deduplication. Ineligible crashes stay queued for later artifacts.
    pub fn observe_artifact(
        &mut self,
        artifact_time: Option<i64>,
        artifact_id: &str,
    ) -> Vec<TriagedCrash> {
        let mut triaged = Vec::new();
        let seen = &mut self.seen;

        self.pending.retain(|crash| {
            if !is_eligible(artifact_time, crash.elapsed_time) {
                return true;
            }
            if crash.class.is_dedup_exempt() || seen.insert(crash.class) {
                info!(
                    class = %crash.class,
                    artifact = artifact_id,
                    elapsed = ?crash.elapsed_time,
                    "new triaged crash"
                );
                triaged.push(TriagedCrash {
                    elapsed_time: crash.elapsed_time,
                    sanitizer_class: crash.class,
                    raw_text: crash.raw_text.clone(),
                    artifact_id: artifact_id.to_string(),
                });
            } else {
                debug!(class = %crash.class, artifact = artifact_id, "duplicate crash class discarded");
            }
            false
        });

        triaged
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_seen(&self, class: &SanitizerClass) -> bool {
        self.seen.contains(class)
    }
}
