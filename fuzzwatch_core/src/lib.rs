pub mod config;
pub mod decoder;
pub mod extractor;
pub mod persist;
pub mod processor;
pub mod sanitizer;
pub mod summary;
pub mod triage;

pub use config::FuzzwatchConfig;
pub use decoder::{DecodeError, LineDecoder, LogLine};
pub use extractor::{EventExtractors, ExtractorError, LineEvents};
pub use persist::{JsonFileSink, PersistError, SummarySink, WriterSink};
pub use processor::{FlushHandle, ProcessError, ProcessorOptions, StreamEnd, StreamProcessor};
pub use sanitizer::{CrashClassifier, SanitizerClass};
pub use summary::{FuzzSummary, RunCounter};
pub use triage::{CrashTriage, PendingCrash, TriagedCrash};
