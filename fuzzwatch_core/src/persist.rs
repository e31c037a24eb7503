use crate::summary::FuzzSummary;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Key under which the summary is stored in the output document.
pub const FUZZ_DATA_KEY: &str = "fuzz_data";

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("failed to write summary to {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write summary to {sink}: {source}")]
    Stream {
        sink: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize summary: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for summary dumps.
///
/// A dump always carries the complete summary, so calling `dump` again after
/// a failure or with unchanged state is harmless.
pub trait SummarySink: Send {
    fn name(&self) -> &'static str;

    fn dump(&mut self, summary: &FuzzSummary) -> Result<(), PersistError>;
}

fn render<T: Serialize>(value: &T, pretty: bool) -> Result<Vec<u8>, PersistError> {
    let mut bytes = if pretty {
        serde_json::to_vec_pretty(value)?
    } else {
        serde_json::to_vec(value)?
    };
    bytes.push(b'\n');
    Ok(bytes)
}

/// Writes the summary into a JSON file, under [`FUZZ_DATA_KEY`], keeping any
/// other top-level keys the file already had.
///
/// Each dump goes to a hidden temporary file next to the destination which is
/// then renamed over it, so readers never observe a half-written document.
#[derive(Debug)]
pub struct JsonFileSink {
    path: PathBuf,
    document: Map<String, Value>,
    pretty: bool,
}

impl JsonFileSink {
    /// Opens `path`, loading the existing document if there is one.
    ///
    /// A missing file starts an empty document. So does a file that is not a
    /// JSON object; that case is logged since its contents will be replaced.
    pub fn open(path: impl Into<PathBuf>, pretty: bool) -> Self {
        let path = path.into();
        let document = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Map::new(),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    warn!(?path, "existing output is not a JSON object, starting a new document");
                    Map::new()
                }
                Err(e) => {
                    warn!(?path, error = %e, "existing output is not valid JSON, starting a new document");
                    Map::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                warn!(?path, error = %e, "could not read existing output, starting a new document");
                Map::new()
            }
        };
        Self {
            path,
            document,
            pretty,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomically(&self, bytes: &[u8]) -> Result<(), PersistError> {
        let io_err = |source: io::Error| PersistError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".hidden.{file_name}."))
            .tempfile_in(dir)
            .map_err(io_err)?;
        tmp.write_all(bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

impl SummarySink for JsonFileSink {
    fn name(&self) -> &'static str {
        "json-file"
    }

    fn dump(&mut self, summary: &FuzzSummary) -> Result<(), PersistError> {
        self.document
            .insert(FUZZ_DATA_KEY.to_string(), serde_json::to_value(summary)?);
        let bytes = render(&self.document, self.pretty)?;
        self.write_atomically(&bytes)?;
        debug!(path = ?self.path, bytes = bytes.len(), "summary written");
        Ok(())
    }
}

/// Writes `{"fuzz_data": ...}` to a stream, one document per dump.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
    pretty: bool,
}

impl WriterSink<io::Stdout> {
    pub fn stdout(pretty: bool) -> Self {
        Self::new(io::stdout(), pretty)
    }
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W, pretty: bool) -> Self {
        Self { writer, pretty }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> SummarySink for WriterSink<W> {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn dump(&mut self, summary: &FuzzSummary) -> Result<(), PersistError> {
        let mut document = Map::new();
        document.insert(FUZZ_DATA_KEY.to_string(), serde_json::to_value(summary)?);
        let bytes = render(&document, self.pretty)?;
        let stream_err = |source: io::Error| PersistError::Stream {
            sink: "stream",
            source,
        };
        self.writer.write_all(&bytes).map_err(stream_err)?;
        self.writer.flush().map_err(stream_err)?;
        Ok(())
    }
}
