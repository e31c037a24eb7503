use std::io::{self, BufRead, Write};
use thiserror::Error;
use tracing::debug;

/// Errors produced while pulling lines off the raw input stream.
///
/// Only `Undecodable` is recoverable; the stream keeps going after it.
/// `Io` and `Tee` end the stream.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The raw line carried bytes but none of them formed valid UTF-8 text.
    #[error("line {line_no} could not be decoded as text ({len} raw bytes)")]
    Undecodable { line_no: u64, len: usize },

    /// Reading from the underlying input failed.
    #[error("failed to read input stream: {0}")]
    Io(#[source] io::Error),

    /// Writing the raw passthrough copy failed.
    #[error("failed to write tee output: {0}")]
    Tee(#[source] io::Error),
}

impl DecodeError {
    /// True when the tee destination went away (the reader on the other end of
    /// a pipe exited).
    pub fn is_tee_closed(&self) -> bool {
        matches!(self, DecodeError::Tee(e) if e.kind() == io::ErrorKind::BrokenPipe)
    }
}

/// One decoded line of fuzzer output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// 1-based position of the line in the input stream.
    pub number: u64,
    /// Decoded text with surrounding whitespace removed.
    pub text: String,
}

/// Splits a byte stream into newline-delimited text lines.
///
/// When a tee writer is configured, every raw line is written to it, byte for
/// byte, before the decoded line is handed back to the caller.
pub struct LineDecoder<R, W> {
    reader: R,
    tee: Option<W>,
    buf: Vec<u8>,
    line_no: u64,
    done: bool,
}

impl<R: BufRead> LineDecoder<R, io::Sink> {
    pub fn without_tee(reader: R) -> Self {
        LineDecoder::new(reader, None)
    }
}

impl<R: BufRead, W: Write> LineDecoder<R, W> {
    pub fn new(reader: R, tee: Option<W>) -> Self {
        Self {
            reader,
            tee,
            buf: Vec::with_capacity(512),
            line_no: 0,
            done: false,
        }
    }

    pub fn into_tee(self) -> Option<W> {
        self.tee
    }

    /// Reads the next raw line, tees it, and decodes it.
    ///
    /// Returns `None` once the input is exhausted or after a fatal error has
    /// been reported.
    pub fn next_line(&mut self) -> Option<Result<LogLine, DecodeError>> {
        if self.done {
            return None;
        }

        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                return None;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return self.next_line(),
            Err(e) => {
                self.done = true;
                return Some(Err(DecodeError::Io(e)));
            }
        }
        self.line_no += 1;

        if let Some(tee) = self.tee.as_mut() {
            if let Err(e) = tee.write_all(&self.buf).and_then(|_| tee.flush()) {
                self.done = true;
                return Some(Err(DecodeError::Tee(e)));
            }
        }

        match decode_ignoring_invalid(&self.buf) {
            Some(text) => Some(Ok(LogLine {
                number: self.line_no,
                text: text.trim().to_string(),
            })),
            None => Some(Err(DecodeError::Undecodable {
                line_no: self.line_no,
                len: self.buf.len(),
            })),
        }
    }
}

impl<R: BufRead, W: Write> Iterator for LineDecoder<R, W> {
    type Item = Result<LogLine, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line()
    }
}

/// Decodes `raw` as UTF-8, dropping any invalid byte sequences.
///
/// Returns `None` only when `raw` contains invalid bytes and not a single
/// valid character survives.
pub fn decode_ignoring_invalid(raw: &[u8]) -> Option<String> {
    let mut text = String::with_capacity(raw.len());
    let mut dropped = 0usize;
    for chunk in raw.utf8_chunks() {
        text.push_str(chunk.valid());
        dropped += chunk.invalid().len();
    }

    if dropped == 0 {
        return Some(text);
    }
    if text.trim().is_empty() {
        return None;
    }
    debug!(dropped, "dropped invalid UTF-8 bytes from line");
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn splits_lines_and_trims_whitespace() {
        let input = b"  first line \nsecond\r\nthird";
        let lines: Vec<LogLine> = LineDecoder::without_tee(Cursor::new(&input[..]))
            .map(|l| l.unwrap())
            .collect();

        assert_eq!(lines.len(), 3, "trailing line without newline must be kept");
        assert_eq!(lines[0].text, "first line");
        assert_eq!(lines[1].text, "second");
        assert_eq!(lines[2].text, "third");
        assert_eq!(lines[2].number, 3);
    }

    #[test]
    fn tee_receives_exact_raw_bytes_in_order() {
        let input: Vec<u8> = b"alpha\n\xff\xfe\nbeta \xc3\x28 gamma\n  delta  \n".to_vec();
        let mut decoder = LineDecoder::new(Cursor::new(input.clone()), Some(Vec::new()));
        let mut results = Vec::new();
        for item in decoder.by_ref() {
            results.push(item);
        }

        assert_eq!(results.len(), 4);
        assert!(
            matches!(results[1], Err(DecodeError::Undecodable { line_no: 2, .. })),
            "a line made only of invalid bytes should be reported as undecodable"
        );
        assert_eq!(
            decoder.into_tee().unwrap(),
            input,
            "tee output must equal the input verbatim, including undecodable lines"
        );
    }

    #[test]
    fn invalid_bytes_are_dropped_not_replaced() {
        let decoded = decode_ignoring_invalid(b"beta \xc3\x28 gamma").unwrap();
        assert_eq!(decoded, "beta ( gamma");
        assert!(!decoded.contains('\u{fffd}'));
    }

    #[test]
    fn empty_line_is_not_a_decode_error() {
        let lines: Vec<_> = LineDecoder::without_tee(Cursor::new(&b"\n\n"[..])).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| matches!(l, Ok(line) if line.text.is_empty())));
    }

    struct FailingReader;

    impl io::Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("device gone"))
        }
    }

    #[test]
    fn read_failure_ends_the_stream() {
        let mut decoder = LineDecoder::without_tee(io::BufReader::new(FailingReader));
        assert!(matches!(decoder.next_line(), Some(Err(DecodeError::Io(_)))));
        assert!(decoder.next_line().is_none(), "no lines after a fatal read error");
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn broken_tee_pipe_is_reported_as_closed() {
        let mut decoder = LineDecoder::new(Cursor::new(&b"line\n"[..]), Some(ClosedPipe));
        match decoder.next_line() {
            Some(Err(e)) => assert!(e.is_tee_closed(), "expected tee-closed, got {e}"),
            other => panic!("expected tee error, got {other:?}"),
        }
    }
}
