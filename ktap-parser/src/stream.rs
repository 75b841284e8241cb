// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing KTAP from a byte source on a background thread.
//!
//! [`StreamParser`] is the synchronous core: it turns chunks read from a source into lines,
//! optionally strips kmsg record headers, and drives a [`KtapParser`]. [`KtapStream`] runs a
//! `StreamParser` on a dedicated thread and publishes results through [`SharedResults`] as they
//! are parsed.

use crate::{
    errors::{KtapParseError, KtapStreamError},
    kmsg::KmsgDecoder,
    line_buffer::LineBuffer,
    parser::{KtapParser, ParseStatus, ParserOptions},
    result::KtapResult,
    sink::{ResultSink, SharedResults},
};
use serde::Deserialize;
use std::{
    any::Any,
    io::{self, Read},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, warn};

/// The default size of a single read from the source.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// How long the worker waits before retrying a source that has no data available.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The framing of lines in the source.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamSource {
    /// Records read from `/dev/kmsg`, with a `PRIORITY,SEQUENCE,TIMESTAMP,FLAGS;` header before
    /// each message.
    #[default]
    Kmsg,

    /// Plain lines of text.
    Plain,
}

/// Drives a [`KtapParser`] from raw chunks of a source.
#[derive(Debug)]
pub struct StreamParser<S = Vec<KtapResult>> {
    lines: LineBuffer,
    decoder: Option<KmsgDecoder>,
    parser: KtapParser<S>,
    error: Option<KtapParseError>,
}

impl<S: ResultSink> StreamParser<S> {
    /// Creates a new stream parser.
    pub fn new(source: StreamSource, options: ParserOptions, sink: S) -> Self {
        let decoder = match source {
            StreamSource::Kmsg => Some(KmsgDecoder::new()),
            StreamSource::Plain => None,
        };
        Self {
            lines: LineBuffer::with_max_line_len(options.max_line_len),
            decoder,
            parser: KtapParser::with_options(sink, options),
            error: None,
        }
    }

    /// Processes a chunk of bytes read from the source.
    ///
    /// Returns [`ParseStatus::MissingCount`] if any plan line in the chunk had an unknown count
    /// and the report isn't done yet.
    pub fn process(&mut self, chunk: &[u8]) -> Result<ParseStatus, KtapParseError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        self.lines.feed(chunk);
        let mut missing_count = false;
        while let Some(line) = self.lines.next_line() {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    let error = KtapParseError::LineTooLong {
                        line_number: self.parser.line_number() + 1,
                        max_len: error.max_len(),
                    };
                    self.error = Some(error.clone());
                    return Err(error);
                }
            };

            let line = String::from_utf8_lossy(&line);
            let message = match &mut self.decoder {
                Some(decoder) => match decoder.decode(&line) {
                    Some(message) => message,
                    None => continue,
                },
                None => &*line,
            };

            match self.parser.parse_line(message)? {
                ParseStatus::InProgress => {}
                ParseStatus::MissingCount => missing_count = true,
                ParseStatus::Done => return Ok(ParseStatus::Done),
            }
        }

        Ok(if self.parser.is_done() {
            ParseStatus::Done
        } else if missing_count {
            ParseStatus::MissingCount
        } else {
            ParseStatus::InProgress
        })
    }

    /// Returns the buffered partial line.
    pub fn pending(&self) -> &[u8] {
        self.lines.pending()
    }

    /// Returns the underlying parser.
    pub fn parser(&self) -> &KtapParser<S> {
        &self.parser
    }

    /// Ends the session and returns the sink.
    pub fn into_sink(self) -> S {
        self.parser.into_sink()
    }
}

/// Builder for a [`KtapStream`].
#[derive(Clone, Debug)]
pub struct KtapStreamBuilder {
    source: StreamSource,
    parser_options: ParserOptions,
    read_buffer_size: usize,
}

impl Default for KtapStreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KtapStreamBuilder {
    /// Creates a new builder that reads kmsg records with default parser options.
    pub fn new() -> Self {
        Self {
            source: StreamSource::default(),
            parser_options: ParserOptions::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Sets the framing of the source.
    pub fn set_source(&mut self, source: StreamSource) -> &mut Self {
        self.source = source;
        self
    }

    /// Sets the options for the parser.
    pub fn set_parser_options(&mut self, options: ParserOptions) -> &mut Self {
        self.parser_options = options;
        self
    }

    /// Sets the size of a single read from the source. A size of 0 is treated as 1.
    pub fn set_read_buffer_size(&mut self, size: usize) -> &mut Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Spawns a worker thread that reads from `reader` until the report is complete, the reader
    /// is exhausted, an error occurs or the stream is cancelled.
    ///
    /// The reader may be non-blocking. In that case the worker polls it until data is available.
    pub fn spawn<R>(&self, reader: R) -> io::Result<KtapStream>
    where
        R: Read + Send + 'static,
    {
        let results = SharedResults::new();
        let cancelled = Arc::new(AtomicBool::new(false));

        let worker = StreamWorker {
            reader,
            parser: StreamParser::new(self.source, self.parser_options, results.clone()),
            cancelled: cancelled.clone(),
            buf: vec![0; self.read_buffer_size],
        };
        let handle = thread::Builder::new()
            .name("ktap-stream".to_owned())
            .spawn(move || worker.run())?;

        Ok(KtapStream {
            results,
            cancelled,
            handle,
        })
    }
}

/// How a [`KtapStream`] worker finished.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamOutcome {
    /// The top-level plan was fulfilled.
    Completed,

    /// The source was exhausted before the report was complete.
    EndOfInput,

    /// The stream was cancelled before the report was complete.
    Cancelled,
}

/// A KTAP stream being parsed on a background thread.
///
/// Results are appended to [`results`](Self::results) as soon as they are parsed. Call
/// [`join`](Self::join) to wait for the worker and find out how it finished.
#[derive(Debug)]
pub struct KtapStream {
    results: SharedResults,
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<Result<StreamOutcome, KtapStreamError>>,
}

impl KtapStream {
    /// Returns the results parsed so far.
    pub fn results(&self) -> &SharedResults {
        &self.results
    }

    /// Returns true while the worker thread is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Asks the worker to stop after its current read.
    ///
    /// A worker blocked in a read only notices this once the read returns.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Waits for the worker thread to finish.
    pub fn join(self) -> Result<StreamOutcome, KtapStreamError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic_payload) => Err(KtapStreamError::WorkerPanic {
                message: panic_payload_to_string(panic_payload),
            }),
        }
    }
}

/// Extracts a string message from a panic payload.
fn panic_payload_to_string(payload: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "(unknown panic payload)".to_owned()
    }
}

struct StreamWorker<R> {
    reader: R,
    parser: StreamParser<SharedResults>,
    cancelled: Arc<AtomicBool>,
    buf: Vec<u8>,
}

impl<R: Read> StreamWorker<R> {
    fn run(mut self) -> Result<StreamOutcome, KtapStreamError> {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                debug!("KTAP stream cancelled");
                return Ok(StreamOutcome::Cancelled);
            }

            let n = match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    if !self.parser.pending().is_empty() {
                        debug!(
                            "discarding unterminated line at end of input: {:?}",
                            String::from_utf8_lossy(self.parser.pending()),
                        );
                    }
                    return Ok(StreamOutcome::EndOfInput);
                }
                Ok(n) => n,
                Err(error) => match error.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => {
                        thread::sleep(POLL_INTERVAL);
                        continue;
                    }
                    io::ErrorKind::BrokenPipe => {
                        // /dev/kmsg reports EPIPE when records were overwritten before they
                        // could be read.
                        warn!(
                            "kmsg truncated: too many messages in the kernel log buffer, \
                             increase log_buf_len"
                        );
                        return Err(KtapStreamError::Read { error });
                    }
                    _ => {
                        warn!("error reading KTAP stream: {error}");
                        return Err(KtapStreamError::Read { error });
                    }
                },
            };

            if self.parser.process(&self.buf[..n])?.is_done() {
                return Ok(StreamOutcome::Completed);
            }
        }
    }
}
