// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The KTAP state machine.
//!
//! A KTAP report is a tree: the top-level report contains suites, suites contain test cases, and
//! parametrized test cases contain one result per parameter. Each level is introduced by a
//! version line and a `# Subtest:` header, may declare a plan, and is closed by a result line in
//! its parent:
//!
//! ```text
//! KTAP version 1
//! 1..1
//!     KTAP version 1
//!     # Subtest: drm_buddy
//!     1..2
//!     ok 1 drm_test_buddy_alloc_range
//!         KTAP version 1
//!         # Subtest: drm_test_buddy_alloc_pathological
//!         ok 1 order 0
//!         ok 2 order 1
//!     ok 2 drm_test_buddy_alloc_pathological
//! ok 1 drm_buddy
//! ```
//!
//! The parser tracks open levels on an explicit stack of frames. Nesting is derived from the
//! sequence of version, header, plan and result lines; indentation is not used, except to
//! recognize streams whose top-level header was never printed.

use crate::{
    errors::{KtapParseError, ProtocolErrorKind},
    line_buffer::{DEFAULT_MAX_LINE_LEN, LineBuffer},
    result::{KtapResult, ResultCode},
    sink::ResultSink,
};
use serde::Deserialize;
use std::{fmt, str::FromStr};
use tracing::{debug, trace, warn};

/// Columns of indentation the kernel uses per nesting level.
const INDENT_WIDTH: usize = 4;

/// Stack depth of an open suite frame.
const SUITE_DEPTH: usize = 2;

/// Stack depth of an open parametrized test case frame.
const CASE_DEPTH: usize = 3;

/// How lines that are not part of KTAP are handled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseMode {
    /// Unrecognized lines are protocol errors. Use this for clean, already demultiplexed KTAP.
    #[default]
    Strict,

    /// Unrecognized lines are skipped. Use this when scraping the kernel log, which interleaves
    /// unrelated messages with KTAP output.
    Tolerant,
}

impl ParseMode {
    /// Returns the list of known values, for use in error messages.
    pub fn variants() -> &'static [&'static str] {
        &["strict", "tolerant"]
    }
}

impl fmt::Display for ParseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Tolerant => write!(f, "tolerant"),
        }
    }
}

impl FromStr for ParseMode {
    type Err = ParseModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "tolerant" => Ok(Self::Tolerant),
            _ => Err(ParseModeParseError {
                input: s.to_owned(),
            }),
        }
    }
}

/// Error returned while parsing a [`ParseMode`] from a string.
#[derive(Clone, Debug, thiserror::Error)]
#[error(
    "unrecognized value for parse mode: {input}\n(known values: {})",
    ParseMode::variants().join(", "),
)]
pub struct ParseModeParseError {
    input: String,
}

/// Options for a [`KtapParser`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParserOptions {
    /// How unrecognized lines are handled.
    pub mode: ParseMode,

    /// The maximum length of a line passed in through [`KtapParser::feed`], or `None` for no limit.
    pub max_line_len: Option<usize>,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            mode: ParseMode::Strict,
            max_line_len: Some(DEFAULT_MAX_LINE_LEN),
        }
    }
}

/// The status of a parse session after a line has been consumed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub enum ParseStatus {
    /// More input is expected.
    InProgress,

    /// A plan line had a zero or malformed count. Parsing continues, but the number of results
    /// in that scope is unknown.
    MissingCount,

    /// The top-level plan has been fulfilled and the report is complete.
    Done,
}

impl ParseStatus {
    /// Returns true if the report is complete.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Done)
    }
}

#[derive(Clone, Debug)]
enum SessionState {
    ExpectingHeader,
    Running,
    Done,
    Failed(KtapParseError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Plan {
    Pending,
    Count(u32),
    Unknown,
}

/// One open level of the report.
#[derive(Clone, Debug)]
struct Frame {
    name: Option<String>,
    has_version: bool,
    plan: Plan,
    seen: u32,
}

impl Frame {
    fn top_level(plan: Plan) -> Self {
        Self {
            name: None,
            has_version: true,
            plan,
            seen: 0,
        }
    }

    fn opened_by_version() -> Self {
        Self {
            name: None,
            has_version: true,
            plan: Plan::Pending,
            seen: 0,
        }
    }

    fn opened_by_header(name: &str) -> Self {
        Self {
            name: Some(name.to_owned()),
            has_version: false,
            plan: Plan::Pending,
            seen: 0,
        }
    }

    fn awaits_name(&self) -> bool {
        self.has_version && self.name.is_none()
    }

    fn plan_consumed(&self) -> bool {
        matches!(self.plan, Plan::Count(count) if self.seen >= count)
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<top level>")
    }
}

/// An incremental KTAP parser.
///
/// Feed the parser one line at a time with [`parse_line`](Self::parse_line), or arbitrary chunks
/// of bytes with [`feed`](Self::feed). Finished records are appended to the sink as soon as they
/// are complete, so the sink can be inspected between calls to get the results so far.
#[derive(Debug)]
pub struct KtapParser<S = Vec<KtapResult>> {
    sink: S,
    options: ParserOptions,
    state: SessionState,
    frames: Vec<Frame>,
    lines: LineBuffer,
    line_number: usize,
}

impl<S: ResultSink> KtapParser<S> {
    /// Creates a new parser in strict mode that appends results to `sink`.
    pub fn new(sink: S) -> Self {
        Self::with_options(sink, ParserOptions::default())
    }

    /// Creates a new parser with the given options.
    pub fn with_options(sink: S, options: ParserOptions) -> Self {
        Self {
            sink,
            options,
            state: SessionState::ExpectingHeader,
            frames: Vec::new(),
            lines: LineBuffer::with_max_line_len(options.max_line_len),
            line_number: 0,
        }
    }

    /// Returns the options this parser was created with.
    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    /// Returns the sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Returns the sink mutably.
    ///
    /// Callers may drain records from the sink between calls; the parser does not rely on
    /// records it has already appended.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Ends the session and returns the sink. Only internal buffers are dropped.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Returns the number of lines consumed so far.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Returns the number of open levels, including the top level.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Returns true once the top-level plan has been fulfilled.
    pub fn is_done(&self) -> bool {
        matches!(self.state, SessionState::Done)
    }

    /// Returns the error that halted this session, if any.
    pub fn error(&self) -> Option<&KtapParseError> {
        match &self.state {
            SessionState::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Returns the buffered partial line left over by [`feed`](Self::feed).
    pub fn pending(&self) -> &[u8] {
        self.lines.pending()
    }

    /// Feeds a chunk of bytes, parsing every line it completes.
    ///
    /// A trailing partial line is kept until a later call completes it. Returns
    /// [`ParseStatus::MissingCount`] if any plan line in the chunk had an unknown count and the
    /// report isn't done yet.
    pub fn feed(&mut self, data: &[u8]) -> Result<ParseStatus, KtapParseError> {
        if let SessionState::Failed(error) = &self.state {
            return Err(error.clone());
        }

        self.lines.feed(data);
        let mut missing_count = false;
        while let Some(line) = self.lines.next_line() {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    self.line_number += 1;
                    return Err(self.fail(KtapParseError::LineTooLong {
                        line_number: self.line_number,
                        max_len: error.max_len(),
                    }));
                }
            };

            match self.parse_line(&String::from_utf8_lossy(&line))? {
                ParseStatus::InProgress => {}
                ParseStatus::MissingCount => missing_count = true,
                ParseStatus::Done => return Ok(ParseStatus::Done),
            }
        }

        Ok(if self.is_done() {
            ParseStatus::Done
        } else if missing_count {
            ParseStatus::MissingCount
        } else {
            ParseStatus::InProgress
        })
    }

    /// Parses a single line. A trailing line terminator is ignored.
    pub fn parse_line(&mut self, line: &str) -> Result<ParseStatus, KtapParseError> {
        match &self.state {
            SessionState::Failed(error) => return Err(error.clone()),
            SessionState::Done => {
                trace!("ignoring line after the end of the KTAP report: {line:?}");
                return Ok(ParseStatus::Done);
            }
            SessionState::ExpectingHeader | SessionState::Running => {}
        }

        self.line_number += 1;
        match self.handle(Line::classify(line)) {
            Ok(status) => Ok(status),
            Err(kind) => {
                let error = KtapParseError::Protocol {
                    line_number: self.line_number,
                    line: line.trim_end_matches(['\r', '\n']).to_owned(),
                    kind,
                };
                debug!("{error}");
                Err(self.fail(error))
            }
        }
    }

    fn fail(&mut self, error: KtapParseError) -> KtapParseError {
        self.state = SessionState::Failed(error.clone());
        error
    }

    fn handle(&mut self, line: Line<'_>) -> Result<ParseStatus, ProtocolErrorKind> {
        match line {
            Line::Blank | Line::Diagnostic => Ok(ParseStatus::InProgress),
            Line::Unknown => match self.options.mode {
                ParseMode::Strict => Err(ProtocolErrorKind::UnrecognizedLine),
                ParseMode::Tolerant => Ok(ParseStatus::InProgress),
            },
            Line::Version { keyword, indent } => self.handle_version(keyword, indent),
            Line::Subtest { name } => self.handle_subtest(name),
            Line::Plan { count } => self.handle_plan(count),
            Line::Result(result) => self.handle_result(result),
        }
    }

    fn handle_version(
        &mut self,
        keyword: VersionKeyword,
        indent: usize,
    ) -> Result<ParseStatus, ProtocolErrorKind> {
        if matches!(self.state, SessionState::ExpectingHeader) {
            if indent == 0 {
                debug!("{keyword} report header found");
                self.frames.push(Frame::top_level(Plan::Pending));
            } else if indent <= INDENT_WIDTH {
                // Some kernels print the suite header without the top-level header and plan.
                debug!("{keyword} report header missing, assuming a single suite");
                self.frames.push(Frame::top_level(Plan::Count(1)));
                self.frames.push(Frame::opened_by_version());
            } else {
                return Err(ProtocolErrorKind::NestedVersionBeforeHeader { indent });
            }
            self.state = SessionState::Running;
            return Ok(ParseStatus::InProgress);
        }

        if keyword == VersionKeyword::Tap && self.options.mode == ParseMode::Strict {
            return Err(ProtocolErrorKind::TapVersionInSubtest);
        }

        let depth = self.frames.len();
        let innermost = self.innermost_mut();
        if depth > 1 && innermost.awaits_name() {
            return Err(ProtocolErrorKind::UnexpectedVersion);
        }
        if depth > 1 && !innermost.has_version {
            // Legacy order: the subtest header came first.
            innermost.has_version = true;
        } else {
            self.frames.push(Frame::opened_by_version());
        }
        Ok(ParseStatus::InProgress)
    }

    fn handle_subtest(&mut self, name: &str) -> Result<ParseStatus, ProtocolErrorKind> {
        if matches!(self.state, SessionState::ExpectingHeader) {
            return Err(ProtocolErrorKind::SubtestBeforeHeader);
        }

        let depth = self.frames.len();
        let innermost = self.innermost_mut();
        let depth = if depth > 1 && innermost.awaits_name() {
            innermost.name = Some(name.to_owned());
            depth
        } else {
            self.frames.push(Frame::opened_by_header(name));
            depth + 1
        };

        if depth == CASE_DEPTH {
            let suite_name = self.suite_name();
            debug!("parametrized test case {suite_name}::{name} started");
            self.sink
                .push(KtapResult::new(suite_name, name, ResultCode::Invalid));
        } else {
            debug!("subtest {name} started at depth {depth}");
        }
        Ok(ParseStatus::InProgress)
    }

    fn handle_plan(&mut self, count: Option<u32>) -> Result<ParseStatus, ProtocolErrorKind> {
        if matches!(self.state, SessionState::ExpectingHeader) {
            return Err(ProtocolErrorKind::PlanBeforeHeader);
        }

        let depth = self.frames.len();
        let innermost = self.innermost_mut();
        if depth > 1 && innermost.name.is_none() {
            return Err(ProtocolErrorKind::PlanBeforeName);
        }
        if innermost.plan != Plan::Pending {
            return Err(ProtocolErrorKind::DuplicatePlan);
        }

        match count {
            Some(count) => {
                innermost.plan = Plan::Count(count);
                debug!("executing {count} tests in {}", innermost.display_name());
                Ok(self.check_done())
            }
            None => {
                innermost.plan = Plan::Unknown;
                warn!("missing test count in {}", innermost.display_name());
                Ok(ParseStatus::MissingCount)
            }
        }
    }

    fn handle_result(&mut self, result: ResultLine<'_>) -> Result<ParseStatus, ProtocolErrorKind> {
        if matches!(self.state, SessionState::ExpectingHeader) {
            return Err(ProtocolErrorKind::ResultBeforeHeader);
        }

        let depth = self.frames.len();
        let innermost = self.innermost_mut();
        if depth > 1 && innermost.awaits_name() {
            return Err(ProtocolErrorKind::ResultBeforeName);
        }

        // A result that continues the frame's numbering is a leaf even past the plan, since the
        // plan is advisory. Only an out-of-sequence line with another name closes the frame.
        let continues_sequence = innermost.seen.checked_add(1) == Some(result.number);
        let closes = depth > 1
            && (innermost.name.as_deref() == Some(result.name)
                || (innermost.plan_consumed() && !continues_sequence));
        if closes {
            self.close_frame(result);
        } else {
            self.record_result(result);
        }
        Ok(self.check_done())
    }

    fn close_frame(&mut self, result: ResultLine<'_>) {
        let depth = self.frames.len();
        let frame = self
            .frames
            .pop()
            .expect("only nested frames are closed, so the stack has at least two frames");
        let name = frame.display_name();

        if name != result.name {
            warn!(
                "closing result for subtest {name} reports a different name: {}",
                result.name,
            );
        }
        if let Plan::Count(count) = frame.plan
            && frame.seen != count
        {
            warn!(
                "subtest {name} planned {count} tests, but {} were reported",
                frame.seen,
            );
        }
        self.count_result(result.number);

        if depth == CASE_DEPTH {
            self.emit(result);
        } else {
            debug!("subtest {name} finished: {}", result.code);
        }
    }

    fn record_result(&mut self, result: ResultLine<'_>) {
        self.count_result(result.number);

        match self.frames.len() {
            1 => {
                warn!("result for {} reported outside of any subtest", result.name);
                self.emit(result);
            }
            SUITE_DEPTH => self.emit(result),
            _ => trace!(
                "parameter {} of {}: {}",
                result.name,
                self.innermost().display_name(),
                result.code,
            ),
        }
    }

    fn count_result(&mut self, number: u32) {
        let innermost = self.innermost_mut();
        innermost.seen += 1;
        if number != innermost.seen {
            debug!(
                "result number {number} in {} is out of sequence (expected {})",
                innermost.display_name(),
                innermost.seen,
            );
        }
    }

    fn emit(&mut self, result: ResultLine<'_>) {
        let record = KtapResult {
            suite_name: self.suite_name(),
            case_name: result.name.to_owned(),
            message: result.message.map(str::to_owned),
            code: result.code,
        };
        trace!(?record, "test case finished");
        self.sink.push(record);
    }

    fn check_done(&mut self) -> ParseStatus {
        if self.frames.len() == 1 && self.innermost().plan_consumed() {
            debug!("KTAP report complete");
            self.state = SessionState::Done;
            ParseStatus::Done
        } else {
            ParseStatus::InProgress
        }
    }

    fn suite_name(&self) -> String {
        self.frames
            .get(SUITE_DEPTH - 1)
            .and_then(|frame| frame.name.clone())
            .unwrap_or_default()
    }

    // The stack is never empty while the session is running.
    fn innermost(&self) -> &Frame {
        self.frames
            .last()
            .expect("the top-level frame is open while the session is running")
    }

    fn innermost_mut(&mut self) -> &mut Frame {
        self.frames
            .last_mut()
            .expect("the top-level frame is open while the session is running")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum VersionKeyword {
    Ktap,
    Tap,
}

impl fmt::Display for VersionKeyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ktap => write!(f, "KTAP"),
            Self::Tap => write!(f, "TAP"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ResultLine<'a> {
    number: u32,
    name: &'a str,
    code: ResultCode,
    message: Option<&'a str>,
}

/// A classified input line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Line<'a> {
    Blank,
    Diagnostic,
    Unknown,
    Version { keyword: VersionKeyword, indent: usize },
    Subtest { name: &'a str },
    Plan { count: Option<u32> },
    Result(ResultLine<'a>),
}

impl<'a> Line<'a> {
    fn classify(line: &'a str) -> Self {
        let body = line.trim_start();
        let indent = line.len() - body.len();
        let body = body.trim_end();

        if body.is_empty() {
            return Self::Blank;
        }
        if let Some(keyword) = parse_version(body) {
            return Self::Version { keyword, indent };
        }
        if let Some(comment) = body.strip_prefix('#') {
            return match comment.trim_start().strip_prefix("Subtest:").map(str::trim) {
                Some(name) if !name.is_empty() => Self::Subtest { name },
                _ => Self::Diagnostic,
            };
        }
        if let Some(count) = parse_plan(body) {
            return Self::Plan { count };
        }
        if let Some(result) = parse_result(body) {
            return Self::Result(result);
        }
        Self::Unknown
    }
}

fn parse_version(body: &str) -> Option<VersionKeyword> {
    let mut words = body.split_whitespace();
    let keyword = match words.next()? {
        word if word.eq_ignore_ascii_case("KTAP") => VersionKeyword::Ktap,
        word if word.eq_ignore_ascii_case("TAP") => VersionKeyword::Tap,
        _ => return None,
    };
    if !words.next()?.eq_ignore_ascii_case("version") {
        return None;
    }
    words.next()?.parse::<u32>().ok()?;
    words.next().is_none().then_some(keyword)
}

/// Returns `Some(None)` for a plan line whose count is zero or malformed.
fn parse_plan(body: &str) -> Option<Option<u32>> {
    let (low, high) = body.split_once("..")?;
    if low.is_empty() || !low.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // A plan may carry a trailing comment, as in `1..0 # SKIP`.
    let high = high.split('#').next().unwrap_or_default().trim();
    Some(high.parse::<u32>().ok().filter(|&count| count > 0))
}

fn parse_result(body: &str) -> Option<ResultLine<'_>> {
    let (passed, rest) = if let Some(rest) = body.strip_prefix("not ok") {
        (false, rest)
    } else {
        (true, body.strip_prefix("ok")?)
    };
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let rest = rest.trim_start();
    let (number, rest) = rest
        .split_once(char::is_whitespace)
        .unwrap_or((rest, ""));
    let number = number.parse().ok()?;

    let (description, comment) = match rest.split_once('#') {
        Some((description, comment)) => (description, Some(comment.trim())),
        None => (rest, None),
    };
    let mut name = description.trim();
    if name == "-" {
        name = "";
    } else if let Some(stripped) = name.strip_prefix("- ") {
        name = stripped.trim_start();
    }

    let mut code = if passed {
        ResultCode::Success
    } else {
        ResultCode::Failure
    };
    let mut message = comment.filter(|comment| !comment.is_empty());
    if let Some(reason) = message.and_then(strip_skip) {
        code = ResultCode::Skip;
        message = (!reason.is_empty()).then_some(reason);
    }

    Some(ResultLine {
        number,
        name,
        code,
        message,
    })
}

/// Returns the skip reason if `comment` is a `SKIP` directive.
fn strip_skip(comment: &str) -> Option<&str> {
    let directive = comment.get(..4)?;
    if !directive.eq_ignore_ascii_case("skip") {
        return None;
    }
    let reason = &comment[4..];
    (reason.is_empty() || reason.starts_with(char::is_whitespace)).then(|| reason.trim())
}
