// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the KTAP parser and its consumers.

use camino::Utf8PathBuf;
use std::{error, fmt, io};
use thiserror::Error;

/// An error that halts a KTAP parse session.
///
/// Once a [`KtapParser`](crate::parser::KtapParser) returns one of these, every later call on the
/// same parser returns the same error. Records already handed to the sink remain valid.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum KtapParseError {
    /// The stream violated a structural precondition of KTAP.
    #[error("KTAP protocol error at line {line_number}: {kind}")]
    Protocol {
        /// The 1-based number of the offending line within the session.
        line_number: usize,

        /// The offending line, without its terminator.
        line: String,

        /// What was wrong with the line.
        kind: ProtocolErrorKind,
    },

    /// A line was longer than the configured maximum.
    #[error("line {line_number} is longer than the maximum of {max_len} bytes")]
    LineTooLong {
        /// The 1-based number of the overlong line within the session.
        line_number: usize,

        /// The configured maximum line length.
        max_len: usize,
    },
}

impl KtapParseError {
    /// Returns the line number the error was reported at.
    pub fn line_number(&self) -> usize {
        match self {
            Self::Protocol { line_number, .. } | Self::LineTooLong { line_number, .. } => {
                *line_number
            }
        }
    }
}

/// The kind of structural violation behind a [`KtapParseError::Protocol`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ProtocolErrorKind {
    /// A test result arrived before the top-level version line.
    #[error("test result before the top-level KTAP version line")]
    ResultBeforeHeader,

    /// A subtest header arrived before the top-level version line.
    #[error("subtest header before the top-level KTAP version line")]
    SubtestBeforeHeader,

    /// A plan line arrived before the top-level version line.
    #[error("test plan before the top-level KTAP version line")]
    PlanBeforeHeader,

    /// The first line of the stream was a version line indented deeper than one level.
    #[error("nested KTAP version line (indented by {indent}) before the top-level version line")]
    NestedVersionBeforeHeader {
        /// Indentation of the version line, in columns.
        indent: usize,
    },

    /// A `TAP version` line was used to open a subtest.
    #[error("subtests must be introduced by a `KTAP version` line")]
    TapVersionInSubtest,

    /// A version line arrived while the current subtest was still waiting for its name.
    #[error("KTAP version line while the current subtest has no name yet")]
    UnexpectedVersion,

    /// A plan line arrived in a subtest that has no name yet.
    #[error("test plan in a subtest that has no name yet")]
    PlanBeforeName,

    /// A second plan line arrived for the same subtest.
    #[error("duplicate test plan")]
    DuplicatePlan,

    /// A test result arrived in a subtest that has no name yet.
    #[error("test result in a subtest that has no name yet")]
    ResultBeforeName,

    /// A line that is not part of KTAP was seen in strict mode.
    #[error("unrecognized line")]
    UnrecognizedLine,
}

/// A line exceeded the maximum length accepted by a [`LineBuffer`](crate::line_buffer::LineBuffer).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("line exceeds the maximum length of {max_len} bytes")]
pub struct LineTooLong {
    max_len: usize,
}

impl LineTooLong {
    pub(crate) fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Returns the maximum line length that was exceeded.
    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

/// An error that stopped a [`KtapStream`](crate::stream::KtapStream) worker early.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KtapStreamError {
    /// The stream could not be parsed.
    #[error("failed to parse KTAP stream")]
    Parse {
        /// The underlying parse error.
        #[from]
        error: KtapParseError,
    },

    /// Reading more bytes from the source failed.
    #[error("error reading KTAP stream")]
    Read {
        /// The underlying I/O error.
        #[source]
        error: io::Error,
    },

    /// The worker thread panicked.
    #[error("KTAP stream worker panicked: {message}")]
    WorkerPanic {
        /// The panic message, if one could be extracted.
        message: String,
    },
}

/// An error that occurred while loading the configuration file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file at `{path}`")]
    Read {
        /// The path to the configuration file.
        path: Utf8PathBuf,

        /// The underlying I/O error.
        #[source]
        error: io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse config file at `{path}`")]
    Parse {
        /// The path to the configuration file.
        path: Utf8PathBuf,

        /// The underlying TOML error.
        #[source]
        error: toml::de::Error,
    },
}

/// An error that occurred while writing a JUnit report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteJunitError {
    /// Creating the report file or its directory failed.
    #[error("error writing JUnit report to `{path}`")]
    Fs {
        /// The path that could not be written.
        path: Utf8PathBuf,

        /// The underlying I/O error.
        #[source]
        error: io::Error,
    },

    /// Serializing the report failed.
    #[error("error serializing JUnit report to `{path}`")]
    Serialize {
        /// The path the report was being written to.
        path: Utf8PathBuf,

        /// The underlying serialization error.
        #[source]
        error: quick_junit::SerializeError,
    },
}

/// Displays an error along with the chain of errors that caused it.
#[derive(Clone, Debug)]
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        let Some(mut cause) = self.error.source() else {
            return Ok(());
        };

        write!(f, "\n  caused by:")?;
        loop {
            write!(f, "\n  - {cause}")?;
            match cause.source() {
                Some(next) => cause = next,
                None => return Ok(()),
            }
        }
    }
}
