// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use ktap_parser::errors::{
    ConfigError, DisplayErrorChain, KtapParseError, KtapStreamError, WriteJunitError,
};
use owo_colors::OwoColorize;
use std::{error::Error, io};
use thiserror::Error;
use tracing::{error, info};

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

/// Documented exit codes for `ktap-report` failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum KtapExitCode {}

impl KtapExitCode {
    /// No errors occurred and every test case passed or was skipped.
    pub const OK: i32 = 0;

    /// One or more test cases failed.
    pub const TESTS_FAILED: i32 = 100;

    /// The input violated the KTAP protocol.
    pub const PROTOCOL_ERROR: i32 = 104;

    /// Reading the input produced an error.
    pub const READ_ERROR: i32 = 105;

    /// The input ended, or the watch was cancelled, before the report was complete.
    pub const INCOMPLETE_RUN: i32 = 106;

    /// Writing data to stdout, stderr or a report file produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;

    /// A user issue happened while setting up a `ktap-report` invocation.
    pub const SETUP_ERROR: i32 = 96;
}

// The #[error()] strings are placeholder messages: errors are meant to be printed with
// display_to_stderr, which colorizes them.

/// An expected failure of a `ktap-report` invocation.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config error")]
    Config {
        #[from]
        err: ConfigError,
    },
    #[error("failed to open input")]
    InputOpen {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to read input")]
    Read {
        #[source]
        err: io::Error,
    },
    #[error("failed to parse KTAP")]
    Parse {
        #[source]
        err: KtapParseError,
    },
    #[error("failed to start stream worker")]
    StreamSpawn {
        #[source]
        err: io::Error,
    },
    #[error("stream worker panicked")]
    StreamWorkerPanic { message: String },
    #[error("failed to write JUnit report")]
    WriteJunit {
        #[from]
        err: WriteJunitError,
    },
    #[error("failed to write output")]
    WriteOutput {
        #[source]
        err: io::Error,
    },
    #[error("{failed} test cases failed")]
    TestsFailed { failed: usize },
    #[error("incomplete run")]
    IncompleteRun { reason: IncompleteReason },
}

/// Why a run ended before its report was complete.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[doc(hidden)]
pub enum IncompleteReason {
    EndOfInput,
    Cancelled,
}

impl ExpectedError {
    pub(crate) fn stream_error(err: KtapStreamError) -> Self {
        match err {
            KtapStreamError::Parse { error } => Self::Parse { err: error },
            KtapStreamError::Read { error } => Self::Read { err: error },
            KtapStreamError::WorkerPanic { message } => Self::StreamWorkerPanic { message },
            other => Self::StreamWorkerPanic {
                message: DisplayErrorChain::new(other).to_string(),
            },
        }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::InputOpen { .. } | Self::StreamSpawn { .. } => {
                KtapExitCode::SETUP_ERROR
            }
            Self::Read { .. } => KtapExitCode::READ_ERROR,
            Self::Parse { .. } => KtapExitCode::PROTOCOL_ERROR,
            Self::StreamWorkerPanic { .. } => 1,
            Self::WriteJunit { .. } | Self::WriteOutput { .. } => {
                KtapExitCode::WRITE_OUTPUT_ERROR
            }
            Self::TestsFailed { .. } => KtapExitCode::TESTS_FAILED,
            Self::IncompleteRun { .. } => KtapExitCode::INCOMPLETE_RUN,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error: Option<&dyn Error> = match self {
            Self::Config { err } => {
                error!("{err}");
                err.source()
            }
            Self::InputOpen { path, err } => {
                error!("failed to open input `{}`", path.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::Read { err } => {
                error!("failed to read input");
                Some(err as &dyn Error)
            }
            Self::Parse { err } => {
                error!("{err}");
                if let KtapParseError::Protocol { line, .. } = err {
                    info!(target: NO_HEADING_TARGET, "  {}", line.style(styles.bold));
                }
                None
            }
            Self::StreamSpawn { err } => {
                error!("failed to start stream worker thread");
                Some(err as &dyn Error)
            }
            Self::StreamWorkerPanic { message } => {
                error!("stream worker panicked: {message}");
                None
            }
            Self::WriteJunit { err } => {
                error!("{err}");
                err.source()
            }
            Self::WriteOutput { err } => {
                error!("failed to write output");
                Some(err as &dyn Error)
            }
            Self::TestsFailed { failed } => {
                let tests_str = if *failed == 1 { "test case" } else { "test cases" };
                error!("{} {tests_str} failed", failed.style(styles.bold));
                None
            }
            Self::IncompleteRun { reason } => {
                match reason {
                    IncompleteReason::EndOfInput => {
                        error!("input ended before the KTAP report was complete")
                    }
                    IncompleteReason::Cancelled => {
                        error!("timed out before the KTAP report was complete")
                    }
                }
                None
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktap_parser::errors::ProtocolErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn exit_codes() {
        let cases = [
            (
                ExpectedError::Parse {
                    err: KtapParseError::Protocol {
                        line_number: 1,
                        line: "ok 1 foo".to_owned(),
                        kind: ProtocolErrorKind::ResultBeforeHeader,
                    },
                },
                KtapExitCode::PROTOCOL_ERROR,
            ),
            (
                ExpectedError::Read {
                    err: io::Error::from(io::ErrorKind::BrokenPipe),
                },
                KtapExitCode::READ_ERROR,
            ),
            (
                ExpectedError::TestsFailed { failed: 2 },
                KtapExitCode::TESTS_FAILED,
            ),
            (
                ExpectedError::IncompleteRun {
                    reason: IncompleteReason::Cancelled,
                },
                KtapExitCode::INCOMPLETE_RUN,
            ),
            (
                ExpectedError::InputOpen {
                    path: "missing.ktap".into(),
                    err: io::Error::from(io::ErrorKind::NotFound),
                },
                KtapExitCode::SETUP_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.process_exit_code(), expected, "for {error:?}");
        }
    }

    #[test]
    fn stream_error_conversion() {
        let error = ExpectedError::stream_error(KtapStreamError::Read {
            error: io::Error::from(io::ErrorKind::BrokenPipe),
        });
        assert_eq!(error.process_exit_code(), KtapExitCode::READ_ERROR);

        let error = ExpectedError::stream_error(KtapStreamError::WorkerPanic {
            message: "boom".to_owned(),
        });
        assert!(
            matches!(&error, ExpectedError::StreamWorkerPanic { message } if message == "boom"),
            "unexpected error: {error:?}"
        );
    }
}
