// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Streaming parser for KTAP, the Kernel Test Anything Protocol.
//!
//! KUnit and other kernel test frameworks report results as KTAP, usually through the kernel log.
//! This crate turns such a stream into a flat list of per-test-case [`KtapResult`]s, as it
//! arrives:
//!
//! * [`KtapParser`] consumes lines or arbitrary chunks of bytes synchronously.
//! * [`KtapStreamBuilder`] runs a parser on a background thread against any
//!   [`Read`](std::io::Read) source, such as `/dev/kmsg`, and publishes results while the stream
//!   is being parsed.
//!
//! Results can be rendered for humans with [`reporter`] or exported as JUnit XML with [`junit`].
//!
//! # Examples
//!
//! ```
//! use ktap_parser::{KtapParser, ParseStatus, ResultCode};
//!
//! let mut parser = KtapParser::new(Vec::new());
//! let status = parser
//!     .feed(b"KTAP version 1\n1..1\n    KTAP version 1\n    # Subtest: example\n    1..1\n")
//!     .unwrap();
//! assert_eq!(status, ParseStatus::InProgress);
//!
//! let status = parser.feed(b"    ok 1 example_test\nok 1 example\n").unwrap();
//! assert_eq!(status, ParseStatus::Done);
//!
//! let results = parser.into_sink();
//! assert_eq!(results[0].suite_name, "example");
//! assert_eq!(results[0].case_name, "example_test");
//! assert_eq!(results[0].code, ResultCode::Success);
//! ```

pub mod config;
pub mod errors;
pub mod junit;
pub mod kmsg;
pub mod line_buffer;
pub mod parser;
pub mod reporter;
pub mod result;
pub mod sink;
pub mod stream;

pub use parser::{KtapParser, ParseMode, ParseStatus, ParserOptions};
pub use result::{KtapResult, ResultCode};
pub use sink::{ResultSink, SharedResults};
pub use stream::{KtapStream, KtapStreamBuilder, StreamOutcome, StreamParser, StreamSource};
