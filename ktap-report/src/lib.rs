// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collect and report KUnit results from KTAP streams and the kernel log.
//!
//! `ktap-report parse` reads a saved KTAP report or kernel log, and `ktap-report watch` follows
//! `/dev/kmsg` while tests are running. Both print one line per test case and can write a JUnit
//! report.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::OutputWriter;
