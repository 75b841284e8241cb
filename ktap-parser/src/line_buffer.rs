// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Splitting arbitrarily chunked input into lines.

use crate::errors::LineTooLong;
use bytes::{Bytes, BytesMut};

/// The default maximum line length, in bytes.
///
/// This matches the size of a single kernel log read, which is what KTAP producers are written
/// against.
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

/// Buffers input chunks and yields complete lines.
///
/// Lines are delimited by `\n`. A trailing partial line stays buffered until a later call to
/// [`feed`](Self::feed) supplies its terminator.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
    max_line_len: Option<usize>,
    // Length of the buffered prefix already searched for a newline.
    scanned: usize,
    // Set after an overlong line has been reported, until its terminator is seen.
    discarding: bool,
}

impl LineBuffer {
    /// Creates a new line buffer with no limit on line length.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new line buffer that rejects lines longer than `max_line_len` bytes.
    ///
    /// `None` means no limit.
    pub fn with_max_line_len(max_line_len: Option<usize>) -> Self {
        Self {
            max_line_len,
            ..Self::default()
        }
    }

    /// Returns the maximum line length, if any.
    pub fn max_line_len(&self) -> Option<usize> {
        self.max_line_len
    }

    /// Appends a chunk of input.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete line, without its terminator.
    ///
    /// Returns `None` once no complete line is buffered. A line that exceeds the maximum length
    /// is reported as an error exactly once; the remainder of that line is dropped.
    pub fn next_line(&mut self) -> Option<Result<Bytes, LineTooLong>> {
        loop {
            let Some(pos) = self.buf[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|offset| self.scanned + offset)
            else {
                self.scanned = self.buf.len();
                return self.check_partial();
            };

            self.scanned = 0;
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if self.discarding {
                self.discarding = false;
                continue;
            }

            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if let Some(max_len) = self.max_line_len
                && line.len() > max_len
            {
                return Some(Err(LineTooLong::new(max_len)));
            }
            return Some(Ok(line.freeze()));
        }
    }

    /// Returns the buffered partial line.
    pub fn pending(&self) -> &[u8] {
        if self.discarding { &[] } else { &self.buf[..] }
    }

    fn check_partial(&mut self) -> Option<Result<Bytes, LineTooLong>> {
        if self.discarding {
            self.buf.clear();
            self.scanned = 0;
            return None;
        }

        // Leave room for a trailing \r that will be stripped once the line completes.
        match self.max_line_len {
            Some(max_len) if self.buf.len() > max_len.saturating_add(1) => {
                self.buf.clear();
                self.scanned = 0;
                self.discarding = true;
                Some(Err(LineTooLong::new(max_len)))
            }
            _ => None,
        }
    }
}
