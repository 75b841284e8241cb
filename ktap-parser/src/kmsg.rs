// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoding of `/dev/kmsg` records.
//!
//! Each read from `/dev/kmsg` returns one record of the form
//!
//! ```text
//! PRIORITY,SEQUENCE,TIMESTAMP,FLAGS[,...];MESSAGE
//! ```
//!
//! optionally followed by continuation lines that start with a space and carry `KEY=VALUE`
//! dictionary entries. KUnit writes each KTAP line as the message of one record.

use tracing::warn;

/// A single parsed kmsg record header and message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KmsgRecord<'a> {
    /// Syslog facility and priority, combined.
    pub prefix: u32,

    /// The record sequence number.
    pub sequence: u64,

    /// Microseconds since boot.
    pub timestamp_us: u64,

    /// The message text, with its original leading whitespace.
    pub message: &'a str,
}

impl<'a> KmsgRecord<'a> {
    /// Parses a record line.
    ///
    /// Returns `None` for continuation lines and for lines without a valid record header.
    pub fn parse(line: &'a str) -> Option<Self> {
        if line.starts_with(' ') {
            return None;
        }

        let (header, message) = line.split_once(';')?;
        let mut fields = header.split(',');
        let prefix = fields.next()?.parse().ok()?;
        let sequence = fields.next()?.parse().ok()?;
        let timestamp_us = fields.next()?.parse().ok()?;

        Some(Self {
            prefix,
            sequence,
            timestamp_us,
            message,
        })
    }
}

/// Returns the message part of a kmsg record line, or `None` if the line isn't a record.
pub fn decode_record(line: &str) -> Option<&str> {
    KmsgRecord::parse(line).map(|record| record.message)
}

/// Decodes a sequence of kmsg lines, warning when records were lost in between.
#[derive(Debug, Default)]
pub struct KmsgDecoder {
    last_sequence: Option<u64>,
}

impl KmsgDecoder {
    /// Creates a new decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the message part of a kmsg record line, or `None` if the line isn't a record.
    pub fn decode<'a>(&mut self, line: &'a str) -> Option<&'a str> {
        let record = KmsgRecord::parse(line)?;
        if let Some(next) = self.last_sequence.and_then(|last| last.checked_add(1))
            && record.sequence > next
        {
            warn!(
                "kmsg truncated: {} records lost before sequence number {}",
                record.sequence - next,
                record.sequence,
            );
        }
        self.last_sequence = Some(record.sequence);
        Some(record.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn parse_record() {
        assert_eq!(
            KmsgRecord::parse("6,1523,38214093,-;    ok 1 drm_test_mm_init"),
            Some(KmsgRecord {
                prefix: 6,
                sequence: 1523,
                timestamp_us: 38214093,
                message: "    ok 1 drm_test_mm_init",
            })
        );
    }

    #[test_case(" SUBSYSTEM=pci" ; "continuation line")]
    #[test_case("KTAP version 1" ; "no header")]
    #[test_case("x,1,2,-;KTAP version 1" ; "bad prefix")]
    #[test_case("6,1;KTAP version 1" ; "missing timestamp")]
    fn not_a_record(line: &str) {
        assert_eq!(decode_record(line), None);
    }

    #[test]
    fn decoder_passes_messages_through() {
        let mut decoder = KmsgDecoder::new();
        assert_eq!(decoder.decode("6,10,100,-;KTAP version 1"), Some("KTAP version 1"));
        assert_eq!(decoder.decode(" DEVICE=+drm:card0"), None);
        assert_eq!(decoder.decode("6,11,101,c;1..1"), Some("1..1"));
        // A gap in sequence numbers is logged, but the record is still decoded.
        assert_eq!(decoder.decode("6,20,150,-;    ok 1 foo"), Some("    ok 1 foo"));
        assert_eq!(decoder.last_sequence, Some(20));
    }

    #[test]
    fn decoder_handles_sequence_wraparound() {
        let mut decoder = KmsgDecoder::new();
        let last = format!("6,{},0,-;KTAP version 1", u64::MAX);
        assert_eq!(decoder.decode(&last), Some("KTAP version 1"));
        assert_eq!(decoder.decode("6,1,0,-;1..1"), Some("1..1"));
        assert_eq!(decoder.last_sequence, Some(1));
    }
}
