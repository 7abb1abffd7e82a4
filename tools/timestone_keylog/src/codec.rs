//! Inline timestamp framing for keylog streams.
//!
//! A tag is `0x01`, the decimal milliseconds since the Unix epoch, then
//! `0x02`. Everything after a tag, up to the next tag, belongs to that tag's
//! timestamp. Content before the first tag is dropped on decode.

use crate::error::DecodeError;
use chrono::{DateTime, Local, TimeZone};

pub const TAG_OPEN: char = '\u{1}';
pub const TAG_CLOSE: char = '\u{2}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp_ms: i64,
    pub text: String,
}

impl LogEntry {
    pub fn new(timestamp_ms: i64, text: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            text: text.into(),
        }
    }

    pub fn local_time(&self) -> Option<DateTime<Local>> {
        Local.timestamp_millis_opt(self.timestamp_ms).single()
    }

    pub(crate) fn within(&self, center_ms: i64, window_ms: u64) -> bool {
        let half = (window_ms / 2) as i128;
        (self.timestamp_ms as i128 - center_ms as i128).abs() < half
    }
}

pub fn encode_tag(timestamp_ms: i64) -> String {
    let mut tag = String::with_capacity(16);
    push_tag(&mut tag, timestamp_ms);
    tag
}

pub fn push_tag(buffer: &mut String, timestamp_ms: i64) {
    buffer.push(TAG_OPEN);
    buffer.push_str(&timestamp_ms.to_string());
    buffer.push(TAG_CLOSE);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Seeking,
    ReadingTimestamp,
    Body,
}

/// Streaming decoder; feed chars with [`Decoder::push`] and call
/// [`Decoder::finish`] at end of input.
#[derive(Debug)]
pub struct Decoder {
    state: State,
    current_ms: Option<i64>,
    digits: String,
    body: String,
    offset: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::Seeking,
            current_ms: None,
            digits: String::new(),
            body: String::new(),
            offset: 0,
        }
    }

    /// Feeds one char, returning the entry completed by it, if any.
    pub fn push(&mut self, c: char) -> Result<Option<LogEntry>, DecodeError> {
        let offset = self.offset;
        self.offset += 1;
        match (self.state, c) {
            (State::ReadingTimestamp, TAG_OPEN) => Err(DecodeError::InvalidTimestamp {
                digits: std::mem::take(&mut self.digits),
                offset,
            }),
            (State::Body, TAG_OPEN) => {
                let completed = self.take_entry();
                self.open_tag();
                Ok(completed)
            }
            (State::Seeking, TAG_OPEN) => {
                self.open_tag();
                Ok(None)
            }
            (State::ReadingTimestamp, TAG_CLOSE) => {
                let timestamp_ms = parse_timestamp(&self.digits).ok_or_else(|| {
                    DecodeError::InvalidTimestamp {
                        digits: std::mem::take(&mut self.digits),
                        offset,
                    }
                })?;
                self.current_ms = Some(timestamp_ms);
                self.body.clear();
                self.state = State::Body;
                Ok(None)
            }
            (_, TAG_CLOSE) => Err(DecodeError::StrayTagClose { offset }),
            (State::ReadingTimestamp, c) => {
                self.digits.push(c);
                Ok(None)
            }
            (State::Body, c) => {
                self.body.push(c);
                Ok(None)
            }
            (State::Seeking, _) => Ok(None),
        }
    }

    /// Emits the trailing entry when its body is non-empty. A tag cut off
    /// by end of input is discarded.
    pub fn finish(mut self) -> Option<LogEntry> {
        if self.state == State::Body && !self.body.is_empty() {
            return self.take_entry();
        }
        None
    }

    fn open_tag(&mut self) {
        self.digits.clear();
        self.state = State::ReadingTimestamp;
    }

    fn take_entry(&mut self) -> Option<LogEntry> {
        let timestamp_ms = self.current_ms?;
        Some(LogEntry::new(timestamp_ms, std::mem::take(&mut self.body)))
    }
}

fn parse_timestamp(digits: &str) -> Option<i64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok()
}

pub fn decode(input: &str) -> Result<Vec<LogEntry>, DecodeError> {
    let mut decoder = Decoder::new();
    let mut entries = Vec::new();
    for c in input.chars() {
        if let Some(entry) = decoder.push(c)? {
            entries.push(entry);
        }
    }
    entries.extend(decoder.finish());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_tag_with_sentinels() {
        assert_eq!(encode_tag(1000), "\u{1}1000\u{2}");
        assert_eq!(encode_tag(0), "\u{1}0\u{2}");
    }

    #[test]
    fn body_belongs_to_preceding_tag() {
        let entries = decode("\u{1}0\u{2}hi\u{1}1000\u{2}").unwrap();
        assert_eq!(entries, vec![LogEntry::new(0, "hi")]);
    }

    #[test]
    fn trailing_body_without_closing_tag_is_emitted() {
        let entries = decode("\u{1}5\u{2}ab\u{1}7\u{2}cd").unwrap();
        assert_eq!(entries, vec![LogEntry::new(5, "ab"), LogEntry::new(7, "cd")]);
    }

    #[test]
    fn text_before_first_tag_is_discarded() {
        let entries = decode("junk\u{1}42\u{2}kept").unwrap();
        assert_eq!(entries, vec![LogEntry::new(42, "kept")]);
    }

    #[test]
    fn back_to_back_tags_yield_empty_entry() {
        let entries = decode("\u{1}1\u{2}\u{1}2\u{2}x").unwrap();
        assert_eq!(entries, vec![LogEntry::new(1, ""), LogEntry::new(2, "x")]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(decode("").unwrap().is_empty());
        assert!(decode("no tags at all").unwrap().is_empty());
    }

    #[test]
    fn truncated_tag_at_end_is_dropped() {
        let entries = decode("\u{1}1\u{2}a\u{1}12").unwrap();
        assert_eq!(entries, vec![LogEntry::new(1, "a")]);
    }

    #[test]
    fn non_digit_timestamp_aborts() {
        let err = decode("\u{1}1\u{2}ok\u{1}12x4\u{2}more").unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidTimestamp {
                digits: "12x4".to_string(),
                offset: 10,
            }
        );
    }

    #[test]
    fn empty_and_signed_timestamps_are_rejected() {
        assert!(matches!(
            decode("\u{1}\u{2}a"),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
        assert!(matches!(
            decode("\u{1}-5\u{2}a"),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
        assert!(matches!(
            decode("\u{1}99999999999999999999\u{2}a"),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn reopened_tag_is_malformed() {
        assert!(matches!(
            decode("\u{1}12\u{1}34\u{2}a"),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn stray_tag_close_is_malformed() {
        assert_eq!(
            decode("\u{1}1\u{2}a\u{2}b"),
            Err(DecodeError::StrayTagClose { offset: 4 })
        );
    }

    #[test]
    fn window_check_is_strict_half_width() {
        let entry = LogEntry::new(1075, "");
        assert!(!entry.within(1000, 150));
        assert!(LogEntry::new(1074, "").within(1000, 150));
        assert!(LogEntry::new(926, "").within(1000, 150));
        assert!(!LogEntry::new(925, "").within(1000, 150));
    }
}
