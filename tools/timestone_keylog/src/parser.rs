use crate::codec::{decode, LogEntry};
use crate::error::{DecodeError, LoadError};
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

/// Read-only snapshot of a tagged log file, taken at load time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogParser {
    entries: Vec<LogEntry>,
}

impl FromStr for LogParser {
    type Err = DecodeError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            entries: decode(content)?,
        })
    }
}

impl LogParser {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        String::from_utf8_lossy(&bytes)
            .parse::<Self>()
            .map_err(|source| LoadError::Decode {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entire_log(&self) -> String {
        self.entries.iter().map(|entry| entry.text.as_str()).collect()
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.entries.first().map(|entry| entry.timestamp_ms)
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.entries.last().map(|entry| entry.timestamp_ms)
    }

    pub fn time_span(&self) -> Option<(i64, i64)> {
        Some((self.first_timestamp()?, self.last_timestamp()?))
    }

    /// Text of every entry strictly within `window_ms / 2` of `center_ms`.
    /// `None` when nothing qualifies, `Some("")` when only empty entries do.
    pub fn relevant_text(&self, center_ms: i64, window_ms: u64) -> Option<String> {
        let mut matched = false;
        let mut text = String::new();
        for entry in self.entries.iter().filter(|entry| entry.within(center_ms, window_ms)) {
            matched = true;
            text.push_str(&entry.text);
        }
        matched.then_some(text)
    }

    /// Char range in [`LogParser::entire_log`] covered by the first run of
    /// consecutive qualifying entries. Later runs are not reported; see
    /// [`LogParser::relevant_ranges`].
    pub fn relevant_range(&self, center_ms: i64, window_ms: u64) -> Option<Range<usize>> {
        let mut offset = 0;
        let mut start = None;
        for entry in &self.entries {
            match (start, entry.within(center_ms, window_ms)) {
                (None, true) => start = Some(offset),
                (Some(start), false) => return Some(start..offset),
                _ => {}
            }
            offset += entry.text.chars().count();
        }
        start.map(|start| start..offset)
    }

    /// Every maximal run of consecutive qualifying entries, in log order.
    pub fn relevant_ranges(&self, center_ms: i64, window_ms: u64) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut offset = 0;
        let mut start = None;
        for entry in &self.entries {
            match (start, entry.within(center_ms, window_ms)) {
                (None, true) => start = Some(offset),
                (Some(run_start), false) => {
                    ranges.push(run_start..offset);
                    start = None;
                }
                _ => {}
            }
            offset += entry.text.chars().count();
        }
        ranges.extend(start.map(|start| start..offset));
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(entries: &[(i64, &str)]) -> LogParser {
        LogParser::from_entries(
            entries
                .iter()
                .map(|(ts, text)| LogEntry::new(*ts, *text))
                .collect(),
        )
    }

    #[test]
    fn empty_log_has_no_timestamps() {
        let log: LogParser = "".parse().unwrap();
        assert!(log.is_empty());
        assert_eq!(log.entire_log(), "");
        assert_eq!(log.first_timestamp(), None);
        assert_eq!(log.last_timestamp(), None);
        assert_eq!(log.time_span(), None);
        assert_eq!(log.relevant_text(0, 1000), None);
        assert_eq!(log.relevant_range(0, 1000), None);
    }

    #[test]
    fn entire_log_concatenates_in_order() {
        let log: LogParser = "\u{1}10\u{2}ab\u{1}20\u{2}cd\u{1}30\u{2}e".parse().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.entire_log(), "abcde");
        assert_eq!(log.entire_log(), "abcde");
        assert_eq!(log.time_span(), Some((10, 30)));
    }

    #[test]
    fn window_includes_only_strictly_inside_entries() {
        let t = 1_000_000;
        let log = parser(&[(t - 100, "before"), (t, "now"), (t + 100, "after")]);
        assert_eq!(log.relevant_text(t, 150).as_deref(), Some("now"));
        // |diff| == window / 2 is excluded
        assert_eq!(log.relevant_text(t, 200).as_deref(), Some("now"));
        assert_eq!(
            log.relevant_text(t, 202).as_deref(),
            Some("beforenowafter")
        );
        assert_eq!(log.relevant_text(t + 10_000, 150), None);
    }

    #[test]
    fn empty_match_differs_from_no_match() {
        let log = parser(&[(5, ""), (500, "x")]);
        assert_eq!(log.relevant_text(5, 10).as_deref(), Some(""));
        assert_eq!(log.relevant_text(250, 10), None);
    }

    #[test]
    fn range_covers_first_contiguous_run() {
        let log = parser(&[(0, "aa"), (100, "bbb"), (110, "c"), (500, "dd"), (105, "ee")]);
        assert_eq!(log.entire_log(), "aabbbcddee");
        assert_eq!(log.relevant_range(105, 40), Some(2..6));
        assert_eq!(&log.entire_log()[2..6], "bbbc");
    }

    #[test]
    fn range_misses_later_runs() {
        let log = parser(&[(0, "aa"), (100, "bbb"), (500, "dd"), (101, "ee")]);
        assert_eq!(log.relevant_range(100, 20), Some(2..5));
        assert_eq!(log.relevant_ranges(100, 20), vec![2..5, 7..9]);
    }

    #[test]
    fn range_run_may_end_at_last_entry() {
        let log = parser(&[(0, "aa"), (100, "bbb")]);
        assert_eq!(log.relevant_range(100, 20), Some(2..5));
        assert_eq!(log.relevant_ranges(100, 20), vec![2..5]);
    }

    #[test]
    fn range_offsets_count_chars() {
        let log = parser(&[(0, "héé"), (100, "ü")]);
        assert_eq!(log.relevant_range(100, 20), Some(3..4));
    }

    #[test]
    fn missing_file_is_reported_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = LogParser::load(dir.path().join("nope.dat")).unwrap_err();
        assert!(err.is_missing());
    }

    #[test]
    fn corrupt_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.dat");
        fs::write(&path, "\u{1}1\u{2}ok\u{1}zz\u{2}more").unwrap();
        let err = LogParser::load(&path).unwrap_err();
        assert!(!err.is_missing());
        assert!(matches!(
            err,
            LoadError::Decode {
                source: DecodeError::InvalidTimestamp { .. },
                ..
            }
        ));
    }
}
