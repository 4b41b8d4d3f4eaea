//! Stream record identifiers and read cursors.
//!
//! A record id is `<millisecond-timestamp>-<sequence>`. Ids are totally
//! ordered (timestamp first, then sequence) and the timestamp half is the
//! record's creation time, which is what retention decisions are based on.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// Identifier of a record inside a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RecordId {
    millis: u64,
    seq: u64,
}

impl RecordId {
    /// The smallest possible id (`0-0`).
    pub const MIN: RecordId = RecordId { millis: 0, seq: 0 };

    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// First id at the given millisecond (`<ms>-0`).
    pub const fn at_millis(millis: u64) -> Self {
        Self { millis, seq: 0 }
    }

    /// Creation time embedded in the id, in unix milliseconds.
    pub fn timestamp_ms(&self) -> u64 {
        self.millis
    }

    /// Age of the record relative to `now_ms`. Ids from the future have age 0.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.millis)
    }

    /// The id immediately following this one.
    pub fn successor(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { millis: self.millis, seq },
            None => Self {
                millis: self.millis.saturating_add(1),
                seq: 0,
            },
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for RecordId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, Some(seq)),
            None => (s, None),
        };

        let millis = millis
            .parse::<u64>()
            .map_err(|e| CoreError::invalid_id(format!("{s}: {e}")))?;
        let seq = match seq {
            Some(seq) => seq
                .parse::<u64>()
                .map_err(|e| CoreError::invalid_id(format!("{s}: {e}")))?,
            None => 0,
        };

        Ok(Self { millis, seq })
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Position a raw (non-group) reader resumes from.
///
/// Cursors only move forward: see [`Cursor::advance`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Cursor {
    /// Only records appended after the read is issued (`$`).
    #[default]
    Latest,
    /// Records strictly after the given id.
    After(RecordId),
}

impl Cursor {
    /// Start from the beginning of the stream.
    pub const fn beginning() -> Self {
        Cursor::After(RecordId::MIN)
    }

    /// Move the cursor to `id`.
    ///
    /// Returns `false` (and leaves the cursor untouched) if `id` is at or
    /// behind the current position.
    pub fn advance(&mut self, id: RecordId) -> bool {
        match self {
            Cursor::After(current) if id <= *current => false,
            _ => {
                *self = Cursor::After(id);
                true
            }
        }
    }

    pub fn last_id(&self) -> Option<RecordId> {
        match self {
            Cursor::Latest => None,
            Cursor::After(id) => Some(*id),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Latest => f.write_str("$"),
            Cursor::After(id) => fmt::Display::fmt(id, f),
        }
    }
}

impl FromStr for Cursor {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "$" | "" => Ok(Cursor::Latest),
            other => Ok(Cursor::After(other.parse()?)),
        }
    }
}

/// Wall clock in unix milliseconds.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_full_and_short_ids() {
        assert_eq!("1526919030474-55".parse::<RecordId>().unwrap(), RecordId::new(1526919030474, 55));
        assert_eq!("1526919030474".parse::<RecordId>().unwrap(), RecordId::at_millis(1526919030474));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(matches!("abc-1".parse::<RecordId>(), Err(CoreError::InvalidId(_))));
        assert!(matches!("1-x".parse::<RecordId>(), Err(CoreError::InvalidId(_))));
        assert!("".parse::<RecordId>().is_err());
    }

    #[test]
    fn age_saturates_for_future_ids() {
        let id = RecordId::at_millis(2_000);
        assert_eq!(id.age_ms(1_500), 0);
        assert_eq!(id.age_ms(2_750), 750);
    }

    #[test]
    fn cursor_only_moves_forward() {
        let mut cursor = Cursor::Latest;
        assert!(cursor.advance(RecordId::new(10, 1)));
        assert!(!cursor.advance(RecordId::new(10, 1)));
        assert!(!cursor.advance(RecordId::new(9, 7)));
        assert!(cursor.advance(RecordId::new(10, 2)));
        assert_eq!(cursor.last_id(), Some(RecordId::new(10, 2)));
    }

    #[test]
    fn cursor_text_form() {
        assert_eq!("$".parse::<Cursor>().unwrap(), Cursor::Latest);
        assert_eq!("5-1".parse::<Cursor>().unwrap(), Cursor::After(RecordId::new(5, 1)));
        assert_eq!(Cursor::beginning().to_string(), "0-0");
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&RecordId::new(7, 3)).unwrap();
        assert_eq!(json, "\"7-3\"");
        let back: RecordId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RecordId::new(7, 3));
    }

    proptest! {
        #[test]
        fn ordering_matches_numeric_pair(a in any::<(u64, u64)>(), b in any::<(u64, u64)>()) {
            let x = RecordId::new(a.0, a.1);
            let y = RecordId::new(b.0, b.1);
            prop_assert_eq!(x.cmp(&y), a.cmp(&b));
        }

        #[test]
        fn display_parses_back(millis in any::<u64>(), seq in any::<u64>()) {
            let id = RecordId::new(millis, seq);
            prop_assert_eq!(id.to_string().parse::<RecordId>().unwrap(), id);
        }

        #[test]
        fn successor_is_strictly_greater(millis in 0u64..u64::MAX, seq in any::<u64>()) {
            let id = RecordId::new(millis, seq);
            prop_assert!(id.successor() > id);
        }
    }
}
