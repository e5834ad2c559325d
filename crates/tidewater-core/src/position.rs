//! Resumable ingest positions.
//!
//! A position records how much of a source a dumper has consumed. It is
//! produced by the dumper, persisted by the job layer after each
//! committed batch, and reloaded on restart with [`IngestPosition::from_str`]
//! (textual form) or [`IngestPosition::from_json`] (structured form).
//! Both forms round-trip exactly.
//!
//! ## Textual form
//!
//! | Variant | Text |
//! |---|---|
//! | `Placeholder` | `placeholder` |
//! | `Finished` | `finished` |
//! | integer key range | `i,<begin>,<end>,<current>` |
//! | text key range | `s,'<begin>,'<end>,'<current>` (`,` and `\` escaped) |
//! | `Log` | `log,<marker>` |
//!
//! An absent bound is an empty field. Text keys carry a leading `'` so an
//! empty string key stays distinguishable from an absent one.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PositionError;
use crate::source::KeyBound;

/// A value of an orderable unique key.
///
/// Values only compare within the same variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum UniqueKeyValue {
    /// Any integer key, widened to 64 bits.
    Integer(i64),
    /// Character key.
    Text(String),
}

impl PartialOrd for UniqueKeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for UniqueKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Progress of a range scan over a unique key.
///
/// `begin` and `end` are inclusive bounds fixed when the job item is
/// created (`None` = unbounded). `current` is the last key handed to the
/// channel and only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrimaryKeyPosition {
    /// Inclusive lower bound of the scan.
    pub begin: Option<UniqueKeyValue>,
    /// Inclusive upper bound of the scan.
    pub end: Option<UniqueKeyValue>,
    /// Last key consumed, if any.
    pub current: Option<UniqueKeyValue>,
}

impl PrimaryKeyPosition {
    /// Creates a range position that has not consumed anything yet.
    #[must_use]
    pub fn new(begin: Option<UniqueKeyValue>, end: Option<UniqueKeyValue>) -> Self {
        Self {
            begin,
            end,
            current: None,
        }
    }

    /// Returns a copy of this range advanced to `key`.
    #[must_use]
    pub fn at(&self, key: UniqueKeyValue) -> Self {
        Self {
            begin: self.begin.clone(),
            end: self.end.clone(),
            current: Some(key),
        }
    }

    /// Moves `current` forward to `key`.
    ///
    /// Returns `false` (and leaves the position unchanged) if `key` would
    /// move it backwards or is not comparable with the current key.
    pub fn advance(&mut self, key: UniqueKeyValue) -> bool {
        let forward = match &self.current {
            None => true,
            Some(cur) => matches!(key.partial_cmp(cur), Some(Ordering::Greater | Ordering::Equal)),
        };
        if forward {
            self.current = Some(key);
        }
        forward
    }

    /// Lower bound for the next batch query.
    ///
    /// Inclusive at `begin` before anything was consumed, exclusive at
    /// `current` afterwards.
    #[must_use]
    pub fn lower_bound(&self) -> KeyBound {
        match (&self.current, &self.begin) {
            (Some(cur), _) => KeyBound::Exclusive(cur.clone()),
            (None, Some(begin)) => KeyBound::Inclusive(begin.clone()),
            (None, None) => KeyBound::Unbounded,
        }
    }

    /// The key variant used by this range, if any bound is set.
    fn is_text(&self) -> Option<bool> {
        [&self.begin, &self.end, &self.current]
            .into_iter()
            .flatten()
            .next()
            .map(|k| matches!(k, UniqueKeyValue::Text(_)))
    }

    fn same_range(&self, other: &Self) -> bool {
        self.begin == other.begin && self.end == other.end
    }
}

/// Opaque marker into a source change log (binlog file/offset, WAL LSN).
///
/// The marker format belongs to the dialect that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    /// Dialect-specific log marker.
    pub marker: String,
}

impl LogPosition {
    /// Creates a log position from a marker.
    #[must_use]
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

/// A resumable checkpoint for one dumper phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestPosition {
    /// No orderable key exists; the table is dumped in one unordered
    /// pass and cannot resume mid-way.
    Placeholder,
    /// Range scan over a unique key.
    PrimaryKeyRange(PrimaryKeyPosition),
    /// Change log offset for the incremental phase.
    Log(LogPosition),
    /// The phase completed. Terminal.
    Finished,
}

impl IngestPosition {
    /// Creates an unconsumed range position.
    #[must_use]
    pub fn range(begin: Option<UniqueKeyValue>, end: Option<UniqueKeyValue>) -> Self {
        Self::PrimaryKeyRange(PrimaryKeyPosition::new(begin, end))
    }

    /// Returns `true` for [`IngestPosition::Finished`].
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Returns `true` if a dumper restarted from this position continues
    /// where it left off instead of starting over.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::Placeholder)
    }

    /// Orders two positions by progress.
    ///
    /// Range positions are comparable when they share the same bounds;
    /// `Finished` is ahead of every other position. Anything else is
    /// incomparable and yields `None`.
    #[must_use]
    pub fn progress_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Finished, Self::Finished) | (Self::Placeholder, Self::Placeholder) => {
                Some(Ordering::Equal)
            }
            (Self::Finished, _) => Some(Ordering::Greater),
            (_, Self::Finished) => Some(Ordering::Less),
            (Self::PrimaryKeyRange(a), Self::PrimaryKeyRange(b)) if a.same_range(b) => {
                match (&a.current, &b.current) {
                    (None, None) => Some(Ordering::Equal),
                    (None, Some(_)) => Some(Ordering::Less),
                    (Some(_), None) => Some(Ordering::Greater),
                    (Some(x), Some(y)) => x.partial_cmp(y),
                }
            }
            (Self::Log(a), Self::Log(b)) if a == b => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Structured form of this position.
    ///
    /// # Errors
    ///
    /// Returns `PositionError::Json` if serialization fails.
    pub fn to_json(&self) -> Result<serde_json::Value, PositionError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes the structured form. Pure, no I/O.
    ///
    /// # Errors
    ///
    /// Returns `PositionError::Json` if the value is not a position.
    pub fn from_json(value: serde_json::Value) -> Result<Self, PositionError> {
        Ok(serde_json::from_value(value)?)
    }
}

impl fmt::Display for IngestPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Placeholder => f.write_str("placeholder"),
            Self::Finished => f.write_str("finished"),
            Self::Log(log) => write!(f, "log,{}", log.marker),
            Self::PrimaryKeyRange(range) => {
                let text = range.is_text().unwrap_or(false);
                f.write_str(if text { "s" } else { "i" })?;
                for key in [&range.begin, &range.end, &range.current] {
                    f.write_str(",")?;
                    match key {
                        None => {}
                        Some(UniqueKeyValue::Integer(v)) => write!(f, "{v}")?,
                        Some(UniqueKeyValue::Text(v)) => {
                            f.write_str("'")?;
                            f.write_str(&escape(v))?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

impl FromStr for IngestPosition {
    type Err = PositionError;

    /// Decodes the textual form. Pure, no I/O.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "placeholder" => return Ok(Self::Placeholder),
            "finished" => return Ok(Self::Finished),
            _ => {}
        }
        if let Some(marker) = s.strip_prefix("log,") {
            return Ok(Self::Log(LogPosition::new(marker)));
        }
        let (kind, rest) = s
            .split_once(',')
            .ok_or_else(|| PositionError::Unrecognized(s.to_string()))?;
        let fields = split_escaped(rest);
        if !(2..=3).contains(&fields.len()) {
            return Err(PositionError::Unrecognized(s.to_string()));
        }
        let parse: fn(&str) -> Result<Option<UniqueKeyValue>, PositionError> = match kind {
            "i" => parse_integer_key,
            "s" => parse_text_key,
            _ => return Err(PositionError::Unrecognized(s.to_string())),
        };
        let begin = parse(&fields[0])?;
        let end = parse(&fields[1])?;
        let current = match fields.get(2) {
            Some(field) => parse(field)?,
            None => None,
        };
        Ok(Self::PrimaryKeyRange(PrimaryKeyPosition {
            begin,
            end,
            current,
        }))
    }
}

fn parse_integer_key(field: &str) -> Result<Option<UniqueKeyValue>, PositionError> {
    if field.is_empty() {
        return Ok(None);
    }
    field
        .parse::<i64>()
        .map(|v| Some(UniqueKeyValue::Integer(v)))
        .map_err(|e| PositionError::InvalidKey {
            value: field.to_string(),
            message: e.to_string(),
        })
}

fn parse_text_key(field: &str) -> Result<Option<UniqueKeyValue>, PositionError> {
    if field.is_empty() {
        return Ok(None);
    }
    field
        .strip_prefix('\'')
        .map(|v| Some(UniqueKeyValue::Text(v.to_string())))
        .ok_or_else(|| PositionError::InvalidKey {
            value: field.to_string(),
            message: "text key must start with a quote".into(),
        })
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == ',' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Splits on unescaped commas and unescapes each field.
fn split_escaped(raw: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Option<UniqueKeyValue> {
        Some(UniqueKeyValue::Integer(v))
    }

    fn text(v: &str) -> Option<UniqueKeyValue> {
        Some(UniqueKeyValue::Text(v.to_string()))
    }

    #[test]
    fn test_textual_forms() {
        let mut range = PrimaryKeyPosition::new(int(1), int(10_000));
        assert_eq!(IngestPosition::PrimaryKeyRange(range.clone()).to_string(), "i,1,10000,");
        range.advance(UniqueKeyValue::Integer(1000));
        assert_eq!(IngestPosition::PrimaryKeyRange(range).to_string(), "i,1,10000,1000");
        assert_eq!(IngestPosition::Placeholder.to_string(), "placeholder");
        assert_eq!(IngestPosition::Finished.to_string(), "finished");
        assert_eq!(
            IngestPosition::Log(LogPosition::new("binlog.000003:154")).to_string(),
            "log,binlog.000003:154"
        );
    }

    #[test]
    fn test_text_keys_escape_separators() {
        let pos = IngestPosition::PrimaryKeyRange(PrimaryKeyPosition {
            begin: text(""),
            end: text("z,\\z"),
            current: None,
        });
        let rendered = pos.to_string();
        assert_eq!(rendered, "s,','z\\,\\\\z,");
        assert_eq!(rendered.parse::<IngestPosition>().unwrap(), pos);
    }

    #[test]
    fn test_parse_without_current_field() {
        let pos: IngestPosition = "i,1,10000".parse().unwrap();
        assert_eq!(pos, IngestPosition::range(int(1), int(10_000)));
    }

    #[test]
    fn test_unbounded_range_round_trips() {
        let pos = IngestPosition::range(None, None);
        assert_eq!(pos.to_string(), "i,,,");
        assert_eq!("i,,,".parse::<IngestPosition>().unwrap(), pos);
    }

    #[test]
    fn test_log_marker_may_contain_commas() {
        let pos: IngestPosition = "log,uuid:1-5,uuid2:1-9".parse().unwrap();
        assert_eq!(pos, IngestPosition::Log(LogPosition::new("uuid:1-5,uuid2:1-9")));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("".parse::<IngestPosition>().is_err());
        assert!("x,1,2".parse::<IngestPosition>().is_err());
        assert!("i,1".parse::<IngestPosition>().is_err());
        assert!(matches!(
            "i,a,2".parse::<IngestPosition>(),
            Err(PositionError::InvalidKey { .. })
        ));
        assert!("s,a,'b".parse::<IngestPosition>().is_err());
    }

    #[test]
    fn test_structured_form() {
        let pos = IngestPosition::PrimaryKeyRange(PrimaryKeyPosition {
            begin: int(1),
            end: int(100),
            current: int(50),
        });
        let json = pos.to_json().unwrap();
        assert_eq!(json["type"], "primary_key_range");
        assert_eq!(json["current"]["value"], 50);
        assert_eq!(IngestPosition::from_json(json).unwrap(), pos);

        let finished = IngestPosition::Finished.to_json().unwrap();
        assert_eq!(finished, serde_json::json!({"type": "finished"}));
    }

    #[test]
    fn test_lower_bound_switches_to_exclusive() {
        let mut range = PrimaryKeyPosition::new(int(1), int(10));
        assert_eq!(range.lower_bound(), KeyBound::Inclusive(UniqueKeyValue::Integer(1)));
        range.advance(UniqueKeyValue::Integer(5));
        assert_eq!(range.lower_bound(), KeyBound::Exclusive(UniqueKeyValue::Integer(5)));
        assert_eq!(PrimaryKeyPosition::default().lower_bound(), KeyBound::Unbounded);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut range = PrimaryKeyPosition::new(int(1), int(10));
        assert!(range.advance(UniqueKeyValue::Integer(5)));
        assert!(!range.advance(UniqueKeyValue::Integer(4)));
        assert!(!range.advance(UniqueKeyValue::Text("9".into())));
        assert_eq!(range.current, int(5));
    }

    #[test]
    fn test_progress_ordering() {
        let base = PrimaryKeyPosition::new(int(1), int(10));
        let a = IngestPosition::PrimaryKeyRange(base.at(UniqueKeyValue::Integer(3)));
        let b = IngestPosition::PrimaryKeyRange(base.at(UniqueKeyValue::Integer(7)));
        let fresh = IngestPosition::PrimaryKeyRange(base);
        assert_eq!(a.progress_cmp(&b), Some(Ordering::Less));
        assert_eq!(fresh.progress_cmp(&a), Some(Ordering::Less));
        assert_eq!(b.progress_cmp(&IngestPosition::Finished), Some(Ordering::Less));

        let other_range = IngestPosition::range(int(11), int(20));
        assert_eq!(a.progress_cmp(&other_range), None);
        assert_eq!(a.progress_cmp(&IngestPosition::Placeholder), None);
    }

    #[test]
    fn test_placeholder_is_not_resumable() {
        assert!(!IngestPosition::Placeholder.is_resumable());
        assert!(IngestPosition::range(None, None).is_resumable());
    }
}
