//! Five-field cron expressions and the time-matching rule used by the scheduler.
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each field is a
//! comma-separated list of terms:
//!
//! | Term    | Matches                                                   |
//! |---------|-----------------------------------------------------------|
//! | `*`     | any value                                                 |
//! | `n`     | exactly `n`                                               |
//! | `a-b`   | `a <= v <= b`                                             |
//! | `*/n`   | `v % n == 0`                                              |
//! | `a/n`   | `v >= a` and `(v - a) % n == 0` (reachable from `a`)      |
//! | `a-b/n` | as `a/n`, and `v <= b`                                    |
//!
//! A timestamp matches when every field matches. Day-of-month and day-of-week
//! are combined with AND, not the OR some cron dialects use. Day-of-week runs
//! 0-6 with 0 = Sunday.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Timelike};
use tracing::warn;

use crate::error::CronError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
  Minute,
  Hour,
  DayOfMonth,
  Month,
  DayOfWeek,
}

impl FieldKind {
  const ALL: [FieldKind; 5] = [
    FieldKind::Minute,
    FieldKind::Hour,
    FieldKind::DayOfMonth,
    FieldKind::Month,
    FieldKind::DayOfWeek,
  ];

  fn name(self) -> &'static str {
    match self {
      FieldKind::Minute => "minute",
      FieldKind::Hour => "hour",
      FieldKind::DayOfMonth => "day-of-month",
      FieldKind::Month => "month",
      FieldKind::DayOfWeek => "day-of-week",
    }
  }

  fn bounds(self) -> (u32, u32) {
    match self {
      FieldKind::Minute => (0, 59),
      FieldKind::Hour => (0, 23),
      FieldKind::DayOfMonth => (1, 31),
      FieldKind::Month => (1, 12),
      FieldKind::DayOfWeek => (0, 6),
    }
  }

  fn value_of<T: Datelike + Timelike>(self, timestamp: &T) -> u32 {
    match self {
      FieldKind::Minute => timestamp.minute(),
      FieldKind::Hour => timestamp.hour(),
      FieldKind::DayOfMonth => timestamp.day(),
      FieldKind::Month => timestamp.month(),
      FieldKind::DayOfWeek => timestamp.weekday().num_days_from_sunday(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
  Any,
  Value(u32),
  Range(u32, u32),
  EveryNth(u32),
  Stepped {
    start: u32,
    end: Option<u32>,
    step: u32,
  },
}

impl Term {
  fn matches(&self, value: u32) -> bool {
    match *self {
      Term::Any => true,
      Term::Value(v) => v == value,
      Term::Range(start, end) => start <= value && value <= end,
      Term::EveryNth(step) => value % step == 0,
      Term::Stepped { start, end, step } => {
        value >= start && end.map_or(true, |end| value <= end) && (value - start) % step == 0
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
  kind: FieldKind,
  terms: Vec<Term>,
}

impl Field {
  fn parse(kind: FieldKind, text: &str) -> Result<Self, CronError> {
    let terms = text
      .split(',')
      .map(|term| parse_term(kind, term))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self { kind, terms })
  }

  fn matches(&self, value: u32) -> bool {
    self.terms.iter().any(|term| term.matches(value))
  }
}

fn parse_term(kind: FieldKind, text: &str) -> Result<Term, CronError> {
  if text == "*" {
    return Ok(Term::Any);
  }

  if let Some((base, step)) = text.split_once('/') {
    let step = parse_number(kind, step)?;
    if step == 0 {
      return Err(CronError::ZeroStep { field: kind.name() });
    }
    if base == "*" {
      return Ok(Term::EveryNth(step));
    }
    return match base.split_once('-') {
      Some((start, end)) => {
        let (start, end) = parse_range(kind, start, end)?;
        Ok(Term::Stepped {
          start,
          end: Some(end),
          step,
        })
      }
      None => Ok(Term::Stepped {
        start: parse_bounded(kind, base)?,
        end: None,
        step,
      }),
    };
  }

  if let Some((start, end)) = text.split_once('-') {
    let (start, end) = parse_range(kind, start, end)?;
    return Ok(Term::Range(start, end));
  }

  Ok(Term::Value(parse_bounded(kind, text)?))
}

fn parse_range(kind: FieldKind, start: &str, end: &str) -> Result<(u32, u32), CronError> {
  let start = parse_bounded(kind, start)?;
  let end = parse_bounded(kind, end)?;
  if start > end {
    return Err(CronError::InvalidRange {
      field: kind.name(),
      start,
      end,
    });
  }
  Ok((start, end))
}

fn parse_bounded(kind: FieldKind, text: &str) -> Result<u32, CronError> {
  let value = parse_number(kind, text)?;
  let (min, max) = kind.bounds();
  if value < min || value > max {
    return Err(CronError::OutOfRange {
      field: kind.name(),
      value,
      min,
      max,
    });
  }
  Ok(value)
}

fn parse_number(kind: FieldKind, text: &str) -> Result<u32, CronError> {
  text.parse::<u32>().map_err(|_| CronError::InvalidNumber {
    field: kind.name(),
    value: text.to_string(),
  })
}

/// A parsed, validated cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
  source: String,
  fields: Vec<Field>,
}

impl CronExpr {
  /// Parses a 5-field expression. Fields are separated by any whitespace.
  pub fn parse(expression: &str) -> Result<Self, CronError> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != FieldKind::ALL.len() {
      return Err(CronError::FieldCount(parts.len()));
    }

    let fields = FieldKind::ALL
      .iter()
      .zip(parts)
      .map(|(kind, text)| Field::parse(*kind, text))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(Self {
      source: parts_to_source(expression),
      fields,
    })
  }

  /// Returns `true` when every field matches the corresponding component of
  /// `timestamp`. Seconds and sub-second precision are ignored.
  pub fn matches<T: Datelike + Timelike>(&self, timestamp: &T) -> bool {
    self
      .fields
      .iter()
      .all(|field| field.matches(field.kind.value_of(timestamp)))
  }

  /// The expression text, with whitespace normalized to single spaces.
  pub fn as_str(&self) -> &str {
    &self.source
  }
}

fn parts_to_source(expression: &str) -> String {
  expression.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl FromStr for CronExpr {
  type Err = CronError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    CronExpr::parse(s)
  }
}

impl fmt::Display for CronExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

/// Parses `expression` and checks it against `timestamp`.
///
/// An expression that fails to parse never matches; the parse error is logged.
/// Callers evaluating the same expression repeatedly should parse once with
/// [`CronExpr::parse`] instead.
pub fn matches<T: Datelike + Timelike>(expression: &str, timestamp: &T) -> bool {
  match CronExpr::parse(expression) {
    Ok(expr) => expr.matches(timestamp),
    Err(e) => {
      warn!(%expression, error = %e, "Failed to parse cron expression.");
      false
    }
  }
}
