use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;

use crate::format::FileFormat;
use crate::schema::ColumnType;

/// Fixed-scale decimal stored as an integer count of `10^-scale` units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Decimal {
    units: i64,
    scale: u8,
}

impl Decimal {
    pub fn new(units: i64, scale: u8) -> Self {
        Self { units, scale }
    }

    pub fn units(&self) -> i64 {
        self.units
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// Parses a plain decimal literal, rounding half away from zero to `scale` digits.
    pub fn parse(raw: &str, scale: u8) -> Result<Self, String> {
        let text = raw.trim();
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));

        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part)
        {
            return Err(format!("'{raw}' is not a decimal number"));
        }

        let scale_digits = usize::from(scale);
        let mut kept: String = frac_part.chars().take(scale_digits).collect();
        while kept.len() < scale_digits {
            kept.push('0');
        }
        let round_up = frac_part
            .chars()
            .nth(scale_digits)
            .is_some_and(|digit| digit >= '5');

        let overflow = || format!("'{raw}' does not fit NUMBER(38, {scale})");
        let mut units: i64 = 0;
        for ch in int_part.chars().chain(kept.chars()) {
            let digit = i64::from(ch as u8 - b'0');
            units = units
                .checked_mul(10)
                .and_then(|value| value.checked_add(digit))
                .ok_or_else(overflow)?;
        }
        if round_up {
            units = units.checked_add(1).ok_or_else(overflow)?;
        }

        Ok(Self {
            units: if negative { -units } else { units },
            scale,
        })
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.units < 0 { "-" } else { "" };
        let magnitude = self.units.unsigned_abs();
        if self.scale == 0 {
            return write!(f, "{sign}{magnitude}");
        }
        let factor = 10u64.pow(u32::from(self.scale));
        write!(
            f,
            "{sign}{}.{:0width$}",
            magnitude / factor,
            magnitude % factor,
            width = usize::from(self.scale)
        )
    }
}

impl Serialize for Decimal {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Decimal(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
    Text(String),
}

impl Value {
    /// Converts one raw field. Empty fields load as NULL regardless of type.
    pub fn parse(raw: &str, ty: ColumnType, format: &FileFormat) -> Result<Self, String> {
        if raw.is_empty() {
            return Ok(Value::Null);
        }

        match ty {
            ColumnType::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| format!("'{raw}' is not an integer")),
            ColumnType::Decimal { scale } => Decimal::parse(raw, scale).map(Value::Decimal),
            ColumnType::Date => format.date_format.parse(raw.trim()).map(Value::Date),
            ColumnType::Time => format.time_format.parse(raw.trim()).map(Value::Time),
            ColumnType::Text => Ok(Value::Text(raw.to_string())),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Decimal(value) => write!(f, "{value}"),
            Value::Date(value) => write!(f, "{}", value.format("%Y-%m-%d")),
            Value::Time(value) => write!(f, "{}", value.format("%H:%M:%S")),
            Value::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub line: u64,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct ParsedBatch {
    pub columns: Vec<&'static str>,
    pub rows: Vec<RawRow>,
}

impl ParsedBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
