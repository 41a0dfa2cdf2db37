use chrono::{NaiveDate, NaiveTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFormat {
    DayMonthYear,
    Auto,
}

impl DateFormat {
    pub fn sql(&self) -> &'static str {
        match self {
            DateFormat::DayMonthYear => "'DD/MM/YYYY'",
            DateFormat::Auto => "AUTO",
        }
    }

    pub fn parse(&self, raw: &str) -> Result<NaiveDate, String> {
        let patterns: &[&str] = match self {
            DateFormat::DayMonthYear => &["%d/%m/%Y"],
            DateFormat::Auto => &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y"],
        };
        patterns
            .iter()
            .find_map(|pattern| NaiveDate::parse_from_str(raw, pattern).ok())
            .ok_or_else(|| format!("'{raw}' is not a date in format {}", self.sql()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFormat {
    Auto,
}

impl TimeFormat {
    pub fn sql(&self) -> &'static str {
        match self {
            TimeFormat::Auto => "AUTO",
        }
    }

    pub fn parse(&self, raw: &str) -> Result<NaiveTime, String> {
        ["%H:%M:%S", "%H:%M:%S%.f", "%H:%M"]
            .iter()
            .find_map(|pattern| NaiveTime::parse_from_str(raw, pattern).ok())
            .ok_or_else(|| format!("'{raw}' is not a time of day"))
    }
}

/// Parse specification for delimited batch files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFormat {
    pub field_delimiter: u8,
    pub skip_header: usize,
    pub trim_space: bool,
    pub field_optionally_enclosed_by: Option<u8>,
    pub replace_invalid_characters: bool,
    pub date_format: DateFormat,
    pub time_format: TimeFormat,
}

pub const CAFE_FILE_FORMAT: FileFormat = FileFormat {
    field_delimiter: b';',
    skip_header: 1,
    trim_space: true,
    field_optionally_enclosed_by: Some(b'"'),
    replace_invalid_characters: true,
    date_format: DateFormat::DayMonthYear,
    time_format: TimeFormat::Auto,
};

impl Default for FileFormat {
    fn default() -> Self {
        CAFE_FILE_FORMAT
    }
}
