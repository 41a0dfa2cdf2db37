use std::borrow::Cow;

use csv::{ReaderBuilder, StringRecord, Trim};

use crate::errors::ParserError;
use crate::format::FileFormat;
use crate::model::{ParsedBatch, RawRow, Value};
use crate::schema::{normalize_header, validate_columns, ColumnSpec};

/// Outcome of comparing a file's header row with a column descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderCheck {
    /// `(field position, header text, expected column)` for every renamed field.
    pub renamed: Vec<(usize, String, &'static str)>,
}

impl HeaderCheck {
    pub fn is_exact(&self) -> bool {
        self.renamed.is_empty()
    }
}

/// Parses a whole batch file. The first bad record aborts the parse, so the
/// caller either gets every row or none.
pub fn parse_batch(
    contents: &[u8],
    format: &FileFormat,
    columns: &[ColumnSpec],
) -> Result<ParsedBatch, ParserError> {
    validate_columns(columns)?;
    let text = decode(contents, format)?;
    let mut reader = reader_for(&text, format);

    let mut rows = Vec::new();
    let mut record = StringRecord::new();
    let mut index = 0usize;

    while reader
        .read_record(&mut record)
        .map_err(|source| ParserError::Csv { source })?
    {
        index += 1;
        if index <= format.skip_header {
            continue;
        }

        let line = record
            .position()
            .map(|pos| pos.line())
            .unwrap_or(index as u64);

        if record.len() != columns.len() {
            return Err(ParserError::FieldCount {
                line,
                expected: columns.len(),
                found: record.len(),
            });
        }

        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            let raw = record.get(column.position - 1).unwrap_or_default();
            let value = Value::parse(raw, column.ty, format).map_err(|message| {
                ParserError::DataRow {
                    line,
                    column: column.name,
                    message,
                }
            })?;
            values.push(value);
        }

        rows.push(RawRow { line, values });
    }

    Ok(ParsedBatch {
        columns: columns.iter().map(|column| column.name).collect(),
        rows,
    })
}

/// Compares the header row against the descriptor. A different field count
/// is an error; differently named fields are reported but tolerated since
/// the mapping is positional.
pub fn check_header(
    contents: &[u8],
    format: &FileFormat,
    columns: &[ColumnSpec],
) -> Result<HeaderCheck, ParserError> {
    validate_columns(columns)?;
    let text = decode(contents, format)?;
    let mut reader = reader_for(&text, format);

    let mut header = StringRecord::new();
    if !reader
        .read_record(&mut header)
        .map_err(|source| ParserError::Csv { source })?
    {
        return Err(ParserError::MissingHeader);
    }

    if header.len() != columns.len() {
        return Err(ParserError::HeaderMismatch {
            expected: columns.len(),
            found: header.len(),
        });
    }

    let mut check = HeaderCheck::default();
    for column in columns {
        let cell = header.get(column.position - 1).unwrap_or_default();
        if normalize_header(cell) != column.name {
            check
                .renamed
                .push((column.position, cell.to_string(), column.name));
        }
    }

    Ok(check)
}

fn decode<'a>(contents: &'a [u8], format: &FileFormat) -> Result<Cow<'a, str>, ParserError> {
    let contents = contents
        .strip_prefix("\u{feff}".as_bytes())
        .unwrap_or(contents);

    if format.replace_invalid_characters {
        return Ok(String::from_utf8_lossy(contents));
    }

    std::str::from_utf8(contents)
        .map(Cow::Borrowed)
        .map_err(|err| ParserError::Encoding {
            offset: err.valid_up_to(),
        })
}

fn reader_for<'a>(text: &'a str, format: &FileFormat) -> csv::Reader<&'a [u8]> {
    let mut builder = ReaderBuilder::new();
    builder
        .delimiter(format.field_delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(if format.trim_space { Trim::All } else { Trim::None });

    match format.field_optionally_enclosed_by {
        Some(quote) => {
            builder.quoting(true).quote(quote);
        }
        None => {
            builder.quoting(false);
        }
    }

    builder.from_reader(text.as_bytes())
}
