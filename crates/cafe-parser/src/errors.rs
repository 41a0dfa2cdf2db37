use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("invalid column descriptor: {message}")]
    Schema { message: String },

    #[error("file is not valid UTF-8 (first invalid byte at offset {offset})")]
    Encoding { offset: usize },

    #[error("CSV error: {source}")]
    Csv {
        #[source]
        source: csv::Error,
    },

    #[error("file has no header row")]
    MissingHeader,

    #[error("header has {found} columns but the descriptor expects {expected}")]
    HeaderMismatch { expected: usize, found: usize },

    #[error("line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("line {line}, column {column}: {message}")]
    DataRow {
        line: u64,
        column: &'static str,
        message: String,
    },
}

impl ParserError {
    /// Source line of the offending record, when the error is tied to one.
    pub fn line(&self) -> Option<u64> {
        match self {
            ParserError::FieldCount { line, .. } | ParserError::DataRow { line, .. } => Some(*line),
            ParserError::Csv { source } => source.position().map(|pos| pos.line()),
            _ => None,
        }
    }
}
