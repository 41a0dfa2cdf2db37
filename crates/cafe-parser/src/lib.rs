pub mod errors;
pub mod format;
pub mod model;
mod reader;
pub mod schema;

pub use errors::ParserError;
pub use format::{DateFormat, FileFormat, TimeFormat, CAFE_FILE_FORMAT};
pub use model::{Decimal, ParsedBatch, RawRow, Value};
pub use reader::{check_header, parse_batch, HeaderCheck};
pub use schema::{normalize_header, raw_column, validate_columns, ColumnSpec, ColumnType, RAW_COLUMNS};
