use std::collections::HashSet;
use std::fmt;

use crate::errors::ParserError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Decimal { scale: u8 },
    Date,
    Time,
    Text,
}

impl ColumnType {
    /// Warehouse type used in DDL for this column.
    pub fn sql_type(&self) -> String {
        match self {
            ColumnType::Integer => "NUMBER(38, 0)".to_string(),
            ColumnType::Decimal { scale } => format!("NUMBER(38, {scale})"),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::Text => "VARCHAR".to_string(),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_type())
    }
}

/// One raw-table column and the 1-based field of the source file it is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    pub position: usize,
}

const fn column(name: &'static str, ty: ColumnType, position: usize) -> ColumnSpec {
    ColumnSpec { name, ty, position }
}

const PRICE: ColumnType = ColumnType::Decimal { scale: 1 };

/// The raw landing table, in DDL order.
pub const RAW_COLUMNS: [ColumnSpec; 18] = [
    column("TRANSACTION_ID", ColumnType::Integer, 1),
    column("TRANSACTION_DATE", ColumnType::Date, 2),
    column("TRANSACTION_TIME", ColumnType::Time, 3),
    column("STORE_ID", ColumnType::Integer, 4),
    column("STORE_LOCATION", ColumnType::Text, 5),
    column("PRODUCT_ID", ColumnType::Integer, 6),
    column("TRANSACTION_QTY", ColumnType::Integer, 7),
    column("UNIT_PRICE", PRICE, 8),
    column("PRODUCT_CATEGORY", ColumnType::Text, 9),
    column("PRODUCT_TYPE", ColumnType::Text, 10),
    column("PRODUCT_DETAIL", ColumnType::Text, 11),
    column("SIZE", ColumnType::Text, 12),
    column("TOTAL_BILL", PRICE, 13),
    column("MONTH_NAME", ColumnType::Text, 14),
    column("DAY_NAME", ColumnType::Text, 15),
    column("HOUR", ColumnType::Integer, 16),
    column("DAY_OF_WEEK", ColumnType::Integer, 17),
    column("MONTH", ColumnType::Integer, 18),
];

pub fn raw_column(name: &str) -> Option<&'static ColumnSpec> {
    RAW_COLUMNS
        .iter()
        .find(|column| column.name.eq_ignore_ascii_case(name))
}

/// Checks that a descriptor is loadable: unique non-empty names and source
/// positions forming a permutation of `1..=len`.
pub fn validate_columns(columns: &[ColumnSpec]) -> Result<(), ParserError> {
    if columns.is_empty() {
        return Err(schema_error("descriptor has no columns"));
    }

    let mut names = HashSet::with_capacity(columns.len());
    let mut positions = HashSet::with_capacity(columns.len());

    for column in columns {
        if column.name.trim().is_empty() {
            return Err(schema_error("column name cannot be empty"));
        }
        if !names.insert(column.name.to_ascii_uppercase()) {
            return Err(schema_error(format!("duplicate column {}", column.name)));
        }
        if column.position == 0 || column.position > columns.len() {
            return Err(schema_error(format!(
                "column {} maps to field {} outside 1..={}",
                column.name,
                column.position,
                columns.len()
            )));
        }
        if !positions.insert(column.position) {
            return Err(schema_error(format!(
                "field {} is mapped more than once",
                column.position
            )));
        }
        if let ColumnType::Decimal { scale } = column.ty {
            if scale > 18 {
                return Err(schema_error(format!(
                    "column {} has unsupported scale {scale}",
                    column.name
                )));
            }
        }
    }

    Ok(())
}

/// Canonical form of a header cell: `Month Name` and `month_name` both become `MONTH_NAME`.
pub fn normalize_header(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len());
    let mut pending_separator = false;

    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !normalized.is_empty() {
                normalized.push('_');
            }
            pending_separator = false;
            normalized.push(ch.to_ascii_uppercase());
        } else {
            pending_separator = true;
        }
    }

    normalized
}

fn schema_error(message: impl Into<String>) -> ParserError {
    ParserError::Schema {
        message: message.into(),
    }
}
