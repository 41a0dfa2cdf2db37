// crates/cafe-core/src/merge.rs

use cafe_parser::{raw_column, ColumnType};
use serde::{Deserialize, Serialize};

use crate::config::WarehouseObjects;
use crate::sql::ObjectName;

/// How the raw table is reduced to one source row per business key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// `SELECT DISTINCT` over the projected columns. Keys whose attributes
    /// disagree within one batch make the merge fail.
    Distinct,
    /// Keep the attributes of the most recent transaction for each key.
    #[default]
    LatestTransaction,
}

/// Raw columns ranking rows under [`DedupPolicy::LatestTransaction`], most
/// significant first.
pub const RECENCY_ORDER: [&str; 3] = ["TRANSACTION_DATE", "TRANSACTION_TIME", "TRANSACTION_ID"];

pub const PRODUCT_ATTRIBUTES: [&str; 4] =
    ["PRODUCT_CATEGORY", "PRODUCT_TYPE", "PRODUCT_DETAIL", "SIZE"];

pub const STORE_ATTRIBUTES: [&str; 1] = ["STORE_LOCATION"];

pub const SALES_ATTRIBUTES: [&str; 10] = [
    "TRANSACTION_DATE",
    "PRODUCT_ID",
    "STORE_ID",
    "TRANSACTION_QTY",
    "UNIT_PRICE",
    "TOTAL_BILL",
    "MONTH",
    "MONTH_NAME",
    "HOUR",
    "DAY_NAME",
];

/// One keyed upsert from the raw table into a modelled table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeSpec {
    pub name: &'static str,
    pub target: ObjectName,
    pub source: ObjectName,
    pub key: &'static str,
    pub attributes: &'static [&'static str],
    pub dedup: DedupPolicy,
}

impl MergeSpec {
    /// Key first, then attributes. Target and source share these names.
    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.key).chain(self.attributes.iter().copied())
    }

    pub fn table_def(&self) -> TableDef {
        TableDef {
            name: self.target.clone(),
            columns: self
                .columns()
                .map(|name| {
                    let ty = raw_column(name)
                        .map(|column| column.ty)
                        .unwrap_or(ColumnType::Text);
                    (name, ty)
                })
                .collect(),
            primary_key: Some(self.key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: ObjectName,
    pub columns: Vec<(&'static str, ColumnType)>,
    pub primary_key: Option<&'static str>,
}

pub fn product_dimension(objects: &WarehouseObjects) -> MergeSpec {
    MergeSpec {
        name: "upsert_product",
        target: objects.product_table(),
        source: objects.raw_table(),
        key: "PRODUCT_ID",
        attributes: &PRODUCT_ATTRIBUTES,
        dedup: objects.dedup,
    }
}

pub fn store_dimension(objects: &WarehouseObjects) -> MergeSpec {
    MergeSpec {
        name: "upsert_store",
        target: objects.store_table(),
        source: objects.raw_table(),
        key: "STORE_ID",
        attributes: &STORE_ATTRIBUTES,
        dedup: objects.dedup,
    }
}

pub fn sales_fact(objects: &WarehouseObjects) -> MergeSpec {
    MergeSpec {
        name: "upsert_sales",
        target: objects.sales_table(),
        source: objects.raw_table(),
        key: "TRANSACTION_ID",
        attributes: &SALES_ATTRIBUTES,
        dedup: objects.dedup,
    }
}

/// Product, store and sales merges, in dependency order.
pub fn star_schema(objects: &WarehouseObjects) -> [MergeSpec; 3] {
    [
        product_dimension(objects),
        store_dimension(objects),
        sales_fact(objects),
    ]
}
