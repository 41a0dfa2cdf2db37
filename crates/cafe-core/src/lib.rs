pub mod batch;
pub mod config;
pub mod credentials;
#[cfg(feature = "runtime")]
pub mod db;
pub mod driver;
pub mod error;
pub mod graph;
pub mod ledger;
pub mod merge;
pub mod reconcile;
pub mod sql;
pub mod steps;
pub mod warehouse;
