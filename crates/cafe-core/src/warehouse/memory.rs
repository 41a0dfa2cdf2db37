// crates/cafe-core/src/warehouse/memory.rs

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cafe_parser::{parse_batch, FileFormat, Value};
use tracing::debug;

use super::{
    LoadReport, MergeReport, RawLoadError, RawLoadPhase, RawLoadPlan, StagedObject, Warehouse,
    WarehouseError,
};
use crate::batch::{BatchFile, BatchPattern};
use crate::credentials::WarehouseCredentials;
use crate::merge::{DedupPolicy, MergeSpec, TableDef, RECENCY_ORDER};
use crate::sql::ObjectName;

/// A table held by [`MemoryWarehouse`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    fn with_columns<'a>(columns: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            columns: columns.into_iter().map(str::to_string).collect(),
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in the row whose `key` column equals `key`.
    pub fn lookup(&self, key: &str, key_value: &Value, column: &str) -> Option<&Value> {
        let key_index = self.column_index(key)?;
        let column_index = self.column_index(column)?;
        self.rows
            .iter()
            .find(|row| &row[key_index] == key_value)
            .map(|row| &row[column_index])
    }

    fn indices(&self, table: &ObjectName, columns: &[&str]) -> Result<Vec<usize>, WarehouseError> {
        columns
            .iter()
            .map(|column| {
                self.column_index(column)
                    .ok_or_else(|| WarehouseError::MissingObject(format!("{table}.{column}")))
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    stages: BTreeMap<ObjectName, BTreeMap<String, Vec<u8>>>,
    tables: BTreeMap<ObjectName, Table>,
    file_formats: BTreeMap<ObjectName, FileFormat>,
}

/// In-process warehouse with the same observable semantics as the Snowflake
/// backend: positional all-or-nothing loads and keyed merges.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn table(&self, name: &ObjectName) -> Option<Table> {
        self.lock().tables.get(name).cloned()
    }

    pub fn staged_objects(&self, stage: &ObjectName) -> Vec<String> {
        self.lock()
            .stages
            .get(stage)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Places an object on a stage directly, bypassing [`Warehouse::put`].
    pub fn stage_object(&self, stage: &ObjectName, name: &str, contents: Vec<u8>) {
        self.lock()
            .stages
            .entry(stage.clone())
            .or_default()
            .insert(name.to_string(), contents);
    }

    fn load_raw_now(&self, plan: &RawLoadPlan) -> Result<LoadReport, RawLoadError> {
        let mut state = self.lock();

        state.tables.insert(
            plan.table.clone(),
            Table::with_columns(plan.columns.iter().map(|column| column.name)),
        );
        state
            .file_formats
            .insert(plan.format_name.clone(), plan.format.clone());

        let load_error = |source| RawLoadError::new(RawLoadPhase::Load, source);
        let format = state
            .file_formats
            .get(&plan.format_name)
            .cloned()
            .ok_or_else(|| load_error(WarehouseError::MissingObject(plan.format_name.to_string())))?;
        let matcher = plan
            .pattern
            .matcher()
            .map_err(|err| load_error(WarehouseError::Stage(err.to_string())))?;

        let mut report = LoadReport::default();
        let mut rows = Vec::new();
        if let Some(objects) = state.stages.get(&plan.stage) {
            for (name, contents) in objects {
                if !matcher.is_match(name) {
                    continue;
                }
                let batch = parse_batch(contents, &format, plan.columns).map_err(|err| {
                    load_error(WarehouseError::LoadRejected {
                        file: Some(name.clone()),
                        line: err.line(),
                        message: err.to_string(),
                    })
                })?;
                report.rows_loaded += batch.len() as u64;
                report.files.push(name.clone());
                rows.extend(batch.rows.into_iter().map(|row| row.values));
            }
        }

        let table = state
            .tables
            .get_mut(&plan.table)
            .ok_or_else(|| load_error(WarehouseError::MissingObject(plan.table.to_string())))?;
        table.rows = rows;

        debug!(table = %plan.table, rows = report.rows_loaded, "memory load committed");
        Ok(report)
    }

    fn merge_now(&self, spec: &MergeSpec) -> Result<MergeReport, WarehouseError> {
        let mut state = self.lock();
        let columns: Vec<&str> = spec.columns().collect();

        let source = state
            .tables
            .get(&spec.source)
            .ok_or_else(|| WarehouseError::MissingObject(spec.source.to_string()))?;
        let candidates = merge_candidates(spec, source, &columns)?;

        let target = state
            .tables
            .get_mut(&spec.target)
            .ok_or_else(|| WarehouseError::MissingObject(spec.target.to_string()))?;
        let target_indices = target.indices(&spec.target, &columns)?;
        let key_index = target_indices[0];

        let mut positions: HashMap<Value, usize> = target
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !row[key_index].is_null())
            .map(|(position, row)| (row[key_index].clone(), position))
            .collect();

        let mut report = MergeReport {
            target: spec.target.to_string(),
            ..MergeReport::default()
        };

        for candidate in candidates {
            match positions.get(&candidate[0]).copied() {
                Some(position) => {
                    let row = &mut target.rows[position];
                    for (value, &index) in candidate.iter().zip(&target_indices).skip(1) {
                        row[index] = value.clone();
                    }
                    report.updated += 1;
                }
                None => {
                    let mut row = vec![Value::Null; target.columns.len()];
                    for (value, &index) in candidate.iter().zip(&target_indices) {
                        row[index] = value.clone();
                    }
                    positions.insert(candidate[0].clone(), target.rows.len());
                    target.rows.push(row);
                    report.inserted += 1;
                }
            }
        }

        debug!(
            table = %spec.target,
            inserted = report.inserted,
            updated = report.updated,
            "memory merge committed"
        );
        Ok(report)
    }

    fn remove_now(&self, stage: &ObjectName, pattern: &BatchPattern) -> Result<Vec<String>, WarehouseError> {
        let matcher = pattern
            .matcher()
            .map_err(|err| WarehouseError::Stage(err.to_string()))?;
        let mut state = self.lock();
        let Some(objects) = state.stages.get_mut(stage) else {
            return Ok(Vec::new());
        };

        let removed: Vec<String> = objects
            .keys()
            .filter(|name| matcher.is_match(name))
            .cloned()
            .collect();
        for name in &removed {
            objects.remove(name);
        }
        Ok(removed)
    }
}

/// Source tuples (key first) that the merge applies, one per key. Rows with a
/// NULL key are left out.
fn merge_candidates(
    spec: &MergeSpec,
    source: &Table,
    columns: &[&str],
) -> Result<Vec<Vec<Value>>, WarehouseError> {
    let projection = source.indices(&spec.source, columns)?;
    let project = |row: &[Value]| -> Vec<Value> {
        projection.iter().map(|&index| row[index].clone()).collect()
    };
    let key_index = projection[0];
    let keyed = source.rows.iter().filter(|row| !row[key_index].is_null());

    match spec.dedup {
        DedupPolicy::Distinct => {
            let mut seen = HashSet::new();
            let mut keys = HashSet::new();
            let mut candidates = Vec::new();
            for row in keyed {
                let tuple = project(row);
                if !seen.insert(tuple.clone()) {
                    continue;
                }
                if !keys.insert(tuple[0].clone()) {
                    return Err(WarehouseError::NondeterministicMerge {
                        target: spec.target.to_string(),
                        key: spec.key.to_string(),
                        value: tuple[0].to_string(),
                    });
                }
                candidates.push(tuple);
            }
            Ok(candidates)
        }
        DedupPolicy::LatestTransaction => {
            let order = source.indices(&spec.source, &RECENCY_ORDER)?;

            // Later rows win ties, matching load order.
            let mut latest: HashMap<Value, (Vec<Value>, usize)> = HashMap::new();
            for (position, row) in source.rows.iter().enumerate() {
                if row[key_index].is_null() {
                    continue;
                }
                let rank: Vec<Value> = order.iter().map(|&index| row[index].clone()).collect();
                match latest.entry(row[key_index].clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert((rank, position));
                    }
                    Entry::Occupied(mut slot) => {
                        if rank >= slot.get().0 {
                            slot.insert((rank, position));
                        }
                    }
                }
            }

            let mut winners: Vec<usize> = latest.into_values().map(|(_, position)| position).collect();
            winners.sort_unstable();
            Ok(winners
                .into_iter()
                .map(|position| project(&source.rows[position]))
                .collect())
        }
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn put(
        &self,
        _credentials: &WarehouseCredentials,
        file: &BatchFile,
        stage: &ObjectName,
    ) -> Result<StagedObject, WarehouseError> {
        let contents = tokio::fs::read(&file.path).await?;
        let bytes = contents.len() as u64;
        self.stage_object(stage, &file.name, contents);
        Ok(StagedObject {
            name: file.name.clone(),
            bytes,
        })
    }

    async fn load_raw(
        &self,
        _credentials: &WarehouseCredentials,
        plan: &RawLoadPlan,
    ) -> Result<LoadReport, RawLoadError> {
        self.load_raw_now(plan)
    }

    async fn merge(
        &self,
        _credentials: &WarehouseCredentials,
        spec: &MergeSpec,
    ) -> Result<MergeReport, WarehouseError> {
        self.merge_now(spec)
    }

    async fn remove(
        &self,
        _credentials: &WarehouseCredentials,
        stage: &ObjectName,
        pattern: &BatchPattern,
    ) -> Result<Vec<String>, WarehouseError> {
        self.remove_now(stage, pattern)
    }

    async fn create_table(
        &self,
        _credentials: &WarehouseCredentials,
        table: &TableDef,
    ) -> Result<(), WarehouseError> {
        self.lock()
            .tables
            .entry(table.name.clone())
            .or_insert_with(|| Table::with_columns(table.columns.iter().map(|(name, _)| *name)));
        Ok(())
    }
}
