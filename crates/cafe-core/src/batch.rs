// crates/cafe-core/src/batch.rs

use std::path::{Path, PathBuf};

use cafe_parser::{check_header, ColumnSpec, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// File-name pattern selecting one batch. The same pattern drives local
/// discovery, the load filter and the stage cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPattern {
    pub prefix: String,
    pub extension: String,
}

impl Default for BatchPattern {
    fn default() -> Self {
        Self {
            prefix: "coffee_shop_sales_".to_string(),
            extension: "csv".to_string(),
        }
    }
}

impl BatchPattern {
    /// Prefix and extension are restricted to `[A-Za-z0-9_.-]` so the rendered
    /// glob and regex need no escaping beyond the dot.
    pub fn validate(&self) -> Result<()> {
        let allowed = |text: &str| {
            text.chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        };
        if self.prefix.is_empty() || !allowed(&self.prefix) {
            return Err(PipelineError::Pattern(format!(
                "prefix '{}' must be non-empty and use only letters, digits, '_', '-' or '.'",
                self.prefix
            )));
        }
        if self.extension.is_empty() || !allowed(&self.extension) {
            return Err(PipelineError::Pattern(format!(
                "extension '{}' must be non-empty and use only letters, digits, '_', '-' or '.'",
                self.extension
            )));
        }
        Ok(())
    }

    /// Local discovery glob, e.g. `coffee_shop_sales_*.csv`.
    pub fn glob(&self) -> String {
        format!("{}*.{}", self.prefix, self.extension)
    }

    /// Warehouse-side regex applied to full staged paths, e.g.
    /// `.*coffee_shop_sales_.*[.]csv`. Dots are written as `[.]` so the text
    /// survives SQL string literal escaping unchanged.
    pub fn stage_regex(&self) -> String {
        format!(
            ".*{}.*[.]{}",
            escape_dots(&self.prefix),
            escape_dots(&self.extension)
        )
    }

    /// Compiled [`Self::stage_regex`], anchored for whole-path matching.
    pub fn matcher(&self) -> Result<Regex> {
        Regex::new(&format!("^(?:{})$", self.stage_regex()))
            .map_err(|err| PipelineError::Pattern(err.to_string()))
    }
}

fn escape_dots(text: &str) -> String {
    text.replace('.', "[.]")
}

/// A local file selected for the current batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFile {
    pub path: PathBuf,
    pub name: String,
    pub hash: String,
    pub size: u64,
}

pub fn fingerprint(contents: &[u8]) -> String {
    blake3::hash(contents).to_hex().to_string()
}

/// Lists the batch files under `dir`, sorted by name. A missing directory is
/// an empty batch.
pub fn discover(dir: &Path, pattern: &BatchPattern) -> Result<Vec<BatchFile>> {
    pattern.validate()?;

    let expression = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern.glob()
    );

    let mut files = Vec::new();
    for entry in glob::glob(&expression).map_err(|err| PipelineError::Pattern(err.to_string()))? {
        let path = entry.map_err(|err| PipelineError::Io(err.into()))?;
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned()) else {
            continue;
        };

        let contents = std::fs::read(&path)?;
        files.push(BatchFile {
            hash: fingerprint(&contents),
            size: contents.len() as u64,
            name,
            path,
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(dir = %dir.display(), count = files.len(), "discovered batch files");
    Ok(files)
}

/// Checks every file's header against the raw descriptor before anything is
/// staged. A wrong field count fails the batch; renamed fields only warn
/// because the load maps fields by position.
pub fn preflight(files: &[BatchFile], format: &FileFormat, columns: &[ColumnSpec]) -> Result<()> {
    for file in files {
        let contents = std::fs::read(&file.path)?;
        let check = check_header(&contents, format, columns).map_err(|source| {
            PipelineError::Schema {
                file: file.name.clone(),
                source,
            }
        })?;

        for (position, found, expected) in check.renamed {
            warn!(
                file = %file.name,
                position,
                found = %found,
                expected,
                "header field differs from the raw descriptor; loading by position"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_and_regex_select_the_same_names() {
        let pattern = BatchPattern::default();
        assert_eq!(pattern.glob(), "coffee_shop_sales_*.csv");
        assert_eq!(pattern.stage_regex(), ".*coffee_shop_sales_.*[.]csv");

        let matcher = pattern.matcher().expect("regex compiles");
        assert!(matcher.is_match("coffee_shop_sales_2023_01.csv"));
        assert!(matcher.is_match("stg_raw/coffee_shop_sales_2023_01.csv"));
        assert!(!matcher.is_match("coffee_shop_sales_2023_01.csv.gz"));
        assert!(!matcher.is_match("coffee_shop_sales_2023_01xcsv"));
        assert!(!matcher.is_match("store_sales_2023_01.csv"));
    }

    #[test]
    fn pattern_rejects_glob_metacharacters() {
        let pattern = BatchPattern {
            prefix: "sales_*".into(),
            extension: "csv".into(),
        };
        assert!(matches!(pattern.validate(), Err(PipelineError::Pattern(_))));
    }

    #[test]
    fn discover_sorts_and_fingerprints() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("coffee_shop_sales_b.csv"), b"b").expect("write b");
        std::fs::write(dir.path().join("coffee_shop_sales_a.csv"), b"a").expect("write a");
        std::fs::write(dir.path().join("notes.txt"), b"ignored").expect("write notes");
        std::fs::create_dir(dir.path().join("processed")).expect("mkdir");

        let files = discover(dir.path(), &BatchPattern::default()).expect("discover");
        let names: Vec<_> = files.iter().map(|file| file.name.as_str()).collect();
        assert_eq!(names, ["coffee_shop_sales_a.csv", "coffee_shop_sales_b.csv"]);
        assert_eq!(files[0].hash, fingerprint(b"a"));
        assert_eq!(files[0].size, 1);
    }

    #[test]
    fn missing_directory_is_an_empty_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files =
            discover(&dir.path().join("absent"), &BatchPattern::default()).expect("discover");
        assert!(files.is_empty());
    }
}
