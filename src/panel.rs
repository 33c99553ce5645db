//! Panel assembly: per-wave loading, concatenation, double-column merging,
//! derivation hooks, and the `(personal_id, year)` index.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use encoding_rs::Encoding;
use itertools::Itertools;
use log::{debug, info};
use regex::Regex;

use crate::{
    data::{Missing, Value},
    error::HarmonizeError,
    frame::{CategorySet, Column, ColumnKind, Table},
    io_utils,
    schema::RenameSpec,
    warnings::{WarningSink, report_warning},
};

pub const MERGE_SUFFIX: &str = "_merge";
pub const UPDATE_SUFFIX: &str = "_update";
pub const SUBJECT_KEY: &str = "personal_id";
pub const TIME_KEY: &str = "year";
pub const WAVE_COLUMN: &str = "wave";
pub const FIELDWORK_COLUMN: &str = "date_fieldwork";
pub const HOUSEHOLD_KEY: &str = "hh_id";
const SKIP_MARKER: &str = "do_not_use";

static NUMBERED_WAVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^wave-([0-9]+)$").expect("Invalid regex: numbered wave"));
static MONTHLY_WAVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^20[012][0-9]-[01][0-9]$").expect("Invalid regex: monthly wave"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wave {
    Number(u32),
    Month(NaiveDate),
}

impl Wave {
    pub fn parse(dir_name: &str) -> Option<Self> {
        if let Some(captures) = NUMBERED_WAVE.captures(dir_name) {
            return captures[1].parse().ok().map(Wave::Number);
        }
        if MONTHLY_WAVE.is_match(dir_name) {
            return NaiveDate::parse_from_str(&format!("{dir_name}-01"), "%Y-%m-%d")
                .ok()
                .map(Wave::Month);
        }
        None
    }

    pub fn value(&self) -> Value {
        match self {
            Wave::Number(n) => Value::Integer(i64::from(*n)),
            Wave::Month(date) => Value::text(date.format("%Y-%m").to_string()),
        }
    }
}

impl fmt::Display for Wave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveFile {
    pub path: PathBuf,
    pub file_name: String,
    pub wave: Option<Wave>,
}

/// Lists the raw extracts of a dataset.
///
/// Files sit directly in `<data_dir>/<dataset>/` or one level down in a
/// `wave-N` or `YYYY-MM` directory. Anything under a `do_not_use` path is
/// skipped.
pub fn discover_waves(data_dir: &Path, dataset: &str) -> Result<Vec<WaveFile>> {
    let root = data_dir.join(dataset);
    let mut found = Vec::new();
    for entry in sorted_entries(&root)? {
        let name = entry
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Non UTF-8 path {entry:?}"))?;
        if name.contains(SKIP_MARKER) {
            continue;
        }
        if entry.is_dir() {
            let wave = Wave::parse(&name).ok_or_else(|| {
                anyhow!("Unexpected directory structure in: {}", entry.display())
            })?;
            for file in sorted_entries(&entry)? {
                if is_extract(&file) && !file.to_string_lossy().contains(SKIP_MARKER) {
                    found.push(wave_file(file, Some(wave.clone()))?);
                }
            }
        } else if is_extract(&entry) {
            found.push(wave_file(entry, None)?);
        }
    }
    info!("Found {} raw file(s) for {}", found.len(), dataset);
    Ok(found)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Listing directory {dir:?}"))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Listing directory {dir:?}"))?;
    entries.sort();
    Ok(entries)
}

fn is_extract(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv") || e.eq_ignore_ascii_case("tsv"))
}

fn wave_file(path: PathBuf, wave: Option<Wave>) -> Result<WaveFile> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Non UTF-8 file name {path:?}"))?;
    Ok(WaveFile {
        path,
        file_name,
        wave,
    })
}

/// Renames the columns of one raw table to their new names.
///
/// Columns without a renaming entry are dropped; listed variables the table
/// lacks are an error naming all of them.
pub fn rename_source_columns(
    table: Table,
    spec: &RenameSpec,
    source_key: &str,
    sink: &dyn WarningSink,
) -> Result<Table> {
    let pairs = spec.rename_pairs(source_key);
    let absent = pairs
        .iter()
        .filter(|(original, _)| !table.has_column(original))
        .map(|(original, _)| original.to_string())
        .collect::<Vec<_>>();
    if !absent.is_empty() {
        return Err(HarmonizeError::MissingSourceVariables {
            dataset: spec.dataset.clone(),
            file: source_key.to_string(),
            columns: absent,
        }
        .into());
    }
    let dropped = table
        .columns()
        .iter()
        .filter(|c| !pairs.iter().any(|(original, _)| *original == c.name))
        .map(|c| c.name.clone())
        .collect::<Vec<_>>();
    if !dropped.is_empty() {
        report_warning!(
            sink,
            "{} column(s) of {source_key} are not in {}_renaming.csv and were dropped: {}",
            dropped.len(),
            spec.dataset,
            dropped.join(", ")
        );
    }
    let columns = table.into_columns();
    let renamed = pairs
        .iter()
        .map(|(original, new_name)| {
            let column = columns
                .iter()
                .find(|c| c.name == *original)
                .ok_or_else(|| anyhow!("Column '{original}' not found"))?;
            Ok(Column::with_kind(
                new_name.to_string(),
                column.kind.clone(),
                column.values.clone(),
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Table::new(renamed).with_context(|| format!("Renaming columns of {source_key}"))
}

/// The fieldwork period of a wave: the most frequent `date_fieldwork` value,
/// as a year (`YYYYMM / 100`) or, with several files per year, as `YYYYMM`.
/// Ties go to the earliest period.
pub fn derive_year(column: &Column, multiple_files_per_year: bool) -> Result<i64> {
    let periods = column
        .present()
        .map(|value| {
            value
                .to_numeric()
                .and_then(|n| n.as_f64())
                .map(|n| n.trunc() as i64)
                .ok_or_else(|| anyhow!("'{value}' in {} is not a date", column.name))
        })
        .map(|p| p.map(|p| if multiple_files_per_year { p } else { p / 100 }))
        .collect::<Result<Vec<_>>>()?;
    periods
        .into_iter()
        .counts()
        .into_iter()
        .max_by(|(a, count_a), (b, count_b)| count_a.cmp(count_b).then(b.cmp(a)))
        .map(|(period, _)| period)
        .ok_or_else(|| anyhow!("{} has no values to derive the year from", column.name))
}

pub struct WaveOptions<'a> {
    pub multiple_files_per_year: bool,
    /// Falls back to the file extension when unset.
    pub delimiter: Option<u8>,
    pub encoding: &'static Encoding,
    pub sink: &'a dyn WarningSink,
}

/// Reads and renames one wave, adding `wave` and `year`.
///
/// Returns `None` for files the renaming file does not know yet.
pub fn load_wave(file: &WaveFile, spec: &RenameSpec, options: &WaveOptions<'_>) -> Result<Option<Table>> {
    let Some(source_key) = spec.source_key(&file.file_name) else {
        report_warning!(
            options.sink,
            "{} not yet in {}_renaming.csv.",
            file.file_name,
            spec.dataset
        );
        return Ok(None);
    };
    let delimiter = io_utils::resolve_input_delimiter(&file.path, options.delimiter);
    let raw = io_utils::read_raw_table(&file.path, delimiter, options.encoding)?;
    let mut table = rename_source_columns(raw, spec, source_key, options.sink)?;
    let rows = table.row_count();

    if let Some(wave) = &file.wave {
        table.push_column(Column::new(WAVE_COLUMN, vec![wave.value(); rows]))?;
    }
    let fieldwork = table.column(FIELDWORK_COLUMN).ok_or_else(|| {
        HarmonizeError::InvalidSpecification {
            dataset: spec.dataset.clone(),
            message: format!("{} has no {FIELDWORK_COLUMN} variable", file.file_name),
        }
    })?;
    let year = derive_year(fieldwork, options.multiple_files_per_year)
        .with_context(|| format!("Deriving {TIME_KEY} for {}", file.file_name))?;
    table.set_column(Column::new(TIME_KEY, vec![Value::Integer(year); rows]))?;
    debug!(
        "Loaded {} ({} rows, {} columns, {TIME_KEY} {year})",
        file.file_name,
        rows,
        table.width()
    );
    Ok(Some(table))
}

/// The common representation of two column kinds.
pub fn unify_kinds(left: &ColumnKind, right: &ColumnKind) -> ColumnKind {
    use ColumnKind::*;
    match (left, right) {
        (a, b) if a == b => a.clone(),
        (Float, Integer) | (Integer, Float) | (Float, Boolean) | (Boolean, Float) => Float,
        (Categorical(a), Categorical(b)) => Categorical(unify_categories(a, b)),
        _ => Object,
    }
}

fn unify_categories(a: &CategorySet, b: &CategorySet) -> CategorySet {
    if b.labels.iter().all(|l| a.contains(l)) {
        return a.clone();
    }
    if a.labels.iter().all(|l| b.contains(l)) {
        return b.clone();
    }
    let mut labels = a.labels.clone();
    labels.extend(b.labels.iter().filter(|l| !a.contains(l)).cloned());
    let numeric = labels.iter().all(Value::is_numeric);
    if numeric {
        labels.sort();
    }
    CategorySet::new(labels, numeric && a.ordered && b.ordered)
}

fn conform_values(values: Vec<Value>, kind: &ColumnKind) -> Vec<Value> {
    match kind {
        ColumnKind::Float => values
            .into_iter()
            .map(|v| match v {
                Value::Integer(i) => Value::Float(i as f64),
                Value::Boolean(b) => Value::Float(f64::from(u8::from(b))),
                other => other,
            })
            .collect(),
        _ => values,
    }
}

fn filler(kind: &ColumnKind) -> Value {
    match kind {
        ColumnKind::Object => Value::Missing(Missing::Blank),
        _ => Value::NAN,
    }
}

/// Stacks tables vertically over the union of their columns.
pub fn concat_tables(tables: Vec<Table>) -> Result<Table> {
    let mut names: Vec<String> = Vec::new();
    let mut kinds: Vec<ColumnKind> = Vec::new();
    for table in &tables {
        for column in table.columns() {
            match names.iter().position(|n| *n == column.name) {
                Some(idx) => kinds[idx] = unify_kinds(&kinds[idx], &column.kind),
                None => {
                    names.push(column.name.clone());
                    kinds.push(column.kind.clone());
                }
            }
        }
    }
    let total = tables.iter().map(Table::row_count).sum();
    let mut values: Vec<Vec<Value>> = names.iter().map(|_| Vec::with_capacity(total)).collect();
    for table in tables {
        let rows = table.row_count();
        let mut columns = table.into_columns();
        for (idx, name) in names.iter().enumerate() {
            match columns.iter().position(|c| c.name == *name) {
                Some(pos) => {
                    let column = columns.swap_remove(pos);
                    values[idx].extend(conform_values(column.values, &kinds[idx]));
                }
                None => values[idx].extend(std::iter::repeat_n(filler(&kinds[idx]), rows)),
            }
        }
    }
    let columns = names
        .into_iter()
        .zip(kinds)
        .zip(values)
        .map(|((name, kind), values)| Column::with_kind(name, kind, values))
        .collect();
    Table::new(columns)
}

fn merge_values(primary: &Value, secondary: &Value) -> Value {
    if !primary.is_missing() {
        primary.clone()
    } else if !secondary.is_missing() {
        secondary.clone()
    } else {
        Value::NAN
    }
}

fn combine_suffixed(
    mut table: Table,
    suffix: &str,
    pick: impl Fn(&Value, &Value) -> Value,
) -> Result<Table> {
    let suffixed = table
        .column_names()
        .into_iter()
        .filter(|name| name.len() > suffix.len() && name.ends_with(suffix))
        .collect::<Vec<_>>();
    for name in suffixed {
        let base = name[..name.len() - suffix.len()].to_string();
        let Some(extra) = table.remove_column(&name) else {
            continue;
        };
        let Some(existing) = table.column(&base) else {
            debug!("No '{base}' to combine '{name}' into, renaming");
            table.push_column(Column::with_kind(base, extra.kind, extra.values))?;
            continue;
        };
        let kind = unify_kinds(&existing.kind, &extra.kind);
        let combined = existing
            .values
            .iter()
            .zip(&extra.values)
            .map(|(x, y)| pick(x, y))
            .collect::<Vec<_>>();
        let combined = conform_values(combined, &kind);
        table.set_column(Column::with_kind(base, kind, combined))?;
    }
    Ok(table)
}

/// Folds every `<x>_merge` column into `<x>`; the first non-missing value wins.
pub fn merge_double_columns(table: Table) -> Result<Table> {
    combine_suffixed(table, MERGE_SUFFIX, merge_values)
}

/// Folds every `<x>_update` column into `<x>`; the update wins when present.
pub fn update_double_columns(table: Table) -> Result<Table> {
    combine_suffixed(table, UPDATE_SUFFIX, |x, y| merge_values(y, x))
}

/// Dataset-specific derivation run on the assembled panel.
pub trait PanelHook {
    fn name(&self) -> &str;
    fn apply(&self, table: Table, sink: &dyn WarningSink) -> Result<Table>;
}

#[derive(Debug, Clone)]
pub struct MergeRules {
    pub merge_double: bool,
    pub update_double: bool,
    /// Columns removed after the hooks ran.
    pub drop_columns: Vec<String>,
}

impl Default for MergeRules {
    fn default() -> Self {
        Self {
            merge_double: true,
            update_double: true,
            drop_columns: Vec::new(),
        }
    }
}

/// Cleaning applied to every dataset before export: line breaks in text become
/// spaces and semicolons become commas.
pub fn common_cleaning(table: &mut Table) {
    for column in table.columns_mut() {
        if column.kind != ColumnKind::Object {
            continue;
        }
        for value in &mut column.values {
            if let Value::Text(text) = value
                && text.contains(['\n', '\r', ';'])
            {
                *text = text.replace(['\n', '\r'], " ").replace(';', ",");
            }
        }
    }
}

/// Sets, sorts, and checks the `(personal_id, year)` index.
pub fn set_panel_index(mut table: Table) -> Result<Table> {
    let keys = [SUBJECT_KEY, TIME_KEY];
    let mut key_columns = Vec::with_capacity(keys.len());
    for key in keys {
        let column = table
            .column(key)
            .ok_or_else(|| HarmonizeError::IndexColumn(key.to_string()))?;
        if column.values.iter().any(Value::is_missing) {
            return Err(HarmonizeError::IndexColumn(key.to_string()).into());
        }
        key_columns.push(column.values.clone());
    }
    let mut order = (0..table.row_count()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        key_columns
            .iter()
            .map(|values| values[a].cmp(&values[b]))
            .find(|ord| ord.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some((&a, _)) = order.iter().tuple_windows().find(|&(&a, &b)| {
        key_columns.iter().all(|values| values[a] == values[b])
    }) {
        return Err(HarmonizeError::DuplicateKeys {
            columns: keys.join(", "),
            example: format!(
                "({})",
                key_columns.iter().map(|values| values[a].to_string()).join(", ")
            ),
        }
        .into());
    }
    table.take_rows(&order);
    table.set_index(&keys)?;
    Ok(table)
}

/// Structural merge, hooks, common cleaning and indexing of a concatenated panel.
pub fn finish_panel(
    table: Table,
    rules: &MergeRules,
    hooks: &[Box<dyn PanelHook>],
    sink: &dyn WarningSink,
) -> Result<Table> {
    let mut table = table;
    if rules.merge_double {
        table = merge_double_columns(table)?;
    }
    if rules.update_double {
        table = update_double_columns(table)?;
    }
    for hook in hooks {
        debug!("Running derivation '{}'", hook.name());
        table = hook
            .apply(table, sink)
            .with_context(|| format!("Derivation '{}'", hook.name()))?;
    }
    for name in &rules.drop_columns {
        table.remove_column(name);
    }
    common_cleaning(&mut table);
    set_panel_index(table)
}

/// Combines per-wave tables into one long panel keyed by subject and year.
pub fn assemble_panel(
    waves: Vec<Table>,
    rules: &MergeRules,
    hooks: &[Box<dyn PanelHook>],
    sink: &dyn WarningSink,
) -> Result<Table> {
    let count = waves.len();
    let panel = concat_tables(waves)?;
    info!(
        "Concatenated {count} wave(s) into {} row(s) and {} column(s)",
        panel.row_count(),
        panel.width()
    );
    finish_panel(panel, rules, hooks, sink)
}
