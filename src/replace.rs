//! Staged value replacement.
//!
//! Rules come from `<dataset>_replacing.yaml` and are applied in a fixed order:
//!
//! 1. `mixed_case`: lower-case text in the listed columns
//! 2. `numeric`: force numeric, unparsable cells become missing
//! 3. `type renaming`: one map per declared type group, applied to every
//!    variable the renaming file declares with that type
//! 4. `replacing`: per-column maps; the reserved key `full_df` applies a map to
//!    every column
//! 5. `multicolumn`: named column groups sharing one map
//!
//! A final pass folds mixed missing markers into the canonical one. Stages 3 to
//! 5 never abort: a map that does not fit a column is reported as a
//! [`SubstitutionFailure`] and the column keeps its previous values.

use std::{fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result, anyhow, bail};
use itertools::Itertools;
use log::{debug, info};

use crate::{
    data::{Value, value_from_yaml},
    error::{HarmonizeError, SubstitutionFailure},
    frame::{Column, ColumnKind, Table},
    schema::{DeclaredType, RenameSpec},
    warnings::{WarningSink, report_warning},
};

pub const FULL_TABLE_KEY: &str = "full_df";

/// An ordered value-to-value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubstitutionMap {
    entries: Vec<(Value, Value)>,
}

impl SubstitutionMap {
    pub fn new(entries: Vec<(Value, Value)>) -> Self {
        Self { entries }
    }

    pub fn from_yaml(value: &serde_yaml::Value) -> Result<Self> {
        let mapping = value
            .as_mapping()
            .ok_or_else(|| anyhow!("Expected a value mapping but found {value:?}"))?;
        let entries = mapping
            .iter()
            .map(|(from, to)| Ok((value_from_yaml(from)?, value_from_yaml(to)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, value: &Value) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(from, _)| from.loose_eq(value))
            .map(|(_, to)| to)
    }

    /// Applies the map to a copy of `column`.
    ///
    /// Fails without touching the column when a replacement cannot be stored
    /// in the column's current representation.
    pub fn apply(&self, column: &Column) -> Result<Column, String> {
        let mut values = Vec::with_capacity(column.len());
        for value in &column.values {
            match self.lookup(value) {
                Some(replacement) => {
                    if !column.kind.admits(replacement) {
                        return Err(format!(
                            "cannot put {} '{}' into a {} column",
                            replacement.type_name(),
                            replacement,
                            column.kind
                        ));
                    }
                    values.push(conform(&column.kind, replacement.clone()));
                }
                None => values.push(value.clone()),
            }
        }
        Ok(Column::with_kind(column.name.clone(), column.kind.clone(), values))
    }
}

fn conform(kind: &ColumnKind, value: Value) -> Value {
    match (kind, &value) {
        (ColumnKind::Float, Value::Integer(i)) => Value::Float(*i as f64),
        (ColumnKind::Integer, Value::Float(_)) => value
            .as_integral()
            .map(Value::Integer)
            .unwrap_or(value),
        _ => value,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiColumnRule {
    pub name: String,
    pub columns: Vec<String>,
    pub dictionary: SubstitutionMap,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplacementRules {
    pub mixed_case: Vec<String>,
    pub numeric: Vec<String>,
    pub type_renaming: Vec<(DeclaredType, SubstitutionMap)>,
    pub replacing: Vec<(String, SubstitutionMap)>,
    pub full_table: Option<SubstitutionMap>,
    pub multicolumn: Vec<MultiColumnRule>,
}

impl ReplacementRules {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening {path:?}"))?;
        let document: serde_yaml::Value = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing YAML in {path:?}"))?;
        Self::from_yaml(&document)
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let document: serde_yaml::Value =
            serde_yaml::from_str(source).context("Parsing replacement rules")?;
        Self::from_yaml(&document)
    }

    pub fn from_yaml(document: &serde_yaml::Value) -> Result<Self> {
        let mut rules = ReplacementRules::default();
        let Some(mapping) = document.as_mapping() else {
            if document.is_null() {
                return Ok(rules);
            }
            bail!("Replacement rules must be a mapping");
        };
        for (key, value) in mapping {
            let key = key
                .as_str()
                .ok_or_else(|| anyhow!("Replacement rule keys must be strings, found {key:?}"))?;
            if value.is_null() {
                continue;
            }
            match key {
                "mixed_case" => rules.mixed_case = string_list(value, key)?,
                "numeric" => rules.numeric = string_list(value, key)?,
                "type renaming" => {
                    for (group, map) in section(value, key)? {
                        let group = group
                            .as_str()
                            .ok_or_else(|| anyhow!("Type group must be a string, found {group:?}"))?;
                        let declared = group
                            .parse::<DeclaredType>()
                            .with_context(|| format!("Type group '{group}'"))?;
                        rules
                            .type_renaming
                            .push((declared, SubstitutionMap::from_yaml(map)?));
                    }
                }
                "replacing" => {
                    for (column, map) in section(value, key)? {
                        let column = column
                            .as_str()
                            .ok_or_else(|| anyhow!("Column name must be a string, found {column:?}"))?;
                        let map = SubstitutionMap::from_yaml(map)
                            .with_context(|| format!("Replacement map for '{column}'"))?;
                        if column == FULL_TABLE_KEY {
                            rules.full_table = Some(map);
                        } else {
                            rules.replacing.push((column.to_string(), map));
                        }
                    }
                }
                "multicolumn" => {
                    for (name, group) in section(value, key)? {
                        let name = name
                            .as_str()
                            .ok_or_else(|| anyhow!("Group name must be a string, found {name:?}"))?;
                        let columns = group
                            .get("columns")
                            .ok_or_else(|| anyhow!("Multicolumn group '{name}' has no columns"))?;
                        let dictionary = group.get("dictionary").ok_or_else(|| {
                            anyhow!("Multicolumn group '{name}' has no dictionary")
                        })?;
                        rules.multicolumn.push(MultiColumnRule {
                            name: name.to_string(),
                            columns: string_list(columns, name)?,
                            dictionary: SubstitutionMap::from_yaml(dictionary)
                                .with_context(|| format!("Dictionary of '{name}'"))?,
                        });
                    }
                }
                other => debug!("Ignoring unknown replacement section '{other}'"),
            }
        }
        Ok(rules)
    }

    /// Every column the rules reference, in rule order, without duplicates.
    pub fn referenced_columns(&self, spec: Option<&RenameSpec>) -> Vec<String> {
        let typed = self.type_renaming.iter().flat_map(|(declared, _)| {
            spec.map(|s| s.names_of_type(*declared))
                .unwrap_or_default()
                .into_iter()
                .map(str::to_string)
        });
        self.mixed_case
            .iter()
            .cloned()
            .chain(self.numeric.iter().cloned())
            .chain(typed)
            .chain(self.replacing.iter().map(|(column, _)| column.clone()))
            .chain(self.multicolumn.iter().flat_map(|g| g.columns.iter().cloned()))
            .unique()
            .collect()
    }
}

fn section<'a>(value: &'a serde_yaml::Value, key: &str) -> Result<&'a serde_yaml::Mapping> {
    value
        .as_mapping()
        .ok_or_else(|| anyhow!("Section '{key}' must be a mapping"))
}

fn string_list(value: &serde_yaml::Value, key: &str) -> Result<Vec<String>> {
    let items = value
        .as_sequence()
        .ok_or_else(|| anyhow!("'{key}' must be a list of column names"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("'{key}' contains a non-string entry {item:?}"))
        })
        .collect()
}

/// What happens to substitution failures once every stage has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Report each failure as a warning and keep going.
    #[default]
    Warn,
    /// Turn the collected failures into one error.
    Fail,
}

#[derive(Debug, Clone)]
pub struct ReplaceOptions {
    pub dataset: String,
    pub raise_if_missing: bool,
    pub on_failure: FailurePolicy,
}

impl Default for ReplaceOptions {
    fn default() -> Self {
        Self {
            dataset: String::new(),
            raise_if_missing: true,
            on_failure: FailurePolicy::Warn,
        }
    }
}

impl ReplaceOptions {
    pub fn for_dataset(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplaceOutcome {
    pub table: Table,
    pub failures: Vec<SubstitutionFailure>,
}

pub fn apply_replacements(
    table: Table,
    rules: &ReplacementRules,
    spec: Option<&RenameSpec>,
    options: &ReplaceOptions,
    sink: &dyn WarningSink,
) -> Result<ReplaceOutcome> {
    let absent = rules
        .referenced_columns(spec)
        .into_iter()
        .filter(|name| !table.has_column(name))
        .collect::<Vec<_>>();
    if !absent.is_empty() {
        if options.raise_if_missing {
            return Err(HarmonizeError::MissingVariables {
                dataset: options.dataset.clone(),
                columns: absent,
            }
            .into());
        }
        debug!("Skipping rules for absent column(s) {absent:?}");
    }

    let mut table = table;
    let mut failures = Vec::new();

    for name in &rules.mixed_case {
        if let Some(column) = table.column_mut(name) {
            lower_case(column);
        }
    }

    for name in &rules.numeric {
        if let Some(column) = table.column_mut(name) {
            force_numeric(column);
        }
    }

    for (declared, map) in &rules.type_renaming {
        let names = spec
            .map(|s| s.names_of_type(*declared))
            .unwrap_or_default();
        for name in names {
            if let Some(column) = table.column_mut(name) {
                match map.apply(column) {
                    Ok(replaced) => *column = replaced,
                    Err(reason) => {
                        report_warning!(sink, "issue with {name}: {reason}");
                        failures.push(SubstitutionFailure {
                            column: name.to_string(),
                            stage: "type renaming",
                            reason,
                        });
                    }
                }
            }
        }
    }

    for (name, map) in &rules.replacing {
        if let Some(column) = table.column_mut(name) {
            match map.apply(column) {
                Ok(replaced) => *column = replaced,
                Err(reason) => {
                    report_warning!(sink, "type issue with {name}: {reason}");
                    failures.push(SubstitutionFailure {
                        column: name.clone(),
                        stage: "replacing",
                        reason,
                    });
                }
            }
        }
    }

    if let Some(map) = &rules.full_table {
        for column in table.columns_mut() {
            match map.apply(column) {
                Ok(replaced) => *column = replaced,
                Err(reason) => {
                    report_warning!(sink, "type issue with {FULL_TABLE_KEY} in {}: {reason}", column.name);
                    failures.push(SubstitutionFailure {
                        column: column.name.clone(),
                        stage: FULL_TABLE_KEY,
                        reason,
                    });
                }
            }
        }
    }

    for group in &rules.multicolumn {
        let present = group
            .columns
            .iter()
            .filter_map(|name| table.column(name))
            .collect::<Vec<_>>();
        let replaced = present
            .iter()
            .map(|column| group.dictionary.apply(column).map_err(|e| (column.name.clone(), e)))
            .collect::<Result<Vec<_>, _>>();
        match replaced {
            Ok(columns) => {
                for column in columns {
                    table.set_column(column)?;
                }
            }
            Err((column, reason)) => {
                report_warning!(sink, "error in {}: {column}: {reason}", group.name);
                failures.push(SubstitutionFailure {
                    column: group.name.clone(),
                    stage: "multicolumn",
                    reason: format!("{column}: {reason}"),
                });
            }
        }
    }

    let repaired = fix_mixed_missing(&mut table);
    if !repaired.is_empty() {
        debug!("Folded mixed missing markers in {repaired:?}");
    }

    info!(
        "Applied replacement rules to {} column(s) of {} with {} failure(s)",
        table.width(),
        if options.dataset.is_empty() { "table" } else { options.dataset.as_str() },
        failures.len()
    );

    if options.on_failure == FailurePolicy::Fail && !failures.is_empty() {
        return Err(HarmonizeError::SubstitutionFailures(failures).into());
    }
    Ok(ReplaceOutcome { table, failures })
}

fn lower_case(column: &mut Column) {
    for value in &mut column.values {
        if let Value::Text(text) = value {
            *text = text.to_lowercase();
        }
    }
}

fn force_numeric(column: &mut Column) {
    for value in &mut column.values {
        *value = match value.to_numeric() {
            Some(Value::Integer(i)) => Value::Float(i as f64),
            Some(number) => number,
            None => Value::NAN,
        };
    }
    column.kind = ColumnKind::Float;
}

/// Canonicalizes every column carrying more than one missing marker.
pub fn fix_mixed_missing(table: &mut Table) -> Vec<String> {
    table
        .columns_mut()
        .iter_mut()
        .filter(|column| column.has_mixed_missing())
        .map(|column| {
            column.canonicalize_missing();
            column.name.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::Missing, warnings::WarningLog};

    fn text_column(name: &str, values: &[&str]) -> Column {
        Column::new(name, values.iter().map(|v| Value::from_raw(v)).collect())
    }

    #[test]
    fn rules_parse_every_section() {
        let rules = ReplacementRules::from_yaml_str(
            r#"
mixed_case: [answer]
numeric: [hours]
type renaming:
  bool:
    ja: 1
    nee: 0
replacing:
  answer:
    weet niet: .nan
  full_df:
    -9: ~
multicolumn:
  trust:
    columns: [trust_a, trust_b]
    dictionary:
      veel: 2
      weinig: 1
logical_cleaning: ~
"#,
        )
        .unwrap();
        assert_eq!(rules.mixed_case, vec!["answer"]);
        assert_eq!(rules.type_renaming[0].0, DeclaredType::Boolean);
        assert_eq!(rules.replacing[0].0, "answer");
        assert_eq!(rules.full_table.as_ref().unwrap().len(), 1);
        assert_eq!(rules.multicolumn[0].columns, vec!["trust_a", "trust_b"]);
    }

    #[test]
    fn typed_column_rejects_text_replacement() {
        let column = Column::with_kind("hours", ColumnKind::Float, vec![Value::Float(-9.0)]);
        let map = SubstitutionMap::new(vec![(Value::Integer(-9), Value::text("refused"))]);
        assert!(map.apply(&column).is_err());
        let to_missing = SubstitutionMap::new(vec![(Value::Integer(-9), Value::NAN)]);
        assert_eq!(to_missing.apply(&column).unwrap().values, vec![Value::NAN]);
    }

    #[test]
    fn multicolumn_group_is_atomic() {
        let table = Table::new(vec![
            text_column("a", &["veel"]),
            Column::with_kind("b", ColumnKind::Boolean, vec![Value::Boolean(true)]),
        ])
        .unwrap();
        let rules = ReplacementRules {
            multicolumn: vec![MultiColumnRule {
                name: "trust".into(),
                columns: vec!["a".into(), "b".into()],
                dictionary: SubstitutionMap::new(vec![
                    (Value::text("veel"), Value::Integer(2)),
                    (Value::Boolean(true), Value::text("yes")),
                ]),
            }],
            ..ReplacementRules::default()
        };
        let log = WarningLog::new();
        let outcome =
            apply_replacements(table, &rules, None, &ReplaceOptions::default(), &log).unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].column, "trust");
        assert_eq!(outcome.table.column("a").unwrap().values, vec![Value::text("veel")]);
        assert!(log.contains("error in trust"));
    }

    #[test]
    fn numeric_stage_coerces_unparsable_to_missing() {
        let table = Table::new(vec![text_column("hours", &["12", "twelve", "", "7.5"])]).unwrap();
        let rules = ReplacementRules {
            numeric: vec!["hours".into()],
            ..ReplacementRules::default()
        };
        let outcome = apply_replacements(
            table,
            &rules,
            None,
            &ReplaceOptions::default(),
            &WarningLog::new(),
        )
        .unwrap();
        let hours = outcome.table.column("hours").unwrap();
        assert_eq!(hours.kind, ColumnKind::Float);
        assert_eq!(
            hours.values,
            vec![Value::Float(12.0), Value::NAN, Value::NAN, Value::Float(7.5)]
        );
    }

    #[test]
    fn mixed_missing_markers_collapse() {
        let table = Table::new(vec![Column::new(
            "q",
            vec![
                Value::Missing(Missing::Blank),
                Value::text("x"),
                Value::Missing(Missing::Null),
            ],
        )])
        .unwrap();
        let outcome = apply_replacements(
            table,
            &ReplacementRules::default(),
            None,
            &ReplaceOptions::default(),
            &WarningLog::new(),
        )
        .unwrap();
        let markers = outcome.table.column("q").unwrap().missing_markers();
        assert_eq!(markers.len(), 1);
    }
}
