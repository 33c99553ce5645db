//! In-memory typed tables.

use std::{collections::BTreeSet, fmt};

use anyhow::{Result, anyhow};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    data::{Missing, Value},
    error::HarmonizeError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySet {
    pub labels: Vec<Value>,
    pub ordered: bool,
}

impl CategorySet {
    pub fn new(labels: Vec<Value>, ordered: bool) -> Self {
        Self { labels, ordered }
    }

    /// Position of the label `value` matches; numbers match labels that spell
    /// them, so a promoted `2` finds the label `"2"`.
    pub fn position(&self, value: &Value) -> Option<usize> {
        self.labels.iter().position(|label| value.matches_label(label))
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.position(value).is_some()
    }

    pub fn label_strings(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.as_display()).collect()
    }
}

/// The final representation assigned to a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Untyped or mixed content awaiting manual cleaning.
    Object,
    Float,
    Integer,
    Boolean,
    Categorical(CategorySet),
}

impl ColumnKind {
    pub fn is_categorical(&self) -> bool {
        matches!(self, ColumnKind::Categorical(_))
    }

    pub fn categories(&self) -> Option<&CategorySet> {
        match self {
            ColumnKind::Categorical(set) => Some(set),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ColumnKind::Object => "object",
            ColumnKind::Float => "float",
            ColumnKind::Integer => "Int64",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Categorical(set) if set.ordered => "ordered category",
            ColumnKind::Categorical(_) => "category",
        }
    }

    /// Whether `value` is representable in a column of this kind.
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Missing(_)) => true,
            (ColumnKind::Object, _) => true,
            (ColumnKind::Float, Value::Float(_) | Value::Integer(_)) => true,
            (ColumnKind::Integer, v) => v.as_integral().is_some(),
            (ColumnKind::Boolean, Value::Boolean(_)) => true,
            (ColumnKind::Categorical(set), v) => set.contains(v),
            _ => false,
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::Categorical(set) => write!(
                f,
                "{}[{}]",
                self.name(),
                set.label_strings().join("|")
            ),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Object,
            values,
        }
    }

    pub fn with_kind(name: impl Into<String>, kind: ColumnKind, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn present(&self) -> impl Iterator<Item = &Value> {
        self.values.iter().filter(|v| !v.is_missing())
    }

    pub fn is_all_missing(&self) -> bool {
        self.values.iter().all(Value::is_missing)
    }

    pub fn missing_markers(&self) -> BTreeSet<Missing> {
        self.values.iter().filter_map(Value::missing_marker).collect()
    }

    pub fn has_mixed_missing(&self) -> bool {
        self.missing_markers().len() > 1
    }

    /// Folds every missing marker into the canonical one.
    pub fn canonicalize_missing(&mut self) -> bool {
        let mut changed = false;
        for value in &mut self.values {
            if let Value::Missing(marker) = value
                && *marker != Missing::CANONICAL
            {
                *value = Value::NAN;
                changed = true;
            }
        }
        changed
    }

    /// Distinct non-missing values in sorted order.
    pub fn distinct(&self) -> Vec<Value> {
        self.present().cloned().sorted().dedup().collect()
    }

    /// Ordinal category codes, `None` where the value is missing.
    pub fn codes(&self) -> Option<Vec<Option<usize>>> {
        let set = self.kind.categories()?;
        Some(
            self.values
                .iter()
                .map(|v| if v.is_missing() { None } else { set.position(v) })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
    #[serde(default)]
    index: Vec<String>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let duplicates = columns
            .iter()
            .map(|c| c.name.as_str())
            .duplicates()
            .map(str::to_string)
            .collect::<Vec<_>>();
        if !duplicates.is_empty() {
            return Err(HarmonizeError::DuplicateColumns(duplicates).into());
        }
        if let Some((first, rest)) = columns.split_first()
            && let Some(bad) = rest.iter().find(|c| c.len() != first.len())
        {
            return Err(anyhow!(
                "Column '{}' has {} rows but '{}' has {}",
                bad.name,
                bad.len(),
                first.name,
                first.len()
            ));
        }
        Ok(Self {
            columns,
            index: Vec::new(),
        })
    }

    /// Builds an untyped table from text headers and raw rows.
    pub fn from_rows(headers: &[String], rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut columns = headers
            .iter()
            .map(|h| Column::new(h.clone(), Vec::with_capacity(rows.len())))
            .collect::<Vec<_>>();
        for (row_idx, row) in rows.into_iter().enumerate() {
            if row.len() != columns.len() {
                return Err(anyhow!(
                    "Row {} has {} fields but {} headers were given",
                    row_idx + 1,
                    row.len(),
                    columns.len()
                ));
            }
            for (column, value) in columns.iter_mut().zip(row) {
                column.values.push(value);
            }
        }
        Self::new(columns)
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn push_column(&mut self, column: Column) -> Result<()> {
        if self.has_column(&column.name) {
            return Err(HarmonizeError::DuplicateColumns(vec![column.name]).into());
        }
        if !self.columns.is_empty() && column.len() != self.row_count() {
            return Err(anyhow!(
                "Column '{}' has {} rows but the table has {}",
                column.name,
                column.len(),
                self.row_count()
            ));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Adds the column, replacing an existing one of the same name in place.
    pub fn set_column(&mut self, column: Column) -> Result<()> {
        match self.position(&column.name) {
            Some(idx) => {
                if column.len() != self.row_count() {
                    return Err(anyhow!(
                        "Column '{}' has {} rows but the table has {}",
                        column.name,
                        column.len(),
                        self.row_count()
                    ));
                }
                self.columns[idx] = column;
                Ok(())
            }
            None => self.push_column(column),
        }
    }

    pub fn remove_column(&mut self, name: &str) -> Option<Column> {
        let idx = self.position(name)?;
        self.index.retain(|key| key != name);
        Some(self.columns.remove(idx))
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if self.has_column(to) {
            return Err(HarmonizeError::DuplicateColumns(vec![to.to_string()]).into());
        }
        let column = self
            .column_mut(from)
            .ok_or_else(|| anyhow!("Column '{from}' not found"))?;
        column.name = to.to_string();
        for key in &mut self.index {
            if key == from {
                *key = to.to_string();
            }
        }
        Ok(())
    }

    pub fn index(&self) -> &[String] {
        &self.index
    }

    pub fn set_index(&mut self, keys: &[&str]) -> Result<()> {
        for key in keys {
            if !self.has_column(key) {
                return Err(HarmonizeError::IndexColumn(key.to_string()).into());
            }
        }
        self.index = keys.iter().map(|k| k.to_string()).collect();
        Ok(())
    }

    pub fn row(&self, row: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| &c.values[row]).collect()
    }

    /// Reorders every column by the given row permutation.
    pub fn take_rows(&mut self, order: &[usize]) {
        for column in &mut self.columns {
            let reordered = order.iter().map(|&i| column.values[i].clone()).collect();
            column.values = reordered;
        }
    }

    pub fn canonicalize_missing(&mut self) -> Vec<String> {
        self.columns
            .iter_mut()
            .filter_map(|c| c.canonicalize_missing().then(|| c.name.clone()))
            .collect()
    }
}
