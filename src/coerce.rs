//! Type assignment for harmonized tables.
//!
//! With a renaming file that declares types, every declared column is cast to
//! its declared representation; undeclared columns fall through to inference.
//! Inference looks only at the observed non-missing values:
//!
//! 1. numeric text is read as numbers
//! 2. integral numbers: exactly `{0, 1}` is boolean, a small domain (`0..=10`
//!    or a year in `1990..2030`) is an ordered categorical, anything else is an
//!    integer
//! 3. non-integral numbers are floats
//! 4. booleans stay boolean, categoricals stay categorical
//! 5. plain text becomes an unordered categorical when it has few distinct
//!    values and stays untyped otherwise
//! 6. anything else is flagged for manual cleaning and left untyped

use std::collections::BTreeSet;

use anyhow::Result;
use log::{debug, info};

use crate::{
    categories::{CategoryReport, validate_categories},
    data::{Value, parse_boolean_token},
    error::HarmonizeError,
    frame::{CategorySet, Column, ColumnKind, Table},
    schema::{DeclaredType, RenameSpec, SpecRecord},
    warnings::{WarningSink, report_warning},
};

pub const DEFAULT_CATEGORY_THRESHOLD: usize = 18;
pub const INDEX_COLUMNS: &[&str] = &["personal_id", "year"];

#[derive(Debug, Clone)]
pub struct TypeOptions {
    pub int_to_float: bool,
    pub bool_to_float: bool,
    /// Maximum distinct text values for inferring a categorical.
    pub category_value_count_threshold: usize,
    pub few_values_to_category: bool,
    /// Treat `scale` declarations as plain categoricals instead of positions.
    pub scale_as_category: bool,
    pub category_separator: Option<String>,
    /// Columns forced to integers whatever their declaration.
    pub index_columns: Vec<String>,
}

impl Default for TypeOptions {
    fn default() -> Self {
        Self {
            int_to_float: true,
            bool_to_float: true,
            category_value_count_threshold: DEFAULT_CATEGORY_THRESHOLD,
            few_values_to_category: true,
            scale_as_category: false,
            category_separator: None,
            index_columns: INDEX_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Assigns every column of `table` its final representation.
///
/// Category violations are collected over the whole table and returned as one
/// [`HarmonizeError::Schema`].
pub fn assign_types(
    table: Table,
    spec: Option<&RenameSpec>,
    options: &TypeOptions,
    sink: &dyn WarningSink,
) -> Result<Table> {
    let explicit = spec.filter(|s| s.has_type_column);
    let mut report = CategoryReport::new();
    let mut table = table;

    for column in table.columns_mut() {
        let record = explicit
            .and_then(|s| s.record(&column.name))
            .filter(|r| r.declared_type.is_some());
        let current = std::mem::replace(column, Column::new(String::new(), Vec::new()));
        *column = match record {
            Some(record) => coerce_declared(current, record, options, &mut report, sink),
            None => infer_column(current, options, sink),
        };
    }
    report.finish()?;

    for name in &options.index_columns {
        if let Some(column) = table.column_mut(name) {
            force_index(column)?;
        }
    }
    info!(
        "Assigned types to {} column(s) ({} mode)",
        table.width(),
        if explicit.is_some() { "declared" } else { "inferred" }
    );
    Ok(table)
}

fn effective_type(declared: DeclaredType, options: &TypeOptions) -> DeclaredType {
    match declared {
        DeclaredType::Scale if options.scale_as_category => DeclaredType::Categorical,
        DeclaredType::Integer if options.int_to_float => DeclaredType::Float,
        DeclaredType::Boolean if options.bool_to_float => DeclaredType::Float,
        other => other,
    }
}

fn coerce_declared(
    column: Column,
    record: &SpecRecord,
    options: &TypeOptions,
    report: &mut CategoryReport,
    sink: &dyn WarningSink,
) -> Column {
    let Some(declared) = record.declared_type else {
        return infer_column(column, options, sink);
    };
    let separator = options.category_separator.as_deref();
    match effective_type(declared, options) {
        DeclaredType::Categorical => match record.category_labels(separator) {
            Some(labels) => match validate_categories(column.clone(), &labels, record.ordered) {
                Ok(typed) => typed,
                Err(violation) => {
                    report.push(violation);
                    column
                }
            },
            None => to_observed_categorical(column, record.ordered.unwrap_or(false)),
        },
        DeclaredType::Scale => {
            let column = match record.category_labels(separator) {
                Some(labels) => match scale_positions(&column, &labels) {
                    Ok(Some(mapped)) => mapped,
                    Ok(None) => column,
                    Err(unmatched) => {
                        report_warning!(
                            sink,
                            "Problem converting to scale var: {} ({unmatched} not in {})",
                            column.name,
                            record.categories.as_deref().unwrap_or_default()
                        );
                        return column;
                    }
                },
                None => {
                    report_warning!(sink, "Problem converting to scale var: {} has no categories", column.name);
                    return column;
                }
            };
            let target = if options.int_to_float {
                DeclaredType::Float
            } else {
                DeclaredType::Integer
            };
            cast_or_warn(column, target, sink)
        }
        other => cast_or_warn(column, other, sink),
    }
}

fn cast_or_warn(column: Column, target: DeclaredType, sink: &dyn WarningSink) -> Column {
    match cast(&column, target) {
        Some(cast) => cast,
        None => {
            report_warning!(sink, "could not convert {} to {}", column.name, target);
            column
        }
    }
}

/// Casts every value, or returns `None` if any value does not fit.
pub fn cast(column: &Column, target: DeclaredType) -> Option<Column> {
    let kind = match target {
        DeclaredType::Float => ColumnKind::Float,
        DeclaredType::Integer | DeclaredType::Scale => ColumnKind::Integer,
        DeclaredType::Boolean => ColumnKind::Boolean,
        DeclaredType::Categorical => {
            return Some(to_observed_categorical(column.clone(), false));
        }
    };
    let values = column
        .values
        .iter()
        .map(|value| cast_value(value, &kind))
        .collect::<Option<Vec<_>>>()?;
    Some(Column::with_kind(column.name.clone(), kind, values))
}

fn cast_value(value: &Value, kind: &ColumnKind) -> Option<Value> {
    if value.is_missing() || matches!(value.to_numeric(), Some(Value::Missing(_))) {
        return Some(Value::NAN);
    }
    match kind {
        ColumnKind::Float => value.to_numeric().and_then(|n| n.as_f64()).map(Value::float),
        ColumnKind::Integer => value.to_numeric().and_then(|n| n.as_integral()).map(Value::Integer),
        ColumnKind::Boolean => match value {
            Value::Boolean(b) => Some(Value::Boolean(*b)),
            Value::Text(text) => parse_boolean_token(text).map(Value::Boolean),
            other => match other.as_integral() {
                Some(0) => Some(Value::Boolean(false)),
                Some(1) => Some(Value::Boolean(true)),
                _ => None,
            },
        },
        _ => Some(value.clone()),
    }
}

/// Maps scale labels to their ordinal positions.
///
/// Textual labels are tried first, with numeric cells matching the labels
/// that spell them, then the labels read as integers. Columns
/// that are already typed are taken to hold positions and are left alone.
/// Returns the name of an unmatched value on failure.
fn scale_positions(column: &Column, labels: &[Value]) -> Result<Option<Column>, String> {
    if column.kind != ColumnKind::Object {
        return Ok(None);
    }
    let textual = labels
        .iter()
        .map(|l| Value::text(l.as_display()))
        .collect::<Vec<_>>();
    let numeric = labels
        .iter()
        .map(|l| l.as_display().parse::<i64>().ok().map(Value::Integer))
        .collect::<Option<Vec<_>>>();

    let by_text = map_positions(column, &textual, false);
    let mapped = match (by_text, numeric) {
        (Ok(values), _) => values,
        (Err(_), Some(numeric)) => map_positions(column, &numeric, true)?,
        (Err(unmatched), None) => return Err(unmatched),
    };
    Ok(Some(Column::with_kind(
        column.name.clone(),
        ColumnKind::Object,
        mapped,
    )))
}

fn map_positions(column: &Column, labels: &[Value], numeric: bool) -> Result<Vec<Value>, String> {
    column
        .values
        .iter()
        .map(|value| {
            if value.is_missing() {
                return Ok(Value::NAN);
            }
            let cell = if numeric {
                value.to_numeric().unwrap_or_else(|| value.clone())
            } else {
                value.clone()
            };
            labels
                .iter()
                .position(|label| cell.matches_label(label))
                .map(|pos| Value::Integer(pos as i64))
                .ok_or_else(|| value.as_display())
        })
        .collect()
}

fn to_observed_categorical(column: Column, ordered: bool) -> Column {
    let labels = column.distinct();
    let values = column
        .values
        .into_iter()
        .map(|v| if v.is_missing() { Value::NAN } else { v })
        .collect();
    Column::with_kind(
        column.name,
        ColumnKind::Categorical(CategorySet::new(labels, ordered)),
        values,
    )
}

/// The outcome of looking at a column's observed values.
#[derive(Debug, Clone, PartialEq)]
pub enum Inference {
    Float,
    Integer,
    Boolean,
    Categorical(CategorySet),
    /// Text with too many distinct values to be a category.
    Text,
    /// Incompatible kinds of values; needs manual cleaning.
    Mixed,
}

#[derive(Debug, Default)]
struct Observation {
    present: usize,
    booleans: usize,
    text_cells: usize,
    texts: BTreeSet<String>,
    numbers: Vec<Value>,
    non_numeric_text: usize,
}

impl Observation {
    fn of(column: &Column) -> Self {
        let mut obs = Observation::default();
        for value in column.present() {
            obs.present += 1;
            match value {
                Value::Boolean(_) => obs.booleans += 1,
                Value::Text(text) => {
                    obs.text_cells += 1;
                    obs.texts.insert(text.clone());
                    match crate::data::parse_numeric(text) {
                        Some(number) if !number.is_missing() => obs.numbers.push(number),
                        _ => obs.non_numeric_text += 1,
                    }
                }
                number => obs.numbers.push(number.clone()),
            }
        }
        obs
    }

    fn all_numeric(&self) -> bool {
        self.numbers.len() == self.present
    }

    fn all_text(&self) -> bool {
        self.text_cells == self.present && self.non_numeric_text > 0
    }
}

/// Decides the representation of an undeclared column.
pub fn infer(column: &Column, options: &TypeOptions) -> Inference {
    if let ColumnKind::Categorical(set) = &column.kind {
        return Inference::Categorical(set.clone());
    }
    let obs = Observation::of(column);
    if obs.present == 0 {
        return Inference::Float;
    }
    if obs.booleans == obs.present {
        return Inference::Boolean;
    }
    if obs.all_numeric() {
        let integral = obs
            .numbers
            .iter()
            .map(Value::as_integral)
            .collect::<Option<BTreeSet<i64>>>();
        return match integral {
            Some(distinct) if distinct.len() == 2 && distinct.contains(&0) && distinct.contains(&1) => {
                Inference::Boolean
            }
            Some(distinct)
                if options.few_values_to_category
                    && (distinct.iter().all(|v| (0..=10).contains(v))
                        || distinct.iter().all(|v| (1990..2030).contains(v))) =>
            {
                Inference::Categorical(CategorySet::new(
                    distinct.into_iter().map(Value::Integer).collect(),
                    true,
                ))
            }
            Some(_) => Inference::Integer,
            None => Inference::Float,
        };
    }
    if obs.all_text() {
        return if obs.texts.len() <= options.category_value_count_threshold {
            Inference::Categorical(CategorySet::new(
                obs.texts.into_iter().map(Value::Text).collect(),
                false,
            ))
        } else {
            Inference::Text
        };
    }
    Inference::Mixed
}

/// Infers and applies a representation for one column.
pub fn infer_column(column: Column, options: &TypeOptions, sink: &dyn WarningSink) -> Column {
    let inference = infer(&column, options);
    debug!("Column '{}' inferred as {:?}", column.name, inference);
    let target = match inference {
        Inference::Float => Some(ColumnKind::Float),
        Inference::Integer if options.int_to_float => Some(ColumnKind::Float),
        Inference::Integer => Some(ColumnKind::Integer),
        Inference::Boolean if options.bool_to_float => Some(ColumnKind::Float),
        Inference::Boolean => Some(ColumnKind::Boolean),
        Inference::Categorical(set) => Some(ColumnKind::Categorical(set)),
        Inference::Text => None,
        Inference::Mixed => {
            report_warning!(
                sink,
                "{} contains bad combination of values! Either further cleaning is required or an error occured",
                column.name
            );
            None
        }
    };
    let Some(kind) = target else {
        return Column::with_kind(column.name, ColumnKind::Object, column.values);
    };
    if column.kind == kind {
        return column;
    }
    match convert(&column, &kind) {
        Some(converted) => converted,
        None => {
            report_warning!(sink, "{} cannot be converted to inferred type.", column.name);
            column
        }
    }
}

fn convert(column: &Column, kind: &ColumnKind) -> Option<Column> {
    let values = match kind {
        ColumnKind::Categorical(set) => column
            .values
            .iter()
            .map(|value| {
                if value.is_missing() {
                    return Some(Value::NAN);
                }
                set.position(value).map(|idx| set.labels[idx].clone())
            })
            .collect::<Option<Vec<_>>>()?,
        other => column
            .values
            .iter()
            .map(|value| cast_value(value, other))
            .collect::<Option<Vec<_>>>()?,
    };
    Some(Column::with_kind(column.name.clone(), kind.clone(), values))
}

fn force_index(column: &mut Column) -> Result<()> {
    let values = column
        .values
        .iter()
        .map(|value| value.to_numeric().and_then(|n| n.as_integral()))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| HarmonizeError::IndexColumn(column.name.clone()))?;
    column.values = values.into_iter().map(Value::Integer).collect();
    column.kind = ColumnKind::Integer;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warnings::WarningLog;

    fn raw(name: &str, values: &[&str]) -> Column {
        Column::new(name, values.iter().map(|v| Value::from_raw(v)).collect())
    }

    #[test]
    fn zero_one_column_is_boolean_not_integer() {
        let options = TypeOptions {
            bool_to_float: false,
            ..TypeOptions::default()
        };
        let typed = infer_column(raw("employed", &["0", "1", "", "1"]), &options, &WarningLog::new());
        assert_eq!(typed.kind, ColumnKind::Boolean);
        assert_eq!(
            typed.values,
            vec![Value::Boolean(false), Value::Boolean(true), Value::NAN, Value::Boolean(true)]
        );
        let as_float = infer_column(raw("employed", &["0", "1"]), &TypeOptions::default(), &WarningLog::new());
        assert_eq!(as_float.kind, ColumnKind::Float);
    }

    #[test]
    fn few_integers_become_ordered_categorical() {
        let typed = infer_column(raw("rating", &["1", "3", "5", "7", "3"]), &TypeOptions::default(), &WarningLog::new());
        let set = typed.kind.categories().unwrap();
        assert!(set.ordered);
        assert_eq!(
            set.labels,
            vec![Value::Integer(1), Value::Integer(3), Value::Integer(5), Value::Integer(7)]
        );
    }

    #[test]
    fn years_become_ordered_categorical_and_large_integers_do_not() {
        let options = TypeOptions::default();
        let years = infer(&raw("y", &["2019", "2020"]), &options);
        assert!(matches!(years, Inference::Categorical(set) if set.ordered));
        let ids = infer(&raw("id", &["800001", "800002"]), &options);
        assert_eq!(ids, Inference::Integer);
        let fractional = infer(&raw("share", &["0.5", "2"]), &options);
        assert_eq!(fractional, Inference::Float);
    }

    #[test]
    fn mixed_column_is_flagged_and_left_untyped() {
        let column = Column::new("q", vec![Value::Integer(3), Value::text("weet niet")]);
        let log = WarningLog::new();
        let typed = infer_column(column.clone(), &TypeOptions::default(), &log);
        assert_eq!(typed.kind, ColumnKind::Object);
        assert_eq!(typed.values, column.values);
        assert!(log.contains("q contains bad combination of values"));
    }

    #[test]
    fn free_text_stays_object_without_warning() {
        let answers = (0..30).map(|i| format!("answer {i}")).collect::<Vec<_>>();
        let refs = answers.iter().map(String::as_str).collect::<Vec<_>>();
        let log = WarningLog::new();
        let typed = infer_column(raw("remarks", &refs), &TypeOptions::default(), &log);
        assert_eq!(typed.kind, ColumnKind::Object);
        assert!(log.is_empty());
    }

    #[test]
    fn scale_labels_map_to_positions() {
        let column = raw("level", &["low", "medium", "high", ""]);
        let spec = RenameSpec::from_records(
            "d",
            vec![
                SpecRecord::new("level")
                    .with_type(DeclaredType::Scale)
                    .with_categories("low|medium|high", None),
            ],
        )
        .unwrap();
        let options = TypeOptions {
            int_to_float: false,
            ..TypeOptions::default()
        };
        let table = Table::new(vec![column]).unwrap();
        let typed = assign_types(table, Some(&spec), &options, &WarningLog::new()).unwrap();
        let level = typed.column("level").unwrap();
        assert_eq!(level.kind, ColumnKind::Integer);
        assert_eq!(
            level.values,
            vec![Value::Integer(0), Value::Integer(1), Value::Integer(2), Value::NAN]
        );
    }

    #[test]
    fn numeric_scale_labels_fall_back_to_integers() {
        let column = raw("agree", &["1", "5", "3"]);
        let labels = crate::schema::parse_category_labels("1|2|3|4|5", None);
        let mapped = scale_positions(&column, &labels).unwrap().unwrap();
        assert_eq!(
            mapped.values,
            vec![Value::Integer(0), Value::Integer(4), Value::Integer(2)]
        );
    }

    #[test]
    fn promoted_cells_map_onto_mixed_scale_labels() {
        let column = Column::new("freq", vec![Value::Integer(1), Value::Integer(2), Value::NAN]);
        let labels = crate::schema::parse_category_labels("0|1|2|3 or more", None);
        let mapped = scale_positions(&column, &labels).unwrap().unwrap();
        assert_eq!(
            mapped.values,
            vec![Value::Integer(1), Value::Integer(2), Value::NAN]
        );
        let unmatched = Column::new("freq", vec![Value::Integer(4)]);
        assert_eq!(scale_positions(&unmatched, &labels).unwrap_err(), "4");
    }

    #[test]
    fn failed_cast_warns_and_keeps_column() {
        let spec = RenameSpec::from_records(
            "d",
            vec![SpecRecord::new("hours").with_type(DeclaredType::Float)],
        )
        .unwrap();
        let table = Table::new(vec![raw("hours", &["12", "many"])]).unwrap();
        let log = WarningLog::new();
        let typed = assign_types(table, Some(&spec), &TypeOptions::default(), &log).unwrap();
        assert_eq!(typed.column("hours").unwrap().kind, ColumnKind::Object);
        assert!(log.contains("could not convert hours to float64"));
    }

    #[test]
    fn index_columns_are_forced_to_integers() {
        let table = Table::new(vec![
            raw("personal_id", &["800001", "800002"]),
            raw("year", &["2020", "2020"]),
        ])
        .unwrap();
        let typed = assign_types(table, None, &TypeOptions::default(), &WarningLog::new()).unwrap();
        for name in ["personal_id", "year"] {
            assert_eq!(typed.column(name).unwrap().kind, ColumnKind::Integer);
        }
        let broken = Table::new(vec![raw("personal_id", &["1", ""])]).unwrap();
        assert!(assign_types(broken, None, &TypeOptions::default(), &WarningLog::new()).is_err());
    }
}
