//! Category-set validation for declared categorical columns.

use log::debug;

use crate::{
    data::Value,
    error::{CategoryViolation, HarmonizeError, SchemaViolations},
    frame::{CategorySet, Column, ColumnKind},
};

/// Checks that every observed value of `column` is one of `labels` and, if so,
/// returns the column typed as a categorical over exactly those labels.
///
/// Values are stored as the label they match, so numeric text such as `"3"`
/// becomes the integer label `3` and a promoted `3` becomes the text label
/// `"3"`. Ordering defaults to unordered.
pub fn validate_categories(
    column: Column,
    labels: &[Value],
    ordered: Option<bool>,
) -> Result<Column, CategoryViolation> {
    let set = CategorySet::new(labels.to_vec(), ordered.unwrap_or(false));

    let mut values = Vec::with_capacity(column.len());
    let mut unseen: Vec<Value> = Vec::new();
    for value in &column.values {
        if value.is_missing() {
            values.push(Value::NAN);
            continue;
        }
        match set.position(value) {
            Some(idx) => values.push(set.labels[idx].clone()),
            None => {
                if !unseen.iter().any(|u| u.loose_eq(value)) {
                    unseen.push(value.clone());
                }
                values.push(value.clone());
            }
        }
    }

    if !unseen.is_empty() {
        unseen.sort();
        return Err(CategoryViolation {
            column: column.name,
            unseen: unseen.iter().map(Value::as_display).collect(),
            labels: set.label_strings(),
        });
    }
    debug!(
        "Column '{}' typed as {} with {} label(s)",
        column.name,
        if set.ordered { "ordered category" } else { "category" },
        set.labels.len()
    );
    Ok(Column::with_kind(
        column.name,
        ColumnKind::Categorical(set),
        values,
    ))
}

/// Accumulates violations across a table so they surface as one error.
#[derive(Debug, Default)]
pub struct CategoryReport {
    violations: Vec<CategoryViolation>,
}

impl CategoryReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: CategoryViolation) {
        self.violations.push(violation);
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn finish(self) -> Result<(), HarmonizeError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(HarmonizeError::Schema(SchemaViolations(self.violations)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(values: &[&str]) -> Vec<Value> {
        values.iter().map(|v| Value::text(*v)).collect()
    }

    #[test]
    fn covered_column_becomes_categorical() {
        let column = Column::new(
            "health",
            vec![Value::text("good"), Value::NAN, Value::text("poor")],
        );
        let typed = validate_categories(column, &labels(&["poor", "good"]), Some(true)).unwrap();
        let set = typed.kind.categories().unwrap();
        assert!(set.ordered);
        assert_eq!(typed.codes().unwrap(), vec![Some(1), None, Some(0)]);
    }

    #[test]
    fn single_unseen_value_names_column_and_value() {
        let column = Column::new("health", vec![Value::text("good"), Value::text("excellent")]);
        let violation =
            validate_categories(column, &labels(&["poor", "good"]), None).unwrap_err();
        assert_eq!(violation.column, "health");
        assert_eq!(violation.unseen, vec!["excellent".to_string()]);
        let message = violation.to_string();
        assert!(message.contains("health"));
        assert!(message.contains("excellent"));
    }

    #[test]
    fn numeric_text_matches_integer_labels() {
        let column = Column::new("floor", vec![Value::text("2"), Value::Float(3.0)]);
        let typed = validate_categories(
            column,
            &[Value::Integer(1), Value::Integer(2), Value::Integer(3)],
            None,
        )
        .unwrap();
        assert_eq!(typed.values, vec![Value::Integer(2), Value::Integer(3)]);
        assert!(!typed.kind.categories().unwrap().ordered);
    }

    #[test]
    fn promoted_numbers_match_text_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wave.csv");
        std::fs::write(&path, "kids,more\n2,3\n1,1\n").unwrap();
        let raw = crate::io_utils::read_raw_table(&path, b',', encoding_rs::UTF_8).unwrap();
        let kids = raw.column("kids").unwrap().clone();
        assert_eq!(kids.values, vec![Value::Integer(2), Value::Integer(1)]);

        let labels = crate::schema::parse_category_labels("none|1|2|3 or more", None);
        let typed = validate_categories(kids, &labels, Some(true)).unwrap();
        assert_eq!(typed.values, vec![Value::text("2"), Value::text("1")]);
        assert_eq!(typed.codes().unwrap(), vec![Some(2), Some(1)]);

        let more = raw.column("more").unwrap().clone();
        let violation = validate_categories(more, &labels, Some(true)).unwrap_err();
        assert_eq!(violation.unseen, vec!["3".to_string()]);
    }

    #[test]
    fn report_consolidates_columns() {
        let mut report = CategoryReport::new();
        for name in ["a", "b"] {
            let column = Column::new(name, vec![Value::text("x")]);
            if let Err(violation) = validate_categories(column, &labels(&["y"]), None) {
                report.push(violation);
            }
        }
        let err = report.finish().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("row a"));
        assert!(message.contains("row b"));
    }
}
