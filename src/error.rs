use std::fmt;

use thiserror::Error;

/// One categorical column whose observed values escape its declared label set.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryViolation {
    pub column: String,
    pub unseen: Vec<String>,
    pub labels: Vec<String>,
}

impl fmt::Display for CategoryViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} missing in row {} of renaming file which only contains {:?}",
            self.unseen, self.column, self.labels
        )
    }
}

/// Every category violation found while typing one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaViolations(pub Vec<CategoryViolation>);

impl SchemaViolations {
    pub fn columns(&self) -> Vec<&str> {
        self.0.iter().map(|v| v.column.as_str()).collect()
    }
}

impl fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self.0.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        write!(f, "{}", lines.join("\n"))
    }
}

/// A per-column substitution that could not be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SubstitutionFailure {
    pub column: String,
    pub stage: &'static str,
    pub reason: String,
}

impl fmt::Display for SubstitutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.column, self.stage, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum HarmonizeError {
    #[error("invalid specification for {dataset}: {message}")]
    InvalidSpecification { dataset: String, message: String },

    #[error("new variable names {names:?} of {dataset} exceed {limit} characters")]
    NameTooLong {
        dataset: String,
        names: Vec<String>,
        limit: usize,
    },

    #[error("new variable names {names:?} of {dataset} are not unique")]
    DuplicateNames { dataset: String, names: Vec<String> },

    #[error("unknown type '{declared}' for {column} in {dataset}")]
    UnknownType {
        dataset: String,
        column: String,
        declared: String,
    },

    #[error("variables {columns:?} referenced by the replacement rules of {dataset} are not in the data")]
    MissingVariables { dataset: String, columns: Vec<String> },

    #[error("variables {columns:?} listed for {file} in the renaming file of {dataset} are not in the data")]
    MissingSourceVariables {
        dataset: String,
        file: String,
        columns: Vec<String>,
    },

    #[error("{0}")]
    Schema(SchemaViolations),

    #[error("{} substitution(s) failed: {}", .0.len(), join_failures(.0))]
    SubstitutionFailures(Vec<SubstitutionFailure>),

    #[error("duplicate column names {0:?}")]
    DuplicateColumns(Vec<String>),

    #[error("index ({columns}) is not unique, e.g. {example}")]
    DuplicateKeys { columns: String, example: String },

    #[error("index column '{0}' is missing or has missing values")]
    IndexColumn(String),

    #[error("cannot export {name}: {message}")]
    ExportPrecondition { name: String, message: String },
}

fn join_failures(failures: &[SubstitutionFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consolidated_schema_error_lists_every_column() {
        let err = HarmonizeError::Schema(SchemaViolations(vec![
            CategoryViolation {
                column: "health".into(),
                unseen: vec!["bad".into()],
                labels: vec!["good".into(), "poor".into()],
            },
            CategoryViolation {
                column: "mood".into(),
                unseen: vec!["4".into()],
                labels: vec!["1".into(), "2".into()],
            },
        ]));
        let message = err.to_string();
        assert!(message.contains("health"));
        assert!(message.contains("mood"));
        assert!(message.contains("\"bad\""));
    }

    #[test]
    fn substitution_failures_render_count() {
        let err = HarmonizeError::SubstitutionFailures(vec![SubstitutionFailure {
            column: "age".into(),
            stage: "replacing",
            reason: "cannot put text into an integer column".into(),
        }]);
        assert!(err.to_string().starts_with("1 substitution(s) failed: age (replacing)"));
    }
}
