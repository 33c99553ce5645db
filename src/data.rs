use std::{cmp::Ordering, fmt};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// The ways a cell can say "no value".
///
/// Raw extracts produce `Blank`, YAML `~`/`null` produce `Null`, failed numeric
/// parses and YAML `.nan` produce `NotANumber`. After harmonization a column
/// carries at most one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Missing {
    NotANumber,
    Null,
    Blank,
}

impl Missing {
    pub const CANONICAL: Missing = Missing::NotANumber;

    pub fn as_str(&self) -> &'static str {
        match self {
            Missing::NotANumber => "NaN",
            Missing::Null => "<NA>",
            Missing::Blank => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Missing(Missing),
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl Eq for Value {}

impl Value {
    pub const NAN: Value = Value::Missing(Missing::CANONICAL);

    /// Builds a float cell, folding NaN into the canonical missing marker and
    /// `-0.0` into `0.0`.
    pub fn float(value: f64) -> Self {
        if value.is_nan() {
            Value::NAN
        } else if value == 0.0 {
            Value::Float(0.0)
        } else {
            Value::Float(value)
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    /// Interprets a raw extract cell: empty cells are blank missing values,
    /// everything else stays text until a later stage decides otherwise.
    pub fn from_raw(raw: &str) -> Self {
        if raw.trim().is_empty() {
            Value::Missing(Missing::Blank)
        } else {
            Value::Text(raw.to_string())
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing(_))
    }

    pub fn missing_marker(&self) -> Option<Missing> {
        match self {
            Value::Missing(marker) => Some(*marker),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the integer this value represents exactly, if any.
    pub fn as_integral(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 => {
                Some(*f as i64)
            }
            _ => None,
        }
    }

    /// Numeric reading of a cell the way a forced numeric conversion sees it:
    /// numbers stay numbers, numeric text is parsed, booleans become 0/1.
    pub fn to_numeric(&self) -> Option<Value> {
        match self {
            Value::Integer(_) | Value::Float(_) => Some(self.clone()),
            Value::Boolean(b) => Some(Value::Integer(i64::from(*b))),
            Value::Text(s) => parse_numeric(s),
            Value::Missing(_) => None,
        }
    }

    /// Equality used by substitution maps and category lookups.
    ///
    /// Integers and floats compare numerically, every missing marker matches
    /// every other missing marker.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Missing(_), Value::Missing(_)) => true,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (left, right) if left.is_numeric() && right.is_numeric() => {
                left.as_f64() == right.as_f64()
            }
            _ => false,
        }
    }

    /// Matching against a declared category label: `loose_eq`, plus numbers
    /// match text that spells the same number (`2` matches the label `"2"`).
    pub fn matches_label(&self, label: &Value) -> bool {
        if self.loose_eq(label) {
            return true;
        }
        match (self, label) {
            (Value::Text(text), number) | (number, Value::Text(text)) if number.is_numeric() => {
                parse_numeric(text).is_some_and(|parsed| parsed.loose_eq(number))
            }
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing(_) => "missing",
            Value::Text(_) => "text",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
        }
    }

    pub fn as_display(&self) -> String {
        match self {
            Value::Missing(marker) => marker.as_str().to_string(),
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Value::Boolean(b) => b.to_string(),
        }
    }

    /// Rendering for delimited text output, where every missing marker is blank.
    pub fn as_field(&self) -> String {
        match self {
            Value::Missing(_) => String::new(),
            other => other.as_display(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Missing(_) => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Missing(a), Value::Missing(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => cmp_f64(*a, *b),
            (Value::Integer(a), Value::Float(b)) => cmp_f64(*a as f64, *b).then(Ordering::Less),
            (Value::Float(a), Value::Integer(b)) => {
                cmp_f64(*a, *b as f64).then(Ordering::Greater)
            }
            (left, right) => left.rank().cmp(&right.rank()),
        }
    }
}

/// Numeric order that agrees with `==` on floats (`0.0` equals `-0.0`).
fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::NAN)
    }
}

/// Parses numeric text. Integers stay integers; `nan` parses to a missing value.
pub fn parse_numeric(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = trimmed.parse::<i64>() {
        return Some(Value::Integer(parsed));
    }
    trimmed.parse::<f64>().ok().map(Value::float)
}

pub fn parse_boolean_token(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" | "1.0" => Some(true),
        "false" | "f" | "no" | "n" | "0" | "0.0" => Some(false),
        _ => None,
    }
}

/// Converts a scalar from a YAML rules document into a cell value.
pub fn value_from_yaml(value: &serde_yaml::Value) -> Result<Value> {
    match value {
        serde_yaml::Value::Null => Ok(Value::Missing(Missing::Null)),
        serde_yaml::Value::Bool(b) => Ok(Value::Boolean(*b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::float(f))
            } else {
                Err(anyhow!("Unsupported numeric literal '{n}'"))
            }
        }
        serde_yaml::Value::String(s) => Ok(Value::Text(s.clone())),
        serde_yaml::Value::Tagged(tagged) => value_from_yaml(&tagged.value),
        other => Err(anyhow!(
            "Expected a scalar replacement value but found {other:?}"
        )),
    }
}

pub fn normalize_column_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect::<String>()
        .to_ascii_lowercase()
}

pub fn value_to_evalexpr(value: &Value) -> evalexpr::Value {
    match value {
        Value::Text(s) => evalexpr::Value::String(s.clone()),
        Value::Integer(i) => evalexpr::Value::Int(*i),
        Value::Float(f) => evalexpr::Value::Float(*f),
        Value::Boolean(b) => evalexpr::Value::Boolean(*b),
        Value::Missing(_) => evalexpr::Value::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_constructor_folds_nan_into_missing() {
        assert_eq!(Value::float(f64::NAN), Value::Missing(Missing::NotANumber));
        assert_eq!(Value::float(2.5), Value::Float(2.5));
    }

    #[test]
    fn parse_numeric_keeps_integers_and_rejects_text() {
        assert_eq!(parse_numeric(" 42 "), Some(Value::Integer(42)));
        assert_eq!(parse_numeric("4.5"), Some(Value::Float(4.5)));
        assert_eq!(parse_numeric("nan"), Some(Value::NAN));
        assert_eq!(parse_numeric("weet niet"), None);
        assert_eq!(parse_numeric(""), None);
    }

    #[test]
    fn loose_eq_crosses_numeric_variants_only() {
        assert!(Value::Integer(1).loose_eq(&Value::Float(1.0)));
        assert!(!Value::Integer(1).loose_eq(&Value::text("1")));
        assert!(Value::Missing(Missing::Blank).loose_eq(&Value::Missing(Missing::Null)));
        assert!(!Value::Boolean(true).loose_eq(&Value::Integer(1)));
    }

    #[test]
    fn ordering_is_total_across_variants() {
        let mut values = vec![
            Value::text("b"),
            Value::Float(2.5),
            Value::NAN,
            Value::Integer(2),
            Value::Boolean(true),
            Value::text("a"),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::NAN,
                Value::Boolean(true),
                Value::Integer(2),
                Value::Float(2.5),
                Value::text("a"),
                Value::text("b"),
            ]
        );
        assert!(Value::Integer(1) < Value::Float(1.0));
    }

    #[test]
    fn signed_zero_is_one_value() {
        assert_eq!(Value::float(-0.0), Value::Float(0.0));
        assert!(Value::float(-0.0).as_f64().unwrap().is_sign_positive());
        let (a, b) = (Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(a == b, a.cmp(&b) == Ordering::Equal);
        assert_eq!(Value::Integer(0).cmp(&b), Ordering::Less);
    }

    #[test]
    fn numbers_match_labels_spelled_as_text() {
        assert!(Value::Integer(2).matches_label(&Value::text("2")));
        assert!(Value::Float(2.0).matches_label(&Value::text("2")));
        assert!(Value::text("2").matches_label(&Value::Integer(2)));
        assert!(!Value::Integer(3).matches_label(&Value::text("3 or more")));
        assert!(!Value::text("none").matches_label(&Value::Integer(0)));
    }

    #[test]
    fn yaml_scalars_map_to_values() {
        let null: serde_yaml::Value = serde_yaml::from_str("~").unwrap();
        assert_eq!(value_from_yaml(&null).unwrap(), Value::Missing(Missing::Null));
        let nan: serde_yaml::Value = serde_yaml::from_str(".nan").unwrap();
        assert_eq!(value_from_yaml(&nan).unwrap(), Value::NAN);
        let yes: serde_yaml::Value = serde_yaml::from_str("true").unwrap();
        assert_eq!(value_from_yaml(&yes).unwrap(), Value::Boolean(true));
        let seq: serde_yaml::Value = serde_yaml::from_str("[1, 2]").unwrap();
        assert!(value_from_yaml(&seq).is_err());
    }

    #[test]
    fn display_marks_integral_floats() {
        assert_eq!(Value::Float(5.0).as_display(), "5.0");
        assert_eq!(Value::Float(0.25).as_display(), "0.25");
        assert_eq!(Value::NAN.as_field(), "");
    }

    #[test]
    fn normalize_column_name_replaces_non_alphanumeric() {
        assert_eq!(normalize_column_name("Net Income"), "net_income");
        assert_eq!(normalize_column_name("hh-size%"), "hh_size_");
    }
}
