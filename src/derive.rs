//! Dataset-specific derivations run on the assembled panel.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::LazyLock,
};

use anyhow::{Context, Result, anyhow, bail};
use evalexpr::{
    ContextWithMutableVariables, HashMapContext, Value as EvalValue, eval_with_context,
};
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    data::{Value, normalize_column_name, value_to_evalexpr},
    frame::{Column, ColumnKind, Table},
    panel::{HOUSEHOLD_KEY, PanelHook, TIME_KEY},
    warnings::{WarningSink, report_warning},
};

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:[^"\\]|\\.)*""#).expect("Invalid regex: string literal"));
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\b(\s*\(|::)?").expect("Invalid regex: identifier")
});

/// A derivation as configured in `data_sets_specs.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivationSpec {
    Expression {
        name: String,
        expression: String,
    },
    ScaleScore {
        name: String,
        items: Vec<String>,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
    HouseholdAggregate {
        variables: Vec<String>,
        #[serde(default)]
        equivalise: bool,
        #[serde(default = "default_members_column")]
        members_column: String,
        #[serde(default)]
        drop_source: bool,
    },
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_members_column() -> String {
    "hh_members".to_string()
}

impl DerivationSpec {
    pub fn into_hook(self) -> Result<Box<dyn PanelHook>> {
        Ok(match self {
            DerivationSpec::Expression { name, expression } => {
                Box::new(DerivedColumn::new(name, expression)?)
            }
            DerivationSpec::ScaleScore {
                name,
                items,
                multiplier,
            } => Box::new(ScaleScore {
                name,
                items,
                multiplier,
            }),
            DerivationSpec::HouseholdAggregate {
                variables,
                equivalise,
                members_column,
                drop_source,
            } => Box::new(HouseholdAggregate {
                variables,
                equivalise,
                members_column,
                drop_source,
            }),
        })
    }
}

pub fn build_hooks(specs: &[DerivationSpec]) -> Result<Vec<Box<dyn PanelHook>>> {
    specs.iter().cloned().map(DerivationSpec::into_hook).collect()
}

/// A row-wise `name = expression` column.
#[derive(Debug, Clone)]
pub struct DerivedColumn {
    pub name: String,
    pub expression: String,
    references: Vec<String>,
}

impl DerivedColumn {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let expression = expression.into();
        if name.trim().is_empty() {
            bail!("Derived column is missing a name");
        }
        if expression.trim().is_empty() {
            bail!("Derived column '{name}' is missing an expression");
        }
        let references = referenced_identifiers(&expression);
        Ok(Self {
            name,
            expression,
            references,
        })
    }

    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.splitn(2, '=');
        let name = parts
            .next()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Derived column is missing a name"))?;
        let expression = parts
            .next()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Derived column '{name}' is missing an expression"))?;
        Self::new(name, expression)
    }

    /// Evaluates the expression for one row; missing inputs give a missing result.
    pub fn evaluate(&self, headers: &[String], row: &[&Value]) -> Result<Value> {
        let mut context = HashMapContext::new();
        for (header, value) in headers.iter().zip(row) {
            let canon = normalize_column_name(header);
            if value.is_missing() {
                if self.references.contains(&canon) {
                    return Ok(Value::NAN);
                }
                continue;
            }
            context
                .set_value(canon, value_to_evalexpr(value))
                .with_context(|| format!("Binding column '{header}'"))?;
        }
        let result = eval_with_context(&self.expression, &context)
            .with_context(|| format!("Evaluating expression for column '{}'", self.name))?;
        Ok(match result {
            EvalValue::String(s) => Value::Text(s),
            EvalValue::Int(i) => Value::Integer(i),
            EvalValue::Float(f) => Value::float(f),
            EvalValue::Boolean(b) => Value::Boolean(b),
            _ => Value::NAN,
        })
    }
}

fn referenced_identifiers(expression: &str) -> Vec<String> {
    let without_strings = STRING_LITERAL.replace_all(expression, "\"\"");
    IDENTIFIER
        .captures_iter(&without_strings)
        .filter(|c| c.get(2).is_none())
        .map(|c| c[1].to_string())
        .filter(|ident| ident != "true" && ident != "false")
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn kind_of(values: &[Value]) -> ColumnKind {
    let present = values.iter().filter(|v| !v.is_missing()).collect::<Vec<_>>();
    if present.iter().all(|v| v.is_numeric()) {
        ColumnKind::Float
    } else if present.iter().all(|v| matches!(v, Value::Boolean(_))) {
        ColumnKind::Boolean
    } else {
        ColumnKind::Object
    }
}

impl PanelHook for DerivedColumn {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, mut table: Table, _sink: &dyn WarningSink) -> Result<Table> {
        let headers = table.column_names();
        let values = (0..table.row_count())
            .map(|row| self.evaluate(&headers, &table.row(row)))
            .collect::<Result<Vec<_>>>()?;
        let kind = kind_of(&values);
        let values = match kind {
            ColumnKind::Float => values
                .into_iter()
                .map(|v| v.as_f64().map(Value::float).unwrap_or(v))
                .collect(),
            _ => values,
        };
        table.set_column(Column::with_kind(self.name.clone(), kind, values))?;
        Ok(table)
    }
}

/// `multiplier` times the sum of ordinal codes of ordered categorical items.
#[derive(Debug, Clone)]
pub struct ScaleScore {
    pub name: String,
    pub items: Vec<String>,
    pub multiplier: f64,
}

impl PanelHook for ScaleScore {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, mut table: Table, _sink: &dyn WarningSink) -> Result<Table> {
        let mut codes = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let column = table
                .column(item)
                .ok_or_else(|| anyhow!("Scale item '{item}' is not in the data"))?;
            match &column.kind {
                ColumnKind::Categorical(set) if set.ordered => {}
                other => bail!("Scale item '{item}' must be an ordered categorical, found {other}"),
            }
            codes.push(column.codes().unwrap_or_default());
        }
        let values = (0..table.row_count())
            .map(|row| {
                codes
                    .iter()
                    .map(|item| item[row])
                    .sum::<Option<usize>>()
                    .map(|total| Value::float(self.multiplier * total as f64))
                    .unwrap_or(Value::NAN)
            })
            .collect();
        table.set_column(Column::with_kind(self.name.clone(), ColumnKind::Float, values))?;
        Ok(table)
    }
}

/// Household sums of individual variables, optionally equivalised by the
/// square root of the household size.
#[derive(Debug, Clone)]
pub struct HouseholdAggregate {
    pub variables: Vec<String>,
    pub equivalise: bool,
    pub members_column: String,
    pub drop_source: bool,
}

impl PanelHook for HouseholdAggregate {
    fn name(&self) -> &str {
        "household_aggregate"
    }

    fn apply(&self, mut table: Table, sink: &dyn WarningSink) -> Result<Table> {
        let households = table
            .column(HOUSEHOLD_KEY)
            .ok_or_else(|| anyhow!("Household aggregates need a '{HOUSEHOLD_KEY}' column"))?
            .values
            .clone();
        let periods = table.column(TIME_KEY).map(|c| c.values.clone());
        let group_of = |row: usize| {
            (
                households[row].clone(),
                periods.as_ref().map(|p| p[row].clone()),
            )
        };

        for variable in &self.variables {
            let column = table
                .column(variable)
                .ok_or_else(|| anyhow!("Household variable '{variable}' is not in the data"))?;
            if !matches!(
                column.kind,
                ColumnKind::Float | ColumnKind::Integer | ColumnKind::Boolean
            ) {
                bail!("Household variable '{variable}' must be numeric, found {}", column.kind);
            }
            let mut totals: BTreeMap<(Value, Option<Value>), Option<f64>> = BTreeMap::new();
            for (row, value) in column.values.iter().enumerate() {
                let entry = totals.entry(group_of(row)).or_insert(None);
                let number = match value {
                    Value::Boolean(b) => Some(f64::from(u8::from(*b))),
                    other => other.as_f64(),
                };
                if let Some(number) = number {
                    *entry = Some(entry.unwrap_or(0.0) + number);
                }
            }
            let summed = (0..table.row_count())
                .map(|row| {
                    if households[row].is_missing() {
                        return Value::NAN;
                    }
                    totals
                        .get(&group_of(row))
                        .copied()
                        .flatten()
                        .map(Value::float)
                        .unwrap_or(Value::NAN)
                })
                .collect::<Vec<_>>();
            let hh_name = format!("{variable}_hh");

            if self.equivalise {
                match table.column(&self.members_column) {
                    Some(members) => {
                        let equivalised = summed
                            .iter()
                            .zip(&members.values)
                            .map(|(total, size)| match (total.as_f64(), size.as_f64()) {
                                (Some(total), Some(size)) if size > 0.0 => {
                                    Value::float(total / size.sqrt())
                                }
                                _ => Value::NAN,
                            })
                            .collect();
                        table.set_column(Column::with_kind(
                            format!("{hh_name}_eqv"),
                            ColumnKind::Float,
                            equivalised,
                        ))?;
                    }
                    None => report_warning!(
                        sink,
                        "cannot equivalise {variable}: no {} column",
                        self.members_column
                    ),
                }
            }
            table.set_column(Column::with_kind(hh_name, ColumnKind::Float, summed))?;
            if self.drop_source {
                table.remove_column(variable);
            }
            debug!("Aggregated '{variable}' by household");
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame::CategorySet, warnings::WarningLog};

    fn floats(values: &[f64]) -> Vec<Value> {
        values.iter().copied().map(Value::float).collect()
    }

    #[test]
    fn parse_splits_name_and_expression() {
        let derived = DerivedColumn::parse("age = 2020 - birth_year").unwrap();
        assert_eq!(derived.name, "age");
        assert_eq!(derived.references, vec!["birth_year".to_string()]);
        assert!(DerivedColumn::parse("age =").is_err());
    }

    #[test]
    fn identifiers_skip_functions_and_strings() {
        let refs = referenced_identifiers("if(gender == \"male\", income, math::sqrt(hours))");
        assert_eq!(refs, vec!["gender".to_string(), "hours".to_string(), "income".to_string()]);
    }

    #[test]
    fn expression_propagates_missing_inputs() {
        let table = Table::new(vec![Column::with_kind(
            "birth_year",
            ColumnKind::Float,
            vec![Value::Float(1980.0), Value::NAN],
        )])
        .unwrap();
        let derived = DerivedColumn::parse("age = 2020.0 - birth_year").unwrap();
        let table = derived.apply(table, &WarningLog::new()).unwrap();
        let age = table.column("age").unwrap();
        assert_eq!(age.kind, ColumnKind::Float);
        assert_eq!(age.values, vec![Value::Float(40.0), Value::NAN]);
    }

    #[test]
    fn scale_score_sums_codes() {
        let set = CategorySet::new(
            vec![Value::text("never"), Value::text("sometimes"), Value::text("always")],
            true,
        );
        let item = |name: &str, values: Vec<Value>| {
            Column::with_kind(name, ColumnKind::Categorical(set.clone()), values)
        };
        let table = Table::new(vec![
            item("calm", vec![Value::text("always"), Value::text("never")]),
            item("happy", vec![Value::text("sometimes"), Value::NAN]),
        ])
        .unwrap();
        let hook = ScaleScore {
            name: "mhi".into(),
            items: vec!["calm".into(), "happy".into()],
            multiplier: 4.0,
        };
        let table = hook.apply(table, &WarningLog::new()).unwrap();
        assert_eq!(table.column("mhi").unwrap().values, vec![Value::Float(12.0), Value::NAN]);
    }

    #[test]
    fn scale_score_rejects_unordered_items() {
        let table = Table::new(vec![Column::with_kind("calm", ColumnKind::Float, floats(&[1.0]))]).unwrap();
        let hook = ScaleScore {
            name: "mhi".into(),
            items: vec!["calm".into()],
            multiplier: 1.0,
        };
        assert!(hook.apply(table, &WarningLog::new()).is_err());
    }

    #[test]
    fn household_sums_and_equivalises() {
        let table = Table::new(vec![
            Column::new(HOUSEHOLD_KEY, vec![Value::Integer(1), Value::Integer(1), Value::Integer(2)]),
            Column::with_kind("wealth", ColumnKind::Float, vec![Value::Float(100.0), Value::NAN, Value::NAN]),
            Column::with_kind("hh_members", ColumnKind::Float, floats(&[4.0, 4.0, 1.0])),
        ])
        .unwrap();
        let hook = HouseholdAggregate {
            variables: vec!["wealth".into()],
            equivalise: true,
            members_column: "hh_members".into(),
            drop_source: true,
        };
        let table = hook.apply(table, &WarningLog::new()).unwrap();
        assert!(!table.has_column("wealth"));
        assert_eq!(
            table.column("wealth_hh").unwrap().values,
            vec![Value::Float(100.0), Value::Float(100.0), Value::NAN]
        );
        assert_eq!(
            table.column("wealth_hh_eqv").unwrap().values,
            vec![Value::Float(50.0), Value::Float(50.0), Value::NAN]
        );
    }

    #[test]
    fn derivation_specs_deserialize_from_yaml() {
        let specs: Vec<DerivationSpec> = serde_yaml::from_str(
            "- kind: expression\n  name: age\n  expression: 2020 - birth_year\n- kind: scale_score\n  name: mhi5\n  items: [calm, happy]\n  multiplier: 4\n",
        )
        .unwrap();
        assert_eq!(build_hooks(&specs).unwrap().len(), 2);
        assert!(matches!(&specs[1], DerivationSpec::ScaleScore { multiplier, .. } if *multiplier == 4.0));
    }
}
