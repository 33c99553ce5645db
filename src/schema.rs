//! Renaming and retyping specifications.
//!
//! Each dataset ships a semicolon-delimited `<dataset>_renaming.csv`. One row
//! describes one harmonized variable: its `new_name`, optional declared `type`,
//! category labels and ordering flag, plus one column per raw source file
//! holding the variable's original name in that file. An optional
//! `<dataset>_replacing.yaml` carries the value replacement rules.
//!
//! ## Responsibilities
//!
//! - Parsing declared types (`int`, `float`, `bool`, `Categorical`, `scale`)
//! - Dropping rows without a `new_name`
//! - Enforcing unique, length-bounded new names (legacy export constraint)
//! - Resolving per-file rename maps for the panel loader

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result, anyhow};
use encoding_rs::UTF_8;
use itertools::Itertools;
use log::{debug, info};
use serde::Serialize;

use crate::{
    data::{Value, parse_boolean_token},
    error::HarmonizeError,
    io_utils,
    replace::ReplacementRules,
};

pub const MAX_NAME_LENGTH: usize = 32;
pub const EXEMPT_SUFFIXES: &[&str] = &["_merge", "_202002", "_update"];
pub const SPEC_DELIMITER: u8 = b';';

const NEW_NAME_COLUMN: &str = "new_name";
const TYPE_COLUMN: &str = "type";
const ORDERED_COLUMN: &str = "ordered";
const CATEGORY_COLUMNS: &[&str] = &["categories_english", "categories"];
const LABEL_COLUMNS: &[&str] = &["label_english", "label"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredType {
    Float,
    Integer,
    Boolean,
    Categorical,
    /// Categorical stored as the ordinal position within the label list.
    Scale,
}

impl DeclaredType {
    /// The group key used by the `type renaming` replacement rules.
    pub fn group_name(&self) -> &'static str {
        match self {
            DeclaredType::Float => "float64",
            DeclaredType::Integer => "Int64",
            DeclaredType::Boolean => "boolean",
            DeclaredType::Categorical => "category",
            DeclaredType::Scale => "scale",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &["int", "float", "bool", "Categorical", "scale"]
    }
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.group_name())
    }
}

impl FromStr for DeclaredType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "int" | "int64" | "integer" => Ok(DeclaredType::Integer),
            "float" | "float64" | "double" => Ok(DeclaredType::Float),
            "bool" | "boolean" => Ok(DeclaredType::Boolean),
            "categorical" | "category" => Ok(DeclaredType::Categorical),
            "scale" => Ok(DeclaredType::Scale),
            _ => Err(anyhow!(
                "Unknown type '{value}'. Supported types: {}",
                DeclaredType::variants().join(", ")
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecRecord {
    pub new_name: String,
    /// Source file key to the variable's name in that file.
    pub sources: BTreeMap<String, String>,
    pub declared_type: Option<DeclaredType>,
    pub categories: Option<String>,
    pub ordered: Option<bool>,
    pub label: Option<String>,
}

impl SpecRecord {
    pub fn new(new_name: impl Into<String>) -> Self {
        Self {
            new_name: new_name.into(),
            sources: BTreeMap::new(),
            declared_type: None,
            categories: None,
            ordered: None,
            label: None,
        }
    }

    pub fn with_type(mut self, declared: DeclaredType) -> Self {
        self.declared_type = Some(declared);
        self
    }

    pub fn with_categories(mut self, labels: impl Into<String>, ordered: Option<bool>) -> Self {
        self.categories = Some(labels.into());
        self.ordered = ordered;
        self
    }

    pub fn with_source(mut self, file: impl Into<String>, original: impl Into<String>) -> Self {
        self.sources.insert(file.into(), original.into());
        self
    }

    /// Declared labels, split on `separator` or detected from the text.
    pub fn category_labels(&self, separator: Option<&str>) -> Option<Vec<Value>> {
        self.categories
            .as_deref()
            .map(|raw| parse_category_labels(raw, separator))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenameSpec {
    pub dataset: String,
    pub records: Vec<SpecRecord>,
    pub source_files: Vec<String>,
    /// Whether the file declares a `type` column at all. Without one every
    /// column is typed by inference.
    pub has_type_column: bool,
}

impl RenameSpec {
    /// Builds a specification from records, enforcing the naming rules.
    pub fn from_records(dataset: &str, records: Vec<SpecRecord>) -> Result<Self> {
        check_new_names(dataset, records.iter().map(|r| r.new_name.as_str()))?;
        let source_files = records
            .iter()
            .flat_map(|r| r.sources.keys().cloned())
            .unique()
            .collect();
        let has_type_column = records.iter().any(|r| r.declared_type.is_some());
        Ok(Self {
            dataset: dataset.to_string(),
            records,
            source_files,
            has_type_column,
        })
    }

    pub fn load(path: &Path, dataset: &str) -> Result<Self> {
        let mut reader = io_utils::open_csv_reader_from_path(path, SPEC_DELIMITER, true)?;
        let headers = io_utils::decode_headers(
            reader
                .byte_headers()
                .with_context(|| format!("Reading headers of {path:?}"))?,
            UTF_8,
        )?;
        let layout = SpecLayout::from_headers(dataset, &headers)?;

        let mut records = Vec::new();
        let mut dropped = 0usize;
        for (row_idx, record) in reader.byte_records().enumerate() {
            let record = record.with_context(|| format!("Reading row {} of {path:?}", row_idx + 2))?;
            let fields = io_utils::decode_record(&record, UTF_8)?;
            match layout.parse_row(dataset, &fields)? {
                Some(parsed) => records.push(parsed),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            debug!("Dropped {dropped} row(s) without {NEW_NAME_COLUMN} from {path:?}");
        }

        let mut spec = Self::from_records(dataset, records)?;
        spec.has_type_column = layout.type_idx.is_some();
        spec.source_files = layout.sources.iter().map(|(_, name)| name.clone()).collect();
        info!(
            "Loaded {} variable(s) over {} source file(s) for {}",
            spec.records.len(),
            spec.source_files.len(),
            dataset
        );
        Ok(spec)
    }

    pub fn record(&self, new_name: &str) -> Option<&SpecRecord> {
        self.records.iter().find(|r| r.new_name == new_name)
    }

    pub fn new_names(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.new_name.as_str()).collect()
    }

    /// Names of the variables declared with the given type.
    pub fn names_of_type(&self, declared: DeclaredType) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.declared_type == Some(declared))
            .map(|r| r.new_name.as_str())
            .collect()
    }

    /// The source-file column matching `file_name`, by full name or by stem.
    pub fn source_key(&self, file_name: &str) -> Option<&str> {
        let stem = file_stem(file_name);
        self.source_files
            .iter()
            .find(|key| key.as_str() == file_name)
            .or_else(|| self.source_files.iter().find(|key| file_stem(key) == stem))
            .map(String::as_str)
    }

    /// `(original, new)` pairs for one source file.
    pub fn rename_pairs(&self, source_key: &str) -> Vec<(&str, &str)> {
        self.records
            .iter()
            .filter_map(|r| {
                r.sources
                    .get(source_key)
                    .map(|original| (original.as_str(), r.new_name.as_str()))
            })
            .collect()
    }
}

fn file_stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}

struct SpecLayout {
    new_name_idx: usize,
    type_idx: Option<usize>,
    categories_idx: Option<usize>,
    ordered_idx: Option<usize>,
    label_idx: Option<usize>,
    sources: Vec<(usize, String)>,
}

impl SpecLayout {
    fn from_headers(dataset: &str, headers: &[String]) -> Result<Self> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        let find_any = |names: &[&str]| names.iter().find_map(|n| find(n));
        let new_name_idx = find(NEW_NAME_COLUMN).ok_or_else(|| {
            HarmonizeError::InvalidSpecification {
                dataset: dataset.to_string(),
                message: format!("renaming file has no '{NEW_NAME_COLUMN}' column"),
            }
        })?;
        let sources = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| is_source_column(h.trim()))
            .map(|(idx, h)| (idx, h.trim().to_string()))
            .collect();
        Ok(Self {
            new_name_idx,
            type_idx: find(TYPE_COLUMN),
            categories_idx: find_any(CATEGORY_COLUMNS),
            ordered_idx: find(ORDERED_COLUMN),
            label_idx: find_any(LABEL_COLUMNS),
            sources,
        })
    }

    fn parse_row(&self, dataset: &str, fields: &[String]) -> Result<Option<SpecRecord>> {
        let cell = |idx: Option<usize>| {
            idx.and_then(|i| fields.get(i))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
        };
        let Some(new_name) = cell(Some(self.new_name_idx)) else {
            return Ok(None);
        };
        let declared_type = match cell(self.type_idx) {
            Some(raw) => Some(raw.parse::<DeclaredType>().map_err(|_| {
                HarmonizeError::UnknownType {
                    dataset: dataset.to_string(),
                    column: new_name.to_string(),
                    declared: raw.to_string(),
                }
            })?),
            None => None,
        };
        let ordered = match cell(self.ordered_idx) {
            Some(raw) => Some(parse_boolean_token(raw).ok_or_else(|| {
                HarmonizeError::InvalidSpecification {
                    dataset: dataset.to_string(),
                    message: format!("'{raw}' is not a valid ordered flag for {new_name}"),
                }
            })?),
            None => None,
        };
        let sources = self
            .sources
            .iter()
            .filter_map(|(idx, file)| {
                cell(Some(*idx)).map(|original| (file.clone(), original.to_string()))
            })
            .collect();
        Ok(Some(SpecRecord {
            new_name: new_name.to_string(),
            sources,
            declared_type,
            categories: cell(self.categories_idx).map(str::to_string),
            ordered,
            label: cell(self.label_idx).map(str::to_string),
        }))
    }
}

fn is_source_column(header: &str) -> bool {
    !(header.is_empty()
        || header == NEW_NAME_COLUMN
        || header == TYPE_COLUMN
        || header == ORDERED_COLUMN
        || header == "comment"
        || header == "notes"
        || header.starts_with("categories")
        || header.starts_with("label"))
}

/// Strips the first matching exempt suffix.
pub fn strip_exempt_suffix(name: &str) -> &str {
    EXEMPT_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(name)
}

pub fn check_new_names<'a>(dataset: &str, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let names = names.into_iter().collect::<Vec<_>>();
    let too_long = names
        .iter()
        // A name of exactly MAX_NAME_LENGTH characters is allowed.
        .filter(|name| strip_exempt_suffix(name).chars().count() > MAX_NAME_LENGTH)
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    if !too_long.is_empty() {
        return Err(HarmonizeError::NameTooLong {
            dataset: dataset.to_string(),
            names: too_long,
            limit: MAX_NAME_LENGTH,
        }
        .into());
    }
    let duplicates = names
        .iter()
        .duplicates()
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    if !duplicates.is_empty() {
        return Err(HarmonizeError::DuplicateNames {
            dataset: dataset.to_string(),
            names: duplicates,
        }
        .into());
    }
    Ok(())
}

/// Splits a declared label list.
///
/// Without an explicit separator, `|` is used when present and `,` otherwise.
/// Labels that all parse as integers become integer labels.
pub fn parse_category_labels(raw: &str, separator: Option<&str>) -> Vec<Value> {
    let separator = separator.unwrap_or(if raw.contains('|') { "|" } else { "," });
    let parts = raw
        .split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    let integers = parts
        .iter()
        .map(|p| p.parse::<i64>())
        .collect::<Result<Vec<_>, _>>();
    match integers {
        Ok(values) => values.into_iter().map(Value::Integer).collect(),
        Err(_) => parts.into_iter().map(Value::text).collect(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSpec {
    pub rename: RenameSpec,
    pub replacing: Option<ReplacementRules>,
}

pub fn renaming_path(spec_dir: &Path, dataset: &str) -> PathBuf {
    spec_dir.join(format!("{dataset}_renaming.csv"))
}

pub fn replacing_path(spec_dir: &Path, dataset: &str) -> PathBuf {
    spec_dir.join(format!("{dataset}_replacing.yaml"))
}

/// Loads the renaming file and, when present, the replacement rules.
pub fn load_spec(spec_dir: &Path, dataset: &str) -> Result<DatasetSpec> {
    let rename_path = renaming_path(spec_dir, dataset);
    let rename = RenameSpec::load(&rename_path, dataset)
        .with_context(|| format!("Loading renaming file {rename_path:?}"))?;
    let rules_path = replacing_path(spec_dir, dataset);
    let replacing = if rules_path.is_file() {
        Some(
            ReplacementRules::load(&rules_path)
                .with_context(|| format!("Loading replacement rules {rules_path:?}"))?,
        )
    } else {
        debug!("No replacement rules at {rules_path:?}");
        None
    };
    Ok(DatasetSpec { rename, replacing })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_types_accept_legacy_spellings() {
        assert_eq!("int".parse::<DeclaredType>().unwrap(), DeclaredType::Integer);
        assert_eq!("Int".parse::<DeclaredType>().unwrap(), DeclaredType::Integer);
        assert_eq!("Int64".parse::<DeclaredType>().unwrap(), DeclaredType::Integer);
        assert_eq!("float64".parse::<DeclaredType>().unwrap(), DeclaredType::Float);
        assert_eq!("bool".parse::<DeclaredType>().unwrap(), DeclaredType::Boolean);
        assert_eq!(
            "Categorical".parse::<DeclaredType>().unwrap(),
            DeclaredType::Categorical
        );
        assert_eq!("scale".parse::<DeclaredType>().unwrap(), DeclaredType::Scale);
        assert!("datetime".parse::<DeclaredType>().is_err());
    }

    #[test]
    fn exempt_suffixes_do_not_count_toward_length() {
        let base = "a".repeat(MAX_NAME_LENGTH);
        let merged = format!("{base}_merge");
        assert!(check_new_names("d", [merged.as_str()]).is_ok());
        let too_long = "b".repeat(MAX_NAME_LENGTH + 1);
        let err = check_new_names("d", [too_long.as_str()]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarmonizeError>(),
            Some(HarmonizeError::NameTooLong { names, .. }) if names == &[too_long.clone()]
        ));
    }

    #[test]
    fn names_at_the_limit_are_accepted() {
        let at_limit = "c".repeat(MAX_NAME_LENGTH);
        assert!(check_new_names("d", [at_limit.as_str()]).is_ok());
        let accented = "é".repeat(MAX_NAME_LENGTH);
        assert!(check_new_names("d", [accented.as_str()]).is_ok());
        let over = format!("{at_limit}x_update");
        assert!(check_new_names("d", [over.as_str()]).is_err());
    }

    #[test]
    fn duplicated_new_names_fail() {
        let err = check_new_names("d", ["age", "income", "age"]).unwrap_err();
        assert!(err.to_string().contains("age"));
    }

    #[test]
    fn labels_detect_separator_and_integers() {
        assert_eq!(
            parse_category_labels("low|medium|high", None),
            vec![Value::text("low"), Value::text("medium"), Value::text("high")]
        );
        assert_eq!(
            parse_category_labels("1, 2, 3", None),
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]
        );
        assert_eq!(
            parse_category_labels("yes, mostly; no", Some(";")),
            vec![Value::text("yes, mostly"), Value::text("no")]
        );
    }

    #[test]
    fn source_key_matches_stem() {
        let spec = RenameSpec::from_records(
            "d",
            vec![SpecRecord::new("age").with_source("cp20l_EN_1.0p.dta", "cp20l003")],
        )
        .unwrap();
        assert_eq!(spec.source_key("cp20l_EN_1.0p.csv"), Some("cp20l_EN_1.0p.dta"));
        assert_eq!(spec.rename_pairs("cp20l_EN_1.0p.dta"), vec![("cp20l003", "age")]);
        assert_eq!(spec.source_key("other.csv"), None);
    }
}
