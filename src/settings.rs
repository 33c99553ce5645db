use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::{derive::DerivationSpec, error::HarmonizeError};

pub const SETTINGS_FILE: &str = "data_sets_specs.yaml";

/// Per-dataset entry of `data_sets_specs.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// Stem of the exported files.
    pub file_name: String,
    #[serde(default)]
    pub multiple_files_per_year: bool,
    #[serde(default)]
    pub category_separator: Option<String>,
    #[serde(default = "default_true")]
    pub raise_if_missing: bool,
    /// Keep the household id in the exported panel.
    #[serde(default)]
    pub keep_household_id: bool,
    #[serde(default)]
    pub derivations: Vec<DerivationSpec>,
    /// Typing overrides; unset fields keep the engine defaults.
    #[serde(default)]
    pub int_to_float: Option<bool>,
    #[serde(default)]
    pub bool_to_float: Option<bool>,
    #[serde(default)]
    pub category_value_count_threshold: Option<usize>,
    #[serde(default)]
    pub few_values_to_category: Option<bool>,
    #[serde(default)]
    pub scale_as_category: Option<bool>,
}

fn default_true() -> bool {
    true
}

impl DatasetSettings {
    pub fn named(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            multiple_files_per_year: false,
            category_separator: None,
            raise_if_missing: true,
            keep_household_id: false,
            derivations: Vec::new(),
            int_to_float: None,
            bool_to_float: None,
            category_value_count_threshold: None,
            few_values_to_category: None,
            scale_as_category: None,
        }
    }
}

pub fn load_all_settings(spec_dir: &Path) -> Result<BTreeMap<String, DatasetSettings>> {
    let path = spec_dir.join(SETTINGS_FILE);
    let file = File::open(&path).with_context(|| format!("Opening dataset settings {path:?}"))?;
    serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("Parsing dataset settings {path:?}"))
}

/// Loads the settings entry for one dataset.
pub fn load_settings(spec_dir: &Path, dataset: &str) -> Result<DatasetSettings> {
    let mut all = load_all_settings(spec_dir)?;
    all.remove(dataset).ok_or_else(|| {
        anyhow!(HarmonizeError::InvalidSpecification {
            dataset: dataset.to_string(),
            message: format!("no entry in {SETTINGS_FILE}"),
        })
    })
}
