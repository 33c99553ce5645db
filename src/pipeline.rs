//! End-to-end harmonization of one dataset: discover, rename, replace, type,
//! assemble, export.

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Context, Result, bail};
use log::info;

use crate::{
    coerce::{TypeOptions, assign_types},
    derive::build_hooks,
    error::HarmonizeError,
    export::{ExportFormat, ExportOptions, validate_and_export},
    frame::Table,
    io_utils,
    panel::{self, HOUSEHOLD_KEY, MergeRules, WaveOptions},
    replace::{FailurePolicy, ReplaceOptions, apply_replacements},
    schema::{DatasetSpec, load_spec},
    settings::{DatasetSettings, load_settings},
    warnings::WarningSink,
};

#[derive(Debug, Clone)]
pub struct HarmonizeConfig {
    pub spec_dir: PathBuf,
    pub data_dir: PathBuf,
    pub dataset: String,
    pub out_dir: PathBuf,
    pub formats: Vec<ExportFormat>,
    pub delimiter: Option<u8>,
    pub encoding: Option<String>,
    pub strict: bool,
}

impl HarmonizeConfig {
    pub fn new(
        spec_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        dataset: impl Into<String>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            spec_dir: spec_dir.into(),
            data_dir: data_dir.into(),
            dataset: dataset.into(),
            out_dir: out_dir.into(),
            formats: ExportFormat::ALL.to_vec(),
            delimiter: None,
            encoding: None,
            strict: false,
        }
    }
}

/// A harmonized panel together with what it was built from.
#[derive(Debug)]
pub struct Harmonized {
    pub table: Table,
    pub settings: DatasetSettings,
    pub spec: DatasetSpec,
}

impl Harmonized {
    fn export_options(&self) -> ExportOptions {
        let variable_labels = self
            .spec
            .rename
            .records
            .iter()
            .filter_map(|record| {
                record
                    .label
                    .as_ref()
                    .map(|label| (record.new_name.clone(), label.clone()))
            })
            .collect::<BTreeMap<_, _>>();
        ExportOptions {
            data_label: self.settings.file_name.clone(),
            variable_labels,
        }
    }
}

pub fn type_options(settings: &DatasetSettings) -> TypeOptions {
    let defaults = TypeOptions::default();
    TypeOptions {
        int_to_float: settings.int_to_float.unwrap_or(defaults.int_to_float),
        bool_to_float: settings.bool_to_float.unwrap_or(defaults.bool_to_float),
        category_value_count_threshold: settings
            .category_value_count_threshold
            .unwrap_or(defaults.category_value_count_threshold),
        few_values_to_category: settings
            .few_values_to_category
            .unwrap_or(defaults.few_values_to_category),
        scale_as_category: settings
            .scale_as_category
            .unwrap_or(defaults.scale_as_category),
        category_separator: settings.category_separator.clone(),
        ..defaults
    }
}

/// Builds the typed, indexed panel for `config.dataset` without writing it.
pub fn harmonize_dataset(config: &HarmonizeConfig, sink: &dyn WarningSink) -> Result<Harmonized> {
    let settings = load_settings(&config.spec_dir, &config.dataset)?;
    let spec = load_spec(&config.spec_dir, &config.dataset)?;
    let encoding = io_utils::resolve_encoding(config.encoding.as_deref())?;

    let files = panel::discover_waves(&config.data_dir, &config.dataset)?;
    let options = WaveOptions {
        multiple_files_per_year: settings.multiple_files_per_year,
        delimiter: config.delimiter,
        encoding,
        sink,
    };
    let mut waves = Vec::with_capacity(files.len());
    for file in &files {
        if let Some(table) = panel::load_wave(file, &spec.rename, &options)
            .with_context(|| format!("Loading {:?}", file.path))?
        {
            waves.push(table);
        }
    }
    if waves.is_empty() {
        return Err(HarmonizeError::InvalidSpecification {
            dataset: config.dataset.clone(),
            message: format!("no usable data files under {:?}", config.data_dir),
        }
        .into());
    }
    let count = waves.len();
    let mut table = panel::concat_tables(waves)?;
    info!(
        "Concatenated {count} file(s) of {} into {} row(s) and {} column(s)",
        config.dataset,
        table.row_count(),
        table.width()
    );

    if let Some(rules) = &spec.replacing {
        let replace_options = ReplaceOptions {
            dataset: config.dataset.clone(),
            raise_if_missing: settings.raise_if_missing,
            on_failure: if config.strict {
                FailurePolicy::Fail
            } else {
                FailurePolicy::Warn
            },
        };
        let outcome = apply_replacements(table, rules, Some(&spec.rename), &replace_options, sink)?;
        if !outcome.failures.is_empty() {
            info!("{} substitution(s) failed and were skipped", outcome.failures.len());
        }
        table = outcome.table;
    }

    let table = assign_types(table, Some(&spec.rename), &type_options(&settings), sink)?;

    let hooks = build_hooks(&settings.derivations)?;
    let mut rules = MergeRules::default();
    if !settings.keep_household_id {
        rules.drop_columns.push(HOUSEHOLD_KEY.to_string());
    }
    let table = panel::finish_panel(table, &rules, &hooks, sink)?;
    info!(
        "Harmonized {} into {} row(s) and {} column(s)",
        config.dataset,
        table.row_count(),
        table.width()
    );
    Ok(Harmonized {
        table,
        settings,
        spec,
    })
}

/// Harmonizes and exports `config.dataset`, returning the written paths.
pub fn run_dataset(config: &HarmonizeConfig, sink: &dyn WarningSink) -> Result<Vec<PathBuf>> {
    if config.formats.is_empty() {
        bail!("No export format selected");
    }
    let harmonized = harmonize_dataset(config, sink)?;
    let options = harmonized.export_options();
    validate_and_export(
        &harmonized.table,
        &harmonized.settings.file_name,
        &config.out_dir,
        &config.formats,
        &options,
        sink,
    )
}
