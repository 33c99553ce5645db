pub mod categories;
pub mod cli;
pub mod coerce;
pub mod data;
pub mod derive;
pub mod dta;
pub mod error;
pub mod export;
pub mod frame;
pub mod io_utils;
pub mod panel;
pub mod pipeline;
pub mod replace;
pub mod schema;
pub mod settings;
pub mod table;
pub mod warnings;

use std::{env, sync::OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, info};

use crate::{
    cli::{Cli, Commands},
    coerce::TypeOptions,
    pipeline::HarmonizeConfig,
    warnings::{FileWarningLog, WarningLog},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("liss_harmonize", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Harmonize(args) => handle_harmonize(&args),
        Commands::Check(args) => handle_check(&args),
        Commands::Infer(args) => handle_infer(&args),
    }
}

fn handle_harmonize(args: &cli::HarmonizeArgs) -> Result<()> {
    let config = HarmonizeConfig {
        spec_dir: args.specs.clone(),
        data_dir: args.data.clone(),
        dataset: args.dataset.clone(),
        out_dir: args.out.clone(),
        formats: args.formats.clone(),
        delimiter: args.delimiter,
        encoding: args.input_encoding.clone(),
        strict: args.strict,
    };
    info!(
        "Harmonizing '{}' from {:?} into {:?}",
        config.dataset, config.data_dir, config.out_dir
    );
    let written = match &args.warnings_log {
        Some(path) => {
            let sink = FileWarningLog::new(path);
            let written = pipeline::run_dataset(&config, &sink);
            sink.flush()?;
            if sink.recorded() > 0 {
                info!("{} warning(s) appended to {path:?}", sink.recorded());
            }
            written?
        }
        None => {
            let sink = WarningLog::new();
            let written = pipeline::run_dataset(&config, &sink)?;
            if !sink.is_empty() {
                info!("{} warning(s) raised", sink.len());
            }
            written
        }
    };
    for path in &written {
        println!("{}", path.display());
    }
    Ok(())
}

fn handle_check(args: &cli::CheckArgs) -> Result<()> {
    let settings = settings::load_settings(&args.specs, &args.dataset)?;
    let spec = schema::load_spec(&args.specs, &args.dataset)?;
    if let Some(rules) = &spec.replacing {
        let absent = rules
            .referenced_columns(Some(&spec.rename))
            .into_iter()
            .filter(|name| spec.rename.record(name).is_none())
            .collect::<Vec<_>>();
        if !absent.is_empty() {
            log::warn!(
                "replacing rules name variables the renaming file does not define: {}",
                absent.join(", ")
            );
        }
    }

    if args.json {
        let json = serde_json::to_string_pretty(&spec.rename)
            .context("Serializing renaming specification")?;
        println!("{json}");
        return Ok(());
    }

    let headers = ["new_name", "type", "categories", "sources"]
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>();
    let rows = spec
        .rename
        .records
        .iter()
        .map(|record| {
            vec![
                record.new_name.clone(),
                record
                    .declared_type
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "inferred".to_string()),
                record
                    .category_labels(settings.category_separator.as_deref())
                    .map(|labels| labels.iter().map(|l| l.as_display()).collect::<Vec<_>>().join(", "))
                    .unwrap_or_default(),
                record.sources.len().to_string(),
            ]
        })
        .collect::<Vec<_>>();
    table::print_table(&headers, &rows);
    info!(
        "{} variable(s) across {} source file(s) in '{}'",
        spec.rename.records.len(),
        spec.rename.source_files.len(),
        args.dataset
    );
    Ok(())
}

fn handle_infer(args: &cli::InferArgs) -> Result<()> {
    let delimiter = io_utils::resolve_input_delimiter(&args.input, args.delimiter);
    info!(
        "Inferring types of '{}' with delimiter '{}'",
        args.input.display(),
        printable_delimiter(delimiter)
    );
    let encoding = io_utils::resolve_encoding(args.input_encoding.as_deref())?;
    let raw = io_utils::read_raw_table(&args.input, delimiter, encoding)
        .with_context(|| format!("Reading {:?}", args.input))?;
    let options = TypeOptions {
        category_value_count_threshold: args.category_threshold,
        few_values_to_category: !args.no_few_values_to_category,
        index_columns: Vec::new(),
        ..TypeOptions::default()
    };
    let sink = WarningLog::new();
    let typed = coerce::assign_types(raw, None, &options, &sink)?;
    let (headers, rows) = table::describe_columns(&typed);
    table::print_table(&headers, &rows);
    if !sink.is_empty() {
        info!("{} column(s) need manual follow-up", sink.len());
    }
    Ok(())
}

pub(crate) fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        b'\n' => "\\n".to_string(),
        other => (other as char).to_string(),
    }
}
