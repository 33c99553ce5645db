use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{coerce::DEFAULT_CATEGORY_THRESHOLD, export::ExportFormat};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Harmonize LISS panel survey extracts into typed panels",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Rename, clean, type and export every wave of a dataset as one panel
    Harmonize(HarmonizeArgs),
    /// Validate a dataset's renaming, replacing and settings files
    Check(CheckArgs),
    /// Infer column types of a single raw extract and print them
    Infer(InferArgs),
}

#[derive(Debug, Args)]
pub struct HarmonizeArgs {
    /// Directory holding `<dataset>_renaming.csv`, `<dataset>_replacing.yaml` and `data_sets_specs.yaml`
    #[arg(short = 's', long = "specs")]
    pub specs: PathBuf,
    /// Directory holding one sub-directory of raw files per dataset
    #[arg(short = 'd', long = "data")]
    pub data: PathBuf,
    /// Dataset name, e.g. `001-health`
    #[arg(long)]
    pub dataset: String,
    /// Output directory for exported files
    #[arg(short = 'o', long = "out")]
    pub out: PathBuf,
    /// Export formats (snapshot, csv, dta, parquet)
    #[arg(
        short = 'f',
        long = "format",
        value_delimiter = ',',
        value_parser = parse_format,
        default_value = "snapshot,dta,csv,parquet"
    )]
    pub formats: Vec<ExportFormat>,
    /// Append recoverable anomalies to this file
    #[arg(long = "warnings-log")]
    pub warnings_log: Option<PathBuf>,
    /// Turn failed substitutions into an error instead of warnings
    #[arg(long)]
    pub strict: bool,
    /// CSV delimiter of the raw files (defaults by extension)
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the raw files (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Directory holding the specification files
    #[arg(short = 's', long = "specs")]
    pub specs: PathBuf,
    /// Dataset name
    #[arg(long)]
    pub dataset: String,
    /// Print the parsed renaming file as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct InferArgs {
    /// Raw CSV extract to inspect
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Maximum distinct text values for a categorical
    #[arg(long = "category-threshold", default_value_t = DEFAULT_CATEGORY_THRESHOLD)]
    pub category_threshold: usize,
    /// Keep small integer domains numeric instead of categorical
    #[arg(long = "no-few-values-to-category")]
    pub no_few_values_to_category: bool,
}

pub fn parse_format(value: &str) -> Result<ExportFormat, String> {
    value.parse().map_err(|err: anyhow::Error| err.to_string())
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiter_names_resolve() {
        assert_eq!(parse_delimiter("semicolon"), Ok(b';'));
        assert_eq!(parse_delimiter("tab"), Ok(b'\t'));
        assert!(parse_delimiter("ab").is_err());
    }

    #[test]
    fn harmonize_formats_split_on_commas() {
        let cli = Cli::try_parse_from([
            "liss-harmonize",
            "harmonize",
            "--specs",
            "specs",
            "--data",
            "data",
            "--dataset",
            "001-health",
            "--out",
            "out",
            "--format",
            "csv,pickle",
        ])
        .unwrap();
        let Commands::Harmonize(args) = cli.command else {
            panic!("expected harmonize");
        };
        assert_eq!(args.formats, vec![ExportFormat::Csv, ExportFormat::Snapshot]);
        assert!(!args.strict);
    }
}
