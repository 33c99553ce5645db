//! Final validation and export of a harmonized panel.

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use log::info;
use polars::prelude::{self as pl, NamedFrom};

use crate::{
    data::{Value, parse_numeric},
    dta,
    error::HarmonizeError,
    frame::{Column, ColumnKind, Table},
    io_utils,
    replace::fix_mixed_missing,
    warnings::{WarningSink, report_warning},
};

pub const CSV_DELIMITER: u8 = b';';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    /// Lossless binary snapshot of the typed table.
    Snapshot,
    Csv,
    Stata,
    Parquet,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 4] = [
        ExportFormat::Snapshot,
        ExportFormat::Stata,
        ExportFormat::Csv,
        ExportFormat::Parquet,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Snapshot => "bin",
            ExportFormat::Csv => "csv",
            ExportFormat::Stata => "dta",
            ExportFormat::Parquet => "parquet",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snapshot" | "bin" | "pickle" => Ok(ExportFormat::Snapshot),
            "csv" => Ok(ExportFormat::Csv),
            "dta" | "stata" => Ok(ExportFormat::Stata),
            "parquet" => Ok(ExportFormat::Parquet),
            other => Err(anyhow!(
                "Unknown export format '{other}'. Supported: snapshot, csv, dta, parquet"
            )),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub data_label: String,
    pub variable_labels: BTreeMap<String, String>,
}

/// Rejects tables that must not be written: empty column names and
/// columns without a single observed value.
pub fn check_exportable(table: &Table) -> Result<()> {
    for column in table.columns() {
        if column.name.trim().is_empty() || column.name.eq_ignore_ascii_case("nan") {
            return Err(HarmonizeError::ExportPrecondition {
                name: format!("{:?}", column.name),
                message: "column has no name".to_string(),
            }
            .into());
        }
        if column.is_all_missing() {
            return Err(HarmonizeError::ExportPrecondition {
                name: column.name.clone(),
                message: "all values are missing".to_string(),
            }
            .into());
        }
        if column.has_mixed_missing() {
            return Err(HarmonizeError::ExportPrecondition {
                name: column.name.clone(),
                message: "column mixes missing markers".to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Validates `table`, repairing mixed missing markers once, and writes one
/// file per requested format into `out_dir`.
pub fn validate_and_export(
    table: &Table,
    file_name: &str,
    out_dir: &Path,
    formats: &[ExportFormat],
    options: &ExportOptions,
    sink: &dyn WarningSink,
) -> Result<Vec<PathBuf>> {
    let mut table = table.clone();
    let repaired = fix_mixed_missing(&mut table);
    if !repaired.is_empty() {
        report_warning!(
            sink,
            "two types of missing values in {}; replaced with NaN",
            repaired.join(", ")
        );
    }
    check_exportable(&table)?;

    // Nothing is written unless every requested format can be.
    let narrowed = if formats.contains(&ExportFormat::Stata) {
        let narrowed = narrow_for_legacy(&table, sink);
        if let Some(name) = dta::overlong_name(&narrowed) {
            return Err(HarmonizeError::ExportPrecondition {
                name: name.to_string(),
                message: format!("name is longer than {} bytes for Stata", dta::MAX_NAME_BYTES),
            }
            .into());
        }
        Some(narrowed)
    } else {
        None
    };

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Creating output directory {out_dir:?}"))?;
    let mut written = Vec::with_capacity(formats.len());
    for format in formats {
        let path = export_path(out_dir, file_name, *format);
        match format {
            ExportFormat::Snapshot => write_snapshot(&table, &path)?,
            ExportFormat::Csv => write_csv(&table, &path)?,
            ExportFormat::Parquet => write_parquet(&table, &path)?,
            ExportFormat::Stata => {
                let narrowed = narrowed
                    .as_ref()
                    .ok_or_else(|| anyhow!("Stata export was not prepared"))?;
                dta::write_dta(
                    narrowed,
                    &path,
                    &options.data_label,
                    &options.variable_labels,
                    Local::now().naive_local(),
                )?;
            }
        }
        info!("Wrote {format} export to {path:?}");
        written.push(path);
    }
    Ok(written)
}

pub fn export_path(out_dir: &Path, file_name: &str, format: ExportFormat) -> PathBuf {
    out_dir.join(format!("{file_name}.{}", format.extension()))
}

/// Columns in output order: index keys first.
fn ordered_columns(table: &Table) -> Vec<&Column> {
    let index = table.index();
    let mut columns = index
        .iter()
        .filter_map(|name| table.column(name))
        .collect::<Vec<_>>();
    columns.extend(
        table
            .columns()
            .iter()
            .filter(|column| !index.contains(&column.name)),
    );
    columns
}

pub fn write_csv(table: &Table, path: &Path) -> Result<()> {
    let mut writer = io_utils::open_csv_writer(path, CSV_DELIMITER)?;
    let columns = ordered_columns(table);
    writer
        .write_record(columns.iter().map(|c| c.name.as_str()))
        .context("Writing CSV headers")?;
    for row in 0..table.row_count() {
        writer
            .write_record(columns.iter().map(|c| c.values[row].as_field()))
            .with_context(|| format!("Writing CSV row {}", row + 1))?;
    }
    writer.flush().context("Flushing CSV output")?;
    Ok(())
}

pub fn write_snapshot(table: &Table, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Creating snapshot {path:?}"))?;
    let mut writer = BufWriter::new(file);
    bincode::serde::encode_into_std_write(table, &mut writer, bincode::config::standard())
        .context("Writing snapshot")?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<Table> {
    let file = File::open(path).with_context(|| format!("Opening snapshot {path:?}"))?;
    let mut reader = BufReader::new(file);
    bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
        .with_context(|| format!("Reading snapshot {path:?}"))
}

fn to_polars(column: &Column) -> pl::Column {
    let name = column.name.as_str().into();
    let series = match column.kind {
        ColumnKind::Float => pl::Series::new(
            name,
            column.values.iter().map(Value::as_f64).collect::<Vec<_>>(),
        ),
        ColumnKind::Integer => pl::Series::new(
            name,
            column
                .values
                .iter()
                .map(Value::as_integral)
                .collect::<Vec<_>>(),
        ),
        ColumnKind::Boolean => pl::Series::new(
            name,
            column
                .values
                .iter()
                .map(|v| match v {
                    Value::Boolean(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        ),
        ColumnKind::Object | ColumnKind::Categorical(_) => pl::Series::new(
            name,
            column
                .values
                .iter()
                .map(|v| (!v.is_missing()).then(|| v.as_display()))
                .collect::<Vec<_>>(),
        ),
    };
    pl::Column::from(series)
}

pub fn write_parquet(table: &Table, path: &Path) -> Result<()> {
    let columns = ordered_columns(table)
        .into_iter()
        .map(to_polars)
        .collect::<Vec<_>>();
    let mut frame = pl::DataFrame::new(columns).context("Building parquet frame")?;
    let file = File::create(path).with_context(|| format!("Creating parquet file {path:?}"))?;
    pl::ParquetWriter::new(file)
        .finish(&mut frame)
        .with_context(|| format!("Writing parquet file {path:?}"))?;
    Ok(())
}

fn legacy_text(text: &str) -> String {
    if text == "nan" {
        return String::new();
    }
    text.replace('€', "EUR").replace('\u{2019}', "'")
}

fn numeric_column(column: &Column) -> Option<Column> {
    let values = column
        .values
        .iter()
        .map(|value| match value {
            Value::Missing(_) => Some(Value::NAN),
            Value::Text(text) => parse_numeric(text).map(|v| v.as_f64().map(Value::float).unwrap_or(Value::NAN)),
            Value::Boolean(b) => Some(Value::Float(f64::from(u8::from(*b)))),
            other => other.as_f64().map(Value::float),
        })
        .collect::<Option<Vec<_>>>()?;
    Some(Column::with_kind(column.name.clone(), ColumnKind::Float, values))
}

fn text_column(column: &Column) -> Column {
    let values = column
        .values
        .iter()
        .map(|value| match value {
            Value::Missing(_) => Value::text(""),
            other => Value::text(legacy_text(&other.as_display())),
        })
        .collect();
    Column::new(column.name.clone(), values)
}

/// Narrows every column to `double` or text for Stata: numeric-like columns
/// become floats, text categoricals become their labels, other untyped
/// columns are dropped.
pub fn narrow_for_legacy(table: &Table, sink: &dyn WarningSink) -> Table {
    let mut narrowed = Table::default();
    for column in ordered_columns(table) {
        let converted = match &column.kind {
            ColumnKind::Float | ColumnKind::Integer | ColumnKind::Boolean => numeric_column(column),
            ColumnKind::Categorical(set) => {
                if set.labels.iter().all(Value::is_numeric) {
                    numeric_column(column)
                } else {
                    Some(text_column(column))
                }
            }
            ColumnKind::Object => numeric_column(column),
        };
        match converted {
            Some(converted) => {
                if let Err(err) = narrowed.push_column(converted) {
                    report_warning!(sink, "dropping {} from dta export: {err}", column.name);
                }
            }
            None => report_warning!(
                sink,
                "dropping {} from dta export: object column cannot be stored",
                column.name
            ),
        }
    }
    narrowed
}
