//! Stata 114 (`.dta`) writer for narrowed tables.
//!
//! Only two storage types are emitted: `double` for numeric columns and
//! `strN` for text. Value labels and the sort list are left empty.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;

use crate::{
    data::Value,
    frame::{ColumnKind, Table},
};

pub const FORMAT_VERSION: u8 = 114;
pub const MAX_STR_WIDTH: usize = 244;
pub const MAX_NAME_BYTES: usize = 32;
const TYPE_DOUBLE: u8 = 255;
const NAME_FIELD: usize = 33;
const FORMAT_FIELD: usize = 49;
const LABEL_FIELD: usize = 81;
const TIMESTAMP_FIELD: usize = 18;
/// System missing `.` for doubles.
pub const MISSING_DOUBLE: u64 = 0x7FE0_0000_0000_0000;

enum Storage {
    Double,
    Str(usize),
}

impl Storage {
    fn type_code(&self) -> u8 {
        match self {
            Storage::Double => TYPE_DOUBLE,
            Storage::Str(width) => *width as u8,
        }
    }

    fn format(&self) -> String {
        match self {
            Storage::Double => "%10.0g".to_string(),
            Storage::Str(width) => format!("%{width}s"),
        }
    }
}

/// Latin-1 bytes of `text`; characters outside Latin-1 become `?`.
pub fn latin1_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

fn fixed_field(text: &str, width: usize) -> Vec<u8> {
    let mut bytes = latin1_bytes(text);
    bytes.truncate(width - 1);
    bytes.resize(width, 0);
    bytes
}

/// First variable name that does not fit a dta name field, in Latin-1 bytes.
pub fn overlong_name(table: &Table) -> Option<&str> {
    table
        .columns()
        .iter()
        .map(|column| column.name.as_str())
        .find(|name| latin1_bytes(name).len() > MAX_NAME_BYTES)
}

/// Writes `table` as a Stata 114 file. Every column must already be `Float`
/// or `Object` holding only text.
pub fn write_dta(
    table: &Table,
    path: &Path,
    data_label: &str,
    variable_labels: &BTreeMap<String, String>,
    timestamp: NaiveDateTime,
) -> Result<()> {
    let nvar = u16::try_from(table.width()).context("Too many variables for a dta file")?;
    let nobs = u32::try_from(table.row_count()).context("Too many observations for a dta file")?;

    if let Some(name) = overlong_name(table) {
        bail!("Variable name '{name}' is longer than {MAX_NAME_BYTES} bytes");
    }

    let mut storages = Vec::with_capacity(table.width());
    for column in table.columns() {
        let storage = match column.kind {
            ColumnKind::Float => Storage::Double,
            ColumnKind::Object => {
                let mut width = 1;
                for value in &column.values {
                    match value {
                        Value::Text(text) => width = width.max(latin1_bytes(text).len()),
                        Value::Missing(_) => {}
                        other => bail!(
                            "Column '{}' holds a {} value in a text variable",
                            column.name,
                            other.type_name()
                        ),
                    }
                }
                Storage::Str(width.min(MAX_STR_WIDTH))
            }
            ref other => bail!("Column '{}' of type {other} cannot be written to dta", column.name),
        };
        storages.push(storage);
    }

    let file = File::create(path).with_context(|| format!("Creating dta file {path:?}"))?;
    let mut writer = BufWriter::new(file);
    let mut header = vec![FORMAT_VERSION, 0x02, 0x01, 0x00];
    header.extend_from_slice(&nvar.to_le_bytes());
    header.extend_from_slice(&nobs.to_le_bytes());
    header.extend(fixed_field(data_label, LABEL_FIELD));
    header.extend(fixed_field(
        &timestamp.format("%d %b %Y %H:%M").to_string(),
        TIMESTAMP_FIELD,
    ));
    writer.write_all(&header)?;

    let typlist = storages.iter().map(Storage::type_code).collect::<Vec<_>>();
    writer.write_all(&typlist)?;
    for column in table.columns() {
        writer.write_all(&fixed_field(&column.name, NAME_FIELD))?;
    }
    writer.write_all(&vec![0u8; 2 * (usize::from(nvar) + 1)])?;
    for storage in &storages {
        writer.write_all(&fixed_field(&storage.format(), FORMAT_FIELD))?;
    }
    writer.write_all(&vec![0u8; NAME_FIELD * usize::from(nvar)])?;
    for column in table.columns() {
        let label = variable_labels.get(&column.name).map(String::as_str).unwrap_or("");
        writer.write_all(&fixed_field(label, LABEL_FIELD))?;
    }
    // expansion fields: terminator only
    writer.write_all(&[0u8; 5])?;

    for row in 0..table.row_count() {
        for (column, storage) in table.columns().iter().zip(&storages) {
            let value = &column.values[row];
            match storage {
                Storage::Double => {
                    let bits = value.as_f64().map(f64::to_bits).unwrap_or(MISSING_DOUBLE);
                    writer.write_all(&bits.to_le_bytes())?;
                }
                Storage::Str(width) => {
                    let mut bytes = value.as_text().map(latin1_bytes).unwrap_or_default();
                    bytes.truncate(*width);
                    bytes.resize(*width, 0);
                    writer.write_all(&bytes)?;
                }
            }
        }
    }
    writer.flush().with_context(|| format!("Writing dta file {path:?}"))?;
    Ok(())
}
