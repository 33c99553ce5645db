//! I/O utilities for reading raw extracts and writing delimited output.
//!
//! - **Encoding**: raw extracts are decoded through `encoding_rs_io`, which
//!   also strips byte-order marks; the default is UTF-8.
//! - **Reader/writer construction**: `open_csv_reader`, `open_csv_writer`.
//! - **stdin**: the `-` path convention routes through standard input.
//! - **Raw tables**: `read_raw_table` turns an extract into an untyped
//!   [`Table`] where every empty cell is a blank missing value and columns
//!   made only of numbers hold numbers.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use csv::QuoteStyle;
use encoding_rs::{Encoding, UTF_8};
use encoding_rs_io::DecodeReaderBytesBuilder;
use log::debug;

use crate::{
    data::{Value, parse_numeric},
    frame::{Column, Table},
};

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';

pub fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

pub fn resolve_input_delimiter(path: &Path, provided: Option<u8>) -> u8 {
    provided.unwrap_or_else(|| match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => DEFAULT_TSV_DELIMITER,
        _ => DEFAULT_CSV_DELIMITER,
    })
}

pub fn open_csv_reader<R>(reader: R, delimiter: u8, has_headers: bool) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(false);
    builder.from_reader(reader)
}

pub fn open_csv_reader_from_path(
    path: &Path,
    delimiter: u8,
    has_headers: bool,
) -> Result<csv::Reader<Box<dyn Read>>> {
    let reader: Box<dyn Read> = if is_dash(path) {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Opening input file {path:?}"))?,
        ))
    };
    Ok(open_csv_reader(reader, delimiter, has_headers))
}

/// Opens `path` decoding from `encoding` into UTF-8.
pub fn open_decoded_reader(
    path: &Path,
    encoding: &'static Encoding,
    delimiter: u8,
) -> Result<csv::Reader<Box<dyn Read>>> {
    let source: Box<dyn Read> = if is_dash(path) {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(File::open(path).with_context(|| format!("Opening input file {path:?}"))?)
    };
    let decoded = DecodeReaderBytesBuilder::new()
        .encoding(Some(encoding))
        .build(source);
    Ok(open_csv_reader(
        Box::new(BufReader::new(decoded)) as Box<dyn Read>,
        delimiter,
        true,
    ))
}

pub fn open_csv_writer(path: &Path, delimiter: u8) -> Result<csv::Writer<Box<dyn Write>>> {
    let base: Box<dyn Write> = if is_dash(path) {
        Box::new(std::io::stdout())
    } else {
        Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Creating output file {path:?}"))?,
        ))
    };
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(delimiter)
        .quote_style(QuoteStyle::Necessary)
        .double_quote(true);
    Ok(builder.from_writer(base))
}

pub fn decode_bytes(bytes: &[u8], encoding: &'static Encoding) -> Result<String> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        Err(anyhow!(
            "Failed to decode text with encoding {}",
            encoding.name()
        ))
    } else {
        Ok(text.into_owned())
    }
}

pub fn decode_record(record: &csv::ByteRecord, encoding: &'static Encoding) -> Result<Vec<String>> {
    record
        .iter()
        .map(|field| decode_bytes(field, encoding))
        .collect()
}

pub fn decode_headers(
    record: &csv::ByteRecord,
    encoding: &'static Encoding,
) -> Result<Vec<String>> {
    decode_record(record, encoding)
}

/// Reads a whole raw extract into an untyped table.
pub fn read_raw_table(path: &Path, delimiter: u8, encoding: &'static Encoding) -> Result<Table> {
    let mut reader = open_decoded_reader(path, encoding, delimiter)?;
    let headers = reader
        .headers()
        .with_context(|| format!("Reading headers of {path:?}"))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();
    let mut rows = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("Reading row {} of {path:?}", row_idx + 2))?;
        rows.push(record.iter().map(Value::from_raw).collect::<Vec<_>>());
    }
    debug!(
        "Read {} row(s) and {} column(s) from {path:?}",
        rows.len(),
        headers.len()
    );
    let mut table =
        Table::from_rows(&headers, rows).with_context(|| format!("Building table from {path:?}"))?;
    table.columns_mut().iter_mut().for_each(promote_numeric);
    Ok(table)
}

/// Replaces text with numbers when every present cell of `column` is numeric.
fn promote_numeric(column: &mut Column) {
    let parsed = column
        .values
        .iter()
        .map(|value| match value {
            Value::Text(text) => parse_numeric(text),
            other => Some(other.clone()),
        })
        .collect::<Option<Vec<_>>>();
    if let Some(values) = parsed {
        column.values = values;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Missing;

    #[test]
    fn raw_table_marks_blank_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wave.csv");
        std::fs::write(&path, "nomem_encr,answer\n1,ja\n2,\n").unwrap();
        let table = read_raw_table(&path, b',', UTF_8).unwrap();
        assert_eq!(table.row_count(), 2);
        let answer = table.column("answer").unwrap();
        assert_eq!(answer.values[0], Value::text("ja"));
        assert_eq!(answer.values[1], Value::Missing(Missing::Blank));
        assert_eq!(
            table.column("nomem_encr").unwrap().values,
            vec![Value::Integer(1), Value::Integer(2)]
        );
    }

    #[test]
    fn partly_numeric_columns_stay_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wave.csv");
        std::fs::write(&path, "code,score\n12,1.5\nnone,\n").unwrap();
        let table = read_raw_table(&path, b',', UTF_8).unwrap();
        assert_eq!(
            table.column("code").unwrap().values,
            vec![Value::text("12"), Value::text("none")]
        );
        assert_eq!(
            table.column("score").unwrap().values,
            vec![Value::Float(1.5), Value::Missing(Missing::Blank)]
        );
    }

    #[test]
    fn latin1_extracts_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wave.csv");
        std::fs::write(&path, b"naam\ncaf\xe9\n").unwrap();
        let encoding = resolve_encoding(Some("latin1")).unwrap();
        let table = read_raw_table(&path, b',', encoding).unwrap();
        assert_eq!(table.column("naam").unwrap().values[0], Value::text("café"));
    }

    #[test]
    fn tsv_extension_selects_tab() {
        assert_eq!(resolve_input_delimiter(Path::new("a.tsv"), None), b'\t');
        assert_eq!(resolve_input_delimiter(Path::new("a.csv"), None), b',');
        assert_eq!(resolve_input_delimiter(Path::new("a.csv"), Some(b';')), b';');
    }
}
