//! Plain-text rendering of column overviews for the terminal.

use std::fmt::Write as _;

use crate::frame::{ColumnKind, Table};

const MAX_CELL_WIDTH: usize = 60;

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths = headers.iter().map(|h| cell_width(h)).collect::<Vec<_>>();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell_width(cell));
        }
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(headers, &widths));
    let rule = widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&rule, &widths));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths));
    }
    output
}

pub fn print_table(headers: &[String], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn format_row(cells: &[String], widths: &[usize]) -> String {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", clip(cell), width = *width))
        .collect::<Vec<_>>()
        .join("  ");
    line.trim_end().to_string()
}

fn clip(cell: &str) -> String {
    let flat = cell.replace(['\n', '\r', '\t'], " ");
    if flat.chars().count() <= MAX_CELL_WIDTH {
        flat
    } else {
        let mut clipped = flat.chars().take(MAX_CELL_WIDTH - 3).collect::<String>();
        clipped.push_str("...");
        clipped
    }
}

fn cell_width(cell: &str) -> usize {
    clip(cell).chars().count()
}

/// One row per column: name, type, missing count, distinct values and labels.
pub fn describe_columns(table: &Table) -> (Vec<String>, Vec<Vec<String>>) {
    let headers = ["column", "type", "missing", "distinct", "categories"]
        .iter()
        .map(|h| h.to_string())
        .collect();
    let rows = table
        .columns()
        .iter()
        .map(|column| {
            let missing = column.values.iter().filter(|v| v.is_missing()).count();
            let categories = match &column.kind {
                ColumnKind::Categorical(set) => set.label_strings().join(", "),
                _ => String::new(),
            };
            vec![
                column.name.clone(),
                column.kind.name().to_string(),
                missing.to_string(),
                column.distinct().len().to_string(),
                categories,
            ]
        })
        .collect();
    (headers, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::Value, frame::Column};

    #[test]
    fn columns_are_padded_to_widest_cell() {
        let headers = vec!["name".to_string(), "type".to_string()];
        let rows = vec![vec!["satisfaction".to_string(), "float64".to_string()]];
        let rendered = render_table(&headers, &rows);
        let lines = rendered.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "name          type");
        assert_eq!(lines[1], "------------  -------");
        assert_eq!(lines[2], "satisfaction  float64");
    }

    #[test]
    fn long_cells_are_clipped() {
        let long = "x".repeat(100);
        assert_eq!(clip(&long).chars().count(), MAX_CELL_WIDTH);
        assert_eq!(clip("a\nb"), "a b");
    }

    #[test]
    fn describe_counts_missing_and_distinct() {
        let table = Table::new(vec![Column::new(
            "city",
            vec![Value::text("Ede"), Value::NAN, Value::text("Ede")],
        )])
        .unwrap();
        let (headers, rows) = describe_columns(&table);
        assert_eq!(headers.len(), 5);
        assert_eq!(rows[0][2], "1");
        assert_eq!(rows[0][3], "1");
    }
}
