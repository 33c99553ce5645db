use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use encoding_rs::UTF_8;
use liss_harmonize::coerce::{TypeOptions, assign_types};
use liss_harmonize::frame::Table;
use liss_harmonize::io_utils::read_raw_table;
use liss_harmonize::warnings::WarningLog;
use tempfile::TempDir;

const WIDTH: usize = 60;

fn generate_extract(rows: usize) -> (TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let csv_path = temp_dir.path().join("wave.csv");
    let mut file = File::create(&csv_path).expect("create csv");
    let header = (0..WIDTH)
        .map(|col| format!("ch20a{col:03}"))
        .collect::<Vec<_>>()
        .join(",");
    writeln!(file, "nomem_encr,{header}").expect("header");
    for row in 0..rows {
        let cells = (0..WIDTH)
            .map(|col| match col % 5 {
                0 => ((row + col) % 2).to_string(),
                1 => ((row * 7 + col) % 11).to_string(),
                2 => format!("{:.2}", (row as f64) * 0.37 + col as f64),
                3 => ["helemaal eens", "eens", "neutraal", "oneens"][row % 4].to_string(),
                _ if row % 13 == 0 => String::new(),
                _ => (1_000 + row * 3).to_string(),
            })
            .collect::<Vec<_>>()
            .join(",");
        writeln!(file, "{},{cells}", 800_000 + row).expect("row");
    }
    (temp_dir, csv_path)
}

fn bench_assign_types(c: &mut Criterion) {
    let (temp_dir, csv_path) = generate_extract(5_000);
    let raw: Table = read_raw_table(&csv_path, b',', UTF_8).expect("read extract");
    let options = TypeOptions::default();

    let mut group = c.benchmark_group("assign_types");

    group.bench_function("inferred_wide_table", |b| {
        b.iter_batched(
            || raw.clone(),
            |table| {
                assign_types(table, None, &options, &WarningLog::new()).expect("assign types");
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("read_raw_extract", |b| {
        b.iter(|| read_raw_table(&csv_path, b',', UTF_8).expect("read extract"));
    });

    drop(temp_dir);
    group.finish();
}

criterion_group!(benches, bench_assign_types);
criterion_main!(benches);
