#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::{TempDir, tempdir};

pub const DATASET: &str = "001-health";

pub const RENAMING: &str = "\
new_name;type;categories_english;ordered;label_english;ch08a_EN_1.0p.csv;ch09b_EN_1.0p.csv
personal_id;int;;;Respondent id;nomem_encr;nomem_encr
hh_id;int;;;;nohouse_encr;nohouse_encr
date_fieldwork;float;;;;ch08a_m;ch09b_m
health;categorical;poor|fair|good;true;Self-rated health;ch08a004;ch09b004
sleep_hours;float;;;;ch08a005;ch09b005
smoker;bool;;;;ch08a006;ch09b006
";

pub const REPLACING: &str = "\
type renaming:
  boolean:
    \"yes\": true
    \"no\": false
replacing:
  sleep_hours:
    -9: .nan
";

pub const SETTINGS: &str = "\
001-health:
  file_name: health
";

pub const WAVE_2008: &str = "\
nomem_encr,nohouse_encr,ch08a_m,ch08a004,ch08a005,ch08a006,ch08a099
800002,50,200811,poor,-9,no,x
800001,50,200811,good,7,yes,y
";

pub const WAVE_2009: &str = "\
nomem_encr,nohouse_encr,ch09b_m,ch09b004,ch09b005,ch09b006
800001,50,200911,fair,6.5,yes
800002,50,200912,good,8,no
";

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` under the workspace, creating parent directories.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, contents).expect("write temp file contents");
        path
    }

    pub fn specs(&self) -> PathBuf {
        self.path().join("specs")
    }

    pub fn data(&self) -> PathBuf {
        self.path().join("data")
    }

    pub fn out(&self) -> PathBuf {
        self.path().join("out")
    }

    /// Lays out a two-wave health dataset with its specification files.
    pub fn health_dataset(&self) {
        self.write(&format!("specs/{DATASET}_renaming.csv"), RENAMING);
        self.write(&format!("specs/{DATASET}_replacing.yaml"), REPLACING);
        self.write("specs/data_sets_specs.yaml", SETTINGS);
        self.write(&format!("data/{DATASET}/ch08a_EN_1.0p.csv"), WAVE_2008);
        self.write(&format!("data/{DATASET}/ch09b_EN_1.0p.csv"), WAVE_2009);
    }
}
