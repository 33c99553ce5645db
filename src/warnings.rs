//! Structured warnings for recoverable cleaning anomalies.
//!
//! Every fallback path of the harmonization engine reports through a
//! [`WarningSink`] handed in by the caller. The sink decides persistence: an
//! in-memory [`WarningLog`] for tests and library users, or a
//! [`FileWarningLog`] that appends `module:line: UserWarning:message` lines to
//! a file for the duration of a pipeline run.

use std::{
    cell::RefCell,
    fmt,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub module: String,
    pub line: u32,
    pub message: String,
}

impl Warning {
    pub fn new(module: &str, line: u32, message: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: UserWarning:{}", self.module, self.line, self.message)
    }
}

pub trait WarningSink {
    fn record(&self, warning: Warning);
}

/// Collects warnings in memory.
#[derive(Debug, Default)]
pub struct WarningLog {
    entries: RefCell<Vec<Warning>>,
}

impl WarningLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Warning> {
        self.entries.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries
            .borrow()
            .iter()
            .map(|w| w.message.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .borrow()
            .iter()
            .any(|w| w.message.contains(needle))
    }
}

impl WarningSink for WarningLog {
    fn record(&self, warning: Warning) {
        self.entries.borrow_mut().push(warning);
    }
}

/// Appends warnings to a file, opened on the first record and never truncated.
#[derive(Debug)]
pub struct FileWarningLog {
    path: PathBuf,
    writer: RefCell<Option<BufWriter<File>>>,
    recorded: RefCell<usize>,
}

impl FileWarningLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: RefCell::new(None),
            recorded: RefCell::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn recorded(&self) -> usize {
        *self.recorded.borrow()
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(writer) = self.writer.borrow_mut().as_mut() {
            writer
                .flush()
                .with_context(|| format!("Flushing warnings log {:?}", self.path))?;
        }
        Ok(())
    }

    fn append(&self, warning: &Warning) -> Result<()> {
        let mut slot = self.writer.borrow_mut();
        if slot.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Creating directory {parent:?}"))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("Opening warnings log {:?}", self.path))?;
            *slot = Some(BufWriter::new(file));
        }
        if let Some(writer) = slot.as_mut() {
            writeln!(writer, "{warning}")
                .with_context(|| format!("Writing warnings log {:?}", self.path))?;
        }
        Ok(())
    }
}

impl WarningSink for FileWarningLog {
    fn record(&self, warning: Warning) {
        *self.recorded.borrow_mut() += 1;
        if let Err(err) = self.append(&warning) {
            log::error!("{err:#}");
        }
    }
}

impl Drop for FileWarningLog {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Emits a runtime warning through `log` and records it in the sink.
macro_rules! report_warning {
    ($sink:expr, $($arg:tt)+) => {{
        let message = format!($($arg)+);
        log::warn!("{}", message);
        $crate::warnings::WarningSink::record(
            $sink,
            $crate::warnings::Warning::new(module_path!(), line!(), message),
        );
    }};
}

pub(crate) use report_warning;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_records_module_and_line() {
        let log = WarningLog::new();
        report_warning!(&log, "column {} needs manual cleaning", "q1");
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].module, "liss_harmonize::warnings::tests");
        assert!(entries[0].line > 0);
        assert_eq!(entries[0].message, "column q1 needs manual cleaning");
    }

    #[test]
    fn file_log_appends_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("warnings.log");
        {
            let sink = FileWarningLog::new(&path);
            sink.record(Warning::new("a", 1, "first"));
        }
        {
            let sink = FileWarningLog::new(&path);
            sink.record(Warning::new("b", 2, "second"));
            assert_eq!(sink.recorded(), 1);
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "a:1: UserWarning:first\nb:2: UserWarning:second\n");
    }

    #[test]
    fn file_log_is_not_created_without_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warnings.log");
        let sink = FileWarningLog::new(&path);
        drop(sink);
        assert!(!path.exists());
    }
}
