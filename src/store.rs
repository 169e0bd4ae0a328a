use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use directories::{BaseDirs, UserDirs};

use crate::domain::Period;
use crate::error::BulkError;

pub const DEFAULT_FOLDER: &str = "Drug Adverse Events";
/// Suffix of in-flight downloads, never counted as archives.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Local layout: `{root}/{year}/{quarter}/{filename}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, BulkError> {
        Ok(Self {
            root: default_root()?,
        })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn period_dir(&self, period: Period) -> Utf8PathBuf {
        self.root
            .join(period.year.to_string())
            .join(period.quarter.as_str())
    }

    pub fn archive_path(&self, period: Period, filename: &str) -> Utf8PathBuf {
        self.period_dir(period).join(filename)
    }

    /// Creates the year/quarter tree and returns the directories that did not
    /// exist before.
    pub fn ensure_period_dirs(&self, periods: &[Period]) -> Result<Vec<Utf8PathBuf>, BulkError> {
        let mut created = Vec::new();
        for period in periods {
            let dir = self.period_dir(*period);
            if dir.as_std_path().is_dir() {
                continue;
            }
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| BulkError::Filesystem(format!("create {dir}: {err}")))?;
            created.push(dir);
        }
        Ok(created)
    }

    /// Number of regular files directly inside the period directory. Counts
    /// stray and partial files too, so it is only fit for reporting.
    pub fn count_files(&self, period: Period) -> usize {
        let dir = self.period_dir(period);
        match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
                .filter(|entry| !entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
                .count(),
            Err(_) => 0,
        }
    }

    pub fn read_lines(path: &Utf8Path) -> Result<Vec<String>, BulkError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| BulkError::Filesystem(format!("read {path}: {err}")))?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn write_lines_atomic(path: &Utf8Path, lines: &[String]) -> Result<(), BulkError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| BulkError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("openfda-bulk-list")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| BulkError::Filesystem(err.to_string()))?;
        for line in lines {
            writeln!(temp, "{line}").map_err(|err| BulkError::Filesystem(err.to_string()))?;
        }
        temp.persist(path.as_std_path())
            .map_err(|err| BulkError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn default_root() -> Result<Utf8PathBuf, BulkError> {
    let downloads = UserDirs::new().and_then(|dirs| dirs.download_dir().map(|p| p.to_path_buf()));
    let base = match downloads {
        Some(dir) => dir,
        None => BaseDirs::new()
            .map(|dirs| dirs.home_dir().join("Downloads"))
            .ok_or_else(|| {
                BulkError::Filesystem("unable to resolve download directory".to_string())
            })?,
    };
    Utf8PathBuf::from_path_buf(base.join(DEFAULT_FOLDER))
        .map_err(|_| BulkError::Filesystem("non-utf8 download directory".to_string()))
}
