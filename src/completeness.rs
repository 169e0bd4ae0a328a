use std::fs;

use serde::Serialize;

use crate::catalog::Catalog;
use crate::domain::{DownloadGroup, FileDescriptor, Period};
use crate::error::BulkError;

/// Anything that can tell whether a group is fully on disk.
pub trait GroupProbe: Send + Sync {
    fn is_complete(&self, group: &DownloadGroup) -> bool;
}

/// A file counts as present only if it exists and is non-empty.
pub fn is_present(descriptor: &FileDescriptor) -> bool {
    fs::metadata(descriptor.local_path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodProgress {
    pub downloaded: usize,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodStatus {
    pub period: Period,
    pub total: u32,
    pub downloaded: usize,
    pub missing: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogStatus {
    pub total_files: usize,
    pub missing_count: usize,
    pub periods: Vec<PeriodStatus>,
    #[serde(skip)]
    pub missing: Vec<FileDescriptor>,
}

impl CatalogStatus {
    pub fn missing_urls(&self) -> Vec<String> {
        self.missing.iter().map(|d| d.url.clone()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Read-only view of the local archive tree.
#[derive(Debug, Clone, Copy)]
pub struct CompletenessChecker<'a> {
    catalog: &'a Catalog,
}

impl<'a> CompletenessChecker<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    pub fn is_complete(&self, group: &DownloadGroup) -> bool {
        group.members.iter().all(is_present)
    }

    pub fn missing(&self, group: &DownloadGroup) -> Vec<FileDescriptor> {
        group
            .members
            .iter()
            .filter(|member| !is_present(member))
            .cloned()
            .collect()
    }

    /// Raw directory count against the expected total. Reporting only.
    pub fn period_progress(&self, period: Period) -> Result<PeriodProgress, BulkError> {
        let total = self.catalog.expected_count(period)?;
        Ok(PeriodProgress {
            downloaded: self.catalog.store().count_files(period),
            total,
        })
    }

    pub fn scan(&self, periods: &[Period]) -> Result<CatalogStatus, BulkError> {
        let mut statuses = Vec::with_capacity(periods.len());
        let mut missing = Vec::new();
        let mut total_files = 0usize;
        for period in periods {
            let descriptors = self.catalog.descriptors_for(*period)?;
            total_files += descriptors.len();
            let before = missing.len();
            missing.extend(descriptors.iter().filter(|d| !is_present(d)).cloned());
            let missing_here = missing.len() - before;
            statuses.push(PeriodStatus {
                period: *period,
                total: descriptors.len() as u32,
                downloaded: descriptors.len() - missing_here,
                missing: missing_here,
            });
        }
        Ok(CatalogStatus {
            total_files,
            missing_count: missing.len(),
            periods: statuses,
            missing,
        })
    }
}

impl GroupProbe for CompletenessChecker<'_> {
    fn is_complete(&self, group: &DownloadGroup) -> bool {
        CompletenessChecker::is_complete(self, group)
    }
}
