use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::completeness::{CatalogStatus, CompletenessChecker, is_present};
use crate::domain::Period;
use crate::error::{BulkError, EXIT_PERIODS_FAILED};
use crate::fetcher::RemoteClient;
use crate::highlight::{HighlightOptions, HighlightResult, Highlighter};
use crate::orchestrator::{Orchestrator, OrchestratorSettings, RunPlan, RunReport};
use crate::store::Store;

pub const ALL_URLS_FILE: &str = "all_urls.txt";
pub const MISSING_FILES_FILE: &str = "missing_files.txt";

/// Which catalog periods a command applies to. An explicit list wins over
/// the range and is checked against the catalog.
#[derive(Debug, Clone, Default)]
pub struct PeriodSelection {
    pub from: Option<Period>,
    pub to: Option<Period>,
    pub only: Vec<Period>,
}

impl PeriodSelection {
    pub fn resolve(&self, catalog: &Catalog) -> Result<Vec<Period>, BulkError> {
        if self.only.is_empty() {
            return Ok(catalog.periods_between(self.from, self.to));
        }
        let mut periods = self.only.clone();
        periods.sort();
        periods.dedup();
        for period in &periods {
            catalog.expected_count(*period)?;
        }
        Ok(periods)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub dry_run: bool,
    pub work_list: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub dry_run: bool,
    pub work_list: String,
    pub planned: usize,
    /// Files that would be fetched, dry runs only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub would_fetch: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
}

impl DownloadResult {
    pub fn is_success(&self) -> bool {
        self.report.as_ref().map(RunReport::is_success).unwrap_or(true)
    }

    /// 0 when every planned period completed.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { EXIT_PERIODS_FAILED }
    }

    pub fn failed_periods(&self) -> Vec<Period> {
        self.report
            .as_ref()
            .map(RunReport::failed_periods)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub base_dir: String,
    #[serde(flatten)]
    pub status: CatalogStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_list: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UrlsResult {
    pub path: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitResult {
    pub base_dir: String,
    pub created: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Download,
    Resume,
    Highlight,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Clone)]
pub struct App<C: RemoteClient, K: Clock + Clone> {
    catalog: Catalog,
    client: C,
    clock: K,
    settings: OrchestratorSettings,
}

impl<C: RemoteClient, K: Clock + Clone> App<C, K> {
    pub fn new(catalog: Catalog, client: C, clock: K, settings: OrchestratorSettings) -> Self {
        Self {
            catalog,
            client,
            clock,
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        self.catalog.store()
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn status(
        &self,
        selection: &PeriodSelection,
        work_list: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> Result<StatusResult, BulkError> {
        let periods = selection.resolve(&self.catalog)?;
        sink.event(ProgressEvent {
            message: format!("phase=Verify; scanning {} periods", periods.len()),
            elapsed: None,
        });
        let status = CompletenessChecker::new(&self.catalog).scan(&periods)?;
        let written = match work_list {
            Some(path) => {
                Store::write_lines_atomic(path, &status.missing_urls())?;
                info!(path = %path, missing = status.missing_count, "wrote work list");
                Some(path.to_string())
            }
            None => None,
        };
        Ok(StatusResult {
            base_dir: self.store().root().to_string(),
            status,
            work_list: written,
        })
    }

    pub fn urls(
        &self,
        selection: &PeriodSelection,
        output: &Utf8Path,
    ) -> Result<UrlsResult, BulkError> {
        let periods = selection.resolve(&self.catalog)?;
        let urls = self.catalog.all_urls(&periods)?;
        Store::write_lines_atomic(output, &urls)?;
        Ok(UrlsResult {
            path: output.to_string(),
            count: urls.len(),
        })
    }

    pub fn init(&self, selection: &PeriodSelection) -> Result<InitResult, BulkError> {
        let periods = selection.resolve(&self.catalog)?;
        let created = self.store().ensure_period_dirs(&periods)?;
        Ok(InitResult {
            base_dir: self.store().root().to_string(),
            created: created.into_iter().map(|dir| dir.to_string()).collect(),
        })
    }

    pub fn download(
        &self,
        selection: &PeriodSelection,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, BulkError> {
        let periods = selection.resolve(&self.catalog)?;
        let plan = RunPlan::from_catalog(&self.catalog, &periods)?;
        self.execute(plan, options, sink)
    }

    /// Re-runs only the URLs listed in the work list.
    pub fn resume(
        &self,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, BulkError> {
        let urls = Store::read_lines(&options.work_list)?;
        let plan = RunPlan::from_work_list(&self.catalog, &urls)?;
        self.execute(plan, options, sink)
    }

    pub fn highlight(
        &self,
        options: &HighlightOptions,
        sink: &dyn ProgressSink,
    ) -> Result<HighlightResult, BulkError> {
        Highlighter::new(options.keywords.clone())?.process_tree(
            self.store().root(),
            options.output_dir.as_deref(),
            sink,
        )
    }

    fn execute(
        &self,
        plan: RunPlan,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, BulkError> {
        if options.dry_run {
            let would_fetch = plan
                .periods
                .iter()
                .flat_map(|period| period.descriptors.iter())
                .filter(|descriptor| !is_present(descriptor))
                .map(|descriptor| descriptor.url.clone())
                .collect();
            return Ok(DownloadResult {
                dry_run: true,
                work_list: options.work_list.to_string(),
                planned: plan.file_count(),
                would_fetch,
                report: None,
            });
        }

        if plan.is_empty() {
            info!(work_list = %options.work_list, "nothing to fetch");
        }
        let orchestrator = Orchestrator::new(
            &self.catalog,
            &self.client,
            self.clock.clone(),
            self.settings.clone(),
        )?;
        let report = orchestrator.run(&plan, sink);
        Store::write_lines_atomic(&options.work_list, &report.missing_urls())?;
        Ok(DownloadResult {
            dry_run: false,
            work_list: options.work_list.to_string(),
            planned: plan.file_count(),
            would_fetch: Vec::new(),
            report: Some(report),
        })
    }
}
