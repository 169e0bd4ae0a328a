use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::completeness::{CompletenessChecker, is_present};
use crate::domain::{DownloadGroup, FileDescriptor, Period};
use crate::error::BulkError;
use crate::fetcher::{Fetcher, RemoteClient};
use crate::poller::VerificationPoller;
use crate::scheduler::{GroupScheduler, partition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub group_size: usize,
    pub max_attempts: u32,
    pub fetch_backoff: Duration,
    pub max_group_retries: u32,
    pub group_retry_backoff: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            group_size: 3,
            max_attempts: 3,
            fetch_backoff: Duration::from_secs(30),
            max_group_retries: 3,
            group_retry_backoff: Duration::ZERO,
            poll_interval: Duration::from_secs(30),
            max_wait: Duration::from_secs(300),
        }
    }
}

/// Files to fetch for one period, ascending by index.
#[derive(Debug, Clone)]
pub struct PeriodPlan {
    pub period: Period,
    pub descriptors: Vec<FileDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub periods: Vec<PeriodPlan>,
}

impl RunPlan {
    /// Whole periods from the catalog. Fails before anything is dispatched
    /// if any period is unknown.
    pub fn from_catalog(catalog: &Catalog, periods: &[Period]) -> Result<Self, BulkError> {
        let mut sorted = periods.to_vec();
        sorted.sort();
        sorted.dedup();
        let periods = sorted
            .into_iter()
            .map(|period| {
                Ok(PeriodPlan {
                    period,
                    descriptors: catalog.descriptors_for(period)?,
                })
            })
            .collect::<Result<Vec<_>, BulkError>>()?;
        Ok(Self { periods })
    }

    /// Only the listed URLs, grouped by period.
    pub fn from_work_list(catalog: &Catalog, urls: &[String]) -> Result<Self, BulkError> {
        let mut by_period: BTreeMap<Period, BTreeMap<u32, FileDescriptor>> = BTreeMap::new();
        for url in urls {
            let descriptor = catalog.parse_url(url)?;
            by_period
                .entry(descriptor.period)
                .or_default()
                .insert(descriptor.index, descriptor);
        }
        Ok(Self {
            periods: by_period
                .into_iter()
                .map(|(period, files)| PeriodPlan {
                    period,
                    descriptors: files.into_values().collect(),
                })
                .collect(),
        })
    }

    pub fn file_count(&self) -> usize {
        self.periods.iter().map(|plan| plan.descriptors.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.file_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Pending,
    Dispatched,
    Verifying,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PeriodOutcome {
    Complete,
    Failed { group_number: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub group_number: u32,
    pub state: GroupState,
    pub dispatches: u32,
    pub files_fetched: usize,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodReport {
    pub period: Period,
    pub outcome: PeriodOutcome,
    pub planned: usize,
    pub missing: usize,
    pub groups: Vec<GroupReport>,
}

impl PeriodReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, PeriodOutcome::Failed { .. })
    }

    pub fn attempts(&self) -> u32 {
        self.groups.iter().map(|group| group.attempts).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub periods: Vec<PeriodReport>,
    #[serde(serialize_with = "serialize_urls")]
    pub missing: Vec<FileDescriptor>,
}

impl RunReport {
    pub fn failed_periods(&self) -> Vec<Period> {
        self.periods
            .iter()
            .filter(|report| report.is_failed())
            .map(|report| report.period)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.periods.iter().all(|report| !report.is_failed())
    }

    pub fn missing_urls(&self) -> Vec<String> {
        self.missing.iter().map(|d| d.url.clone()).collect()
    }

    pub fn attempts(&self) -> u32 {
        self.periods.iter().map(PeriodReport::attempts).sum()
    }

    pub fn files_fetched(&self) -> usize {
        self.periods
            .iter()
            .flat_map(|report| report.groups.iter())
            .map(|group| group.files_fetched)
            .sum()
    }
}

fn serialize_urls<S: serde::Serializer>(
    missing: &[FileDescriptor],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(missing.iter().map(|d| d.url.as_str()))
}

/// Drives periods strictly in order and groups strictly in order; the only
/// concurrency is inside a single group dispatch.
pub struct Orchestrator<'a, C: RemoteClient, K: Clock + Clone> {
    catalog: &'a Catalog,
    fetcher: Fetcher<C, K>,
    clock: K,
    settings: OrchestratorSettings,
}

impl<'a, C: RemoteClient, K: Clock + Clone> Orchestrator<'a, C, K> {
    pub fn new(
        catalog: &'a Catalog,
        client: C,
        clock: K,
        settings: OrchestratorSettings,
    ) -> Result<Self, BulkError> {
        if settings.group_size == 0 {
            return Err(BulkError::InvalidGroupSize);
        }
        Ok(Self {
            catalog,
            fetcher: Fetcher::new(client, clock.clone(), settings.fetch_backoff),
            clock,
            settings,
        })
    }

    pub fn run(&self, plan: &RunPlan, sink: &dyn ProgressSink) -> RunReport {
        let started_at = Utc::now().to_rfc3339();
        info!(
            periods = plan.periods.len(),
            files = plan.file_count(),
            "starting run"
        );
        emit(
            sink,
            format!(
                "phase=Plan; {} periods, {} files",
                plan.periods.len(),
                plan.file_count()
            ),
        );

        let mut periods = Vec::with_capacity(plan.periods.len());
        let mut missing = Vec::new();
        for period_plan in &plan.periods {
            let (report, period_missing) = self.run_period(period_plan, sink);
            if report.is_failed() {
                warn!(period = %report.period, missing = report.missing, "period failed");
            }
            periods.push(report);
            missing.extend(period_missing);
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            periods,
            missing,
        };
        info!(
            failed = report.failed_periods().len(),
            missing = report.missing.len(),
            attempts = report.attempts(),
            "run finished"
        );
        emit(
            sink,
            format!(
                "phase=Report; {} failed periods, {} files missing",
                report.failed_periods().len(),
                report.missing.len()
            ),
        );
        report
    }

    fn run_period(
        &self,
        plan: &PeriodPlan,
        sink: &dyn ProgressSink,
    ) -> (PeriodReport, Vec<FileDescriptor>) {
        emit(
            sink,
            format!(
                "period.start {} ({} files)",
                plan.period,
                plan.descriptors.len()
            ),
        );
        let mut groups = Vec::new();
        let mut outcome = PeriodOutcome::Complete;
        match partition(&plan.descriptors, self.settings.group_size) {
            Ok(partitioned) => {
                for group in &partitioned {
                    let report = self.drive_group(group, sink);
                    let failed = report.state == GroupState::Failed;
                    groups.push(report);
                    if failed {
                        outcome = PeriodOutcome::Failed {
                            group_number: group.group_number,
                        };
                        break;
                    }
                }
            }
            Err(err) => {
                error!(period = %plan.period, "cannot partition period: {err}");
                outcome = PeriodOutcome::Failed { group_number: 0 };
            }
        }

        let missing: Vec<FileDescriptor> = plan
            .descriptors
            .iter()
            .filter(|descriptor| !is_present(descriptor))
            .cloned()
            .collect();
        let on_disk = match CompletenessChecker::new(self.catalog).period_progress(plan.period) {
            Ok(progress) => format!("{}/{} on disk", progress.downloaded, progress.total),
            Err(err) => err.to_string(),
        };
        match outcome {
            PeriodOutcome::Complete => {
                emit(sink, format!("period.complete {} ({on_disk})", plan.period))
            }
            PeriodOutcome::Failed { group_number } => emit(
                sink,
                format!(
                    "period.failed {} at group {group_number}, {} files missing ({on_disk})",
                    plan.period,
                    missing.len()
                ),
            ),
        }

        let report = PeriodReport {
            period: plan.period,
            outcome,
            planned: plan.descriptors.len(),
            missing: missing.len(),
            groups,
        };
        (report, missing)
    }

    fn drive_group(&self, group: &DownloadGroup, sink: &dyn ProgressSink) -> GroupReport {
        let checker = CompletenessChecker::new(self.catalog);
        let scheduler = GroupScheduler::new(&self.fetcher, self.settings.max_attempts);
        let poller = VerificationPoller::new(checker, self.clock.clone());
        let budget = self.settings.max_group_retries;

        let mut report = GroupReport {
            group_number: group.group_number,
            state: GroupState::Pending,
            dispatches: 0,
            files_fetched: 0,
            attempts: 0,
        };
        let mut pending = Vec::new();

        loop {
            match report.state {
                GroupState::Pending => {
                    pending = checker.missing(group);
                    if pending.is_empty() {
                        emit(sink, format!("group.present {group}"));
                        report.state = GroupState::Complete;
                        continue;
                    }
                    if report.dispatches >= budget {
                        report.state = GroupState::Failed;
                        continue;
                    }
                    if report.dispatches > 0 {
                        self.clock.sleep(self.settings.group_retry_backoff);
                    }
                    report.dispatches += 1;
                    emit(
                        sink,
                        format!(
                            "phase=Dispatch; {group} ({} files, cycle {}/{budget})",
                            pending.len(),
                            report.dispatches
                        ),
                    );
                    let results = scheduler.dispatch(&group.with_members(pending.clone()));
                    for result in &results {
                        report.attempts += result.attempts_used;
                        if result.succeeded {
                            report.files_fetched += 1;
                            emit(
                                sink,
                                format!(
                                    "file.fetched {} attempts={}",
                                    result.descriptor.filename, result.attempts_used
                                ),
                            );
                        } else {
                            emit(
                                sink,
                                format!(
                                    "file.failed {} attempts={} {}",
                                    result.descriptor.filename,
                                    result.attempts_used,
                                    result.last_error.as_deref().unwrap_or("")
                                ),
                            );
                        }
                    }
                    report.state = GroupState::Dispatched;
                }
                GroupState::Dispatched => {
                    report.state = GroupState::Verifying;
                }
                GroupState::Verifying => {
                    emit(sink, format!("phase=Verify; {group}"));
                    let outcome = poller.verify(
                        group,
                        self.settings.poll_interval,
                        self.settings.max_wait,
                    );
                    report.state = if outcome.complete {
                        GroupState::Complete
                    } else if report.dispatches < budget {
                        emit(
                            sink,
                            format!(
                                "group.retry {group} after {:?} wait ({} polls)",
                                outcome.elapsed_wait, outcome.polls
                            ),
                        );
                        GroupState::Pending
                    } else {
                        GroupState::Failed
                    };
                }
                GroupState::Complete => {
                    info!(%group, dispatches = report.dispatches, "group complete");
                    emit(sink, format!("group.complete {group}"));
                    break;
                }
                GroupState::Failed => {
                    warn!(
                        %group,
                        dispatches = report.dispatches,
                        missing = pending.len(),
                        "group failed, retry budget exhausted"
                    );
                    emit(
                        sink,
                        format!(
                            "group.failed {group} after {} dispatch cycles",
                            report.dispatches
                        ),
                    );
                    break;
                }
            }
        }
        report
    }
}

fn emit(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::store::Store;

    fn catalog() -> Catalog {
        Catalog::drug_event(Store::new_with_root(Utf8PathBuf::from("/data")))
    }

    #[test]
    fn work_list_plan_groups_and_sorts_by_period() {
        let catalog = catalog();
        let urls = vec![
            "https://download.open.fda.gov/drug/event/2015q1/drug-event-0003-of-0025.json.zip"
                .to_string(),
            "https://download.open.fda.gov/drug/event/2014q1/drug-event-0020-of-0020.json.zip"
                .to_string(),
            "https://download.open.fda.gov/drug/event/2015q1/drug-event-0001-of-0025.json.zip"
                .to_string(),
            "https://download.open.fda.gov/drug/event/2015q1/drug-event-0001-of-0025.json.zip"
                .to_string(),
        ];
        let plan = RunPlan::from_work_list(&catalog, &urls).unwrap();
        assert_eq!(plan.periods.len(), 2);
        assert_eq!(plan.periods[0].period.to_string(), "2014q1");
        let indices: Vec<u32> = plan.periods[1].descriptors.iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(plan.file_count(), 3);
    }

    #[test]
    fn catalog_plan_fails_on_unknown_period() {
        let catalog = catalog();
        let periods = ["2014q1".parse().unwrap(), "2031q2".parse().unwrap()];
        assert!(matches!(
            RunPlan::from_catalog(&catalog, &periods),
            Err(BulkError::UnknownPeriod { .. })
        ));
    }

    #[test]
    fn report_serializes_missing_as_urls() {
        let catalog = catalog();
        let descriptor = catalog.descriptor("2014q1".parse().unwrap(), 2).unwrap();
        let report = RunReport {
            started_at: "a".to_string(),
            finished_at: "b".to_string(),
            periods: vec![PeriodReport {
                period: descriptor.period,
                outcome: PeriodOutcome::Failed { group_number: 1 },
                planned: 20,
                missing: 1,
                groups: Vec::new(),
            }],
            missing: vec![descriptor.clone()],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["missing"][0], descriptor.url.as_str());
        assert_eq!(json["periods"][0]["outcome"]["status"], "failed");
        assert_eq!(report.failed_periods(), vec![descriptor.period]);
        assert!(!report.is_success());
    }
}
