use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::domain::{FileDescriptor, Period, Quarter, archive_filename};
use crate::error::BulkError;
use crate::store::Store;

pub const DEFAULT_BASE_URL: &str = "https://download.open.fda.gov/drug/event";

static ARCHIVE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(\d{4})(q[1-4])/drug-event-(\d{4})-of-(\d{4})\.json\.zip$")
        .expect("archive url pattern is valid")
});

/// Per-quarter archive counts published for drug/event, 2014 through 2023.
const DRUG_EVENT_COUNTS: &[(u16, [u32; 4])] = &[
    (2014, [20, 16, 17, 17]),
    (2015, [25, 23, 32, 24]),
    (2016, [28, 23, 23, 23]),
    (2017, [26, 25, 26, 25]),
    (2018, [30, 32, 30, 28]),
    (2019, [30, 30, 32, 29]),
    (2020, [32, 30, 29, 30]),
    (2021, [33, 34, 36, 31]),
    (2022, [34, 31, 32, 34]),
    (2023, [31, 30, 30, 30]),
];

pub fn drug_event_counts() -> BTreeMap<Period, u32> {
    DRUG_EVENT_COUNTS
        .iter()
        .flat_map(|(year, counts)| {
            Quarter::ALL
                .iter()
                .zip(counts.iter())
                .map(|(quarter, count)| (Period::new(*year, *quarter), *count))
        })
        .collect()
}

/// Maps periods to their expected archive count and derives every
/// descriptor from it. No I/O.
#[derive(Debug, Clone)]
pub struct Catalog {
    counts: BTreeMap<Period, u32>,
    base_url: String,
    store: Store,
}

impl Catalog {
    pub fn new(counts: BTreeMap<Period, u32>, base_url: impl Into<String>, store: Store) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            counts,
            base_url,
            store,
        }
    }

    pub fn drug_event(store: Store) -> Self {
        Self::new(drug_event_counts(), DEFAULT_BASE_URL, store)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn expected_count(&self, period: Period) -> Result<u32, BulkError> {
        self.counts
            .get(&period)
            .copied()
            .ok_or_else(|| BulkError::UnknownPeriod {
                period: period.to_string(),
            })
    }

    /// Ascending.
    pub fn periods(&self) -> Vec<Period> {
        self.counts.keys().copied().collect()
    }

    /// Catalog periods within the inclusive range; open ends are unbounded.
    pub fn periods_between(&self, from: Option<Period>, to: Option<Period>) -> Vec<Period> {
        self.counts
            .keys()
            .copied()
            .filter(|period| from.is_none_or(|from| *period >= from))
            .filter(|period| to.is_none_or(|to| *period <= to))
            .collect()
    }

    pub fn descriptor(&self, period: Period, index: u32) -> Result<FileDescriptor, BulkError> {
        let total = self.expected_count(period)?;
        if index == 0 || index > total {
            return Err(BulkError::IndexOutOfRange {
                period: period.to_string(),
                index,
                total,
            });
        }
        Ok(self.build(period, index, total))
    }

    pub fn descriptors_for(&self, period: Period) -> Result<Vec<FileDescriptor>, BulkError> {
        let total = self.expected_count(period)?;
        Ok((1..=total)
            .map(|index| self.build(period, index, total))
            .collect())
    }

    pub fn all_urls(&self, periods: &[Period]) -> Result<Vec<String>, BulkError> {
        let mut urls = Vec::new();
        for period in periods {
            urls.extend(
                self.descriptors_for(*period)?
                    .into_iter()
                    .map(|descriptor| descriptor.url),
            );
        }
        Ok(urls)
    }

    /// Reverse of the URL scheme. The total embedded in the filename must
    /// agree with the catalog, otherwise the URL belongs to a different
    /// snapshot of the archive.
    pub fn parse_url(&self, url: &str) -> Result<FileDescriptor, BulkError> {
        let trimmed = url.trim();
        let captures = ARCHIVE_URL
            .captures(trimmed)
            .ok_or_else(|| BulkError::InvalidWorkListUrl(trimmed.to_string()))?;
        let period: Period = format!("{}{}", &captures[1], &captures[2]).parse()?;
        let index = captures[3]
            .parse::<u32>()
            .map_err(|_| BulkError::InvalidWorkListUrl(trimmed.to_string()))?;
        let total = captures[4]
            .parse::<u32>()
            .map_err(|_| BulkError::InvalidWorkListUrl(trimmed.to_string()))?;
        let descriptor = self.descriptor(period, index)?;
        if descriptor.total != total {
            return Err(BulkError::InvalidWorkListUrl(trimmed.to_string()));
        }
        Ok(descriptor)
    }

    fn build(&self, period: Period, index: u32, total: u32) -> FileDescriptor {
        let filename = archive_filename(index, total);
        FileDescriptor {
            period,
            index,
            total,
            url: format!("{}/{}/{}", self.base_url, period, filename),
            local_path: self.store.archive_path(period, &filename),
            filename,
        }
    }
}
