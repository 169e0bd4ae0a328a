use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::BulkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    pub const ALL: [Quarter; 4] = [Quarter::Q1, Quarter::Q2, Quarter::Q3, Quarter::Q4];

    pub fn as_str(self) -> &'static str {
        match self {
            Quarter::Q1 => "q1",
            Quarter::Q2 => "q2",
            Quarter::Q3 => "q3",
            Quarter::Q4 => "q4",
        }
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quarter {
    type Err = BulkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "q1" => Ok(Quarter::Q1),
            "q2" => Ok(Quarter::Q2),
            "q3" => Ok(Quarter::Q3),
            "q4" => Ok(Quarter::Q4),
            _ => Err(BulkError::InvalidPeriod(value.to_string())),
        }
    }
}

/// One (year, quarter) batch of the remote catalog. Orders by year, then quarter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Period {
    pub year: u16,
    pub quarter: Quarter,
}

impl Period {
    pub fn new(year: u16, quarter: Quarter) -> Self {
        Self { year, quarter }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.year, self.quarter)
    }
}

impl FromStr for Period {
    type Err = BulkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.len() != 6 || !trimmed.is_char_boundary(4) {
            return Err(BulkError::InvalidPeriod(value.to_string()));
        }
        let (year, quarter) = trimmed.split_at(4);
        let year = year
            .parse::<u16>()
            .map_err(|_| BulkError::InvalidPeriod(value.to_string()))?;
        let quarter = quarter
            .parse::<Quarter>()
            .map_err(|_| BulkError::InvalidPeriod(value.to_string()))?;
        Ok(Self { year, quarter })
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}

impl TryFrom<String> for Period {
    type Error = BulkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A single remote archive and where it lives locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FileDescriptor {
    pub period: Period,
    pub index: u32,
    pub total: u32,
    pub filename: String,
    pub url: String,
    pub local_path: Utf8PathBuf,
}

pub fn archive_filename(index: u32, total: u32) -> String {
    format!("drug-event-{index:04}-of-{total:04}.json.zip")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadGroup {
    pub period: Period,
    pub group_number: u32,
    pub members: Vec<FileDescriptor>,
}

impl DownloadGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn indices(&self) -> Vec<u32> {
        self.members.iter().map(|member| member.index).collect()
    }

    /// Same group identity, restricted to the given members.
    pub fn with_members(&self, members: Vec<FileDescriptor>) -> Self {
        Self {
            period: self.period,
            group_number: self.group_number,
            members,
        }
    }
}

impl fmt::Display for DownloadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} group {}", self.period, self.group_number)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptResult {
    pub descriptor: FileDescriptor,
    pub succeeded: bool,
    pub attempts_used: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOutcome {
    pub period: Period,
    pub group_number: u32,
    pub complete: bool,
    pub elapsed_wait: Duration,
    pub polls: u32,
}
