use std::thread;

use tracing::{debug, error};

use crate::clock::Clock;
use crate::domain::{AttemptResult, DownloadGroup, FileDescriptor};
use crate::error::BulkError;
use crate::fetcher::{Fetcher, RemoteClient};

/// Splits a period's descriptors into consecutive chunks of `group_size`,
/// numbered from 1. The last chunk may be shorter.
pub fn partition(
    descriptors: &[FileDescriptor],
    group_size: usize,
) -> Result<Vec<DownloadGroup>, BulkError> {
    if group_size == 0 {
        return Err(BulkError::InvalidGroupSize);
    }
    Ok(descriptors
        .chunks(group_size)
        .enumerate()
        .map(|(position, chunk)| DownloadGroup {
            period: chunk[0].period,
            group_number: position as u32 + 1,
            members: chunk.to_vec(),
        })
        .collect())
}

/// Runs every member of a group concurrently, one worker per member, and
/// waits for all of them.
pub struct GroupScheduler<'a, C: RemoteClient, K: Clock> {
    fetcher: &'a Fetcher<C, K>,
    max_attempts: u32,
}

impl<'a, C: RemoteClient, K: Clock> GroupScheduler<'a, C, K> {
    pub fn new(fetcher: &'a Fetcher<C, K>, max_attempts: u32) -> Self {
        Self {
            fetcher,
            max_attempts,
        }
    }

    pub fn dispatch(&self, group: &DownloadGroup) -> Vec<AttemptResult> {
        debug!(%group, members = group.len(), "dispatching group");
        thread::scope(|scope| {
            let handles: Vec<_> = group
                .members
                .iter()
                .map(|member| {
                    let handle = thread::Builder::new()
                        .name(format!("fetch-{}", member.index))
                        .spawn_scoped(scope, move || self.fetcher.fetch(member, self.max_attempts));
                    (member, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(member, handle)| {
                    let joined = match handle {
                        Ok(handle) => handle.join().map_err(|_| "fetch worker panicked".to_string()),
                        Err(err) => Err(format!("failed to spawn fetch worker: {err}")),
                    };
                    joined.unwrap_or_else(|reason| {
                        error!(file = %member.filename, "{reason}");
                        AttemptResult {
                            descriptor: member.clone(),
                            succeeded: false,
                            attempts_used: 0,
                            last_error: Some(reason),
                        }
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::catalog::Catalog;
    use crate::clock::ManualClock;
    use crate::store::Store;

    /// Holds every request until `size` of them are in flight at once, or
    /// gives up after a few seconds.
    struct Rendezvous {
        size: usize,
        arrived: Mutex<usize>,
        all_here: Condvar,
        refuse: &'static str,
    }

    impl RemoteClient for Rendezvous {
        fn download(&self, url: &str, destination: &Path) -> Result<u64, BulkError> {
            let mut arrived = self.arrived.lock().unwrap();
            *arrived += 1;
            self.all_here.notify_all();
            let (arrived, timeout) = self
                .all_here
                .wait_timeout_while(arrived, Duration::from_secs(5), |arrived| {
                    *arrived < self.size
                })
                .unwrap();
            drop(arrived);
            if timeout.timed_out() {
                return Err(BulkError::Transport(format!("{url} fetched alone")));
            }
            if url.ends_with(self.refuse) {
                return Err(BulkError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                });
            }
            fs::write(destination, b"PK").unwrap();
            Ok(2)
        }
    }

    fn catalog() -> Catalog {
        Catalog::drug_event(Store::new_with_root(Utf8PathBuf::from("/data")))
    }

    #[test]
    fn partition_2014q1_in_groups_of_three() {
        let catalog = catalog();
        let descriptors = catalog.descriptors_for("2014q1".parse().unwrap()).unwrap();
        let groups = partition(&descriptors, 3).unwrap();

        let sizes: Vec<usize> = groups.iter().map(DownloadGroup::len).collect();
        assert_eq!(sizes, vec![3, 3, 3, 3, 3, 3, 2]);
        assert_eq!(groups[6].group_number, 7);
        assert_eq!(groups[6].indices(), vec![19, 20]);
    }

    #[test]
    fn partition_covers_every_period_exactly_once() {
        let catalog = catalog();
        for size in [1usize, 2, 3, 5, 64] {
            for period in catalog.periods() {
                let descriptors = catalog.descriptors_for(period).unwrap();
                let groups = partition(&descriptors, size).unwrap();
                let flattened: Vec<u32> = groups.iter().flat_map(|g| g.indices()).collect();
                let expected: Vec<u32> = (1..=catalog.expected_count(period).unwrap()).collect();
                assert_eq!(flattened, expected, "{period} size {size}");
                for (position, group) in groups.iter().enumerate() {
                    assert_eq!(group.group_number as usize, position + 1);
                    assert!(!group.is_empty() && group.len() <= size);
                    if position + 1 < groups.len() {
                        assert_eq!(group.len(), size);
                    }
                }
            }
        }
    }

    #[test]
    fn dispatch_fetches_members_together_and_reports_each() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let catalog = Catalog::drug_event(Store::new_with_root(root));
        let descriptors = catalog.descriptors_for("2014q1".parse().unwrap()).unwrap();
        let group = partition(&descriptors[..4], 4).unwrap().remove(0);
        let remote = Rendezvous {
            size: 4,
            arrived: Mutex::new(0),
            all_here: Condvar::new(),
            refuse: "drug-event-0003-of-0020.json.zip",
        };
        let fetcher = Fetcher::new(&remote, ManualClock::new(), Duration::ZERO);

        let results = GroupScheduler::new(&fetcher, 1).dispatch(&group);

        assert_eq!(results.len(), 4);
        let indices: Vec<u32> = results.iter().map(|r| r.descriptor.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
        let succeeded: Vec<bool> = results.iter().map(|r| r.succeeded).collect();
        assert_eq!(succeeded, vec![true, true, false, true]);
        assert!(results[2].last_error.as_deref().unwrap().contains("503"));
    }

    #[test]
    fn partition_rejects_zero_group_size() {
        assert!(matches!(
            partition(&[], 0),
            Err(BulkError::InvalidGroupSize)
        ));
        assert!(partition(&[], 3).unwrap().is_empty());
    }
}
