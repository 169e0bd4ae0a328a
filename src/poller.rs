use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::completeness::GroupProbe;
use crate::domain::{DownloadGroup, GroupOutcome};

/// Wait-with-timeout over a [`GroupProbe`]. Never re-dispatches anything.
pub struct VerificationPoller<P: GroupProbe, K: Clock> {
    probe: P,
    clock: K,
}

impl<P: GroupProbe, K: Clock> VerificationPoller<P, K> {
    pub fn new(probe: P, clock: K) -> Self {
        Self { probe, clock }
    }

    pub fn await_completion(
        &self,
        group: &DownloadGroup,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> bool {
        self.verify(group, poll_interval, max_wait).complete
    }

    /// The probe runs once immediately, then after every `poll_interval`
    /// until `max_wait` has elapsed. A final probe is taken at the deadline
    /// so a group finishing during the last sleep is still reported.
    pub fn verify(
        &self,
        group: &DownloadGroup,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> GroupOutcome {
        let started = self.clock.now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            let complete = self.probe.is_complete(group);
            let elapsed = self.clock.now().saturating_duration_since(started);
            if complete || elapsed >= max_wait {
                debug!(%group, complete, polls, ?elapsed, "verification finished");
                return GroupOutcome {
                    period: group.period,
                    group_number: group.group_number,
                    complete,
                    elapsed_wait: elapsed,
                    polls,
                };
            }
            debug!(%group, polls, "group incomplete, waiting");
            let remaining = max_wait - elapsed;
            let step = if poll_interval.is_zero() {
                remaining
            } else {
                poll_interval.min(remaining)
            };
            self.clock.sleep(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{Period, Quarter};

    struct Script(Mutex<Vec<bool>>);

    impl GroupProbe for Script {
        fn is_complete(&self, _group: &DownloadGroup) -> bool {
            let mut answers = self.0.lock().unwrap();
            if answers.len() > 1 {
                answers.remove(0)
            } else {
                answers[0]
            }
        }
    }

    fn group() -> DownloadGroup {
        DownloadGroup {
            period: Period::new(2014, Quarter::Q1),
            group_number: 1,
            members: Vec::new(),
        }
    }

    #[test]
    fn returns_on_second_poll() {
        let clock = ManualClock::new();
        let poller = VerificationPoller::new(Script(Mutex::new(vec![false, true])), &clock);
        let outcome = poller.verify(&group(), Duration::from_secs(30), Duration::from_secs(300));
        assert!(outcome.complete);
        assert_eq!(outcome.polls, 2);
        assert_eq!(outcome.elapsed_wait, Duration::from_secs(30));
    }

    #[test]
    fn times_out_when_never_complete() {
        let clock = ManualClock::new();
        let poller = VerificationPoller::new(Script(Mutex::new(vec![false])), &clock);
        assert!(!poller.await_completion(
            &group(),
            Duration::from_secs(30),
            Duration::from_secs(100)
        ));
        assert_eq!(clock.elapsed(), Duration::from_secs(100));
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(30),
                Duration::from_secs(30),
                Duration::from_secs(30),
                Duration::from_secs(10)
            ]
        );
    }

    #[test]
    fn zero_wait_probes_exactly_once() {
        let clock = ManualClock::new();
        let poller = VerificationPoller::new(Script(Mutex::new(vec![false, true])), &clock);
        let outcome = poller.verify(&group(), Duration::from_secs(30), Duration::ZERO);
        assert!(!outcome.complete);
        assert_eq!(outcome.polls, 1);
        assert!(clock.sleeps().is_empty());
    }
}
