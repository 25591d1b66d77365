use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use tracing::debug;

use crate::models::{IssueKey, IssueTrackEntry, PersistentIssue};

/// An issue observed in the current run.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedIssue {
    pub key: IssueKey,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedIssue {
    pub key: IssueKey,
    pub label: String,
    pub consecutive_runs: u32,
    pub first_observed: NaiveDate,
    pub persistent: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackOutcome {
    /// Entries for the next history state; resolved issues are gone.
    pub entries: Vec<IssueTrackEntry>,
    pub issues: Vec<TrackedIssue>,
}

impl TrackOutcome {
    pub fn get(&self, key: &IssueKey) -> Option<&TrackedIssue> {
        self.issues.iter().find(|issue| &issue.key == key)
    }

    pub fn any_persistent(&self) -> bool {
        self.issues.iter().any(|issue| issue.persistent)
    }

    pub fn persistent(&self) -> Vec<PersistentIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.persistent)
            .map(|issue| PersistentIssue {
                key: issue.key.clone(),
                label: issue.label.clone(),
                consecutive_runs: issue.consecutive_runs,
                first_observed: issue.first_observed,
            })
            .collect()
    }
}

pub struct PersistenceTracker {
    threshold: u32,
}

impl PersistenceTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn is_persistent(&self, consecutive_runs: u32) -> bool {
        consecutive_runs >= self.threshold
    }

    /// Advance the issue counters by one run. `prior_run` is the sequence
    /// number of the last committed run; an entry last seen there continues
    /// its streak, anything else starts over at 1. Issues not detected now
    /// are dropped, so a later recurrence begins a fresh count.
    pub fn track(
        &self,
        prior: &[IssueTrackEntry],
        prior_run: u64,
        detected: &[DetectedIssue],
        today: NaiveDate,
    ) -> TrackOutcome {
        let current_run = prior_run + 1;
        let previous: HashMap<&IssueKey, &IssueTrackEntry> =
            prior.iter().map(|entry| (&entry.key, entry)).collect();

        let mut next: BTreeMap<IssueKey, IssueTrackEntry> = BTreeMap::new();
        for issue in detected {
            if next.contains_key(&issue.key) {
                continue;
            }
            let entry = match previous.get(&issue.key) {
                Some(entry) if entry.last_seen_run == prior_run => IssueTrackEntry {
                    key: issue.key.clone(),
                    label: issue.label.clone(),
                    first_observed: entry.first_observed,
                    last_observed: today,
                    last_seen_run: current_run,
                    consecutive_runs: entry.consecutive_runs.saturating_add(1),
                },
                _ => IssueTrackEntry {
                    key: issue.key.clone(),
                    label: issue.label.clone(),
                    first_observed: today,
                    last_observed: today,
                    last_seen_run: current_run,
                    consecutive_runs: 1,
                },
            };
            next.insert(issue.key.clone(), entry);
        }

        let resolved = prior.iter().filter(|entry| !next.contains_key(&entry.key)).count();
        if resolved > 0 {
            debug!(resolved, "cleared resolved issues");
        }

        let entries: Vec<IssueTrackEntry> = next.into_values().collect();
        let issues = entries
            .iter()
            .map(|entry| TrackedIssue {
                key: entry.key.clone(),
                label: entry.label.clone(),
                consecutive_runs: entry.consecutive_runs,
                first_observed: entry.first_observed,
                persistent: self.is_persistent(entry.consecutive_runs),
            })
            .collect();

        TrackOutcome { entries, issues }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::models::IssueKind;

    fn overdue(item: &str) -> DetectedIssue {
        DetectedIssue {
            key: IssueKey {
                item: item.to_string(),
                kind: IssueKind::Overdue,
            },
            label: item.to_string(),
        }
    }

    /// Replays runs, each detecting the given issues, and returns the count
    /// for `item` after every run (0 when absent).
    fn replay(runs: &[Vec<DetectedIssue>], item: &str) -> Vec<u32> {
        let tracker = PersistenceTracker::new(3);
        let start = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        let mut entries: Vec<IssueTrackEntry> = Vec::new();
        let mut counts = Vec::new();

        for (run, detected) in runs.iter().enumerate() {
            let outcome = tracker.track(&entries, run as u64, detected, start + Duration::days(run as i64));
            counts.push(
                outcome
                    .issues
                    .iter()
                    .find(|issue| issue.key.item == item)
                    .map_or(0, |issue| issue.consecutive_runs),
            );
            entries = outcome.entries;
        }
        counts
    }

    #[test]
    fn count_resets_after_a_missed_run() {
        let runs = vec![
            vec![overdue("a12")],
            vec![overdue("a12")],
            vec![overdue("a12")],
            vec![],
            vec![overdue("a12")],
        ];
        assert_eq!(replay(&runs, "a12"), vec![1, 2, 3, 0, 1]);
    }

    #[test]
    fn becomes_persistent_at_threshold() {
        let tracker = PersistenceTracker::new(3);
        let today = NaiveDate::from_ymd_opt(2026, 2, 3).unwrap();
        let prior = vec![IssueTrackEntry {
            key: overdue("a12").key,
            label: "a12".to_string(),
            first_observed: today - Duration::days(2),
            last_observed: today - Duration::days(1),
            last_seen_run: 7,
            consecutive_runs: 2,
        }];

        let outcome = tracker.track(&prior, 7, &[overdue("a12")], today);
        assert!(outcome.any_persistent());
        assert_eq!(outcome.persistent()[0].first_observed, today - Duration::days(2));
    }

    #[test]
    fn stale_entry_does_not_continue_streak() {
        let tracker = PersistenceTracker::new(3);
        let today = NaiveDate::from_ymd_opt(2026, 2, 3).unwrap();
        let prior = vec![IssueTrackEntry {
            key: overdue("a12").key,
            label: "a12".to_string(),
            first_observed: today,
            last_observed: today,
            last_seen_run: 5,
            consecutive_runs: 4,
        }];

        let outcome = tracker.track(&prior, 7, &[overdue("a12")], today);
        assert_eq!(outcome.issues[0].consecutive_runs, 1);
        assert!(!outcome.any_persistent());
    }

    #[test]
    fn resolved_issues_are_removed() {
        let runs = vec![vec![overdue("a1"), overdue("a2")], vec![overdue("a2")]];
        assert_eq!(replay(&runs, "a1"), vec![1, 0]);
        assert_eq!(replay(&runs, "a2"), vec![1, 2]);
    }
}
