use chrono::{Days, NaiveDate};
use tracing::info;

use crate::config::EngineConfig;
use crate::models::{item_key, Snapshot};
use crate::store::HistoryState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub feedback_days: i64,
    pub issue_days: i64,
}

impl RetentionPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            feedback_days: config.feedback_retention_days,
            issue_days: config.issue_retention_days,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub feedback: usize,
    pub issues: usize,
    pub first_seen: usize,
}

/// Drop entries whose last relevant date is older than the retention
/// window, and first-seen records for items no longer in the snapshot.
/// Called after the run's own entries are added, which are dated today.
pub fn prune(
    state: &mut HistoryState,
    current: &Snapshot,
    today: NaiveDate,
    policy: RetentionPolicy,
) -> PruneStats {
    let feedback_cutoff = cutoff(today, policy.feedback_days);
    let issue_cutoff = cutoff(today, policy.issue_days);

    let before = (
        state.feedback.len(),
        state.issues.len(),
        state.graded_first_seen.len(),
    );

    state.feedback.retain(|entry| entry.date >= feedback_cutoff);
    state.issues.retain(|entry| entry.last_observed >= issue_cutoff);

    let live: std::collections::HashSet<String> = current
        .courses
        .iter()
        .flat_map(|(course_id, course)| {
            course
                .grades
                .iter()
                .map(move |record| item_key(course_id, &record.assignment_id))
        })
        .collect();
    state.graded_first_seen.retain(|key, _| live.contains(key));

    let stats = PruneStats {
        feedback: before.0 - state.feedback.len(),
        issues: before.1 - state.issues.len(),
        first_seen: before.2 - state.graded_first_seen.len(),
    };
    if stats != PruneStats::default() {
        info!(
            feedback = stats.feedback,
            issues = stats.issues,
            first_seen = stats.first_seen,
            "pruned history"
        );
    }
    stats
}

/// Oldest date still inside a window of `days`, saturating at the earliest
/// representable date.
fn cutoff(today: NaiveDate, days: i64) -> NaiveDate {
    today
        .checked_sub_days(Days::new(days.max(0).unsigned_abs()))
        .unwrap_or(NaiveDate::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::feedback::FeedbackCandidate;
    use crate::models::{ContextFingerprint, IssueKey, IssueKind, IssueTrackEntry};

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() + Duration::days(offset)
    }

    fn policy() -> RetentionPolicy {
        RetentionPolicy::from_config(&EngineConfig::default())
    }

    #[test]
    fn feedback_older_than_window_is_pruned() {
        let mut state = HistoryState::default();
        for (offset, text) in [(0, "day zero"), (31, "day thirty-one")] {
            state.feedback.push(
                FeedbackCandidate::new(text, ContextFingerprint::default()).into_entry(day(offset)),
            );
        }
        let snapshot = Snapshot::new(day(31).and_hms_opt(7, 0, 0).unwrap());

        let stats = prune(&mut state, &snapshot, day(31), policy());
        assert_eq!(stats.feedback, 1);
        assert_eq!(state.feedback.len(), 1);
        assert_eq!(state.feedback[0].date, day(31));
    }

    #[test]
    fn entry_on_window_edge_is_kept() {
        let mut state = HistoryState::default();
        state.feedback.push(
            FeedbackCandidate::new("edge", ContextFingerprint::default()).into_entry(day(0)),
        );
        let snapshot = Snapshot::new(day(30).and_hms_opt(7, 0, 0).unwrap());

        prune(&mut state, &snapshot, day(30), policy());
        assert_eq!(state.feedback.len(), 1);
    }

    #[test]
    fn issues_use_their_own_window() {
        let mut state = HistoryState::default();
        for (item, last) in [("old", 0), ("recent", 40)] {
            state.issues.push(IssueTrackEntry {
                key: IssueKey {
                    item: item.to_string(),
                    kind: IssueKind::LowGrade,
                },
                label: item.to_string(),
                first_observed: day(last),
                last_observed: day(last),
                last_seen_run: 1,
                consecutive_runs: 1,
            });
        }
        let snapshot = Snapshot::new(day(95).and_hms_opt(7, 0, 0).unwrap());

        let stats = prune(&mut state, &snapshot, day(95), policy());
        assert_eq!(stats.issues, 1);
        assert_eq!(state.issues[0].key.item, "recent");
    }

    #[test]
    fn oversized_window_keeps_everything() {
        let mut state = HistoryState::default();
        state.feedback.push(
            FeedbackCandidate::new("ancient", ContextFingerprint::default()).into_entry(day(0)),
        );
        let snapshot = Snapshot::new(day(400).and_hms_opt(7, 0, 0).unwrap());
        let policy = RetentionPolicy {
            feedback_days: 200_000_000,
            issue_days: i64::MAX,
        };

        let stats = prune(&mut state, &snapshot, day(400), policy);
        assert_eq!(stats.feedback, 0);
        assert_eq!(state.feedback.len(), 1);
        assert_eq!(cutoff(day(10), 3), day(7));
    }
}
