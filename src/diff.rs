use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime};
use tracing::debug;

use crate::config::EngineConfig;
use crate::models::{AssignmentRecord, ItemSummary, Snapshot};

/// Decides whether an assignment counts as overdue at a given instant.
#[derive(Debug, Clone)]
pub struct OverduePolicy {
    pub max_age: Duration,
    pub exclusions: Vec<String>,
}

impl OverduePolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_age: config.overdue_max_age(),
            exclusions: config
                .overdue_exclusions
                .iter()
                .map(|phrase| normalize_title(phrase))
                .collect(),
        }
    }

    pub fn is_overdue(&self, assignment: &AssignmentRecord, at: NaiveDateTime) -> bool {
        if assignment.graded || assignment.score.is_some() {
            return false;
        }
        let Some(due_at) = assignment.due_at else {
            debug!(assignment = %assignment.id, "no due date, skipping overdue check");
            return false;
        };
        if due_at >= at || due_at < at - self.max_age {
            return false;
        }
        let title = normalize_title(&assignment.title);
        !self.exclusions.iter().any(|phrase| title.contains(phrase.as_str()))
    }
}

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub first_run: bool,
    pub new_items: Vec<ItemSummary>,
    pub newly_graded: Vec<ItemSummary>,
    pub newly_overdue: Vec<ItemSummary>,
}

pub fn summarize(snapshot: &Snapshot, course_id: &str, assignment: &AssignmentRecord) -> ItemSummary {
    ItemSummary {
        course_id: course_id.to_string(),
        course_name: snapshot.course_name(course_id).unwrap_or(course_id).to_string(),
        assignment_id: assignment.id.clone(),
        title: assignment.title.clone(),
        due_at: assignment.due_at,
    }
}

/// Compare the current snapshot with the previous one. Without a previous
/// snapshot every item is new and no graded/overdue transitions are
/// reported, so a first report is not flooded.
pub fn diff_snapshots(
    current: &Snapshot,
    previous: Option<&Snapshot>,
    policy: &OverduePolicy,
) -> SnapshotDiff {
    let Some(previous) = previous else {
        return SnapshotDiff {
            first_run: true,
            new_items: current
                .assignments()
                .map(|(course_id, assignment)| summarize(current, course_id, assignment))
                .collect(),
            ..SnapshotDiff::default()
        };
    };

    let prior: HashMap<(&str, &str), &AssignmentRecord> = previous
        .assignments()
        .map(|(course_id, assignment)| ((course_id, assignment.id.as_str()), assignment))
        .collect();

    let mut diff = SnapshotDiff::default();
    for (course_id, assignment) in current.assignments() {
        let Some(before) = prior.get(&(course_id, assignment.id.as_str())) else {
            diff.new_items.push(summarize(current, course_id, assignment));
            continue;
        };

        if became_graded(before, assignment) {
            diff.newly_graded.push(summarize(current, course_id, assignment));
        } else if policy.is_overdue(assignment, current.captured_at)
            && !policy.is_overdue(before, previous.captured_at)
        {
            diff.newly_overdue.push(summarize(current, course_id, assignment));
        }
    }
    diff
}

fn became_graded(before: &AssignmentRecord, now: &AssignmentRecord) -> bool {
    if before.graded {
        return false;
    }
    now.graded || (now.score.is_some() && now.score != before.score)
}
