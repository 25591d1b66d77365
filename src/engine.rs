use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calendar::upcoming_assessments;
use crate::config::EngineConfig;
use crate::diff::{diff_snapshots, summarize, OverduePolicy, SnapshotDiff};
use crate::feedback::{fingerprint, FeedbackCandidate, FeedbackDeduplicator, Verdict};
use crate::generate::{PromptContext, StudyGuideRequest, TextGenerator};
use crate::grades::{recently_graded, update_first_seen, GradeEvaluator};
use crate::models::{
    item_key, AcceptedFeedback, ContextFingerprint, CourseGrade, FeedbackEntry, FirstSeen,
    FocusItem, IssueKey, IssueKind, LowItem, OverdueItem, RecentGrade, RunReport, Snapshot,
    StudyGuide, UpcomingAssessment,
};
use crate::prune::{prune, RetentionPolicy};
use crate::store::{HistoryState, HISTORY_VERSION};
use crate::tracker::{DetectedIssue, PersistenceTracker, TrackOutcome};

const MAX_FOCUS_ITEMS: usize = 4;

/// Derived signals for one run, computed from the current snapshot and the
/// prior history without touching either.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub today: NaiveDate,
    pub diff: SnapshotDiff,
    pub course_grades: Vec<CourseGrade>,
    pub low_items: Vec<LowItem>,
    pub overdue: Vec<OverdueItem>,
    pub upcoming: Vec<UpcomingAssessment>,
    pub recently_graded: Vec<RecentGrade>,
    pub tracked: TrackOutcome,
    pub fingerprint: ContextFingerprint,
    pub graded_first_seen: BTreeMap<String, FirstSeen>,
    pub focus: Vec<FocusItem>,
}

pub fn analyze(
    snapshot: &Snapshot,
    prior: &HistoryState,
    config: &EngineConfig,
    now: NaiveDateTime,
) -> Analysis {
    let today = now.date();
    let policy = OverduePolicy::from_config(config);
    let diff = diff_snapshots(snapshot, prior.previous_snapshot.as_ref(), &policy);

    let evaluator = GradeEvaluator::new(config.grade_warn_threshold);
    let mut course_grades = Vec::new();
    let mut low_items = Vec::new();
    for (course_id, course) in &snapshot.courses {
        let evaluation = evaluator.evaluate_course(course_id, course);
        course_grades.push(evaluation.grade);
        low_items.extend(evaluation.low_items);
    }

    let mut overdue_records: Vec<_> = snapshot
        .assignments()
        .filter(|(_, assignment)| policy.is_overdue(assignment, snapshot.captured_at))
        .collect();
    overdue_records.sort_by_key(|(_, assignment)| assignment.due_at);

    let mut detected: Vec<DetectedIssue> = overdue_records
        .iter()
        .map(|(course_id, assignment)| DetectedIssue {
            key: IssueKey {
                item: item_key(course_id, &assignment.id),
                kind: IssueKind::Overdue,
            },
            label: format!(
                "overdue {} ({})",
                assignment.title,
                snapshot.course_name(course_id).unwrap_or(course_id)
            ),
        })
        .collect();
    detected.extend(course_grades.iter().filter(|grade| grade.low).map(|grade| {
        DetectedIssue {
            key: IssueKey {
                item: grade.course_id.clone(),
                kind: IssueKind::LowGrade,
            },
            label: format!("low grade in {}", grade.course_name),
        }
    }));

    let tracker = PersistenceTracker::new(config.persistence_threshold);
    let tracked = tracker.track(&prior.issues, prior.run_seq, &detected, today);

    let overdue: Vec<OverdueItem> = overdue_records
        .iter()
        .map(|(course_id, assignment)| {
            let key = IssueKey {
                item: item_key(course_id, &assignment.id),
                kind: IssueKind::Overdue,
            };
            let issue = tracked.get(&key);
            OverdueItem {
                item: summarize(snapshot, course_id, assignment),
                days_overdue: assignment
                    .due_at
                    .map_or(0, |due| (snapshot.captured_at.date() - due.date()).num_days()),
                consecutive_runs: issue.map_or(1, |i| i.consecutive_runs),
                persistent: issue.map_or(false, |i| i.persistent),
            }
        })
        .collect();

    for grade in course_grades.iter_mut().filter(|grade| grade.low) {
        let key = IssueKey {
            item: grade.course_id.clone(),
            kind: IssueKind::LowGrade,
        };
        if let Some(issue) = tracked.get(&key) {
            grade.consecutive_low_runs = issue.consecutive_runs;
            grade.persistent = issue.persistent;
        }
    }

    let upcoming = upcoming_assessments(snapshot, config.local_offset(), today);
    let graded_first_seen =
        update_first_seen(snapshot, &prior.graded_first_seen, today, prior.is_first_run());
    let recently_graded = recently_graded(
        snapshot,
        &graded_first_seen,
        today,
        config.recency_window_days,
    );
    let fingerprint = fingerprint(overdue.len(), &upcoming, &course_grades);
    let focus = todays_focus(snapshot, &overdue, &upcoming, &course_grades);

    Analysis {
        today,
        diff,
        course_grades,
        low_items,
        overdue,
        upcoming,
        recently_graded,
        tracked,
        fingerprint,
        graded_first_seen,
        focus,
    }
}

/// Up to four actions for today: the oldest overdue item, the nearest
/// assessment, the weakest low-grade course, then the next assignment due.
fn todays_focus(
    snapshot: &Snapshot,
    overdue: &[OverdueItem],
    upcoming: &[UpcomingAssessment],
    course_grades: &[CourseGrade],
) -> Vec<FocusItem> {
    let mut focus = Vec::new();
    let mut used: Vec<&str> = Vec::new();

    if let Some(first) = overdue.first() {
        focus.push(FocusItem {
            action: format!("Finish overdue: {}", first.item.title),
            course_name: Some(first.item.course_name.clone()),
        });
        used.push(&first.item.title);
    }
    if let Some(test) = upcoming.first() {
        focus.push(FocusItem {
            action: format!("Study for {} ({})", test.title, test.weekday),
            course_name: test.course_name.clone(),
        });
        used.push(&test.title);
    }
    let lowest = course_grades
        .iter()
        .filter(|grade| grade.low)
        .filter_map(|grade| grade.percent.map(|percent| (percent, grade)))
        .min_by(|a, b| a.0.total_cmp(&b.0));
    if let Some((_, grade)) = lowest {
        focus.push(FocusItem {
            action: format!("Review {}: grade is {}", grade.course_name, grade.display),
            course_name: Some(grade.course_name.clone()),
        });
    }

    let mut pending: Vec<_> = snapshot
        .assignments()
        .filter(|(_, a)| !a.graded && a.score.is_none())
        .filter_map(|(course_id, a)| a.due_at.filter(|due| *due > snapshot.captured_at).map(|due| (due, course_id, a)))
        .collect();
    pending.sort_by_key(|(due, _, _)| *due);
    if let Some((_, course_id, assignment)) = pending
        .into_iter()
        .find(|(_, _, a)| !used.contains(&a.title.as_str()))
    {
        focus.push(FocusItem {
            action: format!("Work on {}", assignment.title),
            course_name: snapshot.course_name(course_id).map(str::to_string),
        });
    }

    focus.truncate(MAX_FOCUS_ITEMS);
    focus
}

pub struct RunOutcome {
    pub report: RunReport,
    /// Complete history for the next run, already pruned. Nothing has been
    /// written yet; the caller commits it in one step.
    pub next_state: HistoryState,
}

/// One full cycle: analyze, consult the text generator, and assemble both
/// the report and the next history state in memory.
pub async fn run_cycle(
    snapshot: Snapshot,
    prior: &HistoryState,
    config: &EngineConfig,
    generator: Option<&dyn TextGenerator>,
    now: NaiveDateTime,
) -> RunOutcome {
    let run_id = Uuid::new_v4();
    let analysis = analyze(&snapshot, prior, config, now);
    info!(
        %run_id,
        first_run = analysis.diff.first_run,
        new = analysis.diff.new_items.len(),
        newly_graded = analysis.diff.newly_graded.len(),
        overdue = analysis.overdue.len(),
        persistent = analysis.tracked.persistent().len(),
        "analysis complete"
    );

    let (study_guides, feedback, accepted_entry) = match generator {
        Some(generator) => {
            let guides = collect_study_guides(generator, &snapshot, &analysis).await;
            let (feedback, entry) =
                negotiate_feedback(generator, &analysis, prior, config).await;
            (guides, feedback, entry)
        }
        None => {
            debug!("no text generator configured, skipping feedback and study guides");
            (Vec::new(), None, None)
        }
    };

    let mut next_state = HistoryState {
        version: HISTORY_VERSION,
        run_seq: prior.run_seq + 1,
        last_run_at: Some(now),
        previous_snapshot: None,
        issues: analysis.tracked.entries.clone(),
        feedback: prior.feedback.iter().cloned().chain(accepted_entry).collect(),
        graded_first_seen: analysis.graded_first_seen.clone(),
    };
    prune(
        &mut next_state,
        &snapshot,
        analysis.today,
        RetentionPolicy::from_config(config),
    );

    let report = RunReport {
        run_id,
        generated_at: now,
        snapshot_captured_at: snapshot.captured_at,
        first_run: analysis.diff.first_run,
        new_items: analysis.diff.new_items,
        newly_graded: analysis.diff.newly_graded,
        newly_overdue: analysis.diff.newly_overdue,
        persistent_issues: analysis.tracked.persistent(),
        overdue: analysis.overdue,
        course_grades: analysis.course_grades,
        low_items: analysis.low_items,
        upcoming_assessments: analysis.upcoming,
        recently_graded: analysis.recently_graded,
        focus: analysis.focus,
        feedback,
        study_guides,
    };

    next_state.previous_snapshot = Some(snapshot);
    RunOutcome { report, next_state }
}

async fn collect_study_guides(
    generator: &dyn TextGenerator,
    snapshot: &Snapshot,
    analysis: &Analysis,
) -> Vec<StudyGuide> {
    let mut guides = Vec::new();
    for assessment in &analysis.upcoming {
        let Some(course) = assessment
            .course_id
            .as_deref()
            .and_then(|id| snapshot.courses.get(id))
        else {
            debug!(assessment = %assessment.title, "no course for assessment, skipping study guide");
            continue;
        };
        let materials: Vec<String> = course
            .materials
            .iter()
            .filter(|m| !m.text.trim().is_empty())
            .map(|m| format!("## {}\n{}", m.title, m.text))
            .collect();
        if materials.is_empty() {
            debug!(assessment = %assessment.title, "no material text, skipping study guide");
            continue;
        }

        let request = StudyGuideRequest::new(assessment, &course.name, &materials.join("\n\n"));
        match generator.study_guide(&request).await {
            Ok(Some(body)) if !body.trim().is_empty() => guides.push(StudyGuide {
                assessment: assessment.title.clone(),
                course_name: Some(course.name.clone()),
                date: assessment.date,
                body,
            }),
            Ok(_) => debug!(assessment = %assessment.title, "generator returned no study guide"),
            Err(err) => {
                warn!(assessment = %assessment.title, error = %err, "study guide generation failed")
            }
        }
    }
    guides
}

/// Ask for candidates until one passes the repetition checks or attempts run
/// out. Persistent issues allow repeated emphasis, never a verbatim repeat.
async fn negotiate_feedback(
    generator: &dyn TextGenerator,
    analysis: &Analysis,
    prior: &HistoryState,
    config: &EngineConfig,
) -> (Option<AcceptedFeedback>, Option<FeedbackEntry>) {
    let allow_repetition = analysis.tracked.any_persistent();
    let dedup = FeedbackDeduplicator::new(&prior.feedback, config, analysis.today);
    let mut context = PromptContext::build(
        analysis.today,
        &analysis.course_grades,
        &analysis.recently_graded,
        &analysis.upcoming,
        analysis.overdue.len(),
        analysis.tracked.persistent(),
        &prior.feedback,
    );

    for attempt in 1..=config.max_feedback_attempts {
        let text = match generator.feedback(&context).await {
            Ok(Some(text)) if !text.trim().is_empty() => text,
            Ok(_) => {
                debug!(attempt, "generator returned no feedback");
                return (None, None);
            }
            Err(err) => {
                warn!(attempt, error = %err, "feedback generation failed");
                return (None, None);
            }
        };

        let candidate = FeedbackCandidate::new(&text, analysis.fingerprint.clone());
        match dedup.check(&candidate, allow_repetition) {
            Verdict::Accepted => {
                info!(attempt, allow_repetition, "feedback accepted");
                let accepted = AcceptedFeedback {
                    text: candidate.text.clone(),
                    components: candidate.components.clone(),
                    attempts: attempt,
                    repetition_allowed: allow_repetition,
                };
                return (Some(accepted), Some(candidate.into_entry(analysis.today)));
            }
            Verdict::Rejected(reason) => {
                info!(attempt, %reason, "feedback too similar to history, requesting another");
                context.previous_rejection = Some(reason.to_string());
            }
        }
    }

    warn!(
        attempts = config.max_feedback_attempts,
        "no acceptable feedback, sending report without it"
    );
    (None, None)
}
