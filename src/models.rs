use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One run's observed coursework state. Each run's snapshot fully replaces
/// the previous one in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub captured_at: NaiveDateTime,
    #[serde(default)]
    pub courses: BTreeMap<String, CourseSnapshot>,
    #[serde(default)]
    pub events: Vec<CalendarEventRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CourseSnapshot {
    pub name: String,
    /// Course grade as reported by the LMS, preferred over the computed one.
    #[serde(default)]
    pub reported_percent: Option<f64>,
    #[serde(default)]
    pub assignments: Vec<AssignmentRecord>,
    #[serde(default)]
    pub grades: Vec<GradeRecord>,
    #[serde(default)]
    pub weights: Vec<CategoryWeight>,
    #[serde(default)]
    pub materials: Vec<MaterialRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: String,
    pub title: String,
    pub course_id: String,
    #[serde(default)]
    pub due_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub posted_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub graded: bool,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub assignment_id: String,
    pub score: f64,
    pub max_score: f64,
    pub category: String,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub graded_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryWeight {
    pub course_id: String,
    pub category: String,
    #[serde(default)]
    pub period: Option<String>,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEventRecord {
    pub id: String,
    #[serde(default)]
    pub course_id: Option<String>,
    pub title: String,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub is_assessment: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialRecord {
    pub id: String,
    pub course_id: String,
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub posted_at: Option<NaiveDateTime>,
}

impl Snapshot {
    pub fn new(captured_at: NaiveDateTime) -> Self {
        Self {
            captured_at,
            courses: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Every assignment paired with its course id, in course order.
    pub fn assignments(&self) -> impl Iterator<Item = (&str, &AssignmentRecord)> {
        self.courses.iter().flat_map(|(course_id, course)| {
            course
                .assignments
                .iter()
                .map(move |assignment| (course_id.as_str(), assignment))
        })
    }

    pub fn course_name(&self, course_id: &str) -> Option<&str> {
        self.courses.get(course_id).map(|course| course.name.as_str())
    }
}

impl CourseSnapshot {
    pub fn assignment(&self, id: &str) -> Option<&AssignmentRecord> {
        self.assignments.iter().find(|assignment| assignment.id == id)
    }
}

impl GradeRecord {
    /// Percentage for a well-formed record; `None` when the record cannot
    /// be used (max not positive, score outside `[0, max]`, non-finite).
    pub fn percentage(&self) -> Option<f64> {
        if !self.score.is_finite() || !self.max_score.is_finite() || self.max_score <= 0.0 {
            return None;
        }
        if self.score < 0.0 || self.score > self.max_score {
            return None;
        }
        Some(self.score / self.max_score * 100.0)
    }
}

/// Diff key for an item: identifiers are only unique within a course.
pub fn item_key(course_id: &str, item_id: &str) -> String {
    format!("{course_id}::{item_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    LowGrade,
    Overdue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueKey {
    pub item: String,
    pub kind: IssueKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueTrackEntry {
    pub key: IssueKey,
    pub label: String,
    pub first_observed: NaiveDate,
    pub last_observed: NaiveDate,
    pub last_seen_run: u64,
    pub consecutive_runs: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackComponents {
    pub encouragement: String,
    pub joke: String,
}

/// Summary of the inputs a piece of feedback was generated from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextFingerprint {
    pub overdue_count: usize,
    pub upcoming_tests: Vec<String>,
    pub low_grades: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub id: Uuid,
    pub date: NaiveDate,
    pub weekday: String,
    pub text: String,
    pub components: FeedbackComponents,
    pub context: ContextFingerprint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstSeen {
    pub date: NaiveDate,
    /// Recorded on the very first run; never counts as recent.
    pub seeded: bool,
}

// Structured result handed to the rendering collaborator.

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSummary {
    pub course_id: String,
    pub course_name: String,
    pub assignment_id: String,
    pub title: String,
    pub due_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverdueItem {
    pub item: ItemSummary,
    pub days_overdue: i64,
    pub consecutive_runs: u32,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryGrade {
    pub category: String,
    pub weight: Option<f64>,
    pub average: f64,
    pub graded_items: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodGrade {
    pub period: String,
    pub percent: f64,
    pub display: String,
    pub low: bool,
    pub provisional: bool,
    pub categories: Vec<CategoryGrade>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeSource {
    Reported,
    Computed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseGrade {
    pub course_id: String,
    pub course_name: String,
    pub percent: Option<f64>,
    pub display: String,
    pub source: GradeSource,
    pub low: bool,
    pub provisional: bool,
    pub categories: Vec<CategoryGrade>,
    pub periods: Vec<PeriodGrade>,
    pub consecutive_low_runs: u32,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LowItem {
    pub course_id: String,
    pub course_name: String,
    pub assignment_id: String,
    pub title: String,
    pub percent: f64,
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentGrade {
    pub course_id: String,
    pub course_name: String,
    pub title: String,
    pub score: String,
    pub percent: f64,
    pub display: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpcomingAssessment {
    pub title: String,
    pub course_id: Option<String>,
    pub course_name: Option<String>,
    pub date: NaiveDate,
    pub weekday: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistentIssue {
    pub key: IssueKey,
    pub label: String,
    pub consecutive_runs: u32,
    pub first_observed: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FocusItem {
    pub action: String,
    pub course_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedFeedback {
    pub text: String,
    pub components: FeedbackComponents,
    pub attempts: u32,
    pub repetition_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudyGuide {
    pub assessment: String,
    pub course_name: Option<String>,
    pub date: NaiveDate,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub generated_at: NaiveDateTime,
    pub snapshot_captured_at: NaiveDateTime,
    pub first_run: bool,
    pub new_items: Vec<ItemSummary>,
    pub newly_graded: Vec<ItemSummary>,
    pub newly_overdue: Vec<ItemSummary>,
    pub overdue: Vec<OverdueItem>,
    pub course_grades: Vec<CourseGrade>,
    pub low_items: Vec<LowItem>,
    pub persistent_issues: Vec<PersistentIssue>,
    pub upcoming_assessments: Vec<UpcomingAssessment>,
    pub recently_graded: Vec<RecentGrade>,
    pub focus: Vec<FocusItem>,
    pub feedback: Option<AcceptedFeedback>,
    pub study_guides: Vec<StudyGuide>,
}
