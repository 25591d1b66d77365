use std::collections::{HashMap, VecDeque};
use std::fmt::Write;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::calendar::weekday_name;
use crate::models::{
    CourseGrade, FeedbackComponents, FeedbackEntry, PersistentIssue, RecentGrade,
    UpcomingAssessment,
};

const MAX_MATERIALS_CHARS: usize = 30_000;
const FEEDBACK_LOOKBACK_DAYS: i64 = 7;
const FEEDBACK_LOOKBACK_ENTRIES: usize = 7;

/// Everything a text generator needs to write today's feedback.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub today: NaiveDate,
    pub weekday: String,
    pub is_friday: bool,
    pub grades: Vec<String>,
    pub recent: Vec<String>,
    pub upcoming: Vec<UpcomingAssessment>,
    pub overdue_count: usize,
    pub persistent_issues: Vec<PersistentIssue>,
    pub recent_feedback: Vec<(NaiveDate, FeedbackComponents)>,
    /// Why the previous candidate in this run was turned down.
    pub previous_rejection: Option<String>,
}

impl PromptContext {
    pub fn build(
        today: NaiveDate,
        course_grades: &[CourseGrade],
        recent: &[RecentGrade],
        upcoming: &[UpcomingAssessment],
        overdue_count: usize,
        persistent_issues: Vec<PersistentIssue>,
        feedback_history: &[FeedbackEntry],
    ) -> Self {
        let lookback = today - chrono::Duration::days(FEEDBACK_LOOKBACK_DAYS);
        let mut recent_feedback: Vec<(NaiveDate, FeedbackComponents)> = feedback_history
            .iter()
            .filter(|entry| entry.date >= lookback)
            .map(|entry| (entry.date, entry.components.clone()))
            .collect();
        let skip = recent_feedback.len().saturating_sub(FEEDBACK_LOOKBACK_ENTRIES);
        recent_feedback.drain(..skip);

        Self {
            today,
            weekday: weekday_name(today),
            is_friday: today.weekday() == Weekday::Fri,
            grades: course_grades
                .iter()
                .filter(|grade| grade.percent.is_some())
                .map(|grade| format!("{}: {}", grade.course_name, grade.display))
                .collect(),
            recent: recent
                .iter()
                .take(8)
                .map(|r| format!("{}: {} - {} ({})", r.course_name, r.title, r.score, r.display))
                .collect(),
            upcoming: upcoming.to_vec(),
            overdue_count,
            persistent_issues,
            recent_feedback,
            previous_rejection: None,
        }
    }

    /// Plain-text prompt for model-backed generators.
    pub fn render(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "Today: {}, {}", self.weekday, self.today.format("%B %d, %Y"));
        let _ = writeln!(output);
        write_section(&mut output, "CURRENT GRADES", &self.grades, "(no course grades available)");
        write_section(&mut output, "RECENTLY GRADED", &self.recent, "(none)");

        let tests: Vec<String> = self
            .upcoming
            .iter()
            .map(|u| {
                let course = u.course_name.as_deref().unwrap_or("unknown course");
                format!("{} ({}) - {} {}", u.title, course, u.weekday, u.date.format("%-m/%d/%y"))
            })
            .collect();
        write_section(&mut output, "UPCOMING TESTS", &tests, "(none)");
        let _ = writeln!(output, "OVERDUE ASSIGNMENTS: {}", self.overdue_count);
        let _ = writeln!(output);

        let issues: Vec<String> = self
            .persistent_issues
            .iter()
            .map(|issue| format!("{}: {} consecutive runs", issue.label, issue.consecutive_runs))
            .collect();
        write_section(
            &mut output,
            "PERSISTENT ISSUES (may be repeated)",
            &issues,
            "(none)",
        );

        let history: Vec<String> = self
            .recent_feedback
            .iter()
            .flat_map(|(date, parts)| {
                let mut lines = vec![format!("{date} encouragement: {}", parts.encouragement)];
                if !parts.joke.is_empty() {
                    lines.push(format!("{date} joke: {}", parts.joke));
                }
                lines
            })
            .collect();
        write_section(
            &mut output,
            "RECENT FEEDBACK (avoid repeating)",
            &history,
            "(no recent feedback)",
        );

        let _ = writeln!(
            output,
            "Write 1-2 sentences of specific encouragement, then a short clean joke \
             separated by a blank line. Plain text only."
        );
        if self.is_friday {
            let _ = writeln!(output, "It is Friday, so a TGIF note is welcome.");
        }
        if let Some(reason) = &self.previous_rejection {
            let _ = writeln!(output, "The previous draft was rejected: {reason}. Write something new.");
        }
        output
    }
}

fn write_section(output: &mut String, title: &str, lines: &[String], empty: &str) {
    let _ = writeln!(output, "{title}:");
    if lines.is_empty() {
        let _ = writeln!(output, "  {empty}");
    }
    for line in lines {
        let _ = writeln!(output, "  {line}");
    }
    let _ = writeln!(output);
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudyGuideRequest {
    pub assessment: UpcomingAssessment,
    pub course_name: String,
    pub materials: String,
}

impl StudyGuideRequest {
    pub fn new(assessment: &UpcomingAssessment, course_name: &str, materials: &str) -> Self {
        Self {
            assessment: assessment.clone(),
            course_name: course_name.to_string(),
            materials: truncate_materials(materials),
        }
    }
}

fn truncate_materials(text: &str) -> String {
    match text.char_indices().nth(MAX_MATERIALS_CHARS) {
        Some((cut, _)) => format!("{}\n\n[...materials truncated...]", &text[..cut]),
        None => text.to_string(),
    }
}

/// The external text-generation service. `Ok(None)` or an empty string
/// means nothing was produced this time.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn feedback(&self, context: &PromptContext) -> anyhow::Result<Option<String>>;

    async fn study_guide(&self, request: &StudyGuideRequest) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Default, Deserialize)]
struct ReplayFile {
    #[serde(default)]
    feedback: Vec<String>,
    #[serde(default)]
    study_guides: HashMap<String, String>,
}

/// Serves pre-written candidates from a JSON file, one feedback text per
/// request, and study guides by assessment title.
pub struct ReplayGenerator {
    feedback: Mutex<VecDeque<String>>,
    study_guides: HashMap<String, String>,
}

impl ReplayGenerator {
    pub fn new(feedback: Vec<String>, study_guides: HashMap<String, String>) -> Self {
        Self {
            feedback: Mutex::new(feedback.into()),
            study_guides,
        }
    }

    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        let file: ReplayFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid replay file {}", path.display()))?;
        Ok(Self::new(file.feedback, file.study_guides))
    }
}

#[async_trait]
impl TextGenerator for ReplayGenerator {
    async fn feedback(&self, context: &PromptContext) -> anyhow::Result<Option<String>> {
        let mut queue = self.feedback.lock().await;
        let next = queue.pop_front();
        debug!(
            remaining = queue.len(),
            prompt = %context.render(),
            "replaying feedback candidate"
        );
        Ok(next)
    }

    async fn study_guide(&self, request: &StudyGuideRequest) -> anyhow::Result<Option<String>> {
        Ok(self.study_guides.get(&request.assessment.title).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment() -> UpcomingAssessment {
        let date = NaiveDate::from_ymd_opt(2026, 2, 5).unwrap();
        UpcomingAssessment {
            title: "Chapter 4 Quiz".to_string(),
            course_id: Some("sci".to_string()),
            course_name: Some("Science".to_string()),
            date,
            weekday: weekday_name(date),
        }
    }

    #[test]
    fn prompt_mentions_weekday_and_tests() {
        let today = NaiveDate::from_ymd_opt(2026, 2, 6).unwrap();
        let mut context = PromptContext::build(today, &[], &[], &[assessment()], 2, Vec::new(), &[]);
        context.previous_rejection = Some("joke too close".to_string());
        let prompt = context.render();

        assert!(context.is_friday);
        assert!(prompt.contains("Today: Friday"));
        assert!(prompt.contains("Chapter 4 Quiz (Science) - Thursday 2/05/26"));
        assert!(prompt.contains("OVERDUE ASSIGNMENTS: 2"));
        assert!(prompt.contains("rejected: joke too close"));
    }

    #[test]
    fn materials_are_truncated() {
        let long = "x".repeat(MAX_MATERIALS_CHARS + 10);
        let request = StudyGuideRequest::new(&assessment(), "Science", &long);
        assert!(request.materials.ends_with("[...materials truncated...]"));
        assert_eq!(StudyGuideRequest::new(&assessment(), "Science", "short").materials, "short");
    }

    #[tokio::test]
    async fn replay_serves_candidates_in_order() {
        let mut guides = HashMap::new();
        guides.insert("Chapter 4 Quiz".to_string(), "<h2>Cells</h2>".to_string());
        let generator = ReplayGenerator::new(vec!["first".to_string(), "second".to_string()], guides);
        let context = PromptContext::build(
            NaiveDate::from_ymd_opt(2026, 2, 2).unwrap(),
            &[],
            &[],
            &[],
            0,
            Vec::new(),
            &[],
        );

        assert_eq!(generator.feedback(&context).await.unwrap().as_deref(), Some("first"));
        assert_eq!(generator.feedback(&context).await.unwrap().as_deref(), Some("second"));
        assert_eq!(generator.feedback(&context).await.unwrap(), None);

        let request = StudyGuideRequest::new(&assessment(), "Science", "cells");
        assert!(generator.study_guide(&request).await.unwrap().is_some());
    }
}
