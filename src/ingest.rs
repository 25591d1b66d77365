use std::path::Path;

use anyhow::Context;
use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::models::{AssignmentRecord, CategoryWeight, CourseSnapshot, GradeRecord, Snapshot};

pub fn load_snapshot(path: &Path) -> anyhow::Result<Snapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&raw)
        .with_context(|| format!("invalid snapshot {}", path.display()))?;
    debug!(
        courses = snapshot.courses.len(),
        events = snapshot.events.len(),
        "loaded snapshot"
    );
    Ok(snapshot)
}

pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    let body = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, body)
        .with_context(|| format!("failed to write snapshot {}", path.display()))?;
    Ok(())
}

/// Build a snapshot from a gradebook export with one row per assignment.
/// Rows without a score become ungraded assignments; category weights given
/// as whole percentages are converted to fractions.
pub fn import_csv(csv_path: &Path, captured_at: NaiveDateTime) -> anyhow::Result<Snapshot> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        course_id: String,
        course_name: String,
        assignment_id: String,
        title: String,
        due_at: Option<NaiveDateTime>,
        category: Option<String>,
        period: Option<String>,
        score: Option<f64>,
        max_score: Option<f64>,
        weight: Option<f64>,
        graded_at: Option<NaiveDateTime>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut snapshot = Snapshot::new(captured_at);

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid row {} in {}", line + 2, csv_path.display()))?;
        let course = snapshot
            .courses
            .entry(row.course_id.clone())
            .or_insert_with(|| CourseSnapshot {
                name: row.course_name.clone(),
                ..CourseSnapshot::default()
            });
        let category = row.category.unwrap_or_else(|| "Uncategorized".to_string());

        let graded = match (row.score, row.max_score) {
            (Some(score), Some(max_score)) => {
                course.grades.push(GradeRecord {
                    assignment_id: row.assignment_id.clone(),
                    score,
                    max_score,
                    category: category.clone(),
                    period: row.period.clone(),
                    graded_at: row.graded_at,
                });
                true
            }
            (Some(_), None) => {
                warn!(assignment = %row.assignment_id, "score without max score, treating as ungraded");
                false
            }
            _ => false,
        };

        if let Some(weight) = row.weight {
            let weight = if weight > 1.0 { weight / 100.0 } else { weight };
            let known = course
                .weights
                .iter()
                .any(|w| w.category == category && w.period == row.period);
            if !known {
                course.weights.push(CategoryWeight {
                    course_id: row.course_id.clone(),
                    category: category.clone(),
                    period: row.period.clone(),
                    weight,
                });
            }
        }

        course.assignments.push(AssignmentRecord {
            id: row.assignment_id,
            title: row.title,
            course_id: row.course_id,
            due_at: row.due_at,
            posted_at: None,
            graded,
            score: if graded { row.score } else { None },
        });
    }

    Ok(snapshot)
}
