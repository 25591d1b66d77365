use std::fmt::Write;

use crate::models::{ItemSummary, RunReport};

fn item_line(item: &ItemSummary) -> String {
    match item.due_at {
        Some(due) => format!("{} ({}), due {}", item.title, item.course_name, due.format("%-m/%d %H:%M")),
        None => format!("{} ({})", item.title, item.course_name),
    }
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

/// One-line summary used as the report title or mail subject.
pub fn subject_line(report: &RunReport) -> String {
    let mut parts = vec![plural(report.new_items.len(), "new item")];
    if !report.upcoming_assessments.is_empty() {
        parts.push(plural(report.upcoming_assessments.len(), "upcoming test"));
    }
    if !report.overdue.is_empty() {
        parts.push(format!("{} overdue", report.overdue.len()));
    }
    let low = report.course_grades.iter().filter(|g| g.low).count();
    if low > 0 {
        parts.push(plural(low, "low grade"));
    }
    parts.join(", ")
}

pub fn build_report(report: &RunReport, threshold: f64) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Coursework Digest: {}", subject_line(report));
    let _ = writeln!(
        output,
        "Generated {} from data captured {}",
        report.generated_at.format("%A %B %-d, %Y %H:%M"),
        report.snapshot_captured_at.format("%Y-%m-%d %H:%M")
    );
    if report.first_run {
        let _ = writeln!(output, "First run: everything below is listed as new.");
    }

    if let Some(feedback) = &report.feedback {
        let _ = writeln!(output);
        let _ = writeln!(output, "> {}", feedback.text.replace('\n', "\n> "));
    }

    if !report.focus.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Today's Focus");
        for (index, item) in report.focus.iter().enumerate() {
            let _ = writeln!(output, "{}. {}", index + 1, item.action);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Overdue");
    if report.overdue.is_empty() {
        let _ = writeln!(output, "Nothing overdue.");
    } else {
        for overdue in &report.overdue {
            let marker = if overdue.persistent {
                format!(" **still overdue after {} runs**", overdue.consecutive_runs)
            } else {
                String::new()
            };
            let _ = writeln!(
                output,
                "- {} ({} days late){}",
                item_line(&overdue.item),
                overdue.days_overdue,
                marker
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Upcoming Tests");
    if report.upcoming_assessments.is_empty() {
        let _ = writeln!(output, "No tests or quizzes on the calendar.");
    } else {
        for test in &report.upcoming_assessments {
            let course = test.course_name.as_deref().unwrap_or("unknown course");
            let _ = writeln!(
                output,
                "- {} ({}) on {} {}",
                test.title,
                course,
                test.weekday,
                test.date.format("%-m/%d")
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Grades");
    if report.course_grades.is_empty() {
        let _ = writeln!(output, "No grades recorded.");
    } else {
        for grade in &report.course_grades {
            let mut notes = Vec::new();
            if grade.low {
                notes.push(format!("below {threshold:.0}%"));
            }
            if grade.persistent {
                notes.push(format!("low for {} runs", grade.consecutive_low_runs));
            }
            if grade.provisional {
                notes.push("provisional".to_string());
            }
            let suffix = if notes.is_empty() {
                String::new()
            } else {
                format!(" ({})", notes.join(", "))
            };
            let _ = writeln!(output, "- {}: {}{}", grade.course_name, grade.display, suffix);
            for period in &grade.periods {
                let _ = writeln!(
                    output,
                    "  - {}: {}{}",
                    period.period,
                    period.display,
                    if period.low { " (low)" } else { "" }
                );
            }
        }
    }

    let sections: [(&str, &[ItemSummary]); 3] = [
        ("New Assignments", report.new_items.as_slice()),
        ("Newly Graded", report.newly_graded.as_slice()),
        ("Newly Overdue", report.newly_overdue.as_slice()),
    ];
    for (title, items) in sections {
        if items.is_empty() {
            continue;
        }
        let _ = writeln!(output);
        let _ = writeln!(output, "## {title}");
        for item in items {
            let _ = writeln!(output, "- {}", item_line(item));
        }
    }

    if !report.recently_graded.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Recently Graded");
        for recent in &report.recently_graded {
            let _ = writeln!(
                output,
                "- {} {}: {} {} ({})",
                recent.date.format("%-m/%d"),
                recent.course_name,
                recent.title,
                recent.score,
                recent.display
            );
        }
    }

    if !report.low_items.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Low Scores");
        for item in &report.low_items {
            let _ = writeln!(output, "- {} ({}): {}", item.title, item.course_name, item.display);
        }
    }

    if !report.study_guides.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Study Guides");
        for guide in &report.study_guides {
            let _ = writeln!(output);
            let _ = writeln!(output, "### {} ({})", guide.assessment, guide.date.format("%-m/%d"));
            let _ = writeln!(output, "{}", guide.body.trim());
        }
    }

    output
}
