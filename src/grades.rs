use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use tracing::{debug, warn};

use crate::models::{
    item_key, CategoryGrade, CategoryWeight, CourseGrade, CourseSnapshot, FirstSeen, GradeRecord,
    GradeSource, LowItem, PeriodGrade, RecentGrade, Snapshot,
};

const WEIGHT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedGrade {
    pub percent: f64,
    /// Weights of the categories present sum to less than 1.0, or some
    /// graded category had no weight.
    pub provisional: bool,
    pub categories: Vec<CategoryGrade>,
}

pub fn display_percent(percent: f64) -> String {
    format!("{percent:.1}%")
}

/// Weighted percentage over well-formed grade records. Each category's
/// item percentages are averaged, scaled by the category weight and summed.
/// Missing categories are not renormalized away, so an in-progress period
/// reads as provisional. With no weights at all the category averages are
/// combined unweighted and the result is always provisional.
pub fn weighted_percentage(
    records: &[&GradeRecord],
    weights: &[CategoryWeight],
    period: Option<&str>,
) -> Option<WeightedGrade> {
    let mut by_category: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for record in records {
        if let Some(percent) = record.percentage() {
            by_category
                .entry(record.category.as_str())
                .or_default()
                .push(percent);
        }
    }
    if by_category.is_empty() {
        return None;
    }

    let categories: Vec<CategoryGrade> = by_category
        .into_iter()
        .map(|(category, mut percents)| {
            // sorted so the sum does not depend on input order
            percents.sort_by(f64::total_cmp);
            let average = percents.iter().sum::<f64>() / percents.len() as f64;
            CategoryGrade {
                category: category.to_string(),
                weight: category_weight(weights, category, period),
                average,
                graded_items: percents.len(),
            }
        })
        .collect();

    let weighted: Vec<(f64, f64)> = categories
        .iter()
        .filter_map(|c| c.weight.map(|w| (w, c.average)))
        .collect();

    let (percent, provisional) = if weighted.is_empty() {
        let mean = categories.iter().map(|c| c.average).sum::<f64>() / categories.len() as f64;
        debug!(categories = categories.len(), "no category weights, using unweighted mean");
        (mean, true)
    } else {
        let weight_sum: f64 = weighted.iter().map(|(w, _)| w).sum();
        let percent: f64 = weighted.iter().map(|(w, avg)| w * avg).sum();
        if weighted.len() < categories.len() {
            debug!(
                unweighted = categories.len() - weighted.len(),
                "categories without weight excluded from weighted grade"
            );
        }
        let provisional =
            weight_sum < 1.0 - WEIGHT_EPSILON || weighted.len() < categories.len();
        (percent, provisional)
    };

    Some(WeightedGrade {
        percent,
        provisional,
        categories,
    })
}

fn category_weight(weights: &[CategoryWeight], category: &str, period: Option<&str>) -> Option<f64> {
    let matching: Vec<&CategoryWeight> = weights
        .iter()
        .filter(|w| w.category.trim().eq_ignore_ascii_case(category.trim()))
        .filter(|w| w.weight.is_finite() && w.weight >= 0.0)
        .collect();

    let exact = matching.iter().find(|w| w.period.as_deref() == period);
    let course_wide = matching.iter().find(|w| w.period.is_none());
    exact
        .or(course_wide)
        .or_else(|| if period.is_none() { matching.first() } else { None })
        .map(|w| w.weight)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseEvaluation {
    pub grade: CourseGrade,
    pub low_items: Vec<LowItem>,
}

pub struct GradeEvaluator {
    threshold: f64,
}

impl GradeEvaluator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Strictly below the threshold, compared on the unrounded value.
    pub fn is_low(&self, percent: f64) -> bool {
        percent < self.threshold
    }

    pub fn evaluate_course(&self, course_id: &str, course: &CourseSnapshot) -> CourseEvaluation {
        let valid: Vec<&GradeRecord> = course
            .grades
            .iter()
            .filter(|record| {
                let usable = record.percentage().is_some();
                if !usable {
                    warn!(
                        course = course_id,
                        assignment = %record.assignment_id,
                        score = record.score,
                        max = record.max_score,
                        "skipping malformed grade record"
                    );
                }
                usable
            })
            .collect();

        let mut by_period: BTreeMap<&str, Vec<&GradeRecord>> = BTreeMap::new();
        for record in valid.iter().copied() {
            if let Some(period) = record.period.as_deref() {
                by_period.entry(period).or_default().push(record);
            }
        }
        let periods: Vec<PeriodGrade> = by_period
            .into_iter()
            .filter_map(|(period, records)| {
                let grade = weighted_percentage(&records, &course.weights, Some(period))?;
                Some(PeriodGrade {
                    period: period.to_string(),
                    percent: grade.percent,
                    display: display_percent(grade.percent),
                    low: self.is_low(grade.percent),
                    provisional: grade.provisional,
                    categories: grade.categories,
                })
            })
            .collect();

        let overall = weighted_percentage(&valid, &course.weights, None);
        let reported = course.reported_percent.filter(|p| p.is_finite());
        let (percent, source) = match (reported, &overall) {
            (Some(percent), _) => (Some(percent), GradeSource::Reported),
            (None, Some(grade)) => (Some(grade.percent), GradeSource::Computed),
            (None, None) => (None, GradeSource::Computed),
        };
        let provisional = source == GradeSource::Computed
            && overall.as_ref().map_or(false, |grade| grade.provisional);

        let low_items = valid
            .iter()
            .filter_map(|record| {
                let percent = record.percentage()?;
                if !self.is_low(percent) {
                    return None;
                }
                let title = course
                    .assignment(&record.assignment_id)
                    .map(|a| a.title.clone())
                    .unwrap_or_else(|| record.assignment_id.clone());
                Some(LowItem {
                    course_id: course_id.to_string(),
                    course_name: course.name.clone(),
                    assignment_id: record.assignment_id.clone(),
                    title,
                    percent,
                    display: display_percent(percent),
                })
            })
            .collect();

        CourseEvaluation {
            grade: CourseGrade {
                course_id: course_id.to_string(),
                course_name: course.name.clone(),
                percent,
                display: percent.map(display_percent).unwrap_or_else(|| "n/a".to_string()),
                source,
                low: percent.map_or(false, |p| self.is_low(p)),
                provisional,
                categories: overall.map(|grade| grade.categories).unwrap_or_default(),
                periods,
                consecutive_low_runs: 0,
                persistent: false,
            },
            low_items,
        }
    }
}

/// Record the first day each graded item was observed. Items seen on the
/// very first run are marked seeded so they never show up as recent.
pub fn update_first_seen(
    snapshot: &Snapshot,
    prior: &BTreeMap<String, FirstSeen>,
    today: NaiveDate,
    first_run: bool,
) -> BTreeMap<String, FirstSeen> {
    let mut next = prior.clone();
    for (course_id, course) in &snapshot.courses {
        for record in course.grades.iter().filter(|r| r.percentage().is_some()) {
            next.entry(item_key(course_id, &record.assignment_id))
                .or_insert(FirstSeen {
                    date: today,
                    seeded: first_run,
                });
        }
    }
    next
}

/// Graded items whose grade date falls inside the recency window, newest
/// first. The grade timestamp wins; the first-seen date is the fallback.
pub fn recently_graded(
    snapshot: &Snapshot,
    first_seen: &BTreeMap<String, FirstSeen>,
    today: NaiveDate,
    window_days: i64,
) -> Vec<RecentGrade> {
    let cutoff = today - Duration::days(window_days);
    let mut results = Vec::new();

    for (course_id, course) in &snapshot.courses {
        for record in &course.grades {
            let Some(percent) = record.percentage() else {
                continue;
            };
            let date = match record.graded_at {
                Some(graded_at) => graded_at.date(),
                None => match first_seen.get(&item_key(course_id, &record.assignment_id)) {
                    Some(seen) if !seen.seeded => seen.date,
                    _ => continue,
                },
            };
            if date < cutoff {
                continue;
            }
            let title = course
                .assignment(&record.assignment_id)
                .map(|a| a.title.clone())
                .unwrap_or_else(|| record.assignment_id.clone());
            results.push(RecentGrade {
                course_id: course_id.clone(),
                course_name: course.name.clone(),
                title,
                score: format!("{}/{}", record.score, record.max_score),
                percent,
                display: format!("{percent:.0}%"),
                date,
            });
        }
    }

    results.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.title.cmp(&b.title)));
    results
}
