use chrono::{Duration, FixedOffset, NaiveDate, NaiveDateTime, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{CalendarEventRecord, Snapshot, UpcomingAssessment};

static ASSESSMENT_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(test|quiz|quest|exam)\b").expect("valid assessment regex"));

/// Upstream all-day events arrive as UTC instants in the early morning.
const ALL_DAY_UTC_HOUR_CUTOFF: u32 = 6;

pub fn is_assessment_title(title: &str) -> bool {
    ASSESSMENT_TITLE.is_match(title)
}

/// Local start of a calendar event. All-day events are encoded in UTC
/// regardless of the viewer's day boundary, so they are shifted by the
/// local offset and pinned to local midnight.
pub fn local_start(event: &CalendarEventRecord, offset: FixedOffset) -> NaiveDateTime {
    let local = event.start.with_timezone(&offset).naive_local();
    if event.all_day || event.start.hour() < ALL_DAY_UTC_HOUR_CUTOFF {
        local.date().and_time(chrono::NaiveTime::MIN)
    } else {
        local
    }
}

pub fn weekday_name(date: NaiveDate) -> String {
    date.format("%A").to_string()
}

/// Assessments dated tomorrow or later, from the calendar and from
/// assignment titles. A calendar entry with the same title as an assignment
/// wins, since its date is the more precise one.
pub fn upcoming_assessments(
    snapshot: &Snapshot,
    offset: FixedOffset,
    today: NaiveDate,
) -> Vec<UpcomingAssessment> {
    let tomorrow = today + Duration::days(1);
    let mut upcoming: Vec<UpcomingAssessment> = Vec::new();

    for (course_id, assignment) in snapshot.assignments() {
        if !is_assessment_title(&assignment.title) {
            continue;
        }
        let Some(due_at) = assignment.due_at else {
            continue;
        };
        upcoming.push(UpcomingAssessment {
            title: assignment.title.clone(),
            course_id: Some(course_id.to_string()),
            course_name: snapshot.course_name(course_id).map(str::to_string),
            date: due_at.date(),
            weekday: weekday_name(due_at.date()),
        });
    }

    for event in &snapshot.events {
        if !event.is_assessment && !is_assessment_title(&event.title) {
            continue;
        }
        let date = local_start(event, offset).date();
        if let Some(existing) = upcoming.iter_mut().find(|u| u.title == event.title) {
            existing.date = date;
            existing.weekday = weekday_name(date);
            continue;
        }
        let course_id = event.course_id.clone();
        upcoming.push(UpcomingAssessment {
            title: event.title.clone(),
            course_name: course_id
                .as_deref()
                .and_then(|id| snapshot.course_name(id))
                .map(str::to_string),
            course_id,
            date,
            weekday: weekday_name(date),
        });
    }

    upcoming.retain(|u| u.date >= tomorrow);
    upcoming.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.title.cmp(&b.title)));
    upcoming
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::models::{AssignmentRecord, CourseSnapshot};

    fn est() -> FixedOffset {
        FixedOffset::west_opt(5 * 3600).unwrap()
    }

    fn event(title: &str, start: chrono::DateTime<Utc>, all_day: bool) -> CalendarEventRecord {
        CalendarEventRecord {
            id: title.to_lowercase(),
            course_id: None,
            title: title.to_string(),
            start,
            all_day,
            is_assessment: false,
        }
    }

    #[test]
    fn all_day_events_land_on_local_midnight() {
        let start = Utc.with_ymd_and_hms(2026, 2, 3, 5, 0, 0).unwrap();
        let local = local_start(&event("Field trip", start, true), est());
        assert_eq!(
            local,
            NaiveDate::from_ymd_opt(2026, 2, 3).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
    }

    #[test]
    fn timed_events_use_fixed_offset() {
        let start = Utc.with_ymd_and_hms(2026, 2, 3, 19, 30, 0).unwrap();
        let local = local_start(&event("Concert", start, false), est());
        assert_eq!(
            local,
            NaiveDate::from_ymd_opt(2026, 2, 3).unwrap().and_hms_opt(14, 30, 0).unwrap()
        );
    }

    #[test]
    fn matches_assessment_words_only() {
        assert!(is_assessment_title("Unit 4 Quiz"));
        assert!(is_assessment_title("EXAM review"));
        assert!(!is_assessment_title("Contest entry"));
        assert!(!is_assessment_title("Testing lab"));
    }

    #[test]
    fn collects_future_assessments_with_calendar_dates() {
        let today = NaiveDate::from_ymd_opt(2026, 2, 2).unwrap();
        let mut snapshot = Snapshot::new(today.and_hms_opt(7, 0, 0).unwrap());
        snapshot.courses.insert(
            "sci".to_string(),
            CourseSnapshot {
                name: "Science".to_string(),
                assignments: vec![AssignmentRecord {
                    id: "q4".to_string(),
                    title: "Chapter 4 Quiz".to_string(),
                    course_id: "sci".to_string(),
                    due_at: NaiveDate::from_ymd_opt(2026, 2, 6).unwrap().and_hms_opt(23, 59, 0),
                    posted_at: None,
                    graded: false,
                    score: None,
                }],
                ..CourseSnapshot::default()
            },
        );
        snapshot.events = vec![
            event("Chapter 4 Quiz", Utc.with_ymd_and_hms(2026, 2, 5, 5, 0, 0).unwrap(), true),
            event("Spelling Test", Utc.with_ymd_and_hms(2026, 2, 2, 5, 0, 0).unwrap(), true),
            event("Band practice", Utc.with_ymd_and_hms(2026, 2, 4, 5, 0, 0).unwrap(), true),
        ];

        let upcoming = upcoming_assessments(&snapshot, est(), today);
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].title, "Chapter 4 Quiz");
        assert_eq!(upcoming[0].date, NaiveDate::from_ymd_opt(2026, 2, 5).unwrap());
        assert_eq!(upcoming[0].weekday, "Thursday");
        assert_eq!(upcoming[0].course_name.as_deref(), Some("Science"));
    }
}
