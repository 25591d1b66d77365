use std::collections::HashSet;

use chrono::{Duration, NaiveDate};
use uuid::Uuid;

use crate::calendar::weekday_name;
use crate::config::{EngineConfig, SimilarityKind};
use crate::models::{
    ContextFingerprint, CourseGrade, FeedbackComponents, FeedbackEntry, UpcomingAssessment,
};

/// String similarity in `[0, 1]`, 1 meaning identical.
pub trait Similarity: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// `1 - edit_distance / longer_length` over normalized text.
pub struct NormalizedLevenshtein;

impl Similarity for NormalizedLevenshtein {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a: Vec<char> = normalize(a).chars().collect();
        let b: Vec<char> = normalize(b).chars().collect();
        let max_len = a.len().max(b.len());
        if max_len == 0 {
            return 1.0;
        }
        1.0 - levenshtein(&a, &b) as f64 / max_len as f64
    }
}

/// Jaccard overlap of word sets.
pub struct TokenOverlap;

impl Similarity for TokenOverlap {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a = tokens(a);
        let b = tokens(b);
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        let shared = a.intersection(&b).count();
        let total = a.union(&b).count();
        shared as f64 / total as f64
    }
}

pub fn similarity_for(kind: SimilarityKind) -> Box<dyn Similarity> {
    match kind {
        SimilarityKind::Levenshtein => Box::new(NormalizedLevenshtein),
        SimilarityKind::TokenOverlap => Box::new(TokenOverlap),
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Split generated feedback into its encouragement and joke parts. Blank
/// lines separate paragraphs; the last paragraph is the joke. A single
/// paragraph ends in a joke line only when that line is a question or
/// short.
pub fn split_components(text: &str) -> FeedbackComponents {
    // `lines` strips `\r`, so CRLF text splits the same way
    let mut paragraphs: Vec<Vec<&str>> = vec![Vec::new()];
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if paragraphs.last().map_or(false, |p| !p.is_empty()) {
                paragraphs.push(Vec::new());
            }
        } else if let Some(current) = paragraphs.last_mut() {
            current.push(line);
        }
    }
    paragraphs.retain(|p| !p.is_empty());
    if let [first, .., last] = paragraphs.as_slice() {
        return FeedbackComponents {
            encouragement: first.join("\n"),
            joke: last.join("\n"),
        };
    }

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    match lines.split_last() {
        Some((last, rest)) if !rest.is_empty() && (last.ends_with('?') || last.chars().count() < 80) => {
            FeedbackComponents {
                encouragement: rest.join(" "),
                joke: last.to_string(),
            }
        }
        _ => FeedbackComponents {
            encouragement: lines.join(" "),
            joke: String::new(),
        },
    }
}

/// Fingerprint of the situation feedback was written for.
pub fn fingerprint(
    overdue_count: usize,
    upcoming: &[UpcomingAssessment],
    course_grades: &[CourseGrade],
) -> ContextFingerprint {
    ContextFingerprint {
        overdue_count,
        upcoming_tests: upcoming.iter().take(3).map(|u| u.title.clone()).collect(),
        low_grades: course_grades
            .iter()
            .filter(|grade| grade.low)
            .take(3)
            .map(|grade| grade.course_name.clone())
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackCandidate {
    pub text: String,
    pub components: FeedbackComponents,
    pub context: ContextFingerprint,
}

impl FeedbackCandidate {
    pub fn new(text: &str, context: ContextFingerprint) -> Self {
        let text = text.trim().to_string();
        let components = split_components(&text);
        Self {
            text,
            components,
            context,
        }
    }

    pub fn into_entry(self, date: NaiveDate) -> FeedbackEntry {
        FeedbackEntry {
            id: Uuid::new_v4(),
            date,
            weekday: weekday_name(date),
            text: self.text,
            components: self.components,
            context: self.context,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    ExactRepeat { date: NaiveDate },
    SimilarJoke { date: NaiveDate, score: f64 },
    SimilarEncouragement { date: NaiveDate, score: f64 },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::ExactRepeat { date } => write!(f, "identical to feedback sent on {date}"),
            Rejection::SimilarJoke { date, score } => {
                write!(f, "joke too close to the one sent on {date} ({score:.2})")
            }
            Rejection::SimilarEncouragement { date, score } => write!(
                f,
                "same situation and encouragement as {date} ({score:.2})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
}

pub struct FeedbackDeduplicator<'a> {
    history: Vec<&'a FeedbackEntry>,
    similarity: Box<dyn Similarity>,
    joke_threshold: f64,
    encouragement_threshold: f64,
}

impl<'a> FeedbackDeduplicator<'a> {
    /// Only entries inside the feedback retention window are consulted.
    pub fn new(history: &'a [FeedbackEntry], config: &EngineConfig, today: NaiveDate) -> Self {
        let cutoff = today - Duration::days(config.feedback_retention_days);
        Self {
            history: history.iter().filter(|entry| entry.date >= cutoff).collect(),
            similarity: similarity_for(config.similarity),
            joke_threshold: config.joke_similarity_threshold,
            encouragement_threshold: config.encouragement_similarity_threshold,
        }
    }

    #[cfg(test)]
    pub fn with_similarity(mut self, similarity: Box<dyn Similarity>) -> Self {
        self.similarity = similarity;
        self
    }

    /// Three escalating checks. Verbatim repeats are always rejected; the
    /// joke and context+encouragement checks are skipped when
    /// `allow_repetition` is set for a persistent issue.
    pub fn check(&self, candidate: &FeedbackCandidate, allow_repetition: bool) -> Verdict {
        if let Some(entry) = self.history.iter().find(|entry| entry.text == candidate.text) {
            return Verdict::Rejected(Rejection::ExactRepeat { date: entry.date });
        }
        if allow_repetition {
            return Verdict::Accepted;
        }

        let joke = candidate.components.joke.as_str();
        if !joke.is_empty() {
            for entry in &self.history {
                if entry.components.joke.is_empty() {
                    continue;
                }
                let score = self.similarity.similarity(joke, &entry.components.joke);
                if score >= self.joke_threshold {
                    return Verdict::Rejected(Rejection::SimilarJoke {
                        date: entry.date,
                        score,
                    });
                }
            }
        }

        let encouragement = candidate.components.encouragement.as_str();
        if !encouragement.is_empty() {
            for entry in &self.history {
                if entry.context != candidate.context || entry.components.encouragement.is_empty() {
                    continue;
                }
                let score = self
                    .similarity
                    .similarity(encouragement, &entry.components.encouragement);
                if score >= self.encouragement_threshold {
                    return Verdict::Rejected(Rejection::SimilarEncouragement {
                        date: entry.date,
                        score,
                    });
                }
            }
        }

        Verdict::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENT: &str = "Great job today! Keep pushing on that science project.\n\n\
                        Why did the math book look sad? It had too many problems.";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 10).unwrap()
    }

    fn history() -> Vec<FeedbackEntry> {
        vec![FeedbackCandidate::new(SENT, ContextFingerprint::default())
            .into_entry(today() - Duration::days(1))]
    }

    #[test]
    fn exact_repeat_is_rejected_even_with_override() {
        let history = history();
        let dedup = FeedbackDeduplicator::new(&history, &EngineConfig::default(), today());
        let candidate = FeedbackCandidate::new(SENT, ContextFingerprint::default());

        assert!(matches!(
            dedup.check(&candidate, true),
            Verdict::Rejected(Rejection::ExactRepeat { .. })
        ));
        assert_ne!(dedup.check(&candidate, false), Verdict::Accepted);
    }

    #[test]
    fn near_identical_joke_needs_override() {
        let history = history();
        let dedup = FeedbackDeduplicator::new(&history, &EngineConfig::default(), today());
        let candidate = FeedbackCandidate::new(
            "Nice focus in Spanish this week, keep reviewing vocab.\n\n\
             Why did the math book look so sad? It had too many problems.",
            ContextFingerprint {
                overdue_count: 2,
                ..ContextFingerprint::default()
            },
        );

        assert!(matches!(
            dedup.check(&candidate, false),
            Verdict::Rejected(Rejection::SimilarJoke { .. })
        ));
        assert_eq!(dedup.check(&candidate, true), Verdict::Accepted);
    }

    #[test]
    fn same_context_and_encouragement_is_rejected() {
        let history = history();
        let dedup = FeedbackDeduplicator::new(&history, &EngineConfig::default(), today());
        let candidate = FeedbackCandidate::new(
            "Great job today! Keep pushing on the science project.\n\n\
             What do you call a sleeping dinosaur? A dino-snore.",
            ContextFingerprint::default(),
        );
        assert!(matches!(
            dedup.check(&candidate, false),
            Verdict::Rejected(Rejection::SimilarEncouragement { .. })
        ));

        let other_context = FeedbackCandidate {
            context: ContextFingerprint {
                overdue_count: 4,
                ..ContextFingerprint::default()
            },
            ..candidate
        };
        assert_eq!(dedup.check(&other_context, false), Verdict::Accepted);
    }

    #[test]
    fn entries_outside_retention_are_ignored() {
        let old = vec![FeedbackCandidate::new(SENT, ContextFingerprint::default())
            .into_entry(today() - Duration::days(45))];
        let dedup = FeedbackDeduplicator::new(&old, &EngineConfig::default(), today());
        let candidate = FeedbackCandidate::new(SENT, ContextFingerprint::default());
        assert_eq!(dedup.check(&candidate, false), Verdict::Accepted);
    }

    #[test]
    fn similarity_is_pluggable() {
        struct Never;
        impl Similarity for Never {
            fn similarity(&self, _: &str, _: &str) -> f64 {
                0.0
            }
        }
        let history = history();
        let dedup = FeedbackDeduplicator::new(&history, &EngineConfig::default(), today())
            .with_similarity(Box::new(Never));
        let candidate = FeedbackCandidate::new(
            "Great job today! Keep pushing on that science project.\n\n\
             Why did the math book look sad? It had so many problems.",
            ContextFingerprint::default(),
        );
        assert_eq!(dedup.check(&candidate, false), Verdict::Accepted);
    }

    #[test]
    fn splits_components() {
        let parts = split_components(SENT);
        assert_eq!(parts.encouragement, "Great job today! Keep pushing on that science project.");
        assert!(parts.joke.starts_with("Why did the math book"));

        let lines = split_components("You crushed the quiz.\nWhat do owls study? Hoo-manities.");
        assert_eq!(lines.encouragement, "You crushed the quiz.");
        assert_eq!(lines.joke, "What do owls study? Hoo-manities.");

        let single = split_components("Just one long line of encouragement.");
        assert!(single.joke.is_empty());
    }

    #[test]
    fn splits_crlf_paragraphs() {
        let long_joke = "Why did the student bring a ladder to class? Because they heard \
                         the grades were going up, and they wanted to be there to see it.";
        assert!(long_joke.chars().count() > 80);
        let text = format!("Nice work on the lab.\r\nKeep it up.\r\n \r\n{long_joke}\r\n");

        let parts = split_components(&text);
        assert_eq!(parts.encouragement, "Nice work on the lab.\nKeep it up.");
        assert_eq!(parts.joke, long_joke);
    }

    #[test]
    fn similarity_measures() {
        assert_eq!(NormalizedLevenshtein.similarity("Hello  World", "hello world"), 1.0);
        assert!(NormalizedLevenshtein.similarity("kitten", "sitting") < 0.6);
        assert!((TokenOverlap.similarity("a b c", "b c d") - 0.5).abs() < 1e-9);
    }
}
