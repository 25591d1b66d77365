use anyhow::ensure;
use chrono::{Duration, FixedOffset, Offset, Utc};
use clap::{Args, ValueEnum};

/// Upper bound for every day-count window, about a century.
const MAX_WINDOW_DAYS: i64 = 36_500;

/// Which string-similarity function the feedback deduplicator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SimilarityKind {
    /// Normalized edit distance over lowercased, whitespace-collapsed text.
    Levenshtein,
    /// Jaccard overlap of lowercased word sets.
    TokenOverlap,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub grade_warn_threshold: f64,
    pub feedback_retention_days: i64,
    pub issue_retention_days: i64,
    pub persistence_threshold: u32,
    pub recency_window_days: i64,
    pub overdue_max_age_days: i64,
    pub overdue_exclusions: Vec<String>,
    pub joke_similarity_threshold: f64,
    pub encouragement_similarity_threshold: f64,
    pub similarity: SimilarityKind,
    pub max_feedback_attempts: u32,
    pub utc_offset_hours: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grade_warn_threshold: 80.0,
            feedback_retention_days: 30,
            issue_retention_days: 90,
            persistence_threshold: 3,
            recency_window_days: 14,
            overdue_max_age_days: 30,
            overdue_exclusions: vec![
                "class preparation".to_string(),
                "class participation".to_string(),
            ],
            joke_similarity_threshold: 0.8,
            encouragement_similarity_threshold: 0.75,
            similarity: SimilarityKind::Levenshtein,
            max_feedback_attempts: 3,
            utc_offset_hours: -5,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.grade_warn_threshold.is_finite(),
            "grade warn threshold must be a finite number"
        );
        ensure!(
            self.feedback_retention_days > 0 && self.issue_retention_days > 0,
            "retention windows must be at least one day"
        );
        ensure!(
            self.persistence_threshold >= 1,
            "persistence threshold must be at least 1"
        );
        ensure!(
            self.recency_window_days >= 0 && self.overdue_max_age_days > 0,
            "recency window and overdue max age must not be negative"
        );
        for (name, value) in [
            ("feedback retention", self.feedback_retention_days),
            ("issue retention", self.issue_retention_days),
            ("recency window", self.recency_window_days),
            ("overdue max age", self.overdue_max_age_days),
        ] {
            ensure!(
                value <= MAX_WINDOW_DAYS,
                "{name} must be at most {MAX_WINDOW_DAYS} days, got {value}"
            );
        }
        for (name, value) in [
            ("joke", self.joke_similarity_threshold),
            ("encouragement", self.encouragement_similarity_threshold),
        ] {
            ensure!(
                (0.0..=1.0).contains(&value),
                "{name} similarity threshold must be within [0, 1], got {value}"
            );
        }
        ensure!(
            self.max_feedback_attempts >= 1,
            "at least one feedback attempt is required"
        );
        ensure!(
            self.utc_offset_hours.abs() <= 14,
            "utc offset must be within +/-14 hours"
        );
        Ok(())
    }

    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours.clamp(-14, 14) * 3600)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn overdue_max_age(&self) -> Duration {
        Duration::days(self.overdue_max_age_days)
    }
}

/// Engine settings as CLI flags, each also readable from the environment.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Grades strictly below this percentage are flagged low
    #[arg(long, env = "DIGEST_GRADE_WARN_THRESHOLD", default_value_t = 80.0)]
    pub grade_warn_threshold: f64,
    /// Days of feedback history kept for repetition checks
    #[arg(long, env = "DIGEST_FEEDBACK_HISTORY_DAYS", default_value_t = 30)]
    pub feedback_retention_days: i64,
    /// Days an issue entry survives without being observed
    #[arg(long, env = "DIGEST_ISSUE_HISTORY_DAYS", default_value_t = 90)]
    pub issue_retention_days: i64,
    /// Consecutive runs after which an issue counts as persistent
    #[arg(long, env = "DIGEST_PERSISTENCE_THRESHOLD", default_value_t = 3)]
    pub persistence_threshold: u32,
    /// Days a graded item stays in the "recently graded" section
    #[arg(long, env = "DIGEST_RECENCY_DAYS", default_value_t = 14)]
    pub recency_window_days: i64,
    /// Overdue items older than this are ignored
    #[arg(long, env = "DIGEST_OVERDUE_MAX_AGE_DAYS", default_value_t = 30)]
    pub overdue_max_age_days: i64,
    /// Title phrases never reported as overdue (comma separated)
    #[arg(
        long,
        env = "DIGEST_OVERDUE_EXCLUDE",
        value_delimiter = ',',
        default_value = "class preparation,class participation"
    )]
    pub overdue_exclude: Vec<String>,
    #[arg(long, env = "DIGEST_JOKE_SIMILARITY", default_value_t = 0.8)]
    pub joke_similarity_threshold: f64,
    #[arg(long, env = "DIGEST_ENCOURAGEMENT_SIMILARITY", default_value_t = 0.75)]
    pub encouragement_similarity_threshold: f64,
    #[arg(long, env = "DIGEST_SIMILARITY", value_enum, default_value_t = SimilarityKind::Levenshtein)]
    pub similarity: SimilarityKind,
    /// Candidates requested from the generator before giving up on feedback
    #[arg(long, env = "DIGEST_FEEDBACK_ATTEMPTS", default_value_t = 3)]
    pub max_feedback_attempts: u32,
    /// Fixed offset used to localize calendar timestamps
    #[arg(long, env = "DIGEST_UTC_OFFSET_HOURS", default_value_t = -5, allow_hyphen_values = true)]
    pub utc_offset_hours: i32,
}

impl From<EngineArgs> for EngineConfig {
    fn from(args: EngineArgs) -> Self {
        Self {
            grade_warn_threshold: args.grade_warn_threshold,
            feedback_retention_days: args.feedback_retention_days,
            issue_retention_days: args.issue_retention_days,
            persistence_threshold: args.persistence_threshold,
            recency_window_days: args.recency_window_days,
            overdue_max_age_days: args.overdue_max_age_days,
            overdue_exclusions: args
                .overdue_exclude
                .into_iter()
                .map(|phrase| phrase.trim().to_lowercase())
                .filter(|phrase| !phrase.is_empty())
                .collect(),
            joke_similarity_threshold: args.joke_similarity_threshold,
            encouragement_similarity_threshold: args.encouragement_similarity_threshold,
            similarity: args.similarity,
            max_feedback_attempts: args.max_feedback_attempts,
            utc_offset_hours: args.utc_offset_hours,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grade_warn_threshold, 80.0);
        assert_eq!(config.persistence_threshold, 3);
        assert_eq!(config.local_offset().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn rejects_out_of_range_similarity() {
        let config = EngineConfig {
            joke_similarity_threshold: 1.5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_windows_beyond_a_century() {
        let huge = EngineConfig {
            feedback_retention_days: 200_000_000,
            ..EngineConfig::default()
        };
        let err = huge.validate().unwrap_err();
        assert!(err.to_string().contains("feedback retention"));

        for config in [
            EngineConfig {
                issue_retention_days: MAX_WINDOW_DAYS + 1,
                ..EngineConfig::default()
            },
            EngineConfig {
                recency_window_days: MAX_WINDOW_DAYS + 1,
                ..EngineConfig::default()
            },
            EngineConfig {
                overdue_max_age_days: MAX_WINDOW_DAYS + 1,
                ..EngineConfig::default()
            },
        ] {
            assert!(config.validate().is_err());
        }

        let edge = EngineConfig {
            feedback_retention_days: MAX_WINDOW_DAYS,
            ..EngineConfig::default()
        };
        assert!(edge.validate().is_ok());
    }
}
