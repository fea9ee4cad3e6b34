use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::KernelError;

const MAX_SUBJECT_LEN: usize = 256;
const MAX_KIND_LEN: usize = 64;

/// Immutable, append-only record of something that happened to a subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentFact {
    /// Entity the fact is about, e.g. `repo/src-d/go-git`.
    pub subject_id: String,
    /// Fact family, e.g. `release` or `deployment`.
    pub kind: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub payload: Value,
}

impl PersistentFact {
    #[must_use]
    pub fn new(
        subject_id: impl Into<String>,
        kind: impl Into<String>,
        timestamp: OffsetDateTime,
        payload: Value,
    ) -> Self {
        Self { subject_id: subject_id.into(), kind: kind.into(), timestamp, payload }
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] for empty or oversized subject/kind fields.
    pub fn validate(&self) -> Result<(), KernelError> {
        check_field("subject_id", &self.subject_id, MAX_SUBJECT_LEN)?;
        check_field("kind", &self.kind, MAX_KIND_LEN)?;
        Ok(())
    }

    /// Same identity triple as `other`.
    #[must_use]
    pub fn same_key(&self, other: &Self) -> bool {
        self.subject_id == other.subject_id
            && self.kind == other.kind
            && self.timestamp == other.timestamp
    }
}

fn check_field(name: &str, value: &str, max_len: usize) -> Result<(), KernelError> {
    if value.trim().is_empty() {
        return Err(KernelError::Validation(format!("{name} must not be empty")));
    }
    if value.len() > max_len {
        return Err(KernelError::Validation(format!("{name} exceeds {max_len} bytes")));
    }
    if value.chars().any(char::is_control) {
        return Err(KernelError::Validation(format!("{name} contains control characters")));
    }
    Ok(())
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TimeRange {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl TimeRange {
    /// # Errors
    /// Returns [`KernelError::Validation`] when `end` precedes `start`.
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, KernelError> {
        if end < start {
            return Err(KernelError::Validation(format!(
                "time range end {end} precedes start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        self.start <= instant && instant < self.end
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::Duration;

    use super::*;

    #[test]
    fn fact_validation_rejects_blank_subject_and_kind() {
        let now = OffsetDateTime::UNIX_EPOCH;
        assert!(PersistentFact::new("repo/1", "release", now, json!({})).validate().is_ok());
        assert!(PersistentFact::new(" ", "release", now, json!({})).validate().is_err());
        assert!(PersistentFact::new("repo/1", "", now, json!({})).validate().is_err());
        assert!(PersistentFact::new("repo/1", "rel\nease", now, json!({})).validate().is_err());
    }

    #[test]
    fn time_range_is_half_open() -> Result<(), KernelError> {
        let start = OffsetDateTime::UNIX_EPOCH;
        let range = TimeRange::new(start, start + Duration::hours(1))?;
        assert!(range.contains(start));
        assert!(!range.contains(start + Duration::hours(1)));
        assert!(TimeRange::new(start + Duration::hours(1), start).is_err());
        Ok(())
    }
}
