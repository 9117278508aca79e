use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// Static description of a saga type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SagaMetadata {
    /// Saga type name, stored with every saga and carried by its id.
    pub saga_class: &'static str,
    /// Identifier type name, part of the storage key.
    pub identifier_class: &'static str,
    /// Event property that carries the saga id.
    pub containing_identifier_property: &'static str,
    /// Default lifetime, e.g. `"+1 hour"` or `"+2 days"`.
    pub expire_date_modifier: &'static str,
}

impl SagaMetadata {
    /// Parsed [`expire_date_modifier`](Self::expire_date_modifier).
    pub fn expire_after(&self) -> Result<Duration, SagaError> {
        parse_expire_modifier(self.expire_date_modifier)
    }
}

/// Saga lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl SagaStatus {
    /// Every status except `InProgress` is terminal.
    pub fn is_closed(self) -> bool {
        self != SagaStatus::InProgress
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SagaStatus::InProgress => "in_progress",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(SagaStatus::InProgress),
            "completed" => Ok(SagaStatus::Completed),
            "failed" => Ok(SagaStatus::Failed),
            "expired" => Ok(SagaStatus::Expired),
            other => Err(SagaError::UnknownStatus(other.to_string())),
        }
    }
}

/// Parse `+<n> <second|minute|hour|day|week>[s]`.
pub fn parse_expire_modifier(modifier: &str) -> Result<Duration, SagaError> {
    let invalid = || SagaError::InvalidExpireModifier(modifier.to_string());

    let rest = modifier.trim().strip_prefix('+').ok_or_else(invalid)?;
    let mut parts = rest.split_whitespace();
    let amount: i64 = parts
        .next()
        .and_then(|n| n.parse().ok())
        .filter(|n| *n > 0)
        .ok_or_else(invalid)?;
    let unit = parts.next().ok_or_else(invalid)?;
    if parts.next().is_some() {
        return Err(invalid());
    }

    let unit = unit.to_ascii_lowercase();
    let unit = unit.strip_suffix('s').unwrap_or(&unit);
    let duration = match unit {
        "second" => Duration::try_seconds(amount),
        "minute" => Duration::try_minutes(amount),
        "hour" => Duration::try_hours(amount),
        "day" => Duration::try_days(amount),
        "week" => Duration::try_weeks(amount),
        _ => None,
    };

    duration.ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expire_modifier() {
        assert_eq!(parse_expire_modifier("+1 hour").unwrap(), Duration::hours(1));
        assert_eq!(parse_expire_modifier("+30 minutes").unwrap(), Duration::minutes(30));
        assert_eq!(parse_expire_modifier(" +2 Days ").unwrap(), Duration::days(2));
        assert_eq!(parse_expire_modifier("+1 week").unwrap(), Duration::weeks(1));
        assert_eq!(parse_expire_modifier("+45 seconds").unwrap(), Duration::seconds(45));
    }

    #[test]
    fn test_reject_malformed_modifiers() {
        for modifier in ["1 hour", "+0 hours", "+-1 hour", "+1", "+1 fortnight", "+1 hour later", ""] {
            assert!(
                matches!(parse_expire_modifier(modifier), Err(SagaError::InvalidExpireModifier(_))),
                "{modifier} should be rejected"
            );
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SagaStatus::InProgress,
            SagaStatus::Completed,
            SagaStatus::Failed,
            SagaStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<SagaStatus>().unwrap(), status);
        }
        assert!(matches!(
            "archived".parse::<SagaStatus>(),
            Err(SagaError::UnknownStatus(status)) if status == "archived"
        ));
        assert!(!SagaStatus::InProgress.is_closed());
        assert!(SagaStatus::Expired.is_closed());
    }
}
