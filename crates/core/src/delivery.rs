//! Delivery records: audit log and deduplication guard for sends.
//!
//! Per `(subject, unit_key)` there is at most one success and at most one
//! permanent failure. A success may follow a permanent failure (a frozen
//! step that later went through) but nothing terminal follows a success.
//! Transient failures are appended for audit only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a delivery belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliverySubject {
    /// A sequence step send.
    Enrollment { enrollment_id: String },
    /// A rule `send_message` action for one user.
    Rule { rule_id: String, user_id: String },
}

impl DeliverySubject {
    pub fn enrollment(id: impl Into<String>) -> Self {
        DeliverySubject::Enrollment {
            enrollment_id: id.into(),
        }
    }

    pub fn rule(rule_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        DeliverySubject::Rule {
            rule_id: rule_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Stable string key used for storage and uniqueness.
    pub fn key(&self) -> String {
        match self {
            DeliverySubject::Enrollment { enrollment_id } => format!("enrollment:{enrollment_id}"),
            DeliverySubject::Rule { rule_id, user_id } => format!("rule:{rule_id}:{user_id}"),
        }
    }

    /// Inverse of [`DeliverySubject::key`].
    pub fn parse_key(key: &str) -> Option<Self> {
        if let Some(id) = key.strip_prefix("enrollment:") {
            return Some(Self::enrollment(id));
        }
        let rest = key.strip_prefix("rule:")?;
        // user ids may contain ':', rule ids may not
        let (rule_id, user_id) = rest.split_once(':')?;
        Some(Self::rule(rule_id, user_id))
    }
}

impl std::fmt::Display for DeliverySubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    PermanentFailure,
    TransientFailure,
}

impl DeliveryOutcome {
    /// Terminal outcomes are unique per unit and stop retries.
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryOutcome::TransientFailure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::PermanentFailure => "permanent_failure",
            DeliveryOutcome::TransientFailure => "transient_failure",
        }
    }
}

impl std::str::FromStr for DeliveryOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(DeliveryOutcome::Success),
            "permanent_failure" => Ok(DeliveryOutcome::PermanentFailure),
            "transient_failure" => Ok(DeliveryOutcome::TransientFailure),
            other => Err(format!("unknown delivery outcome: {other}")),
        }
    }
}

/// A stored delivery record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub subject: DeliverySubject,
    /// Step index or rule action key
    pub unit_key: String,
    pub outcome: DeliveryOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Input for writing a delivery record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDelivery {
    pub subject: DeliverySubject,
    pub unit_key: String,
    pub outcome: DeliveryOutcome,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl NewDelivery {
    pub fn new(
        subject: DeliverySubject,
        unit_key: impl Into<String>,
        outcome: DeliveryOutcome,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject,
            unit_key: unit_key.into(),
            outcome,
            detail: None,
            recorded_at,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Unit key for a sequence step.
pub fn step_unit_key(step: u32) -> String {
    format!("step-{step}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_key_round_trip() {
        let e = DeliverySubject::enrollment("abc");
        assert_eq!(e.key(), "enrollment:abc");
        assert_eq!(DeliverySubject::parse_key(&e.key()), Some(e));

        let r = DeliverySubject::rule("welcome", "user:42");
        assert_eq!(r.key(), "rule:welcome:user:42");
        assert_eq!(DeliverySubject::parse_key(&r.key()), Some(r));

        assert!(DeliverySubject::parse_key("other:1").is_none());
    }

    #[test]
    fn terminal_outcomes() {
        assert!(DeliveryOutcome::Success.is_terminal());
        assert!(DeliveryOutcome::PermanentFailure.is_terminal());
        assert!(!DeliveryOutcome::TransientFailure.is_terminal());
        assert_eq!(
            "permanent_failure".parse::<DeliveryOutcome>().unwrap(),
            DeliveryOutcome::PermanentFailure
        );
    }
}
