//! Enrollments: a user's run through one sequence.
//!
//! Invariants:
//! - at most one ACTIVE enrollment per `(user, sequence)`
//! - `current_step` never decreases
//! - `next_due_at` is `None` iff the status is terminal

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Exited,
}

impl EnrollmentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EnrollmentStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Exited => "exited",
        }
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EnrollmentStatus::Active),
            "completed" => Ok(EnrollmentStatus::Completed),
            "exited" => Ok(EnrollmentStatus::Exited),
            other => Err(format!("unknown enrollment status: {other}")),
        }
    }
}

/// A stored enrollment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,

    pub user_id: String,

    pub sequence_id: String,

    pub status: EnrollmentStatus,

    /// Zero-based index of the next step to deliver
    pub current_step: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_due_at: Option<DateTime<Utc>>,

    /// Steps delivered (or treated as delivered) so far
    pub steps_delivered: u32,

    pub enrolled_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,

    /// Set when a step failed permanently and an operator should look
    #[serde(default)]
    pub needs_review: bool,

    /// Send lease held by a scheduler worker while a send is in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }

    /// Whether the enrollment is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.next_due_at.is_some_and(|due| due <= now)
    }

    /// Whether another worker currently holds the send lease.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_until.is_some_and(|until| until > now)
    }

    /// Apply an update in place (used by store implementations).
    pub fn apply(&mut self, update: &EnrollmentUpdate) {
        self.status = update.status;
        self.current_step = update.current_step;
        self.next_due_at = update.next_due_at;
        self.steps_delivered = update.steps_delivered;
        self.completed_at = update.completed_at;
        self.exited_at = update.exited_at;
        self.exit_reason = update.exit_reason.clone();
        self.needs_review = update.needs_review;
        self.lease_until = None;
    }
}

/// Input for creating an enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEnrollment {
    pub user_id: String,
    pub sequence_id: String,
    pub first_due_at: DateTime<Utc>,
    pub enrolled_at: DateTime<Utc>,
}

/// The complete new state written by a compare-and-swap update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentUpdate {
    pub status: EnrollmentStatus,
    pub current_step: u32,
    pub next_due_at: Option<DateTime<Utc>>,
    pub steps_delivered: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub needs_review: bool,
}

impl EnrollmentUpdate {
    /// Start from the enrollment's current state.
    pub fn from_current(enrollment: &Enrollment) -> Self {
        Self {
            status: enrollment.status,
            current_step: enrollment.current_step,
            next_due_at: enrollment.next_due_at,
            steps_delivered: enrollment.steps_delivered,
            completed_at: enrollment.completed_at,
            exited_at: enrollment.exited_at,
            exit_reason: enrollment.exit_reason.clone(),
            needs_review: enrollment.needs_review,
        }
    }

    /// Check the terminal/next-due invariant before writing.
    pub fn is_consistent(&self) -> bool {
        self.status.is_terminal() == self.next_due_at.is_none()
    }
}
