//! Store trait: the durable state the engine reads and mutates.
//!
//! Every mutation the engine relies on for correctness is a single atomic
//! operation on the store: enrollment creation is unique per active
//! `(user, sequence)`, updates are compare-and-swap on the step index,
//! terminal delivery records are unique per `(subject, unit, outcome)`,
//! and in-flight sends hold a lease.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::delivery::{DeliveryRecord, DeliverySubject, NewDelivery};
use crate::enrollment::{Enrollment, EnrollmentUpdate, NewEnrollment};
use crate::error::StoreError;
use crate::rule::WorkflowRule;
use crate::sequence::Sequence;
use crate::tag::{Tag, TagSet};

/// Result of `create_enrollment`.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Enrollment),
    /// An ACTIVE enrollment for the pair already exists; it is returned as-is.
    AlreadyExists(Enrollment),
}

impl CreateOutcome {
    pub fn enrollment(&self) -> &Enrollment {
        match self {
            CreateOutcome::Created(e) | CreateOutcome::AlreadyExists(e) => e,
        }
    }

    pub fn into_enrollment(self) -> Enrollment {
        match self {
            CreateOutcome::Created(e) | CreateOutcome::AlreadyExists(e) => e,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Result of a compare-and-swap `update_enrollment`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(Enrollment),
    /// The enrollment is no longer ACTIVE at the expected step.
    Conflict,
}

/// Result of `record_delivery`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded(DeliveryRecord),
    /// The unit already has a success, or already has a permanent failure
    /// and this was another one. Carries the existing record.
    AlreadyExists(DeliveryRecord),
}

impl RecordOutcome {
    pub fn record(&self) -> &DeliveryRecord {
        match self {
            RecordOutcome::Recorded(r) | RecordOutcome::AlreadyExists(r) => r,
        }
    }
}

/// The core Store trait.
///
/// Implementations: SQLite, in-memory (for testing and ephemeral runs).
#[async_trait]
pub trait Store: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    // ── Enrollments ─────────────────────────────────────────────────

    /// ACTIVE enrollments with `next_due_at <= now` and no live send lease,
    /// oldest due first, at most `limit`.
    async fn get_active_enrollments_due_by(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Enrollment>, StoreError>;

    async fn get_enrollment(&self, id: &str) -> Result<Option<Enrollment>, StoreError>;

    async fn find_active_enrollment(
        &self,
        user_id: &str,
        sequence_id: &str,
    ) -> Result<Option<Enrollment>, StoreError>;

    async fn list_enrollments_for_user(&self, user_id: &str)
    -> Result<Vec<Enrollment>, StoreError>;

    /// Create an ACTIVE enrollment at step 0 unless one already exists.
    async fn create_enrollment(&self, new: NewEnrollment) -> Result<CreateOutcome, StoreError>;

    /// Take the send lease: succeeds only if the enrollment is ACTIVE, at
    /// `expected_step`, and no other lease is live at `now`.
    async fn try_claim_enrollment(
        &self,
        id: &str,
        expected_step: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drop the send lease without changing anything else.
    async fn release_claim(&self, id: &str) -> Result<(), StoreError>;

    /// Compare-and-swap: applies `update` only if the enrollment is ACTIVE
    /// and still at `expected_step`. Clears any lease.
    async fn update_enrollment(
        &self,
        id: &str,
        expected_step: u32,
        update: EnrollmentUpdate,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn count_enrollments(&self) -> Result<usize, StoreError>;

    // ── Tags ────────────────────────────────────────────────────────

    async fn get_tag_set(&self, user_id: &str) -> Result<TagSet, StoreError>;

    /// Insert or update `(user, key)`. Never creates a duplicate key.
    async fn upsert_tag(
        &self,
        user_id: &str,
        key: &str,
        value: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Tag, StoreError>;

    /// Deliberate reset of a tag. Returns `true` if it existed.
    async fn remove_tag(&self, user_id: &str, key: &str) -> Result<bool, StoreError>;

    // ── Delivery records ────────────────────────────────────────────

    /// Append a delivery record. A success supersedes an earlier permanent
    /// failure for the same unit; a terminal record after a success is
    /// refused with the success.
    async fn record_delivery(&self, new: NewDelivery) -> Result<RecordOutcome, StoreError>;

    /// The success record for a unit, else its permanent-failure record.
    async fn find_terminal_delivery(
        &self,
        subject: &DeliverySubject,
        unit_key: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError>;

    /// Take the in-flight lease on one delivery unit. Fails while another
    /// lease on the unit is live at `now`.
    async fn try_claim_delivery(
        &self,
        subject: &DeliverySubject,
        unit_key: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn release_delivery_claim(
        &self,
        subject: &DeliverySubject,
        unit_key: &str,
    ) -> Result<(), StoreError>;

    async fn list_deliveries(
        &self,
        subject: &DeliverySubject,
    ) -> Result<Vec<DeliveryRecord>, StoreError>;

    // ── Rules ───────────────────────────────────────────────────────

    /// Active rules whose event trigger equals `trigger`, ordered by id.
    async fn find_rules_by_trigger(&self, trigger: &str) -> Result<Vec<WorkflowRule>, StoreError>;

    /// Active time-triggered rules, ordered by id.
    async fn find_scheduled_rules(&self) -> Result<Vec<WorkflowRule>, StoreError>;

    async fn upsert_rule(&self, rule: WorkflowRule) -> Result<(), StoreError>;

    async fn set_rule_active(&self, rule_id: &str, active: bool) -> Result<bool, StoreError>;

    async fn list_rules(&self) -> Result<Vec<WorkflowRule>, StoreError>;

    // ── Sequences ───────────────────────────────────────────────────

    async fn upsert_sequence(&self, sequence: Sequence) -> Result<(), StoreError>;

    async fn get_sequence(&self, id: &str) -> Result<Option<Sequence>, StoreError>;

    async fn list_sequences(&self) -> Result<Vec<Sequence>, StoreError>;

    /// Active sequences auto-enrolling on `tag_key`.
    async fn find_sequences_by_trigger_tag(
        &self,
        tag_key: &str,
    ) -> Result<Vec<Sequence>, StoreError>;

    async fn set_sequence_active(&self, id: &str, active: bool) -> Result<bool, StoreError>;

    // ── Activity (inactivity candidate filter) ──────────────────────

    /// Record that the user did something at `at` (keeps the latest).
    async fn record_activity(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Users whose last activity is older than `cutoff`, with that timestamp,
    /// ordered by `(last_active_at, user_id)` and strictly after `after`.
    async fn find_inactive_users(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, &str)>,
        limit: usize,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError>;
}
