//! Sequence enrollment manager.
//!
//! Owns every enrollment state transition. All writes go through the
//! store's compare-and-swap on `(status = ACTIVE, current_step)`, so two
//! workers racing on the same enrollment cannot both win.

use chrono::{DateTime, Utc};
use coachflow_core::{
    AutomationEvent, CreateOutcome, Enrollment, EnrollmentStatus, EnrollmentUpdate, Error,
    EventBus, NewEnrollment, Result, Sequence, Store, TagSet, UpdateOutcome,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of an exit-condition check.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitCheck {
    /// The sequence has no exit tag, or the user doesn't carry it.
    NotMet,
    /// This call moved the enrollment to EXITED.
    Exited(Enrollment),
    /// Someone else already made it terminal.
    AlreadyTerminal(Enrollment),
    /// Lost the compare-and-swap on every attempt.
    Conflict,
}

impl ExitCheck {
    /// Whether the caller must stop processing this enrollment.
    pub fn stops_processing(&self) -> bool {
        !matches!(self, ExitCheck::NotMet)
    }
}

/// Result of advancing past a delivered step.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// More steps remain; `next_due_at` moved forward.
    Advanced(Enrollment),
    /// That was the last step.
    Completed(Enrollment),
    /// The enrollment changed underneath us (exited or advanced elsewhere).
    Conflict,
}

/// Creates enrollments and moves them through their lifecycle.
pub struct EnrollmentManager {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    conflict_retries: u32,
}

impl EnrollmentManager {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, conflict_retries: u32) -> Self {
        Self {
            store,
            events,
            conflict_retries,
        }
    }

    /// Enroll a user at step 0. Returns the existing enrollment if the user
    /// is already ACTIVE in the sequence; the step index is never reset.
    pub async fn enroll(
        &self,
        user_id: &str,
        sequence_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        let sequence = self
            .store
            .get_sequence(sequence_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sequence '{sequence_id}'")))?;

        if !sequence.active {
            return Err(Error::SequenceInactive(sequence_id.to_string()));
        }
        sequence
            .validate()
            .map_err(|reason| Error::configuration(format!("sequence:{sequence_id}"), reason))?;

        let first_delay = sequence
            .step(0)
            .map(|s| s.delay())
            .unwrap_or_else(chrono::Duration::zero);

        let outcome = self
            .store
            .create_enrollment(NewEnrollment {
                user_id: user_id.to_string(),
                sequence_id: sequence_id.to_string(),
                first_due_at: now + first_delay,
                enrolled_at: now,
            })
            .await?;

        match &outcome {
            CreateOutcome::Created(e) => {
                info!(
                    enrollment_id = %e.id,
                    user_id = %user_id,
                    sequence_id = %sequence_id,
                    "User enrolled"
                );
                self.events.publish(AutomationEvent::Enrolled {
                    enrollment_id: e.id.clone(),
                    user_id: user_id.to_string(),
                    sequence_id: sequence_id.to_string(),
                    timestamp: now,
                });
            }
            CreateOutcome::AlreadyExists(e) => {
                debug!(
                    enrollment_id = %e.id,
                    user_id = %user_id,
                    sequence_id = %sequence_id,
                    "Already enrolled, no-op"
                );
            }
        }
        Ok(outcome)
    }

    /// Enroll the user in every active sequence whose trigger tag is `tag_key`.
    ///
    /// Failures are per sequence: one broken sequence does not block the rest.
    pub async fn enroll_for_trigger_tag(
        &self,
        user_id: &str,
        tag_key: &str,
        now: DateTime<Utc>,
    ) -> Vec<Enrollment> {
        let sequences = match self.store.find_sequences_by_trigger_tag(tag_key).await {
            Ok(s) => s,
            Err(e) => {
                warn!(user_id = %user_id, tag = %tag_key, error = %e, "Trigger-tag lookup failed");
                return vec![];
            }
        };

        let mut enrolled = Vec::new();
        for sequence in sequences {
            match self.enroll(user_id, &sequence.id, now).await {
                Ok(outcome) => enrolled.push(outcome.into_enrollment()),
                Err(e) => warn!(
                    user_id = %user_id,
                    sequence_id = %sequence.id,
                    error = %e,
                    "Trigger-tag enrollment failed"
                ),
            }
        }
        enrolled
    }

    /// If the sequence's exit tag is in `tags`, move the enrollment to EXITED.
    ///
    /// Must run before any due step is processed.
    pub async fn exit_if_condition_met(
        &self,
        enrollment: &Enrollment,
        sequence: &Sequence,
        tags: &TagSet,
        now: DateTime<Utc>,
    ) -> Result<ExitCheck> {
        let Some(exit_tag) = sequence.exit_tag.as_deref() else {
            return Ok(ExitCheck::NotMet);
        };
        if !tags.contains(exit_tag) {
            return Ok(ExitCheck::NotMet);
        }
        self.exit_with_retries(enrollment.clone(), &format!("exit_tag:{exit_tag}"), now)
            .await
    }

    /// Move past a step that was delivered (or counts as delivered).
    ///
    /// The next step is due `delay` after `sent_at`, not after enrollment, so
    /// engine downtime delays the rest of the sequence instead of bursting it.
    pub async fn advance(
        &self,
        enrollment: &Enrollment,
        sequence: &Sequence,
        sent_at: DateTime<Utc>,
        flag_review: bool,
    ) -> Result<Advance> {
        let mut update = EnrollmentUpdate::from_current(enrollment);
        update.current_step = enrollment.current_step + 1;
        update.steps_delivered = enrollment.steps_delivered + 1;
        update.needs_review = enrollment.needs_review || flag_review;

        match sequence.step(update.current_step) {
            Some(next) if !sequence.is_last(enrollment.current_step) => {
                update.next_due_at = Some(sent_at + next.delay());
            }
            _ => {
                update.status = EnrollmentStatus::Completed;
                update.next_due_at = None;
                update.completed_at = Some(sent_at);
            }
        }

        self.write_progress(enrollment, update, sent_at).await
    }

    /// Complete an enrollment whose index points past the end of its
    /// sequence (the sequence was shortened under it). Nothing is sent.
    pub async fn complete_truncated(
        &self,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<Advance> {
        let mut update = EnrollmentUpdate::from_current(enrollment);
        update.status = EnrollmentStatus::Completed;
        update.next_due_at = None;
        update.completed_at = Some(now);
        self.write_progress(enrollment, update, now).await
    }

    /// Keep the enrollment on its step, flag it, and look again at `recheck_at`.
    pub async fn freeze(
        &self,
        enrollment: &Enrollment,
        recheck_at: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let mut update = EnrollmentUpdate::from_current(enrollment);
        update.needs_review = true;
        update.next_due_at = Some(recheck_at);

        let outcome = self
            .store
            .update_enrollment(&enrollment.id, enrollment.current_step, update)
            .await?;
        if matches!(outcome, UpdateOutcome::Updated(_)) {
            warn!(
                enrollment_id = %enrollment.id,
                step = enrollment.current_step,
                recheck_at = %recheck_at,
                "Enrollment frozen for review"
            );
        }
        Ok(outcome)
    }

    /// Operator exit: ACTIVE → EXITED with `reason`. Terminal enrollments
    /// are returned unchanged.
    pub async fn exit(
        &self,
        enrollment_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        let enrollment = self
            .store
            .get_enrollment(enrollment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("enrollment '{enrollment_id}'")))?;

        match self.exit_with_retries(enrollment, reason, now).await? {
            ExitCheck::Exited(e) | ExitCheck::AlreadyTerminal(e) => Ok(e),
            ExitCheck::Conflict | ExitCheck::NotMet => Err(Error::Internal(format!(
                "enrollment '{enrollment_id}' kept changing; exit not applied"
            ))),
        }
    }

    /// Exit the user's ACTIVE enrollment in a sequence, if there is one.
    pub async fn unenroll(
        &self,
        user_id: &str,
        sequence_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Enrollment>> {
        match self.store.find_active_enrollment(user_id, sequence_id).await? {
            Some(active) => self.exit(&active.id, reason, now).await.map(Some),
            None => Ok(None),
        }
    }

    async fn exit_with_retries(
        &self,
        enrollment: Enrollment,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ExitCheck> {
        let mut current = enrollment;

        for attempt in 0..=self.conflict_retries {
            if !current.is_active() {
                return Ok(ExitCheck::AlreadyTerminal(current));
            }

            let mut update = EnrollmentUpdate::from_current(&current);
            update.status = EnrollmentStatus::Exited;
            update.next_due_at = None;
            update.exited_at = Some(now);
            update.exit_reason = Some(reason.to_string());

            match self
                .store
                .update_enrollment(&current.id, current.current_step, update)
                .await?
            {
                UpdateOutcome::Updated(exited) => {
                    info!(
                        enrollment_id = %exited.id,
                        user_id = %exited.user_id,
                        reason = %reason,
                        "Enrollment exited"
                    );
                    self.events.publish(AutomationEvent::EnrollmentExited {
                        enrollment_id: exited.id.clone(),
                        reason: reason.to_string(),
                        timestamp: now,
                    });
                    return Ok(ExitCheck::Exited(exited));
                }
                UpdateOutcome::Conflict => {
                    debug!(enrollment_id = %current.id, attempt, "Exit conflict, re-fetching");
                    current = self
                        .store
                        .get_enrollment(&current.id)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("enrollment '{}'", current.id)))?;
                }
            }
        }

        warn!(
            enrollment_id = %current.id,
            retries = self.conflict_retries,
            "Exit conflict retries exhausted; deferring to next tick"
        );
        Ok(ExitCheck::Conflict)
    }

    async fn write_progress(
        &self,
        enrollment: &Enrollment,
        update: EnrollmentUpdate,
        now: DateTime<Utc>,
    ) -> Result<Advance> {
        match self
            .store
            .update_enrollment(&enrollment.id, enrollment.current_step, update)
            .await?
        {
            UpdateOutcome::Updated(updated) if updated.status == EnrollmentStatus::Completed => {
                info!(
                    enrollment_id = %updated.id,
                    user_id = %updated.user_id,
                    steps_delivered = updated.steps_delivered,
                    "Enrollment completed"
                );
                self.events.publish(AutomationEvent::EnrollmentCompleted {
                    enrollment_id: updated.id.clone(),
                    timestamp: now,
                });
                Ok(Advance::Completed(updated))
            }
            UpdateOutcome::Updated(updated) => {
                debug!(
                    enrollment_id = %updated.id,
                    step = updated.current_step,
                    next_due_at = ?updated.next_due_at,
                    "Enrollment advanced"
                );
                Ok(Advance::Advanced(updated))
            }
            UpdateOutcome::Conflict => {
                debug!(
                    enrollment_id = %enrollment.id,
                    step = enrollment.current_step,
                    "Advance lost compare-and-swap"
                );
                Ok(Advance::Conflict)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use coachflow_core::Step;
    use coachflow_store::InMemoryStore;

    fn three_step() -> Sequence {
        Sequence::new(
            "onboarding",
            vec![
                Step::new(0, Duration::zero(), "welcome"),
                Step::new(1, Duration::hours(24), "day-two"),
                Step::new(2, Duration::hours(72), "day-five"),
            ],
        )
        .with_exit_tag("purchased")
    }

    async fn manager() -> (EnrollmentManager, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store.upsert_sequence(three_step()).await.unwrap();
        let manager = EnrollmentManager::new(store.clone(), Arc::new(EventBus::default()), 3);
        (manager, store)
    }

    #[tokio::test]
    async fn enroll_is_idempotent() {
        let (manager, store) = manager().await;
        let now = Utc::now();

        let first = manager.enroll("u1", "onboarding", now).await.unwrap();
        assert!(first.was_created());
        let e = first.into_enrollment();
        assert_eq!(e.current_step, 0);
        assert_eq!(e.next_due_at, Some(now));

        let second = manager
            .enroll("u1", "onboarding", now + Duration::hours(1))
            .await
            .unwrap();
        assert!(!second.was_created());
        assert_eq!(second.enrollment().id, e.id);
        assert_eq!(store.count_enrollments().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enroll_rejects_missing_and_inactive() {
        let (manager, store) = manager().await;
        let now = Utc::now();

        assert!(matches!(
            manager.enroll("u1", "nope", now).await,
            Err(Error::NotFound(_))
        ));

        store.set_sequence_active("onboarding", false).await.unwrap();
        assert!(matches!(
            manager.enroll("u1", "onboarding", now).await,
            Err(Error::SequenceInactive(_))
        ));
    }

    #[tokio::test]
    async fn enroll_rejects_malformed_sequence() {
        let (manager, store) = manager().await;
        store
            .upsert_sequence(Sequence::new(
                "gappy",
                vec![Step::new(1, Duration::zero(), "oops")],
            ))
            .await
            .unwrap();
        assert!(matches!(
            manager.enroll("u1", "gappy", Utc::now()).await,
            Err(Error::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn advance_uses_send_time() {
        let (manager, _) = manager().await;
        let t0 = Utc::now();
        let sequence = three_step();
        let e = manager
            .enroll("u1", "onboarding", t0)
            .await
            .unwrap()
            .into_enrollment();

        let sent = t0 + Duration::hours(1);
        let Advance::Advanced(e) = manager.advance(&e, &sequence, sent, false).await.unwrap() else {
            panic!("expected advance");
        };
        assert_eq!(e.current_step, 1);
        assert_eq!(e.steps_delivered, 1);
        assert_eq!(e.next_due_at, Some(sent + Duration::hours(24)));

        let sent2 = sent + Duration::hours(30);
        let Advance::Advanced(e) = manager.advance(&e, &sequence, sent2, false).await.unwrap() else {
            panic!("expected advance");
        };
        assert_eq!(e.next_due_at, Some(sent2 + Duration::hours(72)));

        let Advance::Completed(e) = manager
            .advance(&e, &sequence, sent2 + Duration::hours(72), true)
            .await
            .unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert!(e.next_due_at.is_none());
        assert!(e.needs_review);
        assert_eq!(e.steps_delivered, 3);
    }

    #[tokio::test]
    async fn stale_advance_conflicts() {
        let (manager, _) = manager().await;
        let now = Utc::now();
        let sequence = three_step();
        let e = manager
            .enroll("u1", "onboarding", now)
            .await
            .unwrap()
            .into_enrollment();

        assert!(matches!(
            manager.advance(&e, &sequence, now, false).await.unwrap(),
            Advance::Advanced(_)
        ));
        // same snapshot again: step index moved on
        assert_eq!(
            manager.advance(&e, &sequence, now, false).await.unwrap(),
            Advance::Conflict
        );
    }

    #[tokio::test]
    async fn exit_tag_exits_enrollment() {
        let (manager, store) = manager().await;
        let now = Utc::now();
        let sequence = three_step();
        let e = manager
            .enroll("u1", "onboarding", now)
            .await
            .unwrap()
            .into_enrollment();

        let no_tags = TagSet::new();
        assert_eq!(
            manager
                .exit_if_condition_met(&e, &sequence, &no_tags, now)
                .await
                .unwrap(),
            ExitCheck::NotMet
        );

        let tags = TagSet::new().with("purchased", None);
        let check = manager
            .exit_if_condition_met(&e, &sequence, &tags, now)
            .await
            .unwrap();
        assert!(check.stops_processing());
        let ExitCheck::Exited(exited) = check else {
            panic!("expected exit");
        };
        assert_eq!(exited.status, EnrollmentStatus::Exited);
        assert_eq!(exited.exit_reason.as_deref(), Some("exit_tag:purchased"));
        assert!(exited.next_due_at.is_none());

        // stale snapshot: already terminal
        assert!(matches!(
            manager
                .exit_if_condition_met(&e, &sequence, &tags, now)
                .await
                .unwrap(),
            ExitCheck::AlreadyTerminal(_)
        ));
        assert!(store
            .find_active_enrollment("u1", "onboarding")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn exit_retries_after_concurrent_advance() {
        let (manager, _) = manager().await;
        let now = Utc::now();
        let sequence = three_step();
        let stale = manager
            .enroll("u1", "onboarding", now)
            .await
            .unwrap()
            .into_enrollment();
        manager.advance(&stale, &sequence, now, false).await.unwrap();

        let tags = TagSet::new().with("purchased", None);
        let ExitCheck::Exited(e) = manager
            .exit_if_condition_met(&stale, &sequence, &tags, now)
            .await
            .unwrap()
        else {
            panic!("expected exit after re-fetch");
        };
        assert_eq!(e.current_step, 1);
        assert_eq!(e.status, EnrollmentStatus::Exited);
    }

    #[tokio::test]
    async fn freeze_keeps_step_and_postpones() {
        let (manager, _) = manager().await;
        let now = Utc::now();
        let e = manager
            .enroll("u1", "onboarding", now)
            .await
            .unwrap()
            .into_enrollment();

        let recheck = now + Duration::hours(24);
        let UpdateOutcome::Updated(frozen) = manager.freeze(&e, recheck).await.unwrap() else {
            panic!("expected update");
        };
        assert_eq!(frozen.current_step, 0);
        assert!(frozen.needs_review);
        assert_eq!(frozen.next_due_at, Some(recheck));
    }

    #[tokio::test]
    async fn unenroll_and_reenroll() {
        let (manager, store) = manager().await;
        let now = Utc::now();
        manager.enroll("u1", "onboarding", now).await.unwrap();

        let exited = manager
            .unenroll("u1", "onboarding", "admin", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exited.exit_reason.as_deref(), Some("admin"));
        assert!(manager
            .unenroll("u1", "onboarding", "admin", now)
            .await
            .unwrap()
            .is_none());

        let again = manager.enroll("u1", "onboarding", now).await.unwrap();
        assert!(again.was_created());
        assert_eq!(store.list_enrollments_for_user("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn trigger_tag_enrolls_matching_sequences() {
        let (manager, store) = manager().await;
        store
            .upsert_sequence(
                Sequence::new("fm-drip", vec![Step::new(0, Duration::hours(1), "hello")])
                    .with_trigger_tag("course:fm"),
            )
            .await
            .unwrap();

        let now = Utc::now();
        let enrolled = manager.enroll_for_trigger_tag("u1", "course:fm", now).await;
        assert_eq!(enrolled.len(), 1);
        assert_eq!(enrolled[0].sequence_id, "fm-drip");
        assert_eq!(enrolled[0].next_due_at, Some(now + Duration::hours(1)));
        assert!(manager
            .enroll_for_trigger_tag("u1", "other", now)
            .await
            .is_empty());
    }
}
