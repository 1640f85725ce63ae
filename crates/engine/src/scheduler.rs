//! Scheduler / dispatcher.
//!
//! One tick: page through due enrollments, process each under a bounded
//! concurrency limit, then run inactivity rules. Any number of ticks may
//! run at once (overlapping intervals, several processes on one database);
//! the send lease and the compare-and-swap on the step index keep every
//! step to at most one successful send.

use chrono::{DateTime, Utc};
use coachflow_config::{AppConfig, PermanentFailurePolicy};
use coachflow_core::delivery::{DeliveryOutcome, step_unit_key};
use coachflow_core::{
    AutomationEvent, DeliverySubject, Enrollment, EventBus, MessageSender, NewDelivery,
    OutboundMessage, RecordOutcome, Result, Sequence, Step, Store, UpdateOutcome,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::enrollment::{Advance, EnrollmentManager, ExitCheck};
use crate::rules::RuleEngine;

/// Tunables for a tick, resolved from `[scheduler]` and `[delivery]`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub page_size: usize,
    pub max_concurrency: usize,
    pub send_timeout: std::time::Duration,
    pub tick_deadline: std::time::Duration,
    pub send_lease: chrono::Duration,
    pub inactivity_batch_size: usize,
    pub on_permanent_failure: PermanentFailurePolicy,
    pub review_tag: String,
    pub freeze_recheck: chrono::Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            page_size: config.scheduler.page_size.max(1),
            max_concurrency: config.scheduler.max_concurrency.max(1),
            send_timeout: config.scheduler.send_timeout(),
            tick_deadline: config.scheduler.tick_deadline(),
            send_lease: config.scheduler.send_lease(),
            inactivity_batch_size: config.scheduler.inactivity_batch_size,
            on_permanent_failure: config.delivery.on_permanent_failure,
            review_tag: config.delivery.review_tag.clone(),
            freeze_recheck: chrono::Duration::hours(i64::from(
                config.delivery.freeze_recheck_hours,
            )),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// What happened to one due enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step sent and recorded; `completed` if it was the last one.
    Sent { completed: bool },
    /// A success record already existed; advanced without re-sending.
    Deduplicated,
    Exited,
    /// Index past the end of a shortened sequence.
    Completed,
    /// Transient failure; the step stays due.
    Retrying,
    PermanentFailure,
    /// Another worker holds the lease.
    Contended,
    /// Lost a compare-and-swap; the enrollment moved on elsewhere.
    Conflict,
    /// Sequence missing or inactive, or already terminal.
    Skipped,
    /// Tick deadline passed before work started.
    Deferred,
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub sent: usize,
    pub deduplicated: usize,
    pub exited: usize,
    pub completed: usize,
    pub retrying: usize,
    pub permanent_failures: usize,
    pub contended: usize,
    pub conflicts: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub errors: usize,
    pub time_rule_matches: usize,
    pub duration_ms: u64,
    pub deadline_reached: bool,
}

impl TickReport {
    fn tally(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Sent { completed } => {
                self.sent += 1;
                if completed {
                    self.completed += 1;
                }
            }
            StepOutcome::Deduplicated => self.deduplicated += 1,
            StepOutcome::Exited => self.exited += 1,
            StepOutcome::Completed => self.completed += 1,
            StepOutcome::Retrying => self.retrying += 1,
            StepOutcome::PermanentFailure => self.permanent_failures += 1,
            StepOutcome::Contended => self.contended += 1,
            StepOutcome::Conflict => self.conflicts += 1,
            StepOutcome::Skipped => self.skipped += 1,
            StepOutcome::Deferred => {
                self.deferred += 1;
                self.deadline_reached = true;
            }
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    sender: Arc<dyn MessageSender>,
    enrollments: Arc<EnrollmentManager>,
    rules: Arc<RuleEngine>,
    events: Arc<EventBus>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        sender: Arc<dyn MessageSender>,
        enrollments: Arc<EnrollmentManager>,
        rules: Arc<RuleEngine>,
        events: Arc<EventBus>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            sender,
            enrollments,
            rules,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Process everything due at `now`. Each enrollment advances at most
    /// one step per tick.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let started = Instant::now();
        let deadline = started + self.settings.tick_deadline;
        let mut report = TickReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            if Instant::now() >= deadline {
                report.deadline_reached = true;
                break;
            }

            // seen rows may still be due (zero-delay steps, paused sequences),
            // so widen the query to reach past them
            let limit = seen.len() + self.settings.page_size;
            let page = self.store.get_active_enrollments_due_by(now, limit).await?;
            let exhausted = page.len() < limit;
            // one step per enrollment per tick
            let mut unseen: Vec<Enrollment> =
                page.into_iter().filter(|e| !seen.contains(&e.id)).collect();
            let more_unseen = unseen.len() > self.settings.page_size;
            unseen.truncate(self.settings.page_size);
            let fresh = unseen;
            if fresh.is_empty() {
                break;
            }
            seen.extend(fresh.iter().map(|e| e.id.clone()));
            report.due += fresh.len();

            let outcomes: Vec<(String, Result<StepOutcome>)> = stream::iter(fresh)
                .map(|enrollment| async move {
                    let id = enrollment.id.clone();
                    (id, self.process_enrollment(enrollment, now, deadline).await)
                })
                .buffer_unordered(self.settings.max_concurrency)
                .collect()
                .await;

            for (enrollment_id, outcome) in outcomes {
                match outcome {
                    Ok(outcome) => report.tally(outcome),
                    Err(e) => {
                        report.errors += 1;
                        warn!(enrollment_id = %enrollment_id, error = %e, "Enrollment processing failed");
                    }
                }
            }

            if exhausted && !more_unseen {
                break;
            }
        }

        if Instant::now() < deadline {
            match self
                .rules
                .run_time_triggers(now, self.settings.inactivity_batch_size, deadline)
                .await
            {
                Ok(matched) => report.time_rule_matches = matched,
                Err(e) => {
                    report.errors += 1;
                    warn!(error = %e, "Time-triggered rules failed");
                }
            }
        } else {
            report.deadline_reached = true;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.events.publish(AutomationEvent::TickCompleted {
            due: report.due,
            sent: report.sent,
            duration_ms: report.duration_ms,
            timestamp: now,
        });
        info!(
            due = report.due,
            sent = report.sent,
            exited = report.exited,
            completed = report.completed,
            retrying = report.retrying,
            permanent_failures = report.permanent_failures,
            errors = report.errors,
            duration_ms = report.duration_ms,
            "Scheduler tick complete"
        );
        Ok(report)
    }

    async fn process_enrollment(
        &self,
        enrollment: Enrollment,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<StepOutcome> {
        if Instant::now() >= deadline {
            return Ok(StepOutcome::Deferred);
        }

        let Some(sequence) = self.store.get_sequence(&enrollment.sequence_id).await? else {
            warn!(
                enrollment_id = %enrollment.id,
                sequence_id = %enrollment.sequence_id,
                "Sequence not found, skipping"
            );
            return Ok(StepOutcome::Skipped);
        };
        if !sequence.active {
            return Ok(StepOutcome::Skipped);
        }

        let tags = self.store.get_tag_set(&enrollment.user_id).await?;
        match self
            .enrollments
            .exit_if_condition_met(&enrollment, &sequence, &tags, now)
            .await?
        {
            ExitCheck::NotMet => {}
            ExitCheck::Exited(_) => return Ok(StepOutcome::Exited),
            ExitCheck::AlreadyTerminal(_) => return Ok(StepOutcome::Skipped),
            ExitCheck::Conflict => return Ok(StepOutcome::Conflict),
        }

        let Some(step) = sequence.step(enrollment.current_step).cloned() else {
            warn!(
                enrollment_id = %enrollment.id,
                step = enrollment.current_step,
                steps = sequence.len(),
                "Step index past end of sequence; completing"
            );
            return Ok(match self.enrollments.complete_truncated(&enrollment, now).await? {
                Advance::Conflict => StepOutcome::Conflict,
                _ => StepOutcome::Completed,
            });
        };

        let lease_until = now + self.settings.send_lease;
        if !self
            .store
            .try_claim_enrollment(&enrollment.id, enrollment.current_step, now, lease_until)
            .await?
        {
            debug!(enrollment_id = %enrollment.id, "Enrollment claimed elsewhere");
            return Ok(StepOutcome::Contended);
        }

        let subject = DeliverySubject::enrollment(&enrollment.id);
        let unit_key = step_unit_key(enrollment.current_step);

        let existing = match self.store.find_terminal_delivery(&subject, &unit_key).await {
            Ok(existing) => existing,
            Err(e) => {
                // nothing sent yet, safe to hand back
                if let Err(release) = self.store.release_claim(&enrollment.id).await {
                    warn!(enrollment_id = %enrollment.id, error = %release, "Failed to release claim");
                }
                return Err(e.into());
            }
        };

        match existing.map(|r| (r.outcome, r.recorded_at, r.detail)) {
            Some((DeliveryOutcome::Success, sent_at, _)) => {
                info!(
                    enrollment_id = %enrollment.id,
                    step = enrollment.current_step,
                    "Step already delivered; advancing without resend"
                );
                self.advance_delivered(&enrollment, &sequence, sent_at, now)
                    .await
            }
            // frozen steps are retried at recheck time
            Some((DeliveryOutcome::PermanentFailure, _, detail))
                if self.settings.on_permanent_failure == PermanentFailurePolicy::AdvanceAndFlag =>
            {
                let detail = detail.unwrap_or_else(|| "permanent failure".into());
                self.apply_permanent_policy(&enrollment, &sequence, now, &detail)
                    .await
            }
            _ => self.send_step(&enrollment, &sequence, &step, subject, unit_key, now).await,
        }
    }

    /// Advance past a step whose success is already on record.
    async fn advance_delivered(
        &self,
        enrollment: &Enrollment,
        sequence: &Sequence,
        sent_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let outcome = self
            .enrollments
            .advance(enrollment, sequence, sent_at, false)
            .await?;
        if outcome != Advance::Conflict {
            self.events.publish(AutomationEvent::StepDelivered {
                enrollment_id: enrollment.id.clone(),
                step: enrollment.current_step,
                deduplicated: true,
                timestamp: now,
            });
        }
        Ok(match outcome {
            Advance::Conflict => StepOutcome::Conflict,
            _ => StepOutcome::Deduplicated,
        })
    }

    async fn send_step(
        &self,
        enrollment: &Enrollment,
        sequence: &Sequence,
        step: &Step,
        subject: DeliverySubject,
        unit_key: String,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let message = build_message(enrollment, step);

        match crate::send_with_timeout(self.sender.as_ref(), &message, self.settings.send_timeout)
            .await
        {
            Ok(receipt) => {
                let mut record =
                    NewDelivery::new(subject, unit_key, DeliveryOutcome::Success, now);
                if let Some(id) = receipt.provider_message_id {
                    record = record.with_detail(id);
                }
                if let RecordOutcome::AlreadyExists(existing) =
                    self.store.record_delivery(record).await?
                {
                    warn!(
                        enrollment_id = %enrollment.id,
                        step = enrollment.current_step,
                        recorded_at = %existing.recorded_at,
                        "Step success already on record; advancing from it"
                    );
                    return self
                        .advance_delivered(enrollment, sequence, existing.recorded_at, now)
                        .await;
                }
                info!(
                    enrollment_id = %enrollment.id,
                    user_id = %enrollment.user_id,
                    step = enrollment.current_step,
                    template = %step.template_id,
                    channel = %step.channel,
                    "Step sent"
                );
                self.events.publish(AutomationEvent::StepDelivered {
                    enrollment_id: enrollment.id.clone(),
                    step: enrollment.current_step,
                    deduplicated: false,
                    timestamp: now,
                });

                Ok(
                    match self
                        .enrollments
                        .advance(enrollment, sequence, now, false)
                        .await?
                    {
                        Advance::Advanced(_) => StepOutcome::Sent { completed: false },
                        Advance::Completed(_) => StepOutcome::Sent { completed: true },
                        Advance::Conflict => StepOutcome::Conflict,
                    },
                )
            }
            Err(e) if e.is_transient() => {
                // the lease is left to expire and doubles as retry backoff
                let audit = NewDelivery::new(
                    subject,
                    unit_key,
                    DeliveryOutcome::TransientFailure,
                    now,
                )
                .with_detail(e.to_string());
                if let Err(store_err) = self.store.record_delivery(audit).await {
                    warn!(enrollment_id = %enrollment.id, error = %store_err, "Failed to record transient failure");
                }
                warn!(
                    enrollment_id = %enrollment.id,
                    step = enrollment.current_step,
                    error = %e,
                    "Transient send failure; will retry"
                );
                self.events.publish(AutomationEvent::DeliveryFailed {
                    enrollment_id: enrollment.id.clone(),
                    step: enrollment.current_step,
                    permanent: false,
                    reason: e.to_string(),
                    timestamp: now,
                });
                Ok(StepOutcome::Retrying)
            }
            Err(e) => {
                let record = NewDelivery::new(
                    subject,
                    unit_key,
                    DeliveryOutcome::PermanentFailure,
                    now,
                )
                .with_detail(e.to_string());
                if let RecordOutcome::AlreadyExists(existing) =
                    self.store.record_delivery(record).await?
                    && existing.outcome == DeliveryOutcome::Success
                {
                    warn!(
                        enrollment_id = %enrollment.id,
                        step = enrollment.current_step,
                        error = %e,
                        "Send failed but step success already on record; advancing from it"
                    );
                    return self
                        .advance_delivered(enrollment, sequence, existing.recorded_at, now)
                        .await;
                }
                self.events.publish(AutomationEvent::DeliveryFailed {
                    enrollment_id: enrollment.id.clone(),
                    step: enrollment.current_step,
                    permanent: true,
                    reason: e.to_string(),
                    timestamp: now,
                });
                self.apply_permanent_policy(enrollment, sequence, now, &e.to_string())
                    .await
            }
        }
    }

    async fn apply_permanent_policy(
        &self,
        enrollment: &Enrollment,
        sequence: &Sequence,
        now: DateTime<Utc>,
        detail: &str,
    ) -> Result<StepOutcome> {
        warn!(
            enrollment_id = %enrollment.id,
            user_id = %enrollment.user_id,
            step = enrollment.current_step,
            policy = ?self.settings.on_permanent_failure,
            detail = %detail,
            "Permanent send failure"
        );

        let metadata = serde_json::json!({
            "sequence_id": sequence.id,
            "enrollment_id": enrollment.id,
            "step": enrollment.current_step,
            "detail": detail,
        });
        if let Err(e) = self
            .rules
            .tag_user(
                &enrollment.user_id,
                &self.settings.review_tag,
                None,
                Some(metadata),
                now,
            )
            .await
        {
            warn!(user_id = %enrollment.user_id, error = %e, "Failed to write review tag");
        }

        let applied = match self.settings.on_permanent_failure {
            PermanentFailurePolicy::AdvanceAndFlag => {
                self.enrollments
                    .advance(enrollment, sequence, now, true)
                    .await?
                    != Advance::Conflict
            }
            PermanentFailurePolicy::Freeze => matches!(
                self.enrollments
                    .freeze(enrollment, now + self.settings.freeze_recheck)
                    .await?,
                UpdateOutcome::Updated(_)
            ),
        };

        Ok(if applied {
            StepOutcome::PermanentFailure
        } else {
            StepOutcome::Conflict
        })
    }
}

fn build_message(enrollment: &Enrollment, step: &Step) -> OutboundMessage {
    let mut message = OutboundMessage::new(&enrollment.user_id, &step.template_id)
        .with_channel(step.channel)
        .with_variable(
            "sequence_id",
            serde_json::Value::String(enrollment.sequence_id.clone()),
        )
        .with_variable(
            "enrollment_id",
            serde_json::Value::String(enrollment.id.clone()),
        )
        .with_variable("step", serde_json::Value::from(enrollment.current_step));
    message.variables.extend(
        step.variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSender;
    use chrono::Duration;
    use coachflow_core::{EnrollmentStatus, SendError, StepChannel};
    use coachflow_store::InMemoryStore;

    struct Fixture {
        store: Arc<dyn Store>,
        sender: Arc<ScriptedSender>,
        enrollments: Arc<EnrollmentManager>,
        scheduler: Scheduler,
    }

    fn fixture_with(settings: SchedulerSettings) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let sender = Arc::new(ScriptedSender::new());
        let events = Arc::new(EventBus::default());
        let enrollments = Arc::new(EnrollmentManager::new(store.clone(), events.clone(), 3));
        let rules = Arc::new(RuleEngine::new(
            store.clone(),
            sender.clone(),
            enrollments.clone(),
            events.clone(),
            settings.send_timeout,
            settings.send_lease,
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            sender.clone(),
            enrollments.clone(),
            rules,
            events,
            settings,
        );
        Fixture {
            store,
            sender,
            enrollments,
            scheduler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SchedulerSettings::default())
    }

    fn drip() -> Sequence {
        let mut dm = Step::new(1, Duration::hours(24), "coach-checkin");
        dm.channel = StepChannel::DirectMessage;
        Sequence::new(
            "drip",
            vec![
                Step::new(0, Duration::zero(), "welcome"),
                dm,
                Step::new(2, Duration::hours(72), "wrap-up"),
            ],
        )
        .with_exit_tag("purchased")
    }

    async fn enrolled(f: &Fixture, user: &str, now: DateTime<Utc>) -> Enrollment {
        f.store.upsert_sequence(drip()).await.unwrap();
        f.enrollments
            .enroll(user, "drip", now)
            .await
            .unwrap()
            .into_enrollment()
    }

    #[tokio::test]
    async fn sends_first_step_and_schedules_next() {
        let f = fixture();
        let t0 = Utc::now();
        let e = enrolled(&f, "u1", t0).await;

        let report = f.scheduler.run_tick(t0).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.sent, 1);

        let sent = f.sender.sent();
        assert_eq!(sent[0].template_id, "welcome");
        assert_eq!(sent[0].variables["step"], serde_json::json!(0));

        let e = f.store.get_enrollment(&e.id).await.unwrap().unwrap();
        assert_eq!(e.current_step, 1);
        assert_eq!(e.next_due_at, Some(t0 + Duration::hours(24)));
        assert!(e.lease_until.is_none());
    }

    #[tokio::test]
    async fn nothing_due_nothing_sent() {
        let f = fixture();
        let t0 = Utc::now();
        enrolled(&f, "u1", t0).await;
        f.scheduler.run_tick(t0).await.unwrap();

        let report = f.scheduler.run_tick(t0 + Duration::hours(1)).await.unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(f.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn exit_tag_checked_before_send() {
        let f = fixture();
        let t0 = Utc::now();
        let e = enrolled(&f, "u1", t0).await;
        f.store.upsert_tag("u1", "purchased", None, None).await.unwrap();

        let report = f.scheduler.run_tick(t0).await.unwrap();
        assert_eq!(report.exited, 1);
        assert!(f.sender.sent().is_empty());

        let e = f.store.get_enrollment(&e.id).await.unwrap().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Exited);
    }

    #[tokio::test]
    async fn success_record_prevents_resend() {
        let f = fixture();
        let t0 = Utc::now();
        let e = enrolled(&f, "u1", t0).await;
        // a previous tick sent step 0 but died before advancing
        f.store
            .record_delivery(NewDelivery::new(
                DeliverySubject::enrollment(&e.id),
                step_unit_key(0),
                DeliveryOutcome::Success,
                t0,
            ))
            .await
            .unwrap();

        let report = f.scheduler.run_tick(t0 + Duration::minutes(5)).await.unwrap();
        assert_eq!(report.deduplicated, 1);
        assert!(f.sender.sent().is_empty());

        let e = f.store.get_enrollment(&e.id).await.unwrap().unwrap();
        assert_eq!(e.current_step, 1);
        // next step counts from the recorded send
        assert_eq!(e.next_due_at, Some(t0 + Duration::hours(24)));
    }

    #[tokio::test]
    async fn transient_failure_keeps_step() {
        let f = fixture();
        let t0 = Utc::now();
        let e = enrolled(&f, "u1", t0).await;
        f.sender.fail_next(SendError::Transient("503".into()));

        let report = f.scheduler.run_tick(t0).await.unwrap();
        assert_eq!(report.retrying, 1);

        let after = f.store.get_enrollment(&e.id).await.unwrap().unwrap();
        assert_eq!(after.current_step, 0);
        assert_eq!(after.next_due_at, e.next_due_at);
        assert_eq!(after.status, EnrollmentStatus::Active);

        // leased until the lease runs out
        let report = f.scheduler.run_tick(t0 + Duration::seconds(30)).await.unwrap();
        assert_eq!(report.due, 0);

        let report = f.scheduler.run_tick(t0 + Duration::minutes(5)).await.unwrap();
        assert_eq!(report.sent, 1);
        let after = f.store.get_enrollment(&e.id).await.unwrap().unwrap();
        assert_eq!(after.current_step, 1);
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let mut settings = SchedulerSettings::default();
        settings.send_timeout = std::time::Duration::from_millis(20);
        let f = fixture_with(settings);
        f.sender.delay_next(std::time::Duration::from_millis(500));
        let t0 = Utc::now();
        let e = enrolled(&f, "u1", t0).await;

        let report = f.scheduler.run_tick(t0).await.unwrap();
        assert_eq!(report.retrying, 1);
        let records = f
            .store
            .list_deliveries(&DeliverySubject::enrollment(&e.id))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, DeliveryOutcome::TransientFailure);
    }

    #[tokio::test]
    async fn permanent_failure_advances_and_flags() {
        let f = fixture();
        let t0 = Utc::now();
        let e = enrolled(&f, "u1", t0).await;
        f.sender.fail_next(SendError::Permanent("invalid recipient".into()));

        let report = f.scheduler.run_tick(t0).await.unwrap();
        assert_eq!(report.permanent_failures, 1);

        let e = f.store.get_enrollment(&e.id).await.unwrap().unwrap();
        assert_eq!(e.current_step, 1);
        assert!(e.needs_review);
        assert!(f.store.get_tag_set("u1").await.unwrap().contains("needs_review"));
    }

    #[tokio::test]
    async fn permanent_failure_freeze_policy() {
        let mut settings = SchedulerSettings::default();
        settings.on_permanent_failure = PermanentFailurePolicy::Freeze;
        let f = fixture_with(settings);
        let t0 = Utc::now();
        let e = enrolled(&f, "u1", t0).await;
        f.sender.fail_next(SendError::Permanent("template missing".into()));

        f.scheduler.run_tick(t0).await.unwrap();
        let frozen = f.store.get_enrollment(&e.id).await.unwrap().unwrap();
        assert_eq!(frozen.current_step, 0);
        assert!(frozen.needs_review);
        assert_eq!(frozen.next_due_at, Some(t0 + Duration::hours(24)));

        // recheck: the send is tried again and now goes through
        let recheck = t0 + Duration::hours(24);
        let report = f.scheduler.run_tick(recheck).await.unwrap();
        assert_eq!(report.sent, 1);
        let after = f.store.get_enrollment(&e.id).await.unwrap().unwrap();
        assert_eq!(after.current_step, 1);

        // the success is on record and wins over the earlier failure
        let subject = DeliverySubject::enrollment(&e.id);
        let terminal = f
            .store
            .find_terminal_delivery(&subject, &step_unit_key(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(terminal.outcome, DeliveryOutcome::Success);
        assert_eq!(terminal.recorded_at, recheck);
        let outcomes: Vec<DeliveryOutcome> = f
            .store
            .list_deliveries(&subject)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.unit_key == step_unit_key(0))
            .map(|r| r.outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![DeliveryOutcome::PermanentFailure, DeliveryOutcome::Success]
        );
    }

    #[tokio::test]
    async fn frozen_step_sent_on_recheck_is_not_resent_after_crash() {
        let mut settings = SchedulerSettings::default();
        settings.on_permanent_failure = PermanentFailurePolicy::Freeze;
        let f = fixture_with(settings);
        let t0 = Utc::now();
        let e = enrolled(&f, "u1", t0).await;
        f.sender.fail_next(SendError::Permanent("template missing".into()));
        f.scheduler.run_tick(t0).await.unwrap();

        // the recheck send went through but the process died before advancing
        let recheck = t0 + Duration::hours(24);
        let outcome = f
            .store
            .record_delivery(NewDelivery::new(
                DeliverySubject::enrollment(&e.id),
                step_unit_key(0),
                DeliveryOutcome::Success,
                recheck,
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, RecordOutcome::Recorded(_)));

        let report = f.scheduler.run_tick(recheck).await.unwrap();
        assert_eq!(report.deduplicated, 1);
        assert!(f.sender.sent().is_empty());
        let after = f.store.get_enrollment(&e.id).await.unwrap().unwrap();
        assert_eq!(after.current_step, 1);
        assert_eq!(after.next_due_at, Some(recheck + Duration::hours(24)));
    }

    #[tokio::test]
    async fn channel_and_variables_reach_sender() {
        let f = fixture();
        let t0 = Utc::now();
        enrolled(&f, "u1", t0).await;
        f.scheduler.run_tick(t0).await.unwrap();
        f.scheduler.run_tick(t0 + Duration::hours(24)).await.unwrap();

        let sent = f.sender.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].channel, StepChannel::DirectMessage);
        assert_eq!(sent[1].variables["sequence_id"], serde_json::json!("drip"));
    }

    #[tokio::test]
    async fn zero_delay_steps_advance_one_per_tick() {
        let f = fixture();
        f.store
            .upsert_sequence(Sequence::new(
                "burst",
                vec![
                    Step::new(0, Duration::zero(), "a"),
                    Step::new(1, Duration::zero(), "b"),
                ],
            ))
            .await
            .unwrap();
        let t0 = Utc::now();
        f.enrollments.enroll("u1", "burst", t0).await.unwrap();

        let report = f.scheduler.run_tick(t0).await.unwrap();
        assert_eq!(report.sent, 1);
        let report = f.scheduler.run_tick(t0).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn truncated_sequence_completes() {
        let f = fixture();
        let t0 = Utc::now();
        let e = enrolled(&f, "u1", t0).await;
        f.scheduler.run_tick(t0).await.unwrap();

        f.store
            .upsert_sequence(Sequence::new(
                "drip",
                vec![Step::new(0, Duration::zero(), "welcome")],
            ))
            .await
            .unwrap();

        let report = f.scheduler.run_tick(t0 + Duration::hours(24)).await.unwrap();
        assert_eq!(report.completed, 1);
        let e = f.store.get_enrollment(&e.id).await.unwrap().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(f.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn pages_through_all_due() {
        let mut settings = SchedulerSettings::default();
        settings.page_size = 2;
        settings.max_concurrency = 2;
        let f = fixture_with(settings);
        let t0 = Utc::now();
        f.store.upsert_sequence(drip()).await.unwrap();
        for i in 0..5 {
            f.enrollments
                .enroll(&format!("u{i}"), "drip", t0)
                .await
                .unwrap();
        }

        let report = f.scheduler.run_tick(t0).await.unwrap();
        assert_eq!(report.due, 5);
        assert_eq!(report.sent, 5);
    }

    #[tokio::test]
    async fn still_due_seen_enrollments_do_not_hide_fresh_ones() {
        let mut settings = SchedulerSettings::default();
        settings.page_size = 1;
        let f = fixture_with(settings);
        let t0 = Utc::now();

        // stays due all tick and sorts ahead of everything else
        f.store
            .upsert_sequence(Sequence::new(
                "paused",
                vec![Step::new(0, Duration::zero(), "hold")],
            ))
            .await
            .unwrap();
        f.enrollments
            .enroll("u0", "paused", t0 - Duration::hours(1))
            .await
            .unwrap();
        f.store.set_sequence_active("paused", false).await.unwrap();

        f.store
            .upsert_sequence(Sequence::new(
                "burst",
                vec![
                    Step::new(0, Duration::zero(), "a"),
                    Step::new(1, Duration::zero(), "b"),
                ],
            ))
            .await
            .unwrap();
        f.enrollments.enroll("u1", "burst", t0).await.unwrap();
        enrolled(&f, "u2", t0).await;

        let report = f.scheduler.run_tick(t0).await.unwrap();
        assert_eq!(report.due, 3);
        assert_eq!(report.sent, 2);
        let mut templates: Vec<String> =
            f.sender.sent().into_iter().map(|m| m.template_id).collect();
        templates.sort();
        assert_eq!(templates, vec!["a".to_string(), "welcome".to_string()]);
    }

    #[tokio::test]
    async fn inactive_sequence_is_paused() {
        let f = fixture();
        let t0 = Utc::now();
        enrolled(&f, "u1", t0).await;
        f.store.set_sequence_active("drip", false).await.unwrap();

        assert_eq!(f.scheduler.run_tick(t0).await.unwrap().sent, 0);

        f.store.set_sequence_active("drip", true).await.unwrap();
        assert_eq!(f.scheduler.run_tick(t0).await.unwrap().sent, 1);
    }
}
