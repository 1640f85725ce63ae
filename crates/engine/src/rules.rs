//! Workflow rule engine.
//!
//! Event-driven rules run when an event with a matching trigger arrives;
//! inactivity rules run from the scheduler tick. Each action is idempotent
//! on its own and a rule is not a transaction: a failed action is logged
//! and the remaining actions still run.

use chrono::{DateTime, Duration, Utc};
use coachflow_core::delivery::DeliveryOutcome;
use coachflow_core::{
    AutomationEvent, DeliverySubject, Error, Event, EventBus, MessageSender, NewDelivery,
    OutboundMessage, Result, RuleAction, RuleTrigger, Store, Tag, WorkflowRule,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::conditions;
use crate::enrollment::EnrollmentManager;

/// What one `fire_event` call did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FireReport {
    /// Rules whose conditions held, in execution order
    pub rules_matched: Vec<String>,
    pub actions_executed: usize,
    pub actions_failed: usize,
}

impl FireReport {
    fn absorb(&mut self, rule_id: &str, (executed, failed): (usize, usize)) {
        self.rules_matched.push(rule_id.to_string());
        self.actions_executed += executed;
        self.actions_failed += failed;
    }
}

pub struct RuleEngine {
    store: Arc<dyn Store>,
    sender: Arc<dyn MessageSender>,
    enrollments: Arc<EnrollmentManager>,
    events: Arc<EventBus>,
    send_timeout: std::time::Duration,
    /// How long a rule send holds its delivery claim
    send_lease: Duration,
}

impl RuleEngine {
    pub fn new(
        store: Arc<dyn Store>,
        sender: Arc<dyn MessageSender>,
        enrollments: Arc<EnrollmentManager>,
        events: Arc<EventBus>,
        send_timeout: std::time::Duration,
        send_lease: Duration,
    ) -> Self {
        Self {
            store,
            sender,
            enrollments,
            events,
            send_timeout,
            send_lease,
        }
    }

    /// Run every active rule triggered by `event`, in rule-id order.
    pub async fn fire_event(&self, event: &Event) -> Result<FireReport> {
        if let Err(e) = self
            .store
            .record_activity(&event.user_id, event.occurred_at)
            .await
        {
            warn!(user_id = %event.user_id, error = %e, "Failed to record activity");
        }

        let rules = self.store.find_rules_by_trigger(&event.trigger).await?;
        debug!(
            user_id = %event.user_id,
            trigger = %event.trigger,
            candidates = rules.len(),
            "Evaluating rules"
        );

        let now = Utc::now();
        let mut report = FireReport::default();
        for rule in &rules {
            if let Some(counts) = self.evaluate_rule(rule, event, now).await {
                report.absorb(&rule.id, counts);
            }
        }
        Ok(report)
    }

    /// Fire inactivity rules for users idle past each rule's window.
    ///
    /// Each firing carries the user's last-activity timestamp as its dedupe
    /// key, so a user gets one nudge per inactivity stretch. Candidates are
    /// paged by `(last_active_at, user_id)` in batches of `batch_size` until
    /// exhausted or `deadline` passes.
    pub async fn run_time_triggers(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        deadline: Instant,
    ) -> Result<usize> {
        let rules = self.store.find_scheduled_rules().await?;
        let batch_size = batch_size.max(1);
        let mut matched = 0;

        'rules: for rule in &rules {
            let RuleTrigger::Inactivity { hours } = rule.trigger else {
                continue;
            };
            let cutoff = now - Duration::hours(i64::from(hours));
            let mut cursor: Option<(DateTime<Utc>, String)> = None;

            loop {
                if Instant::now() >= deadline {
                    debug!(rule_id = %rule.id, "Inactivity scan stopped at deadline");
                    break 'rules;
                }

                let after = cursor.as_ref().map(|(at, user)| (*at, user.as_str()));
                let idle = match self.store.find_inactive_users(cutoff, after, batch_size).await {
                    Ok(users) => users,
                    Err(e) => {
                        warn!(rule_id = %rule.id, error = %e, "Inactivity lookup failed");
                        continue 'rules;
                    }
                };
                let exhausted = idle.len() < batch_size;
                if let Some((user_id, at)) = idle.last() {
                    cursor = Some((*at, user_id.clone()));
                }

                for (user_id, last_active_at) in idle {
                    let event = Event::new(
                        user_id,
                        rule.trigger.to_string(),
                        serde_json::json!({
                            "inactive_hours": hours,
                            "last_active_at": last_active_at,
                        }),
                        now,
                    )
                    .with_dedupe_key(last_active_at.to_rfc3339());

                    if self.evaluate_rule(rule, &event, now).await.is_some() {
                        matched += 1;
                    }
                }

                if exhausted {
                    break;
                }
            }
        }
        Ok(matched)
    }

    /// Write a tag, then auto-enroll into sequences triggered by it.
    pub async fn tag_user(
        &self,
        user_id: &str,
        key: &str,
        value: Option<&str>,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Tag> {
        let tag = self.store.upsert_tag(user_id, key, value, metadata).await?;
        debug!(user_id = %user_id, tag = %key, "Tag written");
        self.enrollments.enroll_for_trigger_tag(user_id, key, now).await;
        Ok(tag)
    }

    pub async fn remove_tag(&self, user_id: &str, key: &str) -> Result<bool> {
        let removed = self.store.remove_tag(user_id, key).await?;
        if removed {
            debug!(user_id = %user_id, tag = %key, "Tag removed");
        }
        Ok(removed)
    }

    /// Returns `(executed, failed)` action counts if the conditions held.
    async fn evaluate_rule(
        &self,
        rule: &WorkflowRule,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Option<(usize, usize)> {
        // one snapshot per rule so earlier rules' tag writes are visible
        let tags = match self.store.get_tag_set(&event.user_id).await {
            Ok(tags) => tags,
            Err(e) => {
                warn!(rule_id = %rule.id, user_id = %event.user_id, error = %e, "Tag fetch failed");
                return None;
            }
        };

        if !conditions::evaluate(&rule.conditions, &tags, Some(event)) {
            debug!(rule_id = %rule.id, user_id = %event.user_id, "Conditions not met");
            return None;
        }

        info!(
            rule_id = %rule.id,
            user_id = %event.user_id,
            trigger = %event.trigger,
            "Rule matched"
        );
        self.events.publish(AutomationEvent::RuleMatched {
            rule_id: rule.id.clone(),
            user_id: event.user_id.clone(),
            trigger: event.trigger.clone(),
            timestamp: now,
        });

        let mut executed = 0;
        let mut failed = 0;
        for (idx, action) in rule.actions.iter().enumerate() {
            match self.execute_action(rule, idx, action, event, now).await {
                Ok(()) => executed += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        rule_id = %rule.id,
                        user_id = %event.user_id,
                        action = action.kind(),
                        index = idx,
                        error = %e,
                        "Rule action failed"
                    );
                }
            }
        }
        Some((executed, failed))
    }

    async fn execute_action(
        &self,
        rule: &WorkflowRule,
        idx: usize,
        action: &RuleAction,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let user_id = event.user_id.as_str();
        match action {
            RuleAction::AddTag { key, value } => {
                let metadata = serde_json::json!({ "rule_id": rule.id, "trigger": event.trigger });
                self.tag_user(user_id, key, value.as_deref(), Some(metadata), now)
                    .await
                    .map(|_| ())
            }
            RuleAction::RemoveTag { key } => self.remove_tag(user_id, key).await.map(|_| ()),
            RuleAction::EnrollInSequence { sequence_id } => self
                .enrollments
                .enroll(user_id, sequence_id, now)
                .await
                .map(|_| ()),
            RuleAction::SendMessage {
                template_id,
                variables,
            } => {
                self.send_rule_message(rule, idx, template_id, variables, event, now)
                    .await
            }
            RuleAction::Unknown => Err(Error::configuration(
                format!("rule:{}", rule.id),
                format!("action {idx} has an unknown kind"),
            )),
        }
    }

    async fn send_rule_message(
        &self,
        rule: &WorkflowRule,
        idx: usize,
        template_id: &str,
        variables: &serde_json::Map<String, serde_json::Value>,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let subject = DeliverySubject::rule(&rule.id, &event.user_id);
        let unit_key = format!(
            "action-{idx}:{}",
            event.dedupe_key.as_deref().unwrap_or("once")
        );

        if self.already_delivered(rule, event, &subject, &unit_key).await? {
            return Ok(());
        }
        if !self
            .store
            .try_claim_delivery(&subject, &unit_key, now, now + self.send_lease)
            .await?
        {
            debug!(
                rule_id = %rule.id,
                user_id = %event.user_id,
                unit = %unit_key,
                "Rule message in flight elsewhere"
            );
            return Ok(());
        }

        // a racing holder may have finished between the check and the claim
        let result = match self.already_delivered(rule, event, &subject, &unit_key).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.deliver_rule_message(
                    rule, template_id, variables, event, &subject, &unit_key, now,
                )
                .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.store.release_delivery_claim(&subject, &unit_key).await {
            warn!(
                rule_id = %rule.id,
                user_id = %event.user_id,
                unit = %unit_key,
                error = %e,
                "Failed to release delivery claim"
            );
        }
        result
    }

    async fn already_delivered(
        &self,
        rule: &WorkflowRule,
        event: &Event,
        subject: &DeliverySubject,
        unit_key: &str,
    ) -> Result<bool> {
        let Some(existing) = self.store.find_terminal_delivery(subject, unit_key).await? else {
            return Ok(false);
        };
        debug!(
            rule_id = %rule.id,
            user_id = %event.user_id,
            unit = %unit_key,
            outcome = existing.outcome.as_str(),
            "Rule message already delivered"
        );
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_rule_message(
        &self,
        rule: &WorkflowRule,
        template_id: &str,
        variables: &serde_json::Map<String, serde_json::Value>,
        event: &Event,
        subject: &DeliverySubject,
        unit_key: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut message = OutboundMessage::new(&event.user_id, template_id)
            .with_variable("rule_id", serde_json::Value::String(rule.id.clone()))
            .with_variable("trigger", serde_json::Value::String(event.trigger.clone()));
        message
            .variables
            .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));

        match crate::send_with_timeout(self.sender.as_ref(), &message, self.send_timeout).await {
            Ok(receipt) => {
                let mut record =
                    NewDelivery::new(subject.clone(), unit_key, DeliveryOutcome::Success, now);
                if let Some(id) = receipt.provider_message_id {
                    record = record.with_detail(id);
                }
                self.store.record_delivery(record).await?;
                info!(rule_id = %rule.id, user_id = %event.user_id, template = %template_id, "Rule message sent");
                Ok(())
            }
            Err(e) => {
                let outcome = if e.is_transient() {
                    DeliveryOutcome::TransientFailure
                } else {
                    DeliveryOutcome::PermanentFailure
                };
                self.store
                    .record_delivery(
                        NewDelivery::new(subject.clone(), unit_key, outcome, now)
                            .with_detail(e.to_string()),
                    )
                    .await?;
                Err(e.into())
            }
        }
    }
}
