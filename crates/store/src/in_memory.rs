//! In-memory store, useful for testing and ephemeral runs.
//!
//! All state sits behind one `RwLock`, so every trait operation is atomic
//! with respect to every other one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coachflow_core::delivery::{DeliveryOutcome, DeliveryRecord, DeliverySubject, NewDelivery};
use coachflow_core::enrollment::{Enrollment, EnrollmentStatus, EnrollmentUpdate, NewEnrollment};
use coachflow_core::error::StoreError;
use coachflow_core::rule::WorkflowRule;
use coachflow_core::sequence::Sequence;
use coachflow_core::store::{CreateOutcome, RecordOutcome, Store, UpdateOutcome};
use coachflow_core::tag::{Tag, TagSet};
use coachflow_core::RuleTrigger;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::check_update;

#[derive(Default)]
struct State {
    enrollments: HashMap<String, Enrollment>,
    /// user_id → key → tag
    tags: HashMap<String, BTreeMap<String, Tag>>,
    deliveries: Vec<DeliveryRecord>,
    /// (subject key, unit_key) → lease expiry
    delivery_claims: HashMap<(String, String), DateTime<Utc>>,
    rules: BTreeMap<String, WorkflowRule>,
    sequences: BTreeMap<String, Sequence>,
    activity: HashMap<String, DateTime<Utc>>,
}

impl State {
    fn sequence_is_active(&self, id: &str) -> bool {
        self.sequences.get(id).is_some_and(|s| s.active)
    }

    fn active_enrollment(&self, user_id: &str, sequence_id: &str) -> Option<&Enrollment> {
        self.enrollments
            .values()
            .find(|e| e.is_active() && e.user_id == user_id && e.sequence_id == sequence_id)
    }

    fn terminal_delivery(&self, subject: &DeliverySubject, unit_key: &str) -> Option<&DeliveryRecord> {
        let mut permanent = None;
        for d in &self.deliveries {
            if &d.subject != subject || d.unit_key != unit_key {
                continue;
            }
            match d.outcome {
                DeliveryOutcome::Success => return Some(d),
                DeliveryOutcome::PermanentFailure => permanent = permanent.or(Some(d)),
                DeliveryOutcome::TransientFailure => {}
            }
        }
        permanent
    }
}

/// A store holding everything in process memory.
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get_active_enrollments_due_by(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let state = self.state.read().await;
        let mut due: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.is_due(now) && !e.is_leased(now))
            .filter(|e| state.sequence_is_active(&e.sequence_id))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_due_at.cmp(&b.next_due_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn get_enrollment(&self, id: &str) -> Result<Option<Enrollment>, StoreError> {
        Ok(self.state.read().await.enrollments.get(id).cloned())
    }

    async fn find_active_enrollment(
        &self,
        user_id: &str,
        sequence_id: &str,
    ) -> Result<Option<Enrollment>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .active_enrollment(user_id, sequence_id)
            .cloned())
    }

    async fn list_enrollments_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let state = self.state.read().await;
        let mut list: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.enrolled_at.cmp(&b.enrolled_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn create_enrollment(&self, new: NewEnrollment) -> Result<CreateOutcome, StoreError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.active_enrollment(&new.user_id, &new.sequence_id) {
            return Ok(CreateOutcome::AlreadyExists(existing.clone()));
        }

        let enrollment = Enrollment {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            sequence_id: new.sequence_id,
            status: EnrollmentStatus::Active,
            current_step: 0,
            next_due_at: Some(new.first_due_at),
            steps_delivered: 0,
            enrolled_at: new.enrolled_at,
            completed_at: None,
            exited_at: None,
            exit_reason: None,
            needs_review: false,
            lease_until: None,
        };
        state
            .enrollments
            .insert(enrollment.id.clone(), enrollment.clone());
        Ok(CreateOutcome::Created(enrollment))
    }

    async fn try_claim_enrollment(
        &self,
        id: &str,
        expected_step: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.enrollments.get_mut(id) {
            Some(e) if e.is_active() && e.current_step == expected_step && !e.is_leased(now) => {
                e.lease_until = Some(lease_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(&self, id: &str) -> Result<(), StoreError> {
        if let Some(e) = self.state.write().await.enrollments.get_mut(id) {
            e.lease_until = None;
        }
        Ok(())
    }

    async fn update_enrollment(
        &self,
        id: &str,
        expected_step: u32,
        update: EnrollmentUpdate,
    ) -> Result<UpdateOutcome, StoreError> {
        check_update(expected_step, &update)?;
        let mut state = self.state.write().await;
        match state.enrollments.get_mut(id) {
            Some(e) if e.is_active() && e.current_step == expected_step => {
                e.apply(&update);
                Ok(UpdateOutcome::Updated(e.clone()))
            }
            _ => Ok(UpdateOutcome::Conflict),
        }
    }

    async fn count_enrollments(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.enrollments.len())
    }

    async fn get_tag_set(&self, user_id: &str) -> Result<TagSet, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .tags
            .get(user_id)
            .map(|tags| TagSet::from_tags(tags.values()))
            .unwrap_or_default())
    }

    async fn upsert_tag(
        &self,
        user_id: &str,
        key: &str,
        value: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Tag, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let tags = state.tags.entry(user_id.to_string()).or_default();
        let tag = tags.entry(key.to_string()).or_insert_with(|| Tag {
            user_id: user_id.to_string(),
            key: key.to_string(),
            value: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        });
        tag.value = value.map(String::from);
        if metadata.is_some() {
            tag.metadata = metadata;
        }
        tag.updated_at = now;
        Ok(tag.clone())
    }

    async fn remove_tag(&self, user_id: &str, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        Ok(state
            .tags
            .get_mut(user_id)
            .is_some_and(|tags| tags.remove(key).is_some()))
    }

    async fn record_delivery(&self, new: NewDelivery) -> Result<RecordOutcome, StoreError> {
        let mut state = self.state.write().await;
        if new.outcome.is_terminal() {
            if let Some(existing) = state.terminal_delivery(&new.subject, &new.unit_key) {
                let supersedes = existing.outcome == DeliveryOutcome::PermanentFailure
                    && new.outcome == DeliveryOutcome::Success;
                if !supersedes {
                    return Ok(RecordOutcome::AlreadyExists(existing.clone()));
                }
            }
        }
        let record = DeliveryRecord {
            id: Uuid::new_v4().to_string(),
            subject: new.subject,
            unit_key: new.unit_key,
            outcome: new.outcome,
            detail: new.detail,
            recorded_at: new.recorded_at,
        };
        state.deliveries.push(record.clone());
        Ok(RecordOutcome::Recorded(record))
    }

    async fn find_terminal_delivery(
        &self,
        subject: &DeliverySubject,
        unit_key: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .terminal_delivery(subject, unit_key)
            .cloned())
    }

    async fn try_claim_delivery(
        &self,
        subject: &DeliverySubject,
        unit_key: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let lease = state
            .delivery_claims
            .entry((subject.key(), unit_key.to_string()))
            .or_insert(now);
        if *lease > now {
            return Ok(false);
        }
        *lease = lease_until;
        Ok(true)
    }

    async fn release_delivery_claim(
        &self,
        subject: &DeliverySubject,
        unit_key: &str,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .delivery_claims
            .remove(&(subject.key(), unit_key.to_string()));
        Ok(())
    }

    async fn list_deliveries(
        &self,
        subject: &DeliverySubject,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .deliveries
            .iter()
            .filter(|d| &d.subject == subject)
            .cloned()
            .collect())
    }

    async fn find_rules_by_trigger(&self, trigger: &str) -> Result<Vec<WorkflowRule>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .rules
            .values()
            .filter(|r| r.active && r.trigger.matches_event(trigger))
            .cloned()
            .collect())
    }

    async fn find_scheduled_rules(&self) -> Result<Vec<WorkflowRule>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .rules
            .values()
            .filter(|r| r.active && matches!(r.trigger, RuleTrigger::Inactivity { .. }))
            .cloned()
            .collect())
    }

    async fn upsert_rule(&self, rule: WorkflowRule) -> Result<(), StoreError> {
        self.state.write().await.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    async fn set_rule_active(&self, rule_id: &str, active: bool) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        Ok(match state.rules.get_mut(rule_id) {
            Some(rule) => {
                rule.active = active;
                true
            }
            None => false,
        })
    }

    async fn list_rules(&self) -> Result<Vec<WorkflowRule>, StoreError> {
        Ok(self.state.read().await.rules.values().cloned().collect())
    }

    async fn upsert_sequence(&self, sequence: Sequence) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .sequences
            .insert(sequence.id.clone(), sequence);
        Ok(())
    }

    async fn get_sequence(&self, id: &str) -> Result<Option<Sequence>, StoreError> {
        Ok(self.state.read().await.sequences.get(id).cloned())
    }

    async fn list_sequences(&self) -> Result<Vec<Sequence>, StoreError> {
        Ok(self.state.read().await.sequences.values().cloned().collect())
    }

    async fn find_sequences_by_trigger_tag(
        &self,
        tag_key: &str,
    ) -> Result<Vec<Sequence>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .sequences
            .values()
            .filter(|s| s.active && s.trigger_tag.as_deref() == Some(tag_key))
            .cloned()
            .collect())
    }

    async fn set_sequence_active(&self, id: &str, active: bool) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        Ok(match state.sequences.get_mut(id) {
            Some(sequence) => {
                sequence.active = active;
                true
            }
            None => false,
        })
    }

    async fn record_activity(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let last = state.activity.entry(user_id.to_string()).or_insert(at);
        if at > *last {
            *last = at;
        }
        Ok(())
    }

    async fn find_inactive_users(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, &str)>,
        limit: usize,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let state = self.state.read().await;
        let mut users: Vec<(String, DateTime<Utc>)> = state
            .activity
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .filter(|(user, at)| after.is_none_or(|cursor| (**at, user.as_str()) > cursor))
            .map(|(user, at)| (user.clone(), *at))
            .collect();
        users.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        users.truncate(limit);
        Ok(users)
    }
}
