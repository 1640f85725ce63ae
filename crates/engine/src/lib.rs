//! # Coachflow Engine
//!
//! The automation engine: condition evaluation, sequence enrollments,
//! workflow rules, and the scheduler that dispatches due steps.
//!
//! [`AutomationEngine`] wires the parts together over a [`Store`] and a
//! [`MessageSender`]. The gateway and CLI talk only to it.

pub mod conditions;
pub mod enrollment;
pub mod rules;
pub mod scheduler;

pub use enrollment::{Advance, EnrollmentManager, ExitCheck};
pub use rules::{FireReport, RuleEngine};
pub use scheduler::{Scheduler, SchedulerSettings, StepOutcome, TickReport};

use chrono::{DateTime, Utc};
use coachflow_config::AppConfig;
use coachflow_core::{
    CreateOutcome, Enrollment, Event, EventBus, MessageSender, OutboundMessage, Result, SendError,
    SendReceipt, Sequence, Store, Tag, WorkflowRule,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Bound a send by `timeout`; expiry is a transient failure.
pub(crate) async fn send_with_timeout(
    sender: &dyn MessageSender,
    message: &OutboundMessage,
    timeout: Duration,
) -> std::result::Result<SendReceipt, SendError> {
    match tokio::time::timeout(timeout, sender.send(message)).await {
        Ok(result) => result,
        Err(_) => Err(SendError::Timeout {
            secs: timeout.as_secs(),
        }),
    }
}

/// The engine facade.
pub struct AutomationEngine {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    enrollments: Arc<EnrollmentManager>,
    rules: Arc<RuleEngine>,
    scheduler: Scheduler,
}

impl AutomationEngine {
    pub fn new(store: Arc<dyn Store>, sender: Arc<dyn MessageSender>, config: &AppConfig) -> Self {
        let settings = SchedulerSettings::from_config(config);
        let events = Arc::new(EventBus::default());
        let enrollments = Arc::new(EnrollmentManager::new(
            store.clone(),
            events.clone(),
            config.scheduler.conflict_retries,
        ));
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
            sender,
            enrollments.clone(),
            rules.clone(),
            events.clone(),
            settings,
        );

        Self {
            store,
            events,
            enrollments,
            rules,
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Upsert sequences and rules from configuration.
    ///
    /// A malformed entry is skipped and reported; the rest still load.
    pub async fn seed(&self, sequences: &[Sequence], rules: &[WorkflowRule]) -> Vec<String> {
        let mut errors = Vec::new();

        for sequence in sequences {
            let mut sequence = sequence.clone();
            sequence.normalize();
            if let Err(e) = sequence.validate() {
                errors.push(format!("Sequence '{}': {e}", sequence.id));
                continue;
            }
            let id = sequence.id.clone();
            if let Err(e) = self.store.upsert_sequence(sequence).await {
                errors.push(format!("Sequence '{id}': {e}"));
            }
        }

        for rule in rules {
            if let Err(e) = rule.validate() {
                errors.push(format!("Rule '{}': {e}", rule.id));
                continue;
            }
            if let Err(e) = self.store.upsert_rule(rule.clone()).await {
                errors.push(format!("Rule '{}': {e}", rule.id));
            }
        }

        for e in &errors {
            warn!(error = %e, "Skipped invalid automation definition");
        }
        info!(
            sequences = sequences.len(),
            rules = rules.len(),
            skipped = errors.len(),
            "Automation definitions seeded"
        );
        errors
    }

    pub async fn fire_event(&self, event: &Event) -> Result<FireReport> {
        self.rules.fire_event(event).await
    }

    pub async fn run_scheduler_tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.scheduler.run_tick(now).await
    }

    pub async fn enroll(
        &self,
        user_id: &str,
        sequence_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        self.enrollments.enroll(user_id, sequence_id, now).await
    }

    pub async fn tag_user(
        &self,
        user_id: &str,
        key: &str,
        value: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Tag> {
        self.rules.tag_user(user_id, key, value, None, now).await
    }

    pub async fn remove_tag(&self, user_id: &str, key: &str) -> Result<bool> {
        self.rules.remove_tag(user_id, key).await
    }

    pub async fn exit_enrollment(
        &self,
        enrollment_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        self.enrollments.exit(enrollment_id, reason, now).await
    }

    pub async fn unenroll(
        &self,
        user_id: &str,
        sequence_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Enrollment>> {
        self.enrollments
            .unenroll(user_id, sequence_id, reason, now)
            .await
    }

    pub async fn set_sequence_active(&self, sequence_id: &str, active: bool) -> Result<bool> {
        Ok(self.store.set_sequence_active(sequence_id, active).await?)
    }

    pub async fn set_rule_active(&self, rule_id: &str, active: bool) -> Result<bool> {
        Ok(self.store.set_rule_active(rule_id, active).await?)
    }

    /// Start the periodic scheduler. Returns the loop's handle.
    ///
    /// A tick that overruns the interval delays the next one rather than
    /// stacking ticks up.
    pub fn start(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = interval.as_secs(), "Scheduler started");

            loop {
                ticker.tick().await;
                match engine.run_scheduler_tick(Utc::now()).await {
                    Ok(report) => debug!(due = report.due, sent = report.sent, "Tick finished"),
                    Err(e) => error!(error = %e, "Scheduler tick failed"),
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use coachflow_core::{MessageSender, OutboundMessage, SendError, SendReceipt};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records successful sends; failures and delays are queued per call.
    #[derive(Default)]
    pub struct ScriptedSender {
        sent: Mutex<Vec<OutboundMessage>>,
        failures: Mutex<VecDeque<SendError>>,
        delays: Mutex<VecDeque<Duration>>,
    }

    impl ScriptedSender {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next(&self, error: SendError) {
            self.failures.lock().unwrap().push_back(error);
        }

        pub fn delay_next(&self, delay: Duration) {
            self.delays.lock().unwrap().push_back(delay);
        }

        pub fn sent(&self) -> Vec<OutboundMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSender for ScriptedSender {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
            let delay = self.delays.lock().unwrap().pop_front();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let failure = self.failures.lock().unwrap().pop_front();
            if let Some(error) = failure {
                return Err(error);
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(SendReceipt::default())
        }
    }
}
