//! Sequences: named, ordered lists of timed steps (email drips, coach DMs).

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// A drip sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Unique sequence ID (e.g. "fm-onboarding")
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Inactive sequences accept no enrollments and are not processed by ticks
    #[serde(default = "default_true")]
    pub active: bool,

    /// Writing this tag auto-enrolls the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_tag: Option<String>,

    /// Presence of this tag exits the user from the sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_tag: Option<String>,

    /// Ordered steps, positions contiguous from zero
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_true() -> bool {
    true
}

/// One timed message within a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Zero-based ordinal, unique within the sequence
    pub position: u32,

    /// Offset from enrollment (first step) or from the previous send
    #[serde(default)]
    pub delay_minutes: i64,

    /// Message content reference handed to the sender
    pub template_id: String,

    #[serde(default)]
    pub channel: StepChannel,

    /// Extra template variables merged into every send of this step
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// Where a step is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepChannel {
    #[default]
    Email,
    /// In-app coach direct message
    DirectMessage,
}

impl std::fmt::Display for StepChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepChannel::Email => write!(f, "email"),
            StepChannel::DirectMessage => write!(f, "direct_message"),
        }
    }
}

impl Step {
    pub fn new(position: u32, delay: Duration, template_id: impl Into<String>) -> Self {
        Self {
            position,
            delay_minutes: delay.num_minutes(),
            template_id: template_id.into(),
            channel: StepChannel::Email,
            variables: serde_json::Map::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::minutes(self.delay_minutes)
    }
}

impl Sequence {
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            active: true,
            trigger_tag: None,
            exit_tag: None,
            steps,
        }
    }

    pub fn with_trigger_tag(mut self, tag: impl Into<String>) -> Self {
        self.trigger_tag = Some(tag.into());
        self
    }

    pub fn with_exit_tag(mut self, tag: impl Into<String>) -> Self {
        self.exit_tag = Some(tag.into());
        self
    }

    /// The step at a zero-based index.
    pub fn step(&self, index: u32) -> Option<&Step> {
        self.steps.get(index as usize)
    }

    pub fn len(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether `index` is the final step.
    pub fn is_last(&self, index: u32) -> bool {
        index + 1 >= self.len()
    }

    /// Check that the sequence is well-formed.
    ///
    /// Steps are sorted by position on deserialization by callers; here we
    /// require positions `0..n` in order with no gaps or duplicates.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("sequence id cannot be empty".into());
        }
        if self.steps.is_empty() {
            return Err(format!("sequence '{}' has no steps", self.id));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.position as usize != i {
                return Err(format!(
                    "sequence '{}': step at index {i} has position {} (positions must be contiguous from 0)",
                    self.id, step.position
                ));
            }
            if step.delay_minutes < 0 {
                return Err(format!(
                    "sequence '{}': step {} has a negative delay",
                    self.id, step.position
                ));
            }
            if step.template_id.trim().is_empty() {
                return Err(format!(
                    "sequence '{}': step {} references no template",
                    self.id, step.position
                ));
            }
        }
        Ok(())
    }

    /// Sort steps by position. Reordering never changes ordinal uniqueness.
    pub fn normalize(&mut self) {
        self.steps.sort_by_key(|s| s.position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_step() -> Sequence {
        Sequence::new(
            "fm-onboarding",
            vec![
                Step::new(0, Duration::hours(0), "welcome"),
                Step::new(1, Duration::hours(24), "day-one"),
                Step::new(2, Duration::hours(72), "check-in"),
            ],
        )
    }

    #[test]
    fn valid_sequence_passes() {
        let seq = three_step();
        assert!(seq.validate().is_ok());
        assert_eq!(seq.len(), 3);
        assert!(!seq.is_last(1));
        assert!(seq.is_last(2));
        assert_eq!(seq.step(1).unwrap().delay(), Duration::hours(24));
        assert!(seq.step(3).is_none());
    }

    #[test]
    fn gap_in_positions_rejected() {
        let mut seq = three_step();
        seq.steps[2].position = 5;
        let err = seq.validate().unwrap_err();
        assert!(err.contains("contiguous"));
    }

    #[test]
    fn empty_sequence_rejected() {
        let seq = Sequence::new("empty", vec![]);
        assert!(seq.validate().is_err());
    }

    #[test]
    fn normalize_sorts_steps() {
        let mut seq = three_step();
        seq.steps.reverse();
        assert!(seq.validate().is_err());
        seq.normalize();
        assert!(seq.validate().is_ok());
    }

    #[test]
    fn sequence_from_toml() {
        let seq: Sequence = toml::from_str(
            r#"
id = "coach-dm"
trigger_tag = "interest:coaching"
exit_tag = "dispute_filed"

[[steps]]
position = 0
template_id = "coach-hello"
channel = "direct_message"

[[steps]]
position = 1
delay_minutes = 1440
template_id = "coach-follow-up"
"#,
        )
        .unwrap();
        assert!(seq.active);
        assert_eq!(seq.trigger_tag.as_deref(), Some("interest:coaching"));
        assert_eq!(seq.steps[0].channel, StepChannel::DirectMessage);
        assert_eq!(seq.steps[1].channel, StepChannel::Email);
        assert_eq!(seq.steps[1].delay(), Duration::days(1));
    }
}
