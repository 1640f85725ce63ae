//! Workflow rules: trigger → conditions → actions.
//!
//! Rules are independent of step-ordered sequences. Conditions use AND
//! semantics; OR is expressed as several rules.

use serde::{Deserialize, Serialize};

/// An event-driven (or time-driven) automation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRule {
    /// Unique rule ID
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// What fires the rule (e.g. "lesson_completed", "inactive:72h")
    pub trigger: RuleTrigger,

    /// All must hold
    #[serde(default)]
    pub conditions: Vec<Predicate>,

    /// Executed in order when the conditions hold
    #[serde(default)]
    pub actions: Vec<RuleAction>,

    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl WorkflowRule {
    pub fn new(
        id: impl Into<String>,
        trigger: impl Into<String>,
        conditions: Vec<Predicate>,
        actions: Vec<RuleAction>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            trigger: RuleTrigger::from(trigger.into()),
            conditions,
            actions,
            active: true,
        }
    }

    /// Validate that the rule is well-formed.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("rule id cannot be empty".into());
        }
        match &self.trigger {
            RuleTrigger::Event(name) if name.is_empty() => {
                return Err(format!("rule '{}': event trigger name cannot be empty", self.id));
            }
            RuleTrigger::Inactivity { hours: 0 } => {
                return Err(format!("rule '{}': inactivity window must be > 0", self.id));
            }
            RuleTrigger::Invalid(raw) => {
                return Err(format!("rule '{}': unparseable trigger '{raw}'", self.id));
            }
            _ => {}
        }
        if self.actions.is_empty() {
            return Err(format!("rule '{}' has no actions", self.id));
        }
        if let Some(pos) = self
            .actions
            .iter()
            .position(|a| matches!(a, RuleAction::Unknown))
        {
            return Err(format!(
                "rule '{}': action {pos} has an unknown kind",
                self.id
            ));
        }
        Ok(())
    }
}

/// What fires a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleTrigger {
    /// A named domain event (lesson_completed, purchase, ...).
    Event(String),
    /// Pure time trigger: the user has been inactive for `hours`.
    Inactivity { hours: u32 },
    /// A trigger string that could not be parsed. Never matches.
    Invalid(String),
}

impl RuleTrigger {
    /// Does this trigger match the named event?
    pub fn matches_event(&self, name: &str) -> bool {
        matches!(self, RuleTrigger::Event(n) if n == name)
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, RuleTrigger::Inactivity { .. })
    }
}

impl From<String> for RuleTrigger {
    fn from(s: String) -> Self {
        if let Some(window) = s.strip_prefix("inactive:") {
            let digits = window.strip_suffix('h').unwrap_or(window);
            return match digits.parse::<u32>() {
                Ok(hours) => RuleTrigger::Inactivity { hours },
                Err(_) => RuleTrigger::Invalid(s),
            };
        }
        match s.strip_prefix("event:") {
            Some(name) => RuleTrigger::Event(name.to_string()),
            None => RuleTrigger::Event(s),
        }
    }
}

impl From<&str> for RuleTrigger {
    fn from(s: &str) -> Self {
        RuleTrigger::from(s.to_string())
    }
}

impl From<RuleTrigger> for String {
    fn from(t: RuleTrigger) -> Self {
        match t {
            RuleTrigger::Event(name) => name,
            RuleTrigger::Inactivity { hours } => format!("inactive:{hours}h"),
            RuleTrigger::Invalid(raw) => raw,
        }
    }
}

impl std::fmt::Display for RuleTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from(self.clone()))
    }
}

/// A condition predicate over a tag snapshot and an optional event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    HasTag { key: String },
    LacksTag { key: String },
    TagValueEquals { key: String, value: String },
    /// Dot-path lookup into the event payload (e.g. `lesson.id`).
    EventFieldEquals { field: String, value: String },
    All { predicates: Vec<Predicate> },
    /// Any kind this build does not understand. Evaluates to false.
    #[serde(other)]
    Unknown,
}

impl Predicate {
    pub fn has_tag(key: impl Into<String>) -> Self {
        Predicate::HasTag { key: key.into() }
    }

    pub fn lacks_tag(key: impl Into<String>) -> Self {
        Predicate::LacksTag { key: key.into() }
    }

    pub fn tag_value_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::TagValueEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn event_field_equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::EventFieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// An action executed when a rule matches.
///
/// Each action is idempotent on its own; a rule is not a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    AddTag {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    RemoveTag {
        key: String,
    },
    EnrollInSequence {
        sequence_id: String,
    },
    SendMessage {
        template_id: String,
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        variables: serde_json::Map<String, serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

impl RuleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            RuleAction::AddTag { .. } => "add_tag",
            RuleAction::RemoveTag { .. } => "remove_tag",
            RuleAction::EnrollInSequence { .. } => "enroll_in_sequence",
            RuleAction::SendMessage { .. } => "send_message",
            RuleAction::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_from_string() {
        assert_eq!(
            RuleTrigger::from("lesson_completed"),
            RuleTrigger::Event("lesson_completed".into())
        );
        assert_eq!(
            RuleTrigger::from("event:purchase"),
            RuleTrigger::Event("purchase".into())
        );
        assert_eq!(
            RuleTrigger::from("inactive:72h"),
            RuleTrigger::Inactivity { hours: 72 }
        );
        assert_eq!(
            RuleTrigger::from("inactive:24"),
            RuleTrigger::Inactivity { hours: 24 }
        );
        assert!(matches!(
            RuleTrigger::from("inactive:soon"),
            RuleTrigger::Invalid(_)
        ));
    }

    #[test]
    fn trigger_matching() {
        let t = RuleTrigger::from("lesson_completed");
        assert!(t.matches_event("lesson_completed"));
        assert!(!t.matches_event("purchase"));
        assert!(!RuleTrigger::Inactivity { hours: 72 }.matches_event("inactive:72h"));
        assert!(RuleTrigger::Inactivity { hours: 72 }.is_scheduled());
    }

    #[test]
    fn rule_from_toml() {
        let rule: WorkflowRule = toml::from_str(
            r#"
id = "module1-milestone"
trigger = "lesson_completed"

[[conditions]]
kind = "has_tag"
key = "course:fm"

[[conditions]]
kind = "event_field_equals"
field = "lesson.module"
value = "1"

[[actions]]
type = "add_tag"
key = "milestone:module1"

[[actions]]
type = "send_message"
template_id = "module1-congrats"
"#,
        )
        .unwrap();
        assert!(rule.active);
        assert_eq!(rule.conditions.len(), 2);
        assert_eq!(rule.actions[0].kind(), "add_tag");
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn unknown_kinds_deserialize_to_unknown() {
        let pred: Predicate =
            serde_json::from_value(serde_json::json!({"kind": "has_any_tag", "keys": ["a"]}))
                .unwrap();
        assert_eq!(pred, Predicate::Unknown);

        let action: RuleAction =
            serde_json::from_value(serde_json::json!({"type": "charge_card", "amount": 5}))
                .unwrap();
        assert_eq!(action, RuleAction::Unknown);
    }

    #[test]
    fn validate_rejects_unknown_action() {
        let rule = WorkflowRule::new(
            "bad",
            "purchase",
            vec![],
            vec![RuleAction::Unknown],
        );
        let err = rule.validate().unwrap_err();
        assert!(err.contains("unknown kind"));
    }

    #[test]
    fn validate_rejects_invalid_trigger() {
        let rule = WorkflowRule::new(
            "bad-trigger",
            "inactive:later",
            vec![],
            vec![RuleAction::RemoveTag { key: "x".into() }],
        );
        assert!(rule.validate().is_err());
    }

    #[test]
    fn trigger_serializes_as_string() {
        let rule = WorkflowRule::new(
            "nudge",
            "inactive:72h",
            vec![Predicate::lacks_tag("nudged")],
            vec![RuleAction::AddTag {
                key: "nudged".into(),
                value: None,
            }],
        );
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["trigger"], "inactive:72h");
        assert_eq!(json["conditions"][0]["kind"], "lacks_tag");
    }
}
