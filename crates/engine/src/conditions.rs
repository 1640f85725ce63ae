//! Condition evaluator.
//!
//! Pure and total: no I/O, no panics. Callers pass a tag snapshot fetched
//! for this one evaluation. Unknown predicate kinds evaluate to `false`, so
//! a malformed rule does nothing instead of firing everywhere.

use coachflow_core::{Event, Predicate, TagSet};

/// AND over all predicates. An empty list is satisfied.
pub fn evaluate(predicates: &[Predicate], tags: &TagSet, event: Option<&Event>) -> bool {
    predicates.iter().all(|p| evaluate_one(p, tags, event))
}

fn evaluate_one(predicate: &Predicate, tags: &TagSet, event: Option<&Event>) -> bool {
    match predicate {
        Predicate::HasTag { key } => tags.contains(key),
        Predicate::LacksTag { key } => !tags.contains(key),
        Predicate::TagValueEquals { key, value } => tags.value(key) == Some(value.as_str()),
        Predicate::EventFieldEquals { field, value } => event
            .and_then(|e| e.field(field))
            .and_then(scalar_string)
            .is_some_and(|actual| actual == *value),
        Predicate::All { predicates } => evaluate(predicates, tags, event),
        Predicate::Unknown => false,
    }
}

/// Strings compare as-is; numbers and booleans by their JSON text.
/// Null, arrays and objects never equal anything.
fn scalar_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn tags() -> TagSet {
        TagSet::new()
            .with("course:fm", None)
            .with("plan", Some("gold"))
    }

    fn lesson_event(payload: serde_json::Value) -> Event {
        Event::new("u1", "lesson_completed", payload, Utc::now())
    }

    #[test]
    fn empty_predicates_hold() {
        assert!(evaluate(&[], &TagSet::new(), None));
    }

    #[test]
    fn tag_predicates() {
        let tags = tags();
        assert!(evaluate(&[Predicate::has_tag("course:fm")], &tags, None));
        assert!(!evaluate(&[Predicate::has_tag("purchased")], &tags, None));
        assert!(evaluate(&[Predicate::lacks_tag("purchased")], &tags, None));
        assert!(!evaluate(&[Predicate::lacks_tag("plan")], &tags, None));
        assert!(evaluate(&[Predicate::tag_value_equals("plan", "gold")], &tags, None));
        assert!(!evaluate(&[Predicate::tag_value_equals("plan", "silver")], &tags, None));
        // valueless tag never equals a value
        assert!(!evaluate(&[Predicate::tag_value_equals("course:fm", "")], &tags, None));
    }

    #[test]
    fn all_predicates_must_hold() {
        let tags = tags();
        let preds = vec![
            Predicate::has_tag("course:fm"),
            Predicate::lacks_tag("milestone:module1"),
        ];
        assert!(evaluate(&preds, &tags, None));

        let preds = vec![Predicate::has_tag("course:fm"), Predicate::has_tag("missing")];
        assert!(!evaluate(&preds, &tags, None));
    }

    #[test]
    fn nested_all() {
        let tags = tags();
        let nested = Predicate::All {
            predicates: vec![Predicate::has_tag("plan"), Predicate::has_tag("course:fm")],
        };
        assert!(evaluate(&[nested], &tags, None));
    }

    #[test]
    fn event_field_equals() {
        let event = lesson_event(json!({"lesson": {"module": 1, "title": "Intro", "free": true}}));
        let tags = TagSet::new();

        assert!(evaluate(&[Predicate::event_field_equals("lesson.module", "1")], &tags, Some(&event)));
        assert!(evaluate(&[Predicate::event_field_equals("lesson.title", "Intro")], &tags, Some(&event)));
        assert!(evaluate(&[Predicate::event_field_equals("lesson.free", "true")], &tags, Some(&event)));
        assert!(!evaluate(&[Predicate::event_field_equals("lesson.module", "2")], &tags, Some(&event)));
        assert!(!evaluate(&[Predicate::event_field_equals("lesson", "x")], &tags, Some(&event)));
    }

    #[test]
    fn event_predicate_without_event_is_false() {
        assert!(!evaluate(
            &[Predicate::event_field_equals("lesson.module", "1")],
            &TagSet::new(),
            None
        ));
    }

    #[test]
    fn unknown_predicate_fails_closed() {
        assert!(!evaluate(&[Predicate::Unknown], &tags(), None));
        assert!(!evaluate(
            &[Predicate::has_tag("course:fm"), Predicate::Unknown],
            &tags(),
            None
        ));
    }
}
