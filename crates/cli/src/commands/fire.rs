//! `coachflow fire`: push one event through the workflow rules.

use chrono::Utc;
use coachflow_core::Event;
use std::path::Path;

pub async fn run(
    path: Option<&Path>,
    user_id: &str,
    trigger: &str,
    payload: Option<String>,
    dedupe_key: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(path)?;
    let engine = super::build_engine(&config).await?;

    let event = build_event(user_id, trigger, payload.as_deref(), dedupe_key)?;
    let report = engine.fire_event(&event).await?;
    super::print_json(&report)
}

fn build_event(
    user_id: &str,
    trigger: &str,
    payload: Option<&str>,
    dedupe_key: Option<String>,
) -> Result<Event, Box<dyn std::error::Error>> {
    let payload = match payload {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).map_err(|e| format!("Invalid --payload JSON: {e}"))?;
            if !value.is_object() {
                return Err("--payload must be a JSON object".into());
            }
            value
        }
        None => serde_json::json!({}),
    };

    let mut event = Event::new(user_id, trigger, payload, Utc::now());
    if let Some(key) = dedupe_key {
        event = event.with_dedupe_key(key);
    }
    Ok(event)
}
