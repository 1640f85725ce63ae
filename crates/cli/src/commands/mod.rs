pub mod daemon;
pub mod enroll;
pub mod fire;
pub mod onboard;
pub mod status;
pub mod tag;
pub mod tick;

use coachflow_config::AppConfig;
use coachflow_engine::AutomationEngine;
use std::path::Path;
use std::sync::Arc;

/// Load the config at `path`, or the default location.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    }
    .map_err(|e| format!("Failed to load config: {e}"))?;
    Ok(config)
}

/// Open the store, build the sender, and seed sequences and rules from config.
///
/// A seed entry that fails validation is skipped; the engine logs it.
pub async fn build_engine(
    config: &AppConfig,
) -> Result<Arc<AutomationEngine>, Box<dyn std::error::Error>> {
    let store = coachflow_store::open(&config.store)
        .await
        .map_err(|e| format!("Failed to open store: {e}"))?;
    let sender =
        coachflow_sender::build_from_config(&config.sender, config.scheduler.send_timeout())
            .map_err(|e| format!("Failed to build sender: {e}"))?;

    let engine = Arc::new(AutomationEngine::new(store, sender, config));

    if !config.sequences.is_empty() || !config.rules.is_empty() {
        engine.seed(&config.sequences, &config.rules).await;
    }

    Ok(engine)
}

/// Print a value as pretty JSON.
pub fn print_json<T: serde::Serialize + ?Sized>(
    value: &T,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Duration;
    use coachflow_config::AppConfig;
    use coachflow_core::{Sequence, Step};

    /// In-memory config with one "onboarding" sequence triggered by `new_student`.
    pub fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.store.backend = "memory".into();
        config.sequences.push(
            Sequence::new(
                "onboarding",
                vec![
                    Step::new(0, Duration::zero(), "welcome"),
                    Step::new(1, Duration::hours(24), "day-one"),
                ],
            )
            .with_trigger_tag("new_student"),
        );
        config
    }
}
