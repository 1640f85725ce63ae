//! `coachflow tick`: run one scheduler pass and print its report.

use chrono::{DateTime, Utc};
use std::path::Path;

pub async fn run(
    path: Option<&Path>,
    at: Option<DateTime<Utc>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(path)?;
    let engine = super::build_engine(&config).await?;

    let report = engine.run_scheduler_tick(at.unwrap_or_else(Utc::now)).await?;
    super::print_json(&report)
}

#[cfg(test)]
mod tests {
    use super::super::{build_engine, test_support};
    use chrono::Utc;

    #[tokio::test]
    async fn tick_sends_due_first_step() {
        let engine = build_engine(&test_support::memory_config()).await.unwrap();
        let now = Utc::now();
        engine.tag_user("u1", "new_student", None, now).await.unwrap();

        let report = engine.run_scheduler_tick(now).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.sent, 1);
    }
}
