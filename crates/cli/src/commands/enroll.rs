//! `coachflow enroll`: enroll a user in a sequence by hand.

use chrono::Utc;
use std::path::Path;

pub async fn run(
    path: Option<&Path>,
    user_id: &str,
    sequence_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(path)?;
    let engine = super::build_engine(&config).await?;

    let outcome = engine.enroll(user_id, sequence_id, Utc::now()).await?;
    if outcome.was_created() {
        println!("Enrolled {user_id} in {sequence_id}");
    } else {
        println!("{user_id} already has an active enrollment in {sequence_id}");
    }
    super::print_json(outcome.enrollment())
}
