//! `coachflow tag`: set or remove a user tag.
//!
//! Setting a tag can enroll the user in sequences triggered by it.

use chrono::Utc;
use std::path::Path;

pub async fn run(
    path: Option<&Path>,
    user_id: &str,
    key: &str,
    value: Option<&str>,
    remove: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(path)?;
    let engine = super::build_engine(&config).await?;

    if remove {
        if engine.remove_tag(user_id, key).await? {
            println!("Removed tag '{key}' from {user_id}");
        } else {
            println!("{user_id} has no tag '{key}'");
        }
        return Ok(());
    }

    let tag = engine.tag_user(user_id, key, value, Utc::now()).await?;
    super::print_json(&tag)?;

    let active: Vec<_> = engine
        .store()
        .list_enrollments_for_user(user_id)
        .await?
        .into_iter()
        .filter(|e| e.is_active())
        .map(|e| e.sequence_id)
        .collect();
    if !active.is_empty() {
        println!("Active sequences: {}", active.join(", "));
    }
    Ok(())
}
