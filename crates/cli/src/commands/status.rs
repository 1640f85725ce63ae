//! `coachflow status`: show configuration and store counts.

use coachflow_config::AppConfig;
use std::path::Path;

pub async fn run(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(path)?;
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(AppConfig::config_path);

    println!("Coachflow status");
    println!("================");
    println!("  Config:        {}", config_path.display());
    println!(
        "  Store:         {} ({})",
        config.store.backend,
        config.store.resolved_path().display()
    );
    println!("  Sender:        {}", config.sender.kind);
    println!("  Gateway:       {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "  Signed API:    {}",
        if config.gateway.shared_secret.is_some() { "yes" } else { "no" }
    );
    println!(
        "  Scheduler:     {} (every {}s, page {}, concurrency {})",
        if config.scheduler.enabled { "enabled" } else { "disabled" },
        config.scheduler.tick_interval_secs,
        config.scheduler.page_size,
        config.scheduler.max_concurrency
    );
    println!("  On failure:    {:?}", config.delivery.on_permanent_failure);
    println!(
        "  Seeds:         {} sequences, {} rules",
        config.sequences.len(),
        config.rules.len()
    );

    let store = coachflow_store::open(&config.store)
        .await
        .map_err(|e| format!("Failed to open store: {e}"))?;
    let sequences = store.list_sequences().await?;
    let rules = store.list_rules().await?;
    let enrollments = store.count_enrollments().await?;

    println!(
        "\n  Stored sequences:  {} ({} active)",
        sequences.len(),
        count_active(sequences.iter().map(|s| s.active))
    );
    println!(
        "  Stored rules:      {} ({} active)",
        rules.len(),
        count_active(rules.iter().map(|r| r.active))
    );
    println!("  Enrollments:       {enrollments}");

    if !config_path.exists() {
        println!("\n  No config file found; run `coachflow onboard` first");
    }

    Ok(())
}

fn count_active(flags: impl Iterator<Item = bool>) -> usize {
    flags.filter(|active| *active).count()
}
