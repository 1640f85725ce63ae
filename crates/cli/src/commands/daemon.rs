//! `coachflow daemon`: scheduler loop plus HTTP gateway.

use coachflow_core::AutomationEvent;
use std::path::Path;
use tracing::{info, warn};

pub async fn run(
    path: Option<&Path>,
    port: Option<u16>,
    no_scheduler: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(path)?;
    if let Some(port) = port {
        config.gateway.port = port;
    }

    println!("Coachflow daemon starting");
    println!("  Gateway:   {}:{}", config.gateway.host, config.gateway.port);
    println!("  Store:     {}", config.store.backend);
    println!("  Sender:    {}", config.sender.kind);

    let engine = super::build_engine(&config).await?;

    // Observe engine activity
    let mut events = engine.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let scheduler = if config.scheduler.enabled && !no_scheduler {
        Some(engine.start(config.scheduler.tick_interval()))
    } else {
        info!("Periodic scheduler disabled; ticks only via POST /v1/tick");
        None
    };

    tokio::select! {
        result = coachflow_gateway::start(&config.gateway, engine) => {
            if let Err(e) = result {
                return Err(format!("Gateway failed: {e}").into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    if let Some(handle) = scheduler {
        handle.abort();
    }
    Ok(())
}

fn log_event(event: &AutomationEvent) {
    match event {
        AutomationEvent::Enrolled {
            enrollment_id,
            user_id,
            sequence_id,
            ..
        } => info!(%enrollment_id, %user_id, %sequence_id, "Enrolled"),
        AutomationEvent::StepDelivered {
            enrollment_id,
            step,
            deduplicated,
            ..
        } => info!(%enrollment_id, step, deduplicated, "Step delivered"),
        AutomationEvent::DeliveryFailed {
            enrollment_id,
            step,
            permanent,
            reason,
            ..
        } => warn!(%enrollment_id, step, permanent, %reason, "Delivery failed"),
        AutomationEvent::EnrollmentCompleted { enrollment_id, .. } => {
            info!(%enrollment_id, "Enrollment completed")
        }
        AutomationEvent::EnrollmentExited {
            enrollment_id,
            reason,
            ..
        } => info!(%enrollment_id, %reason, "Enrollment exited"),
        AutomationEvent::RuleMatched {
            rule_id,
            user_id,
            trigger,
            ..
        } => info!(%rule_id, %user_id, %trigger, "Rule matched"),
        AutomationEvent::TickCompleted {
            due,
            sent,
            duration_ms,
            ..
        } => info!(due, sent, duration_ms, "Tick completed"),
    }
}
