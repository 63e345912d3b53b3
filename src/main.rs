use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use reservo::clock::SystemClock;
use reservo::compactor;
use reservo::config::Config;
use reservo::engine::{AuditReport, Engine};
use reservo::model::Space;

#[derive(Serialize)]
struct Summary {
    data_dir: String,
    journal_appends_since_compact: u64,
    compacted: bool,
    spaces: Vec<Space>,
    audit: AuditReport,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    reservo::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.wal_path();
    info!("reservo opening {}", wal_path.display());
    info!("  daily quota: {}", config.policy.daily_quota);
    info!(
        "  duration: {}–{} min, notice: {} min–{} days",
        config.policy.min_duration.num_minutes(),
        config.policy.max_duration.num_minutes(),
        config.policy.min_notice.num_minutes(),
        config.policy.max_notice.num_days()
    );

    let engine = Arc::new(Engine::open(&wal_path, config.policy.clone(), Arc::new(SystemClock))?);

    let audit = engine.audit().await;
    if audit.is_clean() {
        info!(
            spaces = audit.spaces,
            reservations = audit.reservations,
            items = audit.items,
            "invariants hold"
        );
    } else {
        warn!(
            overlapping = audit.overlapping.len(),
            unbalanced_items = audit.unbalanced_items.len(),
            unexplained_states = audit.unexplained_states.len(),
            "invariant violations found"
        );
    }

    let appended = engine.journal_appends_since_compact().await;
    let compacted = compactor::compact_if_due(&engine, config.compact_threshold).await;

    let summary = Summary {
        data_dir: config.data_dir.display().to_string(),
        journal_appends_since_compact: appended,
        compacted,
        spaces: engine.spaces().await,
        audit,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !summary.audit.is_clean() {
        std::process::exit(2);
    }

    if let Some(every) = config.compact_interval {
        info!(every_secs = every.as_secs(), "watching journal for compaction");
        let task = tokio::spawn(compactor::run_compactor(engine.clone(), config.compact_threshold, every));
        tokio::signal::ctrl_c().await?;
        task.abort();
        info!("shutting down");
    }
    Ok(())
}
