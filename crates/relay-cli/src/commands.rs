use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use colored::Colorize;
use tracing::info;

use relay_engine::{abandon_record, failure_summaries, Lifecycle, RelayCoordinator};
use relay_server::RelayServer;
use relay_source::{ChannelEventSource, RawNotification};
use relay_store::{DeliveryLedger, InMemoryDeliveryLedger, WalConfig, WalDeliveryLedger};
use relay_target::{FieldMappingTranslator, InMemoryTargetLedger};
use relay_types::{EventId, StatusCounts};

use crate::cli::*;
use crate::config::AppConfig;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Status(args) => cmd_status(args, format),
        Command::Failures(args) => cmd_failures(args, format),
        Command::Abandon(args) => cmd_abandon(args, format),
        Command::Compact(args) => cmd_compact(args),
        Command::Config => cmd_config(),
    }
}

/// Open an existing log. Offline commands never create one.
fn open_existing_wal(path: &Path) -> anyhow::Result<WalDeliveryLedger> {
    if !path.exists() {
        bail!("no write-ahead log at {}", path.display());
    }
    WalDeliveryLedger::open(path, WalConfig::default())
        .with_context(|| format!("opening {}", path.display()))
}

fn print_counts(counts: &StatusCounts) {
    println!("  {:<20}{}", "pending", counts.pending.to_string().bold());
    println!("  {:<20}{}", "in flight", counts.in_flight.to_string().bold());
    println!("  {:<20}{}", "delivered", counts.delivered.to_string().green());
    println!("  {:<20}{}", "failed (retrying)", counts.failed_retrying.to_string().yellow());
    println!("  {:<20}{}", "failed (permanent)", counts.failed_permanent.to_string().red());
    println!("  {:<20}{}", "abandoned", counts.abandoned.to_string().dimmed());
}

fn cmd_status(args: WalArgs, format: OutputFormat) -> anyhow::Result<()> {
    let ledger = open_existing_wal(&args.wal)?;
    let counts = ledger.counts()?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&counts)?),
        OutputFormat::Text => {
            println!("Delivery ledger {} ({} records)", args.wal.display().to_string().bold(), counts.total());
            print_counts(&counts);
        }
    }
    Ok(())
}

fn cmd_failures(args: WalArgs, format: OutputFormat) -> anyhow::Result<()> {
    let ledger = open_existing_wal(&args.wal)?;
    let failures = failure_summaries(&ledger)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&failures)?),
        OutputFormat::Text if failures.is_empty() => {
            println!("{} No permanently failed records.", "✓".green().bold());
        }
        OutputFormat::Text => {
            for f in &failures {
                let error = f
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                println!(
                    "{} {} {} attempts={} {}",
                    "✗".red().bold(),
                    f.id.yellow(),
                    f.key.bold(),
                    f.attempts,
                    error.dimmed()
                );
            }
        }
    }
    Ok(())
}

fn cmd_abandon(args: AbandonArgs, format: OutputFormat) -> anyhow::Result<()> {
    let ledger = open_existing_wal(&args.wal)?;
    let id = EventId::from_hex(&args.id).with_context(|| format!("invalid event id {}", args.id))?;
    let record = abandon_record(&ledger, &id, Utc::now())?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "id": id.to_hex(), "state": record.state })
        ),
        OutputFormat::Text => println!(
            "{} Abandoned {} ({})",
            "✓".green().bold(),
            id.short_id().yellow(),
            record.event.source_record_key()
        ),
    }
    Ok(())
}

fn cmd_compact(args: WalArgs) -> anyhow::Result<()> {
    let ledger = open_existing_wal(&args.wal)?;
    let before = ledger.log_size();
    ledger.compact()?;
    println!(
        "{} Compacted {}: {} -> {} bytes",
        "✓".green().bold(),
        args.wal.display(),
        before,
        ledger.log_size()
    );
    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    print!("{}", AppConfig::default().to_toml()?);
    Ok(())
}

/// Sample notification for the in-process demo source.
fn demo_notification(n: u32) -> RawNotification {
    const MAKES: [(&str, &str); 4] = [
        ("Toyota", "Prius"),
        ("Ford", "Mustang"),
        ("Tesla", "Model S"),
        ("Peugeot", "205"),
    ];
    let (make, model) = MAKES[n as usize % MAKES.len()];
    let payload = serde_json::json!({
        "make": make,
        "model": model,
        "colour": "blue",
        "owner": format!("owner-{n}"),
    });
    RawNotification::new(
        format!("demo-tx-{n}"),
        "CarCreated",
        0,
        format!("CAR{n}"),
        payload.to_string().into_bytes(),
    )
}

fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_relay(config, args.demo))
}

async fn run_relay(config: AppConfig, demo: u32) -> anyhow::Result<()> {
    let ledger: Arc<dyn DeliveryLedger> = match &config.store.wal_path {
        Some(path) => Arc::new(
            WalDeliveryLedger::open(path, config.store.wal_config())
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Arc::new(InMemoryDeliveryLedger::new()),
    };
    let source = Arc::new(ChannelEventSource::new());
    let target = Arc::new(InMemoryTargetLedger::new());
    let relay = Arc::new(RelayCoordinator::new(
        config.relay.clone(),
        ledger,
        source.clone(),
        Arc::new(FieldMappingTranslator::car_registry()),
        target,
    )?);

    let report = relay.start().await?;
    println!(
        "{} Relay running ({} pending, {} recovered in flight)",
        "✓".green().bold(),
        report.pending,
        report.recovered_in_flight.len()
    );

    for n in 0..demo {
        source.publish(demo_notification(n))?;
    }
    if demo > 0 {
        info!(count = demo, "demo notifications published");
    }

    let mut lifecycle = relay.watch_lifecycle();
    let server = RelayServer::new(config.server.clone(), relay.clone());
    let mut server_lifecycle = relay.watch_lifecycle();
    let server_task = tokio::spawn(server.serve(async move {
        let _ = server_lifecycle
            .wait_for(|l| matches!(l, Lifecycle::Stopped | Lifecycle::Halted))
            .await;
    }));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("Shutting down...");
        }
        _ = lifecycle.wait_for(|l| matches!(l, Lifecycle::Stopped | Lifecycle::Halted)) => {}
    }

    if let Some(reason) = relay.halt_reason() {
        let _ = relay.shutdown().await;
        bail!("relay halted: {reason}");
    }
    if relay.lifecycle() == Lifecycle::Running {
        let drain = relay.shutdown().await?;
        let status = if drain.drained { "drained".green() } else { "cancelled in-flight work".yellow() };
        println!("{} Relay stopped ({status})", "✓".green().bold());
        print_counts(&drain.counts);
    }
    server_task.await??;
    Ok(())
}
