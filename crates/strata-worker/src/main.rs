use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use strata_core::config::StrataConfig;
use strata_scheduler::{
    schedule::default_timezone, types::parse_timezone, Mailer, NewSchedule, ScheduleDefinition,
    ScheduleStore, ScheduleWorker, WorkerOptions,
};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

mod cli;
mod executor;
mod export;
mod outbox;

use cli::{Cli, Command, ReportCommand, ScheduleCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata_worker=info,strata_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > STRATA_CONFIG env > ~/.strata/strata.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("STRATA_CONFIG").ok());
    let config = StrataConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        StrataConfig::default()
    });
    let default_tz = default_timezone(config.worker.timezone.as_deref())?;

    if let Command::Preview {
        definition,
        count,
        timezone,
        from,
    } = &cli.command
    {
        let definition = ScheduleDefinition::parse(definition)?;
        let tz = match timezone {
            Some(name) => parse_timezone(name)?,
            None => default_tz,
        };
        let from = from.unwrap_or_else(Utc::now);
        let upcoming = strata_scheduler::next_occurrences(&definition, from, &tz, *count)?;
        if upcoming.is_empty() {
            println!("no future occurrences");
        }
        for at in upcoming {
            println!("{}  ({})", at.with_timezone(&tz).to_rfc3339(), at.to_rfc3339());
        }
        return Ok(());
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening schedule database");
    let store = ScheduleStore::open(db_path)
        .with_context(|| format!("opening {db_path}"))?
        .with_default_timezone(default_tz)
        .with_claim_ttl(config.worker.claim_ttl());

    match cli.command {
        Command::Run => run_worker(&config, store).await,
        Command::Preview { .. } => Ok(()),
        Command::Report(cmd) => report_command(&store, cmd),
        Command::Schedule(cmd) => schedule_command(&store, cmd),
    }
}

async fn run_worker(config: &StrataConfig, store: ScheduleStore) -> anyhow::Result<()> {
    let worker_id = config
        .worker
        .id
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let executor = Arc::new(executor::SqliteReportExecutor::new(
        store.clone(),
        &config.data.path,
    ));
    let exporter = Arc::new(export::FileResultExporter::new(&config.cache.directory));
    let mailer: Arc<dyn Mailer> = match &config.mail.outbox_path {
        Some(path) => {
            ensure_parent_dir(path);
            info!(path = %path, "queueing email to outbox");
            Arc::new(
                outbox::OutboxMailer::open(path, &config.mail.sender)
                    .with_context(|| format!("opening outbox {path}"))?,
            )
        }
        None => {
            warn!("mail.outbox_path is not set; results will not be emailed");
            Arc::new(outbox::UnconfiguredMailer)
        }
    };

    let options = WorkerOptions::from_config(worker_id, &config.worker, &config.mail);
    let worker = ScheduleWorker::new(store, executor, exporter, mailer, options);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            warn!("signal handler failed ({e}); stopping");
        }
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await?;
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl+C received"),
            _ = terminate.recv() => info!("SIGTERM received"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}

fn report_command(store: &ScheduleStore, cmd: ReportCommand) -> anyhow::Result<()> {
    match cmd {
        ReportCommand::Add { name, sql } => {
            let report = store.create_report(&name, &sql)?;
            println!("{}", report.id);
        }
        ReportCommand::Delete { id } => {
            store.delete_report(&id)?;
            println!("deleted report {id}");
        }
    }
    Ok(())
}

fn schedule_command(store: &ScheduleStore, cmd: ScheduleCommand) -> anyhow::Result<()> {
    match cmd {
        ScheduleCommand::Add {
            report_id,
            name,
            definition,
            recipients,
            max_inline_rows,
            timezone,
            params,
        } => {
            let schedule = store.create_schedule(NewSchedule {
                report_id,
                name,
                definition: ScheduleDefinition::parse(&definition)?,
                parameters: params.into_iter().collect::<BTreeMap<_, _>>(),
                recipients: recipients
                    .into_iter()
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect(),
                max_inline_rows,
                timezone: timezone.as_deref().map(parse_timezone).transpose()?,
            })?;
            println!("{}", schedule.id);
            match schedule.next_run_at {
                Some(next) => println!("next run: {}", next.to_rfc3339()),
                None => println!("no future occurrences; schedule created disabled"),
            }
        }
        ScheduleCommand::List => {
            for s in store.list_schedules()? {
                println!(
                    "{}  {:<8} {:<16} {:<24} next={} last={}",
                    s.id,
                    if s.enabled { "enabled" } else { "disabled" },
                    s.definition.kind(),
                    s.name,
                    s.next_run_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                    s.last_run_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                );
            }
        }
        ScheduleCommand::Enable { id } => {
            let s = store.set_enabled(&id, true)?;
            println!(
                "enabled {id}; next run: {}",
                s.next_run_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
            );
        }
        ScheduleCommand::Disable { id } => {
            store.set_enabled(&id, false)?;
            println!("disabled {id}");
        }
        ScheduleCommand::Runs { id, limit } => {
            // surface a clear error for unknown ids
            store.get_schedule(&id)?;
            for run in store.list_runs(&id, limit)? {
                println!(
                    "{}  {:<9} rows={} {}ms started={}{}{}",
                    run.id,
                    run.status.to_string(),
                    run.row_count.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                    run.duration_ms.unwrap_or_default(),
                    run.started_at.to_rfc3339(),
                    run.error.map(|e| format!(" error={e}")).unwrap_or_default(),
                    run.delivery_error
                        .map(|e| format!(" delivery_error={e}"))
                        .unwrap_or_default(),
                );
            }
        }
    }
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
