mod cli;
mod ui;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use runledger::executor::ScriptedExecutor;
use runledger::gate::ThresholdGate;
use runledger::state_machine::{JobKind, JobSpec};
use runledger::{
    JobFilter, JobOrchestrator, JobPoller, JobRegistry, PollEvent, PollOutcome, RunledgerConfig,
    logging,
};
use tracing::{info, warn};
use ui::JobProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = match &cli.config {
        Some(path) => RunledgerConfig::load_from(path)?,
        None => RunledgerConfig::load()?,
    };

    match cli.command {
        Command::Run {
            symbol,
            strategy,
            kind,
            limit_turns,
            limit_tokens,
            auto_confirm,
            min_sharpe,
            stage_delay_ms,
        } => {
            let kind = JobKind::from(kind);
            let mut spec = JobSpec::new(kind, symbol, strategy);
            spec.limit_turns = limit_turns;
            spec.limit_tokens = limit_tokens;
            let executor = ScriptedExecutor::demo(kind, Duration::from_millis(stage_delay_ms));
            run_single(config, spec, executor, min_sharpe, auto_confirm).await
        }
        Command::Demo => run_demo(config).await,
    }
}

fn gate(min_sharpe: f64) -> ThresholdGate {
    ThresholdGate::new()
        .at_least("sharpe", min_sharpe)
        .at_most("max_drawdown", 0.25)
}

async fn run_single(
    config: RunledgerConfig,
    spec: JobSpec,
    executor: ScriptedExecutor,
    min_sharpe: f64,
    auto_confirm: bool,
) -> Result<()> {
    let registry = Arc::new(JobRegistry::new());
    let poll_config = config.polling.to_poll_config();
    let orch = JobOrchestrator::new(Arc::clone(&registry), executor, config).with_gate(gate(min_sharpe));

    let label = format!("{} {} {}", spec.kind, spec.symbol, spec.strategy);
    let (id, _driver) = orch.submit(spec)?;
    let progress = JobProgress::start(&label);

    let poller = JobPoller::new(registry, poll_config);
    let mut watch = poller.watch(id.clone());
    while let Some(event) = watch.next_event().await? {
        match event {
            PollEvent::Update(snapshot) => {
                progress.update(&snapshot);
                if snapshot.needs_confirm {
                    let approved = auto_confirm
                        || tokio::task::block_in_place(|| progress.ask_confirm(&snapshot))?;
                    if approved {
                        orch.spawn_confirm(id.clone());
                    } else {
                        orch.cancel(&id).await?;
                    }
                }
            }
            PollEvent::Finished(outcome) => {
                progress.complete(&outcome);
                let (PollOutcome::Completed(snapshot) | PollOutcome::Failed(snapshot)) = &outcome;
                progress.print_snapshot(snapshot);
            }
        }
    }
    Ok(())
}

/// One job of each kind against a shared registry, confirmations granted automatically.
async fn run_demo(config: RunledgerConfig) -> Result<()> {
    let registry = Arc::new(JobRegistry::new());
    let poll_config = config.polling.to_poll_config();
    let mut watchers = Vec::new();

    for (kind, symbol, strategy) in [
        (JobKind::AutoBacktest, "BTC-USDT-SWAP", "vegas"),
        (JobKind::LabRun, "ETH-USDT-SWAP", "squeeze"),
        (JobKind::ParamOptimization, "SOL-USDT-SWAP", "nwe"),
    ] {
        let executor = ScriptedExecutor::demo(kind, Duration::from_millis(300));
        let orch = JobOrchestrator::new(Arc::clone(&registry), executor, config.clone())
            .with_gate(gate(1.0));
        let (id, _driver) = orch.submit(JobSpec::new(kind, symbol, strategy))?;
        let poller = JobPoller::new(Arc::clone(&registry), poll_config.clone());

        watchers.push(tokio::spawn(async move {
            poller
                .watch_until_terminal(id.clone(), |snapshot| {
                    info!(job_id = %snapshot.id, status = %snapshot.status, step = ?snapshot.current_step, "update");
                    if snapshot.needs_confirm {
                        orch.spawn_confirm(id.clone());
                    }
                })
                .await
        }));
    }

    for watcher in watchers {
        match watcher.await? {
            Ok(PollOutcome::Completed(snapshot)) => info!(job_id = %snapshot.id, "completed"),
            Ok(PollOutcome::Failed(snapshot)) => warn!(job_id = %snapshot.id, failure = ?snapshot.failure, "failed"),
            Err(err) => warn!(%err, "watch aborted"),
        }
    }

    ui::print_history(&registry.list(&JobFilter::all()));
    Ok(())
}
