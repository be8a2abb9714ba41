use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::Colorize;
use uuid::Uuid;

use ledger_engine::api::DecisionRequest;

use ledger_engine::config::{ConfigManager, EngineConfig};
use ledger_engine::core::clock::{Clock, FixedClock, SystemClock};
use ledger_engine::core::scheduler;
use ledger_engine::core::services::{Continuation, OccurrenceOutcome};
use ledger_engine::core::utils::PathResolver;
use ledger_engine::ledger::Decision;
use ledger_engine::storage::JsonStorage;
use ledger_engine::utils::build_info;
use ledger_engine::{LedgerError, LedgerManager};

/// Operator console for the ledger engine.
#[derive(Parser, Debug)]
#[command(name = "ledger_engine_cli", about = "Inspect and operate a ledger engine data directory")]
struct Cli {
    /// Data directory (defaults to $LEDGER_ENGINE_HOME or ~/.ledger_engine)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Ledger name, overriding the configured one
    #[arg(long, global = true)]
    ledger: Option<String>,

    /// Pretend today is this date (YYYY-MM-DD)
    #[arg(long, global = true)]
    today: Option<NaiveDate>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the trial balance
    TrialBalance {
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// List accounts with their balances
    Accounts,
    /// Run every recurring entry that is due
    RunDue,
    /// List recurring definitions with an outstanding failure
    Failed,
    /// List approval requests awaiting a decision
    PendingApprovals,
    /// Approve or reject a pending approval request
    Decide {
        request_id: Uuid,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        reject: bool,
        #[arg(long)]
        comments: Option<String>,
    },
    /// Replay every account and report integrity problems
    Verify,
    /// Run the background scheduler for a number of ticks
    Scheduler {
        #[arg(long, default_value_t = 1)]
        ticks: u32,
        /// Milliseconds between ticks (defaults to the configured interval)
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Show build information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    ledger_engine::init();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), LedgerError> {
    if let Command::Version = cli.command {
        let info = build_info::current();
        println!("{}", info.summary());
        println!("rustc: {}", info.rustc);
        return Ok(());
    }

    let manager = Arc::new(open_manager(&cli)?);
    match cli.command {
        Command::TrialBalance { as_of } => print_trial_balance(&manager, as_of),
        Command::Accounts => {
            for account in manager.accounts() {
                let status = if account.active { "" } else { " (inactive)" };
                println!(
                    "{:<10} {:<30} {:>9} {:>14}{}",
                    account.code,
                    account.name,
                    account.nature.label(),
                    account.current_balance,
                    status.dimmed()
                );
            }
            Ok(())
        }
        Command::RunDue => {
            let report = manager.run_due()?;
            if report.outcomes.is_empty() {
                println!("{}", "Nothing due.".dimmed());
            }
            for outcome in &report.outcomes {
                print_outcome(outcome);
            }
            Ok(())
        }
        Command::Failed => {
            let failed = manager.failed_executions();
            if failed.is_empty() {
                println!("{}", "No failed recurring entries.".green());
            }
            for item in failed {
                let label = if item.exhausted {
                    "exhausted".red().bold()
                } else {
                    "retrying".yellow()
                };
                println!(
                    "{} {} on {} [{}/{}] {}: {}",
                    label,
                    item.name,
                    item.scheduled_date,
                    item.retry_count,
                    item.max_retries,
                    item.definition_id,
                    item.last_failure.unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::PendingApprovals => {
            let pending = manager.pending_approvals();
            if pending.is_empty() {
                println!("{}", "No pending approvals.".green());
            }
            for request in pending {
                println!(
                    "{} requested by {} at {} ({:?})",
                    request.id,
                    request.requested_by,
                    request.requested_at.format("%Y-%m-%d %H:%M"),
                    request.subject
                );
            }
            Ok(())
        }
        Command::Decide {
            request_id,
            approver,
            reject,
            comments,
        } => {
            let decision = if reject {
                Decision::Reject
            } else {
                Decision::Approve
            };
            let outcome =
                manager.decide(request_id, decision, DecisionRequest { approver, comments })?;
            println!(
                "{} {:?}: {}",
                outcome.request.id,
                outcome.request.status,
                describe_continuation(&outcome.continuation)
            );
            Ok(())
        }
        Command::Verify => {
            let report = manager.verify_integrity();
            for issue in &report.issues {
                println!("{} {}: {}", "[x]".red(), issue.code, issue.detail);
            }
            if report.is_clean() {
                println!(
                    "{} {} accounts, {} ledger rows reconcile",
                    "[ok]".green(),
                    report.accounts_checked,
                    report.rows_checked
                );
                Ok(())
            } else {
                Err(LedgerError::InvalidState(format!(
                    "{} account(s) failed integrity checks",
                    report.issues.len()
                )))
            }
        }
        Command::Scheduler { ticks, interval_ms } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| manager.config().scheduler_interval());
            let handle = scheduler::spawn(Arc::clone(&manager), interval);
            let ticks = ticks.max(1);
            std::thread::sleep(interval * (ticks - 1) + interval / 2);
            let ran = handle.stop();
            println!("Scheduler ran {} tick(s).", ran);
            Ok(())
        }
        Command::Version => Ok(()),
    }
}

fn open_manager(cli: &Cli) -> Result<LedgerManager, LedgerError> {
    let base = PathResolver::resolve_base(cli.data_dir.clone());
    let mut config: EngineConfig = ConfigManager::with_base_dir(base.clone())?.load()?;
    if let Some(name) = &cli.ledger {
        config.ledger_name = name.clone();
    }
    let storage = JsonStorage::new(Some(config.data_dir.clone().unwrap_or(base)))?;
    let clock: Arc<dyn Clock> = match cli.today {
        Some(date) => Arc::new(FixedClock::on(date)),
        None => Arc::new(SystemClock),
    };
    let manager = LedgerManager::open(Box::new(storage), config, clock)?;
    for warning in &manager.load_metadata().warnings {
        eprintln!("{} {}", "warning:".yellow(), warning);
    }
    Ok(manager)
}

fn print_trial_balance(manager: &LedgerManager, as_of: Option<NaiveDate>) -> Result<(), LedgerError> {
    let report = manager.trial_balance(as_of)?;
    println!("{}", format!("Trial balance as of {}", report.as_of).bold());
    for line in &report.lines {
        println!(
            "{:<10} {:<30} {:>14} {:>14}",
            line.code, line.name, line.debit, line.credit
        );
    }
    println!(
        "{:<41} {:>14} {:>14}",
        "Total", report.total_debits, report.total_credits
    );
    if report.balanced {
        println!("{}", "Balanced".green());
    } else {
        println!("{}", "NOT BALANCED".red().bold());
    }
    Ok(())
}

fn print_outcome(outcome: &OccurrenceOutcome) {
    match outcome {
        OccurrenceOutcome::Posted {
            definition_id,
            scheduled_date,
            entry_id,
        } => println!(
            "{} {} {} -> entry {}",
            "[posted]".green(),
            definition_id,
            scheduled_date,
            entry_id
        ),
        OccurrenceOutcome::AwaitingApproval {
            definition_id,
            scheduled_date,
            request_id,
        } => println!(
            "{} {} {} -> request {}",
            "[awaiting approval]".yellow(),
            definition_id,
            scheduled_date,
            request_id
        ),
        OccurrenceOutcome::Failed {
            definition_id,
            scheduled_date,
            reason,
            exhausted,
            ..
        } => {
            let label = if *exhausted { "[failed, exhausted]" } else { "[failed]" };
            println!("{} {} {}: {}", label.red(), definition_id, scheduled_date, reason)
        }
    }
}

fn describe_continuation(continuation: &Continuation) -> String {
    match continuation {
        Continuation::Posted { entry_id } => format!("posted {}", entry_id),
        Continuation::Executed { occurrence } => format!("{:?}", occurrence),
        Continuation::Terminated => "terminated".into(),
        Continuation::PostingFailed { reason } => format!("posting failed: {}", reason),
    }
}
