// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! The `syncpoint` command: Primary-side publisher and DR-side consumer.

use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use syncpoint_core::RestorePointName;
use syncpoint_service::{
    cluster::ClusterConnector,
    config::SyncConfig,
    consumer::{run_consumer_daemon, Consumer, ConsumerOutcome},
    error::{ConsumeError, SelectError, ServiceError},
    publisher::{run_publisher_daemon, Publisher},
    receipts::list_receipts,
    service::{pid_status, stop_daemon, write_pid, PidStatus},
    sql::PsqlRunner,
    status::{collect, render, StatusFormat, StatusMode},
    utils::init_tracing_subscriber,
};

const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_TARGET_UNAVAILABLE: u8 = 3;
const EXIT_VALIDATION_FAILED: u8 = 4;

/// Deterministic DR synchronization to named restore points.
#[derive(Debug, Parser)]
#[clap(rename_all = "kebab-case", name = "syncpoint", version)]
struct Cli {
    /// Path to the JSON configuration document.
    #[clap(long, global = true, default_value = "syncpoint.json")]
    config: PathBuf,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Primary-side restore-point publisher.
    Primary {
        #[command(subcommand)]
        command: PrimaryCommand,
    },
    /// DR-side manifest consumer.
    Dr {
        #[command(subcommand)]
        command: DrCommand,
    },
}

#[derive(Debug, Subcommand)]
enum PrimaryCommand {
    /// Run the publisher.
    Run {
        /// Publish one manifest and exit.
        #[clap(long)]
        once: bool,
        /// Skip the cluster-wide WAL switch after the restore point.
        #[clap(long)]
        no_gp_switch_wal: bool,
    },
    /// Stop the publisher daemon.
    Stop,
    /// Show the publisher daemon's pidfile status.
    PidStatus,
    /// Show publisher-side state.
    Status(StatusArgs),
    /// Tail the newest receipt.
    Logs(LogsArgs),
}

#[derive(Debug, Subcommand)]
enum DrCommand {
    /// Run the consumer.
    Run {
        /// Run one cycle and exit.
        #[clap(long)]
        once: bool,
        /// Drive to this restore point instead of the safest-forward
        /// choice; a floor violation becomes a hard error.
        #[clap(long)]
        target: Option<RestorePointName>,
    },
    /// Stop the consumer daemon.
    Stop,
    /// Show the consumer daemon's pidfile status.
    PidStatus,
    /// Show DR-side state.
    Status(StatusArgs),
    /// Tail the newest receipt.
    Logs(LogsArgs),
}

#[derive(Debug, Args)]
struct StatusArgs {
    /// Output format.
    #[clap(long, value_enum, default_value_t = StatusFormat::Table)]
    format: StatusFormat,
    /// Include recent receipts.
    #[clap(long)]
    include_history: bool,
}

#[derive(Debug, Args)]
struct LogsArgs {
    /// Lines to print from the newest receipt.
    #[clap(long, default_value_t = 50)]
    n: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(error) = init_tracing_subscriber() {
        eprintln!("failed to initialize logging: {error}");
        return ExitCode::from(EXIT_FAILURE);
    }

    let config = match SyncConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let code = match cli.mode {
        Mode::Primary { command } => run_primary(&config, command).await,
        Mode::Dr { command } => run_dr(&config, command).await,
    };
    ExitCode::from(code)
}

/// A token that trips on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(error) => {
                tracing::error!(%error, "cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown requested");
        trip.cancel();
    });
    cancel
}

async fn run_primary(config: &SyncConfig, command: PrimaryCommand) -> u8 {
    let role = "primary";
    match command {
        PrimaryCommand::Run {
            once,
            no_gp_switch_wal,
        } => {
            let sql = PsqlRunner::coordinator(
                &config.primary.host,
                config.primary.port,
                &config.primary.user,
                &config.primary.db,
            );
            if once {
                match Publisher::new(config, &sql).publish_once(no_gp_switch_wal).await {
                    Ok(_) => EXIT_OK,
                    Err(error) => {
                        tracing::error!(%error, "publish failed");
                        EXIT_FAILURE
                    }
                }
            } else {
                let guard = match write_pid(&config.pid_file(role), role) {
                    Ok(guard) => guard,
                    Err(error) => return report_service_error(error),
                };
                run_publisher_daemon(config, &sql, no_gp_switch_wal, shutdown_token()).await;
                drop(guard);
                EXIT_OK
            }
        }
        PrimaryCommand::Stop => stop(config, role),
        PrimaryCommand::PidStatus => print_pid_status(config, role),
        PrimaryCommand::Status(args) => {
            print_status(config, StatusMode::Primary, args).await;
            EXIT_OK
        }
        PrimaryCommand::Logs(args) => {
            tail_newest_receipt(config, args.n);
            EXIT_OK
        }
    }
}

async fn run_dr(config: &SyncConfig, command: DrCommand) -> u8 {
    let role = "dr";
    match command {
        DrCommand::Run { once, target } => {
            let connector =
                ClusterConnector::new(&config.primary.user, &config.primary.db);
            if once {
                let cancel = shutdown_token();
                match Consumer::new(config, &connector)
                    .run_once(target.as_ref(), &cancel)
                    .await
                {
                    Ok(ConsumerOutcome::Completed { advanced: true, .. }) => EXIT_OK,
                    Ok(ConsumerOutcome::Completed {
                        advanced: false, ..
                    }) => EXIT_VALIDATION_FAILED,
                    Ok(ConsumerOutcome::AlreadyAtTarget(_)) => EXIT_OK,
                    Ok(ConsumerOutcome::NoCandidate { .. }) => {
                        if target.is_some() {
                            EXIT_TARGET_UNAVAILABLE
                        } else {
                            EXIT_OK
                        }
                    }
                    Err(error) => consume_error_code(error),
                }
            } else {
                if target.is_some() {
                    tracing::error!("--target requires --once");
                    return EXIT_CONFIG;
                }
                let guard = match write_pid(&config.pid_file(role), role) {
                    Ok(guard) => guard,
                    Err(error) => return report_service_error(error),
                };
                run_consumer_daemon(config, &connector, shutdown_token()).await;
                drop(guard);
                EXIT_OK
            }
        }
        DrCommand::Stop => stop(config, role),
        DrCommand::PidStatus => print_pid_status(config, role),
        DrCommand::Status(args) => {
            print_status(config, StatusMode::Dr, args).await;
            EXIT_OK
        }
        DrCommand::Logs(args) => {
            tail_newest_receipt(config, args.n);
            EXIT_OK
        }
    }
}

fn consume_error_code(error: ConsumeError) -> u8 {
    match &error {
        ConsumeError::Select(
            SelectError::TargetUnavailable(_) | SelectError::TargetBelowFloor { .. },
        ) => {
            tracing::error!(%error, "target not available");
            EXIT_TARGET_UNAVAILABLE
        }
        _ => {
            tracing::error!(%error, "consumer run failed");
            EXIT_FAILURE
        }
    }
}

fn report_service_error(error: ServiceError) -> u8 {
    tracing::error!(%error, "daemon start refused");
    EXIT_FAILURE
}

fn stop(config: &SyncConfig, role: &str) -> u8 {
    match stop_daemon(&config.pid_file(role), role) {
        Ok(PidStatus::Stopped) => {
            println!("[{role}] no pidfile");
            EXIT_OK
        }
        Ok(PidStatus::Stale(pid)) => {
            println!("[{role}] pid {pid} not running; cleaned pidfile");
            EXIT_OK
        }
        Ok(PidStatus::Running(pid)) => {
            println!("[{role}] sent SIGTERM to pid={pid}");
            EXIT_OK
        }
        Err(error) => {
            tracing::error!(%error, "stop failed");
            EXIT_FAILURE
        }
    }
}

fn print_pid_status(config: &SyncConfig, role: &str) -> u8 {
    match pid_status(&config.pid_file(role)) {
        PidStatus::Running(pid) => println!("[{role}] RUNNING pid={pid}"),
        PidStatus::Stale(pid) => println!("[{role}] STOPPED (stale pidfile pid={pid})"),
        PidStatus::Stopped => println!("[{role}] STOPPED (no pidfile)"),
    }
    EXIT_OK
}

async fn print_status(config: &SyncConfig, mode: StatusMode, args: StatusArgs) {
    let (snapshot, history) = collect(config, mode, 10).await;
    print!(
        "{}",
        render(&snapshot, &history, args.format, args.include_history)
    );
}

fn tail_newest_receipt(config: &SyncConfig, n: usize) {
    let receipts = list_receipts(&config.dr.receipts_dir);
    let Some(newest) = receipts.first() else {
        println!("no receipts yet");
        return;
    };
    println!("tailing newest receipt: {}", newest.display());
    match std::fs::read_to_string(newest) {
        Ok(text) => {
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(n);
            for line in &lines[start..] {
                println!("{line}");
            }
        }
        Err(error) => println!("receipt not readable: {error}"),
    }
}
