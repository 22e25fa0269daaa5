//! Local dev-server orchestrator.
//!
//! Runs an app's dev server behind a preview proxy, reports the errors it prints and can
//! hand them to an agent CLI for a bounded number of repair attempts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use appvisor::core::types::{AppSpec, AppState, FixStatus, OutputStream};
use appvisor::error::OrchestratorError;
use appvisor::events::{FixProgressStatus, RuntimeEvent};
use appvisor::exit_codes;
use appvisor::host::Host;
use appvisor::io::config::{AppvisorConfig, DEFAULT_CONFIG_PATH, load_config, write_config};
use appvisor::logging;
use appvisor::terminal::describe_outcome;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(
    name = "appvisor",
    version,
    about = "Run, proxy and auto-fix local web app dev servers"
)]
struct Cli {
    /// Config file (TOML). Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct AppArgs {
    /// Stable identifier for the app.
    #[arg(long)]
    app_id: String,
    /// Display name; defaults to the id.
    #[arg(long)]
    name: Option<String>,
    /// Project root containing the dev server.
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

impl AppArgs {
    fn spec(&self) -> Result<AppSpec> {
        let root = std::fs::canonicalize(&self.root)
            .with_context(|| format!("resolve {}", self.root.display()))?;
        let name = self.name.clone().unwrap_or_else(|| self.app_id.clone());
        Ok(AppSpec::new(&self.app_id, name, root))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the dev server in the foreground until Ctrl-C.
    Run(AppArgs),
    /// Run the dev server, then let the agent repair the errors it reports.
    Fix(AppArgs),
    /// Run the dev server and print its settled error report as JSON.
    Report(AppArgs),
    /// Write the default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init("warn");
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Command::InitConfig { force } => cmd_init_config(&cli.config, force),
            Command::Run(args) => cmd_run(load_config(&cli.config)?, &args.spec()?).await,
            Command::Fix(args) => cmd_fix(load_config(&cli.config)?, &args.spec()?).await,
            Command::Report(args) => cmd_report(load_config(&cli.config)?, &args.spec()?).await,
        }
    })
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &AppvisorConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

async fn cmd_run(config: AppvisorConfig, spec: &AppSpec) -> Result<i32> {
    let host = Host::new(config)?;
    let printer = tokio::spawn(print_events(host.clone(), spec.id.clone()));
    let mut crashes = host.bus().subscribe();

    let code = match host.run_app(spec).await {
        Ok(url) => {
            println!("preview: {url}");
            let app_id = spec.id.clone();
            let crashed = async move {
                loop {
                    match crashes.recv().await {
                        Ok(RuntimeEvent::StateChanged { app_id: id, state, .. })
                            if id == app_id && state == AppState::Crashed =>
                        {
                            return;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => std::future::pending::<()>().await,
                    }
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => exit_codes::OK,
                () = crashed => exit_codes::CRASHED,
            }
        }
        Err(err) => report_failure(&err),
    };

    host.shutdown().await;
    printer.abort();
    Ok(code)
}

async fn cmd_report(config: AppvisorConfig, spec: &AppSpec) -> Result<i32> {
    let settle = settle_time(&config);
    let host = Host::new(config)?;
    let started = host.run_app(spec).await;
    if let Err(err) = &started {
        report_failure(err);
    }
    tokio::time::sleep(settle).await;

    let report = host.report(&spec.id);
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize report")?
    );
    host.shutdown().await;
    Ok(match started {
        Err(err) => failure_code(&err),
        Ok(_) if report.has_errors => exit_codes::ERRORS_REMAIN,
        Ok(_) => exit_codes::OK,
    })
}

async fn cmd_fix(config: AppvisorConfig, spec: &AppSpec) -> Result<i32> {
    let settle = settle_time(&config);
    let host = Host::new(config)?;
    let printer = tokio::spawn(print_events(host.clone(), spec.id.clone()));
    match host.run_app(spec).await {
        Ok(url) => println!("preview: {url}"),
        // A crashed server is still worth repairing; the loop restarts it.
        Err(err) => {
            report_failure(&err);
        }
    }
    tokio::time::sleep(settle).await;

    let outcome = host.fix(&spec.id).await;
    host.shutdown().await;
    printer.abort();

    let outcome = outcome?;
    print!("{}", describe_outcome(&outcome));
    Ok(match outcome.status {
        FixStatus::Fixed => exit_codes::OK,
        FixStatus::Exhausted => exit_codes::ERRORS_REMAIN,
        FixStatus::Cancelled => exit_codes::FAILED,
    })
}

fn settle_time(config: &AppvisorConfig) -> Duration {
    config.debounce() + Duration::from_millis(config.fix.settle_ms)
}

fn report_failure(err: &OrchestratorError) -> i32 {
    eprintln!("appvisor: {err}");
    failure_code(err)
}

fn failure_code(err: &OrchestratorError) -> i32 {
    match err {
        OrchestratorError::ProcessCrashed { .. } | OrchestratorError::ReadyTimeout { .. } => {
            exit_codes::CRASHED
        }
        _ => exit_codes::FAILED,
    }
}

/// Mirror the app's output and fix progress onto the console.
async fn print_events(host: Arc<Host>, app_id: String) {
    let mut rx = host.bus().subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                eprintln!("[appvisor] skipped {skipped} events");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        if event.app_id() != app_id {
            continue;
        }
        match event {
            RuntimeEvent::Output(record) => match record.stream {
                OutputStream::Stdout => println!("{}", record.message),
                OutputStream::Stderr => eprintln!("{}", record.message),
            },
            RuntimeEvent::ProxyReady {
                proxy_url,
                original_url,
                ..
            } => eprintln!("[appvisor] proxy {proxy_url} -> {original_url}"),
            RuntimeEvent::FixProgress {
                attempt, status, ..
            } => match status {
                FixProgressStatus::Prompting => eprintln!("[appvisor] attempt {attempt}: asking agent"),
                FixProgressStatus::Applying { edits } => {
                    eprintln!("[appvisor] attempt {attempt}: applying {edits} edit(s)");
                }
                FixProgressStatus::Verifying => {
                    eprintln!("[appvisor] attempt {attempt}: waiting for a fresh report");
                }
                FixProgressStatus::AttemptFailed { error } => {
                    eprintln!("[appvisor] attempt {attempt} failed: {error}");
                }
                FixProgressStatus::Finished { .. } => {}
            },
            RuntimeEvent::StateChanged { .. } | RuntimeEvent::ReportUpdated { .. } => {}
        }
    }
}
