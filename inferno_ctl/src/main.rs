// Inferno-AoIP
// Copyright (C) 2023 Teodor Woźniak
// 
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
// 
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
// 
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

mod prompt;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use inferno_provision::health::{pretty, MONITOR_PORT};
use inferno_provision::monitor::{self, MonitorState};
use inferno_provision::pipe::{ensure_pipe, PipeOutcome};
use inferno_provision::supervisor::NOT_CONFIGURED;
use inferno_provision::{
  AssumeYes, Confirm, ControlReport, Defaults, HostRunner, InstallationConfig, Layout, MonitorClient, RawInputs,
  ServiceSupervisor, SystemRunner, Systemd, ThreadPause, TopologyController,
};

use prompt::Prompter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inferno Dante-to-SRT bridge management", long_about = None)]
struct Cli {
  /// Root of the managed filesystem
  #[arg(long, global = true, default_value = "/", hide = true)]
  sysroot: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Provision this host and install the service topology
  Install {
    /// Read answers from a TOML file instead of prompting
    #[arg(long)]
    config: Option<PathBuf>,
    /// Accept built-in defaults for every question
    #[arg(long, conflicts_with = "config")]
    defaults: bool,
    /// Answer yes to confirmation questions
    #[arg(long, short)]
    yes: bool,
  },
  /// Start all services
  Start,
  /// Stop all services
  Stop,
  /// Restart all services
  Restart,
  /// Show service status
  Status,
  /// Show recent log lines of every service
  Logs {
    #[arg(long, short = 'n', default_value_t = 20)]
    lines: usize,
  },
  /// Query the monitoring API
  Api,
  /// Check network, routing, sockets and health
  Test,
  /// Install the multicast route (run by inferno-routes.service)
  #[command(hide = true)]
  Routes,
  /// Create the audio pipe (run before the audio services start)
  #[command(hide = true)]
  EnsurePipe,
  /// Serve the monitoring API (run by inferno-api.service)
  #[command(hide = true)]
  Monitor,
}

/// Process exit status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
  Success,
  Failure,
}

impl From<Exit> for ExitCode {
  fn from(exit: Exit) -> Self {
    match exit {
      Exit::Success => ExitCode::SUCCESS,
      Exit::Failure => ExitCode::FAILURE,
    }
  }
}

fn block_on<F: Future>(future: F) -> std::io::Result<F::Output> {
  let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
  Ok(runtime.block_on(future))
}

fn control(layout: &Layout, systemd: &Systemd, pause: &ThreadPause, op: impl FnOnce(&ServiceSupervisor<'_>) -> ControlReport) -> Exit {
  match ServiceSupervisor::from_installation(layout, systemd, pause) {
    Ok(supervisor) => exit_with(&op(&supervisor)),
    Err(e) => {
      error!("{e}; run `inferno_ctl install` first");
      Exit::Failure
    }
  }
}

fn exit_with(report: &ControlReport) -> Exit {
  for (kind, outcome) in &report.entries {
    println!("{:<16} {outcome}", kind.unit_name());
  }
  if report.is_success() {
    Exit::Success
  } else {
    Exit::Failure
  }
}

fn load(layout: &Layout) -> Option<InstallationConfig> {
  match InstallationConfig::load(&layout.installation_config()) {
    Ok(config) => Some(config),
    Err(e) => {
      error!("{e}; run `inferno_ctl install` first");
      None
    }
  }
}

fn install(layout: &Layout, runner: &dyn HostRunner, config: Option<PathBuf>, defaults: bool, yes: bool) -> Exit {
  let defaults_table = Defaults::default();
  let prompter = Prompter::new(std::io::stdin().lock(), std::io::stdout());
  let inputs = match (config, defaults) {
    (Some(path), _) => RawInputs::from_file(&path),
    (None, true) => Ok(RawInputs::default()),
    (None, false) => prompter.collect(&defaults_table).map_err(Into::into),
  };
  let inputs = match inputs {
    Ok(inputs) => inputs,
    Err(e) => {
      error!("{e}");
      return Exit::Failure;
    }
  };
  let confirm: &dyn Confirm = if yes { &AssumeYes } else { &prompter };

  let systemd = Systemd::new(runner);
  let pause = ThreadPause;
  let mut controller = TopologyController::new(layout, runner, &systemd, &pause);
  match std::env::current_exe() {
    Ok(exe) => controller = controller.with_ctl_source(exe),
    Err(e) => warn!("cannot locate own executable: {e}"),
  }
  match controller.provision(&inputs, &defaults_table, confirm) {
    Ok(report) => {
      for warning in &report.warnings {
        warn!("{warning}");
      }
      info!("installation complete; units written: {}", report.units.len());
      if !report.config.srt.enabled {
        info!("SRT streaming disabled; re-run install to enable it");
      }
      Exit::Success
    }
    Err(e) if e.is_fatal() => {
      error!("installation aborted: {e}");
      Exit::Failure
    }
    Err(e) => {
      error!("installation stopped before services were set up: {e}");
      Exit::Failure
    }
  }
}

fn api(layout: &Layout) -> Exit {
  let Some(config) = load(layout) else { return Exit::Failure };
  let query = async {
    let client = MonitorClient::for_config(&config)?;
    client.get("/status").await
  };
  match block_on(query) {
    Ok(Ok((code, body))) => {
      println!("{}", pretty(&body));
      if (200..300).contains(&code) {
        Exit::Success
      } else {
        Exit::Failure
      }
    }
    Ok(Err(e)) => {
      error!("monitoring API at {}:{MONITOR_PORT} unreachable: {e}", config.network.dante_ip);
      Exit::Failure
    }
    Err(e) => {
      error!("cannot start runtime: {e}");
      Exit::Failure
    }
  }
}

fn self_test(layout: &Layout, runner: &dyn HostRunner) -> Exit {
  let Some(config) = load(layout) else { return Exit::Failure };
  let systemd = Systemd::new(runner);
  let pause = ThreadPause;
  let controller = TopologyController::new(layout, runner, &systemd, &pause);
  let report = match block_on(controller.verify(&config)) {
    Ok(report) => report,
    Err(e) => {
      error!("cannot start runtime: {e}");
      return Exit::Failure;
    }
  };
  println!("Dante interface {}: {}", report.dante_interface, report.dante_address.as_deref().unwrap_or("no IPv4 address"));
  println!("Multicast route via {}: {}", report.dante_interface, if report.multicast_route { "present" } else { "missing" });
  println!("Listening sockets:");
  if report.sockets.is_empty() {
    println!("  (none)");
  }
  for socket in &report.sockets {
    println!("  {socket}");
  }
  println!("Health: {:?}", report.health);
  println!("Overall: {}", if report.is_healthy() { "OK" } else { "problems found" });
  Exit::Success
}

async fn shutdown_signal() {
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut sig) => {
        sig.recv().await;
      }
      Err(e) => {
        warn!("cannot listen for SIGTERM: {e}");
        std::future::pending::<()>().await
      }
    }
  };
  tokio::select! {
    _ = tokio::signal::ctrl_c() => {},
    _ = terminate => {},
  }
}

fn serve_monitor(layout: &Layout) -> Exit {
  let Some(config) = load(layout) else { return Exit::Failure };
  let addr = SocketAddr::from((config.network.dante_ip, MONITOR_PORT));
  let state = Arc::new(MonitorState::new(config, layout.clone(), Arc::new(SystemRunner)));
  let served = block_on(async move {
    let listener = monitor::bind(addr).await?;
    monitor::serve(listener, state, shutdown_signal()).await
  });
  match served {
    Ok(Ok(())) => Exit::Success,
    Ok(Err(e)) => {
      error!("monitoring API on {addr}: {e}");
      Exit::Failure
    }
    Err(e) => {
      error!("cannot start runtime: {e}");
      Exit::Failure
    }
  }
}

/// Parsed command line, or the exit status when there is nothing to run.
fn parse_args<I, T>(args: I) -> Result<Cli, Exit>
where
  I: IntoIterator<Item = T>,
  T: Into<std::ffi::OsString> + Clone,
{
  match Cli::try_parse_from(args) {
    Ok(cli) => Ok(cli),
    Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
      let _ = e.print();
      Err(Exit::Success)
    }
    Err(e) => {
      let _ = e.print();
      Err(Exit::Failure)
    }
  }
}

fn run(cli: Cli, runner: &dyn HostRunner) -> Exit {
  let layout = Layout::with_sysroot(&cli.sysroot);
  let systemd = Systemd::new(runner);
  let pause = ThreadPause;

  match cli.command {
    Command::Install { config, defaults, yes } => install(&layout, runner, config, defaults, yes),
    Command::Start => control(&layout, &systemd, &pause, |s| s.start()),
    Command::Stop => control(&layout, &systemd, &pause, |s| s.stop()),
    Command::Restart => control(&layout, &systemd, &pause, |s| s.restart()),
    Command::Status => {
      let Some(config) = load(&layout) else { return Exit::Failure };
      let supervisor = ServiceSupervisor::new(config, &layout, &systemd, &pause);
      for status in supervisor.status() {
        println!("{:<16} {}", status.unit, status.state);
      }
      if !supervisor.config().srt.enabled {
        println!("(SRT streaming {NOT_CONFIGURED})");
      }
      Exit::Success
    }
    Command::Logs { lines } => {
      let Some(config) = load(&layout) else { return Exit::Failure };
      let supervisor = ServiceSupervisor::new(config, &layout, &systemd, &pause);
      for tail in supervisor.logs(lines) {
        println!("==> {} <==", tail.path.display());
        match tail.lines {
          Some(lines) => lines.iter().for_each(|l| println!("{l}")),
          None => println!("(no log yet)"),
        }
      }
      Exit::Success
    }
    Command::Api => api(&layout),
    Command::Test => self_test(&layout, runner),
    Command::Routes => {
      let Some(config) = load(&layout) else { return Exit::Failure };
      let controller = TopologyController::new(&layout, runner, &systemd, &pause);
      let report = controller.converge_routes(&config);
      println!("{}", report.route_table);
      if !report.is_clean() {
        warn!("multicast routing converged with {} error(s)", report.errors.len() + usize::from(report.timeout.is_some()));
      }
      Exit::Success
    }
    Command::EnsurePipe => match ensure_pipe(&layout.audio_pipe()) {
      Ok(PipeOutcome::Created) | Ok(PipeOutcome::AlreadyPresent) => Exit::Success,
      Err(e) => {
        error!("cannot create {}: {e}", layout.audio_pipe().display());
        Exit::Failure
      }
    },
    Command::Monitor => serve_monitor(&layout),
  }
}

fn main() -> ExitCode {
  let logenv = env_logger::Env::default().default_filter_or("info");
  env_logger::init_from_env(logenv);

  match parse_args(std::env::args_os()) {
    Ok(cli) => run(cli, &SystemRunner).into(),
    Err(exit) => exit.into(),
  }
}
