//! HTTP monitoring service run by the `monitoring-api` unit.
//!
//! Exposes JSON status documents and a Prometheus text exposition built from
//! the service manager's view of the topology and from the service logs.

use std::fmt::Write as _;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::common::*;
use crate::config::InstallationConfig;
use crate::error::Result;
use crate::host::HostRunner;
use crate::layout::Layout;
use crate::log_scrape::{self, PtpStatus, SrtStatus};
use crate::supervisor::tail;
use crate::systemd::{ServiceManager, Systemd};
use crate::units::ServiceKind;

const SCRAPE_LINES: usize = 100;

pub struct MonitorState {
  pub config: InstallationConfig,
  pub layout: Layout,
  pub runner: Arc<dyn HostRunner>,
  started: Instant,
}

impl MonitorState {
  pub fn new(config: InstallationConfig, layout: Layout, runner: Arc<dyn HostRunner>) -> Self {
    Self { config, layout, runner, started: Instant::now() }
  }

  /// Services whose liveness decides overall health.
  fn watched(&self) -> Vec<ServiceKind> {
    let mut kinds = vec![ServiceKind::ClockSync, ServiceKind::AudioReceive];
    if self.config.srt.enabled {
      kinds.push(ServiceKind::StreamEncode);
    }
    kinds
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSample {
  pub unit: &'static str,
  pub running: bool,
  pub status: String,
  pub restart_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
  pub services: Vec<ServiceSample>,
  pub ptp: PtpStatus,
  pub srt: Option<SrtStatus>,
  pub api_uptime_seconds: u64,
}

impl Snapshot {
  pub fn healthy(&self) -> bool {
    self.services.iter().all(|s| s.running)
  }
}

fn log_lines(layout: &Layout, kind: ServiceKind) -> Vec<String> {
  let mut lines = tail(&kind.stderr_log(layout), SCRAPE_LINES).unwrap_or_default();
  lines.extend(tail(&kind.stdout_log(layout), SCRAPE_LINES).unwrap_or_default());
  lines
}

/// Blocking: queries the service manager and reads logs.
pub fn collect(state: &MonitorState) -> Snapshot {
  let systemd = Systemd::new(state.runner.as_ref());
  let services = state
    .watched()
    .into_iter()
    .map(|kind| {
      let status = systemd.active_state(kind.unit_name());
      ServiceSample {
        unit: kind.unit_name(),
        running: status == "active",
        status,
        restart_count: systemd.restart_count(kind.unit_name()).unwrap_or(0),
      }
    })
    .collect();
  Snapshot {
    services,
    ptp: log_scrape::ptp_status(&log_lines(&state.layout, ServiceKind::ClockSync)),
    srt: state
      .config
      .srt
      .enabled
      .then(|| log_scrape::srt_status(&log_lines(&state.layout, ServiceKind::StreamEncode))),
    api_uptime_seconds: state.started.elapsed().as_secs(),
  }
}

async fn snapshot(state: Arc<MonitorState>) -> Snapshot {
  let fallback = state.started.elapsed().as_secs();
  match tokio::task::spawn_blocking(move || collect(&state)).await {
    Ok(snapshot) => snapshot,
    Err(e) => {
      error!("status collection panicked: {e}");
      Snapshot { services: vec![], ptp: PtpStatus::default(), srt: None, api_uptime_seconds: fallback }
    }
  }
}

fn now() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn services_map(snapshot: &Snapshot) -> Value {
  Value::Object(snapshot.services.iter().map(|s| (s.unit.to_owned(), Value::Bool(s.running))).collect())
}

type Shared = State<Arc<MonitorState>>;

async fn index() -> Json<Value> {
  Json(json!({
    "name": "Inferno AoIP Monitor",
    "version": env!("CARGO_PKG_VERSION"),
    "status": "running",
    "endpoints": {
      "health": "/health",
      "status": "/status",
      "services": "/status/services",
      "ptp": "/ptp/status",
      "srt": "/srt/status",
      "network": "/network/status",
      "metrics": "/metrics",
    }
  }))
}

async fn health(State(state): Shared) -> Json<Value> {
  let snap = snapshot(state).await;
  Json(json!({ "healthy": snap.healthy(), "services": services_map(&snap), "timestamp": now() }))
}

async fn status(State(state): Shared) -> Json<Value> {
  let cfg = state.config.clone();
  let snap = snapshot(state).await;
  let srt = match &snap.srt {
    Some(srt) => json!({
      "connected": srt.connected,
      "destination": srt.destination.clone().unwrap_or_else(|| cfg.srt.destination_uri()),
    }),
    None => json!({ "enabled": false }),
  };
  Json(json!({
    "timestamp": now(),
    "api_uptime_seconds": snap.api_uptime_seconds,
    "services": services_map(&snap),
    "audio": {
      "rx_channels": cfg.inferno.rx_channels,
      "tx_channels": cfg.inferno.tx_channels,
      "sample_rate": cfg.inferno.sample_rate,
    },
    "ptp": { "synchronized": snap.ptp.synchronized, "clock_offset_ns": snap.ptp.clock_offset_ns },
    "srt": srt,
    "device": { "name": cfg.inferno.device_name, "dante_ip": cfg.network.dante_ip.to_string() },
  }))
}

async fn services_status(State(state): Shared) -> Json<Value> {
  let snap = snapshot(state).await;
  let services: serde_json::Map<String, Value> = snap
    .services
    .iter()
    .map(|s| (s.unit.to_owned(), json!({ "running": s.running, "restart_count": s.restart_count, "status": s.status })))
    .collect();
  Json(json!({ "timestamp": now(), "services": services }))
}

async fn ptp_status(State(state): Shared) -> Json<Value> {
  let snap = snapshot(state).await;
  Json(json!({
    "timestamp": now(),
    "synchronized": snap.ptp.synchronized,
    "clock_offset_ns": snap.ptp.clock_offset_ns,
    "state": snap.ptp.state,
  }))
}

async fn srt_status(State(state): Shared) -> Json<Value> {
  let srt_cfg = state.config.srt.clone();
  let snap = snapshot(state).await;
  let Some(srt) = snap.srt else {
    return Json(json!({ "timestamp": now(), "enabled": false }));
  };
  Json(json!({
    "timestamp": now(),
    "enabled": true,
    "connected": srt.connected,
    "destination": srt.destination.unwrap_or_else(|| srt_cfg.destination_uri()),
    "mode": srt_cfg.mode.to_string(),
    "bitrate_kbps": srt.bitrate_kbps,
    "packet_loss_pct": srt.packet_loss_pct,
    "latency_ms": srt_cfg.latency_ms,
  }))
}

async fn network_status(State(state): Shared) -> Json<Value> {
  let net = &state.config.network;
  Json(json!({
    "timestamp": now(),
    "dante_interface": net.dante_interface,
    "dante_ip": net.dante_ip.to_string(),
    "dante_cidr": net.dante_cidr,
    "internet_interface": net.internet_interface,
  }))
}

async fn metrics(State(state): Shared) -> impl IntoResponse {
  let snap = snapshot(state).await;
  ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], render_metrics(&snap))
}

fn metric_header(out: &mut String, name: &str, help: &str, kind: &str) {
  let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} {kind}");
}

/// Prometheus text exposition of a snapshot.
pub fn render_metrics(snap: &Snapshot) -> String {
  let mut out = String::new();
  metric_header(&mut out, "inferno_service_up", "Service is running (1=up, 0=down)", "gauge");
  for s in &snap.services {
    let _ = writeln!(out, "inferno_service_up{{service=\"{}\"}} {}", s.unit, u8::from(s.running));
  }
  metric_header(&mut out, "inferno_service_restarts", "Restarts recorded by the service manager", "gauge");
  for s in &snap.services {
    let _ = writeln!(out, "inferno_service_restarts{{service=\"{}\"}} {}", s.unit, s.restart_count);
  }
  metric_header(&mut out, "inferno_ptp_clock_offset_ns", "PTP clock offset in nanoseconds", "gauge");
  let _ = writeln!(out, "inferno_ptp_clock_offset_ns {}", snap.ptp.clock_offset_ns);
  metric_header(&mut out, "inferno_ptp_synchronized", "PTP is synchronized (1=synced, 0=not synced)", "gauge");
  let _ = writeln!(out, "inferno_ptp_synchronized {}", u8::from(snap.ptp.synchronized));
  if let Some(srt) = &snap.srt {
    metric_header(&mut out, "inferno_srt_connected", "SRT connection status (1=connected, 0=disconnected)", "gauge");
    let _ = writeln!(out, "inferno_srt_connected {}", u8::from(srt.connected));
    metric_header(&mut out, "inferno_srt_bitrate_kbps", "SRT streaming bitrate in kbps", "gauge");
    let _ = writeln!(out, "inferno_srt_bitrate_kbps {}", srt.bitrate_kbps);
    metric_header(&mut out, "inferno_srt_packet_loss_pct", "SRT packet loss percentage", "gauge");
    let _ = writeln!(out, "inferno_srt_packet_loss_pct {}", srt.packet_loss_pct);
  }
  metric_header(&mut out, "inferno_api_uptime_seconds", "API uptime in seconds", "gauge");
  let _ = writeln!(out, "inferno_api_uptime_seconds {}", snap.api_uptime_seconds);
  out
}

pub fn router(state: Arc<MonitorState>) -> Router {
  Router::new()
    .route("/", get(index))
    .route("/health", get(health))
    .route("/status", get(status))
    .route("/status/services", get(services_status))
    .route("/ptp/status", get(ptp_status))
    .route("/srt/status", get(srt_status))
    .route("/network/status", get(network_status))
    .route("/metrics", get(metrics))
    .with_state(state)
}

pub async fn serve(listener: TcpListener, state: Arc<MonitorState>, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
  info!("monitoring API listening on {}", listener.local_addr()?);
  axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await?;
  info!("monitoring API stopped");
  Ok(())
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
  Ok(TcpListener::bind(addr).await?)
}
