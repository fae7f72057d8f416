//! Client side of the monitoring API, used by `api`, `test` and the health check.

use std::net::Ipv4Addr;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::config::InstallationConfig;
use crate::error::Result;

pub const MONITOR_PORT: u16 = 8080;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum Health {
  Healthy,
  /// The API answered but reported unhealthy services.
  Degraded(Value),
  /// No usable answer.
  Unhealthy(String),
}

impl Health {
  pub fn is_healthy(&self) -> bool {
    matches!(self, Self::Healthy)
  }
}

pub struct MonitorClient {
  base: String,
  client: Client,
}

impl MonitorClient {
  pub fn new(addr: Ipv4Addr, port: u16, timeout: Duration) -> Result<Self> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self { base: format!("http://{addr}:{port}"), client })
  }

  pub fn for_config(config: &InstallationConfig) -> Result<Self> {
    Self::new(config.network.dante_ip, MONITOR_PORT, REQUEST_TIMEOUT)
  }

  /// Status code and body of `GET <path>`.
  pub async fn get(&self, path: &str) -> Result<(u16, String)> {
    let response = self.client.get(format!("{}{path}", self.base)).send().await?;
    let status = response.status().as_u16();
    Ok((status, response.text().await?))
  }

  pub async fn health(&self) -> Health {
    let (status, body) = match self.get("/health").await {
      Ok(v) => v,
      Err(e) => return Health::Unhealthy(e.to_string()),
    };
    if !(200..300).contains(&status) {
      return Health::Unhealthy(format!("HTTP {status}"));
    }
    match serde_json::from_str::<Value>(&body) {
      Ok(json) if json.get("healthy").and_then(Value::as_bool) == Some(true) => Health::Healthy,
      Ok(json) => Health::Degraded(json),
      Err(_) => Health::Unhealthy("health endpoint did not return JSON".to_owned()),
    }
  }
}

/// Pretty-prints JSON bodies, passes anything else through.
pub fn pretty(body: &str) -> String {
  serde_json::from_str::<Value>(body)
    .ok()
    .and_then(|v| serde_json::to_string_pretty(&v).ok())
    .unwrap_or_else(|| body.to_owned())
}
