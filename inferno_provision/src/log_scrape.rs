//! Best-effort status extraction from the tails of the service logs.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

/// Offsets below this many nanoseconds count as synchronized.
pub const SYNC_THRESHOLD_NS: i64 = 100_000;

lazy_static! {
  static ref OFFSET: Regex = Regex::new(r"(?i)offset[:\s=]+(-?\d+)").unwrap();
  static ref SRT_URI: Regex = Regex::new(r#"(srt://[^\s'"]+)"#).unwrap();
  static ref BITRATE: Regex = Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*kbits?/s").unwrap();
  static ref PERCENT: Regex = Regex::new(r"(\d+(?:\.\d+)?)%").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PtpStatus {
  pub synchronized: bool,
  pub clock_offset_ns: i64,
  pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SrtStatus {
  pub connected: bool,
  pub destination: Option<String>,
  pub bitrate_kbps: f64,
  pub packet_loss_pct: f64,
}

/// Newest lines are at the end of `lines`.
pub fn ptp_status<S: AsRef<str>>(lines: &[S]) -> PtpStatus {
  let mut status = PtpStatus { state: "unknown".to_owned(), ..Default::default() };
  let mut offset_seen = false;
  let mut state_seen = false;
  for line in lines.iter().rev().map(AsRef::as_ref) {
    let lower = line.to_ascii_lowercase();
    if !offset_seen {
      if let Some(offset) = OFFSET.captures(line).and_then(|c| c[1].parse::<i64>().ok()) {
        status.clock_offset_ns = offset;
        status.synchronized = offset.abs() < SYNC_THRESHOLD_NS;
        offset_seen = true;
      }
    }
    if !state_seen && lower.contains("state") {
      if lower.contains("slave") || lower.contains("listening") {
        status.state = "slave".to_owned();
        state_seen = true;
      } else if lower.contains("master") {
        status.state = "master".to_owned();
        state_seen = true;
      }
    }
    if offset_seen && state_seen {
      break;
    }
  }
  status
}

pub fn srt_status<S: AsRef<str>>(lines: &[S]) -> SrtStatus {
  let mut status = SrtStatus::default();
  let (mut dest_seen, mut rate_seen, mut loss_seen) = (false, false, false);
  for line in lines.iter().rev().map(AsRef::as_ref) {
    let lower = line.to_ascii_lowercase();
    if !dest_seen {
      if let Some(c) = SRT_URI.captures(line) {
        status.destination = Some(c[1].to_owned());
        status.connected = !lower.contains("error") && !lower.contains("failed");
        dest_seen = true;
      }
    }
    if !rate_seen {
      if let Some(rate) = BITRATE.captures(line).and_then(|c| c[1].parse().ok()) {
        status.bitrate_kbps = rate;
        rate_seen = true;
      }
    }
    if !loss_seen && lower.contains("loss") {
      if let Some(loss) = PERCENT.captures(line).and_then(|c| c[1].parse().ok()) {
        status.packet_loss_pct = loss;
        loss_seen = true;
      }
    }
  }
  status
}
