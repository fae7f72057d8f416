use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  #[error("invalid value for {field}: {reason}")]
  Validation { field: &'static str, reason: String },

  #[error("external binary {binary} is missing at {}", .path.display())]
  Download { binary: String, path: PathBuf },

  #[error("network provisioning: {0}")]
  NetworkProvision(String),

  #[error("interfaces did not appear in time: {}", .interfaces.join(", "))]
  RouteTimeout { interfaces: Vec<String> },

  #[error("{action} of {unit} rejected by service manager: {detail}")]
  ServiceControl { unit: String, action: &'static str, detail: String },

  #[error("host command `{command}` failed: {detail}")]
  HostCommand { command: String, detail: String },

  #[error("precondition failed: {0}")]
  Precondition(String),

  #[error("cannot parse {}: {source}", .path.display())]
  ConfigParse { path: PathBuf, #[source] source: toml::de::Error },

  #[error("cannot serialize configuration: {0}")]
  ConfigWrite(#[from] toml::ser::Error),

  #[error("HTTP request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("I/O error: {0}")]
  Io(#[from] io::Error),
}

impl Error {
  pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
    Self::Validation { field, reason: reason.into() }
  }

  /// Fatal classes end a provisioning run with a non-zero exit status.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      Self::Validation { .. } | Self::Download { .. } | Self::Precondition(_) | Self::ConfigParse { .. }
    )
  }
}
