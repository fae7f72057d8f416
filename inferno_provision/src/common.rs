pub use log::{debug, error, info, warn};

pub trait LogAndForget {
  fn log_and_forget(&self);
}

impl<T, E: std::fmt::Display> LogAndForget for Result<T, E> {
  fn log_and_forget(&self) {
    if let Err(e) = self {
      warn!("continuing despite error: {e}");
    }
  }
}

/// Success/failure indicator printed after every provisioning stage.
pub fn report_stage<T, E: std::fmt::Display>(stage: &str, result: &Result<T, E>) {
  match result {
    Ok(_) => info!("✓ {stage}"),
    Err(e) => error!("✗ {stage}: {e}"),
  }
}
