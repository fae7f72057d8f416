//! The named pipe carrying PCM from `inferno2pipe` to the encoder.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
  Created,
  AlreadyPresent,
}

/// Creates the FIFO at `path` unless one is already there.
pub fn ensure_pipe(path: &Path) -> io::Result<PipeOutcome> {
  if let Some(dir) = path.parent() {
    fs::create_dir_all(dir)?;
  }
  let c_path = CString::new(path.as_os_str().as_bytes())
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pipe path contains NUL"))?;
  // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
  let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o660) };
  if rc == 0 {
    info!("created audio pipe {}", path.display());
    return Ok(PipeOutcome::Created);
  }
  let err = io::Error::last_os_error();
  if err.kind() != io::ErrorKind::AlreadyExists {
    return Err(err);
  }
  if fs::metadata(path)?.file_type().is_fifo() {
    Ok(PipeOutcome::AlreadyPresent)
  } else {
    Err(io::Error::new(
      io::ErrorKind::AlreadyExists,
      format!("{} exists but is not a FIFO", path.display()),
    ))
  }
}
