// Copyright 2018-2025 the Deno authors. MIT license.

use std::io;
use std::path::PathBuf;
use std::rc::Rc;

/// Errors surfaced by the core notifier machinery.
///
/// Syscall failures inside the dispatcher are classified with
/// [`is_nonfatal`]; non-fatal ones re-arm the watcher, fatal ones close the
/// offending endpoint and are routed through the owning notifier's error
/// callback.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("Missing required parameter '{0}'")]
  Unspecified(&'static str),
  #[error("String '{0}' contains possibly unsafe characters")]
  Tainted(String),
  #[error("Notifier id '{kind}/{name}' is not unique")]
  NotifierIdNotUnique { kind: &'static str, name: String },
  #[error(transparent)]
  Io(#[from] io::Error),
  #[error("Stream is closing")]
  StreamClosing,
  #[error("Encoding '{0}' unknown")]
  EncodingUnknown(String),
  #[error("Failed to create watcher for '{}': {message}", .path.display())]
  WatcherCreateFailed { path: PathBuf, message: String },
  #[error("Event '{0}' unknown")]
  EventUnknown(&'static str),
  #[error("Codec error: {0}")]
  Codec(String),
}

impl From<nix::Error> for Error {
  fn from(errno: nix::Error) -> Self {
    Error::Io(io::Error::from_raw_os_error(errno as i32))
  }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors delivered through promises are shared between the promise's
/// observers and the notifier that adopted it.
pub type SharedError = Rc<Error>;

/// EAGAIN, EWOULDBLOCK and EINTR re-arm instead of tearing anything down.
pub fn is_nonfatal(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
  )
}

pub fn is_interrupted(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::Interrupted
}

pub fn is_wouldblock(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::WouldBlock
}

pub fn is_broken_pipe(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::BrokenPipe
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifies_nonfatal_errnos() {
    for kind in [io::ErrorKind::WouldBlock, io::ErrorKind::Interrupted] {
      assert!(is_nonfatal(&io::Error::from(kind)));
    }
    assert!(!is_nonfatal(&io::Error::from(io::ErrorKind::BrokenPipe)));
  }

  #[test]
  fn errno_converts_to_io() {
    let err = Error::from(nix::Error::EPIPE);
    match err {
      Error::Io(io) => assert!(is_broken_pipe(&io)),
      other => panic!("expected io error, got {other}"),
    }
  }
}
