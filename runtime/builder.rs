// Copyright 2018-2025 the Deno authors. MIT license.

//! The dependency every worker-side notifier is built against: scratch
//! directory, debug flag, a cross-process lock and command spawning.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;

use spindle_core::error::Error;
use spindle_core::error::Result;

/// Cross-process advisory lock. `set` must be atomic between processes;
/// `reset` releases defensively (releasing an unheld key is a no-op).
pub trait Lock {
  fn set(&self, key: &str, nonblocking: bool) -> bool;
  fn reset(&self, key: &str, pid: u32);
}

#[derive(Clone, Debug, Default)]
pub struct CmdOptions {
  /// Redirect the child's stderr to `<tempdir>/<name>.err`.
  pub stderr_to: Option<String>,
}

pub trait Builder {
  fn tempdir(&self) -> &Path;
  fn pathname(&self) -> &Path;
  fn debug(&self) -> bool;
  fn lock(&self) -> &dyn Lock;
  /// Spawns `argv` asynchronously and returns the child pid; the caller
  /// owns reaping.
  fn run_cmd(&self, argv: &[String], opts: &CmdOptions) -> Result<u32>;
}

/// Lock keyed by `O_EXCL` files under a shared directory. Acquire and
/// release may happen on opposite sides of a fork — the semaphore
/// worker releases what its parent took — so the lock must live on the
/// filesystem; an in-process table would be copy-on-write-private to
/// the child and the parent would never see it released.
pub struct FileLock {
  dir: PathBuf,
}

impl FileLock {
  pub fn new(dir: &Path) -> FileLock {
    FileLock {
      dir: dir.to_path_buf(),
    }
  }

  fn key_path(&self, key: &str) -> PathBuf {
    self.dir.join(format!("{key}.lock"))
  }
}

impl Lock for FileLock {
  fn set(&self, key: &str, _nonblocking: bool) -> bool {
    match fs::OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(self.key_path(key))
    {
      Ok(mut file) => {
        let _ = write!(file, "{}", std::process::id());
        true
      }
      Err(_) => false,
    }
  }

  fn reset(&self, key: &str, pid: u32) {
    let path = self.key_path(key);
    if let Err(e) = fs::remove_file(&path) {
      log::debug!("lock reset {key} ({pid}): {e}");
    }
  }
}

pub struct StdBuilder {
  tempdir: PathBuf,
  pathname: PathBuf,
  debug: bool,
  lock: FileLock,
}

impl StdBuilder {
  pub fn new(debug: bool) -> StdBuilder {
    let tempdir = std::env::temp_dir();
    let pathname = std::env::current_exe()
      .unwrap_or_else(|_| PathBuf::from("spindle"));
    let lock = FileLock::new(&tempdir);
    StdBuilder {
      tempdir,
      pathname,
      debug,
      lock,
    }
  }

  pub fn with_tempdir(tempdir: &Path, debug: bool) -> StdBuilder {
    StdBuilder {
      tempdir: tempdir.to_path_buf(),
      pathname: std::env::current_exe()
        .unwrap_or_else(|_| PathBuf::from("spindle")),
      debug,
      lock: FileLock::new(tempdir),
    }
  }
}

impl Builder for StdBuilder {
  fn tempdir(&self) -> &Path {
    &self.tempdir
  }

  fn pathname(&self) -> &Path {
    &self.pathname
  }

  fn debug(&self) -> bool {
    self.debug
  }

  fn lock(&self) -> &dyn Lock {
    &self.lock
  }

  fn run_cmd(&self, argv: &[String], opts: &CmdOptions) -> Result<u32> {
    let (program, args) =
      argv.split_first().ok_or(Error::Unspecified("cmd"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(name) = &opts.stderr_to {
      let path = self.tempdir.join(format!("{name}.err"));
      cmd.stderr(Stdio::from(fs::File::create(path)?));
    }
    let child = cmd.spawn()?;
    let pid = child.id();
    log::debug!(
      "{}spawned '{program}' as {pid}",
      log_leader("builder", log::Level::Debug)
    );
    // The pid is reaped through the event loop's child watcher; the
    // handle itself is not waited on.
    drop(child);
    Ok(pid)
  }
}

/// Width of the log line key column.
pub const LOG_KEY_WIDTH: usize = 15;

/// Log line leader: the upper-cased notifier name left-padded to
/// `LOG_KEY_WIDTH` minus the level name's length, then the pid
/// zero-padded to five digits.
pub fn log_leader(name: &str, level: log::Level) -> String {
  let width = LOG_KEY_WIDTH.saturating_sub(level.as_str().len());
  let mut name = name.to_uppercase();
  name.truncate(width);
  format!("{name:>width$} [{:05}]: ", std::process::id())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn file_lock_set_is_exclusive_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    let lock = FileLock::new(dir.path());
    assert!(lock.set("job", true));
    assert!(!lock.set("job", true));
    lock.reset("job", std::process::id());
    assert!(lock.set("job", true));
  }

  #[test]
  fn log_leader_pads_for_the_level() {
    let leader = log_leader("worker", log::Level::Error);
    // "ERROR" is five chars, leaving ten columns for the name.
    assert!(leader.starts_with("    WORKER ["));
    assert!(leader.ends_with("]: "));
  }

  #[test]
  fn run_cmd_returns_a_live_pid() {
    let builder = StdBuilder::new(false);
    let pid = builder
      .run_cmd(
        &["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()],
        &CmdOptions::default(),
      )
      .unwrap();
    assert!(pid > 0);
    // Reap so the test process does not accumulate zombies.
    let _ = nix::sys::wait::waitpid(
      nix::unistd::Pid::from_raw(pid as i32),
      None,
    );
  }
}
