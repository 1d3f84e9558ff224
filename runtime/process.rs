// Copyright 2018-2025 the Deno authors. MIT license.

//! A child process notifier.
//!
//! The child's code is a closure run in a `fork`ed child, an argv, or a
//! shell string; the latter two go through the builder's `run_cmd`. The
//! pid stays 0 until `start`, liveness is probed with signal 0 and exits
//! are observed through the loop's child watcher.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::unistd::fork;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use spindle_core::error::Result;
use spindle_core::notifier::NotifierCore;
use spindle_core::EventLoop;

use crate::builder::Builder;
use crate::builder::CmdOptions;

pub enum ChildCode {
  /// Runs in a forked child; the child exits when it returns.
  Run(Box<dyn FnOnce()>),
  Argv(Vec<String>),
  Shell(String),
}

pub type ExitHandler = Box<dyn FnMut(u32, i32)>;

pub struct Process {
  core: NotifierCore,
  builder: Rc<dyn Builder>,
  code: RefCell<Option<ChildCode>>,
  pid: Cell<u32>,
  on_exit: RefCell<Option<ExitHandler>>,
}

impl Process {
  pub fn new(
    builder: Rc<dyn Builder>,
    name: &str,
    code: ChildCode,
  ) -> Result<Rc<Process>> {
    let el = EventLoop::current()?;
    let core = NotifierCore::new("process", name, &el)?;
    Ok(Rc::new(Process {
      core,
      builder,
      code: RefCell::new(Some(code)),
      pid: Cell::new(0),
      on_exit: RefCell::new(None),
    }))
  }

  pub fn core(&self) -> &NotifierCore {
    &self.core
  }

  /// 0 until started.
  pub fn pid(&self) -> u32 {
    self.pid.get()
  }

  pub fn set_on_exit(&self, cb: ExitHandler) {
    *self.on_exit.borrow_mut() = Some(cb);
  }

  pub fn is_running(&self) -> bool {
    let pid = self.pid.get();
    pid != 0 && kill(Pid::from_raw(pid as i32), None).is_ok()
  }

  /// Idempotent; the second call is a no-op.
  pub fn start(self: &Rc<Self>) -> Result<()> {
    if self.pid.get() != 0 {
      return Ok(());
    }
    let Some(code) = self.code.borrow_mut().take() else {
      return Ok(());
    };
    let debug = self.builder.debug();
    let pid = match code {
      ChildCode::Run(run) => {
        let name = self.core.name().to_string();
        let tempdir = self.builder.tempdir().to_path_buf();
        // SAFETY: single-threaded cooperative model; the child only runs
        // the provided closure and exits.
        match unsafe { fork() }? {
          ForkResult::Child => {
            child_shim(&name, debug.then_some(tempdir.as_path()));
            run();
            std::process::exit(0);
          }
          ForkResult::Parent { child } => child.as_raw() as u32,
        }
      }
      ChildCode::Argv(argv) => self.run_via_builder(argv, debug)?,
      ChildCode::Shell(cmd) => self.run_via_builder(
        vec!["/bin/sh".to_string(), "-c".to_string(), cmd],
        debug,
      )?,
    };
    self.pid.set(pid);
    log::info!("{}started child {pid}", self.core.leader());
    let el = self.core.event_loop()?;
    let weak = Rc::downgrade(self);
    let leader = self.core.leader();
    el.watch_child(
      pid,
      Some(Box::new(move |pid, status| {
        log::info!("{leader}child {pid} exited with {status}");
        if let Some(this) = weak.upgrade() {
          let cb = this.on_exit.borrow_mut().take();
          if let Some(mut cb) = cb {
            cb(pid, status);
            *this.on_exit.borrow_mut() = Some(cb);
          }
        }
      })),
    )?;
    Ok(())
  }

  fn run_via_builder(&self, argv: Vec<String>, debug: bool) -> Result<u32> {
    let opts = CmdOptions {
      stderr_to: debug.then(|| self.core.name().to_string()),
    };
    self.builder.run_cmd(&argv, &opts)
  }

  pub fn stop(&self) {
    let pid = self.pid.get();
    if pid == 0 {
      return;
    }
    log::info!("{}stopping child {pid}", self.core.leader());
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
      log::debug!("{}kill {pid}: {e}", self.core.leader());
    }
  }
}

/// Runs first in a forked child: renames the visible process title and,
/// in debug builds of the tree, points stderr at `<tempdir>/<name>.err`.
fn child_shim(name: &str, debug_dir: Option<&std::path::Path>) {
  #[cfg(target_os = "linux")]
  {
    if let Ok(title) = std::ffi::CString::new(name) {
      let _ = nix::sys::prctl::set_name(&title);
    }
  }
  if let Some(dir) = debug_dir {
    let path = dir.join(format!("{name}.err"));
    if let Ok(file) = std::fs::File::create(path) {
      use std::os::fd::AsRawFd;
      let _ = nix::unistd::dup2(file.as_raw_fd(), libc::STDERR_FILENO);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;
  use std::time::Instant;

  use super::*;
  use crate::builder::StdBuilder;

  fn builder() -> Rc<dyn Builder> {
    Rc::new(StdBuilder::new(false))
  }

  #[test]
  fn pid_is_zero_until_started() {
    let p = Process::new(
      builder(),
      "proc-idle",
      ChildCode::Shell("exit 0".to_string()),
    )
    .unwrap();
    assert_eq!(p.pid(), 0);
    assert!(!p.is_running());
  }

  #[test]
  fn forked_closure_child_exits_and_reports_status() {
    let el = EventLoop::current().unwrap();
    let p = Process::new(
      builder(),
      "proc-fork",
      ChildCode::Run(Box::new(|| std::process::exit(3))),
    )
    .unwrap();
    let status = Rc::new(Cell::new(None));
    {
      let status = Rc::clone(&status);
      p.set_on_exit(Box::new(move |_pid, rv| status.set(Some(rv))));
    }
    p.start().unwrap();
    assert!(p.pid() > 0);
    p.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while status.get().is_none() && Instant::now() < deadline {
      el.once_timeout(0.01, || {});
    }
    assert_eq!(status.get(), Some(3));
  }

  #[test]
  fn stop_terminates_a_sleeping_child() {
    let el = EventLoop::current().unwrap();
    let p = Process::new(
      builder(),
      "proc-term",
      ChildCode::Shell("sleep 30".to_string()),
    )
    .unwrap();
    let status = Rc::new(Cell::new(None));
    {
      let status = Rc::clone(&status);
      p.set_on_exit(Box::new(move |_pid, rv| status.set(Some(rv))));
    }
    p.start().unwrap();
    assert!(p.is_running());
    p.stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    while status.get().is_none() && Instant::now() < deadline {
      el.once_timeout(0.01, || {});
    }
    assert_eq!(status.get(), Some(128 + Signal::SIGTERM as i32));
  }
}
