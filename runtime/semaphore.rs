// Copyright 2018-2025 the Deno authors. MIT license.

//! A routine specialised to coalesce repeated raises.
//!
//! `raise` only dispatches a call when the builder lock for this
//! semaphore's identity is free; while the worker still holds the lock,
//! further raises return without side effect. The worker-side handler
//! wrapper releases the lock (keyed by identity and caller pid) after
//! the real handler ran, so at most one call is outstanding per
//! identity.

use std::rc::Rc;

use spindle_core::error::Result;

use crate::builder::Builder;
use crate::builder::FileLock;
use crate::builder::Lock;
use crate::routine::ComputeHandler;
use crate::routine::Routine;
use crate::routine::RoutineOptions;

/// `(identity, caller pid)` — the record a raise sends to the worker.
pub type SemaphoreCall = (String, u32);

pub type RaiseHandler = Rc<dyn Fn(&str, u32)>;

pub struct Semaphore {
  builder: Rc<dyn Builder>,
  routine: Rc<Routine<SemaphoreCall, ()>>,
  identity: String,
}

impl Semaphore {
  pub fn new(
    builder: Rc<dyn Builder>,
    name: &str,
    handler: RaiseHandler,
  ) -> Result<Rc<Semaphore>> {
    let identity = format!("semaphore.{name}");
    // The child releases through a lock bound to the same directory the
    // parent acquired in; the path crosses the fork, the lock object
    // does not need to.
    let lock_dir = builder.tempdir().to_path_buf();
    let wrapped: ComputeHandler<SemaphoreCall, ()> =
      Rc::new(move |(key, pid): SemaphoreCall| {
        handler(&key, pid);
        FileLock::new(&lock_dir).reset(&key, pid);
        Ok(())
      });
    let routine = Routine::new(
      Rc::clone(&builder),
      name,
      RoutineOptions {
        on_recv: vec![wrapped],
        ..Default::default()
      },
    )?;
    Ok(Rc::new(Semaphore {
      builder,
      routine,
      identity,
    }))
  }

  pub fn routine(&self) -> &Rc<Routine<SemaphoreCall, ()>> {
    &self.routine
  }

  pub fn start(&self) -> Result<()> {
    self.routine.start()
  }

  pub fn stop(&self) {
    self.routine.stop();
  }

  /// Dispatches one call when the lock is free; returns true without
  /// calling while a previous raise is still being served.
  pub fn raise(&self) -> bool {
    if self.builder.lock().set(&self.identity, true) {
      self
        .routine
        .call(0, (self.identity.clone(), std::process::id()))
    } else {
      true
    }
  }
}

impl Drop for Semaphore {
  fn drop(&mut self) {
    // The worker may have died mid-call; releasing an unheld lock is
    // harmless.
    self.builder.lock().reset(&self.identity, std::process::id());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::StdBuilder;

  #[test]
  fn raises_coalesce_while_the_lock_is_held() {
    let dir = tempfile::tempdir().unwrap();
    let builder: Rc<dyn Builder> =
      Rc::new(StdBuilder::with_tempdir(dir.path(), false));
    let sem =
      Semaphore::new(Rc::clone(&builder), "sem-coalesce", Rc::new(|_, _| {}))
        .unwrap();
    // Not started: the lock is taken but the call is a no-op...
    assert!(!sem.raise());
    // ...and the held lock coalesces the second raise.
    assert!(sem.raise());
    builder.lock().reset("semaphore.sem-coalesce", 0);
    assert!(!sem.raise());
  }
}
