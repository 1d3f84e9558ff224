// Copyright 2018-2025 the Deno authors. MIT license.

//! A round-robin pool of [`Routine`] workers.
//!
//! Workers are created on demand when the cursor lands on an empty slot
//! and are dropped from the pool when they exit. The cursor lives in a
//! process-wide table keyed by pool name, so rebuilding a pool under the
//! same name keeps rotating instead of always hitting slot zero first.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Mutex;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use spindle_core::error::Result;
use spindle_core::notifier::NotifierCore;
use spindle_core::EventLoop;

use crate::routine::Routine;

type CursorKey = (u32, String);

fn cursors() -> &'static Mutex<HashMap<CursorKey, usize>> {
  static CURSORS: OnceLock<Mutex<HashMap<CursorKey, usize>>> =
    OnceLock::new();
  CURSORS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn next_slot(pool: &str, max_workers: usize) -> usize {
  let key = (std::process::id(), pool.to_string());
  let mut table = cursors().lock().unwrap();
  let cursor = table.entry(key).or_insert(0);
  let slot = *cursor % max_workers;
  *cursor = (*cursor + 1) % max_workers;
  slot
}

fn free_cursor(pool: &str) {
  let key = (std::process::id(), pool.to_string());
  cursors().lock().unwrap().remove(&key);
}

/// Builds a worker routine for a slot; invoked on demand. The given name
/// is already unique within the pool.
pub type WorkerFactory<P, R> =
  Box<dyn Fn(&str) -> Result<Rc<Routine<P, R>>>>;

pub struct Pool<P, R> {
  core: NotifierCore,
  max_workers: usize,
  factory: WorkerFactory<P, R>,
  workers: RefCell<HashMap<u32, Rc<Routine<P, R>>>>,
  slots: RefCell<Vec<Option<u32>>>,
  is_running: Cell<bool>,
}

impl<P, R> Pool<P, R>
where
  P: Serialize + DeserializeOwned + 'static,
  R: Serialize + DeserializeOwned + Clone + 'static,
{
  pub fn new(
    name: &str,
    max_workers: usize,
    factory: WorkerFactory<P, R>,
  ) -> Result<Rc<Pool<P, R>>> {
    let el = EventLoop::current()?;
    let core = NotifierCore::new("pool", name, &el)?;
    Ok(Rc::new(Pool {
      core,
      max_workers,
      factory,
      workers: RefCell::new(HashMap::new()),
      slots: RefCell::new(vec![None; max_workers]),
      is_running: Cell::new(true),
    }))
  }

  pub fn core(&self) -> &NotifierCore {
    &self.core
  }

  pub fn worker_count(&self) -> usize {
    self.workers.borrow().len()
  }

  /// Dispatches to the next worker round-robin, spawning one when the
  /// slot is empty.
  pub fn call(self: &Rc<Self>, id: u64, args: P) -> bool {
    if !self.is_running.get() {
      return false;
    }
    let slot = next_slot(self.core.name(), self.max_workers);
    let existing = self.slots.borrow()[slot]
      .and_then(|pid| self.workers.borrow().get(&pid).cloned());
    let worker = match existing {
      Some(worker) => worker,
      None => match self.spawn_worker(slot) {
        Ok(worker) => worker,
        Err(e) => {
          log::error!("{}spawn worker: {e}", self.core.leader());
          return false;
        }
      },
    };
    worker.call(id, args)
  }

  fn spawn_worker(self: &Rc<Self>, slot: usize) -> Result<Rc<Routine<P, R>>> {
    let name = format!("{}_{slot}", self.core.name());
    let worker = (self.factory)(&name)?;
    worker.start()?;
    let pid = worker.pid();
    // Exited workers drop out of the pool; the next call on this slot
    // spawns a replacement.
    let weak = Rc::downgrade(self);
    worker.set_on_exit(Box::new(move |pid, _status| {
      if let Some(pool) = weak.upgrade() {
        pool.workers.borrow_mut().remove(&pid);
        for entry in pool.slots.borrow_mut().iter_mut() {
          if *entry == Some(pid) {
            *entry = None;
          }
        }
      }
    }));
    self.workers.borrow_mut().insert(pid, Rc::clone(&worker));
    self.slots.borrow_mut()[slot] = Some(pid);
    log::debug!("{}worker {pid} in slot {slot}", self.core.leader());
    Ok(worker)
  }

  /// Stops every current worker; the pool may keep serving afterwards.
  pub fn stop(&self) {
    for worker in self.workers.borrow().values() {
      worker.stop();
    }
  }

  /// Stops the pool and frees its cursor entry.
  pub fn close(&self) {
    self.is_running.set(false);
    self.stop();
    self.workers.borrow_mut().clear();
    self.slots.borrow_mut().fill(None);
    free_cursor(self.core.name());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cursor_rotates_and_survives_rebuilds() {
    assert_eq!(next_slot("pool-rot", 3), 0);
    assert_eq!(next_slot("pool-rot", 3), 1);
    // A rebuilt pool with the same name keeps rotating.
    assert_eq!(next_slot("pool-rot", 3), 2);
    assert_eq!(next_slot("pool-rot", 3), 0);
    free_cursor("pool-rot");
    assert_eq!(next_slot("pool-rot", 3), 0);
    free_cursor("pool-rot");
  }
}
