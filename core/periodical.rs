// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::Error;
use crate::error::Result;
use crate::event_loop::Schedule;
use crate::event_loop::TimerCallback;
use crate::notifier::NotifierCore;

/// A notifier wrapping one loop timer: start/stop/restart plus one-shot
/// absolute or relative scheduling.
pub struct Periodical {
  core: NotifierCore,
  interval: f64,
  time_spec: Option<Schedule>,
  timer_id: Cell<u64>,
  running: Cell<bool>,
  cb: TimerCallback,
}

impl Periodical {
  /// `time_spec` is only consulted by [`once`](Self::once); `start` always
  /// arms a periodic timer at `interval`.
  pub fn new(
    name: &str,
    interval: f64,
    time_spec: Option<Schedule>,
    cb: TimerCallback,
  ) -> Result<Rc<Periodical>> {
    let el = crate::EventLoop::current()?;
    let core = NotifierCore::new("periodical", name, &el)?;
    Ok(Rc::new(Periodical {
      core,
      interval,
      time_spec,
      timer_id: Cell::new(0),
      running: Cell::new(false),
      cb,
    }))
  }

  pub fn core(&self) -> &NotifierCore {
    &self.core
  }

  pub fn is_running(&self) -> bool {
    self.running.get()
  }

  /// No-op when already running.
  pub fn start(self: &Rc<Self>) -> Result<()> {
    if self.running.get() {
      return Ok(());
    }
    self.arm(self.cb.clone(), Schedule::Periodic)
  }

  /// Fires once at the configured `time_spec`, clearing the running flag
  /// when it does.
  pub fn once(self: &Rc<Self>) -> Result<()> {
    if self.running.get() {
      return Ok(());
    }
    let spec = self.time_spec.ok_or(Error::Unspecified("time_spec"))?;
    let weak = Rc::downgrade(self);
    let inner = self.cb.clone();
    self.arm(
      crate::event_loop::timer_callback(move || {
        if let Some(this) = weak.upgrade() {
          this.running.set(false);
        }
        (*inner.borrow_mut())();
      }),
      spec,
    )
  }

  /// Re-arms the live timer with its current callback and spec.
  pub fn restart(self: &Rc<Self>) -> Result<()> {
    let el = self.core.event_loop()?;
    let Some(cb) = el.unwatch_time(self.timer_id.get()) else {
      return Ok(());
    };
    self.running.set(false);
    let spec = self.time_spec.unwrap_or(Schedule::Periodic);
    self.arm(cb, spec)
  }

  pub fn stop(&self) {
    if !self.running.get() {
      return;
    }
    if let Some(el) = self.core.try_event_loop() {
      el.unwatch_time(self.timer_id.get());
    }
    self.running.set(false);
    log::debug!("{}stopped", self.core.leader());
  }

  fn arm(self: &Rc<Self>, cb: TimerCallback, spec: Schedule) -> Result<()> {
    let el = self.core.event_loop()?;
    let id = el.uuid();
    self.timer_id.set(id);
    el.watch_time(id, cb, self.interval, spec);
    self.running.set(true);
    Ok(())
  }
}

impl Drop for Periodical {
  fn drop(&mut self) {
    if self.running.get() {
      if let Some(el) = self.core.try_event_loop() {
        el.unwatch_time(self.timer_id.get());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::cell::RefCell;

  use super::*;
  use crate::event_loop::timer_callback;
  use crate::EventLoop;

  #[test]
  fn start_is_idempotent_and_stop_halts_firing() {
    let el = EventLoop::current().unwrap();
    let hits = Rc::new(Cell::new(0));
    let p = {
      let hits = Rc::clone(&hits);
      Periodical::new(
        "per-basic",
        0.001,
        None,
        timer_callback(move || hits.set(hits.get() + 1)),
      )
      .unwrap()
    };
    p.start().unwrap();
    let first_timer = p.timer_id.get();
    p.start().unwrap();
    assert_eq!(p.timer_id.get(), first_timer);
    while hits.get() < 2 {
      el.turn(Some(std::time::Duration::from_millis(5)));
    }
    p.stop();
    assert!(!p.is_running());
    let seen = hits.get();
    el.once();
    el.once();
    assert_eq!(hits.get(), seen);
  }

  #[test]
  fn once_requires_a_time_spec() {
    let p = Periodical::new("per-nospec", 0.0, None, timer_callback(|| {}))
      .unwrap();
    assert!(matches!(p.once(), Err(Error::Unspecified("time_spec"))));
  }

  #[test]
  fn once_fires_once_and_clears_running() {
    let el = EventLoop::current().unwrap();
    let hits = Rc::new(Cell::new(0));
    let p = {
      let hits = Rc::clone(&hits);
      Periodical::new(
        "per-once",
        0.0,
        Some(Schedule::Rel),
        timer_callback(move || hits.set(hits.get() + 1)),
      )
      .unwrap()
    };
    p.once().unwrap();
    assert!(p.is_running());
    el.once();
    assert_eq!(hits.get(), 1);
    assert!(!p.is_running());
    el.once();
    assert_eq!(hits.get(), 1);
  }

  #[test]
  fn restart_rearms_the_same_callback() {
    let el = EventLoop::current().unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let p = {
      let log = Rc::clone(&log);
      Periodical::new(
        "per-restart",
        0.001,
        None,
        timer_callback(move || log.borrow_mut().push("tick")),
      )
      .unwrap()
    };
    p.start().unwrap();
    p.restart().unwrap();
    assert!(p.is_running());
    while log.borrow().is_empty() {
      el.turn(Some(std::time::Duration::from_millis(5)));
    }
    p.stop();
  }
}
