// Copyright 2018-2025 the Deno authors. MIT license.

//! A loop-bound promise.
//!
//! `Promise` is deliberately not a [`std::future::Future`]: there is no
//! scheduler to hand it to. `wait` drives the owning event loop itself
//! until the promise settles, and `done_later`/`fail_later` deliver
//! through the loop's idle queue so completion is observed on the next
//! tick rather than synchronously.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;
use std::time::Duration;
use std::time::Instant;

use crate::error::Error;
use crate::error::SharedError;
use crate::event_loop::EventLoop;

#[derive(Clone, Debug)]
pub enum Outcome<T> {
  Done(T),
  Failed(SharedError),
  Cancelled,
}

enum State<T> {
  Pending,
  Settled(Outcome<T>),
}

struct Inner<T> {
  id: u64,
  eloop: Weak<EventLoop>,
  state: RefCell<State<T>>,
  observers: RefCell<Vec<Box<dyn FnOnce(&Outcome<T>)>>>,
  on_cancel: RefCell<Option<Box<dyn FnOnce()>>>,
}

pub struct Promise<T> {
  inner: Rc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
  fn clone(&self) -> Self {
    Promise {
      inner: Rc::clone(&self.inner),
    }
  }
}

impl<T: 'static> Promise<T> {
  pub fn new(el: &Rc<EventLoop>) -> Promise<T> {
    Promise {
      inner: Rc::new(Inner {
        id: el.uuid(),
        eloop: Rc::downgrade(el),
        state: RefCell::new(State::Pending),
        observers: RefCell::new(Vec::new()),
        on_cancel: RefCell::new(None),
      }),
    }
  }

  /// A promise bound to no loop, for call sites that must hand one back
  /// after failing to obtain a loop; it is settled immediately.
  pub(crate) fn unbound() -> Promise<T> {
    Promise {
      inner: Rc::new(Inner {
        id: 0,
        eloop: Weak::new(),
        state: RefCell::new(State::Pending),
        observers: RefCell::new(Vec::new()),
        on_cancel: RefCell::new(None),
      }),
    }
  }

  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn is_pending(&self) -> bool {
    matches!(*self.inner.state.borrow(), State::Pending)
  }

  pub fn is_done(&self) -> bool {
    matches!(
      *self.inner.state.borrow(),
      State::Settled(Outcome::Done(_))
    )
  }

  pub fn is_failed(&self) -> bool {
    matches!(
      *self.inner.state.borrow(),
      State::Settled(Outcome::Failed(_))
    )
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(
      *self.inner.state.borrow(),
      State::Settled(Outcome::Cancelled)
    )
  }

  pub fn done(&self, value: T) {
    self.settle(Outcome::Done(value));
  }

  pub fn fail(&self, err: Error) {
    self.settle(Outcome::Failed(Rc::new(err)));
  }

  /// Cancels a pending promise: runs the cancel hook, then settles as
  /// `Cancelled`. Observers still run so adopters can clean up.
  pub fn cancel(&self) {
    if !self.is_pending() {
      return;
    }
    if let Some(hook) = self.inner.on_cancel.borrow_mut().take() {
      hook();
    }
    self.settle(Outcome::Cancelled);
  }

  /// Completes on the next loop tick instead of synchronously. Without a
  /// loop to defer through, completion is delivered right away.
  pub fn done_later(&self, value: T) {
    match self.bound_loop() {
      Some(el) => {
        let this = self.clone();
        el.watch_idle(el.uuid(), Box::new(move || this.done(value)));
      }
      None => self.done(value),
    }
  }

  /// Fails on the next loop tick. The error is required up front, which is
  /// what makes the empty-failure case unrepresentable.
  pub fn fail_later(&self, err: Error) {
    match self.bound_loop() {
      Some(el) => {
        let this = self.clone();
        el.watch_idle(el.uuid(), Box::new(move || this.fail(err)));
      }
      None => self.fail(err),
    }
  }

  /// Runs `cb` once the promise settles; immediately when it already has.
  pub fn on_ready(&self, cb: impl FnOnce(&Outcome<T>) + 'static) {
    {
      let state = self.inner.state.borrow();
      if let State::Settled(outcome) = &*state {
        cb(outcome);
        return;
      }
    }
    self.inner.observers.borrow_mut().push(Box::new(cb));
  }

  pub fn on_cancel(&self, cb: impl FnOnce() + 'static) {
    *self.inner.on_cancel.borrow_mut() = Some(Box::new(cb));
  }

  fn settle(&self, outcome: Outcome<T>) {
    // Re-entrant settlement from an observer arrives while the state is
    // still borrowed; the shared pre-check keeps that from panicking.
    if !self.is_pending() {
      return;
    }
    {
      let mut state = self.inner.state.borrow_mut();
      if let State::Settled(_) = &*state {
        return;
      }
      *state = State::Settled(outcome);
    }
    let observers = mem_take_observers(&self.inner);
    let state = self.inner.state.borrow();
    if let State::Settled(outcome) = &*state {
      for observer in observers {
        observer(outcome);
      }
    }
  }

  fn bound_loop(&self) -> Option<Rc<EventLoop>> {
    if let Some(el) = self.inner.eloop.upgrade() {
      if el.pid() == std::process::id() {
        return Some(el);
      }
    }
    match EventLoop::current() {
      Ok(el) => Some(el),
      Err(e) => {
        log::error!("promise has no loop: {e}");
        None
      }
    }
  }
}

impl<T: Clone + 'static> Promise<T> {
  /// The settled outcome, if any, without driving the loop.
  pub fn peek(&self) -> Option<Outcome<T>> {
    match &*self.inner.state.borrow() {
      State::Settled(outcome) => Some(outcome.clone()),
      State::Pending => None,
    }
  }

  /// Drives the owning loop until the promise settles or `timeout`
  /// seconds pass. Returns `None` on timeout, or whatever has settled
  /// when there is no loop left to drive.
  pub fn wait(&self, timeout: Option<f64>) -> Option<Outcome<T>> {
    let Some(el) = self.bound_loop() else {
      return self.peek();
    };
    let deadline =
      timeout.map(|t| Instant::now() + Duration::from_secs_f64(t.max(0.0)));
    while self.is_pending() {
      let max_wait = match deadline {
        Some(deadline) => {
          let left = deadline.saturating_duration_since(Instant::now());
          if left.is_zero() {
            return None;
          }
          Some(left)
        }
        None => None,
      };
      el.turn(max_wait);
    }
    match &*self.inner.state.borrow() {
      State::Settled(outcome) => Some(outcome.clone()),
      State::Pending => None,
    }
  }
}

fn mem_take_observers<T>(
  inner: &Rc<Inner<T>>,
) -> Vec<Box<dyn FnOnce(&Outcome<T>)>> {
  std::mem::take(&mut *inner.observers.borrow_mut())
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;

  use super::*;
  use crate::event_loop::Schedule;
  use crate::event_loop::timer_callback;

  #[test]
  fn settles_once_and_ignores_later_settlement() {
    let el = EventLoop::current().unwrap();
    let p = Promise::new(&el);
    p.done(1);
    p.done(2);
    assert!(p.is_done());
    assert!(matches!(p.wait(Some(0.01)), Some(Outcome::Done(1))));
  }

  #[test]
  fn done_later_is_observed_on_the_next_tick() {
    let el = EventLoop::current().unwrap();
    let p: Promise<u32> = Promise::new(&el);
    p.done_later(5);
    assert!(p.is_pending());
    el.once();
    assert!(matches!(p.wait(Some(0.01)), Some(Outcome::Done(5))));
  }

  #[test]
  fn wait_drives_the_loop_until_a_timer_completes_it() {
    let el = EventLoop::current().unwrap();
    let p: Promise<&'static str> = Promise::new(&el);
    let done = p.clone();
    el.watch_time(
      el.uuid(),
      timer_callback(move || done.done("ready")),
      0.005,
      Schedule::Rel,
    );
    assert!(matches!(p.wait(Some(2.0)), Some(Outcome::Done("ready"))));
  }

  #[test]
  fn cancel_runs_the_hook_and_settles_cancelled() {
    let el = EventLoop::current().unwrap();
    let p: Promise<()> = Promise::new(&el);
    let hook = Rc::new(Cell::new(false));
    {
      let hook = Rc::clone(&hook);
      p.on_cancel(move || hook.set(true));
    }
    p.cancel();
    assert!(hook.get());
    assert!(p.is_cancelled());
    // Cancelled promises ignore completion.
    p.done(());
    assert!(p.is_cancelled());
  }

  #[test]
  fn wait_times_out_on_a_pending_promise() {
    let el = EventLoop::current().unwrap();
    let p: Promise<()> = Promise::new(&el);
    assert!(p.wait(Some(0.01)).is_none());
    assert!(p.is_pending());
  }
}
