// Copyright 2018-2025 the Deno authors. MIT license.

//! Common notifier state and lifecycle.
//!
//! Every notifier embeds a [`NotifierCore`]: its `(kind, name)` identity,
//! registered process-wide for uniqueness, a weak reference to the owning
//! event loop, adopted promises and the error routing slot.
//!
//! Callbacks handed to the loop must not keep their notifier alive — the
//! loop stores closures, the notifier references the loop, and a strong
//! capture would leak the pair. [`weak_cb`] builds the standard
//! weak-self closure: upgrade and call, or silently do nothing once the
//! notifier is gone.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Mutex;
use std::sync::OnceLock;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Error;
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::event_loop::ReadyCallback;
use crate::promise::Outcome;
use crate::promise::Promise;

pub type ErrorCallback = Box<dyn FnMut(&Error)>;

static NAME_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap());

type RegistryKey = (u32, &'static str, String);

fn registry() -> &'static Mutex<HashSet<RegistryKey>> {
  static REGISTRY: OnceLock<Mutex<HashSet<RegistryKey>>> = OnceLock::new();
  REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Width of the upper-cased notifier name in log line leaders.
pub const LOG_KEY_WIDTH: usize = 15;

pub struct NotifierCore {
  kind: &'static str,
  name: String,
  desc: RefCell<String>,
  pid: u32,
  autostart: bool,
  eloop: RefCell<Weak<EventLoop>>,
  promises: Rc<RefCell<HashMap<u64, Box<dyn Any>>>>,
  on_error: Rc<RefCell<Option<ErrorCallback>>>,
}

impl std::fmt::Debug for NotifierCore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("NotifierCore")
      .field("kind", &self.kind)
      .field("name", &self.name)
      .field("pid", &self.pid)
      .field("autostart", &self.autostart)
      .finish_non_exhaustive()
  }
}

impl NotifierCore {
  /// Registers `(kind, name)`; a live duplicate fails with
  /// `NotifierIdNotUnique`.
  pub fn new(
    kind: &'static str,
    name: &str,
    el: &Rc<EventLoop>,
  ) -> Result<NotifierCore> {
    if name.is_empty() {
      return Err(Error::Unspecified("name"));
    }
    if !NAME_RE.is_match(name) {
      return Err(Error::Tainted(name.to_string()));
    }
    let key = (std::process::id(), kind, name.to_string());
    if !registry().lock().unwrap().insert(key) {
      return Err(Error::NotifierIdNotUnique {
        kind,
        name: name.to_string(),
      });
    }
    Ok(NotifierCore {
      kind,
      name: name.to_string(),
      desc: RefCell::new(String::new()),
      pid: std::process::id(),
      autostart: true,
      eloop: RefCell::new(Rc::downgrade(el)),
      promises: Rc::new(RefCell::new(HashMap::new())),
      on_error: Rc::new(RefCell::new(None)),
    })
  }

  pub fn kind(&self) -> &'static str {
    self.kind
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn desc(&self) -> String {
    self.desc.borrow().clone()
  }

  pub fn set_desc(&self, desc: &str) {
    *self.desc.borrow_mut() = desc.to_string();
  }

  pub fn pid(&self) -> u32 {
    self.pid
  }

  pub fn autostart(&self) -> bool {
    self.autostart
  }

  pub fn set_autostart(&mut self, autostart: bool) {
    self.autostart = autostart;
  }

  /// The owning loop. A stale reference (dropped loop, or a loop created
  /// before a fork) is replaced with the current process's loop; fails
  /// when no loop can be built.
  pub fn event_loop(&self) -> Result<Rc<EventLoop>> {
    if let Some(el) = self.eloop.borrow().upgrade() {
      if el.pid() == std::process::id() {
        return Ok(el);
      }
    }
    let el = EventLoop::current()?;
    *self.eloop.borrow_mut() = Rc::downgrade(&el);
    Ok(el)
  }

  /// Upgrade-only flavour for teardown paths: `None` when the loop is
  /// gone or belongs to another process, in which case there is nothing
  /// left to unwatch.
  pub fn try_event_loop(&self) -> Option<Rc<EventLoop>> {
    let el = self.eloop.borrow().upgrade()?;
    (el.pid() == std::process::id()).then_some(el)
  }

  pub fn set_on_error(&self, cb: ErrorCallback) {
    *self.on_error.borrow_mut() = Some(cb);
  }

  /// Dispatches through `on_error`, or returns the error to the caller
  /// when no handler is installed.
  pub fn invoke_error(&self, err: Error) -> Result<()> {
    let mut slot = self.on_error.borrow_mut();
    match slot.as_mut() {
      Some(cb) => {
        cb(&err);
        Ok(())
      }
      None => Err(err),
    }
  }

  /// As [`invoke_error`](Self::invoke_error), for dispatcher contexts
  /// that must not propagate: an unhandled error is logged instead.
  pub fn route_error(&self, err: Error) {
    if let Err(err) = self.invoke_error(err) {
      log::error!("{}unhandled error: {err}", self.leader());
    }
  }

  /// Keeps `p` alive until it settles; a failure is routed through the
  /// error callback (or logged).
  pub fn adopt_promise<T: 'static>(&self, p: &Promise<T>) {
    let key = p.id();
    self.promises.borrow_mut().insert(key, Box::new(p.clone()));
    let promises = Rc::clone(&self.promises);
    let on_error = Rc::clone(&self.on_error);
    let leader = self.leader();
    p.on_ready(move |outcome| {
      promises.borrow_mut().remove(&key);
      if let Outcome::Failed(err) = outcome {
        let mut slot = on_error.borrow_mut();
        match slot.as_mut() {
          Some(cb) => cb(err),
          None => log::error!("{leader}adopted promise failed: {err}"),
        }
      }
    });
  }

  /// Log line leader: the upper-cased name left-padded into the key
  /// column, then the pid zero-padded to five digits.
  pub fn leader(&self) -> String {
    let mut name = self.name.to_uppercase();
    name.truncate(LOG_KEY_WIDTH);
    format!("{name:>width$} [{:05}]: ", self.pid, width = LOG_KEY_WIDTH)
  }
}

impl Drop for NotifierCore {
  fn drop(&mut self) {
    let key = (std::process::id(), self.kind, self.name.clone());
    registry().lock().unwrap().remove(&key);
  }
}

/// Builds a loop callback holding a weak reference to `this`: upgrade and
/// call, or do nothing once the notifier has been destroyed.
pub fn weak_cb<T: 'static>(
  this: &Rc<T>,
  mut f: impl FnMut(&Rc<T>) + 'static,
) -> ReadyCallback {
  let weak = Rc::downgrade(this);
  Rc::new(RefCell::new(move || {
    if let Some(this) = weak.upgrade() {
      f(&this);
    }
  }))
}

/// As [`weak_cb`], for plain `FnMut()` call sites outside the loop.
pub fn capture_weakself<T: 'static>(
  this: &Rc<T>,
  mut f: impl FnMut(&Rc<T>) + 'static,
) -> impl FnMut() {
  let weak = Rc::downgrade(this);
  move || {
    if let Some(this) = weak.upgrade() {
      f(&this);
    }
  }
}
