// Copyright 2018-2025 the Deno authors. MIT license.

//! FD-level readiness notifier.
//!
//! A `Handle` owns one duplex fd or up to two half-duplex fds. Setting
//! `want_readready`/`want_writeready` installs the matching readiness
//! watcher on the loop; the relevant `on_*_ready` callback must exist
//! first. Close is idempotent: it stops the watchers, closes the owned
//! fds, fires `on_closed` and settles any close promises.

use std::cell::Cell;
use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::rc::Rc;

use nix::fcntl::fcntl;
use nix::fcntl::FcntlArg;
use nix::fcntl::OFlag;

use crate::error::Error;
use crate::error::Result;
use crate::notifier::weak_cb;
use crate::notifier::NotifierCore;
use crate::promise::Promise;

pub(crate) fn fd_read(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
  nix::unistd::read(fd, buf)
}

pub(crate) fn fd_write(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
  nix::unistd::write(fd, buf)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
  let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
  fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
  Ok(())
}

/// The fd(s) behind a handle or stream: one duplex fd used for both
/// directions, or separate read/write fds.
pub enum HandleFds {
  Empty,
  Duplex(OwnedFd),
  Half {
    rd: Option<OwnedFd>,
    wr: Option<OwnedFd>,
  },
}

impl HandleFds {
  pub fn read_fd(&self) -> Option<RawFd> {
    match self {
      HandleFds::Empty => None,
      HandleFds::Duplex(fd) => Some(fd.as_raw_fd()),
      HandleFds::Half { rd, .. } => rd.as_ref().map(AsRawFd::as_raw_fd),
    }
  }

  pub fn write_fd(&self) -> Option<RawFd> {
    match self {
      HandleFds::Empty => None,
      HandleFds::Duplex(fd) => Some(fd.as_raw_fd()),
      HandleFds::Half { wr, .. } => wr.as_ref().map(AsRawFd::as_raw_fd),
    }
  }
}

pub type ReadyHandler = Box<dyn FnMut(&Rc<Handle>)>;
pub type ClosedHandler = Box<dyn FnOnce(&Rc<Handle>)>;

pub struct Handle {
  core: NotifierCore,
  fds: RefCell<HandleFds>,
  want_rr: Cell<bool>,
  want_wr: Cell<bool>,
  on_read_ready: Rc<RefCell<Option<ReadyHandler>>>,
  on_write_ready: Rc<RefCell<Option<ReadyHandler>>>,
  on_closed: RefCell<Option<ClosedHandler>>,
  close_promises: RefCell<Vec<Promise<()>>>,
  closed: Cell<bool>,
}

impl Handle {
  pub fn new(name: &str, fds: HandleFds) -> Result<Rc<Handle>> {
    let el = crate::EventLoop::current()?;
    let core = NotifierCore::new("handle", name, &el)?;
    Ok(Rc::new(Handle {
      core,
      fds: RefCell::new(fds),
      want_rr: Cell::new(false),
      want_wr: Cell::new(false),
      on_read_ready: Rc::new(RefCell::new(None)),
      on_write_ready: Rc::new(RefCell::new(None)),
      on_closed: RefCell::new(None),
      close_promises: RefCell::new(Vec::new()),
      closed: Cell::new(false),
    }))
  }

  pub fn core(&self) -> &NotifierCore {
    &self.core
  }

  pub fn read_fd(&self) -> Option<RawFd> {
    self.fds.borrow().read_fd()
  }

  pub fn write_fd(&self) -> Option<RawFd> {
    self.fds.borrow().write_fd()
  }

  pub fn is_closed(&self) -> bool {
    self.closed.get()
  }

  pub fn set_on_read_ready(&self, cb: ReadyHandler) {
    *self.on_read_ready.borrow_mut() = Some(cb);
  }

  pub fn set_on_write_ready(&self, cb: ReadyHandler) {
    *self.on_write_ready.borrow_mut() = Some(cb);
  }

  pub fn set_on_closed(&self, cb: ClosedHandler) {
    *self.on_closed.borrow_mut() = Some(cb);
  }

  pub fn set_on_error(&self, cb: crate::notifier::ErrorCallback) {
    self.core.set_on_error(cb);
  }

  pub fn want_readready(&self) -> bool {
    self.want_rr.get()
  }

  pub fn want_writeready(&self) -> bool {
    self.want_wr.get()
  }

  /// Asking for read readiness requires an `on_read_ready` handler and an
  /// open read fd.
  pub fn set_want_readready(self: &Rc<Self>, want: bool) -> Result<()> {
    if want {
      if self.on_read_ready.borrow().is_none() {
        return Err(Error::Unspecified("on_read_ready"));
      }
      let fd = self.read_fd().ok_or(Error::Unspecified("read handle"))?;
      let el = self.core.event_loop()?;
      let slot = Rc::clone(&self.on_read_ready);
      el.watch_read_fd(
        fd,
        weak_cb(self, move |this| {
          // Taken out for the call so the handler may replace itself.
          let cb = slot.borrow_mut().take();
          if let Some(mut cb) = cb {
            cb(this);
            let mut current = slot.borrow_mut();
            if current.is_none() {
              *current = Some(cb);
            }
          }
        }),
      )?;
      self.want_rr.set(true);
    } else {
      if let Some(fd) = self.read_fd() {
        if let Some(el) = self.core.try_event_loop() {
          el.unwatch_read_fd(fd);
        }
      }
      self.want_rr.set(false);
    }
    Ok(())
  }

  pub fn set_want_writeready(self: &Rc<Self>, want: bool) -> Result<()> {
    if want {
      if self.on_write_ready.borrow().is_none() {
        return Err(Error::Unspecified("on_write_ready"));
      }
      let fd = self.write_fd().ok_or(Error::Unspecified("write handle"))?;
      let el = self.core.event_loop()?;
      let slot = Rc::clone(&self.on_write_ready);
      el.watch_write_fd(
        fd,
        weak_cb(self, move |this| {
          let cb = slot.borrow_mut().take();
          if let Some(mut cb) = cb {
            cb(this);
            let mut current = slot.borrow_mut();
            if current.is_none() {
              *current = Some(cb);
            }
          }
        }),
      )?;
      self.want_wr.set(true);
    } else {
      if let Some(fd) = self.write_fd() {
        if let Some(el) = self.core.try_event_loop() {
          el.unwatch_write_fd(fd);
        }
      }
      self.want_wr.set(false);
    }
    Ok(())
  }

  /// A promise that resolves when the handle closes. Cancelling it just
  /// removes it from the list.
  pub fn new_close_promise(self: &Rc<Self>) -> Promise<()> {
    let p: Promise<()> = match self.core.event_loop() {
      Ok(el) => Promise::new(&el),
      Err(e) => {
        let p = Promise::unbound();
        p.fail(e);
        return p;
      }
    };
    let id = p.id();
    let weak = Rc::downgrade(self);
    p.on_cancel(move || {
      if let Some(this) = weak.upgrade() {
        this.close_promises.borrow_mut().retain(|q| q.id() != id);
      }
    });
    self.close_promises.borrow_mut().push(p.clone());
    p
  }

  /// Stops watchers, replaces the fd(s) and restores the previous
  /// readiness requests.
  pub fn set_handle(self: &Rc<Self>, fds: HandleFds) -> Result<()> {
    let (rr, wr) = (self.want_rr.get(), self.want_wr.get());
    self.stop_watching();
    *self.fds.borrow_mut() = fds;
    self.closed.set(false);
    if self.core.autostart() {
      if rr {
        self.set_want_readready(true)?;
      }
      if wr {
        self.set_want_writeready(true)?;
      }
    }
    Ok(())
  }

  fn stop_watching(&self) {
    let Some(el) = self.core.try_event_loop() else {
      return;
    };
    if let Some(fd) = self.read_fd() {
      el.unwatch_read_fd(fd);
    }
    if let Some(fd) = self.write_fd() {
      el.unwatch_write_fd(fd);
    }
  }

  /// Idempotent.
  pub fn close(self: &Rc<Self>) {
    if self.closed.replace(true) {
      return;
    }
    self.stop_watching();
    self.want_rr.set(false);
    self.want_wr.set(false);
    *self.fds.borrow_mut() = HandleFds::Empty;
    let on_closed = self.on_closed.borrow_mut().take();
    if let Some(cb) = on_closed {
      cb(self);
    }
    let promises: Vec<Promise<()>> =
      self.close_promises.borrow_mut().drain(..).collect();
    for p in promises {
      p.done(());
    }
    log::debug!("{}closed", self.core.leader());
  }
}

impl Drop for Handle {
  fn drop(&mut self) {
    if !self.closed.get() {
      self.stop_watching();
    }
  }
}

#[cfg(test)]
mod tests {
  use nix::sys::socket::socketpair;
  use nix::sys::socket::AddressFamily;
  use nix::sys::socket::SockFlag;
  use nix::sys::socket::SockType;

  use super::*;
  use crate::promise::Outcome;
  use crate::EventLoop;

  fn pair() -> (OwnedFd, OwnedFd) {
    socketpair(
      AddressFamily::Unix,
      SockType::Stream,
      None,
      SockFlag::SOCK_NONBLOCK,
    )
    .unwrap()
  }

  #[test]
  fn want_readready_requires_a_handler() {
    let (a, _b) = pair();
    let h = Handle::new("h-nohandler", HandleFds::Duplex(a)).unwrap();
    assert!(matches!(
      h.set_want_readready(true),
      Err(Error::Unspecified("on_read_ready"))
    ));
  }

  #[test]
  fn read_readiness_fires_once_per_poll() {
    let el = EventLoop::current().unwrap();
    let (a, b) = pair();
    let h = Handle::new(
      "h-ready",
      HandleFds::Half {
        rd: Some(a),
        wr: None,
      },
    )
    .unwrap();
    let hits = Rc::new(Cell::new(0));
    {
      let hits = Rc::clone(&hits);
      h.set_on_read_ready(Box::new(move |_| hits.set(hits.get() + 1)));
    }
    h.set_want_readready(true).unwrap();
    assert!(h.want_readready());
    assert_eq!(hits.get(), 0);
    fd_write(b.as_raw_fd(), b"hello").unwrap();
    let deadline =
      std::time::Instant::now() + std::time::Duration::from_secs(2);
    while hits.get() == 0 && std::time::Instant::now() < deadline {
      el.turn(Some(std::time::Duration::from_millis(10)));
    }
    assert!(hits.get() >= 1);
    // No write fd: asking for write readiness must fail.
    assert!(h.set_want_writeready(true).is_err());
    h.close();
  }

  #[test]
  fn close_is_idempotent_and_settles_close_promises() {
    let (a, _b) = pair();
    let h = Handle::new("h-close", HandleFds::Duplex(a)).unwrap();
    let p = h.new_close_promise();
    let q = h.new_close_promise();
    q.cancel();
    h.close();
    h.close();
    assert!(h.is_closed());
    assert!(matches!(p.wait(Some(0.1)), Some(Outcome::Done(()))));
    assert!(q.is_cancelled());
  }
}
