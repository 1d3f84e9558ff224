// Copyright 2018-2025 the Deno authors. MIT license.

//! Buffered, optionally encoded byte transport over an fd pair.
//!
//! The stream keeps four independent readiness requests: a read may need
//! write readiness to make progress (a pipelined protocol that hit EAGAIN
//! mid-write) and vice versa. The fd watcher installed on the loop is the
//! logical OR per direction; the dispatch fans back out to `do_read` and
//! `do_write` based on which requests are up.
//!
//! Writes queue [`WriteItem`]s: plain bytes, a generator closure that
//! yields chunks until it returns `None`, or a promise whose value is
//! written once it settles. Consecutive plain-byte items with the same
//! write length and no per-item callbacks are coalesced before hitting
//! the syscall.
//!
//! Reads drain through a FIFO queue of read items; only when the queue is
//! empty does the stream fall back to `on_read`. A read item's handler
//! reports what to do next with a [`ReadAction`].

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::error::is_broken_pipe;
use crate::error::is_interrupted;
use crate::error::is_nonfatal;
use crate::error::is_wouldblock;
use crate::error::Error;
use crate::error::Result;
use crate::handle::fd_read;
use crate::handle::fd_write;
use crate::handle::HandleFds;
use crate::notifier::weak_cb;
use crate::notifier::NotifierCore;
use crate::promise::Outcome;
use crate::promise::Promise;

pub const DEFAULT_READ_LEN: usize = 8192;
pub const DEFAULT_WRITE_LEN: usize = 8192;

/// What a read handler wants done with its queue slot.
pub enum ReadAction {
  /// Keep the item at the head; it needs more bytes.
  Keep,
  /// Remove the item.
  Pop,
  /// Replace the item in place and keep draining.
  Replace(ReadHandler),
}

pub type ReadHandler = Box<dyn FnMut(&Rc<Stream>, &mut Vec<u8>, bool) -> ReadAction>;
pub type WriteGenerator = Box<dyn FnMut() -> Option<Vec<u8>>>;
pub type StreamHandler = Box<dyn FnMut(&Rc<Stream>)>;
pub type StreamErrorHandler = Box<dyn FnMut(&Rc<Stream>, &Error)>;

pub enum WriteData {
  Bytes(Vec<u8>),
  Generator(WriteGenerator),
  Pending(Promise<Vec<u8>>),
}

#[derive(Default)]
pub struct WriteOptions {
  /// Per-item syscall size cap; defaults to the stream's `write_len`.
  pub writelen: Option<usize>,
  pub on_write: Option<Box<dyn FnMut(&Rc<Stream>, usize)>>,
  pub on_flush: Option<Box<dyn FnOnce(&Rc<Stream>)>>,
  pub on_error: Option<Box<dyn FnOnce(&Rc<Stream>, &Error)>>,
  /// Hand back a promise that resolves on flush and fails on write error.
  pub want_promise: bool,
}

struct WriteItem {
  data: WriteData,
  writelen: usize,
  on_write: Option<Box<dyn FnMut(&Rc<Stream>, usize)>>,
  on_flush: Option<Box<dyn FnOnce(&Rc<Stream>)>>,
  on_error: Option<Box<dyn FnOnce(&Rc<Stream>, &Error)>>,
  watching: bool,
  promise: Option<Promise<()>>,
}

impl WriteItem {
  fn plain(&self) -> bool {
    matches!(self.data, WriteData::Bytes(_))
      && self.on_write.is_none()
      && self.on_flush.is_none()
      && self.on_error.is_none()
      && self.promise.is_none()
  }
}

struct ReadItem {
  on_read: ReadHandler,
  promise: Option<Promise<(Vec<u8>, bool)>>,
}

impl ReadItem {
  fn cancelled(&self) -> bool {
    self.promise.as_ref().is_some_and(Promise::is_cancelled)
  }
}

/// Incremental byte encoding. `decode` consumes the decodable prefix of
/// `input` and leaves undecodable trailing bytes (a partial multi-byte
/// sequence) for the next chunk.
pub trait Encoding {
  fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;
  fn decode(&self, input: &mut Vec<u8>) -> Result<Vec<u8>>;
}

/// Validating UTF-8 pass-through; stops at a trailing partial scalar.
pub struct Utf8Encoding;

impl Encoding for Utf8Encoding {
  fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
    std::str::from_utf8(data)
      .map(|s| s.as_bytes().to_vec())
      .map_err(|e| Error::Codec(e.to_string()))
  }

  fn decode(&self, input: &mut Vec<u8>) -> Result<Vec<u8>> {
    match std::str::from_utf8(input) {
      Ok(_) => Ok(std::mem::take(input)),
      Err(e) if e.error_len().is_none() => {
        // Clean prefix, partial scalar at the end.
        let valid = e.valid_up_to();
        let rest = input.split_off(valid);
        let out = std::mem::replace(input, rest);
        Ok(out)
      }
      Err(e) => Err(Error::Codec(e.to_string())),
    }
  }
}

pub fn encoding_by_name(name: &str) -> Result<Box<dyn Encoding>> {
  match name {
    "utf-8" | "utf8" | "UTF-8" => Ok(Box::new(Utf8Encoding)),
    other => Err(Error::EncodingUnknown(other.to_string())),
  }
}

pub struct StreamOptions {
  pub read_len: usize,
  pub write_len: usize,
  pub read_high_watermark: Option<usize>,
  pub read_low_watermark: Option<usize>,
  pub close_on_read_eof: bool,
  pub autoflush: bool,
  pub read_all: bool,
  pub write_all: bool,
  pub encoding: Option<String>,
  /// Regular-file tailing: a zero-length read means "no more bytes right
  /// now", not end of stream.
  pub tail: bool,
}

impl Default for StreamOptions {
  fn default() -> StreamOptions {
    StreamOptions {
      read_len: DEFAULT_READ_LEN,
      write_len: DEFAULT_WRITE_LEN,
      read_high_watermark: None,
      read_low_watermark: None,
      close_on_read_eof: false,
      autoflush: false,
      read_all: false,
      write_all: true,
      encoding: None,
      tail: false,
    }
  }
}

pub struct Stream {
  core: NotifierCore,
  fds: RefCell<HandleFds>,

  is_running: Cell<bool>,
  is_closing: Cell<bool>,
  read_eof: Cell<bool>,
  write_eof: Cell<bool>,
  writeable: Cell<bool>,
  at_high_watermark: Cell<bool>,
  flushing_read: Cell<bool>,
  closed: Cell<bool>,

  want_rr_for_r: Cell<bool>,
  want_rr_for_w: Cell<bool>,
  want_wr_for_r: Cell<bool>,
  want_wr_for_w: Cell<bool>,
  watching_r: Cell<bool>,
  watching_w: Cell<bool>,

  read_len: Cell<usize>,
  write_len: Cell<usize>,
  read_hwm: Cell<Option<usize>>,
  read_lwm: Cell<Option<usize>>,
  close_on_read_eof: Cell<bool>,
  autoflush: Cell<bool>,
  read_all: Cell<bool>,
  write_all: Cell<bool>,
  tail: Cell<bool>,
  encoding: RefCell<Option<Box<dyn Encoding>>>,

  rbuf: RefCell<Vec<u8>>,
  undecoded: RefCell<Vec<u8>>,
  wqueue: RefCell<VecDeque<WriteItem>>,
  rqueue: RefCell<VecDeque<ReadItem>>,

  on_read: RefCell<Option<ReadHandler>>,
  on_read_eof: RefCell<Option<StreamHandler>>,
  on_write_eof: RefCell<Option<StreamHandler>>,
  on_read_error: RefCell<Option<StreamErrorHandler>>,
  on_write_error: RefCell<Option<StreamErrorHandler>>,
  on_outgoing_empty: RefCell<Option<StreamHandler>>,
  on_writeable_start: RefCell<Option<StreamHandler>>,
  on_writeable_stop: RefCell<Option<StreamHandler>>,
  on_read_high_watermark: RefCell<Option<StreamHandler>>,
  on_read_low_watermark: RefCell<Option<StreamHandler>>,
  on_closed: RefCell<Option<Box<dyn FnOnce(&Rc<Stream>)>>>,
  close_promises: RefCell<Vec<Promise<()>>>,
}

impl Stream {
  pub fn new(
    name: &str,
    fds: HandleFds,
    opts: StreamOptions,
  ) -> Result<Rc<Stream>> {
    let el = crate::EventLoop::current()?;
    let core = NotifierCore::new("stream", name, &el)?;
    let encoding = match &opts.encoding {
      Some(name) => Some(encoding_by_name(name)?),
      None => None,
    };
    Ok(Rc::new(Stream {
      core,
      fds: RefCell::new(fds),
      is_running: Cell::new(false),
      is_closing: Cell::new(false),
      read_eof: Cell::new(false),
      write_eof: Cell::new(false),
      writeable: Cell::new(true),
      at_high_watermark: Cell::new(false),
      flushing_read: Cell::new(false),
      closed: Cell::new(false),
      want_rr_for_r: Cell::new(false),
      want_rr_for_w: Cell::new(false),
      want_wr_for_r: Cell::new(false),
      want_wr_for_w: Cell::new(false),
      watching_r: Cell::new(false),
      watching_w: Cell::new(false),
      read_len: Cell::new(opts.read_len),
      write_len: Cell::new(opts.write_len),
      read_hwm: Cell::new(opts.read_high_watermark),
      read_lwm: Cell::new(opts.read_low_watermark),
      close_on_read_eof: Cell::new(opts.close_on_read_eof),
      autoflush: Cell::new(opts.autoflush),
      read_all: Cell::new(opts.read_all),
      write_all: Cell::new(opts.write_all),
      tail: Cell::new(opts.tail),
      encoding: RefCell::new(encoding),
      rbuf: RefCell::new(Vec::new()),
      undecoded: RefCell::new(Vec::new()),
      wqueue: RefCell::new(VecDeque::new()),
      rqueue: RefCell::new(VecDeque::new()),
      on_read: RefCell::new(None),
      on_read_eof: RefCell::new(None),
      on_write_eof: RefCell::new(None),
      on_read_error: RefCell::new(None),
      on_write_error: RefCell::new(None),
      on_outgoing_empty: RefCell::new(None),
      on_writeable_start: RefCell::new(None),
      on_writeable_stop: RefCell::new(None),
      on_read_high_watermark: RefCell::new(None),
      on_read_low_watermark: RefCell::new(None),
      on_closed: RefCell::new(None),
      close_promises: RefCell::new(Vec::new()),
    }))
  }

  pub fn core(&self) -> &NotifierCore {
    &self.core
  }

  pub fn read_fd(&self) -> Option<std::os::fd::RawFd> {
    self.fds.borrow().read_fd()
  }

  pub fn write_fd(&self) -> Option<std::os::fd::RawFd> {
    self.fds.borrow().write_fd()
  }

  pub fn is_running(&self) -> bool {
    self.is_running.get()
  }

  pub fn is_closing(&self) -> bool {
    self.is_closing.get()
  }

  pub fn is_closed(&self) -> bool {
    self.closed.get()
  }

  pub fn read_eof(&self) -> bool {
    self.read_eof.get()
  }

  pub fn buffered(&self) -> usize {
    self.rbuf.borrow().len()
  }

  pub fn pending_writes(&self) -> usize {
    self.wqueue.borrow().len()
  }

  // ------------------------------------------------------------- handlers

  pub fn set_on_read(self: &Rc<Self>, cb: ReadHandler) {
    *self.on_read.borrow_mut() = Some(cb);
    if self.is_running.get() {
      self.want_rr_for_r.set(true);
      self.sync_watches();
    }
  }

  pub fn set_on_read_eof(&self, cb: StreamHandler) {
    *self.on_read_eof.borrow_mut() = Some(cb);
  }

  pub fn set_on_write_eof(&self, cb: StreamHandler) {
    *self.on_write_eof.borrow_mut() = Some(cb);
  }

  pub fn set_on_read_error(&self, cb: StreamErrorHandler) {
    *self.on_read_error.borrow_mut() = Some(cb);
  }

  pub fn set_on_write_error(&self, cb: StreamErrorHandler) {
    *self.on_write_error.borrow_mut() = Some(cb);
  }

  pub fn set_on_outgoing_empty(&self, cb: StreamHandler) {
    *self.on_outgoing_empty.borrow_mut() = Some(cb);
  }

  pub fn set_on_writeable_start(&self, cb: StreamHandler) {
    *self.on_writeable_start.borrow_mut() = Some(cb);
  }

  pub fn set_on_writeable_stop(&self, cb: StreamHandler) {
    *self.on_writeable_stop.borrow_mut() = Some(cb);
  }

  pub fn set_on_read_high_watermark(&self, cb: StreamHandler) {
    *self.on_read_high_watermark.borrow_mut() = Some(cb);
  }

  pub fn set_on_read_low_watermark(&self, cb: StreamHandler) {
    *self.on_read_low_watermark.borrow_mut() = Some(cb);
  }

  pub fn set_on_closed(&self, cb: Box<dyn FnOnce(&Rc<Stream>)>) {
    *self.on_closed.borrow_mut() = Some(cb);
  }

  pub fn set_on_error(&self, cb: crate::notifier::ErrorCallback) {
    self.core.set_on_error(cb);
  }

  pub fn set_encoding(&self, name: &str) -> Result<()> {
    *self.encoding.borrow_mut() = Some(encoding_by_name(name)?);
    Ok(())
  }

  // ------------------------------------------------------------ lifecycle

  pub fn start(self: &Rc<Self>) {
    if self.is_running.replace(true) {
      return;
    }
    if self.on_read.borrow().is_some() || !self.rqueue.borrow().is_empty() {
      self.want_rr_for_r.set(true);
    }
    if !self.wqueue.borrow().is_empty() {
      self.want_wr_for_w.set(true);
    }
    self.sync_watches();
  }

  pub fn stop(self: &Rc<Self>) {
    if !self.is_running.replace(false) {
      return;
    }
    self.want_rr_for_r.set(false);
    self.want_rr_for_w.set(false);
    self.want_wr_for_r.set(false);
    self.want_wr_for_w.set(false);
    self.sync_watches();
  }

  /// Requests write readiness on behalf of the read path, as a pipelined
  /// protocol needs after its read stalled on an outgoing EAGAIN.
  pub fn set_want_writeready_for_read(self: &Rc<Self>, on: bool) {
    self.want_wr_for_r.set(on);
    self.sync_watches();
  }

  /// Requests read readiness on behalf of the write path.
  pub fn set_want_readready_for_write(self: &Rc<Self>, on: bool) {
    self.want_rr_for_w.set(on);
    self.sync_watches();
  }

  /// Aborts in-flight writes with `StreamClosing` and closes immediately.
  pub fn close_now(self: &Rc<Self>) {
    if self.closed.replace(true) {
      return;
    }
    self.is_closing.set(true);
    let items: Vec<WriteItem> = self.wqueue.borrow_mut().drain(..).collect();
    for mut item in items {
      if let Some(cb) = item.on_error.take() {
        cb(self, &Error::StreamClosing);
      }
      if let Some(p) = item.promise.take() {
        p.fail(Error::StreamClosing);
      }
    }
    if let Some(el) = self.core.try_event_loop() {
      if let Some(fd) = self.read_fd() {
        el.unwatch_read_fd(fd);
      }
      if let Some(fd) = self.write_fd() {
        el.unwatch_write_fd(fd);
      }
    }
    self.watching_r.set(false);
    self.watching_w.set(false);
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
  }

  /// Closes once the write queue drains; immediately when already empty.
  pub fn close_when_empty(self: &Rc<Self>) {
    let empty = self.wqueue.borrow().is_empty();
    if empty {
      self.close_now();
    } else {
      self.is_closing.set(true);
    }
  }

  pub fn close(self: &Rc<Self>) {
    self.close_when_empty();
  }

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

  // ------------------------------------------------------------ readiness

  fn sync_watches(self: &Rc<Self>) {
    let el = match self.core.event_loop() {
      Ok(el) => el,
      Err(e) => {
        self.core.route_error(e);
        return;
      }
    };
    let want_r = self.want_rr_for_r.get() || self.want_rr_for_w.get();
    let want_w = self.want_wr_for_r.get() || self.want_wr_for_w.get();
    if let Some(fd) = self.read_fd() {
      if want_r && !self.watching_r.get() {
        let installed = el.watch_read_fd(
          fd,
          weak_cb(self, |this| this.on_readready()),
        );
        match installed {
          Ok(()) => self.watching_r.set(true),
          Err(e) => self.core.route_error(e),
        }
      } else if !want_r && self.watching_r.get() {
        el.unwatch_read_fd(fd);
        self.watching_r.set(false);
      }
    }
    if let Some(fd) = self.write_fd() {
      if want_w && !self.watching_w.get() {
        let installed = el.watch_write_fd(
          fd,
          weak_cb(self, |this| this.on_writeready()),
        );
        match installed {
          Ok(()) => self.watching_w.set(true),
          Err(e) => self.core.route_error(e),
        }
      } else if !want_w && self.watching_w.get() {
        el.unwatch_write_fd(fd);
        self.watching_w.set(false);
      }
    }
  }

  fn on_readready(self: &Rc<Self>) {
    if self.want_rr_for_r.get() {
      self.do_read();
    }
    if self.want_rr_for_w.get() {
      self.want_rr_for_w.set(false);
      self.sync_watches();
      self.do_write();
    }
  }

  fn on_writeready(self: &Rc<Self>) {
    if self.want_wr_for_r.get() {
      self.want_wr_for_r.set(false);
      self.sync_watches();
      self.do_read();
    }
    if self.want_wr_for_w.get() {
      self.do_write();
    }
  }

  // ------------------------------------------------------------ read path

  pub fn do_read(self: &Rc<Self>) {
    loop {
      let Some(fd) = self.read_fd() else {
        return;
      };
      let mut chunk = vec![0u8; self.read_len.get()];
      match fd_read(fd, &mut chunk) {
        Err(errno) => {
          let err = io::Error::from_raw_os_error(errno as i32);
          if !is_nonfatal(&err) {
            self.read_error(Error::Io(err));
          }
          return;
        }
        Ok(0) => {
          if !self.tail.get() {
            self.handle_read_eof();
          }
          return;
        }
        Ok(n) => {
          chunk.truncate(n);
          if !self.ingest(chunk) {
            return;
          }
          self.flush_reads(false);
          self.update_watermark();
          if !self.read_all.get() {
            return;
          }
        }
      }
    }
  }

  fn ingest(self: &Rc<Self>, chunk: Vec<u8>) -> bool {
    let decoded = {
      let encoding = self.encoding.borrow();
      match encoding.as_ref() {
        Some(encoding) => {
          let mut pending = self.undecoded.borrow_mut();
          pending.extend_from_slice(&chunk);
          encoding.decode(&mut pending)
        }
        None => Ok(chunk),
      }
    };
    match decoded {
      Ok(bytes) => {
        self.rbuf.borrow_mut().extend_from_slice(&bytes);
        true
      }
      Err(e) => {
        self.read_error(e);
        false
      }
    }
  }

  /// Dispatches one read: the head of the read queue if any, otherwise
  /// `on_read`. Returns whether draining should continue.
  fn flush_one_read(self: &Rc<Self>, eof: bool) -> bool {
    let item = self.rqueue.borrow_mut().pop_front();
    if let Some(mut item) = item {
      if item.cancelled() {
        // The handler is disabled but the queue keeps draining.
        return true;
      }
      let len_before = self.rbuf.borrow().len();
      let action = {
        let mut buf = self.rbuf.borrow_mut();
        (item.on_read)(self, &mut buf, eof)
      };
      return match action {
        ReadAction::Replace(cb) => {
          item.on_read = cb;
          self.rqueue.borrow_mut().push_front(item);
          true
        }
        ReadAction::Pop => true,
        ReadAction::Keep => {
          let grew = self.rbuf.borrow().len() > len_before;
          self.rqueue.borrow_mut().push_front(item);
          grew
        }
      };
    }
    // Queue empty: fall back to on_read. The handler is taken out for the
    // duration of the call so it may replace itself.
    let Some(mut handler) = self.on_read.borrow_mut().take() else {
      return false;
    };
    let len_before = self.rbuf.borrow().len();
    let action = {
      let mut buf = self.rbuf.borrow_mut();
      handler(self, &mut buf, eof)
    };
    {
      let mut slot = self.on_read.borrow_mut();
      match action {
        ReadAction::Replace(cb) => {
          if slot.is_none() {
            *slot = Some(cb);
          }
        }
        _ => {
          if slot.is_none() {
            *slot = Some(handler);
          }
        }
      }
    }
    self.rbuf.borrow().len() > len_before
  }

  fn flush_reads(self: &Rc<Self>, eof: bool) {
    if self.flushing_read.replace(true) {
      return;
    }
    loop {
      let has_input = eof || !self.rbuf.borrow().is_empty();
      if !has_input && self.rqueue.borrow().is_empty() {
        break;
      }
      if !self.flush_one_read(eof) {
        break;
      }
    }
    self.flushing_read.set(false);
  }

  fn handle_read_eof(self: &Rc<Self>) {
    self.read_eof.set(true);
    self.flush_reads(true);
    let cb = self.on_read_eof.borrow_mut().take();
    if let Some(mut cb) = cb {
      cb(self);
      *self.on_read_eof.borrow_mut() = Some(cb);
    }
    // Remaining queued read promises resolve empty at EOF; the queue is
    // dropped.
    let rest: Vec<ReadItem> = self.rqueue.borrow_mut().drain(..).collect();
    for item in rest {
      if let Some(p) = item.promise {
        if p.is_pending() {
          p.done((Vec::new(), true));
        }
      }
    }
    self.want_rr_for_r.set(false);
    self.sync_watches();
    if self.close_on_read_eof.get() {
      self.close_now();
    }
  }

  fn read_error(self: &Rc<Self>, err: Error) {
    if let Some(fd) = self.read_fd() {
      if let Some(el) = self.core.try_event_loop() {
        el.unwatch_read_fd(fd);
      }
      self.watching_r.set(false);
    }
    let cb = self.on_read_error.borrow_mut().take();
    match cb {
      Some(mut cb) => {
        cb(self, &err);
        *self.on_read_error.borrow_mut() = Some(cb);
      }
      None => self.core.route_error(err),
    }
  }

  fn update_watermark(self: &Rc<Self>) {
    let len = self.rbuf.borrow().len();
    if let Some(hwm) = self.read_hwm.get() {
      if len > hwm && !self.at_high_watermark.replace(true) {
        let cb = self.on_read_high_watermark.borrow_mut().take();
        match cb {
          Some(mut cb) => {
            cb(self);
            *self.on_read_high_watermark.borrow_mut() = Some(cb);
          }
          None => {
            // Default handler: stop asking for read readiness.
            self.want_rr_for_r.set(false);
            self.sync_watches();
          }
        }
      }
    }
    if let Some(lwm) = self.read_lwm.get() {
      if len < lwm && self.at_high_watermark.replace(false) {
        let cb = self.on_read_low_watermark.borrow_mut().take();
        match cb {
          Some(mut cb) => {
            cb(self);
            *self.on_read_low_watermark.borrow_mut() = Some(cb);
          }
          None => {
            self.want_rr_for_r.set(true);
            self.sync_watches();
          }
        }
      }
    }
  }

  // --------------------------------------------------------- read helpers

  fn push_read_item(self: &Rc<Self>, item: ReadItem) {
    self.rqueue.borrow_mut().push_back(item);
    if !self.read_eof.get() {
      self.want_rr_for_r.set(true);
      self.sync_watches();
    }
    // Drain whatever is already buffered (or already at EOF).
    self.flush_reads(self.read_eof.get());
    self.update_watermark();
  }

  /// Up to `n` bytes, as soon as any are available; empty at EOF.
  pub fn read_atmost(self: &Rc<Self>, n: usize) -> Promise<(Vec<u8>, bool)> {
    let p = match self.core.event_loop() {
      Ok(el) => Promise::new(&el),
      Err(e) => {
        let p = Promise::unbound();
        p.fail(e);
        return p;
      }
    };
    let done = p.clone();
    self.push_read_item(ReadItem {
      promise: Some(p.clone()),
      on_read: Box::new(move |_, buf, eof| {
        if !buf.is_empty() {
          let take = n.min(buf.len());
          let out: Vec<u8> = buf.drain(..take).collect();
          done.done((out, false));
          ReadAction::Pop
        } else if eof {
          done.done((Vec::new(), true));
          ReadAction::Pop
        } else {
          ReadAction::Keep
        }
      }),
    });
    p
  }

  /// Exactly `n` bytes, or everything remaining at EOF (flagged).
  pub fn read_exactly(self: &Rc<Self>, n: usize) -> Promise<(Vec<u8>, bool)> {
    let p = match self.core.event_loop() {
      Ok(el) => Promise::new(&el),
      Err(e) => {
        let p = Promise::unbound();
        p.fail(e);
        return p;
      }
    };
    let done = p.clone();
    self.push_read_item(ReadItem {
      promise: Some(p.clone()),
      on_read: Box::new(move |_, buf, eof| {
        if buf.len() >= n {
          let out: Vec<u8> = buf.drain(..n).collect();
          done.done((out, false));
          ReadAction::Pop
        } else if eof {
          done.done((std::mem::take(buf), true));
          ReadAction::Pop
        } else {
          ReadAction::Keep
        }
      }),
    });
    p
  }

  /// Up to and including the first match of `re`; the remainder at EOF.
  pub fn read_until_regex(
    self: &Rc<Self>,
    re: regex::bytes::Regex,
  ) -> Promise<(Vec<u8>, bool)> {
    let p = match self.core.event_loop() {
      Ok(el) => Promise::new(&el),
      Err(e) => {
        let p = Promise::unbound();
        p.fail(e);
        return p;
      }
    };
    let done = p.clone();
    self.push_read_item(ReadItem {
      promise: Some(p.clone()),
      on_read: Box::new(move |_, buf, eof| {
        if let Some(m) = re.find(buf) {
          let end = m.end();
          let out: Vec<u8> = buf.drain(..end).collect();
          done.done((out, false));
          ReadAction::Pop
        } else if eof {
          done.done((std::mem::take(buf), true));
          ReadAction::Pop
        } else {
          ReadAction::Keep
        }
      }),
    });
    p
  }

  /// Up to and including the literal `needle`; the remainder at EOF.
  pub fn read_until(
    self: &Rc<Self>,
    needle: &[u8],
  ) -> Promise<(Vec<u8>, bool)> {
    let escaped: String =
      needle.iter().map(|b| format!("\\x{b:02x}")).collect();
    let re = regex::bytes::Regex::new(&format!("(?-u:{escaped})"))
      .expect("escaped literal is a valid pattern");
    self.read_until_regex(re)
  }

  /// Everything up to EOF.
  pub fn read_until_eof(self: &Rc<Self>) -> Promise<(Vec<u8>, bool)> {
    let p = match self.core.event_loop() {
      Ok(el) => Promise::new(&el),
      Err(e) => {
        let p = Promise::unbound();
        p.fail(e);
        return p;
      }
    };
    let done = p.clone();
    self.push_read_item(ReadItem {
      promise: Some(p.clone()),
      on_read: Box::new(move |_, buf, eof| {
        if eof {
          done.done((std::mem::take(buf), true));
          ReadAction::Pop
        } else {
          ReadAction::Keep
        }
      }),
    });
    p
  }

  // ----------------------------------------------------------- write path

  /// Appends a write item. Plain bytes run through the encoder; generator
  /// and promise payloads are written raw as they materialize.
  pub fn write(self: &Rc<Self>, data: Vec<u8>) -> Result<()> {
    self.write_with(WriteData::Bytes(data), WriteOptions::default())?;
    Ok(())
  }

  pub fn write_with(
    self: &Rc<Self>,
    data: WriteData,
    opts: WriteOptions,
  ) -> Result<Option<Promise<()>>> {
    if self.is_closing.get() {
      return Err(Error::StreamClosing);
    }
    let data = match data {
      WriteData::Bytes(bytes) => {
        let encoding = self.encoding.borrow();
        match encoding.as_ref() {
          Some(encoding) => WriteData::Bytes(encoding.encode(&bytes)?),
          None => WriteData::Bytes(bytes),
        }
      }
      other => other,
    };
    let promise = if opts.want_promise {
      Some(Promise::new(&self.core.event_loop()?))
    } else {
      None
    };
    self.wqueue.borrow_mut().push_back(WriteItem {
      data,
      writelen: opts.writelen.unwrap_or(self.write_len.get()),
      on_write: opts.on_write,
      on_flush: opts.on_flush,
      on_error: opts.on_error,
      watching: false,
      promise: promise.clone(),
    });
    if self.autoflush.get() && self.write_fd().is_some() {
      self.do_write();
    }
    if !self.wqueue.borrow().is_empty() {
      self.want_wr_for_w.set(true);
      self.sync_watches();
    }
    Ok(promise)
  }

  pub fn do_write(self: &Rc<Self>) {
    loop {
      let item = self.wqueue.borrow_mut().pop_front();
      let Some(mut item) = item else {
        self.outgoing_empty();
        return;
      };
      match item.data {
        WriteData::Generator(ref mut generator) => {
          match generator() {
            None => {
              // Done producing.
              if let Some(cb) = item.on_flush.take() {
                cb(self);
              }
              if let Some(p) = item.promise.take() {
                p.done(());
              }
              continue;
            }
            Some(bytes) => {
              let produced = WriteItem {
                data: WriteData::Bytes(bytes),
                writelen: item.writelen,
                on_write: None,
                on_flush: None,
                on_error: None,
                watching: false,
                promise: None,
              };
              let mut q = self.wqueue.borrow_mut();
              q.push_front(item);
              q.push_front(produced);
              continue;
            }
          }
        }
        WriteData::Pending(ref pending) => {
          match pending.peek() {
            None => {
              if !item.watching {
                item.watching = true;
                let weak = Rc::downgrade(self);
                pending.on_ready(move |_| {
                  if let Some(this) = weak.upgrade() {
                    this.do_write();
                  }
                });
              }
              self.wqueue.borrow_mut().push_front(item);
              return;
            }
            Some(Outcome::Done(bytes)) => {
              item.data = WriteData::Bytes(bytes);
              item.watching = false;
              self.wqueue.borrow_mut().push_front(item);
              continue;
            }
            Some(Outcome::Failed(err)) => {
              if let Some(cb) = item.on_error.take() {
                cb(self, &err);
              }
              if let Some(p) = item.promise.take() {
                p.fail(Error::Io(io::Error::other(err.to_string())));
              }
              continue;
            }
            Some(Outcome::Cancelled) => continue,
          }
        }
        WriteData::Bytes(_) => {}
      }
      if !self.write_bytes_item(item) {
        return;
      }
      if !self.write_all.get() {
        return;
      }
    }
  }

  /// Writes one plain-bytes head item. Returns whether the drain loop
  /// should continue.
  fn write_bytes_item(self: &Rc<Self>, mut item: WriteItem) -> bool {
    // Reduce pass: fold following compatible plain items into this one to
    // save syscalls. Contents and ordering are preserved.
    if item.plain() {
      let mut q = self.wqueue.borrow_mut();
      while let Some(next) = q.front() {
        if next.plain() && next.writelen == item.writelen {
          let WriteData::Bytes(next_bytes) =
            q.pop_front().expect("front exists").data
          else {
            unreachable!("plain item is bytes");
          };
          let WriteData::Bytes(ref mut bytes) = item.data else {
            unreachable!("plain item is bytes");
          };
          bytes.extend_from_slice(&next_bytes);
        } else {
          break;
        }
      }
    }
    let Some(fd) = self.write_fd() else {
      self.write_error_item(item, Error::Unspecified("write handle"));
      return false;
    };
    let WriteData::Bytes(ref mut bytes) = item.data else {
      unreachable!("write_bytes_item takes bytes items");
    };
    let len = item.writelen.min(bytes.len());
    match fd_write(fd, &bytes[..len]) {
      Ok(written) => {
        if !self.writeable.replace(true) {
          let cb = self.on_writeable_start.borrow_mut().take();
          if let Some(mut cb) = cb {
            cb(self);
            *self.on_writeable_start.borrow_mut() = Some(cb);
          }
        }
        bytes.drain(..written);
        log::debug!("{}wrote {written} bytes", self.core.leader());
        if let Some(cb) = item.on_write.as_mut() {
          cb(self, written);
        }
        if let WriteData::Bytes(ref bytes) = item.data {
          if bytes.is_empty() {
            if let Some(cb) = item.on_flush.take() {
              cb(self);
            }
            if let Some(p) = item.promise.take() {
              p.done(());
            }
          } else {
            self.wqueue.borrow_mut().push_front(item);
          }
        }
        true
      }
      Err(errno) => {
        let err = io::Error::from_raw_os_error(errno as i32);
        if is_interrupted(&err) {
          self.wqueue.borrow_mut().push_front(item);
          true
        } else if is_wouldblock(&err) {
          self.wqueue.borrow_mut().push_front(item);
          if self.writeable.replace(false) {
            let cb = self.on_writeable_stop.borrow_mut().take();
            if let Some(mut cb) = cb {
              cb(self);
              *self.on_writeable_stop.borrow_mut() = Some(cb);
            }
          }
          self.want_wr_for_w.set(true);
          self.sync_watches();
          false
        } else if is_broken_pipe(&err) {
          self.write_eof.set(true);
          let cb = self.on_write_eof.borrow_mut().take();
          if let Some(mut cb) = cb {
            cb(self);
            *self.on_write_eof.borrow_mut() = Some(cb);
          }
          self.write_error_item(item, Error::Io(err));
          false
        } else {
          self.write_error_item(item, Error::Io(err));
          false
        }
      }
    }
  }

  fn write_error_item(self: &Rc<Self>, mut item: WriteItem, err: Error) {
    if let Some(cb) = item.on_error.take() {
      cb(self, &err);
    }
    if let Some(p) = item.promise.take() {
      p.fail(Error::Io(io::Error::other(err.to_string())));
    }
    let cb = self.on_write_error.borrow_mut().take();
    match cb {
      Some(mut cb) => {
        cb(self, &err);
        *self.on_write_error.borrow_mut() = Some(cb);
      }
      None => {
        log::error!("{}write error: {err}", self.core.leader());
        self.close_now();
      }
    }
  }

  fn outgoing_empty(self: &Rc<Self>) {
    self.want_wr_for_w.set(false);
    self.sync_watches();
    let cb = self.on_outgoing_empty.borrow_mut().take();
    if let Some(mut cb) = cb {
      cb(self);
      *self.on_outgoing_empty.borrow_mut() = Some(cb);
    }
    if self.is_closing.get() {
      self.close_now();
    }
  }
}

impl Drop for Stream {
  fn drop(&mut self) {
    if !self.closed.get() {
      let Some(el) = self.core.try_event_loop() else {
        return;
      };
      if let Some(fd) = self.fds.borrow().read_fd() {
        el.unwatch_read_fd(fd);
      }
      if let Some(fd) = self.fds.borrow().write_fd() {
        el.unwatch_write_fd(fd);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::os::fd::OwnedFd;

  use nix::sys::socket::socketpair;
  use nix::sys::socket::AddressFamily;
  use nix::sys::socket::SockFlag;
  use nix::sys::socket::SockType;

  use super::*;
  use crate::handle::set_nonblocking;
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

  fn stream_over(name: &str, fd: OwnedFd) -> Rc<Stream> {
    let s =
      Stream::new(name, HandleFds::Duplex(fd), StreamOptions::default())
        .unwrap();
    s.start();
    s
  }

  fn drive(el: &Rc<EventLoop>, mut until: impl FnMut() -> bool) {
    let deadline =
      std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !until() && std::time::Instant::now() < deadline {
      el.turn(Some(std::time::Duration::from_millis(10)));
    }
    assert!(until(), "condition not reached before deadline");
  }

  #[test]
  fn read_exactly_resolves_with_n_bytes() {
    use std::os::fd::AsRawFd;
    let el = EventLoop::current().unwrap();
    let (a, b) = pair();
    let s = stream_over("st-exact", a);
    let p = s.read_exactly(5);
    fd_write(b.as_raw_fd(), b"0123456789").unwrap();
    drive(&el, || !p.is_pending());
    match p.peek() {
      Some(Outcome::Done((bytes, eof))) => {
        assert_eq!(bytes, b"01234");
        assert!(!eof);
      }
      other => panic!("unexpected outcome: {other:?}"),
    }
    // The rest stays buffered for the next reader.
    let q = s.read_exactly(5);
    drive(&el, || !q.is_pending());
    match q.peek() {
      Some(Outcome::Done((bytes, eof))) => {
        assert_eq!(bytes, b"56789");
        assert!(!eof);
      }
      other => panic!("unexpected outcome: {other:?}"),
    }
  }

  #[test]
  fn read_exactly_short_at_eof() {
    use std::os::fd::AsRawFd;
    let el = EventLoop::current().unwrap();
    let (a, b) = pair();
    let s = stream_over("st-short", a);
    let p = s.read_exactly(100);
    fd_write(b.as_raw_fd(), b"abc").unwrap();
    drop(b);
    drive(&el, || !p.is_pending());
    match p.peek() {
      Some(Outcome::Done((bytes, eof))) => {
        assert_eq!(bytes, b"abc");
        assert!(eof);
      }
      other => panic!("unexpected outcome: {other:?}"),
    }
  }

  #[test]
  fn read_until_includes_the_match() {
    use std::os::fd::AsRawFd;
    let el = EventLoop::current().unwrap();
    let (a, b) = pair();
    let s = stream_over("st-until", a);
    let p = s.read_until(b"\n");
    fd_write(b.as_raw_fd(), b"one\ntwo").unwrap();
    drive(&el, || !p.is_pending());
    match p.peek() {
      Some(Outcome::Done((bytes, _))) => assert_eq!(bytes, b"one\n"),
      other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(s.buffered(), 3);
  }

  #[test]
  fn writes_are_fifo_and_coalesced() {
    use std::os::fd::AsRawFd;
    let el = EventLoop::current().unwrap();
    let (a, b) = pair();
    set_nonblocking(b.as_raw_fd()).unwrap();
    let s = stream_over("st-order", a);
    s.write(b"one ".to_vec()).unwrap();
    s.write(b"two ".to_vec()).unwrap();
    s.write(b"three".to_vec()).unwrap();
    s.do_write();
    let mut got = vec![0u8; 64];
    drive(&el, || {
      matches!(fd_read(b.as_raw_fd(), &mut got), Ok(n) if n == 13)
    });
    assert_eq!(&got[..13], b"one two three");
  }

  #[test]
  fn generator_items_emit_until_none() {
    use std::os::fd::AsRawFd;
    let el = EventLoop::current().unwrap();
    let (a, b) = pair();
    let s = stream_over("st-gen", a);
    let mut remaining = 3u8;
    let flushed = Rc::new(Cell::new(false));
    let opts = WriteOptions {
      on_flush: Some({
        let flushed = Rc::clone(&flushed);
        Box::new(move |_| flushed.set(true))
      }),
      ..Default::default()
    };
    s.write_with(
      WriteData::Generator(Box::new(move || {
        if remaining == 0 {
          None
        } else {
          remaining -= 1;
          Some(vec![b'0' + remaining])
        }
      })),
      opts,
    )
    .unwrap();
    s.do_write();
    let mut got = [0u8; 8];
    drive(&el, || flushed.get());
    let n = fd_read(b.as_raw_fd(), &mut got).unwrap();
    assert_eq!(&got[..n], b"210");
  }

  #[test]
  fn promise_payload_defers_the_queue() {
    use std::os::fd::AsRawFd;
    let el = EventLoop::current().unwrap();
    let (a, b) = pair();
    let s = stream_over("st-defer", a);
    let payload: Promise<Vec<u8>> = Promise::new(&el);
    s.write_with(
      WriteData::Pending(payload.clone()),
      WriteOptions::default(),
    )
    .unwrap();
    s.write(b" tail".to_vec()).unwrap();
    s.do_write();
    // Nothing may be delivered while the head is pending.
    let mut got = [0u8; 16];
    assert!(fd_read(b.as_raw_fd(), &mut got).is_err());
    payload.done(b"head".to_vec());
    drive(&el, || s.pending_writes() == 0);
    let n = fd_read(b.as_raw_fd(), &mut got).unwrap();
    assert_eq!(&got[..n], b"head tail");
  }

  #[test]
  fn writes_on_a_closing_stream_are_rejected() {
    let (a, _b) = pair();
    let s = stream_over("st-closing", a);
    s.write(b"x".to_vec()).unwrap();
    s.close_when_empty();
    assert!(matches!(
      s.write(b"y".to_vec()),
      Err(Error::StreamClosing)
    ));
  }

  #[test]
  fn close_now_fails_inflight_write_promises() {
    let (a, _b) = pair();
    let s = stream_over("st-abort", a);
    let opts = WriteOptions {
      want_promise: true,
      ..Default::default()
    };
    let p = s
      .write_with(WriteData::Bytes(b"data".to_vec()), opts)
      .unwrap()
      .unwrap();
    s.close_now();
    assert!(p.is_failed());
    assert!(s.is_closed());
  }

  #[test]
  fn watermarks_toggle_read_interest() {
    use std::os::fd::AsRawFd;
    let el = EventLoop::current().unwrap();
    let (a, b) = pair();
    let s = Stream::new(
      "st-marks",
      HandleFds::Duplex(a),
      StreamOptions {
        read_high_watermark: Some(4),
        read_low_watermark: Some(2),
        ..Default::default()
      },
    )
    .unwrap();
    s.start();
    let p = s.read_exactly(1);
    fd_write(b.as_raw_fd(), b"abcdef").unwrap();
    drive(&el, || !p.is_pending());
    // 5 bytes remain buffered, above the high watermark: interest off.
    assert!(s.at_high_watermark.get());
    assert!(!s.want_rr_for_r.get());
    // Drain below the low watermark: interest returns.
    let q = s.read_exactly(4);
    drive(&el, || !q.is_pending());
    assert!(!s.at_high_watermark.get());
    assert!(s.want_rr_for_r.get());
  }

  #[test]
  fn utf8_encoding_stops_at_partial_scalar() {
    let enc = Utf8Encoding;
    let mut buf = "héllo".as_bytes().to_vec();
    let split = buf.split_off(2); // cuts the two-byte é in half
    let mut pending = buf;
    let out = enc.decode(&mut pending).unwrap();
    assert_eq!(out, b"h");
    assert_eq!(pending.len(), 1);
    pending.extend_from_slice(&split);
    let out = enc.decode(&mut pending).unwrap();
    assert_eq!(out, "éllo".as_bytes());
    assert!(pending.is_empty());
  }

  #[test]
  fn cancelled_read_item_drains_without_completing() {
    use std::os::fd::AsRawFd;
    let el = EventLoop::current().unwrap();
    let (a, b) = pair();
    let s = stream_over("st-cancel", a);
    let p = s.read_exactly(3);
    let q = s.read_exactly(3);
    p.cancel();
    fd_write(b.as_raw_fd(), b"abcdef").unwrap();
    drive(&el, || !q.is_pending());
    assert!(p.is_cancelled());
    // The cancelled head was skipped; the second item got the first bytes.
    match q.peek() {
      Some(Outcome::Done((bytes, _))) => assert_eq!(bytes, b"abc"),
      other => panic!("unexpected outcome: {other:?}"),
    }
  }
}
