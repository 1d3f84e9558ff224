// Copyright 2018-2025 the Deno authors. MIT license.

//! Length-prefixed record transport over a UNIX socketpair.
//!
//! Each record is framed as a host-endian `u32` length followed by the
//! codec payload — no magic, no version. Both peers must use the same
//! codec; agreement is the caller's responsibility.
//!
//! A channel is built in the parent before a fork with both socket ends;
//! each process then calls [`start`](Channel::start) for its direction,
//! which drops the opposite end's fd. Sync endpoints use blocking
//! unbuffered reads and writes directly on the fd, so no userspace buffer
//! straddles the fork; an async endpoint layers a [`Stream`] over its fd.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::rc::Rc;

use nix::sys::socket::socketpair;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::error::Error;
use crate::error::Result;
use crate::handle::fd_write;
use crate::handle::set_nonblocking;
use crate::handle::HandleFds;
use crate::notifier::NotifierCore;
use crate::promise::Promise;
use crate::stream::ReadAction;
use crate::stream::Stream;
use crate::stream::StreamOptions;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
  #[default]
  Sync,
  Async,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
  Read,
  Write,
}

/// What an async receive handler is given: the next record, or EOF.
pub enum Received<T> {
  Record(T),
  Eof,
}

pub type RecvHandler<T> = Box<dyn FnOnce(Received<T>)>;

#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelOptions {
  pub codec: Codec,
  pub read_mode: Mode,
  pub write_mode: Mode,
}

pub struct Channel<T> {
  core: NotifierCore,
  codec: Codec,
  read_mode: Mode,
  write_mode: Mode,
  rd: RefCell<Option<OwnedFd>>,
  wr: RefCell<Option<OwnedFd>>,
  stream: RefCell<Option<Rc<Stream>>>,
  result_queue: RefCell<VecDeque<RecvHandler<T>>>,
  on_recv: RefCell<Option<Box<dyn FnMut(&Rc<Channel<T>>, T)>>>,
  on_eof: RefCell<Option<Box<dyn FnMut(&Rc<Channel<T>>)>>>,
}

impl<T> Channel<T>
where
  T: Serialize + DeserializeOwned + 'static,
{
  /// Builds the socketpair: the reader end is shut down for writing, the
  /// writer end for reading.
  pub fn new(name: &str, opts: ChannelOptions) -> Result<Rc<Channel<T>>> {
    let el = crate::EventLoop::current()?;
    let core = NotifierCore::new("channel", name, &el)?;
    let (rd, wr) = socketpair(
      AddressFamily::Unix,
      SockType::Stream,
      None,
      SockFlag::empty(),
    )?;
    // SAFETY: both fds were just created and are owned above.
    unsafe {
      libc::shutdown(rd.as_raw_fd(), libc::SHUT_WR);
      libc::shutdown(wr.as_raw_fd(), libc::SHUT_RD);
    }
    Ok(Rc::new(Channel {
      core,
      codec: opts.codec,
      read_mode: opts.read_mode,
      write_mode: opts.write_mode,
      rd: RefCell::new(Some(rd)),
      wr: RefCell::new(Some(wr)),
      stream: RefCell::new(None),
      result_queue: RefCell::new(VecDeque::new()),
      on_recv: RefCell::new(None),
      on_eof: RefCell::new(None),
    }))
  }

  pub fn core(&self) -> &NotifierCore {
    &self.core
  }

  pub fn read_mode(&self) -> Mode {
    self.read_mode
  }

  pub fn write_mode(&self) -> Mode {
    self.write_mode
  }

  pub fn read_fd(&self) -> Option<RawFd> {
    self.rd.borrow().as_ref().map(AsRawFd::as_raw_fd)
  }

  pub fn write_fd(&self) -> Option<RawFd> {
    self.wr.borrow().as_ref().map(AsRawFd::as_raw_fd)
  }

  pub fn set_on_recv(&self, cb: Box<dyn FnMut(&Rc<Channel<T>>, T)>) {
    *self.on_recv.borrow_mut() = Some(cb);
  }

  pub fn set_on_eof(&self, cb: Box<dyn FnMut(&Rc<Channel<T>>)>) {
    *self.on_eof.borrow_mut() = Some(cb);
  }

  /// Commits this endpoint to one direction: the opposite fd is closed,
  /// and an async endpoint gets its stream.
  pub fn start(self: &Rc<Self>, dir: Dir) -> Result<()> {
    match dir {
      Dir::Read => {
        self.wr.borrow_mut().take();
        if self.read_mode == Mode::Async {
          let fd = self
            .rd
            .borrow_mut()
            .take()
            .ok_or(Error::Unspecified("read handle"))?;
          set_nonblocking(fd.as_raw_fd())?;
          let stream = Stream::new(
            &format!("{}.r", self.core.name()),
            HandleFds::Half {
              rd: Some(fd),
              wr: None,
            },
            StreamOptions::default(),
          )?;
          let weak = Rc::downgrade(self);
          stream.set_on_read(Box::new(move |_, buf, eof| {
            let Some(ch) = weak.upgrade() else {
              return ReadAction::Pop;
            };
            ch.parse_frames(buf);
            if eof {
              ch.dispatch_eof();
            }
            ReadAction::Keep
          }));
          stream.start();
          *self.stream.borrow_mut() = Some(stream);
        }
      }
      Dir::Write => {
        self.rd.borrow_mut().take();
        if self.write_mode == Mode::Async {
          let fd = self
            .wr
            .borrow_mut()
            .take()
            .ok_or(Error::Unspecified("write handle"))?;
          set_nonblocking(fd.as_raw_fd())?;
          let stream = Stream::new(
            &format!("{}.w", self.core.name()),
            HandleFds::Half {
              rd: None,
              wr: Some(fd),
            },
            StreamOptions {
              autoflush: true,
              ..Default::default()
            },
          )?;
          stream.start();
          *self.stream.borrow_mut() = Some(stream);
        }
      }
    }
    Ok(())
  }

  pub fn stop(self: &Rc<Self>, dir: Dir) {
    if let Some(stream) = self.stream.borrow_mut().take() {
      stream.stop();
    }
    match dir {
      Dir::Read => {
        self.rd.borrow_mut().take();
      }
      Dir::Write => {
        self.wr.borrow_mut().take();
      }
    }
  }

  // ----------------------------------------------------------------- send

  /// Frames and writes one record. Returns the payload length on success.
  pub fn send(self: &Rc<Self>, record: &T) -> Option<usize> {
    let payload = match self.codec.encode(record) {
      Ok(payload) => payload,
      Err(e) => {
        log::error!("{}send encode: {e}", self.core.leader());
        return None;
      }
    };
    let mut frame = (payload.len() as u32).to_ne_bytes().to_vec();
    frame.extend_from_slice(&payload);
    match self.write_mode {
      Mode::Sync => {
        let wr = self.wr.borrow();
        let Some(fd) = wr.as_ref().map(AsRawFd::as_raw_fd) else {
          log::error!("{}send on a read-only channel", self.core.leader());
          return None;
        };
        match write_all(fd, &frame) {
          Ok(()) => {
            log::debug!("{}sent {} bytes", self.core.leader(), payload.len());
            Some(payload.len())
          }
          Err(e) => {
            log::error!("{}send: {e}", self.core.leader());
            None
          }
        }
      }
      Mode::Async => {
        let stream = self.stream.borrow();
        let Some(stream) = stream.as_ref() else {
          log::error!("{}send before start", self.core.leader());
          return None;
        };
        match stream.write(frame) {
          Ok(()) => Some(payload.len()),
          Err(e) => {
            log::error!("{}send: {e}", self.core.leader());
            None
          }
        }
      }
    }
  }

  // ----------------------------------------------------------------- recv

  /// Blocking receive: exactly four length bytes, then exactly `length`
  /// payload bytes. `None` on EOF or error (errors are logged).
  pub fn recv(&self) -> Option<T> {
    let fd = {
      let rd = self.rd.borrow();
      rd.as_ref().map(AsRawFd::as_raw_fd)?
    };
    let mut header = Vec::with_capacity(4);
    match read_exactly(fd, &mut header, 4) {
      Ok(4) => {}
      Ok(_) => return None,
      Err(e) => {
        log::error!("{}recv header: {e}", self.core.leader());
        return None;
      }
    }
    let len =
      u32::from_ne_bytes(header[..4].try_into().expect("4 bytes")) as usize;
    let mut payload = Vec::with_capacity(len);
    match read_exactly(fd, &mut payload, len) {
      Ok(n) if n == len => {}
      Ok(_) => return None,
      Err(e) => {
        log::error!("{}recv payload: {e}", self.core.leader());
        return None;
      }
    }
    match self.codec.decode(&payload) {
      Ok(record) => {
        log::debug!("{}received {len} bytes", self.core.leader());
        Some(record)
      }
      Err(e) => {
        log::error!("{}recv decode: {e}", self.core.leader());
        None
      }
    }
  }

  /// Queues a one-shot handler for the next record (or EOF) on an async
  /// read endpoint. Handlers drain FIFO, ahead of `on_recv`.
  pub fn recv_with(&self, handler: RecvHandler<T>) {
    self.result_queue.borrow_mut().push_back(handler);
  }

  /// Promise flavour of [`recv_with`](Self::recv_with): resolves with the
  /// next record, fails at EOF.
  pub fn recv_async(self: &Rc<Self>) -> Promise<T> {
    let p = match self.core.event_loop() {
      Ok(el) => Promise::new(&el),
      Err(e) => {
        let p = Promise::unbound();
        p.fail(e);
        return p;
      }
    };
    let promise = p.clone();
    self.recv_with(Box::new(move |received| match received {
      Received::Record(record) => promise.done(record),
      Received::Eof => {
        promise.fail(Error::Io(io::ErrorKind::UnexpectedEof.into()))
      }
    }));
    p
  }

  fn parse_frames(self: &Rc<Self>, buf: &mut Vec<u8>) {
    loop {
      if buf.len() < 4 {
        return;
      }
      let len =
        u32::from_ne_bytes(buf[..4].try_into().expect("4 bytes")) as usize;
      if buf.len() < 4 + len {
        return;
      }
      let payload = buf[4..4 + len].to_vec();
      buf.drain(..4 + len);
      match self.codec.decode(&payload) {
        Ok(record) => self.dispatch_record(record),
        Err(e) => log::error!("{}frame decode: {e}", self.core.leader()),
      }
    }
  }

  fn dispatch_record(self: &Rc<Self>, record: T) {
    let handler = self.result_queue.borrow_mut().pop_front();
    if let Some(handler) = handler {
      handler(Received::Record(record));
      return;
    }
    let cb = self.on_recv.borrow_mut().take();
    match cb {
      Some(mut cb) => {
        cb(self, record);
        let mut slot = self.on_recv.borrow_mut();
        if slot.is_none() {
          *slot = Some(cb);
        }
      }
      // A record with nobody to receive it is a wiring bug, not a
      // droppable frame.
      None => self.core.route_error(Error::EventUnknown("on_recv")),
    }
  }

  fn dispatch_eof(self: &Rc<Self>) {
    let pending: Vec<RecvHandler<T>> =
      self.result_queue.borrow_mut().drain(..).collect();
    for handler in pending {
      handler(Received::Eof);
    }
    let cb = self.on_eof.borrow_mut().take();
    if let Some(mut cb) = cb {
      cb(self);
      let mut slot = self.on_eof.borrow_mut();
      if slot.is_none() {
        *slot = Some(cb);
      }
    }
  }
}

fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
  while !data.is_empty() {
    match fd_write(fd, data) {
      Ok(n) => data = &data[n..],
      Err(nix::Error::EINTR) => {}
      Err(e) => return Err(e.into()),
    }
  }
  Ok(())
}

/// Appends reads to `buf` until it holds `n` bytes. Returns `n` on
/// success, `0` as the EOF sentinel when the peer closed early, and the
/// error for anything else.
pub fn read_exactly(fd: RawFd, buf: &mut Vec<u8>, n: usize) -> Result<usize> {
  let mut chunk = vec![0u8; n.max(1)];
  while buf.len() < n {
    let want = n - buf.len();
    match crate::handle::fd_read(fd, &mut chunk[..want]) {
      Ok(0) => return Ok(0),
      Ok(got) => buf.extend_from_slice(&chunk[..got]),
      Err(nix::Error::EINTR) => {}
      Err(e) => return Err(e.into()),
    }
  }
  Ok(n)
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::cell::RefCell;

  use serde::Deserialize;

  use super::*;
  use crate::EventLoop;

  #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
  struct Ping {
    id: u64,
    args: Vec<u32>,
  }

  #[test]
  fn sync_round_trip_preserves_records() {
    let ch: Rc<Channel<Ping>> =
      Channel::new("ch-sync", ChannelOptions::default()).unwrap();
    let sent = Ping {
      id: 1,
      args: vec![10, 20, 30],
    };
    assert!(ch.send(&sent).is_some());
    assert_eq!(ch.recv(), Some(sent));
  }

  #[test]
  fn recv_returns_none_at_eof() {
    let ch: Rc<Channel<Ping>> =
      Channel::new("ch-eof", ChannelOptions::default()).unwrap();
    ch.wr.borrow_mut().take();
    assert_eq!(ch.recv(), None);
  }

  #[test]
  fn async_read_dispatches_frames_then_eof() {
    let el = EventLoop::current().unwrap();
    let ch: Rc<Channel<Ping>> = Channel::new(
      "ch-async",
      ChannelOptions {
        read_mode: Mode::Async,
        ..Default::default()
      },
    )
    .unwrap();
    for id in 1..=3 {
      ch.send(&Ping {
        id,
        args: vec![id as u32],
      });
    }
    let got = Rc::new(RefCell::new(Vec::new()));
    let eof = Rc::new(Cell::new(false));
    {
      let got = Rc::clone(&got);
      ch.set_on_recv(Box::new(move |_, ping: Ping| {
        got.borrow_mut().push(ping.id);
      }));
    }
    {
      let eof = Rc::clone(&eof);
      ch.set_on_eof(Box::new(move |_| eof.set(true)));
    }
    // Frames are already buffered in the socket; committing to the read
    // side drops the writer end, so EOF follows the data.
    ch.start(Dir::Read).unwrap();
    let deadline =
      std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !eof.get() && std::time::Instant::now() < deadline {
      el.turn(Some(std::time::Duration::from_millis(10)));
    }
    assert_eq!(*got.borrow(), vec![1, 2, 3]);
    assert!(eof.get());
  }

  #[test]
  fn queued_receive_handlers_run_before_on_recv() {
    let el = EventLoop::current().unwrap();
    let ch: Rc<Channel<Ping>> = Channel::new(
      "ch-queue",
      ChannelOptions {
        read_mode: Mode::Async,
        ..Default::default()
      },
    )
    .unwrap();
    for id in [7, 8] {
      ch.send(&Ping { id, args: vec![] });
    }
    let fallback = Rc::new(RefCell::new(Vec::new()));
    {
      let fallback = Rc::clone(&fallback);
      ch.set_on_recv(Box::new(move |_, ping: Ping| {
        fallback.borrow_mut().push(ping.id);
      }));
    }
    let first = ch.recv_async();
    ch.start(Dir::Read).unwrap();
    let outcome = first.wait(Some(5.0)).expect("first record");
    match outcome {
      crate::promise::Outcome::Done(ping) => assert_eq!(ping.id, 7),
      other => panic!("unexpected outcome: {other:?}"),
    }
    let deadline =
      std::time::Instant::now() + std::time::Duration::from_secs(5);
    while fallback.borrow().is_empty()
      && std::time::Instant::now() < deadline
    {
      el.turn(Some(std::time::Duration::from_millis(10)));
    }
    assert_eq!(*fallback.borrow(), vec![8]);
  }
}
