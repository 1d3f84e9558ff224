// Copyright 2018-2025 the Deno authors. MIT license.

//! A forked worker: one [`Process`] plus its call and return channels.
//!
//! Call channels carry `(call_id, params)` parent → child; return
//! channels carry `(call_id, result)` child → parent. The child runs one
//! of two shapes:
//!
//! - **sync**: a blocking recv → compute → reply loop, one call channel,
//!   no event loop of its own;
//! - **async**: a fresh event loop in the child, each call channel's
//!   async receiver wired to its handler, SIGTERM wired to
//!   [`terminate`](crate::terminate), optional `before`/`after` hooks
//!   around the loop and a final blocking reap of grandchildren.
//!
//! The child is async when more than one receive handler is configured
//! or when the call mode is forced async.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use spindle_core::error::Error;
use spindle_core::error::Result;
use spindle_core::notifier::NotifierCore;
use spindle_core::Channel;
use spindle_core::ChannelOptions;
use spindle_core::Codec;
use spindle_core::Dir;
use spindle_core::EventLoop;
use spindle_core::Mode;

use crate::builder::Builder;
use crate::process::ChildCode;
use crate::process::ExitHandler;
use crate::process::Process;
use crate::terminate;

pub type CallRecord<P> = (u64, P);
pub type ReplyRecord<R> = (u64, R);

/// Child-side compute handler.
pub type ComputeHandler<P, R> = Rc<dyn Fn(P) -> Result<R>>;
/// Parent-side result handler.
pub type ReturnHandler<R> = Box<dyn FnMut(u64, R)>;
pub type HookFn = Box<dyn FnOnce()>;

pub struct RoutineOptions<P, R> {
  pub on_recv: Vec<ComputeHandler<P, R>>,
  pub on_return: Option<ReturnHandler<R>>,
  /// Forces the call side async even with a single handler.
  pub call_mode: Mode,
  /// Calls served before the worker retires.
  pub max_calls: Option<usize>,
  pub return_channel: bool,
  /// Async child only: runs before the nested loop starts.
  pub before: Option<HookFn>,
  /// Async child only: runs after the nested loop exits.
  pub after: Option<HookFn>,
  pub codec: Codec,
  pub on_exit: Option<ExitHandler>,
}

impl<P, R> Default for RoutineOptions<P, R> {
  fn default() -> RoutineOptions<P, R> {
    RoutineOptions {
      on_recv: Vec::new(),
      on_return: None,
      call_mode: Mode::Sync,
      max_calls: None,
      return_channel: false,
      before: None,
      after: None,
      codec: Codec::Bincode,
      on_exit: None,
    }
  }
}

pub struct Routine<P, R> {
  core: NotifierCore,
  process: RefCell<Option<Rc<Process>>>,
  call_chs: Vec<Rc<Channel<CallRecord<P>>>>,
  ret_chs: Vec<Rc<Channel<ReplyRecord<R>>>>,
  on_return: Rc<RefCell<Option<ReturnHandler<R>>>>,
  on_exit: Rc<RefCell<Option<ExitHandler>>>,
  is_running: Cell<bool>,
}

impl<P, R> Routine<P, R>
where
  P: Serialize + DeserializeOwned + 'static,
  R: Serialize + DeserializeOwned + Clone + 'static,
{
  pub fn new(
    builder: Rc<dyn Builder>,
    name: &str,
    mut opts: RoutineOptions<P, R>,
  ) -> Result<Rc<Routine<P, R>>> {
    if opts.on_recv.is_empty() {
      return Err(Error::Unspecified("on_recv"));
    }
    let el = EventLoop::current()?;
    let core = NotifierCore::new("routine", name, &el)?;
    let async_child =
      opts.call_mode == Mode::Async || opts.on_recv.len() > 1;

    // Channels are built before the fork so both processes share the
    // socketpairs; each side later commits to its direction.
    let mut call_chs = Vec::with_capacity(opts.on_recv.len());
    for i in 0..opts.on_recv.len() {
      call_chs.push(Channel::new(
        &format!("{name}.call{i}"),
        ChannelOptions {
          codec: opts.codec,
          read_mode: if async_child { Mode::Async } else { Mode::Sync },
          write_mode: Mode::Async,
        },
      )?);
    }
    let mut ret_chs = Vec::new();
    if opts.return_channel {
      ret_chs.push(Channel::new(
        &format!("{name}.ret0"),
        ChannelOptions {
          codec: opts.codec,
          read_mode: Mode::Async,
          write_mode: if async_child { Mode::Async } else { Mode::Sync },
        },
      )?);
    }

    let child = build_child(
      call_chs.clone(),
      ret_chs.clone(),
      std::mem::take(&mut opts.on_recv),
      opts.max_calls,
      opts.before.take(),
      opts.after.take(),
      async_child,
    );
    let process = Process::new(builder, name, ChildCode::Run(child))?;

    let on_exit = Rc::new(RefCell::new(opts.on_exit.take()));
    {
      let on_exit = Rc::clone(&on_exit);
      process.set_on_exit(Box::new(move |pid, status| {
        let cb = on_exit.borrow_mut().take();
        if let Some(mut cb) = cb {
          cb(pid, status);
          let mut current = on_exit.borrow_mut();
          if current.is_none() {
            *current = Some(cb);
          }
        }
      }));
    }

    Ok(Rc::new(Routine {
      core,
      process: RefCell::new(Some(process)),
      call_chs,
      ret_chs,
      on_return: Rc::new(RefCell::new(opts.on_return.take())),
      on_exit,
      is_running: Cell::new(false),
    }))
  }

  pub fn core(&self) -> &NotifierCore {
    &self.core
  }

  pub fn pid(&self) -> u32 {
    self.process.borrow().as_ref().map_or(0, |p| p.pid())
  }

  pub fn is_running(&self) -> bool {
    self.is_running.get()
  }

  pub fn set_on_return(&self, cb: ReturnHandler<R>) {
    *self.on_return.borrow_mut() = Some(cb);
  }

  pub fn set_on_exit(&self, cb: ExitHandler) {
    *self.on_exit.borrow_mut() = Some(cb);
  }

  /// Forks the worker and opens the parent-side channel ends
  /// (return-read, call-write).
  pub fn start(self: &Rc<Self>) -> Result<()> {
    if self.is_running.get() {
      return Ok(());
    }
    let process = self
      .process
      .borrow()
      .clone()
      .ok_or(Error::Unspecified("process"))?;
    process.start()?;
    self.is_running.set(true);
    for ch in &self.ret_chs {
      let slot = Rc::clone(&self.on_return);
      ch.set_on_recv(Box::new(move |_, (id, rv)| {
        let cb = slot.borrow_mut().take();
        if let Some(mut cb) = cb {
          cb(id, rv);
          let mut current = slot.borrow_mut();
          if current.is_none() {
            *current = Some(cb);
          }
        }
      }));
      ch.start(Dir::Read)?;
    }
    for ch in &self.call_chs {
      ch.start(Dir::Write)?;
    }
    log::debug!("{}worker {} running", self.core.leader(), process.pid());
    Ok(())
  }

  /// SIGTERMs the worker and closes the parent channel ends. Pending
  /// replies are dropped via EOF.
  pub fn stop(&self) {
    if !self.is_running.replace(false) {
      return;
    }
    if let Some(process) = self.process.borrow().as_ref() {
      process.stop();
    }
    for ch in &self.call_chs {
      ch.stop(Dir::Write);
    }
    for ch in &self.ret_chs {
      ch.stop(Dir::Read);
    }
  }

  /// Enqueues a call on the first call channel. A zero `id` is stamped
  /// with a fresh loop-unique one. Returns false (no side effect) when
  /// the routine is not running.
  pub fn call(&self, id: u64, args: P) -> bool {
    self.call_channel(0, id, args)
  }

  pub fn call_channel(&self, i: usize, id: u64, args: P) -> bool {
    if !self.is_running.get() {
      return false;
    }
    let Some(ch) = self.call_chs.get(i) else {
      return false;
    };
    let id = if id == 0 {
      match self.core.event_loop() {
        Ok(el) => el.uuid(),
        Err(e) => {
          log::error!("{}call id: {e}", self.core.leader());
          return false;
        }
      }
    } else {
      id
    };
    ch.send(&(id, args)).is_some()
  }
}

/// The forked child's entrypoint.
fn build_child<P, R>(
  call_chs: Vec<Rc<Channel<CallRecord<P>>>>,
  ret_chs: Vec<Rc<Channel<ReplyRecord<R>>>>,
  handlers: Vec<ComputeHandler<P, R>>,
  max_calls: Option<usize>,
  before: Option<HookFn>,
  after: Option<HookFn>,
  async_child: bool,
) -> Box<dyn FnOnce()>
where
  P: Serialize + DeserializeOwned + 'static,
  R: Serialize + DeserializeOwned + Clone + 'static,
{
  if async_child {
    Box::new(move || {
      child_async(call_chs, ret_chs, handlers, max_calls, before, after)
    })
  } else {
    Box::new(move || child_sync(call_chs, ret_chs, handlers, max_calls))
  }
}

/// Blocking recv → compute → reply loop; no event loop in the child.
fn child_sync<P, R>(
  call_chs: Vec<Rc<Channel<CallRecord<P>>>>,
  ret_chs: Vec<Rc<Channel<ReplyRecord<R>>>>,
  handlers: Vec<ComputeHandler<P, R>>,
  max_calls: Option<usize>,
) where
  P: Serialize + DeserializeOwned + 'static,
  R: Serialize + DeserializeOwned + Clone + 'static,
{
  for ch in &ret_chs {
    if let Err(e) = ch.start(Dir::Write) {
      log::error!("worker return channel: {e}");
      return;
    }
  }
  let call = &call_chs[0];
  if let Err(e) = call.start(Dir::Read) {
    log::error!("worker call channel: {e}");
    return;
  }
  let handler = &handlers[0];
  let mut served = 0usize;
  loop {
    let Some((id, param)) = call.recv() else {
      break;
    };
    match handler(param) {
      Ok(rv) => {
        for ch in &ret_chs {
          ch.send(&(id, rv.clone()));
        }
      }
      Err(e) => log::error!("worker call {id}: {e}"),
    }
    served += 1;
    if max_calls.is_some_and(|m| served >= m) {
      break;
    }
  }
}

/// Nested event loop in the child: async receivers per call channel,
/// SIGTERM → terminate, before/after hooks, final grandchild reap.
fn child_async<P, R>(
  call_chs: Vec<Rc<Channel<CallRecord<P>>>>,
  ret_chs: Vec<Rc<Channel<ReplyRecord<R>>>>,
  handlers: Vec<ComputeHandler<P, R>>,
  max_calls: Option<usize>,
  before: Option<HookFn>,
  after: Option<HookFn>,
) where
  P: Serialize + DeserializeOwned + 'static,
  R: Serialize + DeserializeOwned + Clone + 'static,
{
  let el = match EventLoop::current() {
    Ok(el) => el,
    Err(e) => {
      log::error!("worker loop: {e}");
      return;
    }
  };
  {
    let el_term = Rc::clone(&el);
    let installed = el.watch_signal(
      libc::SIGTERM,
      Rc::new(RefCell::new(move || terminate(&el_term))),
    );
    if let Err(e) = installed {
      log::error!("worker SIGTERM watch: {e}");
    }
  }
  if let Some(before) = before {
    before();
  }
  for ch in &ret_chs {
    if let Err(e) = ch.start(Dir::Write) {
      log::error!("worker return channel: {e}");
      return;
    }
  }
  for i in 0..call_chs.len() {
    let ch = &call_chs[i];
    let handler = Rc::clone(&handlers[i]);
    let rets = ret_chs.clone();
    let remaining = Cell::new(max_calls);
    let el_calls = Rc::clone(&el);
    ch.set_on_recv(Box::new(move |_, (id, param): CallRecord<P>| {
      match handler(param) {
        Ok(rv) => {
          for ret in &rets {
            ret.send(&(id, rv.clone()));
          }
        }
        Err(e) => log::error!("worker call {id}: {e}"),
      }
      if let Some(m) = remaining.get() {
        let left = m.saturating_sub(1);
        remaining.set(Some(left));
        if left == 0 {
          terminate(&el_calls);
        }
      }
    }));
    let el_eof = Rc::clone(&el);
    ch.set_on_eof(Box::new(move |_| terminate(&el_eof)));
    if let Err(e) = ch.start(Dir::Read) {
      log::error!("worker call channel: {e}");
      return;
    }
  }
  el.start();
  if let Some(after) = after {
    after();
  }
  // Grandchildren spawned by the handlers are reaped before exit.
  el.wait_all_children();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::StdBuilder;

  #[test]
  fn constructing_without_a_handler_fails() {
    let builder: Rc<dyn Builder> = Rc::new(StdBuilder::new(false));
    let opts: RoutineOptions<u32, u32> = RoutineOptions::default();
    assert!(matches!(
      Routine::new(builder, "rt-empty", opts),
      Err(Error::Unspecified("on_recv"))
    ));
  }

  #[test]
  fn call_without_start_is_a_no_op() {
    let builder: Rc<dyn Builder> = Rc::new(StdBuilder::new(false));
    let opts = RoutineOptions::<Vec<u32>, u32> {
      on_recv: vec![Rc::new(|args: Vec<u32>| Ok(args.iter().sum()))],
      ..Default::default()
    };
    let rt = Routine::new(builder, "rt-cold", opts).unwrap();
    assert!(!rt.is_running());
    assert!(!rt.call(1, vec![1, 2, 3]));
    assert_eq!(rt.pid(), 0);
  }
}
