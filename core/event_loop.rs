// Copyright 2018-2025 the Deno authors. MIT license.

//! The single-threaded cooperative reactor.
//!
//! One `EventLoop` is active per OS process. It owns the poller, the timer
//! heap, the idle queue, fd readiness watchers, signal attachments and
//! child-exit watchers; notifiers reference it weakly and the loop invokes
//! their callbacks. The current loop is kept in a thread-local slot keyed
//! by the current pid, so the first access after a `fork` observes the pid
//! change and rebuilds the loop from scratch — the parent's watchers are
//! meaningless in the child.
//!
//! User callbacks never unwind across the dispatcher: a panicking callback
//! is logged and swallowed, the loop keeps running.

use std::cell::Cell;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use mio::unix::SourceFd;
use mio::Events;
use mio::Interest;
use mio::Poll;
use mio::Token;
use nix::fcntl::OFlag;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use signal_hook::low_level::pipe as signal_pipe;
use signal_hook::SigId;

use crate::error::is_interrupted;
use crate::error::Error;
use crate::error::Result;

pub type TimerCallback = Rc<RefCell<dyn FnMut()>>;
pub type ReadyCallback = Rc<RefCell<dyn FnMut()>>;
pub type SignalCallback = Rc<RefCell<dyn FnMut()>>;
pub type ChildCallback = Box<dyn FnOnce(u32, i32)>;
pub type IdleCallback = Box<dyn FnOnce()>;
pub type StopCallback = Box<dyn FnOnce(Option<i32>)>;

pub fn timer_callback(f: impl FnMut() + 'static) -> TimerCallback {
  Rc::new(RefCell::new(f))
}

/// Timer arming mode, mirroring `watch_time`'s interval argument.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Schedule {
  /// Fire every `after` seconds.
  Periodic,
  /// `after` is an absolute wall-clock time in epoch seconds; fire once.
  Abs,
  /// Fire once, `after` seconds from now.
  Rel,
  /// Fire once after `after` seconds, then every `interval` seconds.
  Every(f64),
}

struct TimerEntry {
  cb: TimerCallback,
  period: Option<Duration>,
  generation: u64,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
  deadline: Instant,
  // Ties broken FIFO.
  seq: u64,
  id: u64,
  generation: u64,
}

#[derive(Default)]
struct FdWatch {
  read: Option<ReadyCallback>,
  write: Option<ReadyCallback>,
}

impl FdWatch {
  fn interests(&self) -> Option<Interest> {
    let mut interest = None;
    if self.read.is_some() {
      interest = Some(Interest::READABLE);
    }
    if self.write.is_some() {
      interest = Some(match interest {
        Some(i) => i | Interest::WRITABLE,
        None => Interest::WRITABLE,
      });
    }
    interest
  }
}

struct SignalWatch {
  sig_id: SigId,
  rx: OwnedFd,
  // The write end is owned by the registered signal_hook handler (it
  // closes the fd itself on unregister); we only keep the number
  // around for documentation, not to close it a second time here.
  _tx: RawFd,
  attachments: Vec<(u64, SignalCallback)>,
}

struct ChildWatch {
  cb: Option<ChildCallback>,
  status: Rc<Cell<Option<i32>>>,
}

struct Waiter {
  done: Rc<Cell<bool>>,
  status: Rc<Cell<Option<i32>>>,
  cb: Option<StopCallback>,
}

#[derive(Default)]
struct LoopState {
  timers: HashMap<u64, TimerEntry>,
  schedule: BinaryHeap<Reverse<TimerKey>>,
  idle: Vec<(u64, IdleCallback)>,
  fds: HashMap<RawFd, FdWatch>,
  signals: HashMap<i32, SignalWatch>,
  signal_fds: HashMap<RawFd, i32>,
  children: HashMap<u32, ChildWatch>,
  waiters: Vec<Waiter>,
  seq: u64,
  generation: u64,
}

pub struct EventLoop {
  pid: u32,
  uuid: Cell<u64>,
  state: RefCell<LoopState>,
  poll: RefCell<Poll>,
  events: RefCell<Events>,
  sigchld_installed: Cell<bool>,
}

thread_local! {
  static CURRENT: RefCell<Option<Rc<EventLoop>>> = const { RefCell::new(None) };
}

impl EventLoop {
  /// The loop for the current process. After a `fork` the slot still holds
  /// the parent's loop; the pid check discards it and a fresh loop is built
  /// so the child starts with empty watcher state. Fails when the poller
  /// cannot be created; the slot is left untouched so a later call may
  /// retry.
  pub fn current() -> Result<Rc<EventLoop>> {
    CURRENT.with(|slot| {
      let mut slot = slot.borrow_mut();
      if let Some(el) = &*slot {
        if el.pid == std::process::id() {
          return Ok(Rc::clone(el));
        }
      }
      let el = Rc::new(EventLoop::new()?);
      *slot = Some(Rc::clone(&el));
      Ok(el)
    })
  }

  fn new() -> Result<EventLoop> {
    let poll = Poll::new()?;
    Ok(EventLoop {
      pid: std::process::id(),
      uuid: Cell::new(0),
      state: RefCell::new(LoopState::default()),
      poll: RefCell::new(poll),
      events: RefCell::new(Events::with_capacity(256)),
      sigchld_installed: Cell::new(false),
    })
  }

  pub fn pid(&self) -> u32 {
    self.pid
  }

  /// Mints a process-unique, strictly increasing positive id.
  pub fn uuid(&self) -> u64 {
    let n = self.uuid.get() + 1;
    self.uuid.set(n);
    n
  }

  // ---------------------------------------------------------------- timers

  pub fn watch_time(
    &self,
    id: u64,
    cb: TimerCallback,
    after: f64,
    schedule: Schedule,
  ) {
    let now = Instant::now();
    let delay = match schedule {
      Schedule::Abs => {
        let epoch = SystemTime::now()
          .duration_since(SystemTime::UNIX_EPOCH)
          .map(|d| d.as_secs_f64())
          .unwrap_or(0.0);
        Duration::from_secs_f64((after - epoch).max(0.0))
      }
      _ => Duration::from_secs_f64(after.max(0.0)),
    };
    let period = match schedule {
      Schedule::Periodic => Some(Duration::from_secs_f64(after.max(0.0))),
      Schedule::Every(interval) => {
        Some(Duration::from_secs_f64(interval.max(0.0)))
      }
      Schedule::Abs | Schedule::Rel => None,
    };
    let mut st = self.state.borrow_mut();
    st.generation += 1;
    st.seq += 1;
    let generation = st.generation;
    let seq = st.seq;
    st.timers.insert(
      id,
      TimerEntry {
        cb,
        period,
        generation,
      },
    );
    st.schedule.push(Reverse(TimerKey {
      deadline: now + delay,
      seq,
      id,
      generation,
    }));
  }

  /// Cancels the timer and hands back its callback so callers can re-arm
  /// it, the way `Periodical::restart` does.
  pub fn unwatch_time(&self, id: u64) -> Option<TimerCallback> {
    self.state.borrow_mut().timers.remove(&id).map(|e| e.cb)
  }

  pub fn watching_time(&self, id: u64) -> bool {
    self.state.borrow().timers.contains_key(&id)
  }

  // ------------------------------------------------------------------ idle

  /// Schedules `cb` to run after the current batch of events has drained.
  /// The entry is removed before `cb` executes, so it fires exactly once.
  pub fn watch_idle(&self, id: u64, cb: IdleCallback) {
    self.state.borrow_mut().idle.push((id, cb));
  }

  // ------------------------------------------------------------- readiness

  pub fn watch_read_fd(&self, fd: RawFd, cb: ReadyCallback) -> Result<()> {
    self.watch_fd(fd, cb, true)
  }

  pub fn watch_write_fd(&self, fd: RawFd, cb: ReadyCallback) -> Result<()> {
    self.watch_fd(fd, cb, false)
  }

  fn watch_fd(&self, fd: RawFd, cb: ReadyCallback, read: bool) -> Result<()> {
    let previous = {
      let mut st = self.state.borrow_mut();
      let watch = st.fds.entry(fd).or_default();
      let previous = watch.interests();
      if read {
        watch.read = Some(cb);
      } else {
        watch.write = Some(cb);
      }
      previous
    };
    self.update_fd_registration(fd, previous)
  }

  pub fn unwatch_read_fd(&self, fd: RawFd) {
    self.unwatch_fd(fd, true);
  }

  pub fn unwatch_write_fd(&self, fd: RawFd) {
    self.unwatch_fd(fd, false);
  }

  fn unwatch_fd(&self, fd: RawFd, read: bool) {
    let previous = {
      let mut st = self.state.borrow_mut();
      let Some(watch) = st.fds.get_mut(&fd) else {
        return;
      };
      let previous = watch.interests();
      if read {
        watch.read = None;
      } else {
        watch.write = None;
      }
      if watch.interests().is_none() {
        st.fds.remove(&fd);
      }
      previous
    };
    // The fd may already be closed; a failed deregistration is harmless.
    if let Err(e) = self.update_fd_registration(fd, previous) {
      log::debug!("unwatch fd {fd}: {e}");
    }
  }

  pub fn watching_fd(&self, fd: RawFd) -> bool {
    self.state.borrow().fds.contains_key(&fd)
  }

  fn update_fd_registration(
    &self,
    fd: RawFd,
    previous: Option<Interest>,
  ) -> Result<()> {
    let wanted = self.state.borrow().fds.get(&fd).and_then(FdWatch::interests);
    let poll = self.poll.borrow();
    let registry = poll.registry();
    let mut source = SourceFd(&fd);
    match (previous, wanted) {
      (None, Some(interest)) => {
        registry.register(&mut source, Token(fd as usize), interest)?;
      }
      (Some(_), Some(interest)) => {
        registry.reregister(&mut source, Token(fd as usize), interest)?;
      }
      (Some(_), None) => {
        registry.deregister(&mut source)?;
      }
      (None, None) => {}
    }
    Ok(())
  }

  /// The poller reports edges; re-registering an armed fd makes it report
  /// current readiness again on the next poll, which is the level-triggered
  /// contract the stream layer expects.
  fn rearm_fd(&self, fd: RawFd) {
    let wanted = self.state.borrow().fds.get(&fd).and_then(FdWatch::interests);
    if let Some(interest) = wanted {
      let poll = self.poll.borrow();
      let mut source = SourceFd(&fd);
      if let Err(e) =
        poll
          .registry()
          .reregister(&mut source, Token(fd as usize), interest)
      {
        log::debug!("rearm fd {fd}: {e}");
      }
    }
  }

  // --------------------------------------------------------------- signals

  /// Appends `cb` to the signal's attachment list and returns the
  /// attachment id. The OS handler is installed once per signal, on the
  /// first attachment; it only writes a byte to a self-pipe, the
  /// attachments run from the dispatcher on the next tick.
  pub fn watch_signal(&self, signo: i32, cb: SignalCallback) -> Result<u64> {
    let id = self.uuid();
    {
      let mut st = self.state.borrow_mut();
      if let Some(watch) = st.signals.get_mut(&signo) {
        watch.attachments.push((id, cb));
        return Ok(id);
      }
    }
    let (rx, tx) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
    // SAFETY: pipe2 just returned this fd; we are its sole owner.
    let rx: OwnedFd = unsafe { std::os::fd::FromRawFd::from_raw_fd(rx) };
    // `tx` (a bare RawFd) is handed to signal_hook below, which takes
    // ownership of closing it; we must not also wrap it in an OwnedFd.
    let sig_id = signal_pipe::register_raw(signo, tx).map_err(Error::Io)?;
    let rx_fd = rx.as_raw_fd();
    {
      let poll = self.poll.borrow();
      poll.registry().register(
        &mut SourceFd(&rx_fd),
        Token(rx_fd as usize),
        Interest::READABLE,
      )?;
    }
    let mut st = self.state.borrow_mut();
    st.signal_fds.insert(rx_fd, signo);
    st.signals.insert(
      signo,
      SignalWatch {
        sig_id,
        rx,
        _tx: tx,
        attachments: vec![(id, cb)],
      },
    );
    Ok(id)
  }

  /// Removes one attachment by id, or every attachment (and the OS
  /// handler) when `id` is `None`. Attachments are identified by the id
  /// minted at watch time, never by comparing callbacks.
  pub fn unwatch_signal(&self, signo: i32, id: Option<u64>) {
    let teardown = {
      let mut st = self.state.borrow_mut();
      let Some(watch) = st.signals.get_mut(&signo) else {
        return;
      };
      match id {
        Some(id) => {
          watch.attachments.retain(|(aid, _)| *aid != id);
          watch.attachments.is_empty()
        }
        None => true,
      }
    };
    if !teardown {
      return;
    }
    let mut st = self.state.borrow_mut();
    if let Some(watch) = st.signals.remove(&signo) {
      signal_hook::low_level::unregister(watch.sig_id);
      let rx_fd = watch.rx.as_raw_fd();
      st.signal_fds.remove(&rx_fd);
      drop(st);
      let poll = self.poll.borrow();
      if let Err(e) = poll.registry().deregister(&mut SourceFd(&rx_fd)) {
        log::debug!("unwatch signal {signo}: {e}");
      }
    }
  }

  pub fn watching_signal(&self, signo: i32) -> bool {
    self.state.borrow().signals.contains_key(&signo)
  }

  // -------------------------------------------------------------- children

  /// Watches for the child's exit; `cb` receives `(pid, status)` once the
  /// child has been reaped. Reaping is driven by SIGCHLD.
  pub fn watch_child(&self, pid: u32, cb: Option<ChildCallback>) -> Result<()> {
    self.ensure_sigchld_watch()?;
    self.state.borrow_mut().children.insert(
      pid,
      ChildWatch {
        cb,
        status: Rc::new(Cell::new(None)),
      },
    );
    // The child may have exited before the watch was installed, in which
    // case the SIGCHLD already came and went.
    self.reap_children();
    Ok(())
  }

  pub fn watching_child(&self, pid: u32) -> bool {
    self.state.borrow().children.contains_key(&pid)
  }

  /// Blocks until every currently-watched child has exited, in ascending
  /// pid order, then unwatches each.
  pub fn wait_all_children(&self) {
    let mut pids: Vec<u32> =
      self.state.borrow().children.keys().copied().collect();
    pids.sort_unstable();
    self.wait_children(pids);
  }

  /// As [`wait_all_children`](Self::wait_all_children), but `filter`
  /// returns the ordered pid list to wait for.
  pub fn wait_children_filtered(&self, filter: impl FnOnce() -> Vec<u32>) {
    self.wait_children(filter());
  }

  fn wait_children(&self, pids: Vec<u32>) {
    for pid in pids {
      let watch = self.state.borrow_mut().children.remove(&pid);
      let Some(watch) = watch else {
        continue;
      };
      if watch.status.get().is_some() {
        continue;
      }
      match waitpid(Pid::from_raw(pid as i32), None) {
        Ok(status) => {
          if let Some(code) = exit_code(&status) {
            watch.status.set(Some(code));
            if let Some(cb) = watch.cb {
              run_guarded("child", move || cb(pid, code));
            }
          }
        }
        // Already reaped through the SIGCHLD path.
        Err(nix::Error::ECHILD) => {}
        Err(e) => log::warn!("waitpid({pid}): {e}"),
      }
    }
  }

  fn ensure_sigchld_watch(&self) -> Result<()> {
    if self.sigchld_installed.get() {
      return Ok(());
    }
    let el = EventLoop::current()?;
    debug_assert_eq!(el.pid, self.pid);
    let weak = Rc::downgrade(&el);
    self.watch_signal(
      libc::SIGCHLD,
      Rc::new(RefCell::new(move || {
        if let Some(el) = weak.upgrade() {
          el.reap_children();
        }
      })),
    )?;
    self.sigchld_installed.set(true);
    Ok(())
  }

  // Only watched pids are waited on; a `waitpid(-1)` sweep would steal
  // exits belonging to another loop in the same process.
  fn reap_children(&self) {
    let pids: Vec<u32> = self.state.borrow().children.keys().copied().collect();
    for pid in pids {
      loop {
        match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
          Ok(WaitStatus::StillAlive) => break,
          Ok(status) => {
            if let Some(code) = exit_code(&status) {
              self.finish_child(pid, code);
            }
            break;
          }
          Err(nix::Error::EINTR) => {}
          Err(nix::Error::ECHILD) => {
            // Reaped elsewhere; report it gone rather than leaking the
            // watcher.
            log::warn!("child {pid} was reaped outside the loop");
            self.finish_child(pid, 0);
            break;
          }
          Err(e) => {
            log::warn!("waitpid({pid}): {e}");
            break;
          }
        }
      }
    }
  }

  fn finish_child(&self, pid: u32, code: i32) {
    let watch = self.state.borrow_mut().children.remove(&pid);
    if let Some(watch) = watch {
      watch.status.set(Some(code));
      if let Some(cb) = watch.cb {
        run_guarded("child", move || cb(pid, code));
      }
    }
  }

  // ------------------------------------------------------------ start/stop

  /// Blocks driving the loop until a matching [`stop`](Self::stop). Nested
  /// starts stack; each completes at its own stop. Returns the value passed
  /// to `stop`.
  pub fn start(&self) -> Option<i32> {
    let done = Rc::new(Cell::new(false));
    let status = Rc::new(Cell::new(None));
    self.state.borrow_mut().waiters.push(Waiter {
      done: Rc::clone(&done),
      status: Rc::clone(&status),
      cb: None,
    });
    while !done.get() {
      self.turn(None);
    }
    status.take()
  }

  /// As [`start`](Self::start) but returns immediately; `cb` runs (on the
  /// next tick) once the matching `stop` arrives.
  pub fn start_nb(&self, cb: StopCallback) {
    self.state.borrow_mut().waiters.push(Waiter {
      done: Rc::new(Cell::new(false)),
      status: Rc::new(Cell::new(None)),
      cb: Some(cb),
    });
  }

  /// Signals the innermost waiter installed by `start`/`start_nb`.
  pub fn stop(&self, status: Option<i32>) {
    let waiter = self.state.borrow_mut().waiters.pop();
    if let Some(waiter) = waiter {
      waiter.status.set(status);
      waiter.done.set(true);
      if let Some(cb) = waiter.cb {
        self.watch_idle(self.uuid(), Box::new(move || cb(status)));
      }
    }
  }

  /// Polls pending events once: drains whatever is ready right now and
  /// returns without waiting.
  pub fn once(&self) {
    self.turn(Some(Duration::ZERO));
  }

  /// Drives the loop for at most `timeout` seconds; `cb` fires at expiry
  /// through a one-shot timer.
  pub fn once_timeout(&self, timeout: f64, cb: impl FnOnce() + 'static) {
    let id = self.uuid();
    let mut cb = Some(cb);
    self.watch_time(
      id,
      timer_callback(move || {
        if let Some(cb) = cb.take() {
          cb();
        }
      }),
      timeout,
      Schedule::Rel,
    );
    self.turn(Some(Duration::from_secs_f64(timeout.max(0.0))));
  }

  /// One dispatcher pass: poll, fd/signal readiness, due timers, idle
  /// queue. `max_wait` bounds the poll; `None` blocks until an event.
  pub(crate) fn turn(&self, max_wait: Option<Duration>) {
    let timeout = self.poll_timeout(max_wait);
    let mut ready: Vec<(RawFd, bool, bool)> = Vec::new();
    {
      let mut poll = self.poll.borrow_mut();
      let mut events = self.events.borrow_mut();
      match poll.poll(&mut events, timeout) {
        Ok(()) => {}
        Err(ref e) if is_interrupted(e) => {}
        Err(e) => {
          // The dispatcher never aborts the loop; skip this cycle.
          log::error!("poll: {e}");
          return;
        }
      }
      for event in events.iter() {
        let fd = event.token().0 as RawFd;
        let readable =
          event.is_readable() || event.is_read_closed() || event.is_error();
        let writable =
          event.is_writable() || event.is_write_closed() || event.is_error();
        ready.push((fd, readable, writable));
      }
    }
    for (fd, readable, writable) in ready {
      self.dispatch_fd(fd, readable, writable);
    }
    self.run_due_timers();
    self.run_idle();
  }

  fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
    if !self.state.borrow().idle.is_empty() {
      return Some(Duration::ZERO);
    }
    let next = self.next_deadline();
    let until_timer = next.map(|deadline| {
      deadline.saturating_duration_since(Instant::now())
    });
    match (until_timer, max_wait) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (Some(a), None) => Some(a),
      (None, b) => b,
    }
  }

  fn next_deadline(&self) -> Option<Instant> {
    let mut st = self.state.borrow_mut();
    loop {
      let Some(Reverse(key)) = st.schedule.peek() else {
        return None;
      };
      let live = st
        .timers
        .get(&key.id)
        .is_some_and(|e| e.generation == key.generation);
      if live {
        return Some(key.deadline);
      }
      st.schedule.pop();
    }
  }

  fn dispatch_fd(&self, fd: RawFd, readable: bool, writable: bool) {
    let signo = self.state.borrow().signal_fds.get(&fd).copied();
    if let Some(signo) = signo {
      self.dispatch_signal(signo, fd);
      return;
    }
    let (read_cb, write_cb) = {
      let st = self.state.borrow();
      let Some(watch) = st.fds.get(&fd) else {
        return;
      };
      (
        if readable { watch.read.clone() } else { None },
        if writable { watch.write.clone() } else { None },
      )
    };
    if let Some(cb) = read_cb {
      run_callback("read ready", &cb);
    }
    if let Some(cb) = write_cb {
      run_callback("write ready", &cb);
    }
    self.rearm_fd(fd);
  }

  fn dispatch_signal(&self, signo: i32, rx_fd: RawFd) {
    // Drain the self-pipe; multiple deliveries may have coalesced.
    let mut buf = [0u8; 64];
    loop {
      match nix::unistd::read(rx_fd, &mut buf) {
        Ok(0) => break,
        Ok(_) => {}
        Err(nix::Error::EINTR) => {}
        Err(_) => break,
      }
    }
    let attachments: Vec<SignalCallback> = {
      let st = self.state.borrow();
      match st.signals.get(&signo) {
        Some(watch) => {
          watch.attachments.iter().map(|(_, cb)| cb.clone()).collect()
        }
        None => return,
      }
    };
    for cb in attachments {
      run_callback("signal", &cb);
    }
  }

  fn run_due_timers(&self) {
    let now = Instant::now();
    loop {
      let due = {
        let mut st = self.state.borrow_mut();
        let expired = match st.schedule.peek() {
          Some(Reverse(key)) => key.deadline <= now,
          None => false,
        };
        if !expired {
          break;
        }
        let Reverse(key) = st.schedule.pop().unwrap();
        let entry = st
          .timers
          .get(&key.id)
          .filter(|e| e.generation == key.generation)
          .map(|e| (e.cb.clone(), e.period));
        match entry {
          Some((cb, Some(period))) => {
            st.seq += 1;
            let seq = st.seq;
            st.schedule.push(Reverse(TimerKey {
              deadline: now + period,
              seq,
              id: key.id,
              generation: key.generation,
            }));
            Some(cb)
          }
          Some((cb, None)) => {
            st.timers.remove(&key.id);
            Some(cb)
          }
          // Stale heap entry for a cancelled or re-armed timer.
          None => None,
        }
      };
      if let Some(cb) = due {
        run_callback("timer", &cb);
      }
    }
  }

  fn run_idle(&self) {
    let batch = mem::take(&mut self.state.borrow_mut().idle);
    for (_, cb) in batch {
      run_guarded("idle", cb);
    }
  }
}

fn exit_code(status: &WaitStatus) -> Option<i32> {
  match status {
    WaitStatus::Exited(_, code) => Some(*code),
    WaitStatus::Signaled(_, signal, _) => Some(128 + *signal as i32),
    _ => None,
  }
}

/// Runs a shared callback unless it is already on the stack; re-entrant
/// dispatch of the same callback (a timer driving the loop from inside
/// itself) is skipped.
fn run_callback(what: &str, cb: &Rc<RefCell<dyn FnMut()>>) {
  let Ok(mut f) = cb.try_borrow_mut() else {
    log::debug!("skipping re-entrant {what} callback");
    return;
  };
  run_guarded(what, || (*f)());
}

fn run_guarded(what: &str, f: impl FnOnce()) {
  if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
    let msg = payload
      .downcast_ref::<&str>()
      .map(|s| s.to_string())
      .or_else(|| payload.downcast_ref::<String>().cloned())
      .unwrap_or_else(|| "opaque panic payload".to_string());
    log::error!("{what} callback panicked: {msg}");
  }
}
