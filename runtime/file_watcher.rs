// Copyright 2018-2025 the Deno authors. MIT license.

//! Watches one path and emits per-field stat-change events.
//!
//! The default mode polls `stat` on a loop timer. On systems with a
//! native filesystem-notification facility the watcher can instead
//! subscribe through the `notify` crate: a watcher on the parent
//! directory catches creations of the target name, and a per-file
//! watcher (established only while the file exists, re-established on
//! re-creation) catches attribute changes, modification, deletion and
//! moves. Both paths funnel into the same delta dispatcher, so a
//! delete-and-recreate between ticks still surfaces as a device/inode
//! change.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc;

use nix::fcntl::OFlag;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use spindle_core::error::Error;
use spindle_core::error::Result;
use spindle_core::event_loop::Schedule;
use spindle_core::notifier::weak_cb;
use spindle_core::notifier::NotifierCore;
use spindle_core::EventLoop;

pub const DEFAULT_INTERVAL: f64 = 2.0;

/// The closed set of observed stat fields. Block size and block count
/// are deliberately excluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatField {
  Device,
  Inode,
  Mode,
  Nlink,
  Uid,
  Gid,
  DeviceId,
  Size,
  Atime,
  Mtime,
  Ctime,
}

pub const STAT_FIELDS: [StatField; 11] = [
  StatField::Device,
  StatField::Inode,
  StatField::Mode,
  StatField::Nlink,
  StatField::Uid,
  StatField::Gid,
  StatField::DeviceId,
  StatField::Size,
  StatField::Atime,
  StatField::Mtime,
  StatField::Ctime,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
  pub device: u64,
  pub inode: u64,
  pub mode: u64,
  pub nlink: u64,
  pub uid: u64,
  pub gid: u64,
  pub device_id: u64,
  pub size: u64,
  pub atime: u64,
  pub mtime: u64,
  pub ctime: u64,
}

impl FileStat {
  pub fn capture(path: &Path) -> Option<FileStat> {
    let md = std::fs::metadata(path).ok()?;
    Some(FileStat {
      device: md.dev(),
      inode: md.ino(),
      mode: md.mode() as u64,
      nlink: md.nlink(),
      uid: md.uid() as u64,
      gid: md.gid() as u64,
      device_id: md.rdev(),
      size: md.len(),
      atime: md.atime() as u64,
      mtime: md.mtime() as u64,
      ctime: md.ctime() as u64,
    })
  }

  pub fn field(&self, field: StatField) -> u64 {
    match field {
      StatField::Device => self.device,
      StatField::Inode => self.inode,
      StatField::Mode => self.mode,
      StatField::Nlink => self.nlink,
      StatField::Uid => self.uid,
      StatField::Gid => self.gid,
      StatField::DeviceId => self.device_id,
      StatField::Size => self.size,
      StatField::Atime => self.atime,
      StatField::Mtime => self.mtime,
      StatField::Ctime => self.ctime,
    }
  }
}

pub type FieldHandler = Box<dyn FnMut(u64, u64)>;
pub type StatHandler =
  Box<dyn FnMut(Option<&FileStat>, Option<&FileStat>)>;

#[derive(Clone, Copy, Debug)]
pub struct FileWatcherOptions {
  pub interval: f64,
  /// Use the native notification facility instead of polling.
  pub native: bool,
}

impl Default for FileWatcherOptions {
  fn default() -> FileWatcherOptions {
    FileWatcherOptions {
      interval: DEFAULT_INTERVAL,
      native: false,
    }
  }
}

struct NativeWatch {
  _dir_watcher: RecommendedWatcher,
  file_watcher: Option<RecommendedWatcher>,
  tx: mpsc::Sender<notify::Result<notify::Event>>,
  rx: mpsc::Receiver<notify::Result<notify::Event>>,
  wake_rd: OwnedFd,
  wake_wr_fd: i32,
  _wake_wr: OwnedFd,
}

impl NativeWatch {
  fn make_watcher(&self) -> notify::Result<RecommendedWatcher> {
    make_watcher(self.tx.clone(), self.wake_wr_fd)
  }
}

fn make_watcher(
  tx: mpsc::Sender<notify::Result<notify::Event>>,
  wake_fd: i32,
) -> notify::Result<RecommendedWatcher> {
  RecommendedWatcher::new(
    move |res: notify::Result<notify::Event>| {
      let _ = tx.send(res);
      // SAFETY: the write end outlives every watcher using it; a full
      // pipe just means a wakeup is already pending.
      unsafe {
        libc::write(wake_fd, b"x".as_ptr() as *const libc::c_void, 1);
      }
    },
    notify::Config::default(),
  )
}

fn watcher_err(path: &Path, err: notify::Error) -> Error {
  Error::WatcherCreateFailed {
    path: path.to_path_buf(),
    message: err.to_string(),
  }
}

pub struct FileWatcher {
  core: NotifierCore,
  path: PathBuf,
  interval: f64,
  native_mode: bool,
  last: RefCell<Option<FileStat>>,
  timer_id: Cell<u64>,
  running: Cell<bool>,
  native: RefCell<Option<NativeWatch>>,
  field_handlers: RefCell<HashMap<StatField, FieldHandler>>,
  on_stat_changed: RefCell<Option<StatHandler>>,
  on_devino_changed: RefCell<Option<StatHandler>>,
}

impl FileWatcher {
  pub fn new(
    name: &str,
    path: &Path,
    opts: FileWatcherOptions,
  ) -> Result<Rc<FileWatcher>> {
    let el = EventLoop::current()?;
    let core = NotifierCore::new("file", name, &el)?;
    Ok(Rc::new(FileWatcher {
      core,
      path: path.to_path_buf(),
      interval: opts.interval,
      native_mode: opts.native,
      last: RefCell::new(None),
      timer_id: Cell::new(0),
      running: Cell::new(false),
      native: RefCell::new(None),
      field_handlers: RefCell::new(HashMap::new()),
      on_stat_changed: RefCell::new(None),
      on_devino_changed: RefCell::new(None),
    }))
  }

  pub fn core(&self) -> &NotifierCore {
    &self.core
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn last_stat(&self) -> Option<FileStat> {
    self.last.borrow().clone()
  }

  pub fn on_field_changed(&self, field: StatField, cb: FieldHandler) {
    self.field_handlers.borrow_mut().insert(field, cb);
  }

  pub fn set_on_stat_changed(&self, cb: StatHandler) {
    *self.on_stat_changed.borrow_mut() = Some(cb);
  }

  pub fn set_on_devino_changed(&self, cb: StatHandler) {
    *self.on_devino_changed.borrow_mut() = Some(cb);
  }

  pub fn start(self: &Rc<Self>) -> Result<()> {
    if self.running.replace(true) {
      return Ok(());
    }
    *self.last.borrow_mut() = FileStat::capture(&self.path);
    if self.native_mode {
      self.start_native()?;
    } else {
      let el = self.core.event_loop()?;
      let id = el.uuid();
      self.timer_id.set(id);
      let weak = Rc::downgrade(self);
      el.watch_time(
        id,
        Rc::new(RefCell::new(move || {
          if let Some(this) = weak.upgrade() {
            this.tick();
          }
        })),
        self.interval,
        Schedule::Periodic,
      );
    }
    Ok(())
  }

  pub fn stop(&self) {
    if !self.running.replace(false) {
      return;
    }
    let el = self.core.try_event_loop();
    if let Some(el) = &el {
      el.unwatch_time(self.timer_id.get());
    }
    if let Some(native) = self.native.borrow_mut().take() {
      if let Some(el) = &el {
        el.unwatch_read_fd(native.wake_rd.as_raw_fd());
      }
    }
  }

  /// One observation: stat the path and dispatch the delta against the
  /// previous observation.
  pub fn tick(self: &Rc<Self>) {
    let new = FileStat::capture(&self.path);
    let old = self.last.replace(new.clone());
    self.dispatch_delta(old.as_ref(), new.as_ref());
  }

  fn dispatch_delta(
    self: &Rc<Self>,
    old: Option<&FileStat>,
    new: Option<&FileStat>,
  ) {
    match (old, new) {
      (Some(_), None) | (None, Some(_)) => {
        self.emit_stat_changed(old, new);
      }
      (Some(o), Some(n)) if o != n => {
        for field in STAT_FIELDS {
          let (a, b) = (o.field(field), n.field(field));
          if a != b {
            let cb = self.field_handlers.borrow_mut().remove(&field);
            if let Some(mut cb) = cb {
              cb(a, b);
              self
                .field_handlers
                .borrow_mut()
                .entry(field)
                .or_insert(cb);
            }
          }
        }
        if o.device != n.device || o.inode != n.inode {
          let cb = self.on_devino_changed.borrow_mut().take();
          if let Some(mut cb) = cb {
            cb(old, new);
            let mut slot = self.on_devino_changed.borrow_mut();
            if slot.is_none() {
              *slot = Some(cb);
            }
          }
        }
        self.emit_stat_changed(old, new);
      }
      _ => {}
    }
  }

  fn emit_stat_changed(
    &self,
    old: Option<&FileStat>,
    new: Option<&FileStat>,
  ) {
    let cb = self.on_stat_changed.borrow_mut().take();
    if let Some(mut cb) = cb {
      cb(old, new);
      let mut slot = self.on_stat_changed.borrow_mut();
      if slot.is_none() {
        *slot = Some(cb);
      }
    }
  }

  // ---------------------------------------------------------- native mode

  fn start_native(self: &Rc<Self>) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let (wake_rd, wake_wr) =
      nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
    // SAFETY: pipe2 just returned these fds; we are their sole owner.
    let wake_rd: OwnedFd = unsafe { std::os::fd::FromRawFd::from_raw_fd(wake_rd) };
    let wake_wr: OwnedFd = unsafe { std::os::fd::FromRawFd::from_raw_fd(wake_wr) };
    let wake_wr_fd = wake_wr.as_raw_fd();
    let mut dir_watcher = make_watcher(tx.clone(), wake_wr_fd)
      .map_err(|e| watcher_err(&self.path, e))?;
    let dir = self.path.parent().unwrap_or(Path::new("."));
    dir_watcher
      .watch(dir, RecursiveMode::NonRecursive)
      .map_err(|e| watcher_err(&self.path, e))?;
    let rd_fd = wake_rd.as_raw_fd();
    *self.native.borrow_mut() = Some(NativeWatch {
      _dir_watcher: dir_watcher,
      file_watcher: None,
      tx,
      rx,
      wake_rd,
      wake_wr_fd,
      _wake_wr: wake_wr,
    });
    self.sync_file_watch();
    let el = self.core.event_loop()?;
    el.watch_read_fd(
      rd_fd,
      weak_cb(self, |this| this.native_tick()),
    )?;
    Ok(())
  }

  fn native_tick(self: &Rc<Self>) {
    let mut relevant = false;
    {
      let native = self.native.borrow();
      let Some(native) = native.as_ref() else {
        return;
      };
      let mut buf = [0u8; 64];
      while nix::unistd::read(native.wake_rd.as_raw_fd(), &mut buf)
        .is_ok_and(|n| n > 0)
      {}
      while let Ok(res) = native.rx.try_recv() {
        match res {
          Ok(event) => {
            if self.event_matches(&event) {
              relevant = true;
            }
          }
          Err(e) => {
            log::warn!("{}watch: {e}", self.core.leader());
          }
        }
      }
    }
    if relevant {
      self.tick();
      self.sync_file_watch();
    }
  }

  fn event_matches(&self, event: &notify::Event) -> bool {
    let name = self.path.file_name();
    event.paths.iter().any(|p| p.file_name() == name)
  }

  /// The per-file watcher exists only while the file does; it is
  /// re-established when the file is (re)created.
  fn sync_file_watch(&self) {
    let exists = self.last.borrow().is_some();
    let mut native = self.native.borrow_mut();
    let Some(native) = native.as_mut() else {
      return;
    };
    if exists && native.file_watcher.is_none() {
      let installed = native.make_watcher().and_then(|mut w| {
        w.watch(&self.path, RecursiveMode::NonRecursive)?;
        Ok(w)
      });
      match installed {
        Ok(w) => native.file_watcher = Some(w),
        Err(e) => {
          self.core.route_error(watcher_err(&self.path, e));
        }
      }
    } else if !exists {
      native.file_watcher = None;
    }
  }
}

impl Drop for FileWatcher {
  fn drop(&mut self) {
    if self.running.get() {
      let el = self.core.try_event_loop();
      if let Some(el) = &el {
        el.unwatch_time(self.timer_id.get());
      }
      if let Some(native) = self.native.borrow_mut().take() {
        if let Some(el) = &el {
          el.unwatch_read_fd(native.wake_rd.as_raw_fd());
        }
      }
    }
  }
}
