// Copyright 2018-2025 the Deno authors. MIT license.

//! Tail-follow stream over a regular file.
//!
//! Regular files are always "ready", so the underlying stream is never
//! wired into the poller; reads are driven by a [`FileWatcher`] noticing
//! the file grow. A zero-length read just means "caught up", not EOF.

use std::cell::RefCell;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use nix::unistd::lseek;
use nix::unistd::Whence;
use spindle_core::error::Result;
use spindle_core::notifier::NotifierCore;
use spindle_core::stream::ReadHandler;
use spindle_core::EventLoop;
use spindle_core::HandleFds;
use spindle_core::Stream;
use spindle_core::StreamOptions;

use crate::file_watcher::FileStat;
use crate::file_watcher::FileWatcher;
use crate::file_watcher::FileWatcherOptions;
use crate::file_watcher::StatField;

#[derive(Clone, Copy, Debug)]
pub struct FileStreamOptions {
  /// Growth-poll interval for the backing watcher.
  pub interval: f64,
  /// Start at the beginning of the final (possibly partial) line rather
  /// than at the end of the file.
  pub seek_last: bool,
}

impl Default for FileStreamOptions {
  fn default() -> FileStreamOptions {
    FileStreamOptions {
      interval: 0.5,
      seek_last: false,
    }
  }
}

pub struct FileStream {
  core: NotifierCore,
  path: PathBuf,
  seek_last: bool,
  stream: Rc<Stream>,
  watcher: Rc<FileWatcher>,
  on_initial: RefCell<Option<Box<dyn FnOnce(u64)>>>,
}

impl FileStream {
  pub fn new(
    name: &str,
    path: &Path,
    opts: FileStreamOptions,
  ) -> Result<Rc<FileStream>> {
    let el = EventLoop::current()?;
    let core = NotifierCore::new("filestream", name, &el)?;
    let file = std::fs::File::open(path)?;
    let fd = OwnedFd::from(file);
    let stream = Stream::new(
      name,
      HandleFds::Half {
        rd: Some(fd),
        wr: None,
      },
      StreamOptions {
        tail: true,
        read_all: true,
        ..Default::default()
      },
    )?;
    let watcher = FileWatcher::new(
      name,
      path,
      FileWatcherOptions {
        interval: opts.interval,
        native: false,
      },
    )?;
    Ok(Rc::new(FileStream {
      core,
      path: path.to_path_buf(),
      seek_last: opts.seek_last,
      stream,
      watcher,
      on_initial: RefCell::new(None),
    }))
  }

  pub fn core(&self) -> &NotifierCore {
    &self.core
  }

  pub fn stream(&self) -> &Rc<Stream> {
    &self.stream
  }

  pub fn watcher(&self) -> &Rc<FileWatcher> {
    &self.watcher
  }

  /// Reports the pre-existing size once, before the first read.
  pub fn set_on_initial(&self, cb: Box<dyn FnOnce(u64)>) {
    *self.on_initial.borrow_mut() = Some(cb);
  }

  pub fn set_on_read(&self, cb: ReadHandler) {
    self.stream.set_on_read(cb);
  }

  pub fn start(self: &Rc<Self>) -> Result<()> {
    let size =
      FileStat::capture(&self.path).map_or(0, |stat| stat.size);
    let on_initial = self.on_initial.borrow_mut().take();
    if let Some(cb) = on_initial {
      cb(size);
    }
    let fd = self
      .stream
      .read_fd()
      .ok_or(spindle_core::Error::Unspecified("read handle"))?;
    let pos = if self.seek_last {
      last_line_start(fd, size)?
    } else {
      size
    };
    lseek(fd, pos as i64, Whence::SeekSet)?;
    {
      let stream = Rc::downgrade(&self.stream);
      self.watcher.on_field_changed(
        StatField::Size,
        Box::new(move |_, _| {
          if let Some(stream) = stream.upgrade() {
            stream.do_read();
          }
        }),
      );
    }
    self.watcher.start()?;
    // Pick up anything between the seek position and the current end.
    self.stream.do_read();
    Ok(())
  }

  pub fn stop(&self) {
    self.watcher.stop();
  }
}

/// The offset of the final (possibly partial) line within the trailing
/// window of the file.
fn last_line_start(fd: std::os::fd::RawFd, size: u64) -> Result<u64> {
  let window = size.min(8192);
  let start = size - window;
  lseek(fd, start as i64, Whence::SeekSet)?;
  let mut tail = vec![0u8; window as usize];
  let mut filled = 0;
  while filled < tail.len() {
    match nix::unistd::read(fd, &mut tail[filled..]) {
      Ok(0) => break,
      Ok(n) => filled += n,
      Err(nix::Error::EINTR) => {}
      Err(e) => return Err(e.into()),
    }
  }
  tail.truncate(filled);
  Ok(match tail.iter().rposition(|&b| b == b'\n') {
    Some(i) => start + i as u64 + 1,
    None => start,
  })
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::cell::RefCell;
  use std::io::Write;

  use spindle_core::ReadAction;

  use super::*;

  fn line_collector(
    lines: &Rc<RefCell<Vec<String>>>,
  ) -> ReadHandler {
    let lines = Rc::clone(lines);
    Box::new(move |_, buf, _eof| {
      while let Some(i) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=i).collect();
        lines
          .borrow_mut()
          .push(String::from_utf8_lossy(&line[..line.len() - 1]).into());
      }
      ReadAction::Keep
    })
  }

  #[test]
  fn tail_delivers_appended_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log");
    std::fs::write(&path, b"0123456789_eighteen\n").unwrap();
    let fs = FileStream::new(
      "fs-tail",
      &path,
      FileStreamOptions::default(),
    )
    .unwrap();
    let initial = Rc::new(Cell::new(0u64));
    {
      let initial = Rc::clone(&initial);
      fs.set_on_initial(Box::new(move |size| initial.set(size)));
    }
    let lines = Rc::new(RefCell::new(Vec::new()));
    fs.set_on_read(line_collector(&lines));
    fs.start().unwrap();
    assert_eq!(initial.get(), 20);
    assert!(lines.borrow().is_empty());

    let mut f = std::fs::OpenOptions::new()
      .append(true)
      .open(&path)
      .unwrap();
    f.write_all(b"message\n").unwrap();
    f.flush().unwrap();
    fs.watcher().tick();
    assert_eq!(*lines.borrow(), vec!["message".to_string()]);
  }

  #[test]
  fn seek_last_completes_the_partial_final_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log");
    std::fs::write(&path, b"done\npart").unwrap();
    let fs = FileStream::new(
      "fs-partial",
      &path,
      FileStreamOptions {
        seek_last: true,
        ..Default::default()
      },
    )
    .unwrap();
    let lines = Rc::new(RefCell::new(Vec::new()));
    fs.set_on_read(line_collector(&lines));
    fs.start().unwrap();
    // The partial line is buffered, not delivered.
    assert!(lines.borrow().is_empty());
    assert_eq!(fs.stream().buffered(), 4);

    let mut f = std::fs::OpenOptions::new()
      .append(true)
      .open(&path)
      .unwrap();
    f.write_all(b"ial\n").unwrap();
    f.flush().unwrap();
    fs.watcher().tick();
    assert_eq!(*lines.borrow(), vec!["partial".to_string()]);
  }
}
