// Copyright 2018-2025 the Deno authors. MIT license.

#![cfg(unix)]

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;

use spindle_runtime::spindle_core::EventLoop;
use spindle_runtime::FileWatcher;
use spindle_runtime::FileWatcherOptions;
use spindle_runtime::StatField;

fn drive(el: &Rc<EventLoop>, mut until: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + Duration::from_secs(10);
  while !until() && Instant::now() < deadline {
    el.once_timeout(0.05, || {});
  }
  until()
}

#[test]
fn watches_create_grow_and_unlink() {
  let el = EventLoop::current().unwrap();
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("dummy");
  let watcher = FileWatcher::new(
    "dummy",
    &path,
    FileWatcherOptions {
      interval: 0.5,
      native: false,
    },
  )
  .unwrap();

  let found = Rc::new(Cell::new(0u32));
  let lost = Rc::new(Cell::new(0u32));
  let size = Rc::new(Cell::new(0u64));
  {
    let found = Rc::clone(&found);
    let lost = Rc::clone(&lost);
    watcher.set_on_stat_changed(Box::new(move |old, new| match (old, new) {
      (None, Some(_)) => found.set(found.get() + 1),
      (Some(_), None) => lost.set(lost.get() + 1),
      _ => {}
    }));
  }
  {
    let size = Rc::clone(&size);
    watcher
      .on_field_changed(StatField::Size, Box::new(move |_, new| size.set(new)));
  }

  watcher.start().unwrap();
  el.once();
  assert_eq!(found.get(), 0);

  std::fs::write(&path, b"").unwrap();
  assert!(drive(&el, || found.get() == 1));
  assert_eq!(size.get(), 0);

  std::fs::write(&path, b"abc").unwrap();
  assert!(drive(&el, || size.get() == 3));

  std::fs::remove_file(&path).unwrap();
  assert!(drive(&el, || lost.get() == 1));

  watcher.stop();
}
