// Copyright 2018-2025 the Deno authors. MIT license.

#![cfg(unix)]

use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;

use spindle_runtime::spindle_core::EventLoop;
use spindle_runtime::Builder;
use spindle_runtime::Lock;
use spindle_runtime::Semaphore;
use spindle_runtime::StdBuilder;

#[test]
fn raise_serves_once_and_releases_the_lock() {
  let el = EventLoop::current().unwrap();
  let dir = tempfile::tempdir().unwrap();
  let builder: Rc<dyn Builder> =
    Rc::new(StdBuilder::with_tempdir(dir.path(), false));
  let marker = dir.path().join("served");

  let sem = Semaphore::new(Rc::clone(&builder), "gate", {
    let marker = marker.clone();
    Rc::new(move |_key, _pid| {
      let _ = std::fs::write(&marker, b"x");
    })
  })
  .unwrap();
  sem.start().unwrap();

  let lock_file = dir.path().join("semaphore.gate.lock");
  assert!(sem.raise());
  // Raises while the worker still holds the lock coalesce into no-ops;
  // the worker may also have released already, which is fine too.
  assert!(sem.raise());

  let deadline = Instant::now() + Duration::from_secs(10);
  while !(marker.exists() && !lock_file.exists())
    && Instant::now() < deadline
  {
    el.once_timeout(0.05, || {});
  }
  assert!(marker.exists());
  assert!(!lock_file.exists());

  // Released: the next raise acquires and dispatches again.
  assert!(sem.raise());
  sem.stop();
  builder.lock().reset("semaphore.gate", 0);
}
