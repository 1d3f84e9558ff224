// Copyright 2018-2025 the Deno authors. MIT license.

#![cfg(unix)]

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use spindle_core::EventLoop;

#[test]
fn signal_round_trip() {
  let el = EventLoop::current().unwrap();
  let counter = Rc::new(Cell::new(0u32));
  let id = {
    let counter = Rc::clone(&counter);
    el.watch_signal(
      libc::SIGUSR1,
      Rc::new(RefCell::new(move || counter.set(counter.get() + 1))),
    )
    .unwrap()
  };

  for _ in 0..2 {
    unsafe { libc::raise(libc::SIGUSR1) };
    el.once();
  }
  assert_eq!(counter.get(), 2);

  el.unwatch_signal(libc::SIGUSR1, Some(id));
  unsafe { libc::raise(libc::SIGUSR1) };
  el.once();
  assert_eq!(counter.get(), 2);
}

#[test]
fn unwatching_everything_removes_the_os_handler() {
  let el = EventLoop::current().unwrap();
  let hits = Rc::new(Cell::new(0u32));
  for _ in 0..2 {
    let hits = Rc::clone(&hits);
    el.watch_signal(
      libc::SIGUSR2,
      Rc::new(RefCell::new(move || hits.set(hits.get() + 1))),
    )
    .unwrap();
  }
  assert!(el.watching_signal(libc::SIGUSR2));
  el.unwatch_signal(libc::SIGUSR2, None);
  assert!(!el.watching_signal(libc::SIGUSR2));
  // No attachment left; raising must not count (nor kill the process).
  unsafe { libc::raise(libc::SIGUSR2) };
  el.once();
  assert_eq!(hits.get(), 0);
}
