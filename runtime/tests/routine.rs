// Copyright 2018-2025 the Deno authors. MIT license.

#![cfg(unix)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;

use spindle_runtime::spindle_core::event_loop::timer_callback;
use spindle_runtime::spindle_core::event_loop::Schedule;
use spindle_runtime::spindle_core::EventLoop;
use spindle_runtime::spindle_core::Mode;
use spindle_runtime::Builder;
use spindle_runtime::Routine;
use spindle_runtime::RoutineOptions;
use spindle_runtime::StdBuilder;

fn builder() -> Rc<dyn Builder> {
  Rc::new(StdBuilder::new(false))
}

fn arm_safety_stop(el: &Rc<EventLoop>, secs: f64) {
  let el2 = Rc::clone(el);
  el.watch_time(
    el.uuid(),
    timer_callback(move || el2.stop(None)),
    secs,
    Schedule::Rel,
  );
}

fn sum_options(
  el: &Rc<EventLoop>,
  results: &Rc<RefCell<HashMap<u64, u64>>>,
) -> RoutineOptions<Vec<u64>, u64> {
  let el = Rc::clone(el);
  let results = Rc::clone(results);
  RoutineOptions {
    on_recv: vec![Rc::new(|args: Vec<u64>| Ok(args.iter().sum()))],
    return_channel: true,
    on_return: Some(Box::new(move |id, rv| {
      let mut map = results.borrow_mut();
      map.insert(id, rv);
      let n = map.len();
      drop(map);
      if n == 10 {
        el.stop(None);
      }
    })),
    ..Default::default()
  }
}

fn issue_ten_calls(rt: &Rc<Routine<Vec<u64>, u64>>) {
  for n in 1..=10u64 {
    let args: Vec<u64> = (1..=n).collect();
    let expected: u64 = args.iter().sum();
    assert!(rt.call(expected, args));
  }
}

#[test]
fn sync_worker_collects_ten_sums() {
  let el = EventLoop::current().unwrap();
  let results = Rc::new(RefCell::new(HashMap::new()));
  let rt =
    Routine::new(builder(), "sum-sync", sum_options(&el, &results)).unwrap();
  rt.start().unwrap();
  assert!(rt.is_running());
  issue_ten_calls(&rt);
  arm_safety_stop(&el, 15.0);
  el.start();
  {
    let results = results.borrow();
    assert_eq!(results.len(), 10);
    for (id, rv) in results.iter() {
      assert_eq!(id, rv);
    }
  }
  rt.stop();
  assert!(!rt.is_running());
}

#[test]
fn async_worker_runs_hooks_and_collects_ten_sums() {
  let el = EventLoop::current().unwrap();
  let dir = tempfile::tempdir().unwrap();
  let before_path = dir.path().join("before");
  let after_path = dir.path().join("after");
  let results = Rc::new(RefCell::new(HashMap::new()));
  let mut opts = sum_options(&el, &results);
  opts.call_mode = Mode::Async;
  opts.before = Some({
    let path = before_path.clone();
    Box::new(move || {
      let _ = std::fs::write(&path, b"");
    })
  });
  opts.after = Some({
    let path = after_path.clone();
    Box::new(move || {
      let _ = std::fs::write(&path, b"");
    })
  });
  let rt = Routine::new(builder(), "sum-async", opts).unwrap();
  rt.start().unwrap();
  issue_ten_calls(&rt);
  arm_safety_stop(&el, 15.0);
  el.start();
  {
    let results = results.borrow();
    assert_eq!(results.len(), 10);
    for (id, rv) in results.iter() {
      assert_eq!(id, rv);
    }
  }
  // SIGTERM lets the child leave its loop and run the after hook.
  rt.stop();
  let deadline = Instant::now() + Duration::from_secs(10);
  while !(before_path.exists() && after_path.exists())
    && Instant::now() < deadline
  {
    el.once_timeout(0.05, || {});
  }
  assert!(before_path.exists());
  assert!(after_path.exists());
}

#[test]
fn max_calls_retires_the_worker() {
  let el = EventLoop::current().unwrap();
  let served = Rc::new(RefCell::new(Vec::new()));
  let opts = RoutineOptions::<u64, u64> {
    on_recv: vec![Rc::new(|n: u64| Ok(n + 1))],
    return_channel: true,
    max_calls: Some(2),
    on_return: Some({
      let served = Rc::clone(&served);
      Box::new(move |_id, rv| served.borrow_mut().push(rv))
    }),
    ..Default::default()
  };
  let rt = Routine::new(builder(), "sum-budget", opts).unwrap();
  let exited = Rc::new(std::cell::Cell::new(false));
  {
    let exited = Rc::clone(&exited);
    let el = Rc::clone(&el);
    rt.set_on_exit(Box::new(move |_pid, _status| {
      exited.set(true);
      el.stop(None);
    }));
  }
  rt.start().unwrap();
  for n in 1..=3u64 {
    rt.call(n, n);
  }
  arm_safety_stop(&el, 15.0);
  el.start();
  assert!(exited.get());
  // The exit may be observed before the last reply frame; drain.
  let deadline = Instant::now() + Duration::from_secs(5);
  while served.borrow().len() < 2 && Instant::now() < deadline {
    el.once_timeout(0.05, || {});
  }
  // The worker served its budget of two and exited; the third call was
  // dropped on the floor by the dying worker.
  assert_eq!(served.borrow().len(), 2);
}
