// Copyright 2018-2025 the Deno authors. MIT license.

#![cfg(unix)]

use std::cell::Cell;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use nix::sys::socket::socketpair;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use spindle_core::EventLoop;
use spindle_core::Handle;
use spindle_core::HandleFds;

#[test]
fn read_only_handle_readiness() {
  let el = EventLoop::current().unwrap();
  let (rd, wr) = socketpair(
    AddressFamily::Unix,
    SockType::Stream,
    None,
    SockFlag::SOCK_NONBLOCK,
  )
  .unwrap();

  let handle = Handle::new(
    "readiness",
    HandleFds::Half {
      rd: Some(rd),
      wr: None,
    },
  )
  .unwrap();
  let fired = Rc::new(Cell::new(0u32));
  {
    let fired = Rc::clone(&fired);
    handle.set_on_read_ready(Box::new(move |_| fired.set(fired.get() + 1)));
  }
  handle.set_want_readready(true).unwrap();
  assert!(handle.want_readready());
  assert_eq!(fired.get(), 0);

  nix::unistd::write(wr.as_raw_fd(), b"hello").unwrap();
  el.once();
  assert_eq!(fired.get(), 1);

  // No write fd is installed, so wanting write readiness must fail even
  // with a handler present.
  handle.set_on_write_ready(Box::new(|_| {}));
  assert!(handle.set_want_writeready(true).is_err());

  handle.close();
  assert!(handle.is_closed());
}
