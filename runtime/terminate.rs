// Copyright 2018-2025 the Deno authors. MIT license.

use std::rc::Rc;

use spindle_core::EventLoop;

/// Default shutdown behaviour: removes the QUIT and TERM watchers and
/// stops the loop. Async routine children install this as their SIGTERM
/// handler.
pub fn terminate(el: &Rc<EventLoop>) {
  el.unwatch_signal(libc::SIGQUIT, None);
  el.unwatch_signal(libc::SIGTERM, None);
  el.stop(None);
}
