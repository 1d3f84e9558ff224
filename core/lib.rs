// Copyright 2018-2025 the Deno authors. MIT license.

//! The concurrency substrate of spindle: a single-threaded cooperative
//! event loop and the notifier types wired into it — promises, timers,
//! fd handles, buffered streams and framed record channels.
//!
//! Worker processes, routines, pools, semaphores and file watchers live
//! in the `spindle_runtime` crate on top of this one.

pub mod channel;
pub mod codec;
pub mod error;
pub mod event_loop;
pub mod handle;
pub mod notifier;
pub mod periodical;
pub mod promise;
pub mod stream;

pub use channel::Channel;
pub use channel::ChannelOptions;
pub use channel::Dir;
pub use channel::Mode;
pub use channel::Received;
pub use codec::Codec;
pub use error::Error;
pub use error::Result;
pub use event_loop::EventLoop;
pub use event_loop::Schedule;
pub use handle::Handle;
pub use handle::HandleFds;
pub use notifier::NotifierCore;
pub use periodical::Periodical;
pub use promise::Outcome;
pub use promise::Promise;
pub use stream::ReadAction;
pub use stream::Stream;
pub use stream::StreamOptions;
