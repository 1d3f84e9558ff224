// Copyright 2018-2025 the Deno authors. MIT license.

//! Worker-process notifiers built on `spindle_core`: forked processes,
//! routines with call/return channels, round-robin pools, lock-coalesced
//! semaphores, file watchers and tail-follow file streams.

pub use spindle_core;

pub mod builder;
pub mod file_stream;
pub mod file_watcher;
pub mod pool;
pub mod process;
pub mod routine;
pub mod semaphore;
mod terminate;

pub use builder::Builder;
pub use builder::CmdOptions;
pub use builder::FileLock;
pub use builder::Lock;
pub use builder::StdBuilder;
pub use file_stream::FileStream;
pub use file_stream::FileStreamOptions;
pub use file_watcher::FileStat;
pub use file_watcher::FileWatcher;
pub use file_watcher::FileWatcherOptions;
pub use file_watcher::StatField;
pub use pool::Pool;
pub use process::ChildCode;
pub use process::Process;
pub use routine::Routine;
pub use routine::RoutineOptions;
pub use semaphore::Semaphore;
pub use terminate::terminate;
