//! Console output plumbing: line decoding, fan-out to sinks and the sinks themselves.

mod log_sink;
mod multiplexer;
mod rolling;
mod sink;
mod stream;
mod watcher;

pub use log_sink::{DefaultLogDispatcher, ErrorMarkerDispatcher, LogDispatcher, LogSink};
pub use multiplexer::OutputMultiplexer;
pub use rolling::RollingLogBuffer;
pub use sink::{OutputSink, StreamKind};
pub use stream::{ConsoleLineCodec, pump};
pub use watcher::ConsoleMessageWatcher;
