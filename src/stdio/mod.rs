//! Buffered C stdio over pluggable storage backends.
//!
//! ```text
//!   module  ──fopen/fread/fwrite──▶  Runtime  ──▶  StreamTable (FILE* → Stream)
//!                                       │                 │
//!                                       ▼                 ▼
//!                                    Mounts ───────▶  dyn Backend  ──▶  Op::Ready
//!                                  (longest prefix)                     Op::Pending ─▶ EventLoop
//! ```
//!
//! `FILE*` values 1, 2 and 3 are stdin, stdout and stderr; stdout and
//! stderr go to a line-buffered [`Console`]. Opened files count up from 4.
//!
//! Every operation that may wait on a backend is a suspension point. Such
//! a host function runs twice, once to start the operation and once on
//! the rewind to consume its outcome, so it only changes stream state
//! after the outcome is in hand.

mod backend;
mod console;
mod io;
mod mode;
mod mount;
mod print;
mod stream;

pub use backend::{Backend, BackendHandle, MemoryBackend, Metadata};
pub use console::{BufferConsole, Console, ConsoleWriter, StdStream, TracingConsole};
pub use mode::FileMode;
pub use mount::{Access, Mounts, Resolved};
pub use stream::{STDERR, STDIN, STDOUT, Stream, StreamTable};

/// Default stream buffer size.
pub const BUFSIZ: usize = 8192;

pub const EOF: i32 = libc::EOF;
