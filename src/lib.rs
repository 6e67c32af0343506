//! # wasm-shim - A C Runtime for WebAssembly Modules
//!
//! This crate provides the host side of a small C library for modules
//! compiled to WebAssembly: a **block heap** inside the module's linear
//! memory, buffered **stdio** over pluggable storage, **printf**-family
//! formatting, and an **asyncify-style** suspend/resume engine that lets
//! synchronous C code wait on asynchronous host I/O.
//!
//! ## Overview
//!
//! ```text
//!   ┌────────────────────────── linear memory ──────────────────────────┐
//!   │ 0        16        1024          heap_base                    top │
//!   │ ├────────┼─────────┼─── data ───────┼──┬──┬────┬──┬──────────────┤ │
//!   │ │        │ control │  module        │B0│B1│ B2 │B3│  grows by    │ │
//!   │ │        │  block  │  statics       │  │  │    │  │  whole pages │ │
//!   │ └────────┴─────────┴────────────────┴──┴──┴────┴──┴──────────────┘ │
//!   └───────────────────────────────────────────────────────────────────┘
//!           ▲                                  ▲
//!           │                                  └── Heap: 256-byte blocks
//!           └── Suspender: unwind/rewind state
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   wasm_shim
//!   ├── align      - Rounding macros (units_of!, align_to!)
//!   ├── error      - Error types for every layer
//!   ├── memory     - LinearMemory trait and VecMemory
//!   ├── block      - Heap block and allocation records
//!   ├── heap       - Block allocator (malloc/realloc/free)
//!   ├── suspend    - Asyncify unwind/rewind engine
//!   ├── pending    - Backend operations and the event loop
//!   ├── stdio      - FILE streams, mounts, console, printf entry points
//!   ├── printf     - Format string expansion
//!   ├── config     - RuntimeConfig and its builder
//!   ├── logging    - tracing subscriber setup
//!   └── runtime    - Runtime: host functions and the driver
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wasm_shim::{Runtime, RuntimeConfig, VecMemory};
//!
//! let config = RuntimeConfig::from_env();
//! wasm_shim::logging::init(&config.log);
//!
//! let memory = VecMemory::from_config(&config.memory);
//! let mut rt = Runtime::new(config, memory, switch)?;
//! rt.post_instantiate(heap_base, |rt| call_module_main(rt));
//! rt.run()?;
//! ```
//!
//! ## How Suspension Works
//!
//! A host function that must wait calls [`Runtime::wrap_pending`]. The
//! module's stack is unwound back to the host, the operation runs on the
//! event loop, and once it completes the entry point is called again with
//! the engine rewinding. The rewound call lands on the same host function,
//! which now receives the outcome instead of starting a new operation.
//!
//! ```text
//!   Normal ──suspend──▶ Unwinding ──finish_unwind──▶ (host waits)
//!     ▲                                                   │
//!     │                                                 resume
//!     └────────────── take_result ◀──── Rewinding ◀───────┘
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded**: one module instance per `Runtime`, no `Send`
//! - **No stdin**: reads from stdin always report end of file
//! - **Grow only**: memory handed to the heap is never returned

pub mod align;
pub mod block;
pub mod config;
pub mod error;
pub mod heap;
pub mod logging;
pub mod memory;
pub mod pending;
pub mod printf;
pub mod runtime;
pub mod stdio;
pub mod suspend;

pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use error::{
  BackendError, ConfigError, FormatError, HeapError, MemoryError, ModeError, RuntimeError,
  SuspendError,
};
pub use heap::{Heap, HeapStats};
pub use memory::{LinearMemory, VecMemory};
pub use pending::{Completion, EventLoop, Op, Outcome};
pub use printf::Arg;
pub use runtime::{ENV_IMPORTS, EntryPoint, Runtime, Status};
pub use suspend::{CallSite, StackSwitch, Step, Suspend, Suspender, SyncMode};

/// WebAssembly page size.
pub const PAGE_SIZE: usize = 65536;

/// Heap allocation granule.
pub const BLOCK_SIZE: usize = 256;
