//! Error types for every component of the shim.
//!
//! Internally everything propagates with `?`. The module-facing surface in
//! [`crate::runtime`] turns these into libc-style sentinels and `errno`.

use thiserror::Error;

use crate::suspend::SyncMode;

/// Failures of the linear memory region.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
  /// An access touched bytes past the end of memory.
  #[error("memory access out of bounds: addr={addr:#x}, len={len}, size={size}")]
  OutOfBounds { addr: u32, len: u32, size: usize },

  /// Growing would exceed the configured page limit.
  #[error("cannot grow memory by {requested} pages: {current} of {max} pages in use")]
  GrowthLimit { requested: u32, current: u32, max: u32 },

  /// No NUL byte was found before the end of memory.
  #[error("unterminated string at {addr:#x}")]
  UnterminatedString { addr: u32 },
}

/// Failures of the block heap.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
  /// The address does not start a live allocation.
  #[error("invalid pointer {0:#x}")]
  InvalidPointer(u32),

  /// The backing memory could not grow far enough.
  #[error("out of memory allocating {requested} bytes")]
  OutOfMemory {
    requested: u64,
    #[source]
    source: MemoryError,
  },

  /// A size computation overflowed the 32-bit address space.
  #[error("allocation size overflow")]
  SizeOverflow,

  /// `malloc` was called before the heap was set up.
  #[error("heap used before post_instantiate")]
  NotInitialized,

  /// Bookkeeping tables disagree with each other.
  #[error("heap bookkeeping inconsistent: {0}")]
  Inconsistent(String),
}

/// Protocol violations and driver failures of the suspension engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuspendError {
  /// The operation is not valid in the current mode.
  #[error("{op}() called in {state:?} state")]
  InvalidState { op: &'static str, state: SyncMode },

  /// The stack is unwound but nothing will ever resume it.
  #[error("unwound with no pending operation to resume it")]
  Stalled,

  /// The entry point returned while still rewinding.
  #[error("rewind returned before reaching its suspension point")]
  RewindIncomplete,

  /// No entry point has been registered for re-entry.
  #[error("no entry point registered")]
  NoEntry,

  /// The control block does not fit in linear memory.
  #[error("cannot write unwind control block: {0}")]
  ControlBlock(#[source] MemoryError),
}

/// Failures reported by storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
  #[error("no such file: {0}")]
  NotFound(String),

  #[error("permission denied: {0}")]
  PermissionDenied(String),

  #[error("no mount for path: {0}")]
  NoMount(String),

  #[error("bad backend handle {0}")]
  BadHandle(u32),

  #[error("backend i/o failure: {0}")]
  Io(String),
}

impl BackendError {
  /// The `errno` value reported to the module for this failure.
  pub fn errno(&self) -> i32 {
    match self {
      BackendError::NotFound(_) | BackendError::NoMount(_) => libc::ENOENT,
      BackendError::PermissionDenied(_) => libc::EACCES,
      BackendError::BadHandle(_) => libc::EBADF,
      BackendError::Io(_) => libc::EIO,
    }
  }
}

/// Failures while expanding a printf-style format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
  /// The argument list ran out before the format did.
  #[error("missing argument for conversion %{0}")]
  MissingArgument(char),

  /// A typed argument does not fit its conversion.
  #[error("argument of wrong type for conversion %{0}")]
  ArgumentType(char),

  /// A width or precision does not fit an `int`.
  #[error("field width or precision too large for conversion %{0}")]
  Overflow(char),

  /// A `va_list` or `%s` pointer reached outside memory.
  #[error(transparent)]
  Memory(#[from] MemoryError),
}

/// An `fopen` mode string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid file mode {0:?}")]
pub struct ModeError(pub String);

/// Invalid runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
  #[error("invalid configuration for '{field}': {message}")]
  InvalidValue { field: String, message: String },

  #[error("failed to parse environment variable '{var}': {message}")]
  EnvParse { var: String, message: String },
}

/// Errors surfaced to the host driving a [`crate::Runtime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
  #[error(transparent)]
  Suspend(#[from] SuspendError),

  #[error(transparent)]
  Memory(#[from] MemoryError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("failed to spawn pending operation: {0}")]
  Spawn(#[from] futures::task::SpawnError),
}
