//! One module instance's worth of host services, and the driver that
//! keeps the module running across suspensions.
//!
//! ```text
//!   host                         Runtime                          module
//!    │ start() ───────────────────▶ enter() ──────────────────────▶ entry
//!    │                               │          fopen() ◀─────────── │
//!    │                               │  wrap_pending: suspend,       │
//!    │                               │  spawn backend future         │
//!    │                               │          (unwinds) ──────────▶│ returns
//!    │ ◀──────────── Pending ─────── settle(): finish_unwind         │
//!    │ poll() ───────────────────▶ outcome → store_result, resume    │
//!    │                               enter() ──────────────────────▶ entry (rewinding)
//!    │                               │          fopen() ◀─────────── │
//!    │                               │  wrap_pending: take_result ─▶ │ carries on
//!    │ ◀──────────── Finished ────── settle()                        │ returns
//! ```

use std::rc::Rc;

use crate::config::RuntimeConfig;
use crate::error::{BackendError, ConfigError, HeapError, RuntimeError, SuspendError};
use crate::heap::Heap;
use crate::memory::LinearMemory;
use crate::pending::{Completion, EventLoop, Op, Outcome};
use crate::stdio::{Access, Backend, Console, ConsoleWriter, MemoryBackend, Mounts, StreamTable};
use crate::suspend::{CallSite, StackSwitch, Step, Suspend, Suspender, SyncMode};

/// The function names a module may import from `env`.
pub const ENV_IMPORTS: &[&str] = &[
  "malloc",
  "calloc",
  "realloc",
  "reallocarray",
  "free",
  "printf",
  "vprintf",
  "fprintf",
  "vfprintf",
  "sprintf",
  "vsprintf",
  "snprintf",
  "vsnprintf",
  "puts",
  "putchar",
  "fopen",
  "fclose",
  "fread",
  "fwrite",
  "fgetc",
  "getc",
  "getchar",
  "fgets",
  "fputc",
  "putc",
  "fputs",
  "ungetc",
  "fflush",
  "feof",
  "ferror",
  "clearerr",
  "remove",
  "access",
  "async_suspend",
  "async_state",
];

/// Re-entered by the driver to run, and later rewind, the module.
pub type EntryPoint<M, S, F> = Box<dyn FnMut(&mut Runtime<M, S, F>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  /// The entry point returned normally.
  Finished,
  /// The module is suspended on a pending operation.
  Pending,
}

pub struct Runtime<M: LinearMemory, S: StackSwitch, F = ()> {
  pub(crate) config: RuntimeConfig,
  pub(crate) memory: M,
  pub(crate) switch: S,
  pub(crate) heap: Option<Heap>,
  pub(crate) suspender: Suspender<F>,
  pub(crate) events: EventLoop,
  pub(crate) mounts: Mounts,
  pub(crate) streams: StreamTable,
  pub(crate) console: ConsoleWriter,
  entry: Option<EntryPoint<M, S, F>>,
  pub(crate) errno: i32,
  yielded: bool,
}

impl<M: LinearMemory, S: StackSwitch, F> Runtime<M, S, F> {
  pub fn new(
    config: RuntimeConfig,
    mut memory: M,
    switch: S,
  ) -> Result<Self, ConfigError> {
    config.validate()?;

    let pages = memory.pages();
    if pages > config.memory.max_pages {
      return Err(ConfigError::InvalidValue {
        field: "memory.max_pages".into(),
        message: format!("memory already has {pages} pages"),
      });
    }
    if pages < config.memory.initial_pages {
      memory
        .grow(config.memory.initial_pages - pages)
        .map_err(|err| ConfigError::InvalidValue {
          field: "memory.initial_pages".into(),
          message: err.to_string(),
        })?;
    }

    let mut mounts = Mounts::new();
    for mount in &config.mounts {
      let backend = MemoryBackend::new(config.stdio.read_chunk);
      mounts.mount(&mount.path, Rc::new(backend), mount.access);
    }

    tracing::info!(
      pages = memory.pages(),
      mounts = mounts.len(),
      imports = ENV_IMPORTS.len(),
      "runtime created"
    );

    Ok(Self {
      suspender: Suspender::new(&config.suspend),
      config,
      memory,
      switch,
      heap: None,
      events: EventLoop::new(),
      mounts,
      streams: StreamTable::new(),
      console: ConsoleWriter::default(),
      entry: None,
      errno: 0,
      yielded: false,
    })
  }

  pub fn with_console(
    mut self,
    console: impl Console + 'static,
  ) -> Self {
    self.console = ConsoleWriter::new(Box::new(console));
    self
  }

  /// Binds `prefix` to `backend`, replacing any mount already there.
  pub fn mount(
    &mut self,
    prefix: &str,
    backend: Rc<dyn Backend>,
    access: Access,
  ) {
    self.mounts.mount(prefix, backend, access);
  }

  /// Finishes setup once the module is instantiated: the heap begins at
  /// `heap_base`, and `entry` is what the driver calls to run the module.
  pub fn post_instantiate(
    &mut self,
    heap_base: u32,
    entry: impl FnMut(&mut Self) + 'static,
  ) {
    let heap = Heap::new(heap_base).with_max_pages(self.config.memory.max_pages);
    tracing::debug!(heap_base, start = heap.start(), "heap initialized");

    self.heap = Some(heap);
    self.entry = Some(Box::new(entry));
  }

  pub fn config(&self) -> &RuntimeConfig {
    &self.config
  }

  pub fn memory(&self) -> &M {
    &self.memory
  }

  pub fn memory_mut(&mut self) -> &mut M {
    &mut self.memory
  }

  pub fn switch(&self) -> &S {
    &self.switch
  }

  pub fn heap(&self) -> Option<&Heap> {
    self.heap.as_ref()
  }

  pub fn suspender(&self) -> &Suspender<F> {
    &self.suspender
  }

  pub fn events(&self) -> &EventLoop {
    &self.events
  }

  pub fn errno(&self) -> i32 {
    self.errno
  }

  pub fn set_errno(
    &mut self,
    errno: i32,
  ) {
    self.errno = errno;
  }

  /// Runs the module from the top.
  pub fn start(&mut self) -> Result<Status, RuntimeError> {
    let mode = self.suspender.mode();
    if mode != SyncMode::Normal {
      return Err(SuspendError::InvalidState { op: "start", state: mode }.into());
    }

    self.enter()?;
    self.settle()
  }

  /// Makes progress on a suspended module without blocking.
  ///
  /// If the awaited operation has finished, its outcome is stored and the
  /// module is rewound back to where it suspended.
  pub fn poll(&mut self) -> Result<Status, RuntimeError> {
    match self.suspender.mode() {
      SyncMode::Normal => return Ok(Status::Finished),
      SyncMode::Rewinding => return Err(SuspendError::RewindIncomplete.into()),
      SyncMode::Unwinding => {}
    }

    self.events.run_until_stalled();

    if let Some(outcome) = self.events.next_completion() {
      self.suspender.store_result(outcome);
    } else if self.yielded {
      self.yielded = false;
    } else if self.events.in_flight() > 0 {
      return Ok(Status::Pending);
    } else {
      tracing::error!("module is suspended with nothing to resume it");
      return Err(SuspendError::Stalled.into());
    }

    self.suspender.resume(&mut self.switch)?;
    self.enter()?;
    self.settle()
  }

  /// Runs the module to completion, blocking on pending operations.
  pub fn run(&mut self) -> Result<(), RuntimeError> {
    let mut status = self.start()?;

    while status == Status::Pending {
      if !self.yielded && !self.events.has_completions() && self.events.in_flight() > 0 {
        self.events.wait();
      }
      status = self.poll()?;
    }

    Ok(())
  }

  fn enter(&mut self) -> Result<(), SuspendError> {
    let mut entry = self.entry.take().ok_or(SuspendError::NoEntry)?;
    entry(self);
    self.entry.get_or_insert(entry);
    Ok(())
  }

  /// Looks at where the entry point left the engine.
  fn settle(&mut self) -> Result<Status, RuntimeError> {
    match self.suspender.mode() {
      SyncMode::Normal => {
        self.console.flush_all();
        Ok(Status::Finished)
      }
      SyncMode::Rewinding => {
        tracing::error!("entry point returned before its rewind completed");
        Err(SuspendError::RewindIncomplete.into())
      }
      SyncMode::Unwinding => {
        self.suspender.finish_unwind(&mut self.switch);
        self.events.run_until_stalled();

        if self.events.is_idle() && !self.yielded {
          tracing::error!("module unwound with no pending operation");
          return Err(SuspendError::Stalled.into());
        }

        Ok(Status::Pending)
      }
    }
  }

  /// Runs a possibly asynchronous operation from inside a host function.
  ///
  /// Returns `None` when the module is now unwinding; the host function
  /// must return at once, its return value is ignored. On the rewound call
  /// the same host function gets `Some(outcome)`. `start` only runs on the
  /// first call, so side effects must live inside it or after the outcome
  /// arrives.
  pub fn wrap_pending(
    &mut self,
    start: impl FnOnce(&mut Self) -> Op<Completion>,
  ) -> Option<Outcome> {
    match self.suspender.suspend(&mut self.memory, &mut self.switch) {
      Ok(Suspend::Resumed) => Some(
        self
          .suspender
          .take_result()
          .unwrap_or_else(|| Err(BackendError::Io("resumed without a result".into()))),
      ),
      Ok(Suspend::Started) => match start(self) {
        Op::Ready(result) => {
          self.abandon_unwind();
          Some(result)
        }
        Op::Pending(future) => match self.events.spawn(future) {
          Ok(()) => None,
          Err(err) => {
            self.abandon_unwind();
            Some(Err(BackendError::Io(err.to_string())))
          }
        },
      },
      Err(err) => Some(Err(BackendError::Io(err.to_string()))),
    }
  }

  fn abandon_unwind(&mut self) {
    if let Err(err) = self.suspender.cancel(&mut self.switch) {
      tracing::error!(error = %err, "could not cancel suspension");
    }
  }

  /// Saves `locals` and yields to the host; the driver resumes on the
  /// next poll. The rewound call at the same site gets them back.
  pub fn suspend_at(
    &mut self,
    site: CallSite,
    locals: F,
  ) -> Result<Step<F>, SuspendError> {
    let step = self
      .suspender
      .suspend_at(&mut self.memory, &mut self.switch, site, locals)?;

    if matches!(step, Step::Start) {
      self.yielded = true;
    }
    Ok(step)
  }

  pub fn restore(
    &self,
    site: CallSite,
  ) -> Option<&F> {
    self.suspender.restore(site)
  }

  /// `async_suspend()`: the module yields to the host for one poll.
  pub fn async_suspend(&mut self) {
    match self.suspender.suspend(&mut self.memory, &mut self.switch) {
      Ok(Suspend::Started) => self.yielded = true,
      Ok(Suspend::Resumed) => {}
      Err(err) => tracing::error!(error = %err, "async_suspend() failed"),
    }
  }

  /// `async_state()`: 0 normal, 1 unwinding, 2 rewinding.
  pub fn async_state(&self) -> u32 {
    self.suspender.mode().code()
  }

  fn heap_op<T>(
    &mut self,
    op: impl FnOnce(&mut Heap, &mut M) -> Result<T, HeapError>,
  ) -> Result<T, HeapError> {
    let heap = self.heap.as_mut().ok_or(HeapError::NotInitialized)?;
    op(heap, &mut self.memory)
  }

  fn heap_failed(
    &mut self,
    call: &'static str,
    err: HeapError,
  ) -> u32 {
    match err {
      HeapError::InvalidPointer(_) => {
        tracing::warn!(call, error = %err, "invalid pointer");
      }
      _ => {
        tracing::error!(call, error = %err, "allocation failed");
        self.errno = libc::ENOMEM;
      }
    }
    0
  }

  /// `malloc(size)`.
  pub fn malloc(
    &mut self,
    size: u32,
  ) -> u32 {
    match self.heap_op(|heap, memory| heap.try_allocate(memory, size)) {
      Ok(address) => address,
      Err(err) => self.heap_failed("malloc", err),
    }
  }

  /// `calloc(nmemb, size)`: zero-filled, with the product overflow-checked.
  pub fn calloc(
    &mut self,
    nmemb: u32,
    size: u32,
  ) -> u32 {
    let Some(total) = nmemb.checked_mul(size) else {
      return self.heap_failed("calloc", HeapError::SizeOverflow);
    };

    let zeroed = self.heap_op(|heap, memory| {
      let address = heap.try_allocate(memory, total)?;
      if address != 0 {
        memory
          .fill(address, total, 0)
          .map_err(|err| HeapError::Inconsistent(err.to_string()))?;
      }
      Ok(address)
    });

    match zeroed {
      Ok(address) => address,
      Err(err) => self.heap_failed("calloc", err),
    }
  }

  /// `realloc(ptr, size)`. A null `ptr` allocates.
  pub fn realloc(
    &mut self,
    ptr: u32,
    size: u32,
  ) -> u32 {
    if ptr == 0 {
      return self.malloc(size);
    }

    match self.heap_op(|heap, memory| heap.try_reallocate(memory, ptr, size)) {
      Ok(address) => address,
      Err(err) => self.heap_failed("realloc", err),
    }
  }

  /// `reallocarray(ptr, nmemb, size)`.
  pub fn reallocarray(
    &mut self,
    ptr: u32,
    nmemb: u32,
    size: u32,
  ) -> u32 {
    match nmemb.checked_mul(size) {
      Some(total) => self.realloc(ptr, total),
      None => self.heap_failed("reallocarray", HeapError::SizeOverflow),
    }
  }

  /// `free(ptr)`. Null is ignored; unknown pointers are logged.
  pub fn free(
    &mut self,
    ptr: u32,
  ) {
    if ptr == 0 {
      return;
    }

    if let Err(err) = self.heap_op(|heap, _| heap.try_deallocate(ptr)) {
      self.heap_failed("free", err);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::VecMemory;
  use crate::suspend::tests::{RecordingSwitch, SwitchCall};

  type TestRuntime = Runtime<VecMemory, RecordingSwitch>;

  fn runtime() -> TestRuntime {
    let config = RuntimeConfig::default();
    Runtime::new(config, VecMemory::new(2, 16), RecordingSwitch::default()).unwrap()
  }

  #[test]
  fn test_malloc_before_post_instantiate() {
    let mut rt = runtime();

    assert_eq!(rt.malloc(16), 0);
    assert_eq!(rt.errno(), libc::ENOMEM);
  }

  #[test]
  fn test_heap_surface() {
    let mut rt = runtime();
    rt.post_instantiate(1000, |_| {});

    let a = rt.malloc(100);
    assert_eq!(a, 1024);

    rt.memory_mut().fill(a, 100, 0xAA).unwrap();
    rt.free(a);

    let b = rt.calloc(10, 10);
    assert_eq!(b, a);
    assert!(rt.memory().bytes(b, 100).unwrap().iter().all(|&byte| byte == 0));

    let c = rt.realloc(0, 10);
    assert_ne!(c, 0);
    assert_eq!(rt.realloc(c, 0), 0);
    assert!(rt.heap().unwrap().allocation(c).is_none());

    rt.free(0);
    rt.free(12345);
    assert_eq!(rt.errno(), 0);
  }

  #[test]
  fn test_overflowing_products() {
    let mut rt = runtime();
    rt.post_instantiate(0, |_| {});

    assert_eq!(rt.calloc(u32::MAX, 2), 0);
    assert_eq!(rt.errno(), libc::ENOMEM);

    rt.set_errno(0);
    let p = rt.malloc(8);
    assert_eq!(rt.reallocarray(p, 1 << 16, 1 << 16), 0);
    assert_eq!(rt.errno(), libc::ENOMEM);
    assert!(rt.heap().unwrap().allocation(p).is_some());
  }

  #[test]
  fn test_start_without_entry() {
    let mut rt = runtime();

    assert!(matches!(
      rt.start(),
      Err(RuntimeError::Suspend(SuspendError::NoEntry))
    ));
  }

  #[test]
  fn test_module_yield() {
    let mut rt = runtime();
    let mut calls = 0;

    rt.post_instantiate(0, move |rt: &mut TestRuntime| {
      calls += 1;
      rt.async_suspend();
      if rt.async_state() == SyncMode::Unwinding.code() {
        return;
      }
      assert_eq!(calls, 2);
    });

    assert_eq!(rt.start().unwrap(), Status::Pending);
    assert_eq!(rt.async_state(), 1);
    assert_eq!(rt.poll().unwrap(), Status::Finished);
    assert_eq!(
      rt.switch().calls,
      vec![
        SwitchCall::StartUnwind(16),
        SwitchCall::StopUnwind,
        SwitchCall::StartRewind(16),
        SwitchCall::StopRewind,
      ]
    );
  }

  #[test]
  fn test_rewind_that_never_reaches_its_site() {
    let mut rt = runtime();
    let mut first = true;

    rt.post_instantiate(0, move |rt: &mut TestRuntime| {
      if first {
        first = false;
        rt.async_suspend();
      }
    });

    assert_eq!(rt.start().unwrap(), Status::Pending);
    assert!(matches!(
      rt.poll(),
      Err(RuntimeError::Suspend(SuspendError::RewindIncomplete))
    ));
  }

  #[test]
  fn test_unwind_with_nothing_pending_stalls() {
    let mut rt = runtime();

    rt.post_instantiate(0, |rt: &mut TestRuntime| {
      let step = rt.suspender.suspend(&mut rt.memory, &mut rt.switch);
      assert_eq!(step, Ok(Suspend::Started));
    });

    assert!(matches!(
      rt.start(),
      Err(RuntimeError::Suspend(SuspendError::Stalled))
    ));
    assert!(rt.suspender().is_unwound());
    assert!(matches!(
      rt.poll(),
      Err(RuntimeError::Suspend(SuspendError::Stalled))
    ));
  }

  #[test]
  fn test_frame_survives_the_round_trip() {
    let mut rt: Runtime<VecMemory, RecordingSwitch, u32> =
      Runtime::new(RuntimeConfig::default(), VecMemory::new(2, 16), RecordingSwitch::default())
        .unwrap();
    let mut seen = Vec::new();

    rt.post_instantiate(0, move |rt: &mut Runtime<VecMemory, RecordingSwitch, u32>| {
      match rt.suspend_at(crate::call_site!(7), 41).unwrap() {
        Step::Start => {}
        Step::Skip => unreachable!(),
        Step::Return(locals) => {
          seen.push(locals + 1);
          assert_eq!(seen, vec![42]);
        }
      }
    });

    assert_eq!(rt.start().unwrap(), Status::Pending);
    assert_eq!(rt.memory().read_u32(16).unwrap(), 24);
    assert_eq!(rt.memory().read_u32(20).unwrap(), 1024);
    assert_eq!(rt.poll().unwrap(), Status::Finished);
  }

  #[test]
  fn test_ready_operation_skips_the_round_trip() {
    let mut rt = runtime();

    rt.post_instantiate(0, |rt: &mut TestRuntime| {
      let outcome = rt.wrap_pending(|_| Op::ready(Ok(Completion::Written(3))));
      assert_eq!(outcome, Some(Ok(Completion::Written(3))));
    });

    assert_eq!(rt.start().unwrap(), Status::Finished);
    assert_eq!(
      rt.switch().calls,
      vec![SwitchCall::StartUnwind(16), SwitchCall::StopUnwind]
    );
  }

  #[test]
  fn test_memory_checked_against_config() {
    let config = RuntimeConfig::builder().max_pages(4).build().unwrap();
    let err = TestRuntime::new(config, VecMemory::new(8, 16), RecordingSwitch::default())
      .err()
      .unwrap();
    assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "memory.max_pages"));

    let config = RuntimeConfig::builder().initial_pages(3).build().unwrap();
    let rt: TestRuntime = Runtime::new(config, VecMemory::new(1, 16), RecordingSwitch::default()).unwrap();
    assert_eq!(rt.memory().pages(), 3);

    let config = RuntimeConfig::builder().initial_pages(3).build().unwrap();
    let err = TestRuntime::new(config, VecMemory::new(1, 2), RecordingSwitch::default())
      .err()
      .unwrap();
    assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "memory.initial_pages"));
  }

  #[test]
  fn test_heap_stays_within_configured_pages() {
    let config = RuntimeConfig::builder().initial_pages(2).max_pages(2).build().unwrap();
    let mut rt: TestRuntime = Runtime::new(config, VecMemory::new(2, 16), RecordingSwitch::default()).unwrap();
    rt.post_instantiate(1024, |_| {});

    assert_ne!(rt.malloc(1000), 0);
    assert_eq!(rt.malloc(2 * crate::PAGE_SIZE as u32), 0);
    assert_eq!(rt.errno(), libc::ENOMEM);
    assert_eq!(rt.memory().pages(), 2);
  }
}
