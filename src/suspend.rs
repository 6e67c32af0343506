//! Cooperative suspension over an asyncify-instrumented module.
//!
//! A host function that needs to wait calls [`Suspender::suspend`]. The
//! first time through the engine starts unwinding the module's stack and
//! the host function returns immediately; every instrumented frame above it
//! saves its locals into the unwind-data area and returns too. Once the
//! awaited work completes, [`Suspender::resume`] starts a rewind and the
//! driver re-enters the module, which replays its way back down to the same
//! host function. That second call sees `Rewinding`, stops the rewind and
//! carries on with the stored result.
//!
//! ```text
//!               suspend()                    resume()
//!   Normal ──────────────────▶ Unwinding ──────────────────▶ Rewinding
//!     ▲                           │                             │
//!     │          cancel()         │                             │
//!     ├───────────────────────────┘                             │
//!     │                      suspend() / suspend_at() match     │
//!     └─────────────────────────────────────────────────────────┘
//! ```

use crate::config::SuspendConfig;
use crate::error::SuspendError;
use crate::memory::LinearMemory;
use crate::pending::Outcome;

/// Where the engine is in the suspend/resume cycle.
///
/// The discriminants are what `async_state` reports to the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum SyncMode {
  #[default]
  Normal = 0,
  Unwinding = 1,
  Rewinding = 2,
}

impl SyncMode {
  pub fn code(self) -> u32 {
    self as u32
  }
}

/// The four asyncify primitives exported by an instrumented module.
///
/// Each takes the address of the control block where relevant.
pub trait StackSwitch {
  fn start_unwind(
    &mut self,
    control: u32,
  );

  fn stop_unwind(&mut self);

  fn start_rewind(
    &mut self,
    control: u32,
  );

  fn stop_rewind(&mut self);
}

/// Identifies one suspension point in host code.
///
/// Build these with [`call_site!`](crate::call_site).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
  tag: &'static str,
  index: Option<u32>,
}

impl CallSite {
  pub const fn new(tag: &'static str) -> Self {
    Self { tag, index: None }
  }

  /// Distinguishes repeated suspensions at the same site, e.g. loop
  /// iterations.
  pub const fn with_index(
    self,
    index: u32,
  ) -> Self {
    Self {
      tag: self.tag,
      index: Some(index),
    }
  }

  pub fn tag(&self) -> &'static str {
    self.tag
  }

  pub fn index(&self) -> Option<u32> {
    self.index
  }

  /// A rewinding call at `self` completes a frame stored at `stored`.
  ///
  /// The tags must agree. The index is only compared when this side gives
  /// one.
  fn completes(
    &self,
    stored: &CallSite,
  ) -> bool {
    self.tag == stored.tag && self.index.is_none_or(|index| stored.index == Some(index))
  }
}

/// A [`CallSite`] tagged with the current file and line.
///
/// ```rust
/// use wasm_shim::call_site;
///
/// let site = call_site!();
/// assert_eq!(site.index(), None);
/// assert_ne!(site, call_site!());
/// assert_eq!(call_site!(3).index(), Some(3));
/// ```
#[macro_export]
macro_rules! call_site {
  () => {
    $crate::suspend::CallSite::new(concat!(file!(), ":", line!()))
  };
  ($index:expr) => {
    $crate::suspend::CallSite::new(concat!(file!(), ":", line!())).with_index($index)
  };
}

/// Locals saved by a host function across one suspension.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<F> {
  pub site: CallSite,
  pub locals: F,
}

/// What [`Suspender::suspend`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
  /// The stack is now unwinding; return to the module right away.
  Started,
  /// This is the rewound call; the suspension is over.
  Resumed,
}

/// What [`Suspender::suspend_at`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<F> {
  /// Unwinding has started with the locals stored.
  Start,
  /// Still rewinding towards another call site.
  Skip,
  /// The rewind reached this site; here are the stored locals.
  Return(F),
}

/// The suspension state machine.
///
/// `F` is the locals record host functions save in their frames.
#[derive(Debug)]
pub struct Suspender<F = ()> {
  mode: SyncMode,
  control: u32,
  stack_end: u32,
  unwound: bool,
  frame: Option<Frame<F>>,
  result: Option<Outcome>,
}

impl<F> Suspender<F> {
  pub fn new(config: &SuspendConfig) -> Self {
    Self {
      mode: SyncMode::Normal,
      control: config.control_block,
      stack_end: config.stack_end,
      unwound: false,
      frame: None,
      result: None,
    }
  }

  pub fn mode(&self) -> SyncMode {
    self.mode
  }

  pub fn control_block(&self) -> u32 {
    self.control
  }

  /// The stack has been fully unwound and is waiting for `resume`.
  pub fn is_unwound(&self) -> bool {
    self.unwound
  }

  /// Starts a suspension, or completes the rewind of one.
  pub fn suspend<M: LinearMemory, S: StackSwitch>(
    &mut self,
    memory: &mut M,
    switch: &mut S,
  ) -> Result<Suspend, SuspendError> {
    match self.mode {
      SyncMode::Normal => {
        self.begin_unwind(memory, switch)?;
        Ok(Suspend::Started)
      }
      SyncMode::Rewinding => {
        if let Some(frame) = self.frame.take() {
          tracing::debug!(site = frame.site.tag, "dropping frame of a plain suspension");
        }
        self.complete_rewind(switch);
        Ok(Suspend::Resumed)
      }
      SyncMode::Unwinding => Err(self.invalid("suspend")),
    }
  }

  /// Like [`suspend`](Self::suspend), but saves `locals` for `site`.
  ///
  /// During a rewind only the call whose site matches the stored frame
  /// completes it; any other call gets [`Step::Skip`] and the rewind goes
  /// on.
  pub fn suspend_at<M: LinearMemory, S: StackSwitch>(
    &mut self,
    memory: &mut M,
    switch: &mut S,
    site: CallSite,
    locals: F,
  ) -> Result<Step<F>, SuspendError> {
    match self.mode {
      SyncMode::Normal => {
        self.begin_unwind(memory, switch)?;
        self.frame = Some(Frame { site, locals });
        Ok(Step::Start)
      }
      SyncMode::Rewinding => {
        let matches = self
          .frame
          .as_ref()
          .is_some_and(|frame| site.completes(&frame.site));

        if !matches {
          return Ok(Step::Skip);
        }

        match self.frame.take() {
          Some(frame) => {
            self.complete_rewind(switch);
            Ok(Step::Return(frame.locals))
          }
          None => Ok(Step::Skip),
        }
      }
      SyncMode::Unwinding => Err(self.invalid("suspend_at")),
    }
  }

  /// Peeks at the locals stored for `site` without consuming them.
  pub fn restore(
    &self,
    site: CallSite,
  ) -> Option<&F> {
    self
      .frame
      .as_ref()
      .filter(|frame| site.completes(&frame.site))
      .map(|frame| &frame.locals)
  }

  /// Turns an unwound stack around. The caller re-enters the module next.
  pub fn resume<S: StackSwitch>(
    &mut self,
    switch: &mut S,
  ) -> Result<(), SuspendError> {
    if self.mode != SyncMode::Unwinding {
      return Err(self.invalid("resume"));
    }

    self.mode = SyncMode::Rewinding;
    self.unwound = false;
    switch.start_rewind(self.control);

    tracing::debug!(control = self.control, "rewinding");
    Ok(())
  }

  /// Abandons a suspension whose operation never started.
  ///
  /// Only possible while the module is still on the stack; once the
  /// unwind has finished there is nothing left to return into.
  pub fn cancel<S: StackSwitch>(
    &mut self,
    switch: &mut S,
  ) -> Result<(), SuspendError> {
    if self.mode != SyncMode::Unwinding || self.unwound {
      return Err(self.invalid("cancel"));
    }

    switch.stop_unwind();
    self.mode = SyncMode::Normal;
    self.frame = None;

    tracing::debug!("suspension cancelled");
    Ok(())
  }

  /// Called by the driver once the entry point has returned. Returns
  /// whether an unwind was in progress and has now been stopped.
  pub fn finish_unwind<S: StackSwitch>(
    &mut self,
    switch: &mut S,
  ) -> bool {
    if self.mode != SyncMode::Unwinding || self.unwound {
      return false;
    }

    switch.stop_unwind();
    self.unwound = true;

    tracing::debug!("stack unwound");
    true
  }

  pub fn store_result(
    &mut self,
    outcome: Outcome,
  ) {
    if self.result.replace(outcome).is_some() {
      tracing::warn!("overwriting an unconsumed pending result");
    }
  }

  pub fn take_result(&mut self) -> Option<Outcome> {
    self.result.take()
  }

  pub fn has_result(&self) -> bool {
    self.result.is_some()
  }

  fn begin_unwind<M: LinearMemory, S: StackSwitch>(
    &mut self,
    memory: &mut M,
    switch: &mut S,
  ) -> Result<(), SuspendError> {
    memory
      .write_u32(self.control, self.control + 8)
      .and_then(|()| memory.write_u32(self.control + 4, self.stack_end))
      .map_err(SuspendError::ControlBlock)?;

    self.mode = SyncMode::Unwinding;
    self.unwound = false;
    switch.start_unwind(self.control);

    tracing::debug!(control = self.control, "unwinding");
    Ok(())
  }

  fn complete_rewind<S: StackSwitch>(
    &mut self,
    switch: &mut S,
  ) {
    switch.stop_rewind();
    self.mode = SyncMode::Normal;

    tracing::debug!("rewind complete");
  }

  fn invalid(
    &self,
    op: &'static str,
  ) -> SuspendError {
    tracing::error!(op, state = ?self.mode, "suspension primitive called at an inappropriate time");
    SuspendError::InvalidState {
      op,
      state: self.mode,
    }
  }
}
